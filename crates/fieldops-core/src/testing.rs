//! Scripted transport and fixed clock for client tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::sync::Notify;

use crate::api::{HttpRequest, HttpResponse, HttpTransport, TransportError};
use crate::auth::{expiry::parse_expiry, Clock, KeyValueBackend, MemoryBackend, StorageResult};
use crate::config::Config;

pub(crate) const BASE_URL: &str = "https://ops.test/api";
pub(crate) const REFRESH_PATH: &str = "/auth/Auth/RefreshToken";
pub(crate) const LOGOUT_PATH: &str = "/auth/Auth/Logout";
pub(crate) const DEACTIVATE_PATH: &str = "/notification/Device/Deactivate";

pub(crate) fn test_config() -> Config {
    Config {
        base_url: BASE_URL.to_string(),
        ..Config::default()
    }
}

pub(crate) fn fixed_clock(now: &str) -> Clock {
    let now = parse_expiry(now).expect("valid test timestamp");
    Arc::new(move || now)
}

/// Replies are queued per path; unscripted paths answer 404.
#[derive(Default)]
pub(crate) struct FakeTransport {
    replies: Mutex<HashMap<String, VecDeque<Result<HttpResponse, TransportError>>>>,
    requests: Mutex<Vec<HttpRequest>>,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
}

impl FakeTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn reply(&self, path: &str, response: HttpResponse) {
        self.push(path, Ok(response));
    }

    pub(crate) fn fail(&self, path: &str, message: &str) {
        self.push(path, Err(TransportError::Unavailable(message.to_string())));
    }

    /// Hold replies on `path` until the returned notify fires.
    pub(crate) fn gate(&self, path: &str) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.gates
            .lock()
            .unwrap()
            .insert(path.to_string(), Arc::clone(&notify));
        notify
    }

    pub(crate) fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn requests_to(&self, path: &str) -> Vec<HttpRequest> {
        self.requests()
            .into_iter()
            .filter(|r| path_of(&r.url) == path)
            .collect()
    }

    pub(crate) fn paths(&self) -> Vec<String> {
        self.requests().iter().map(|r| path_of(&r.url)).collect()
    }

    fn push(&self, path: &str, reply: Result<HttpResponse, TransportError>) {
        self.replies
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push_back(reply);
    }
}

fn path_of(url: &str) -> String {
    url.strip_prefix(BASE_URL).unwrap_or(url).to_string()
}

impl HttpTransport for FakeTransport {
    fn send<'a>(
        &'a self,
        request: &'a HttpRequest,
    ) -> BoxFuture<'a, Result<HttpResponse, TransportError>> {
        Box::pin(async move {
            let path = path_of(&request.url);
            self.requests.lock().unwrap().push(request.clone());

            let gate = self.gates.lock().unwrap().get(&path).cloned();
            if let Some(gate) = gate {
                gate.notified().await;
            }

            let reply = self
                .replies
                .lock()
                .unwrap()
                .get_mut(&path)
                .and_then(VecDeque::pop_front);
            reply.unwrap_or_else(|| Ok(HttpResponse::text(404, "no route")))
        })
    }
}

/// Memory backend that keeps a copy of every map it was asked to save.
#[derive(Default)]
pub(crate) struct RecordingBackend {
    inner: MemoryBackend,
    saves: Mutex<Vec<BTreeMap<String, String>>>,
}

impl RecordingBackend {
    pub(crate) fn saves(&self) -> Vec<BTreeMap<String, String>> {
        self.saves.lock().unwrap().clone()
    }

    pub(crate) fn forget_saves(&self) {
        self.saves.lock().unwrap().clear();
    }
}

impl KeyValueBackend for RecordingBackend {
    fn load(&self) -> StorageResult<BTreeMap<String, String>> {
        self.inner.load()
    }

    fn save(&self, entries: &BTreeMap<String, String>) -> StorageResult<()> {
        self.saves.lock().unwrap().push(entries.clone());
        self.inner.save(entries)
    }
}
