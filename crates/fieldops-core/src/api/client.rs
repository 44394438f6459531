//! API client for the field operations backend.
//!
//! Every authenticated call resolves a usable access token first
//! (refreshing it when the stored expiry has passed), sends the request,
//! and on a `401` refreshes once and replays once. When the session
//! cannot be recovered it is torn down: remote logout and device
//! deactivation are attempted, local session keys are cleared, and the
//! registered invalidation hook runs.

use std::sync::{Arc, Mutex, OnceLock};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::error::truncate_body;
use super::transport::{
    HttpRequest, HttpResponse, HttpTransport, MultipartForm, RequestBody, ReqwestTransport,
    ResponseBody,
};
use super::{ApiError, RefreshError};
use crate::auth::{
    check_token_expiry, system_clock, Clock, MemorySessionStore, SessionPatch, SessionSnapshot,
    SessionStore,
};
use crate::config::Config;

/// Called after a session has been torn down, typically to send the user
/// back to the sign-in screen.
pub type SessionInvalidatedHook = Arc<dyn Fn() + Send + Sync>;

type RefreshFuture = Shared<BoxFuture<'static, Result<String, RefreshError>>>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: Option<String>,
    expires: Option<String>,
    refresh_token: Option<String>,
}

#[derive(Default)]
struct RefreshSlot {
    generation: u64,
    pending: Option<(u64, RefreshFuture)>,
    /// Last refresh generation whose failure already ended the session.
    torn_down: u64,
}

struct ClientInner {
    config: Config,
    transport: Arc<dyn HttpTransport>,
    store: Arc<dyn SessionStore>,
    clock: Clock,
    on_session_invalidated: OnceLock<SessionInvalidatedHook>,
    refresh: Mutex<RefreshSlot>,
}

/// Authenticated API client.
/// Clone is cheap - all clones share the session, transport, and any
/// in-flight refresh.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ClientInner>,
}

pub struct ApiClientBuilder {
    config: Config,
    transport: Option<Arc<dyn HttpTransport>>,
    store: Option<Arc<dyn SessionStore>>,
    clock: Option<Clock>,
    on_session_invalidated: Option<SessionInvalidatedHook>,
}

impl ApiClientBuilder {
    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn on_session_invalidated<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_session_invalidated = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Result<ApiClient, ApiError> {
        let transport: Arc<dyn HttpTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(self.config.request_timeout())?),
        };
        let store: Arc<dyn SessionStore> = match self.store {
            Some(store) => store,
            None => {
                debug!("No session store supplied, using in-memory store");
                Arc::new(MemorySessionStore::in_memory())
            }
        };

        let hook = OnceLock::new();
        if let Some(on_session_invalidated) = self.on_session_invalidated {
            let _ = hook.set(on_session_invalidated);
        }

        Ok(ApiClient {
            inner: Arc::new(ClientInner {
                config: self.config,
                transport,
                store,
                clock: self.clock.unwrap_or_else(system_clock),
                on_session_invalidated: hook,
                refresh: Mutex::new(RefreshSlot::default()),
            }),
        })
    }
}

impl ApiClient {
    pub fn builder(config: Config) -> ApiClientBuilder {
        ApiClientBuilder {
            config,
            transport: None,
            store: None,
            clock: None,
            on_session_invalidated: None,
        }
    }

    /// Create a client over `reqwest` with the given session store
    pub fn new(config: Config, store: Arc<dyn SessionStore>) -> Result<Self, ApiError> {
        Self::builder(config).session_store(store).build()
    }

    /// Register the session-invalidated hook after construction.
    /// Only the first registration takes effect.
    pub fn register_session_invalidated<F>(&self, hook: F) -> bool
    where
        F: Fn() + Send + Sync + 'static,
    {
        let registered = self.inner.on_session_invalidated.set(Arc::new(hook)).is_ok();
        if !registered {
            warn!("Session invalidated hook already registered, ignoring");
        }
        registered
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn session(&self) -> Result<SessionSnapshot, ApiError> {
        Ok(self.inner.store.read()?)
    }

    // ===== Authenticated requests =====

    pub async fn get(&self, path: &str) -> Result<ResponseBody, ApiError> {
        self.authenticated(Method::GET, path, RequestBody::Empty).await
    }

    pub async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<ResponseBody, ApiError> {
        let body = RequestBody::Json(serde_json::to_value(body)?);
        self.authenticated(Method::POST, path, body).await
    }

    pub async fn put<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<ResponseBody, ApiError> {
        let body = RequestBody::Json(serde_json::to_value(body)?);
        self.authenticated(Method::PUT, path, body).await
    }

    pub async fn patch<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<ResponseBody, ApiError> {
        let body = RequestBody::Json(serde_json::to_value(body)?);
        self.authenticated(Method::PATCH, path, body).await
    }

    pub async fn delete(&self, path: &str, body: Option<Value>) -> Result<ResponseBody, ApiError> {
        let body = body.map(RequestBody::Json).unwrap_or(RequestBody::Empty);
        self.authenticated(Method::DELETE, path, body).await
    }

    pub async fn post_multipart(
        &self,
        path: &str,
        form: MultipartForm,
    ) -> Result<ResponseBody, ApiError> {
        self.authenticated(Method::POST, path, RequestBody::Multipart(form))
            .await
    }

    // ===== Unauthenticated requests =====

    pub async fn get_without_auth(&self, path: &str) -> Result<ResponseBody, ApiError> {
        let request = self.inner.request(Method::GET, path, RequestBody::Empty, None);
        let response = self.inner.transport.send(&request).await?;
        into_result(path, response)
    }

    pub async fn post_without_auth<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<ResponseBody, ApiError> {
        let body = RequestBody::Json(serde_json::to_value(body)?);
        let request = self.inner.request(Method::POST, path, body, None);
        let response = self.inner.transport.send(&request).await?;
        into_result(path, response)
    }

    // ===== Session lifecycle =====

    /// Tear down the session. Never fails: remote failures are logged and
    /// local state is always cleared.
    pub async fn logout(&self) {
        self.inner.teardown().await;
    }

    /// Exchange the refresh token for a new access token.
    ///
    /// Concurrent callers share a single refresh. A missing or rejected
    /// refresh token tears the session down; a malformed success response
    /// leaves the stored credentials in place.
    pub async fn refresh_access_token(&self) -> Result<String, ApiError> {
        let (_, refresh) = self.inner.refresh_shared();
        Ok(refresh.await?)
    }

    /// Whether the stored access token must be refreshed before use.
    pub fn check_token_expiry(&self) -> bool {
        match self.inner.store.read() {
            Ok(snapshot) => check_token_expiry(snapshot.expires_at.as_deref(), self.inner.now()),
            Err(e) => {
                warn!(error = %e, "Could not read session, treating token as expired");
                true
            }
        }
    }

    /// Check the session without issuing an API request, refreshing an
    /// expired token. An unrecoverable session is torn down.
    pub async fn validate_session(&self) -> bool {
        let snapshot = match self.inner.store.read() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Could not read session");
                return false;
            }
        };
        if snapshot.access_token.is_none() {
            debug!("No access token stored");
            return false;
        }
        if !check_token_expiry(snapshot.expires_at.as_deref(), self.inner.now()) {
            return true;
        }
        match self.refresh_or_teardown().await {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "Session could not be renewed");
                false
            }
        }
    }

    // ===== Protocol =====

    async fn authenticated(
        &self,
        method: Method,
        path: &str,
        body: RequestBody,
    ) -> Result<ResponseBody, ApiError> {
        let token = self.resolve_access_token().await?;
        let request = self.inner.request(method, path, body, Some(token));

        debug!(method = %request.method, path, "Sending authenticated request");
        let response = self.inner.transport.send(&request).await?;
        if !response.is_unauthorized() {
            return into_result(path, response);
        }

        debug!(path, "Access token rejected, refreshing once");
        let token = self.refresh_or_teardown().await?;
        let retry = HttpRequest {
            bearer: Some(token),
            ..request
        };
        let response = self.inner.transport.send(&retry).await?;
        if response.is_unauthorized() {
            warn!(path, "Still unauthorized after refresh, ending session");
            self.inner.teardown().await;
            return Err(ApiError::SessionExpired);
        }
        into_result(path, response)
    }

    async fn resolve_access_token(&self) -> Result<String, ApiError> {
        let snapshot = self.inner.store.read()?;
        let Some(token) = snapshot.access_token else {
            info!("No access token stored, ending session");
            self.inner.teardown().await;
            return Err(ApiError::NoCredential);
        };

        if !check_token_expiry(snapshot.expires_at.as_deref(), self.inner.now()) {
            return Ok(token);
        }
        debug!(expires_at = ?snapshot.expires_at, "Access token expired, refreshing");
        self.refresh_or_teardown().await
    }

    /// Refresh for an in-progress call. Network failures pass through and
    /// keep the session; every other failure ends it.
    async fn refresh_or_teardown(&self) -> Result<String, ApiError> {
        let (generation, refresh) = self.inner.refresh_shared();
        match refresh.await {
            Ok(token) => Ok(token),
            Err(RefreshError::Network(e)) => Err(ApiError::Network(e)),
            Err(e) => {
                // Waiters on the same failed refresh end the session once.
                if !e.session_cleared() && self.inner.claim_teardown(generation) {
                    self.inner.teardown().await;
                }
                Err(ApiError::SessionExpired)
            }
        }
    }
}

impl ClientInner {
    fn now(&self) -> DateTime<Utc> {
        (*self.clock)()
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        body: RequestBody,
        bearer: Option<String>,
    ) -> HttpRequest {
        HttpRequest {
            method,
            url: self.config.url(path),
            bearer,
            body,
        }
    }

    /// Join the in-flight refresh, or start one.
    fn refresh_shared(self: &Arc<Self>) -> (u64, RefreshFuture) {
        let mut slot = self.refresh.lock().unwrap_or_else(|p| p.into_inner());
        if let Some((generation, pending)) = slot.pending.as_ref() {
            debug!("Joining in-flight token refresh");
            return (*generation, pending.clone());
        }

        slot.generation += 1;
        let generation = slot.generation;
        let inner = Arc::clone(self);
        let refresh = async move {
            let outcome = inner.refresh_once().await;
            inner.finish_refresh(generation);
            outcome
        }
        .boxed()
        .shared();
        slot.pending = Some((generation, refresh.clone()));
        (generation, refresh)
    }

    /// First caller for a failed refresh generation gets to tear down.
    fn claim_teardown(&self, generation: u64) -> bool {
        let mut slot = self.refresh.lock().unwrap_or_else(|p| p.into_inner());
        if slot.torn_down == generation {
            return false;
        }
        slot.torn_down = generation;
        true
    }

    fn finish_refresh(&self, generation: u64) {
        let mut slot = self.refresh.lock().unwrap_or_else(|p| p.into_inner());
        if matches!(slot.pending, Some((g, _)) if g == generation) {
            slot.pending = None;
        }
    }

    async fn refresh_once(&self) -> Result<String, RefreshError> {
        let snapshot = self
            .store
            .read()
            .map_err(|e| RefreshError::Storage(e.to_string()))?;

        let Some(refresh_token) = snapshot.refresh_token.filter(|t| !t.is_empty()) else {
            info!("No refresh token stored, ending session");
            self.teardown().await;
            return Err(RefreshError::MissingRefreshToken);
        };

        let request = self.request(
            Method::POST,
            &self.config.refresh_path,
            RequestBody::Json(json!({ "token": refresh_token })),
            None,
        );
        let response = self
            .transport
            .send(&request)
            .await
            .map_err(RefreshError::Network)?;

        if !response.is_success() {
            warn!(
                status = response.status,
                body = %truncate_body(&response.text_lossy()),
                "Refresh token rejected, ending session"
            );
            self.teardown().await;
            return Err(RefreshError::Rejected(response.status));
        }

        let parsed: RefreshResponse = serde_json::from_slice(&response.body).map_err(|e| {
            warn!(error = %e, "Unreadable refresh response");
            RefreshError::Malformed
        })?;
        let access_token = parsed.access_token.filter(|t| !t.is_empty());
        let (Some(access_token), Some(expires)) = (access_token, parsed.expires) else {
            warn!("Refresh response missing access token or expiry");
            return Err(RefreshError::Malformed);
        };

        // Token and expiry land in one write so they are never observed apart.
        self.store
            .write(SessionPatch {
                access_token: Some(access_token.clone()),
                expires_at: Some(expires),
                refresh_token: parsed.refresh_token.filter(|t| !t.is_empty()),
                ..Default::default()
            })
            .map_err(|e| RefreshError::Storage(e.to_string()))?;

        info!("Access token refreshed");
        Ok(access_token)
    }

    async fn teardown(&self) {
        let snapshot = self.store.read().unwrap_or_else(|e| {
            warn!(error = %e, "Could not read session during logout");
            SessionSnapshot::default()
        });

        if let Some(ref refresh_token) = snapshot.refresh_token {
            let request = self.request(
                Method::POST,
                &self.config.logout_path,
                RequestBody::Json(json!({ "token": refresh_token })),
                snapshot.access_token.clone(),
            );
            self.notify_remote("logout", &request).await;
        }

        match snapshot.device_id {
            Some(ref device_id) => {
                let request = self.request(
                    Method::POST,
                    &self.config.device_deactivate_path,
                    RequestBody::Json(json!({ "deviceId": device_id })),
                    snapshot.access_token.clone(),
                );
                self.notify_remote("device deactivation", &request).await;
            }
            None => debug!("No device id stored, skipping device deactivation"),
        }

        if let Err(e) = self.store.clear() {
            warn!(error = %e, "Failed to clear stored session");
        }

        if let Some(hook) = self.on_session_invalidated.get() {
            (**hook)();
        }
        info!("Session ended");
    }

    async fn notify_remote(&self, call: &str, request: &HttpRequest) {
        match self.transport.send(request).await {
            Ok(response) if response.is_success() => debug!(call, "Remote call succeeded"),
            Ok(response) => warn!(
                call,
                status = response.status,
                body = %truncate_body(&response.text_lossy()),
                "Remote call failed during logout"
            ),
            Err(e) => warn!(call, error = %e, "Remote call failed during logout"),
        }
    }
}

fn into_result(path: &str, response: HttpResponse) -> Result<ResponseBody, ApiError> {
    if response.is_success() {
        return response.parse_body();
    }
    debug!(
        path,
        status = response.status,
        body = %truncate_body(&response.text_lossy()),
        "Request failed"
    );
    let body = response
        .parse_body()
        .unwrap_or_else(|_| ResponseBody::Text(response.text_lossy()));
    Err(ApiError::Http {
        status: response.status,
        body,
    })
}
