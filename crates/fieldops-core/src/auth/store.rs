//! Persisted session state.
//!
//! The session lives in a flat string key-value map. Every backend stores
//! the whole map in one unit (memory, one JSON file, one keychain entry),
//! so a patch touching several keys lands as a single replacement and no
//! reader sees a new access token paired with a stale expiry.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt session data: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("Keychain error: {0}")]
    Keychain(#[from] keyring::Error),

    #[error("Session store lock poisoned")]
    Poisoned,
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Keys persisted by the mobile app's local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKey {
    UserToken,
    RefreshToken,
    ExpiresAt,
    IsLoggedIn,
    UserId,
    RoleName,
    UserPin,
    /// Survives teardown; identifies this device to the notification backend.
    DeviceId,
}

impl SessionKey {
    /// Keys removed together when a session is torn down.
    pub const SESSION: [SessionKey; 7] = [
        SessionKey::UserToken,
        SessionKey::RefreshToken,
        SessionKey::ExpiresAt,
        SessionKey::IsLoggedIn,
        SessionKey::UserId,
        SessionKey::RoleName,
        SessionKey::UserPin,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SessionKey::UserToken => "userToken",
            SessionKey::RefreshToken => "refreshToken",
            SessionKey::ExpiresAt => "expiresAt",
            SessionKey::IsLoggedIn => "isLoggedIn",
            SessionKey::UserId => "userId",
            SessionKey::RoleName => "roleName",
            SessionKey::UserPin => "userPin",
            SessionKey::DeviceId => "deviceId",
        }
    }
}

/// Point-in-time view of the stored session.
#[derive(Clone, Default, PartialEq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<String>,
    pub is_logged_in: bool,
    pub user_id: Option<String>,
    pub role_name: Option<String>,
    pub device_id: Option<String>,
}

// Tokens stay out of log output.
impl fmt::Debug for SessionSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSnapshot")
            .field("has_access_token", &self.access_token.is_some())
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .field("is_logged_in", &self.is_logged_in)
            .field("user_id", &self.user_id)
            .field("role_name", &self.role_name)
            .field("device_id", &self.device_id)
            .finish()
    }
}

impl SessionSnapshot {
    fn from_entries(entries: &BTreeMap<String, String>) -> Self {
        let get = |key: SessionKey| entries.get(key.as_str()).cloned();
        Self {
            access_token: get(SessionKey::UserToken),
            refresh_token: get(SessionKey::RefreshToken),
            expires_at: get(SessionKey::ExpiresAt),
            is_logged_in: get(SessionKey::IsLoggedIn).as_deref() == Some("true"),
            user_id: get(SessionKey::UserId),
            role_name: get(SessionKey::RoleName),
            device_id: get(SessionKey::DeviceId),
        }
    }
}

/// Partial update; every `Some` field is written in the same update.
#[derive(Clone, Default)]
pub struct SessionPatch {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<String>,
    pub is_logged_in: Option<bool>,
    pub user_id: Option<String>,
    pub role_name: Option<String>,
    pub user_pin: Option<String>,
    pub device_id: Option<String>,
}

impl SessionPatch {
    fn entries(&self) -> Vec<(SessionKey, String)> {
        let fields = [
            (SessionKey::UserToken, self.access_token.clone()),
            (SessionKey::RefreshToken, self.refresh_token.clone()),
            (SessionKey::ExpiresAt, self.expires_at.clone()),
            (SessionKey::IsLoggedIn, self.is_logged_in.map(|b| b.to_string())),
            (SessionKey::UserId, self.user_id.clone()),
            (SessionKey::RoleName, self.role_name.clone()),
            (SessionKey::UserPin, self.user_pin.clone()),
            (SessionKey::DeviceId, self.device_id.clone()),
        ];
        fields
            .into_iter()
            .filter_map(|(key, value)| value.map(|v| (key, v)))
            .collect()
    }
}

/// Storage for the session the API client reads and mutates.
pub trait SessionStore: Send + Sync {
    fn read(&self) -> StorageResult<SessionSnapshot>;

    /// Apply every field of the patch as one atomic update.
    fn write(&self, patch: SessionPatch) -> StorageResult<()>;

    /// Remove all session keys together. The device id is kept.
    fn clear(&self) -> StorageResult<()>;
}

/// Whole-map persistence used by `KeyValueSessionStore`.
pub trait KeyValueBackend: Send + Sync {
    fn load(&self) -> StorageResult<BTreeMap<String, String>>;
    fn save(&self, entries: &BTreeMap<String, String>) -> StorageResult<()>;
}

pub struct KeyValueSessionStore<B> {
    backend: B,
    // Serializes read-modify-write cycles on the backend.
    lock: Mutex<()>,
}

impl<B: KeyValueBackend> KeyValueSessionStore<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            lock: Mutex::new(()),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}

impl<B: KeyValueBackend> SessionStore for KeyValueSessionStore<B> {
    fn read(&self) -> StorageResult<SessionSnapshot> {
        let _guard = self.lock.lock().map_err(|_| StorageError::Poisoned)?;
        let entries = self.backend.load()?;
        Ok(SessionSnapshot::from_entries(&entries))
    }

    fn write(&self, patch: SessionPatch) -> StorageResult<()> {
        let _guard = self.lock.lock().map_err(|_| StorageError::Poisoned)?;
        let mut entries = self.backend.load()?;
        let updates = patch.entries();
        let keys: Vec<_> = updates.iter().map(|(k, _)| k.as_str()).collect();
        debug!(keys = ?keys, "Writing session keys");
        for (key, value) in updates {
            entries.insert(key.as_str().to_string(), value);
        }
        self.backend.save(&entries)
    }

    fn clear(&self) -> StorageResult<()> {
        let _guard = self.lock.lock().map_err(|_| StorageError::Poisoned)?;
        // Clear succeeds even when the stored map is unreadable.
        let mut entries = self.backend.load().unwrap_or_else(|e| {
            warn!(error = %e, "Session data unreadable, discarding it");
            BTreeMap::new()
        });
        for key in SessionKey::SESSION {
            entries.remove(key.as_str());
        }
        self.backend.save(&entries)
    }
}

pub type MemorySessionStore = KeyValueSessionStore<MemoryBackend>;
pub type FileSessionStore = KeyValueSessionStore<FileBackend>;

impl MemorySessionStore {
    pub fn in_memory() -> Self {
        Self::new(MemoryBackend::default())
    }
}

impl FileSessionStore {
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self::new(FileBackend::new(path))
    }
}

#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryBackend {
    /// Raw key lookup, used to inspect exactly what was persisted.
    pub fn raw(&self, key: SessionKey) -> Option<String> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(key.as_str()).cloned())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueBackend for MemoryBackend {
    fn load(&self) -> StorageResult<BTreeMap<String, String>> {
        Ok(self.entries.lock().map_err(|_| StorageError::Poisoned)?.clone())
    }

    fn save(&self, entries: &BTreeMap<String, String>) -> StorageResult<()> {
        *self.entries.lock().map_err(|_| StorageError::Poisoned)? = entries.clone();
        Ok(())
    }
}

/// Session map stored as a JSON file, replaced via rename on every save.
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyValueBackend for FileBackend {
    fn load(&self) -> StorageResult<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let contents = std::fs::read_to_string(&self.path)?;
        if contents.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_str(&contents)?)
    }

    fn save(&self, entries: &BTreeMap<String, String>) -> StorageResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
