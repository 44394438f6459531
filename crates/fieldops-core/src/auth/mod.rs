//! Session storage and token expiry.
//!
//! This module provides:
//! - `SessionStore`: the key-value session the API client reads and mutates
//! - `KeyValueSessionStore` over memory, file, or OS keychain backends
//! - Expiry checks against an injectable clock

pub mod credentials;
pub mod expiry;
pub mod store;

pub use credentials::{KeyringBackend, KeyringSessionStore};
pub use expiry::{check_token_expiry, minutes_until_expiry, system_clock, Clock};
pub use store::{
    FileBackend, FileSessionStore, KeyValueBackend, KeyValueSessionStore, MemoryBackend,
    MemorySessionStore, SessionKey, SessionPatch, SessionSnapshot, SessionStore, StorageError,
    StorageResult,
};
