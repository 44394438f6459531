use std::collections::BTreeMap;

use keyring::Entry;
use tracing::debug;

use super::store::{KeyValueBackend, KeyValueSessionStore, StorageResult};

const SERVICE_NAME: &str = "fieldops";

/// Session map kept as a single JSON blob in the OS keychain.
///
/// One entry per account means a multi-key patch is one keychain write.
/// The entry lives in the platform store (macOS Keychain, Windows
/// Credential Manager, Linux kernel keyutils), so a backend reopened for
/// the same account sees what an earlier one saved.
pub struct KeyringBackend {
    entry: Entry,
}

impl KeyringBackend {
    pub fn new(account: &str) -> StorageResult<Self> {
        let entry = Entry::new(SERVICE_NAME, account)?;
        Ok(Self { entry })
    }
}

impl KeyValueBackend for KeyringBackend {
    fn load(&self) -> StorageResult<BTreeMap<String, String>> {
        match self.entry.get_password() {
            Ok(blob) => Ok(serde_json::from_str(&blob)?),
            Err(keyring::Error::NoEntry) => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, entries: &BTreeMap<String, String>) -> StorageResult<()> {
        if entries.is_empty() {
            debug!("Session map empty, removing keychain entry");
            return match self.entry.delete_credential() {
                Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
                Err(e) => Err(e.into()),
            };
        }
        let blob = serde_json::to_string(entries)?;
        self.entry.set_password(&blob)?;
        Ok(())
    }
}

pub type KeyringSessionStore = KeyValueSessionStore<KeyringBackend>;

impl KeyringSessionStore {
    pub fn for_account(account: &str) -> StorageResult<Self> {
        Ok(Self::new(KeyringBackend::new(account)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{SessionPatch, SessionStore};

    #[test]
    #[ignore = "needs an OS keychain"]
    fn test_session_survives_reopening_the_entry() {
        let account = "fieldops-test-reopen";
        let store = KeyringSessionStore::for_account(account).unwrap();
        store
            .write(SessionPatch {
                access_token: Some("kept".into()),
                expires_at: Some("2030-01-01T00:00:00Z".into()),
                ..Default::default()
            })
            .unwrap();

        let reopened = KeyringSessionStore::for_account(account).unwrap();
        let snapshot = reopened.read().unwrap();
        assert_eq!(snapshot.access_token.as_deref(), Some("kept"));
        assert_eq!(snapshot.expires_at.as_deref(), Some("2030-01-01T00:00:00Z"));

        reopened.clear().unwrap();
        assert_eq!(store.read().unwrap().access_token, None);
    }
}
