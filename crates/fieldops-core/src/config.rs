//! Client configuration management.
//!
//! This module handles loading and saving the client configuration: the
//! backend base URL, the auth endpoint paths, request timeout, and where
//! the session is persisted.
//!
//! Configuration is stored at `~/.config/fieldops/config.json`; a handful
//! of `FIELDOPS_*` environment variables override the file.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "fieldops";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Session file name in cache directory
const SESSION_FILE: &str = "session.json";

/// HTTP request timeout in seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

const ENV_BASE_URL: &str = "FIELDOPS_BASE_URL";
const ENV_SESSION_BACKEND: &str = "FIELDOPS_SESSION_BACKEND";
const ENV_TIMEOUT_SECS: &str = "FIELDOPS_TIMEOUT_SECS";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "lowercase")]
pub enum SessionBackend {
    #[default]
    File,
    Keyring,
    Memory,
}

impl FromStr for SessionBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(SessionBackend::File),
            "keyring" => Ok(SessionBackend::Keyring),
            "memory" => Ok(SessionBackend::Memory),
            other => Err(anyhow::anyhow!("Unknown session backend: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(default)]
pub struct Config {
    pub base_url: String,
    pub refresh_path: String,
    pub logout_path: String,
    pub device_deactivate_path: String,
    pub request_timeout_secs: u64,
    pub session_backend: SessionBackend,
    /// Keychain account name when `session_backend` is `keyring`
    pub keyring_account: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api".to_string(),
            refresh_path: "/auth/Auth/RefreshToken".to_string(),
            logout_path: "/auth/Auth/Logout".to_string(),
            device_deactivate_path: "/notification/Device/Deactivate".to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            session_backend: SessionBackend::File,
            keyring_account: "default".to_string(),
        }
    }
}

impl Config {
    /// Load from the user config file (defaults if absent), then apply
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply `FIELDOPS_*` overrides from the given lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(base_url) = lookup(ENV_BASE_URL) {
            self.base_url = base_url;
        }
        if let Some(backend) = lookup(ENV_SESSION_BACKEND) {
            self.session_backend = backend.parse()?;
        }
        if let Some(timeout) = lookup(ENV_TIMEOUT_SECS) {
            self.request_timeout_secs = timeout
                .trim()
                .parse()
                .with_context(|| format!("{} must be a number of seconds", ENV_TIMEOUT_SECS))?;
        }
        Ok(())
    }

    /// Join the base URL and an API path with exactly one slash.
    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn session_path(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME).join(SESSION_FILE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_url_joins_with_single_slash() {
        let config = Config {
            base_url: "https://ops.example.com/api/".into(),
            ..Config::default()
        };
        assert_eq!(config.url("/tasks"), "https://ops.example.com/api/tasks");
        assert_eq!(config.url("tasks/7"), "https://ops.example.com/api/tasks/7");
    }

    #[test]
    fn test_overrides_apply() {
        let mut config = Config::default();
        config
            .apply_overrides(lookup(&[
                ("FIELDOPS_BASE_URL", "https://staging.example.com"),
                ("FIELDOPS_SESSION_BACKEND", "Keyring"),
                ("FIELDOPS_TIMEOUT_SECS", " 5 "),
            ]))
            .unwrap();
        assert_eq!(config.base_url, "https://staging.example.com");
        assert_eq!(config.session_backend, SessionBackend::Keyring);
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_bad_override_is_error() {
        let mut config = Config::default();
        assert!(config
            .apply_overrides(lookup(&[("FIELDOPS_SESSION_BACKEND", "sqlite")]))
            .is_err());
        assert!(config
            .apply_overrides(lookup(&[("FIELDOPS_TIMEOUT_SECS", "soon")]))
            .is_err());
    }

    #[test]
    fn test_load_from_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(config.request_timeout_secs, 30);
        assert_eq!(config.session_backend, SessionBackend::File);
    }

    #[test]
    fn test_load_from_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"base_url": "https://ops.example.com", "session_backend": "memory"}"#,
        )
        .unwrap();
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.base_url, "https://ops.example.com");
        assert_eq!(config.session_backend, SessionBackend::Memory);
        assert_eq!(config.logout_path, "/auth/Auth/Logout");
    }
}
