//! fieldops - command-line access to the field operations API.
//!
//! Runs authenticated requests with the same session the mobile app
//! uses, refreshing the access token transparently. Useful for checking
//! a collector's session and poking endpoints by hand.

use std::io;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde_json::Value;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fieldops_core::auth::{
    expiry::parse_expiry, minutes_until_expiry, FileSessionStore, KeyringSessionStore,
    MemorySessionStore, SessionPatch, SessionStore,
};
use fieldops_core::{ApiClient, Config, MultipartForm, ResponseBody, SessionBackend};

/// Directory for rolling log files; logs go to stderr when unset
const ENV_LOG_DIR: &str = "FIELDOPS_LOG_DIR";

const USAGE: &str = "\
Usage: fieldops <command> [args]

Commands:
  status                                   Show the stored session
  validate                                 Check the session, refreshing if expired
  get <path>                               Authenticated GET
  post|put|patch <path> <json>             Authenticated request with a JSON body
  delete <path> [json]                     Authenticated DELETE
  upload <path> <file> [field=value ...]   Authenticated multipart POST
  logout                                   End the session
  import-session <access> <refresh> <expires> [device-id]
                                           Store a session obtained elsewhere";

/// Initialize the tracing subscriber for logging
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    match std::env::var(ENV_LOG_DIR) {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "fieldops.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .with(filter)
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(io::stderr))
                .with(filter)
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let _guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprintln!("{}", USAGE);
        return Ok(());
    };

    let config = Config::load().context("Failed to load configuration")?;
    let store = open_store(&config)?;
    let client = ApiClient::new(config, Arc::clone(&store))?;
    client.register_session_invalidated(|| {
        eprintln!("Session ended - sign in again from the app.");
    });
    info!(command = %command, "fieldops starting");

    match (command.as_str(), &args[1..]) {
        ("status", []) => print_status(store.as_ref()),
        ("validate", []) => {
            if client.validate_session().await {
                println!("Session is valid");
                Ok(())
            } else {
                bail!("Session is not valid")
            }
        }
        ("get", [path]) => print_body(
            client
                .get(path)
                .await
                .with_context(|| format!("GET {} failed", path))?,
        ),
        ("post", [path, body]) => print_body(
            client
                .post(path, &parse_json(body)?)
                .await
                .with_context(|| format!("POST {} failed", path))?,
        ),
        ("put", [path, body]) => print_body(
            client
                .put(path, &parse_json(body)?)
                .await
                .with_context(|| format!("PUT {} failed", path))?,
        ),
        ("patch", [path, body]) => print_body(
            client
                .patch(path, &parse_json(body)?)
                .await
                .with_context(|| format!("PATCH {} failed", path))?,
        ),
        ("delete", [path, rest @ ..]) if rest.len() <= 1 => {
            let body = rest.first().map(|b| parse_json(b)).transpose()?;
            print_body(
                client
                    .delete(path, body)
                    .await
                    .with_context(|| format!("DELETE {} failed", path))?,
            )
        }
        ("upload", [path, file, fields @ ..]) => {
            let form = build_form(Path::new(file), fields)?;
            print_body(
                client
                    .post_multipart(path, form)
                    .await
                    .with_context(|| format!("Upload to {} failed", path))?,
            )
        }
        ("logout", []) => {
            client.logout().await;
            println!("Signed out");
            Ok(())
        }
        ("import-session", [access, refresh, expires, device @ ..]) if device.len() <= 1 => {
            import_session(store.as_ref(), access, refresh, expires, device.first())
        }
        _ => {
            eprintln!("{}", USAGE);
            bail!("Unrecognized command: {}", args.join(" "))
        }
    }
}

fn open_store(config: &Config) -> Result<Arc<dyn SessionStore>> {
    let store: Arc<dyn SessionStore> = match config.session_backend {
        SessionBackend::File => Arc::new(FileSessionStore::at_path(config.session_path()?)),
        SessionBackend::Keyring => Arc::new(
            KeyringSessionStore::for_account(&config.keyring_account)
                .context("Failed to open keychain entry")?,
        ),
        SessionBackend::Memory => Arc::new(MemorySessionStore::in_memory()),
    };
    Ok(store)
}

fn parse_json(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).context("Request body must be valid JSON")
}

fn print_body(body: ResponseBody) -> Result<()> {
    match body {
        ResponseBody::Json(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        ResponseBody::Text(text) => println!("{}", text),
    }
    Ok(())
}

fn print_status(store: &dyn SessionStore) -> Result<()> {
    let session = store.read().context("Failed to read session")?;
    let expires = session.expires_at.as_deref();

    println!("Signed in:   {}", session.is_logged_in);
    println!("Access token: {}", presence(&session.access_token));
    println!("Refresh token: {}", presence(&session.refresh_token));
    println!("Expires at:  {}", expires.unwrap_or("-"));
    println!("Remaining:   {}m", minutes_until_expiry(expires, Utc::now()));
    println!(
        "User:        {} ({})",
        session.user_id.as_deref().unwrap_or("-"),
        session.role_name.as_deref().unwrap_or("-")
    );
    println!("Device:      {}", session.device_id.as_deref().unwrap_or("-"));
    Ok(())
}

fn presence(value: &Option<String>) -> &'static str {
    if value.is_some() {
        "present"
    } else {
        "missing"
    }
}

fn build_form(file: &Path, fields: &[String]) -> Result<MultipartForm> {
    let data = std::fs::read(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let file_name = file
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload")
        .to_string();

    let mut form = MultipartForm::new();
    for field in fields {
        let Some((name, value)) = field.split_once('=') else {
            bail!("Form fields must look like name=value, got {:?}", field);
        };
        form = form.text(name, value);
    }
    Ok(form.file("file", file_name, None, data))
}

fn import_session(
    store: &dyn SessionStore,
    access: &str,
    refresh: &str,
    expires: &str,
    device_id: Option<&String>,
) -> Result<()> {
    if parse_expiry(expires).is_none() {
        bail!("Expiry must be an ISO-8601 timestamp, got {:?}", expires);
    }

    let existing = store.read().context("Failed to read session")?;
    let device_id = device_id
        .cloned()
        .or(existing.device_id)
        .unwrap_or_else(generate_device_id);

    store
        .write(SessionPatch {
            access_token: Some(access.to_string()),
            refresh_token: Some(refresh.to_string()),
            expires_at: Some(expires.to_string()),
            is_logged_in: Some(true),
            device_id: Some(device_id.clone()),
            ..Default::default()
        })
        .context("Failed to store session")?;

    println!("Session stored for device {}", device_id);
    Ok(())
}

/// Random 128-bit device identifier, hex encoded
fn generate_device_id() -> String {
    let bytes: [u8; 16] = rand::random();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_device_id_is_hex() {
        let id = generate_device_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_device_id());
    }

    #[test]
    fn test_import_session_keeps_existing_device_id() {
        let store = MemorySessionStore::in_memory();
        store
            .write(SessionPatch {
                device_id: Some("phone-7".into()),
                ..Default::default()
            })
            .unwrap();

        import_session(&store, "a", "r", "2030-01-01T00:00:00Z", None).unwrap();

        let session = store.read().unwrap();
        assert_eq!(session.device_id.as_deref(), Some("phone-7"));
        assert_eq!(session.access_token.as_deref(), Some("a"));
        assert!(session.is_logged_in);
    }

    #[test]
    fn test_import_session_rejects_bad_expiry() {
        let store = MemorySessionStore::in_memory();
        assert!(import_session(&store, "a", "r", "tomorrow", None).is_err());
        assert_eq!(store.read().unwrap().access_token, None);
    }

    #[test]
    fn test_presence_labels() {
        assert_eq!(presence(&Some("token".into())), "present");
        assert_eq!(presence(&None), "missing");
    }

    #[test]
    fn test_build_form_rejects_malformed_field() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("meter.jpg");
        std::fs::write(&file, [1u8, 2, 3]).unwrap();

        assert_eq!(build_form(&file, &["taskId=42".to_string()]).unwrap().len(), 2);
        assert!(build_form(&file, &["taskId".to_string()]).is_err());
    }
}
