use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};

/// Source of "now" for expiry decisions.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// Parse a stored expiry timestamp.
///
/// Accepts RFC 3339 and offset-less ISO-8601 (read as UTC).
pub fn parse_expiry(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Whether a token with the given expiry must be refreshed before use.
///
/// A missing or unreadable expiry counts as expired. A token is expired
/// from its expiry instant onwards (`now >= expiry`).
pub fn check_token_expiry(expires_at: Option<&str>, now: DateTime<Utc>) -> bool {
    match expires_at.and_then(parse_expiry) {
        Some(expiry) => now >= expiry,
        None => true,
    }
}

pub fn time_until_expiry(expires_at: Option<&str>, now: DateTime<Utc>) -> Option<Duration> {
    expires_at.and_then(parse_expiry).map(|expiry| expiry - now)
}

/// Get minutes remaining until expiry (for display)
pub fn minutes_until_expiry(expires_at: Option<&str>, now: DateTime<Utc>) -> i64 {
    time_until_expiry(expires_at, now)
        .map(|d| d.num_minutes().max(0))
        .unwrap_or(0)
}
