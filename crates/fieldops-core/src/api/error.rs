use std::sync::Arc;

use thiserror::Error;

use super::transport::ResponseBody;
use crate::auth::StorageError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("No access token stored - please sign in")]
    NoCredential,

    #[error("Token refresh failed: {0}")]
    RefreshFailed(#[from] RefreshError),

    #[error("Session expired - please sign in again")]
    SessionExpired,

    #[error("Request failed with status {status}")]
    Http { status: u16, body: ResponseBody },

    #[error("Network error: {0}")]
    Network(#[from] TransportError),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Failed to serialize request body: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Session storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Why a refresh did not produce a new access token.
///
/// `Clone` because a single in-flight refresh is awaited by every caller
/// that needed it.
#[derive(Error, Debug, Clone)]
pub enum RefreshError {
    #[error("no refresh token stored")]
    MissingRefreshToken,

    #[error("refresh endpoint rejected the token with status {0}")]
    Rejected(u16),

    #[error("refresh response did not contain a usable access token")]
    Malformed,

    #[error(transparent)]
    Network(TransportError),

    #[error("session storage error: {0}")]
    Storage(String),
}

impl RefreshError {
    /// Whether the refresh path already tore the session down.
    pub fn session_cleared(&self) -> bool {
        matches!(self, RefreshError::MissingRefreshToken | RefreshError::Rejected(_))
    }
}

#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(Arc<reqwest::Error>),

    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        TransportError::Request(Arc::new(err))
    }
}

/// Maximum length for error response bodies in log lines
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Truncate a response body to avoid logging excessive data
pub(crate) fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY_LENGTH;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
}
