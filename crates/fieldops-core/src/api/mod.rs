//! REST API client module for the field operations backend.
//!
//! This module provides the `ApiClient` for authenticated calls to the
//! task, terminal, and report endpoints.
//!
//! Calls carry a bearer access token that is refreshed transparently when
//! it expires or is rejected; an unrecoverable session is torn down.

pub mod client;
pub mod error;
pub mod transport;

pub use client::{ApiClient, ApiClientBuilder, SessionInvalidatedHook};
pub use error::{ApiError, RefreshError, TransportError};
pub use transport::{
    HttpRequest, HttpResponse, HttpTransport, MultipartForm, RequestBody, ReqwestTransport,
    ResponseBody,
};
