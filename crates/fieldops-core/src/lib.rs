//! Core library for the field operations client.
//!
//! Provides the authenticated REST client used by the collector and
//! technician workflows, plus the session storage and configuration it
//! depends on.

pub mod api;
pub mod auth;
pub mod config;

#[cfg(test)]
mod testing;

pub use api::{ApiClient, ApiError, MultipartForm, ResponseBody};
pub use auth::{SessionSnapshot, SessionStore};
pub use config::{Config, SessionBackend};
