//! Shiplink client - resilient access to the REST backend and SOAP partner interface
//!
//! Provides:
//! - Adaptive worker-pool sizing and backoff for bulk operations
//! - A uniform retry policy with exponential backoff for every outbound call
//! - Single-flight re-authentication on 401 responses
//! - A double-checked-locking session token shared by concurrent SOAP callers
//!
//! ## Modules
//!
//! - [`rate_limit`] - Adaptive concurrency/backoff controller
//! - [`retry`] - Retry executor and policy
//! - [`auth_refresh`] - Non-blocking refresh coordinator
//! - [`token`] - Shared session token manager
//! - [`client`] - REST client wired to the pieces above
//! - [`soap`] - SOAP client and login-based token acquisition
//! - [`bulk`] - Bounded worker pool driven by the rate limiter

pub mod auth_refresh;
pub mod bulk;
pub mod client;
pub mod rate_limit;
pub mod retry;
pub mod soap;
pub mod token;

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur when talking to a remote service
#[derive(Debug, Error)]
pub enum ClientError {
    /// Credentials are missing, invalid, or expired and could not be refreshed
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The remote side is throttling us
    #[error("Rate limited (HTTP {status}), retry after {retry_after:?}")]
    RateLimited {
        /// Status code that signalled the limit (usually 429 or 503)
        status: u16,
        /// Server-provided hint, if any
        retry_after: Option<Duration>,
    },

    /// A server-side error occurred (5xx)
    #[error("Server error (HTTP {status}): {body}")]
    ServerError { status: u16, body: String },

    /// Any other unsuccessful status
    #[error("Unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    /// A network-level error occurred
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The response could not be parsed or was malformed
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// The session token could not be obtained
    #[error("Token acquisition failed: {0}")]
    TokenAcquisition(String),

    /// The client was configured with unusable values
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// Returns the remote status code carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::RateLimited { status, .. }
            | Self::ServerError { status, .. }
            | Self::Status { status, .. } => Some(*status),
            Self::Unauthorized(_) => Some(shiplink_core::domain::status::UNAUTHORIZED),
            Self::Network(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Returns true if repeating the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::ServerError { .. } => true,
            Self::Network(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }
}
