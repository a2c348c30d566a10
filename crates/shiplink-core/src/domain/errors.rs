//! Domain error types
//!
//! This module defines error types specific to domain operations,
//! including identifier validation and status-code classification.

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Item identifier is empty or malformed
    #[error("Invalid item ID: {0}")]
    InvalidItemId(String),

    /// Status code outside the HTTP range
    #[error("Invalid status code: {0}")]
    InvalidStatusCode(u16),

    /// Credential value is unusable
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}
