//! Session credentials
//!
//! A `TokenState` is never mutated after construction: a refresh produces a
//! new value that replaces the old one wholesale.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::errors::DomainError;

/// An opaque credential and the instant it stops being accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenState {
    token: String,
    expires_at: DateTime<Utc>,
}

impl TokenState {
    /// Creates a token that expires at `expires_at`.
    ///
    /// # Errors
    /// Returns error if the token value is empty
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Result<Self, DomainError> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(DomainError::InvalidToken(
                "token value cannot be empty".to_string(),
            ));
        }
        Ok(Self { token, expires_at })
    }

    /// Creates a token valid for `ttl` from now.
    ///
    /// # Errors
    /// Returns error if the token value is empty or `ttl` does not fit in the
    /// calendar
    pub fn with_ttl(token: impl Into<String>, ttl: Duration) -> Result<Self, DomainError> {
        let expires_at = Utc::now().checked_add_signed(ttl).ok_or_else(|| {
            DomainError::InvalidToken(format!("token lifetime out of range: {ttl}"))
        })?;
        Self::new(token, expires_at)
    }

    /// The credential value
    pub fn token(&self) -> &str {
        &self.token
    }

    /// When the credential expires
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Returns true if the token has expired
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Returns true if the token will expire within the given duration
    pub fn expires_within(&self, margin: Duration) -> bool {
        Utc::now()
            .checked_add_signed(margin)
            .map_or(true, |deadline| deadline >= self.expires_at)
    }
}
