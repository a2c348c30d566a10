//! Status-code classification
//!
//! The only protocol-facing contract of the resilience layer. Backends differ
//! in how they signal overload, so every set is overridable from the config
//! file.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::errors::DomainError;

/// HTTP 401: the credential was rejected
pub const UNAUTHORIZED: u16 = 401;

/// Classification of remote status codes.
///
/// - `retryable`: transient, eligible for backoff and retry
/// - `rate_limit`: the remote side is throttling; shrinks the worker pool
/// - `hard_limit`: subset of `rate_limit` treated as a quota violation, which
///   halves the pool instead of removing one worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusPolicy {
    pub retryable: BTreeSet<u16>,
    pub rate_limit: BTreeSet<u16>,
    pub hard_limit: BTreeSet<u16>,
}

impl Default for StatusPolicy {
    fn default() -> Self {
        Self {
            retryable: [429, 500, 502, 503, 504].into_iter().collect(),
            rate_limit: [429, 503].into_iter().collect(),
            hard_limit: [429].into_iter().collect(),
        }
    }
}

impl StatusPolicy {
    /// Returns true if a response with this status may be retried.
    pub fn is_retryable(&self, status: u16) -> bool {
        self.retryable.contains(&status)
    }

    /// Returns true if this status means the remote side is throttling us.
    pub fn is_rate_limit(&self, status: u16) -> bool {
        self.rate_limit.contains(&status)
    }

    /// Returns true if this status should halve the worker pool.
    pub fn is_hard_limit(&self, status: u16) -> bool {
        self.hard_limit.contains(&status)
    }

    /// Returns true if the credential was rejected.
    pub fn is_unauthorized(&self, status: u16) -> bool {
        status == UNAUTHORIZED
    }

    /// Checks that every code is a valid HTTP status and that the sets nest
    /// the way the limiter expects.
    pub fn check(&self) -> Result<(), DomainError> {
        let all = self
            .retryable
            .iter()
            .chain(&self.rate_limit)
            .chain(&self.hard_limit);
        for &code in all {
            if !(100..=599).contains(&code) {
                return Err(DomainError::InvalidStatusCode(code));
            }
        }

        if let Some(code) = self.hard_limit.difference(&self.rate_limit).next() {
            return Err(DomainError::ValidationFailed(format!(
                "hard limit status {code} is not a rate limit status"
            )));
        }

        Ok(())
    }
}
