//! Uniform retry policy for outbound calls
//!
//! [`RetryExecutor::execute`] wraps one logical request:
//!
//! 1. Send it.
//! 2. On a retryable status (or a transient transport error), sleep
//!    `backoff_factor * 2^attempt` and try again, up to `max_retries` times.
//! 3. On 401, ask the [`AuthRefreshCoordinator`] for a new credential and, if
//!    that worked, replay the request once. The replay does not use up a
//!    retry. If the credential was already replaced while the request was in
//!    flight (the [`CredentialEpoch`] moved on), the request is replayed
//!    without asking for another refresh.
//!
//! Whatever the last attempt produced is handed back unchanged; the executor
//! never turns a response into an error or swallows one.

use std::{
    fmt::Display,
    future::Future,
    sync::{Arc, OnceLock},
    time::Duration,
};

use shiplink_core::{config::Config, domain::StatusPolicy};
use tracing::{debug, info, warn};

use crate::{
    auth_refresh::{AuthRefreshCoordinator, CredentialEpoch},
    rate_limit::{parse_retry_after, AdaptiveRateLimiter},
    ClientError,
};

// ============================================================================
// Seams
// ============================================================================

/// Anything that carries a remote status code.
pub trait HasStatus {
    fn status_code(&self) -> u16;

    /// Server-provided delay hint, if the response carries one.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl HasStatus for reqwest::Response {
    fn status_code(&self) -> u16 {
        self.status().as_u16()
    }

    fn retry_after(&self) -> Option<Duration> {
        self.headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after)
    }
}

impl HasStatus for u16 {
    fn status_code(&self) -> u16 {
        *self
    }
}

/// Errors that may go away if the same call is repeated.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for reqwest::Error {
    fn is_transient(&self) -> bool {
        self.is_timeout() || self.is_connect() || self.is_request()
    }
}

impl Transient for ClientError {
    fn is_transient(&self) -> bool {
        ClientError::is_transient(self)
    }
}

// ============================================================================
// RetryPolicy
// ============================================================================

/// How many times to retry and how long to wait in between.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry; doubles for each following one
    pub backoff_factor: Duration,
    /// Which statuses are retried
    pub statuses: StatusPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_factor: Duration::from_secs(1),
            statuses: StatusPolicy::default(),
        }
    }
}

impl From<&Config> for RetryPolicy {
    fn from(config: &Config) -> Self {
        Self {
            max_retries: config.retry.max_retries,
            backoff_factor: Duration::try_from_secs_f64(config.retry.backoff_factor_secs)
                .unwrap_or(Duration::from_secs(1)),
            statuses: config.status.clone(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt + 1`: `backoff_factor * 2^attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff_factor
            .saturating_mul(2u32.saturating_pow(attempt))
    }
}

// ============================================================================
// RetryExecutor
// ============================================================================

/// Runs requests under a [`RetryPolicy`].
///
/// Holds no per-request state; one executor can serve any number of
/// concurrent calls.
#[derive(Debug, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    auth: OnceLock<Arc<AuthRefreshCoordinator>>,
    limiter: Option<Arc<AdaptiveRateLimiter>>,
    epoch: Option<CredentialEpoch>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            auth: OnceLock::new(),
            limiter: None,
            epoch: None,
        }
    }

    /// Use `coordinator` to recover from 401 responses.
    pub fn with_auth_refresh(self, coordinator: Arc<AuthRefreshCoordinator>) -> Self {
        self.attach_auth_refresh(coordinator);
        self
    }

    /// Attaches a refresh coordinator after construction. Only the first
    /// attachment takes effect; returns whether this one did.
    pub fn attach_auth_refresh(&self, coordinator: Arc<AuthRefreshCoordinator>) -> bool {
        let attached = self.auth.set(coordinator).is_ok();
        if !attached {
            warn!("Retry executor already has an auth refresh coordinator");
        }
        attached
    }

    /// Report rate-limit responses that are about to be retried to `limiter`.
    pub fn with_rate_limiter(mut self, limiter: Arc<AdaptiveRateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Track the generation of the credential the requests carry.
    pub fn with_credential_epoch(mut self, epoch: CredentialEpoch) -> Self {
        self.epoch = Some(epoch);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn auth_refresh(&self) -> Option<&Arc<AuthRefreshCoordinator>> {
        self.auth.get()
    }

    /// Executes `call` until it yields a non-retryable outcome or the retry
    /// budget runs out, and returns that last outcome.
    pub async fn execute<F, Fut, R, E>(&self, mut call: F) -> Result<R, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<R, E>>,
        R: HasStatus,
        E: Transient + Display,
    {
        let statuses = &self.policy.statuses;
        let mut attempt: u32 = 0;
        let mut replayed = false;

        loop {
            let sent_epoch = self.epoch.as_ref().map(CredentialEpoch::current);
            match call().await {
                Ok(response) => {
                    let status = response.status_code();

                    if statuses.is_unauthorized(status) {
                        if replayed {
                            warn!("Still unauthorized after credential refresh");
                            return Ok(response);
                        }
                        let Some(coordinator) = self.auth.get() else {
                            return Ok(response);
                        };
                        replayed = true;
                        if sent_epoch != self.epoch.as_ref().map(CredentialEpoch::current) {
                            debug!("Credential replaced while request was in flight, replaying");
                            continue;
                        }
                        if coordinator.try_refresh().await {
                            info!(attempt, "Credential refreshed, replaying request");
                            continue;
                        }
                        debug!("Credential refresh unavailable, surfacing 401");
                        return Ok(response);
                    }

                    if !statuses.is_retryable(status) {
                        if attempt > 0 {
                            info!(attempt, status, "Request settled after retry");
                        }
                        return Ok(response);
                    }

                    if attempt >= self.policy.max_retries {
                        warn!(
                            status,
                            attempts = attempt + 1,
                            "Retry limit exhausted, returning last response"
                        );
                        return Ok(response);
                    }

                    if statuses.is_rate_limit(status) {
                        if let Some(limiter) = &self.limiter {
                            limiter.on_rate_limit(status, None, response.retry_after());
                        }
                    }

                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        status,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Retryable status, backing off"
                    );
                    drop(response);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    if !err.is_transient() || attempt >= self.policy.max_retries {
                        if attempt > 0 {
                            warn!(error = %err, attempts = attempt + 1, "Request failed after retries");
                        }
                        return Err(err);
                    }

                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        error = %err,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Transient error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
