//! Adaptive concurrency and backoff control for bulk operations
//!
//! The limiter never issues calls itself. Workers report call outcomes to it
//! and query it for two independent throttles:
//!
//! - **Concurrency**: how many workers may run at once
//!   ([`AdaptiveRateLimiter::active_workers`]). Shrinks on rate-limit signals
//!   (halved for hard limits, minus one otherwise) and grows back by one after
//!   a run of consecutive successes.
//! - **Rate**: how long a worker should idle before its next call
//!   ([`AdaptiveRateLimiter::wait_if_needed`]). Doubles on rate-limit signals
//!   up to a ceiling and decays on success.
//!
//! It also keeps per-item retry bookkeeping so that an item which keeps
//! failing is eventually given up on and reported.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use shiplink_client::rate_limit::AdaptiveRateLimiter;
//!
//! # async fn example() {
//! let limiter = AdaptiveRateLimiter::with_defaults();
//! limiter.wait_if_needed().await;
//! // ... make API call ...
//! limiter.on_success(Some("SHP-1"));
//! # }
//! ```

use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde::Serialize;
use shiplink_core::{
    config::RateLimitingConfig,
    domain::{RetryRecord, StatusPolicy},
};
use tracing::{debug, info, warn};

// ============================================================================
// LimiterConfig
// ============================================================================

/// Construction parameters for [`AdaptiveRateLimiter`].
#[derive(Debug, Clone, PartialEq)]
pub struct LimiterConfig {
    /// Upper bound and starting size of the worker pool
    pub max_workers: usize,
    /// Lower bound of the worker pool
    pub min_workers: usize,
    /// First backoff step, also the decay step on success
    pub initial_backoff: Duration,
    /// Backoff ceiling
    pub max_backoff: Duration,
    /// Failed attempts an item may accumulate before it is given up on
    pub max_retries: u32,
    /// Consecutive successes needed to add one worker back
    pub recovery_threshold: u32,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            min_workers: 1,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            max_retries: 3,
            recovery_threshold: 10,
        }
    }
}

impl From<&RateLimitingConfig> for LimiterConfig {
    fn from(cfg: &RateLimitingConfig) -> Self {
        let defaults = Self::default();
        Self {
            max_workers: cfg.max_workers,
            min_workers: cfg.min_workers,
            initial_backoff: Duration::try_from_secs_f64(cfg.initial_backoff_secs)
                .unwrap_or(defaults.initial_backoff),
            max_backoff: Duration::try_from_secs_f64(cfg.max_backoff_secs)
                .unwrap_or(defaults.max_backoff),
            max_retries: cfg.max_retries,
            recovery_threshold: cfg.recovery_threshold,
        }
    }
}

impl LimiterConfig {
    /// Clamps the bounds so that `1 <= min_workers <= max_workers` and
    /// `initial_backoff <= max_backoff` hold.
    fn normalized(mut self) -> Self {
        self.max_workers = self.max_workers.max(1);
        self.min_workers = self.min_workers.clamp(1, self.max_workers);
        self.recovery_threshold = self.recovery_threshold.max(1);
        if self.initial_backoff > self.max_backoff {
            self.initial_backoff = self.max_backoff;
        }
        self
    }
}

// ============================================================================
// LimiterState
// ============================================================================

/// Mutable limiter state. Every public operation runs as one transaction
/// against it under the limiter's mutex.
#[derive(Debug)]
struct LimiterState {
    active_workers: usize,
    current_backoff: Duration,
    success_count: u64,
    rate_limit_count: u64,
    consecutive_successes: u32,
    retry_info: HashMap<String, RetryRecord>,
    failed_items: HashSet<String>,
}

impl LimiterState {
    fn new(config: &LimiterConfig) -> Self {
        Self {
            active_workers: config.max_workers,
            current_backoff: Duration::ZERO,
            success_count: 0,
            rate_limit_count: 0,
            consecutive_successes: 0,
            retry_info: HashMap::new(),
            failed_items: HashSet::new(),
        }
    }

    /// Records one failed attempt for `item_id`. Returns false once the item
    /// has exceeded `max_retries` and has been moved to the failed set.
    fn track_retry(&mut self, item_id: &str, error: &str, max_retries: u32) -> bool {
        let record = self
            .retry_info
            .entry(item_id.to_string())
            .or_insert_with(|| RetryRecord::new(item_id));
        let count = record.record_failure(error);

        if count > max_retries {
            if self.failed_items.insert(item_id.to_string()) {
                info!(item_id, retry_count = count, error, "Giving up on item");
            }
            return false;
        }

        debug!(item_id, retry_count = count, max_retries, error, "Tracked retry");
        true
    }
}

// ============================================================================
// LimiterStats
// ============================================================================

/// Point-in-time snapshot of the limiter, suitable for display or JSON.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LimiterStats {
    pub success_count: u64,
    pub rate_limit_count: u64,
    pub active_workers: usize,
    pub max_workers: usize,
    pub current_backoff_secs: f64,
    /// Items with failure history that have not been given up on
    pub pending_retries: usize,
    /// Items that exhausted their retry budget, sorted
    pub failed_items: Vec<String>,
}

// ============================================================================
// AdaptiveRateLimiter
// ============================================================================

/// Adaptive worker-pool and backoff controller.
///
/// Thread-safe and designed to be shared via `Arc<AdaptiveRateLimiter>`.
pub struct AdaptiveRateLimiter {
    config: LimiterConfig,
    policy: StatusPolicy,
    state: Mutex<LimiterState>,
}

impl std::fmt::Debug for AdaptiveRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveRateLimiter")
            .field("config", &self.config)
            .field("policy", &self.policy)
            .finish()
    }
}

impl AdaptiveRateLimiter {
    /// Creates a limiter with the given bounds and status classification.
    pub fn new(config: LimiterConfig, policy: StatusPolicy) -> Self {
        let config = config.normalized();
        let state = LimiterState::new(&config);
        Self {
            config,
            policy,
            state: Mutex::new(state),
        }
    }

    /// Creates a limiter with the default bounds and status classification.
    pub fn with_defaults() -> Self {
        Self::new(LimiterConfig::default(), StatusPolicy::default())
    }

    /// A panic in another worker must not take the limiter down with it.
    fn state(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The (normalized) construction parameters.
    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    // ========================================================================
    // Outcome signals
    // ========================================================================

    /// Records a successful call.
    ///
    /// Decays the backoff by one `initial_backoff` step, grows the pool by
    /// one worker after `recovery_threshold` consecutive successes, and drops
    /// the item's retry record if it had one.
    pub fn on_success(&self, item_id: Option<&str>) {
        let mut state = self.state();
        state.success_count += 1;
        state.consecutive_successes += 1;
        state.current_backoff = state
            .current_backoff
            .saturating_sub(self.config.initial_backoff);

        if state.consecutive_successes >= self.config.recovery_threshold {
            if state.active_workers < self.config.max_workers {
                state.active_workers += 1;
                info!(
                    active_workers = state.active_workers,
                    max_workers = self.config.max_workers,
                    "Recovered one worker after sustained success"
                );
            }
            state.consecutive_successes = 0;
        }

        if let Some(item_id) = item_id {
            if state.retry_info.remove(item_id).is_some() {
                debug!(item_id, "Item recovered, cleared retry record");
            }
        }
    }

    /// Records a rate-limit response.
    ///
    /// Sets the backoff from `retry_after` when given (capped at
    /// `max_backoff`), otherwise starts it at `initial_backoff` or doubles
    /// it. Shrinks the pool: hard-limit codes halve it, any other code
    /// removes one worker, never going below `min_workers`.
    ///
    /// Returns whether `item_id` may still be retried; `true` when no item is
    /// given.
    pub fn on_rate_limit(
        &self,
        status: u16,
        item_id: Option<&str>,
        retry_after: Option<Duration>,
    ) -> bool {
        let mut state = self.state();
        state.rate_limit_count += 1;
        state.consecutive_successes = 0;

        state.current_backoff = match retry_after {
            Some(hint) => hint.min(self.config.max_backoff),
            None if state.current_backoff.is_zero() => self.config.initial_backoff,
            None => state
                .current_backoff
                .saturating_mul(2)
                .min(self.config.max_backoff),
        };

        let before = state.active_workers;
        if before > self.config.min_workers {
            state.active_workers = if self.policy.is_hard_limit(status) {
                (before / 2).max(self.config.min_workers)
            } else {
                before - 1
            };
        }

        warn!(
            status,
            active_workers = state.active_workers,
            previous_workers = before,
            backoff_secs = state.current_backoff.as_secs_f64(),
            "Rate limited, throttling down"
        );

        match item_id {
            Some(item_id) => {
                let error = format!("HTTP {status}");
                state.track_retry(item_id, &error, self.config.max_retries)
            }
            None => true,
        }
    }

    /// Records a generic failure for `item_id`.
    ///
    /// A retryable `status` lifts the backoff to at least `initial_backoff`.
    /// Returns whether the item may still be retried.
    pub fn on_error(&self, item_id: &str, error: &str, status: Option<u16>) -> bool {
        let mut state = self.state();
        state.consecutive_successes = 0;

        if status.is_some_and(|s| self.policy.is_retryable(s))
            && state.current_backoff < self.config.initial_backoff
        {
            state.current_backoff = self.config.initial_backoff;
        }

        debug!(item_id, error, ?status, "Recording error");
        state.track_retry(item_id, error, self.config.max_retries)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Returns true unless the item was given up on or already used its
    /// whole retry budget. Items never seen may always be retried.
    pub fn should_retry(&self, item_id: &str) -> bool {
        let state = self.state();
        if state.failed_items.contains(item_id) {
            return false;
        }
        state
            .retry_info
            .get(item_id)
            .map_or(true, |r| r.retry_count < self.config.max_retries)
    }

    /// Failed attempts recorded for `item_id`; 0 for unknown items.
    pub fn retry_count(&self, item_id: &str) -> u32 {
        self.state()
            .retry_info
            .get(item_id)
            .map_or(0, |r| r.retry_count)
    }

    /// Copy of the retry record for `item_id`, if it has one.
    pub fn retry_record(&self, item_id: &str) -> Option<RetryRecord> {
        self.state().retry_info.get(item_id).cloned()
    }

    /// Delay the next call should be preceded by.
    pub fn current_backoff(&self) -> Duration {
        self.state().current_backoff
    }

    /// Number of workers currently allowed to run concurrently.
    pub fn active_workers(&self) -> usize {
        self.state().active_workers
    }

    pub fn max_workers(&self) -> usize {
        self.config.max_workers
    }

    /// Sleeps for the current backoff, if any.
    ///
    /// The lock is released before sleeping, so other workers can keep
    /// reporting outcomes meanwhile.
    pub async fn wait_if_needed(&self) {
        let backoff = self.current_backoff();
        if !backoff.is_zero() {
            debug!(backoff_ms = backoff.as_millis() as u64, "Backing off");
            tokio::time::sleep(backoff).await;
        }
    }

    pub fn is_rate_limit_status(&self, status: u16) -> bool {
        self.policy.is_rate_limit(status)
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.policy.is_retryable(status)
    }

    pub fn policy(&self) -> &StatusPolicy {
        &self.policy
    }

    /// Snapshot of counters and pool state.
    pub fn stats(&self) -> LimiterStats {
        let state = self.state();
        let mut failed_items: Vec<String> = state.failed_items.iter().cloned().collect();
        failed_items.sort();
        let pending_retries = state
            .retry_info
            .keys()
            .filter(|id| !state.failed_items.contains(*id))
            .count();

        LimiterStats {
            success_count: state.success_count,
            rate_limit_count: state.rate_limit_count,
            active_workers: state.active_workers,
            max_workers: self.config.max_workers,
            current_backoff_secs: state.current_backoff.as_secs_f64(),
            pending_retries,
            failed_items,
        }
    }

    /// Items that exhausted their retry budget. Returns a copy.
    pub fn failed_items(&self) -> HashSet<String> {
        self.state().failed_items.clone()
    }

    /// Restores the state a freshly constructed limiter has.
    pub fn reset(&self) {
        let mut state = self.state();
        *state = LimiterState::new(&self.config);
        info!(active_workers = state.active_workers, "Rate limiter reset");
    }
}

// ============================================================================
// Retry-After header parsing
// ============================================================================

/// Reads a `Retry-After` value: delta-seconds or an HTTP-date.
///
/// A date already in the past means "retry now" and yields zero. Returns
/// `None` for anything else, so the limiter falls back to its own
/// exponential backoff. No ceiling is applied here; `on_rate_limit` caps
/// the hint at the configured `max_backoff`.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    match chrono::DateTime::parse_from_rfc2822(value) {
        Ok(date) => {
            let wait = date.with_timezone(&chrono::Utc) - chrono::Utc::now();
            Some(wait.to_std().unwrap_or(Duration::ZERO))
        }
        Err(e) => {
            warn!(value, error = %e, "Ignoring unreadable Retry-After header");
            None
        }
    }
}
