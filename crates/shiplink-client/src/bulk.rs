//! Bounded worker pool for bulk operations
//!
//! [`BulkRunner::run`] pushes a list of item ids through a caller-supplied
//! fetch function with at most [`AdaptiveRateLimiter::active_workers`]
//! fetches in flight. Each worker waits out the limiter's backoff before
//! calling, and every outcome is reported back to the limiter, which decides
//! whether the item goes back on the queue or is given up on.

use std::{
    collections::{HashSet, VecDeque},
    future::Future,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::Duration,
};

use futures_util::FutureExt;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{rate_limit::AdaptiveRateLimiter, ClientError};

// ============================================================================
// FetchOutcome
// ============================================================================

/// Result of one fetch attempt for one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The item was fetched and handled
    Done,
    /// The remote side throttled the request
    RateLimited {
        status: u16,
        retry_after: Option<Duration>,
    },
    /// A failure that may go away on retry
    Failed { status: Option<u16>, error: String },
    /// A failure that retrying will not fix
    Fatal { error: String },
}

impl From<ClientError> for FetchOutcome {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::RateLimited {
                status,
                retry_after,
            } => Self::RateLimited {
                status,
                retry_after,
            },
            ClientError::ServerError { status, .. } => Self::Failed {
                status: Some(status),
                error: err.to_string(),
            },
            ClientError::Network(ref e) if err.is_transient() => Self::Failed {
                status: e.status().map(|s| s.as_u16()),
                error: err.to_string(),
            },
            other => Self::Fatal {
                error: other.to_string(),
            },
        }
    }
}

// ============================================================================
// BulkReport
// ============================================================================

/// An item that failed with a non-retryable error
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FatalItem {
    pub item_id: String,
    pub error: String,
}

/// Where every input item ended up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkReport {
    /// Fetched successfully, in completion order
    pub succeeded: Vec<String>,
    /// Gave up after exhausting the retry budget, sorted
    pub failed: Vec<String>,
    /// Non-retryable failures, in completion order
    pub fatal: Vec<FatalItem>,
    /// Not finished when the run was cancelled, sorted
    pub cancelled: Vec<String>,
}

impl BulkReport {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.fatal.len() + self.cancelled.len()
    }

    /// True when every item succeeded.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.fatal.is_empty() && self.cancelled.is_empty()
    }
}

// ============================================================================
// BulkRunner
// ============================================================================

/// Runs fetches for many items under an [`AdaptiveRateLimiter`].
#[derive(Debug, Clone)]
pub struct BulkRunner {
    limiter: Arc<AdaptiveRateLimiter>,
    cancel: CancellationToken,
}

impl BulkRunner {
    pub fn new(limiter: Arc<AdaptiveRateLimiter>) -> Self {
        Self {
            limiter,
            cancel: CancellationToken::new(),
        }
    }

    /// Stops the run when `token` is cancelled. Fetches in flight are aborted
    /// and reported as cancelled along with everything still queued.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn limiter(&self) -> &Arc<AdaptiveRateLimiter> {
        &self.limiter
    }

    /// Fetches every item once, retrying as the limiter allows.
    ///
    /// Duplicate ids are fetched once. A panicking fetch counts as a fatal
    /// failure for its item.
    pub async fn run<I, F, Fut>(&self, items: I, fetch: F) -> BulkReport
    where
        I: IntoIterator<Item = String>,
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FetchOutcome> + Send + 'static,
    {
        let fetch = Arc::new(fetch);
        let mut seen = HashSet::new();
        let mut queue: VecDeque<String> = items
            .into_iter()
            .filter(|id| seen.insert(id.clone()))
            .collect();
        let total = queue.len();

        let mut in_flight: JoinSet<(String, FetchOutcome)> = JoinSet::new();
        let mut running: HashSet<String> = HashSet::new();
        let mut report = BulkReport::default();

        info!(items = total, workers = self.limiter.active_workers(), "Starting bulk run");

        loop {
            while running.len() < self.limiter.active_workers() {
                let Some(item_id) = queue.pop_front() else {
                    break;
                };
                running.insert(item_id.clone());

                let limiter = Arc::clone(&self.limiter);
                let fetch = Arc::clone(&fetch);
                in_flight.spawn(async move {
                    limiter.wait_if_needed().await;
                    let outcome = match AssertUnwindSafe(fetch(item_id.clone()))
                        .catch_unwind()
                        .await
                    {
                        Ok(outcome) => outcome,
                        Err(_) => FetchOutcome::Fatal {
                            error: "worker panicked".to_string(),
                        },
                    };
                    (item_id, outcome)
                });
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    warn!(
                        in_flight = running.len(),
                        queued = queue.len(),
                        "Bulk run cancelled"
                    );
                    in_flight.abort_all();
                    while in_flight.join_next().await.is_some() {}
                    report.cancelled.extend(running.drain());
                    report.cancelled.extend(queue.drain(..));
                    break;
                }
                Some(joined) = in_flight.join_next() => {
                    let (item_id, outcome) = match joined {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!(error = %e, "Bulk worker task failed");
                            continue;
                        }
                    };
                    running.remove(&item_id);
                    self.settle(item_id, outcome, &mut queue, &mut report);
                }
            }
        }

        // A task that died without reporting its id
        report.cancelled.extend(running.drain());
        report.failed.sort();
        report.cancelled.sort();

        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            fatal = report.fatal.len(),
            cancelled = report.cancelled.len(),
            "Bulk run finished"
        );
        report
    }

    /// Reports `outcome` to the limiter and routes the item accordingly.
    fn settle(
        &self,
        item_id: String,
        outcome: FetchOutcome,
        queue: &mut VecDeque<String>,
        report: &mut BulkReport,
    ) {
        let retry = match outcome {
            FetchOutcome::Done => {
                self.limiter.on_success(Some(&item_id));
                debug!(item_id, "Item done");
                report.succeeded.push(item_id);
                return;
            }
            FetchOutcome::Fatal { error } => {
                error!(item_id, error, "Item failed permanently");
                report.fatal.push(FatalItem { item_id, error });
                return;
            }
            FetchOutcome::RateLimited {
                status,
                retry_after,
            } => self
                .limiter
                .on_rate_limit(status, Some(&item_id), retry_after),
            FetchOutcome::Failed { status, error } => {
                self.limiter.on_error(&item_id, &error, status)
            }
        };

        if retry {
            debug!(
                item_id,
                retry_count = self.limiter.retry_count(&item_id),
                "Re-queueing item"
            );
            queue.push_back(item_id);
        } else {
            report.failed.push(item_id);
        }
    }
}
