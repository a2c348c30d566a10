//! Single-flight re-authentication
//!
//! When many concurrent calls discover an expired credential at the same
//! time, exactly one of them runs the refresh. Everyone else is told
//! immediately that a refresh is unavailable right now and decides for
//! themselves what to do with that.
//!
//! The coordinator only ever *tries* to take its lock and never queues on
//! it. The lock is held for the whole callback, so a refresh procedure that
//! re-enters the coordinator (for example because the refresh request goes
//! through the same retrying client and gets a 401 of its own) sees `false`
//! instead of waiting on itself.
//!
//! A [`CredentialEpoch`] lets a caller skip the coordinator altogether when
//! the credential it was rejected with has already been replaced.

use std::{
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use futures_util::future::{BoxFuture, FutureExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Generation number of a credential, shared between its owner and the
/// executors that send it.
///
/// The owner calls [`advance`](Self::advance) after storing a new credential.
/// A request that records [`current`](Self::current) before it is sent can
/// tell from a later value that its 401 is about a credential that is
/// already gone.
#[derive(Debug, Clone, Default)]
pub struct CredentialEpoch(Arc<AtomicU64>);

impl CredentialEpoch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Marks the stored credential as replaced. Returns the new epoch.
    pub fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// Refresh procedure: resolves to `true` once a new credential is in place.
pub type RefreshCallback = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

/// Non-blocking refresh coordinator.
///
/// Shared via `Arc<AuthRefreshCoordinator>` between every call site that may
/// observe a 401.
#[derive(Default)]
pub struct AuthRefreshCoordinator {
    in_progress: Mutex<()>,
    callback: RwLock<Option<RefreshCallback>>,
}

impl std::fmt::Debug for AuthRefreshCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthRefreshCoordinator")
            .field("has_callback", &self.has_callback())
            .field("is_refreshing", &self.is_refreshing())
            .finish()
    }
}

impl AuthRefreshCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the refresh procedure. A later registration replaces the
    /// earlier one.
    pub fn set_refresh_callback<F, Fut>(&self, callback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let callback: RefreshCallback = Arc::new(move || callback().boxed());
        let mut slot = self
            .callback
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.replace(callback).is_some() {
            warn!("Replacing previously registered auth refresh callback");
        } else {
            debug!("Auth refresh callback registered");
        }
    }

    pub fn has_callback(&self) -> bool {
        self.callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Returns true while a refresh is running. Never blocks.
    pub fn is_refreshing(&self) -> bool {
        self.in_progress.try_lock().is_err()
    }

    /// Runs the refresh callback unless a refresh is already in flight.
    ///
    /// Returns `false` without waiting when the lock is taken (another
    /// caller is refreshing, or this is a re-entrant call from inside the
    /// callback) or when no callback is registered. Otherwise returns the
    /// callback's result; a panicking callback counts as `false`. The lock is
    /// released in every case.
    pub async fn try_refresh(&self) -> bool {
        let Ok(_guard) = self.in_progress.try_lock() else {
            debug!("Auth refresh already in progress, not waiting");
            return false;
        };

        let callback = self
            .callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(callback) = callback else {
            warn!("Auth refresh requested but no callback is registered");
            return false;
        };

        info!("Refreshing credentials");
        match AssertUnwindSafe(async move { callback().await })
            .catch_unwind()
            .await
        {
            Ok(true) => {
                info!("Credential refresh succeeded");
                true
            }
            Ok(false) => {
                warn!("Credential refresh failed");
                false
            }
            Err(_) => {
                error!("Credential refresh callback panicked");
                false
            }
        }
    }
}
