//! Shared session token for concurrent SOAP callers
//!
//! [`SharedTokenManager::get_valid_token`] uses double-checked locking:
//!
//! - **Fast path**: clone the current `Arc<TokenState>` under a short read
//!   lock and return it if it is still valid. No lock is held while the
//!   caller uses the token.
//! - **Slow path**: serialize on an async mutex, check again (someone else
//!   may have just refreshed), and only then call the [`TokenAcquirer`].
//!
//! A failed acquisition releases the mutex, leaves the previous state alone,
//! and reports the error to the one caller that attempted it. Callers that
//! were queued behind it make their own attempt.

use std::{
    borrow::Cow,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, PoisonError, RwLock,
    },
    time::Duration,
};

use async_trait::async_trait;
use shiplink_core::domain::TokenState;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::ClientError;

/// Namespace of the authentication header element
pub const AUTH_HEADER_NS: &str = "urn:shiplink:auth";

// ============================================================================
// TokenAcquirer port
// ============================================================================

/// Performs the (expensive) remote login that yields a new session token.
#[async_trait]
pub trait TokenAcquirer: Send + Sync {
    async fn acquire(&self) -> Result<TokenState, ClientError>;
}

// ============================================================================
// SharedTokenManager
// ============================================================================

/// Owner of the one session token shared by every SOAP caller.
pub struct SharedTokenManager {
    acquirer: Arc<dyn TokenAcquirer>,
    refresh_margin: chrono::Duration,
    current: RwLock<Option<Arc<TokenState>>>,
    acquire_lock: Mutex<()>,
    acquisitions: AtomicU64,
}

impl std::fmt::Debug for SharedTokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedTokenManager")
            .field("refresh_margin", &self.refresh_margin)
            .field("has_token", &self.current().is_some())
            .field("acquisitions", &self.acquisitions())
            .finish()
    }
}

impl SharedTokenManager {
    /// Tokens expiring within `refresh_margin` are treated as already invalid.
    pub fn new(acquirer: Arc<dyn TokenAcquirer>, refresh_margin: Duration) -> Self {
        Self {
            acquirer,
            refresh_margin: chrono::Duration::from_std(refresh_margin)
                .unwrap_or_else(|_| chrono::Duration::zero()),
            current: RwLock::new(None),
            acquire_lock: Mutex::new(()),
            acquisitions: AtomicU64::new(0),
        }
    }

    /// True if `state` holds a token that is not within the refresh margin
    /// of its expiry.
    pub fn is_token_valid(&self, state: Option<&TokenState>) -> bool {
        state.is_some_and(|s| !s.expires_within(self.refresh_margin))
    }

    /// Snapshot of the stored token, valid or not.
    pub fn current(&self) -> Option<Arc<TokenState>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store(&self, state: Option<Arc<TokenState>>) {
        *self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Number of acquisition attempts made so far.
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }

    /// Returns a valid token, acquiring a new one if needed.
    ///
    /// Concurrent callers that find the token invalid trigger a single
    /// acquisition and all receive its result.
    pub async fn get_valid_token(&self) -> Result<String, ClientError> {
        if let Some(state) = self.current() {
            if self.is_token_valid(Some(&state)) {
                return Ok(state.token().to_string());
            }
        }

        let _guard = self.acquire_lock.lock().await;

        if let Some(state) = self.current() {
            if self.is_token_valid(Some(&state)) {
                debug!("Token refreshed by another caller while waiting");
                return Ok(state.token().to_string());
            }
        }

        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        info!("Acquiring new session token");
        let state = match self.acquirer.acquire().await {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "Session token acquisition failed");
                return Err(e);
            }
        };

        if !self.is_token_valid(Some(&state)) {
            warn!(
                expires_at = %state.expires_at(),
                "Acquired token is already within the refresh margin"
            );
        }

        let token = state.token().to_string();
        self.store(Some(Arc::new(state)));
        debug!("Session token stored");
        Ok(token)
    }

    /// Drops the stored token if it is still `token`.
    ///
    /// Callers pass the token their request was rejected with; if another
    /// caller has meanwhile stored a fresh one, it is kept. Returns whether
    /// the token was dropped.
    pub fn invalidate(&self, token: &str) -> bool {
        let mut current = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match current.as_deref() {
            Some(state) if state.token() == token => {
                *current = None;
                info!("Session token invalidated");
                true
            }
            _ => false,
        }
    }

    pub fn build_soap_header(&self, token: &str) -> String {
        build_soap_header(token)
    }
}

/// Builds the SOAP header carrying `token`.
pub fn build_soap_header(token: &str) -> String {
    let escaped: Cow<'_, str> = quick_xml::escape::escape(token);
    format!(
        "<soapenv:Header><AuthHeader xmlns=\"{AUTH_HEADER_NS}\"><Token>{escaped}</Token></AuthHeader></soapenv:Header>"
    )
}
