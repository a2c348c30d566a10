//! REST backend client
//!
//! Wraps `reqwest::Client` with bearer authentication, base URL
//! construction and the resilience pieces: every request goes through a
//! [`RetryExecutor`], and 401 responses are recovered through an
//! [`AuthRefreshCoordinator`] whose callback refreshes the session *through
//! this same client*.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use shiplink_client::{auth_refresh::AuthRefreshCoordinator, client::RestClient};
//!
//! # async fn example() -> Result<(), shiplink_client::ClientError> {
//! let client = Arc::new(RestClient::new("https://api.example.com"));
//! client.set_access_token("session-token");
//! client.enable_auth_refresh(Arc::new(AuthRefreshCoordinator::new()));
//! let bytes = client.download("SHP-1").await?;
//! # Ok(())
//! # }
//! ```

use std::{
    sync::{Arc, PoisonError, RwLock, Weak},
    time::Duration,
};

use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use shiplink_core::{config::Config, domain::StatusPolicy};
use tracing::{debug, info, warn};

use crate::{
    auth_refresh::{AuthRefreshCoordinator, CredentialEpoch},
    rate_limit::AdaptiveRateLimiter,
    retry::{HasStatus, RetryExecutor, RetryPolicy},
    ClientError,
};

/// Default refresh endpoint
const DEFAULT_REFRESH_PATH: &str = "/auth/refresh";

/// Default item download endpoint; `{id}` is replaced by the item id
const DEFAULT_DOWNLOAD_PATH: &str = "/items/{id}";

// ============================================================================
// Response types
// ============================================================================

/// Body of a successful refresh call
#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
}

// ============================================================================
// RestClient
// ============================================================================

/// HTTP client for the REST backend.
///
/// Meant to be shared as `Arc<RestClient>`: the access token is updated in
/// place when a refresh succeeds.
pub struct RestClient {
    /// The underlying HTTP client
    client: Client,
    /// Base URL for API requests
    base_url: String,
    /// Current access token
    access_token: RwLock<String>,
    /// Advanced on every token change; shared with the executor
    epoch: CredentialEpoch,
    refresh_path: String,
    download_path: String,
    executor: RetryExecutor,
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("base_url", &self.base_url)
            .field("refresh_path", &self.refresh_path)
            .field("download_path", &self.download_path)
            .field("executor", &self.executor)
            .finish()
    }
}

impl RestClient {
    /// Creates a client for `base_url` with the default retry policy and no
    /// access token.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_http_client(Client::new(), base_url.into(), RetryPolicy::default())
    }

    fn with_http_client(client: Client, base_url: String, policy: RetryPolicy) -> Self {
        let epoch = CredentialEpoch::new();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token: RwLock::new(String::new()),
            executor: RetryExecutor::new(policy).with_credential_epoch(epoch.clone()),
            epoch,
            refresh_path: DEFAULT_REFRESH_PATH.to_string(),
            download_path: DEFAULT_DOWNLOAD_PATH.to_string(),
        }
    }

    /// Creates a client from the `rest`, `retry` and `status` sections.
    ///
    /// The request timeout is enforced by the HTTP client.
    pub fn from_config(config: &Config) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.rest.timeout_secs))
            .build()?;

        Ok(
            Self::with_http_client(client, config.rest.base_url.clone(), RetryPolicy::from(config))
                .with_refresh_path(config.rest.refresh_path.clone())
                .with_download_path(config.rest.download_path.clone()),
        )
    }

    /// Replaces the retry policy. Call before `with_rate_limiter` and
    /// `enable_auth_refresh`, which attach to the current executor.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.executor = RetryExecutor::new(policy).with_credential_epoch(self.epoch.clone());
        self
    }

    /// Reports rate-limit responses that get retried to `limiter`.
    pub fn with_rate_limiter(mut self, limiter: Arc<AdaptiveRateLimiter>) -> Self {
        self.executor = self.executor.with_rate_limiter(limiter);
        self
    }

    pub fn with_refresh_path(mut self, path: impl Into<String>) -> Self {
        self.refresh_path = path.into();
        self
    }

    pub fn with_download_path(mut self, path: impl Into<String>) -> Self {
        self.download_path = path.into();
        self
    }

    /// Updates the access token (e.g., after a token refresh)
    pub fn set_access_token(&self, token: impl Into<String>) {
        *self
            .access_token
            .write()
            .unwrap_or_else(PoisonError::into_inner) = token.into();
        let epoch = self.epoch.advance();
        debug!(epoch, "Updated RestClient access token");
    }

    /// Returns a copy of the current access token
    pub fn access_token(&self) -> String {
        self.access_token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn status_policy(&self) -> &StatusPolicy {
        &self.executor.policy().statuses
    }

    /// Creates an authenticated request builder for the given method and path
    ///
    /// Automatically prepends the base URL and adds the Authorization header.
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let builder = self.client.request(method, &url);
        let token = self.access_token();
        if token.is_empty() {
            builder
        } else {
            builder.bearer_auth(token)
        }
    }

    // ========================================================================
    // Auth refresh
    // ========================================================================

    /// Recovers from 401 responses through `coordinator`.
    ///
    /// Registers a refresh callback that POSTs `refresh_path` through this
    /// client, so the refresh request itself runs under the retry policy and
    /// may hit the coordinator again. The callback only holds a weak
    /// reference to the client.
    pub fn enable_auth_refresh(self: &Arc<Self>, coordinator: Arc<AuthRefreshCoordinator>) {
        let client: Weak<Self> = Arc::downgrade(self);
        coordinator.set_refresh_callback(move || {
            let client = client.clone();
            async move {
                match client.upgrade() {
                    Some(client) => client.refresh_access_token().await,
                    None => false,
                }
            }
        });
        self.executor.attach_auth_refresh(coordinator);
    }

    /// Exchanges the current session for a new access token and stores it.
    async fn refresh_access_token(&self) -> bool {
        let response = match self.execute(Method::POST, &self.refresh_path).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Refresh request failed");
                return false;
            }
        };

        if !response.status().is_success() {
            warn!(status = response.status().as_u16(), "Refresh rejected");
            return false;
        }

        match response.json::<RefreshResponse>().await {
            Ok(body) if !body.access_token.is_empty() => {
                self.set_access_token(body.access_token);
                true
            }
            Ok(_) => {
                warn!("Refresh response carried an empty access token");
                false
            }
            Err(e) => {
                warn!(error = %e, "Could not parse refresh response");
                false
            }
        }
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Sends `method path` under the retry policy.
    ///
    /// The final response is returned whatever its status; only transport
    /// errors become `Err`.
    pub async fn execute(&self, method: Method, path: &str) -> Result<Response, ClientError> {
        let response = self
            .executor
            .execute(|| self.request(method.clone(), path).send())
            .await?;
        Ok(response)
    }

    /// Downloads one item's payload.
    ///
    /// Unsuccessful final statuses are mapped to [`ClientError`] variants by
    /// [`error_from_response`].
    pub async fn download(&self, item_id: &str) -> Result<Vec<u8>, ClientError> {
        let path = self.download_path.replace("{id}", item_id);
        debug!(item_id, path = %path, "Downloading item");

        let response = self.execute(Method::GET, &path).await?;
        if !response.status().is_success() {
            return Err(error_from_response(response, self.status_policy()).await);
        }

        let bytes = response.bytes().await?;
        debug!(item_id, bytes = bytes.len(), "Downloaded item");
        Ok(bytes.to_vec())
    }
}

/// Converts an unsuccessful response into the matching [`ClientError`].
pub(crate) async fn error_from_response(response: Response, policy: &StatusPolicy) -> ClientError {
    let status = response.status();
    let code = status.as_u16();
    let retry_after = HasStatus::retry_after(&response);
    let body = response.text().await.unwrap_or_default();

    if status == StatusCode::UNAUTHORIZED {
        info!("Request unauthorized");
        return ClientError::Unauthorized(if body.is_empty() {
            "credential rejected".to_string()
        } else {
            body
        });
    }
    if policy.is_rate_limit(code) {
        return ClientError::RateLimited {
            status: code,
            retry_after,
        };
    }
    if status.is_server_error() {
        return ClientError::ServerError { status: code, body };
    }
    ClientError::Status { status: code, body }
}
