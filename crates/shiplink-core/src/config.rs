//! Configuration module for shiplink.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::StatusPolicy;

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for shiplink.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub rate_limiting: RateLimitingConfig,
    pub retry: RetryConfig,
    pub status: StatusPolicy,
    pub rest: RestConfig,
    pub soap: SoapConfig,
    pub logging: LoggingConfig,
}

/// Adaptive worker-pool settings for bulk operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitingConfig {
    /// Upper bound (and starting size) of the worker pool.
    pub max_workers: usize,
    /// The pool never shrinks below this many workers.
    pub min_workers: usize,
    /// First backoff step, and the decay step on success (seconds).
    pub initial_backoff_secs: f64,
    /// Backoff ceiling (seconds).
    pub max_backoff_secs: f64,
    /// Failed attempts an item may accumulate before it is given up on.
    pub max_retries: u32,
    /// Consecutive successes needed to add one worker back.
    pub recovery_threshold: u32,
}

/// Per-request retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Base of the exponential backoff: `factor * 2^attempt` seconds.
    pub backoff_factor_secs: f64,
}

/// REST backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestConfig {
    /// Base URL, without trailing slash.
    pub base_url: String,
    /// Per-request timeout enforced by the HTTP client (seconds).
    pub timeout_secs: u64,
    /// Path that exchanges the current session for a new access token.
    pub refresh_path: String,
    /// Item download path; `{id}` is replaced by the item identifier.
    pub download_path: String,
}

/// SOAP partner interface settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SoapConfig {
    pub endpoint: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Lifetime assumed for a freshly acquired session token (seconds).
    pub token_ttl_secs: u64,
    /// Tokens this close to expiry are treated as invalid (seconds).
    pub refresh_margin_secs: u64,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
}

// ---------------------------------------------------------------------------
// Config::load()
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/shiplink/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("shiplink")
            .join("config.yaml")
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            min_workers: 1,
            initial_backoff_secs: 1.0,
            max_backoff_secs: 30.0,
            max_retries: 3,
            recovery_threshold: 10,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_factor_secs: 1.0,
        }
    }
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            timeout_secs: 30,
            refresh_path: "/auth/refresh".to_string(),
            download_path: "/items/{id}".to_string(),
        }
    }
}

impl Default for SoapConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8081/soap".to_string(),
            username: None,
            password: None,
            token_ttl_secs: 1800,
            refresh_margin_secs: 60,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"rate_limiting.max_workers"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

fn push(errors: &mut Vec<ValidationError>, field: &str, message: impl Into<String>) {
    errors.push(ValidationError {
        field: field.into(),
        message: message.into(),
    });
}

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // --- rate_limiting ---
        let rl = &self.rate_limiting;
        if rl.min_workers == 0 {
            push(&mut errors, "rate_limiting.min_workers", "must be greater than 0");
        }
        if rl.min_workers > rl.max_workers {
            push(
                &mut errors,
                "rate_limiting.min_workers",
                format!(
                    "min_workers ({}) must not exceed max_workers ({})",
                    rl.min_workers, rl.max_workers
                ),
            );
        }
        if !(rl.initial_backoff_secs.is_finite() && rl.initial_backoff_secs > 0.0) {
            push(
                &mut errors,
                "rate_limiting.initial_backoff_secs",
                "must be a positive number",
            );
        }
        if !(rl.max_backoff_secs.is_finite() && rl.max_backoff_secs > 0.0) {
            push(
                &mut errors,
                "rate_limiting.max_backoff_secs",
                "must be a positive number",
            );
        }
        if rl.initial_backoff_secs > rl.max_backoff_secs {
            push(
                &mut errors,
                "rate_limiting.initial_backoff_secs",
                format!(
                    "initial_backoff_secs ({}) must not exceed max_backoff_secs ({})",
                    rl.initial_backoff_secs, rl.max_backoff_secs
                ),
            );
        }
        if rl.recovery_threshold == 0 {
            push(
                &mut errors,
                "rate_limiting.recovery_threshold",
                "must be greater than 0",
            );
        }

        // --- retry ---
        if !(self.retry.backoff_factor_secs.is_finite() && self.retry.backoff_factor_secs > 0.0) {
            push(&mut errors, "retry.backoff_factor_secs", "must be a positive number");
        }

        // --- status ---
        if let Err(e) = self.status.check() {
            push(&mut errors, "status", e.to_string());
        }

        // --- rest ---
        if self.rest.base_url.trim().is_empty() {
            push(&mut errors, "rest.base_url", "must not be empty");
        }
        if self.rest.timeout_secs == 0 {
            push(&mut errors, "rest.timeout_secs", "must be greater than 0");
        }
        if !self.rest.refresh_path.starts_with('/') {
            push(&mut errors, "rest.refresh_path", "must start with '/'");
        }
        if !self.rest.download_path.contains("{id}") {
            push(
                &mut errors,
                "rest.download_path",
                "must contain the '{id}' placeholder",
            );
        }

        // --- soap ---
        if self.soap.endpoint.trim().is_empty() {
            push(&mut errors, "soap.endpoint", "must not be empty");
        }
        if self.soap.token_ttl_secs == 0 {
            push(&mut errors, "soap.token_ttl_secs", "must be greater than 0");
        }
        if self.soap.refresh_margin_secs >= self.soap.token_ttl_secs {
            push(
                &mut errors,
                "soap.refresh_margin_secs",
                format!(
                    "refresh_margin_secs ({}) must be less than token_ttl_secs ({})",
                    self.soap.refresh_margin_secs, self.soap.token_ttl_secs
                ),
            );
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            push(
                &mut errors,
                "logging.level",
                format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            );
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for constructing a [`Config`] programmatically.
///
/// Starts from [`Config::default`] and allows selective overrides.
///
/// # Example
///
/// ```rust,no_run
/// use shiplink_core::config::ConfigBuilder;
///
/// let config = ConfigBuilder::new()
///     .rest_base_url("https://api.example.com")
///     .max_workers(4)
///     .logging_level("debug")
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder initialised with [`Config::default`] values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- rate_limiting ---

    pub fn max_workers(mut self, n: usize) -> Self {
        self.config.rate_limiting.max_workers = n;
        self
    }

    pub fn min_workers(mut self, n: usize) -> Self {
        self.config.rate_limiting.min_workers = n;
        self
    }

    pub fn initial_backoff_secs(mut self, secs: f64) -> Self {
        self.config.rate_limiting.initial_backoff_secs = secs;
        self
    }

    pub fn max_backoff_secs(mut self, secs: f64) -> Self {
        self.config.rate_limiting.max_backoff_secs = secs;
        self
    }

    pub fn item_max_retries(mut self, n: u32) -> Self {
        self.config.rate_limiting.max_retries = n;
        self
    }

    pub fn recovery_threshold(mut self, n: u32) -> Self {
        self.config.rate_limiting.recovery_threshold = n;
        self
    }

    // --- retry ---

    pub fn request_max_retries(mut self, n: u32) -> Self {
        self.config.retry.max_retries = n;
        self
    }

    pub fn backoff_factor_secs(mut self, secs: f64) -> Self {
        self.config.retry.backoff_factor_secs = secs;
        self
    }

    // --- status ---

    pub fn status_policy(mut self, policy: StatusPolicy) -> Self {
        self.config.status = policy;
        self
    }

    // --- rest ---

    pub fn rest_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.rest.base_url = url.into();
        self
    }

    pub fn rest_timeout_secs(mut self, secs: u64) -> Self {
        self.config.rest.timeout_secs = secs;
        self
    }

    pub fn rest_refresh_path(mut self, path: impl Into<String>) -> Self {
        self.config.rest.refresh_path = path.into();
        self
    }

    pub fn rest_download_path(mut self, path: impl Into<String>) -> Self {
        self.config.rest.download_path = path.into();
        self
    }

    // --- soap ---

    pub fn soap_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.soap.endpoint = endpoint.into();
        self
    }

    pub fn soap_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.config.soap.username = Some(username.into());
        self.config.soap.password = Some(password.into());
        self
    }

    pub fn soap_token_ttl_secs(mut self, secs: u64) -> Self {
        self.config.soap.token_ttl_secs = secs;
        self
    }

    pub fn soap_refresh_margin_secs(mut self, secs: u64) -> Self {
        self.config.soap.refresh_margin_secs = secs;
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    // --- build ---

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
