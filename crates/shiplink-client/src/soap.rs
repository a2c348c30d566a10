//! SOAP partner interface
//!
//! Every call fetches the shared session token from a
//! [`SharedTokenManager`] first, so concurrent callers never log in more
//! than once per token lifetime. A rejected token is invalidated (only if
//! nobody replaced it meanwhile) and the call fails with
//! [`ClientError::Unauthorized`]; the next call logs in again.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use quick_xml::{escape::escape, events::Event, Reader};
use reqwest::{header::CONTENT_TYPE, Client, Response, StatusCode};
use shiplink_core::{
    config::{Config, SoapConfig},
    domain::TokenState,
};
use tracing::{debug, info, warn};

use crate::{
    client::error_from_response,
    rate_limit::AdaptiveRateLimiter,
    retry::{RetryExecutor, RetryPolicy},
    token::{SharedTokenManager, TokenAcquirer, AUTH_HEADER_NS},
    ClientError,
};

/// SOAP 1.1 envelope namespace
pub const SOAP_ENV_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";

const SOAP_CONTENT_TYPE: &str = "text/xml; charset=utf-8";

/// SOAPAction of the login operation
const LOGIN_ACTION: &str = "Login";

/// Wraps `header` and `body` in a SOAP envelope.
pub fn build_envelope(header: &str, body: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\
         <soapenv:Envelope xmlns:soapenv=\"{SOAP_ENV_NS}\">\
         {header}<soapenv:Body>{body}</soapenv:Body></soapenv:Envelope>"
    )
}

async fn post_envelope(
    executor: &RetryExecutor,
    client: &Client,
    endpoint: &str,
    action: &str,
    envelope: &str,
) -> Result<Response, ClientError> {
    let response = executor
        .execute(|| {
            client
                .post(endpoint)
                .header(CONTENT_TYPE, SOAP_CONTENT_TYPE)
                .header("SOAPAction", action)
                .body(envelope.to_string())
                .send()
        })
        .await?;
    Ok(response)
}

// ============================================================================
// SoapClient
// ============================================================================

/// Client for the SOAP partner interface.
pub struct SoapClient {
    client: Client,
    endpoint: String,
    tokens: Arc<SharedTokenManager>,
    executor: RetryExecutor,
}

impl std::fmt::Debug for SoapClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoapClient")
            .field("endpoint", &self.endpoint)
            .field("tokens", &self.tokens)
            .finish()
    }
}

impl SoapClient {
    pub fn new(endpoint: impl Into<String>, tokens: Arc<SharedTokenManager>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            tokens,
            executor: RetryExecutor::default(),
        }
    }

    /// Creates a client for `soap.endpoint`, using the `retry` and `status`
    /// sections and the REST request timeout.
    pub fn from_config(
        config: &Config,
        tokens: Arc<SharedTokenManager>,
    ) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.rest.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint: config.soap.endpoint.clone(),
            tokens,
            executor: RetryExecutor::new(RetryPolicy::from(config)),
        })
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.executor = RetryExecutor::new(policy);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<AdaptiveRateLimiter>) -> Self {
        self.executor = self.executor.with_rate_limiter(limiter);
        self
    }

    pub fn tokens(&self) -> &Arc<SharedTokenManager> {
        &self.tokens
    }

    /// Invokes `action` with `body_xml` as the SOAP body and returns the raw
    /// response envelope.
    pub async fn call(&self, action: &str, body_xml: &str) -> Result<String, ClientError> {
        let token = self.tokens.get_valid_token().await?;
        let envelope = build_envelope(&self.tokens.build_soap_header(&token), body_xml);

        debug!(action, endpoint = %self.endpoint, "Sending SOAP request");
        let response =
            post_envelope(&self.executor, &self.client, &self.endpoint, action, &envelope).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            self.tokens.invalidate(&token);
            warn!(action, "SOAP session token rejected");
            return Err(ClientError::Unauthorized(format!(
                "session token rejected for {action}"
            )));
        }
        if !response.status().is_success() {
            return Err(error_from_response(response, &self.executor.policy().statuses).await);
        }

        Ok(response.text().await?)
    }
}

// ============================================================================
// SoapLoginAcquirer
// ============================================================================

/// Obtains session tokens through the `Login` SOAP operation.
pub struct SoapLoginAcquirer {
    client: Client,
    endpoint: String,
    username: String,
    password: String,
    token_ttl: chrono::Duration,
    executor: RetryExecutor,
}

impl std::fmt::Debug for SoapLoginAcquirer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoapLoginAcquirer")
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .field("token_ttl", &self.token_ttl)
            .finish_non_exhaustive()
    }
}

impl SoapLoginAcquirer {
    /// `token_ttl` is used when the login response carries no `ExpiresIn`.
    pub fn new(
        endpoint: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        token_ttl: Duration,
    ) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            username: username.into(),
            password: password.into(),
            token_ttl: chrono::Duration::from_std(token_ttl)
                .unwrap_or_else(|_| chrono::Duration::zero()),
            executor: RetryExecutor::default(),
        }
    }

    /// Fails with [`ClientError::Config`] when credentials are missing.
    pub fn from_config(soap: &SoapConfig) -> Result<Self, ClientError> {
        let (Some(username), Some(password)) = (&soap.username, &soap.password) else {
            return Err(ClientError::Config(
                "soap.username and soap.password are required".to_string(),
            ));
        };
        Ok(Self::new(
            soap.endpoint.clone(),
            username.clone(),
            password.clone(),
            Duration::from_secs(soap.token_ttl_secs),
        ))
    }

    fn login_body(&self) -> String {
        format!(
            "<Login xmlns=\"{AUTH_HEADER_NS}\"><Username>{}</Username><Password>{}</Password></Login>",
            escape(self.username.as_str()),
            escape(self.password.as_str()),
        )
    }
}

#[async_trait]
impl TokenAcquirer for SoapLoginAcquirer {
    async fn acquire(&self) -> Result<TokenState, ClientError> {
        let envelope = build_envelope("", &self.login_body());
        let response = post_envelope(
            &self.executor,
            &self.client,
            &self.endpoint,
            LOGIN_ACTION,
            &envelope,
        )
        .await?;

        let status = response.status();
        let body = response.text().await?;
        let login = parse_login_response(&body)?;

        if let Some(fault) = login.fault {
            return Err(ClientError::TokenAcquisition(fault));
        }
        if !status.is_success() {
            return Err(ClientError::TokenAcquisition(format!(
                "login failed with HTTP {}",
                status.as_u16()
            )));
        }
        let Some(token) = login.token else {
            return Err(ClientError::InvalidResponse(
                "login response has no Token element".to_string(),
            ));
        };

        let ttl = match login.expires_in {
            Some(secs) => lifetime_from_secs(secs)?,
            None => self.token_ttl,
        };
        let state = TokenState::with_ttl(token, ttl)
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        info!(user = %self.username, expires_at = %state.expires_at(), "Logged in");
        Ok(state)
    }
}

// ============================================================================
// Login response parsing
// ============================================================================

/// Converts an `ExpiresIn` value; it must be positive and representable.
fn lifetime_from_secs(secs: i64) -> Result<chrono::Duration, ClientError> {
    chrono::Duration::try_seconds(secs)
        .filter(|ttl| *ttl > chrono::Duration::zero())
        .ok_or_else(|| ClientError::InvalidResponse(format!("ExpiresIn out of range: {secs}")))
}

/// Fields of interest in a login response envelope
#[derive(Debug, Default, PartialEq, Eq)]
struct LoginResponse {
    token: Option<String>,
    expires_in: Option<i64>,
    fault: Option<String>,
}

/// Extracts `Token`, `ExpiresIn` and `faultstring` from a response
/// envelope, ignoring namespace prefixes.
fn parse_login_response(xml: &str) -> Result<LoginResponse, ClientError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut parsed = LoginResponse::default();
    let mut current_element = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                current_element = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
            }
            Ok(Event::Text(e)) => {
                let text = e
                    .unescape()
                    .map_err(|e| ClientError::InvalidResponse(e.to_string()))?
                    .to_string();
                match current_element.as_str() {
                    "Token" => parsed.token = Some(text),
                    "ExpiresIn" => parsed.expires_in = text.parse().ok(),
                    "faultstring" => parsed.fault = Some(text),
                    _ => {}
                }
            }
            Ok(Event::End(_)) => {
                current_element.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(ClientError::InvalidResponse(format!(
                    "malformed SOAP response: {e}"
                )));
            }
            _ => {}
        }
    }

    Ok(parsed)
}
