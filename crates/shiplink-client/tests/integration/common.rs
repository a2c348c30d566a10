//! Shared test helpers for integration tests
//!
//! Provides wiremock-based mock server setup for the REST and SOAP
//! endpoints. Each helper mounts the necessary mock endpoints; the client
//! constructors point at the mock server and use millisecond backoffs.

use std::{sync::Arc, time::Duration};

use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use shiplink_client::{
    auth_refresh::AuthRefreshCoordinator,
    client::RestClient,
    retry::RetryPolicy,
};

/// Retry policy with the default budget but a 10 ms backoff factor.
pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        backoff_factor: Duration::from_millis(10),
        ..RetryPolicy::default()
    }
}

/// A REST client for `server` holding `token`.
pub fn rest_client(server: &MockServer, token: &str) -> RestClient {
    let client = RestClient::new(server.uri()).with_retry_policy(fast_policy());
    client.set_access_token(token);
    client
}

/// A shared REST client for `server` with auth refresh wired to a fresh
/// coordinator, which is returned alongside.
pub fn refreshing_client(
    server: &MockServer,
    token: &str,
) -> (Arc<RestClient>, Arc<AuthRefreshCoordinator>) {
    let client = Arc::new(rest_client(server, token));
    let coordinator = Arc::new(AuthRefreshCoordinator::new());
    client.enable_auth_refresh(Arc::clone(&coordinator));
    (client, coordinator)
}

/// Mounts GET /items/{id} returning `content`.
pub async fn mount_download(server: &MockServer, item_id: &str, content: &[u8]) {
    Mock::given(method("GET"))
        .and(path(format!("/items/{item_id}")))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(content.to_vec())
                .append_header("Content-Type", "application/octet-stream"),
        )
        .mount(server)
        .await;
}

/// Mounts GET /items/{id} returning `content` only for requests carrying
/// `Bearer {token}`.
pub async fn mount_download_for_token(
    server: &MockServer,
    item_id: &str,
    token: &str,
    content: &[u8],
) {
    Mock::given(method("GET"))
        .and(path(format!("/items/{item_id}")))
        .and(header("Authorization", format!("Bearer {token}").as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(content.to_vec()))
        .mount(server)
        .await;
}

/// Mounts a catch-all 401 for GET /items/{id}.
pub async fn mount_unauthorized(server: &MockServer, item_id: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/items/{item_id}")))
        .respond_with(ResponseTemplate::new(401))
        .mount(server)
        .await;
}

/// Mounts POST /auth/refresh issuing `new_token`, expected `times` times.
pub async fn mount_refresh(server: &MockServer, new_token: &str, delay: Duration, times: u64) {
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "access_token": new_token }))
                .set_delay(delay),
        )
        .expect(times)
        .mount(server)
        .await;
}

/// SOAP login response envelope carrying `token`.
pub fn login_response(token: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Body>
    <LoginResponse xmlns="urn:shiplink:auth">
      <Token>{token}</Token>
    </LoginResponse>
  </soap:Body>
</soap:Envelope>"#
    )
}
