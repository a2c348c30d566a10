//! Retry policy against a live HTTP server

use std::{sync::Arc, time::Duration};

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use shiplink_client::{
    rate_limit::AdaptiveRateLimiter,
    retry::RetryPolicy,
    ClientError,
};

use crate::common::{fast_policy, mount_download, rest_client};

#[tokio::test]
async fn test_download_recovers_from_transient_errors() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/items/SHP-1"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    mount_download(&server, "SHP-1", b"label-pdf").await;

    let client = rest_client(&server, "token");
    let bytes = client.download("SHP-1").await.expect("download should succeed");

    assert_eq!(bytes, b"label-pdf");
}

#[tokio::test]
async fn test_download_gives_up_after_max_retries() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/items/SHP-2"))
        .respond_with(ResponseTemplate::new(500).set_body_string("backend down"))
        .expect(4)
        .mount(&server)
        .await;

    let client = rest_client(&server, "token");
    let err = client.download("SHP-2").await.unwrap_err();

    match err {
        ClientError::ServerError { status, body } => {
            assert_eq!(status, 500);
            assert_eq!(body, "backend down");
        }
        other => panic!("expected ServerError, got {other:?}"),
    }
}

#[tokio::test]
async fn test_non_retryable_status_is_not_retried() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/items/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such item"))
        .expect(1)
        .mount(&server)
        .await;

    let client = rest_client(&server, "token");
    let err = client.download("missing").await.unwrap_err();

    assert!(matches!(err, ClientError::Status { status: 404, .. }));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_rate_limit_error_carries_retry_after() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/items/SHP-3"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7"))
        .expect(1)
        .mount(&server)
        .await;

    let client = rest_client(&server, "token").with_retry_policy(RetryPolicy {
        max_retries: 0,
        ..fast_policy()
    });
    let err = client.download("SHP-3").await.unwrap_err();

    match err {
        ClientError::RateLimited {
            status,
            retry_after,
        } => {
            assert_eq!(status, 429);
            assert_eq!(retry_after, Some(Duration::from_secs(7)));
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }
}

#[tokio::test]
async fn test_retried_rate_limits_are_reported_to_limiter() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/items/SHP-4"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_download(&server, "SHP-4", b"ok").await;

    let limiter = Arc::new(AdaptiveRateLimiter::with_defaults());
    let client = rest_client(&server, "token").with_rate_limiter(Arc::clone(&limiter));

    assert_eq!(client.download("SHP-4").await.unwrap(), b"ok");

    let stats = limiter.stats();
    assert_eq!(stats.rate_limit_count, 1);
    assert_eq!(stats.active_workers, 5);
    assert_eq!(stats.current_backoff_secs, 0.0);
}

#[tokio::test]
async fn test_connection_refused_is_a_network_error() {
    // Bind and drop a server to get a port nothing listens on
    let uri = {
        let server = MockServer::start().await;
        server.uri()
    };

    let client = shiplink_client::client::RestClient::new(uri).with_retry_policy(RetryPolicy {
        max_retries: 1,
        ..fast_policy()
    });
    let err = client.download("SHP-5").await.unwrap_err();

    assert!(matches!(err, ClientError::Network(_)));
    assert!(err.is_transient());
}
