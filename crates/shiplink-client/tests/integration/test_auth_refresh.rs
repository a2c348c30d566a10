//! 401 recovery through the refresh coordinator

use std::{sync::Arc, time::Duration};

use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use shiplink_client::{
    auth_refresh::AuthRefreshCoordinator, client::RestClient, ClientError,
};

use crate::common::{
    fast_policy, mount_download_for_token, mount_refresh, mount_unauthorized,
    refreshing_client,
};

#[tokio::test]
async fn test_expired_token_is_refreshed_and_request_replayed() {
    let server = MockServer::start().await;
    mount_download_for_token(&server, "SHP-1", "fresh-token", b"payload").await;
    mount_unauthorized(&server, "SHP-1").await;
    mount_refresh(&server, "fresh-token", Duration::ZERO, 1).await;

    let (client, coordinator) = refreshing_client(&server, "stale-token");
    let bytes = client.download("SHP-1").await.expect("replay should succeed");

    assert_eq!(bytes, b"payload");
    assert_eq!(client.access_token(), "fresh-token");
    assert!(!coordinator.is_refreshing());
}

#[tokio::test]
async fn test_concurrent_expiry_refreshes_once() {
    let server = MockServer::start().await;
    for i in 0..8 {
        let id = format!("SHP-{i}");
        mount_download_for_token(&server, &id, "fresh-token", b"payload").await;
        mount_unauthorized(&server, &id).await;
    }
    mount_refresh(&server, "fresh-token", Duration::from_millis(300), 1).await;

    let (client, _coordinator) = refreshing_client(&server, "stale-token");

    let mut handles = Vec::new();
    for i in 0..8 {
        let client = Arc::clone(&client);
        handles.push(tokio::spawn(async move {
            client.download(&format!("SHP-{i}")).await
        }));
    }

    let mut succeeded = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(bytes) => {
                assert_eq!(bytes, b"payload");
                succeeded += 1;
            }
            // Callers that hit the 401 while the refresh was running are not
            // made to wait for it
            Err(ClientError::Unauthorized(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    assert!(succeeded >= 1, "the refreshing caller must succeed");
    assert_eq!(client.access_token(), "fresh-token");
    // `expect(1)` on the refresh mock is verified when the server drops
}

#[tokio::test]
async fn test_refresh_that_reenters_coordinator_does_not_deadlock() {
    let server = MockServer::start().await;
    mount_unauthorized(&server, "SHP-1").await;

    // The refresh call itself is rejected, so the retrying client asks the
    // coordinator again from inside the refresh callback
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let (client, coordinator) = refreshing_client(&server, "stale-token");

    let result = tokio::time::timeout(Duration::from_secs(5), client.download("SHP-1"))
        .await
        .expect("refresh must not deadlock");

    assert!(matches!(result, Err(ClientError::Unauthorized(_))));
    assert_eq!(client.access_token(), "stale-token");
    assert!(!coordinator.is_refreshing());
}

#[tokio::test]
async fn test_refresh_recovers_on_later_request() {
    let server = MockServer::start().await;
    mount_download_for_token(&server, "SHP-1", "fresh-token", b"payload").await;
    mount_unauthorized(&server, "SHP-1").await;

    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(ResponseTemplate::new(401))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_refresh(&server, "fresh-token", Duration::ZERO, 1).await;

    let (client, _coordinator) = refreshing_client(&server, "stale-token");

    let first = client.download("SHP-1").await;
    assert!(matches!(first, Err(ClientError::Unauthorized(_))));

    let second = client.download("SHP-1").await.expect("second refresh succeeds");
    assert_eq!(second, b"payload");
}

#[tokio::test]
async fn test_malformed_refresh_response_fails_refresh() {
    let server = MockServer::start().await;
    mount_unauthorized(&server, "SHP-1").await;

    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .expect(1)
        .mount(&server)
        .await;

    let (client, _coordinator) = refreshing_client(&server, "stale-token");
    let result = client.download("SHP-1").await;

    assert!(matches!(result, Err(ClientError::Unauthorized(_))));
    assert_eq!(client.access_token(), "stale-token");
}

#[tokio::test]
async fn test_late_unauthorized_after_refresh_replays_without_refreshing_again() {
    let server = MockServer::start().await;
    mount_download_for_token(&server, "A", "fresh-token", b"payload-a").await;
    mount_download_for_token(&server, "B", "fresh-token", b"payload-b").await;
    mount_unauthorized(&server, "A").await;

    // B's rejection of the stale token arrives long after A's refresh is done
    Mock::given(method("GET"))
        .and(path("/items/B"))
        .respond_with(ResponseTemplate::new(401).set_delay(Duration::from_millis(300)))
        .mount(&server)
        .await;
    mount_refresh(&server, "fresh-token", Duration::ZERO, 1).await;

    let (client, _coordinator) = refreshing_client(&server, "stale-token");
    let (a, b) = tokio::join!(client.download("A"), client.download("B"));

    assert_eq!(a.expect("A is replayed after the refresh"), b"payload-a");
    assert_eq!(b.expect("B is replayed with the new token"), b"payload-b");
    // `expect(1)` on the refresh mock is verified when the server drops
}

#[tokio::test]
async fn test_refresh_uses_configured_paths() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/docs/SHP-1/pdf"))
        .and(header("Authorization", "Bearer fresh-token"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"pdf".to_vec()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/docs/SHP-1/pdf"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/session/renew"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "access_token": "fresh-token" })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = Arc::new(
        RestClient::new(server.uri())
            .with_retry_policy(fast_policy())
            .with_refresh_path("/session/renew")
            .with_download_path("/docs/{id}/pdf"),
    );
    client.set_access_token("stale-token");
    client.enable_auth_refresh(Arc::new(AuthRefreshCoordinator::new()));

    assert_eq!(client.download("SHP-1").await.unwrap(), b"pdf");
}
