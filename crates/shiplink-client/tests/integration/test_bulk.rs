//! Bulk downloads through the adaptive limiter

use std::{sync::Arc, time::Duration};

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use shiplink_client::{
    bulk::{BulkRunner, FetchOutcome},
    client::RestClient,
    rate_limit::{AdaptiveRateLimiter, LimiterConfig},
    retry::RetryPolicy,
};
use shiplink_core::domain::StatusPolicy;

use crate::common::{fast_policy, mount_download};

fn limiter(max_workers: usize) -> Arc<AdaptiveRateLimiter> {
    Arc::new(AdaptiveRateLimiter::new(
        LimiterConfig {
            max_workers,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            ..LimiterConfig::default()
        },
        StatusPolicy::default(),
    ))
}

/// Client that leaves every retry decision to the limiter.
fn single_shot_client(server: &MockServer) -> Arc<RestClient> {
    Arc::new(RestClient::new(server.uri()).with_retry_policy(RetryPolicy {
        max_retries: 0,
        ..fast_policy()
    }))
}

async fn run_downloads(
    runner: &BulkRunner,
    client: Arc<RestClient>,
    ids: &[&str],
) -> shiplink_client::bulk::BulkReport {
    let ids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
    runner
        .run(ids, move |id| {
            let client = Arc::clone(&client);
            async move {
                match client.download(&id).await {
                    Ok(_) => FetchOutcome::Done,
                    Err(e) => FetchOutcome::from(e),
                }
            }
        })
        .await
}

#[tokio::test]
async fn test_bulk_download_sorts_items_by_outcome() {
    let server = MockServer::start().await;

    mount_download(&server, "SHP-1", b"one").await;

    Mock::given(method("GET"))
        .and(path("/items/SHP-2"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_download(&server, "SHP-2", b"two").await;

    Mock::given(method("GET"))
        .and(path("/items/SHP-3"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let limiter = limiter(4);
    let runner = BulkRunner::new(Arc::clone(&limiter));
    let report = run_downloads(
        &runner,
        single_shot_client(&server),
        &["SHP-1", "SHP-2", "SHP-3"],
    )
    .await;

    let mut succeeded = report.succeeded.clone();
    succeeded.sort();
    assert_eq!(succeeded, vec!["SHP-1", "SHP-2"]);
    assert!(report.failed.is_empty());
    assert_eq!(report.fatal.len(), 1);
    assert_eq!(report.fatal[0].item_id, "SHP-3");
    assert!(report.cancelled.is_empty());
    assert!(!report.is_success());

    // SHP-2 recovered, so its retry record is gone
    assert_eq!(limiter.retry_count("SHP-2"), 0);
    assert_eq!(limiter.stats().success_count, 2);
}

#[tokio::test]
async fn test_persistently_throttled_item_is_given_up() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/items/SHP-9"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .expect(4)
        .mount(&server)
        .await;
    mount_download(&server, "SHP-1", b"one").await;

    let limiter = limiter(8);
    let runner = BulkRunner::new(Arc::clone(&limiter));
    let report =
        run_downloads(&runner, single_shot_client(&server), &["SHP-1", "SHP-9"]).await;

    assert_eq!(report.succeeded, vec!["SHP-1"]);
    assert_eq!(report.failed, vec!["SHP-9"]);
    assert_eq!(report.total(), 2);

    let stats = limiter.stats();
    assert_eq!(stats.rate_limit_count, 4);
    assert_eq!(stats.failed_items, vec!["SHP-9"]);
    assert_eq!(stats.pending_retries, 0);
    // 8 -> 4 -> 2 -> 1 -> 1
    assert_eq!(stats.active_workers, 1);
}

#[tokio::test]
async fn test_bulk_download_stops_on_cancellation() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/items/slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"late".to_vec())
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;

    let cancel = tokio_util::sync::CancellationToken::new();
    let runner = BulkRunner::new(limiter(1)).with_cancellation(cancel.clone());

    let trigger = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let report = tokio::time::timeout(
        Duration::from_secs(5),
        run_downloads(&runner, single_shot_client(&server), &["slow", "queued"]),
    )
    .await
    .expect("cancellation must end the run");
    trigger.await.unwrap();

    assert!(report.succeeded.is_empty());
    assert_eq!(report.cancelled, vec!["queued", "slow"]);
}
