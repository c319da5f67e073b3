//! Integration tests for the redis queue driver.
//!
//! These tests need a running redis server.
//! Run with: REDIS_URL=redis://127.0.0.1:6379 cargo test --test redis_driver -- --ignored

use std::sync::Arc;
use std::time::Duration;

use job_forge::queue::{ManualClock, QueueDriver, RedisDriver};
use serde_json::json;

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

fn unique_prefix() -> String {
    format!("job-forge-test:{}:", uuid::Uuid::new_v4())
}

async fn driver_with_prefix(prefix: &str, clock: Arc<ManualClock>) -> RedisDriver {
    RedisDriver::connect("redis", &redis_url(), prefix, "default", clock)
        .await
        .expect("redis must be reachable at REDIS_URL")
}

/// A driver under a prefix no other test run uses.
async fn driver(clock: Arc<ManualClock>) -> RedisDriver {
    driver_with_prefix(&unique_prefix(), clock).await
}

#[tokio::test]
#[ignore] // Run with: cargo test --test redis_driver -- --ignored
async fn test_push_pop_is_fifo() {
    let driver = driver(Arc::new(ManualClock::starting_now())).await;

    let first = driver.push("echo", json!(1), None).await.expect("push");
    let second = driver.push("echo", json!(2), None).await.expect("push");
    assert_eq!(driver.size(None).await.expect("size"), 2);

    let job = driver.pop(None).await.expect("pop").expect("job");
    assert_eq!(job.id(), first);
    assert_eq!(job.attempts(), 1);
    assert_eq!(job.data(), &json!(1));

    let job = driver.pop(None).await.expect("pop").expect("job");
    assert_eq!(job.id(), second);
    assert!(driver.pop(None).await.expect("pop").is_none());
}

#[tokio::test]
#[ignore]
async fn test_delayed_jobs_migrate_when_due() {
    let clock = Arc::new(ManualClock::starting_now());
    let driver = driver(Arc::clone(&clock)).await;

    driver
        .later(Duration::from_secs(60), "echo", json!("later"), Some("mail"))
        .await
        .expect("later");
    assert_eq!(driver.size(Some("mail")).await.expect("size"), 0);
    assert!(driver.pop(Some("mail")).await.expect("pop").is_none());

    clock.advance(Duration::from_secs(61));
    assert_eq!(driver.size(Some("mail")).await.expect("size"), 1);
    let job = driver.pop(Some("mail")).await.expect("pop").expect("job");
    assert_eq!(job.data(), &json!("later"));

    driver.clear(Some("mail")).await.expect("clear");
}

#[tokio::test]
#[ignore]
async fn test_release_and_fail() {
    let clock = Arc::new(ManualClock::starting_now());
    let driver = driver(Arc::clone(&clock)).await;

    driver.push("fail", json!({}), None).await.expect("push");
    let job = driver.pop(None).await.expect("pop").expect("job");
    driver
        .release(&job, Duration::from_secs(5))
        .await
        .expect("release");
    assert_eq!(driver.size(None).await.expect("size"), 0);

    clock.advance(Duration::from_secs(5));
    let job = driver.pop(None).await.expect("pop").expect("job");
    assert_eq!(job.attempts(), 2);

    driver.fail(&job, "gave up").await.expect("fail");
    assert_eq!(driver.failed_size(None).await.expect("failed size"), 1);
    assert_eq!(driver.size(None).await.expect("size"), 0);
}

#[tokio::test]
#[ignore]
async fn test_clear_counts_ready_and_delayed() {
    let driver = driver(Arc::new(ManualClock::starting_now())).await;

    driver.push("echo", json!(null), None).await.expect("push");
    driver
        .later(Duration::from_secs(600), "echo", json!(null), None)
        .await
        .expect("later");

    assert_eq!(driver.clear(None).await.expect("clear"), 2);
    assert_eq!(driver.size(None).await.expect("size"), 0);
}

#[tokio::test]
#[ignore]
async fn test_malformed_payload_moves_to_failed_list() {
    use redis::AsyncCommands;

    let prefix = unique_prefix();
    let driver = driver_with_prefix(&prefix, Arc::new(ManualClock::starting_now())).await;

    let client = redis::Client::open(redis_url()).expect("client");
    let mut conn = client
        .get_multiplexed_async_connection()
        .await
        .expect("connection");
    conn.rpush::<_, _, ()>(format!("{}default", prefix), "{bad")
        .await
        .expect("rpush");
    let id = driver.push("echo", json!("ok"), None).await.expect("push");

    let job = driver.pop(None).await.expect("pop").expect("job");
    assert_eq!(job.id(), id);
    assert_eq!(driver.failed_size(None).await.expect("failed size"), 1);

    let parked: Vec<String> = conn
        .lrange(format!("{}default:failed", prefix), 0, -1)
        .await
        .expect("lrange");
    assert_eq!(parked, vec!["{bad".to_string()]);
}
