//! Integration tests for the per-key registry.

use std::sync::Arc;
use std::time::Duration;

use skp_throttle::{
    AdmissionError, ConfigError, EvictionConfig, KeyedLimiter, ManualClock, PerKeyLimiter, Quota, SweepInterval,
    TokenBucket,
};
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn test_per_key_isolation() {
    let limiter = PerKeyLimiter::sliding_windows(
        &Quota::new(1, Duration::from_secs(60)),
        EvictionConfig::manual(Duration::from_secs(300)),
    )
    .unwrap();

    assert!(limiter.allow("a").await.unwrap(), "first a should be allowed");
    assert!(!limiter.allow("a").await.unwrap(), "second a should be denied");
    assert!(limiter.allow("b").await.unwrap(), "b should be allowed in the same instant");
}

#[tokio::test(start_paused = true)]
async fn test_idle_key_evicted_and_recreated_fresh() {
    let clock = ManualClock::new();
    let ttl = Duration::from_secs(5);
    let interval = Duration::from_secs(1);
    let limiter = PerKeyLimiter::token_buckets_with_clock(
        &Quota::per_hour(1),
        EvictionConfig::new(ttl, interval),
        clock.shared(),
    )
    .unwrap();

    assert!(limiter.allow("client").await.unwrap());
    assert!(!limiter.allow("client").await.unwrap());
    let stale = Arc::downgrade(&limiter.limiter("client"));

    clock.advance(ttl + interval + Duration::from_millis(1));
    tokio::time::sleep(interval * 2).await;
    assert!(!limiter.contains("client"), "idle entry should be swept");
    assert!(stale.upgrade().is_none(), "old limiter should be gone");

    assert!(limiter.allow("client").await.unwrap(), "fresh limiter should start full");

    limiter.stop().await;
}

#[tokio::test]
async fn test_stop_twice_and_drop() {
    let limiter = PerKeyLimiter::token_buckets(
        &Quota::per_second(10),
        EvictionConfig::new(Duration::from_secs(1), Duration::from_millis(5)),
    )
    .unwrap();

    limiter.stop().await;
    limiter.stop().await;
    assert!(!limiter.is_sweeping());

    let dropped = PerKeyLimiter::token_buckets(
        &Quota::per_second(10),
        EvictionConfig::new(Duration::from_secs(1), Duration::from_millis(5)),
    )
    .unwrap();
    drop(dropped);
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[tokio::test]
async fn test_custom_factory_and_keyed_wait() {
    let limiter = PerKeyLimiter::new(
        |_key: &str| TokenBucket::new(1.0, 100.0).expect("valid bucket"),
        EvictionConfig::manual(Duration::from_secs(60)),
    )
    .unwrap();

    assert!(limiter.allow("x").await.unwrap());
    let waited = tokio::time::timeout(Duration::from_secs(2), limiter.wait("x", std::future::pending())).await;
    assert_ok!(waited.expect("bucket should refill"));

    let err = assert_err!(limiter.wait_n("x", 2, std::future::pending()).await);
    assert!(matches!(err, AdmissionError::Unsatisfiable { .. }));
}

#[test]
fn test_sweeper_outside_runtime_is_rejected() {
    let result = PerKeyLimiter::sliding_windows(&Quota::per_second(1), EvictionConfig::default());
    let err = assert_err!(result);
    assert!(matches!(err, AdmissionError::Config(ConfigError::NoRuntime)));
}

#[test]
fn test_eviction_config_defaults() {
    let config = EvictionConfig::default();
    assert_eq!(config.ttl, Duration::from_secs(600));
    assert_eq!(config.interval, SweepInterval::Every(Duration::from_secs(60)));
}
