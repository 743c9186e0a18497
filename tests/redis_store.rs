//! Integration tests for the Redis store.
//!
//! These tests require a Redis instance running at `redis://127.0.0.1/`.
//! Tests are ignored by default - run with `cargo test --features redis-storage --test redis_store -- --ignored`

#![cfg(feature = "redis-storage")]

use resilience_gate::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, Command, Metrics, Policy, RateLimiter,
    RatePolicy, RedisStore, RedisStoreConfig, Reply, SessionCoordinator, SharedStore, SystemClock,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Check if Redis is available before running tests
async fn redis_available() -> bool {
    RedisStore::connect("redis://127.0.0.1/").await.is_ok()
}

/// Create a test store with a unique prefix
async fn create_test_store(test_name: &str) -> Arc<RedisStore> {
    let config = RedisStoreConfig {
        key_prefix: format!("test:{}:", test_name),
    };
    let store = RedisStore::connect_with_config("redis://127.0.0.1/", config)
        .await
        .expect("Failed to connect to Redis");
    store.flush_prefix().await.expect("Failed to flush test keys");
    Arc::new(store)
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_redis_basic_operations() {
    if !redis_available().await {
        eprintln!("Skipping test: Redis not available at redis://127.0.0.1/");
        return;
    }

    let store = create_test_store("basic").await;
    store.ping().await.unwrap();
    store.set("k", b"v".to_vec(), Some(Duration::from_secs(10))).await.unwrap();
    assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
    assert_eq!(store.incr("n").await.unwrap(), 1);
    assert!(store.del("k").await.unwrap());
    assert_eq!(store.get("k").await.unwrap(), None);
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_redis_compare_and_swap() {
    if !redis_available().await {
        eprintln!("Skipping test: Redis not available");
        return;
    }

    let store = create_test_store("cas").await;
    assert!(store.compare_and_swap("k", None, b"1".to_vec(), None).await.unwrap());
    assert!(!store.compare_and_swap("k", None, b"2".to_vec(), None).await.unwrap());
    assert!(store
        .compare_and_swap("k", Some(b"1"), b"2".to_vec(), Some(Duration::from_secs(5)))
        .await
        .unwrap());
    assert_eq!(store.get("k").await.unwrap(), Some(b"2".to_vec()));
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_redis_atomic_batch() {
    if !redis_available().await {
        eprintln!("Skipping test: Redis not available");
        return;
    }

    let store = create_test_store("atomic").await;
    let replies = store
        .atomic(vec![
            Command::ZAdd { key: "z".into(), member: "a".into(), score: 1.0 },
            Command::ZAdd { key: "z".into(), member: "b".into(), score: 2.0 },
            Command::ZRemRangeByScore { key: "z".into(), min: f64::NEG_INFINITY, max: 1.0 },
            Command::ZCard { key: "z".into() },
            Command::ZFirst { key: "z".into() },
        ])
        .await
        .unwrap();
    assert_eq!(replies[3].as_int(), Some(1));
    assert_eq!(replies[4].as_member(), Some(&("b".to_string(), 2.0)));
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_redis_capped_add_inside_transaction() {
    if !redis_available().await {
        eprintln!("Skipping test: Redis not available");
        return;
    }

    let store = create_test_store("capped").await;
    let capped = |member: &str| Command::ZAddCapped {
        key: "z".into(),
        member: member.into(),
        score: 1.0,
        cap: 2,
    };
    let replies = store
        .atomic(vec![capped("a"), capped("b"), capped("c"), Command::ZCard { key: "z".into() }])
        .await
        .unwrap();
    assert_eq!(
        replies,
        vec![Reply::Int(1), Reply::Int(1), Reply::Int(0), Reply::Int(2)]
    );
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_redis_components_end_to_end() {
    if !redis_available().await {
        eprintln!("Skipping test: Redis not available");
        return;
    }

    let store = create_test_store("e2e").await;
    let clock = Arc::new(SystemClock::new());
    let metrics = Metrics::new();

    let limiter = RateLimiter::new(store.clone(), clock.clone(), metrics.clone());
    let policy = RatePolicy::new(Policy::sliding_window(2, Duration::from_secs(60)).unwrap());
    assert!(limiter.admit("ip:1", &policy).await.allowed);
    assert!(limiter.admit("ip:1", &policy).await.allowed);
    let denied = limiter.admit("ip:1", &policy).await;
    assert!(!denied.allowed && !denied.degraded);

    let breaker = CircuitBreaker::with_config(
        store.clone(),
        clock.clone(),
        metrics.clone(),
        CircuitBreakerConfig::new(1, Duration::from_secs(60)).unwrap(),
    )
    .unwrap();
    let _ = breaker.execute("dep", || async { Err::<(), _>("down") }).await;
    assert_eq!(breaker.state("dep").await, CircuitState::Open);

    let sessions = SessionCoordinator::new(store.clone(), clock, metrics);
    let id = sessions.create("u1", json!({"k": "v"})).await.unwrap();
    assert_eq!(sessions.get(&id).await.unwrap().payload, json!({"k": "v"}));
    sessions.destroy(&id).await.unwrap();
    assert!(sessions.get(&id).await.is_none());

    store.flush_prefix().await.unwrap();
}
