//! Example sharing admission, circuit and session state through Redis.
//!
//! Start Redis, then run the example (from project root):
//! ```bash
//! docker run -p 6379:6379 redis:7-alpine
//! cargo run --example redis --features redis-storage
//! ```
//!
//! Run two instances at the same time in different terminals: they share one
//! limit of 20 requests per 10 seconds, and a session created by one is
//! resolved by the other through the printed id.

use resilience_gate::{
    CircuitBreaker, CircuitBreakerConfig, Metrics, Policy, RateLimiter, RatePolicy, RedisStore,
    RedisStoreConfig, SessionCoordinator, SessionId, SystemClock,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().init();

    let config = RedisStoreConfig {
        key_prefix: "resilience-gate-demo:".to_string(),
    };
    let store = Arc::new(RedisStore::connect_with_config("redis://127.0.0.1:6379", config).await?);
    let clock = Arc::new(SystemClock::new());
    let metrics = Metrics::new();

    let limiter = RateLimiter::new(store.clone(), clock.clone(), metrics.clone());
    let policy = RatePolicy::new(Policy::sliding_window(20, Duration::from_secs(10))?)
        .with_store_timeout(Duration::from_millis(200))?;

    info!("=== Shared sliding window ===");
    let mut allowed = 0;
    for _ in 0..15 {
        let decision = limiter.admit("demo:client", &policy).await;
        if decision.allowed {
            allowed += 1;
        }
        if decision.degraded {
            warn!("Decision made without Redis");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    info!(allowed, of = 15, "This instance's share of the shared limit");

    info!("=== Shared circuit ===");
    let breaker = CircuitBreaker::with_config(
        store.clone(),
        clock.clone(),
        metrics.clone(),
        CircuitBreakerConfig::new(2, Duration::from_secs(15))?,
    )?;
    for _ in 0..3 {
        let result = breaker
            .execute("demo-dependency", || async { Err::<(), _>("unreachable") })
            .await;
        info!(?result, "Guarded call");
    }
    let state = breaker.state("demo-dependency").await;
    info!(state = state.as_str(), "Every instance now sees this circuit state");

    info!("=== Shared sessions ===");
    let sessions = SessionCoordinator::new(store.clone(), clock, metrics.clone());
    match std::env::args().nth(1) {
        Some(existing) => {
            let record = sessions.get(&SessionId::new(existing)).await;
            info!(?record, "Session created by another instance");
        }
        None => {
            let id = sessions.create("demo-user", json!({"instance": std::process::id()})).await?;
            info!(session = %id, "Pass this id to a second instance to resolve it there");
        }
    }

    info!(metrics = ?metrics.snapshot(), "Done");
    Ok(())
}
