//! Example of an API gateway guarding a flaky dependency.
//!
//! Runs entirely in process on the bundled `MemoryStore`:
//!
//! ```bash
//! RUST_LOG=resilience_gate=debug cargo run --example gateway
//! ```
//!
//! The output shows requests being throttled per tier, the circuit for a
//! failing dependency opening and later probing, and sessions expiring.

use resilience_gate::{
    MemoryStore, Outcome, RequestContext, ResilienceConfig, SessionPatch, SystemClock,
};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

const CONFIG: &str = r#"{
    "rateLimits": {
        "anonymous": { "algorithm": "slidingWindow", "windowMs": 1000, "maxRequests": 5 },
        "partner": { "algorithm": "tokenBucket", "capacity": 10, "refillRatePerSecond": 20 }
    },
    "defaultTier": "anonymous",
    "circuits": { "inventory": { "failureThreshold": 3, "resetTimeoutMs": 1000 } },
    "session": { "sessionTtlSeconds": 2, "cleanupIntervalSeconds": 1 }
}"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings = ResilienceConfig::from_json_str(CONFIG)?.build()?;
    let clock = Arc::new(SystemClock::new());
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let resilience = settings.assemble(store, clock);
    let gate = &resilience.gate;
    let breaker = &resilience.breaker;

    info!("=== Tiered admission ===");
    for (ctx, label) in [
        (RequestContext::new("ip:203.0.113.7"), "anonymous"),
        (RequestContext::new("partner:acme").with_tier("partner"), "partner"),
    ] {
        let mut statuses = Vec::new();
        for _ in 0..12 {
            let outcome: Outcome<(), String> = gate.handle(&ctx, || async { Ok(()) }).await;
            statuses.push(outcome.status_code());
        }
        info!(tier = label, ?statuses, "Burst of 12 requests");
    }

    info!("=== Circuit breaking ===");
    let healthy = Arc::new(AtomicU32::new(0));
    let ctx = RequestContext::new("partner:acme").with_tier("partner");
    for round in 0..8 {
        if round == 6 {
            info!("Dependency recovers, waiting for the reset timeout");
            healthy.store(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(1_100)).await;
        }
        let healthy = Arc::clone(&healthy);
        let outcome: Outcome<&str, String> = gate
            .handle(&ctx, move || {
                breaker.execute_with_fallback(
                    "inventory",
                    move || async move {
                        if healthy.load(Ordering::SeqCst) == 1 {
                            Ok("live stock")
                        } else {
                            Err("connection reset".to_string())
                        }
                    },
                    || async { Ok("cached stock") },
                )
            })
            .await;
        let circuit = breaker.state("inventory").await;
        info!(
            round,
            status = outcome.status_code(),
            circuit = circuit.as_str(),
            ?outcome,
            "Inventory lookup"
        );
    }

    info!("=== Sessions ===");
    let sessions = &resilience.sessions;
    let cleanup = sessions.start_cleanup();
    let id = sessions.create("alice", json!({"role": "admin"})).await?;
    sessions
        .update(&id, SessionPatch::new().with_payload_field("theme", json!("dark")))
        .await?;
    let resolved = sessions.get(&id).await;
    info!(session = ?resolved, "Resolved session");

    tokio::time::sleep(Duration::from_millis(2_500)).await;
    let present = sessions.get(&id).await.is_some();
    let health = sessions.health().await;
    info!(present, ?health, "After idling past the TTL");
    cleanup.shutdown().await?;

    let snapshot = resilience.metrics.snapshot();
    info!(
        admitted = snapshot.requests_admitted,
        throttled = snapshot.requests_throttled,
        throttle_rate = snapshot.throttle_rate(),
        circuits_opened = snapshot.circuits_opened,
        fallbacks = snapshot.fallback_invocations,
        "Final metrics"
    );

    Ok(())
}
