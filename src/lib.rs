//! # resilience-gate
//!
//! Distributed admission control, circuit breaking and session coordination
//! for services running as several interchangeable instances behind a load
//! balancer. All cross-instance state lives in a shared key-value store
//! (Redis, or the bundled in-memory store), reached through the
//! [`SharedStore`] port.
//!
//! ## Quick Start
//!
//! ```rust
//! use resilience_gate::{
//!     AdmissionGate, CircuitBreaker, MemoryStore, Metrics, Outcome, Policy, PolicyTable,
//!     RateLimiter, RatePolicy, RequestContext, SystemClock,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
//! let clock = Arc::new(SystemClock::new());
//! let store = Arc::new(MemoryStore::new(clock.clone()));
//! let metrics = Metrics::new();
//!
//! let limiter = RateLimiter::new(store.clone(), clock.clone(), metrics.clone());
//! let policies = PolicyTable::new(RatePolicy::new(
//!     Policy::sliding_window(100, Duration::from_secs(60)).unwrap(),
//! ));
//! let gate = AdmissionGate::new(limiter, policies);
//! let breaker = CircuitBreaker::new(store, clock, metrics);
//!
//! let ctx = RequestContext::new("ip:1.2.3.4");
//! let outcome: Outcome<&str, String> = gate
//!     .handle(&ctx, || breaker.execute("payments-api", || async { Ok("paid") }))
//!     .await;
//! assert_eq!(outcome.status_code(), 200);
//! # });
//! ```
//!
//! ## Components
//!
//! ### Rate Limiter
//! - **Sliding window**: at most `max_requests` per trailing window, enforced
//!   with one atomic store batch per decision
//! - **Token bucket**: continuous refill with burst capacity and per-request cost
//! - **Fallback**: when the store fails or misses its deadline, decisions are
//!   made per instance and flagged `degraded`; over-limit is a normal result,
//!   never an error
//!
//! ### Circuit Breaker
//! - Closed / open / half-open per dependency, shared cluster-wide through the
//!   store
//! - Lazy reopening on the next call after `reset_timeout`, with a
//!   single-flight probe
//! - Optional fallback, and a local mirror used while the store is down
//!
//! ### Session Coordinator
//! - Cryptographically random ids, sliding expiration, per-user index
//! - Fails closed when the store is unreachable (configurable bounded
//!   staleness)
//! - Background cleanup of the local cache
//!
//! ## Configuration
//!
//! ```rust
//! use resilience_gate::ResilienceConfig;
//!
//! let settings = ResilienceConfig::from_json_str(r#"{
//!     "rateLimits": {
//!         "default": { "algorithm": "slidingWindow", "windowMs": 60000, "maxRequests": 100 }
//!     },
//!     "defaultCircuit": { "failureThreshold": 3, "resetTimeoutMs": 10000 }
//! }"#)
//! .unwrap()
//! .build()
//! .unwrap();
//! assert_eq!(settings.default_circuit.failure_threshold, 3);
//! ```
//!
//! ## Observability
//!
//! Every component records into an injected [`Metrics`] handle and logs through
//! `tracing`. The crate never installs a subscriber.
//!
//! ```rust
//! # use resilience_gate::Metrics;
//! let metrics = Metrics::new();
//! let snapshot = metrics.snapshot();
//! println!("Throttle rate: {:.2}%", snapshot.throttle_rate() * 100.0);
//! ```
//!
//! ## Errors
//!
//! Every request-path error reports an [`ErrorKind`]: `AdmissionDenied`,
//! `DependencyFailure`, `StoreUnavailable` or `Configuration`.

// Domain layer - pure business logic
pub mod domain;

// Application layer - orchestration
pub mod application;

// Infrastructure layer - external adapters
pub mod infrastructure;

// Re-export commonly used types for convenience
pub use domain::{
    circuit::{CircuitRecord, CircuitState},
    decision::AdmitResult,
    error::ErrorKind,
    policy::{Algorithm, Policy, PolicyError, RatePolicy, SlidingWindowPolicy, TokenBucketPolicy},
    session::{SessionId, SessionPatch, SessionRecord, SessionStatus},
    tier::PolicyTable,
};

pub use application::{
    cas::RetryConfig,
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, ExecuteError},
    cleanup::{CleanupHandle, ShutdownError},
    config::{
        CircuitSettings, ConfigError, RateLimitSettings, Resilience, ResilienceConfig,
        ResilienceSettings, SessionSettings,
    },
    gate::{AdmissionGate, Outcome, RequestContext},
    limiter::RateLimiter,
    metrics::{Metrics, MetricsSnapshot},
    ports::{Clock, Command, Reply, SharedStore, StoreError},
    session::{SessionConfig, SessionCoordinator, SessionError, SessionHealth, UpdateOutcome},
};

pub use infrastructure::{clock::SystemClock, memory_store::MemoryStore, storage::ShardedStorage};

#[cfg(feature = "redis-storage")]
pub use infrastructure::redis_store::{RedisStore, RedisStoreConfig};
