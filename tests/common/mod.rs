//! Shared setup for integration tests.

#![allow(dead_code)]

use resilience_gate::infrastructure::mocks::{FlakyStore, MockClock};
use resilience_gate::MemoryStore;
use std::sync::Arc;
use std::time::Duration;

/// Install a test-friendly subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// In-memory store on `clock` that can be switched into an outage.
pub fn flaky_store(clock: &MockClock) -> FlakyStore {
    FlakyStore::new(Arc::new(MemoryStore::new(Arc::new(clock.clone()))))
}

/// In-memory store on `clock` where every call takes `latency`, so concurrent
/// callers really interleave between reading and writing.
pub fn slow_store(clock: &MockClock, latency: Duration) -> FlakyStore {
    flaky_store(clock).with_latency(latency)
}
