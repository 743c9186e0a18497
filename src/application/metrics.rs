//! Observability metrics for admission, circuit breaking and sessions.
//!
//! A `Metrics` handle is created by the caller and passed to each component at
//! construction, so counters are scoped to whatever the caller chooses (one
//! per process, per tenant, per test) instead of living in globals.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Metrics tracking core statistics.
///
/// All metrics use atomic operations for thread-safe updates and reads.
/// Clones share the same counters.
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    requests_admitted: AtomicU64,
    requests_throttled: AtomicU64,
    degraded_decisions: AtomicU64,
    store_errors: AtomicU64,
    circuit_short_circuits: AtomicU64,
    circuits_opened: AtomicU64,
    dependency_failures: AtomicU64,
    fallback_invocations: AtomicU64,
    sessions_created: AtomicU64,
    sessions_resolved: AtomicU64,
    sessions_missed: AtomicU64,
    sessions_destroyed: AtomicU64,
    sessions_evicted: AtomicU64,
}

impl Metrics {
    /// Create a new metrics tracker.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_admitted(&self) {
        self.inner.requests_admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_throttled(&self) {
        self.inner.requests_throttled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_degraded(&self) {
        self.inner.degraded_decisions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_store_error(&self) {
        self.inner.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_short_circuit(&self) {
        self.inner
            .circuit_short_circuits
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_circuit_opened(&self) {
        self.inner.circuits_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dependency_failure(&self) {
        self.inner.dependency_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fallback(&self) {
        self.inner.fallback_invocations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_session_created(&self) {
        self.inner.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_session_resolved(&self) {
        self.inner.sessions_resolved.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_session_missed(&self) {
        self.inner.sessions_missed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_session_destroyed(&self) {
        self.inner.sessions_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_sessions_evicted(&self, count: u64) {
        self.inner
            .sessions_evicted
            .fetch_add(count, Ordering::Relaxed);
    }

    /// Requests admitted by the rate limiter.
    pub fn requests_admitted(&self) -> u64 {
        self.inner.requests_admitted.load(Ordering::Relaxed)
    }

    /// Requests rejected by the rate limiter.
    pub fn requests_throttled(&self) -> u64 {
        self.inner.requests_throttled.load(Ordering::Relaxed)
    }

    /// Admission decisions made without the shared store.
    pub fn degraded_decisions(&self) -> u64 {
        self.inner.degraded_decisions.load(Ordering::Relaxed)
    }

    /// Store calls that failed or timed out.
    pub fn store_errors(&self) -> u64 {
        self.inner.store_errors.load(Ordering::Relaxed)
    }

    /// Calls rejected because a circuit was open.
    pub fn circuit_short_circuits(&self) -> u64 {
        self.inner.circuit_short_circuits.load(Ordering::Relaxed)
    }

    /// Transitions into the open state observed by this process.
    pub fn circuits_opened(&self) -> u64 {
        self.inner.circuits_opened.load(Ordering::Relaxed)
    }

    /// Guarded operations that failed.
    pub fn dependency_failures(&self) -> u64 {
        self.inner.dependency_failures.load(Ordering::Relaxed)
    }

    /// Times a caller-supplied fallback ran.
    pub fn fallback_invocations(&self) -> u64 {
        self.inner.fallback_invocations.load(Ordering::Relaxed)
    }

    /// Sessions created.
    pub fn sessions_created(&self) -> u64 {
        self.inner.sessions_created.load(Ordering::Relaxed)
    }

    /// Session lookups that found a live session.
    pub fn sessions_resolved(&self) -> u64 {
        self.inner.sessions_resolved.load(Ordering::Relaxed)
    }

    /// Session lookups that reported absence (including fail-closed misses).
    pub fn sessions_missed(&self) -> u64 {
        self.inner.sessions_missed.load(Ordering::Relaxed)
    }

    /// Sessions destroyed explicitly.
    pub fn sessions_destroyed(&self) -> u64 {
        self.inner.sessions_destroyed.load(Ordering::Relaxed)
    }

    /// Local cache entries evicted by cleanup.
    pub fn sessions_evicted(&self) -> u64 {
        self.inner.sessions_evicted.load(Ordering::Relaxed)
    }

    /// Get a point-in-time snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_admitted: self.requests_admitted(),
            requests_throttled: self.requests_throttled(),
            degraded_decisions: self.degraded_decisions(),
            store_errors: self.store_errors(),
            circuit_short_circuits: self.circuit_short_circuits(),
            circuits_opened: self.circuits_opened(),
            dependency_failures: self.dependency_failures(),
            fallback_invocations: self.fallback_invocations(),
            sessions_created: self.sessions_created(),
            sessions_resolved: self.sessions_resolved(),
            sessions_missed: self.sessions_missed(),
            sessions_destroyed: self.sessions_destroyed(),
            sessions_evicted: self.sessions_evicted(),
        }
    }

    /// Reset all metrics to zero.
    ///
    /// Useful for testing or when starting a new monitoring period.
    pub fn reset(&self) {
        let inner = &self.inner;
        for counter in [
            &inner.requests_admitted,
            &inner.requests_throttled,
            &inner.degraded_decisions,
            &inner.store_errors,
            &inner.circuit_short_circuits,
            &inner.circuits_opened,
            &inner.dependency_failures,
            &inner.fallback_invocations,
            &inner.sessions_created,
            &inner.sessions_resolved,
            &inner.sessions_missed,
            &inner.sessions_destroyed,
            &inner.sessions_evicted,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// A point-in-time snapshot of metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    /// Requests admitted by the rate limiter
    pub requests_admitted: u64,
    /// Requests rejected by the rate limiter
    pub requests_throttled: u64,
    /// Admission decisions made without the shared store
    pub degraded_decisions: u64,
    /// Store calls that failed or timed out
    pub store_errors: u64,
    /// Calls rejected because a circuit was open
    pub circuit_short_circuits: u64,
    /// Transitions into the open state
    pub circuits_opened: u64,
    /// Guarded operations that failed
    pub dependency_failures: u64,
    /// Fallback invocations
    pub fallback_invocations: u64,
    /// Sessions created
    pub sessions_created: u64,
    /// Session lookups that found a live session
    pub sessions_resolved: u64,
    /// Session lookups that reported absence
    pub sessions_missed: u64,
    /// Sessions destroyed explicitly
    pub sessions_destroyed: u64,
    /// Local cache entries evicted
    pub sessions_evicted: u64,
}

impl MetricsSnapshot {
    /// Calculate the throttle rate (0.0 to 1.0).
    ///
    /// Returns 0.0 if no admission decisions have been made.
    pub fn throttle_rate(&self) -> f64 {
        let total = self.total_decisions();
        if total == 0 {
            0.0
        } else {
            self.requests_throttled as f64 / total as f64
        }
    }

    /// Total admission decisions (admitted + throttled).
    pub fn total_decisions(&self) -> u64 {
        self.requests_admitted
            .saturating_add(self.requests_throttled)
    }
}
