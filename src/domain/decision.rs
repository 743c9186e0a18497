//! Outcome of an admission check.

use std::time::Duration;

/// Result of `RateLimiter::admit`.
///
/// Being over the limit is a normal result (`allowed == false`), never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmitResult {
    /// Whether the unit of work may proceed
    pub allowed: bool,
    /// Requests (or whole tokens) still available after this decision
    pub remaining: u64,
    /// Unix milliseconds at which the limit next relaxes
    pub reset_at_ms: u64,
    /// The decision was made without the shared store (fallback or fail-open)
    pub degraded: bool,
}

impl AdmitResult {
    /// An admitted decision.
    pub fn allowed(remaining: u64, reset_at_ms: u64) -> Self {
        Self {
            allowed: true,
            remaining,
            reset_at_ms,
            degraded: false,
        }
    }

    /// A rejected decision.
    pub fn denied(reset_at_ms: u64) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            reset_at_ms,
            degraded: false,
        }
    }

    /// Admit without consulting any state. Used when the store is down and
    /// the fallback is disabled.
    pub fn fail_open(now_ms: u64) -> Self {
        Self {
            allowed: true,
            remaining: 0,
            reset_at_ms: now_ms,
            degraded: true,
        }
    }

    /// Mark this decision as made in degraded mode.
    pub fn into_degraded(mut self) -> Self {
        self.degraded = true;
        self
    }

    /// Hint for a `Retry-After` style response.
    pub fn retry_after(&self, now_ms: u64) -> Duration {
        Duration::from_millis(self.reset_at_ms.saturating_sub(now_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_after() {
        let denied = AdmitResult::denied(1_500);
        assert_eq!(denied.retry_after(1_000), Duration::from_millis(500));
        // Past reset times never produce a negative hint
        assert_eq!(denied.retry_after(2_000), Duration::ZERO);
    }

    #[test]
    fn test_fail_open() {
        let result = AdmitResult::fail_open(42);
        assert!(result.allowed);
        assert!(result.degraded);
        assert_eq!(result.reset_at_ms, 42);
    }
}
