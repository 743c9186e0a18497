//! Token bucket state and its lazy refill arithmetic.

use serde::{Deserialize, Serialize};

use crate::domain::decision::AdmitResult;
use crate::domain::policy::TokenBucketPolicy;

/// Persisted token bucket: `(tokens, last_refill_ms)`.
///
/// Refill is a pure function of elapsed time; nothing refills in the
/// background. `0 <= tokens <= capacity` holds after every operation.
///
/// # Example
/// ```
/// use resilience_gate::domain::bucket::TokenBucketState;
/// use resilience_gate::TokenBucketPolicy;
///
/// let policy = TokenBucketPolicy::new(2.0, 1.0).unwrap();
/// let mut bucket = TokenBucketState::full(&policy, 0);
///
/// assert!(bucket.take(0, &policy, 1.0).allowed);
/// assert!(bucket.take(0, &policy, 1.0).allowed);
/// assert!(!bucket.take(0, &policy, 1.0).allowed);
///
/// // One second later one token has been refilled
/// assert!(bucket.take(1_000, &policy, 1.0).allowed);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketState {
    /// Tokens currently available
    pub tokens: f64,
    /// Unix milliseconds of the last refill
    pub last_refill_ms: u64,
}

impl TokenBucketState {
    /// A bucket created on first use: full.
    pub fn full(policy: &TokenBucketPolicy, now_ms: u64) -> Self {
        Self {
            tokens: policy.capacity(),
            last_refill_ms: now_ms,
        }
    }

    /// Apply the refill accrued since `last_refill_ms`.
    ///
    /// A clock that is behind the stored timestamp (another instance wrote
    /// it) accrues nothing and never moves `last_refill_ms` backwards.
    pub fn refill(&mut self, now_ms: u64, policy: &TokenBucketPolicy) {
        let elapsed_ms = now_ms.saturating_sub(self.last_refill_ms);
        let accrued = elapsed_ms as f64 / 1000.0 * policy.refill_rate_per_sec();
        self.tokens = (self.tokens + accrued).clamp(0.0, policy.capacity());
        self.last_refill_ms = self.last_refill_ms.max(now_ms);
    }

    /// Refill, then spend `cost` tokens if available.
    ///
    /// The refill is kept even when the request is rejected.
    pub fn take(&mut self, now_ms: u64, policy: &TokenBucketPolicy, cost: f64) -> AdmitResult {
        self.refill(now_ms, policy);

        if self.tokens >= cost {
            self.tokens = (self.tokens - cost).max(0.0);
            let until_full = policy.millis_to_refill(policy.capacity() - self.tokens);
            AdmitResult::allowed(self.tokens.floor() as u64, now_ms.saturating_add(until_full))
        } else {
            let until_affordable = policy.millis_to_refill(cost - self.tokens);
            AdmitResult::denied(now_ms.saturating_add(until_affordable))
        }
    }

    /// Whether the bucket would be full at `now_ms`, i.e. carries no state
    /// worth keeping.
    pub fn is_idle(&self, now_ms: u64, policy: &TokenBucketPolicy) -> bool {
        let mut probe = *self;
        probe.refill(now_ms, policy);
        probe.tokens >= policy.capacity()
    }
}
