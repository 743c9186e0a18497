//! Store-backed admission control.
//!
//! The rate limiter decides whether a unit of work identified by a limiter key
//! may proceed, using state shared by every instance through the
//! `SharedStore`. When the store fails or misses its deadline the decision is
//! made by the in-process fallback (or fails open) and is marked degraded.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

use crate::application::cas::{self, RetryConfig, Step};
use crate::application::cleanup::CleanupHandle;
use crate::application::deadline::bounded;
use crate::application::fallback::FallbackLimiter;
use crate::application::metrics::Metrics;
use crate::application::ports::{Clock, Command, Reply, SharedStore, StoreError};
use crate::domain::bucket::TokenBucketState;
use crate::domain::decision::AdmitResult;
use crate::domain::keys;
use crate::domain::policy::{
    Policy, PolicyError, RatePolicy, SlidingWindowPolicy, TokenBucketPolicy,
};

/// Coordinates admission decisions across instances.
///
/// Cloning is cheap; clones share the store, fallback state and metrics.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    fallback: FallbackLimiter,
    metrics: Metrics,
    retry: RetryConfig,
}

impl RateLimiter {
    /// Create a new rate limiter.
    ///
    /// # Arguments
    /// * `store` - Shared store holding admission state for all instances
    /// * `clock` - Time source
    /// * `metrics` - Metrics tracker
    pub fn new(store: Arc<dyn SharedStore>, clock: Arc<dyn Clock>, metrics: Metrics) -> Self {
        Self {
            store,
            clock,
            fallback: FallbackLimiter::new(),
            metrics,
            retry: RetryConfig::default(),
        }
    }

    /// Override retry behaviour for token bucket compare-and-swap loops.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Decide whether one request for `key` is admitted.
    ///
    /// Never fails: an unreachable store produces a degraded decision.
    pub async fn admit(&self, key: &str, policy: &RatePolicy) -> AdmitResult {
        self.decide(key, policy, 1.0).await
    }

    /// Decide whether a request costing `cost` tokens is admitted.
    ///
    /// Cost applies to token bucket policies; sliding windows count each
    /// admitted request once.
    ///
    /// # Errors
    /// Returns `PolicyError::InvalidCost` if `cost` is not positive or
    /// exceeds the bucket capacity.
    pub async fn admit_with_cost(
        &self,
        key: &str,
        policy: &RatePolicy,
        cost: f64,
    ) -> Result<AdmitResult, PolicyError> {
        match policy.policy() {
            Policy::TokenBucket(bucket) => bucket.validate_cost(cost)?,
            Policy::SlidingWindow(_) => {
                if !(cost.is_finite() && cost > 0.0) {
                    return Err(PolicyError::InvalidCost {
                        cost,
                        capacity: f64::INFINITY,
                    });
                }
            }
        }
        Ok(self.decide(key, policy, cost).await)
    }

    /// Current time as seen by this limiter.
    pub(crate) fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    /// In-process state used during store outages.
    pub fn fallback(&self) -> &FallbackLimiter {
        &self.fallback
    }

    /// Get a reference to the metrics.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Purge idle fallback entries every `interval` in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_fallback_cleanup(&self, interval: Duration) -> CleanupHandle {
        let fallback = self.fallback.clone();
        let clock = Arc::clone(&self.clock);
        CleanupHandle::spawn("admission-fallback", interval, move || {
            fallback.purge_idle(clock.now_millis());
        })
    }

    async fn decide(&self, key: &str, policy: &RatePolicy, cost: f64) -> AdmitResult {
        let now_ms = self.clock.now_millis();
        let store_key = keys::admission_key(policy.policy().algorithm(), key);
        let timeout = policy.store_timeout();

        let result = match policy.policy() {
            Policy::SlidingWindow(window) => {
                self.sliding_window(&store_key, window, now_ms, timeout)
                    .await
            }
            Policy::TokenBucket(bucket) => {
                self.token_bucket(&store_key, bucket, cost, now_ms, timeout)
                    .await
            }
        };

        let decision = match result {
            Ok(decision) => decision,
            Err(e) => {
                self.metrics.record_store_error();
                self.metrics.record_degraded();
                if policy.fallback_enabled() {
                    tracing::warn!(
                        key = %key,
                        error = %e,
                        "Shared store unavailable, admitting against local fallback"
                    );
                    self.fallback
                        .admit(&store_key, policy.policy(), cost, now_ms)
                } else {
                    tracing::warn!(
                        key = %key,
                        error = %e,
                        "Shared store unavailable and fallback disabled, failing open"
                    );
                    AdmitResult::fail_open(now_ms)
                }
            }
        };

        if decision.allowed {
            self.metrics.record_admitted();
        } else {
            self.metrics.record_throttled();
            tracing::debug!(
                key = %key,
                reset_at_ms = decision.reset_at_ms,
                degraded = decision.degraded,
                "Request throttled"
            );
        }

        decision
    }

    /// Prune, conditionally insert, count and read the oldest entry in one
    /// atomic batch.
    ///
    /// The candidate entry is only added while the pruned window holds fewer
    /// than `max_requests` entries, so a rejected request never occupies a
    /// slot and concurrent callers can never both take the last one.
    async fn sliding_window(
        &self,
        store_key: &str,
        policy: &SlidingWindowPolicy,
        now_ms: u64,
        timeout: Duration,
    ) -> Result<AdmitResult, StoreError> {
        let window_ms = policy.window_ms();
        let limit = u64::from(policy.max_requests());
        let nonce: u64 = rand::rng().random();
        let member = format!("{}:{:016x}", now_ms, nonce);

        let mut commands = Vec::with_capacity(5);
        if now_ms >= window_ms {
            commands.push(Command::ZRemRangeByScore {
                key: store_key.to_string(),
                min: f64::NEG_INFINITY,
                max: (now_ms - window_ms) as f64,
            });
        }
        let added_at = commands.len();
        commands.push(Command::ZAddCapped {
            key: store_key.to_string(),
            member,
            score: now_ms as f64,
            cap: limit,
        });
        commands.push(Command::ZCard {
            key: store_key.to_string(),
        });
        commands.push(Command::ZFirst {
            key: store_key.to_string(),
        });
        commands.push(Command::Expire {
            key: store_key.to_string(),
            ttl: policy.window(),
        });

        let replies = bounded(timeout, self.store.atomic(commands)).await?;
        let malformed = || StoreError::Backend("malformed sliding window reply".into());
        let added = replies.get(added_at).and_then(Reply::as_int).ok_or_else(malformed)? == 1;
        let count = replies
            .get(added_at + 1)
            .and_then(Reply::as_int)
            .ok_or_else(malformed)?;
        let count = u64::try_from(count).unwrap_or(0);
        let oldest_ms = replies
            .get(added_at + 2)
            .and_then(Reply::as_member)
            .map_or(now_ms, |(_, score)| *score as u64);
        let reset_at_ms = oldest_ms.saturating_add(window_ms);

        if added {
            Ok(AdmitResult::allowed(limit.saturating_sub(count), reset_at_ms))
        } else {
            Ok(AdmitResult::denied(reset_at_ms))
        }
    }

    /// Refill and spend through a compare-and-swap loop on the bucket record.
    ///
    /// A loop that keeps losing races denies the request: the store is
    /// answering, so the local fallback must not admit on its behalf.
    async fn token_bucket(
        &self,
        store_key: &str,
        policy: &TokenBucketPolicy,
        cost: f64,
        now_ms: u64,
        timeout: Duration,
    ) -> Result<AdmitResult, StoreError> {
        // A bucket untouched for this long is full again, same as an absent one
        let idle_ttl = Duration::from_millis(policy.millis_to_refill(policy.capacity()).max(1_000));

        let result = cas::update(
            self.store.as_ref(),
            store_key,
            timeout,
            Some(idle_ttl),
            &self.retry,
            |current: Option<TokenBucketState>| {
                let mut state = current.unwrap_or_else(|| TokenBucketState::full(policy, now_ms));
                let decision = state.take(now_ms, policy, cost);
                Step::Write(state, decision)
            },
        )
        .await;

        match result {
            Err(StoreError::Contention { attempts, .. }) => {
                tracing::debug!(
                    key = %store_key,
                    attempts,
                    "Token bucket contended, denying request"
                );
                let retry_in = policy.millis_to_refill(cost).max(1);
                Ok(AdmitResult::denied(now_ms.saturating_add(retry_in)))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::memory_store::MemoryStore;
    use crate::infrastructure::mocks::{FlakyStore, MockClock, Operation, StoreMode};

    fn limiter() -> (RateLimiter, FlakyStore, MockClock) {
        let clock = MockClock::new(1_000_000);
        let memory = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let store = FlakyStore::new(memory);
        let limiter = RateLimiter::new(
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            Metrics::new(),
        );
        (limiter, store, clock)
    }

    fn sliding(max: u32, window_ms: u64) -> RatePolicy {
        RatePolicy::new(Policy::sliding_window(max, Duration::from_millis(window_ms)).unwrap())
    }

    #[tokio::test]
    async fn test_sliding_window_limit() {
        let (limiter, _store, clock) = limiter();
        let policy = sliding(3, 60_000);

        for expected_remaining in [2, 1, 0] {
            let result = limiter.admit("ip:1.2.3.4", &policy).await;
            assert!(result.allowed);
            assert!(!result.degraded);
            assert_eq!(result.remaining, expected_remaining);
            clock.advance(Duration::from_millis(10));
        }

        let denied = limiter.admit("ip:1.2.3.4", &policy).await;
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.reset_at_ms, 1_060_000);
        assert_eq!(denied.retry_after(clock.now_millis()), Duration::from_millis(59_970));
    }

    #[tokio::test]
    async fn test_sliding_window_recovers_after_window() {
        let (limiter, _store, clock) = limiter();
        let policy = sliding(1, 1_000);

        assert!(limiter.admit("k", &policy).await.allowed);
        assert!(!limiter.admit("k", &policy).await.allowed);
        clock.advance(Duration::from_millis(1_000));
        assert!(limiter.admit("k", &policy).await.allowed);
    }

    #[tokio::test]
    async fn test_rejected_entries_do_not_count() {
        let (limiter, _store, clock) = limiter();
        let policy = sliding(2, 1_000);

        assert!(limiter.admit("k", &policy).await.allowed);
        clock.advance(Duration::from_millis(500));
        assert!(limiter.admit("k", &policy).await.allowed);
        for _ in 0..5 {
            assert!(!limiter.admit("k", &policy).await.allowed);
        }

        // First entry leaves the window; exactly one slot opens
        clock.advance(Duration::from_millis(500));
        assert!(limiter.admit("k", &policy).await.allowed);
        assert!(!limiter.admit("k", &policy).await.allowed);
    }

    #[tokio::test]
    async fn test_rejected_request_leaves_no_entry() {
        let (limiter, store, clock) = limiter();
        let policy = sliding(2, 1_000);
        store.set_mode_for(Operation::ZRem, StoreMode::Failing);

        assert!(limiter.admit("k", &policy).await.allowed);
        assert!(limiter.admit("k", &policy).await.allowed);
        clock.advance(Duration::from_millis(10));
        let rejected = limiter.admit("k", &policy).await;
        assert!(!rejected.allowed);
        assert!(!rejected.degraded);

        // The rejected request left nothing behind, so the next window is whole
        clock.advance(Duration::from_millis(990));
        let first = limiter.admit("k", &policy).await;
        assert!(first.allowed);
        assert_eq!(first.remaining, 1);
        let second = limiter.admit("k", &policy).await;
        assert!(second.allowed);
        assert_eq!(second.remaining, 0);
        assert!(!limiter.admit("k", &policy).await.allowed);
    }

    #[tokio::test]
    async fn test_token_bucket_refill_and_cost() {
        let (limiter, _store, clock) = limiter();
        let policy = RatePolicy::new(Policy::token_bucket(10.0, 2.0).unwrap());

        let first = limiter.admit_with_cost("user:7", &policy, 10.0).await.unwrap();
        assert!(first.allowed);
        assert_eq!(first.remaining, 0);

        let denied = limiter.admit_with_cost("user:7", &policy, 3.0).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.reset_at_ms, clock.now_millis() + 1_500);

        clock.advance(Duration::from_millis(1_500));
        assert!(limiter.admit_with_cost("user:7", &policy, 3.0).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_contended_bucket_denies_without_fallback() {
        let (limiter, store, clock) = limiter();
        let limiter = limiter.with_retry(RetryConfig {
            max_retries: 4,
            retry_delay_ms: 0,
        });
        let policy = RatePolicy::new(Policy::token_bucket(10.0, 2.0).unwrap());
        store.set_mode_for(Operation::CompareAndSwap, StoreMode::Conflicting);

        let result = limiter.admit("user:7", &policy).await;
        assert!(!result.allowed);
        assert!(!result.degraded);
        assert_eq!(result.reset_at_ms, clock.now_millis() + 500);
        assert!(limiter.fallback().is_empty());

        let snapshot = limiter.metrics().snapshot();
        assert_eq!(snapshot.store_errors, 0);
        assert_eq!(snapshot.degraded_decisions, 0);
        assert_eq!(snapshot.requests_throttled, 1);

        store.clear_operation_modes();
        assert!(limiter.admit("user:7", &policy).await.allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_swap_falls_back() {
        let (limiter, store, _clock) = limiter();
        let policy = RatePolicy::new(Policy::token_bucket(10.0, 2.0).unwrap())
            .with_store_timeout(Duration::from_millis(50))
            .unwrap();
        store.set_mode_for(Operation::CompareAndSwap, StoreMode::Hanging);

        let result = limiter.admit("user:7", &policy).await;
        assert!(result.allowed);
        assert!(result.degraded);
    }

    #[tokio::test]
    async fn test_invalid_cost_is_rejected() {
        let (limiter, _store, _clock) = limiter();
        let bucket = RatePolicy::new(Policy::token_bucket(5.0, 1.0).unwrap());
        assert!(matches!(
            limiter.admit_with_cost("k", &bucket, 6.0).await,
            Err(PolicyError::InvalidCost { .. })
        ));
        assert!(limiter.admit_with_cost("k", &bucket, 0.0).await.is_err());
        assert!(limiter.admit_with_cost("k", &sliding(1, 1_000), -1.0).await.is_err());
    }

    #[tokio::test]
    async fn test_store_failure_uses_fallback() {
        let (limiter, store, _clock) = limiter();
        let policy = sliding(2, 60_000);
        store.set_mode(StoreMode::Failing);

        let first = limiter.admit("k", &policy).await;
        assert!(first.allowed);
        assert!(first.degraded);
        assert!(limiter.admit("k", &policy).await.allowed);
        assert!(!limiter.admit("k", &policy).await.allowed);

        let snapshot = limiter.metrics().snapshot();
        assert_eq!(snapshot.degraded_decisions, 3);
        assert_eq!(snapshot.store_errors, 3);
        assert_eq!(snapshot.requests_throttled, 1);
    }

    #[tokio::test]
    async fn test_store_failure_without_fallback_fails_open() {
        let (limiter, store, _clock) = limiter();
        let policy = sliding(1, 60_000).with_fallback(false);
        store.set_mode(StoreMode::Failing);

        for _ in 0..5 {
            let result = limiter.admit("k", &policy).await;
            assert!(result.allowed);
            assert!(result.degraded);
        }
        assert!(limiter.fallback().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_store_times_out_into_fallback() {
        let (limiter, store, _clock) = limiter();
        let policy = sliding(5, 60_000)
            .with_store_timeout(Duration::from_millis(50))
            .unwrap();
        store.set_mode(StoreMode::Hanging);

        let result = limiter.admit("k", &policy).await;
        assert!(result.allowed);
        assert!(result.degraded);
    }

    #[tokio::test]
    async fn test_recovery_does_not_merge_fallback_counts() {
        let (limiter, store, _clock) = limiter();
        let policy = sliding(1, 60_000);

        store.set_mode(StoreMode::Failing);
        assert!(limiter.admit("k", &policy).await.allowed);
        assert!(!limiter.admit("k", &policy).await.allowed);

        store.set_mode(StoreMode::Healthy);
        let result = limiter.admit("k", &policy).await;
        assert!(result.allowed);
        assert!(!result.degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_fallback_cleanup() {
        let (limiter, store, clock) = limiter();
        let policy = sliding(1, 1_000);
        store.set_mode(StoreMode::Failing);
        limiter.admit("a", &policy).await;
        limiter.admit("b", &policy).await;
        assert_eq!(limiter.fallback().len(), 2);

        clock.advance(Duration::from_secs(2));
        let handle = limiter.start_fallback_cleanup(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(limiter.fallback().is_empty());

        handle.shutdown().await.unwrap();
    }
}
