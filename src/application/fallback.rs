//! In-process admission used while the shared store is unreachable.
//!
//! Entries are keyed by the same namespaced key the store uses, so each key is
//! limited by this instance alone during an outage. Fallback counts are never
//! merged back into the store once it recovers.

use std::sync::Arc;

use crate::application::ports::Storage;
use crate::domain::bucket::TokenBucketState;
use crate::domain::decision::AdmitResult;
use crate::domain::policy::{Policy, SlidingWindowPolicy, TokenBucketPolicy};
use crate::domain::window::WindowLog;
use crate::infrastructure::storage::ShardedStorage;

/// Local admission state for one key.
#[derive(Debug, Clone)]
pub enum LocalEntry {
    /// Sliding window log and the policy last applied to it
    Window {
        /// Admitted timestamps
        log: WindowLog,
        /// Policy last used for this key
        policy: SlidingWindowPolicy,
    },
    /// Token bucket and the policy last applied to it
    Bucket {
        /// Bucket state
        state: TokenBucketState,
        /// Policy last used for this key
        policy: TokenBucketPolicy,
    },
}

impl LocalEntry {
    fn fresh(policy: &Policy, now_ms: u64) -> Self {
        match policy {
            Policy::SlidingWindow(window) => LocalEntry::Window {
                log: WindowLog::new(),
                policy: *window,
            },
            Policy::TokenBucket(bucket) => LocalEntry::Bucket {
                state: TokenBucketState::full(bucket, now_ms),
                policy: *bucket,
            },
        }
    }

    fn is_idle(&self, now_ms: u64) -> bool {
        match self {
            LocalEntry::Window { log, policy } => log.is_idle(now_ms, policy.window_ms()),
            LocalEntry::Bucket { state, policy } => state.is_idle(now_ms, policy),
        }
    }
}

/// Per-key, per-instance admission over sharded in-process storage.
#[derive(Debug, Clone, Default)]
pub struct FallbackLimiter {
    storage: Arc<ShardedStorage<String, LocalEntry>>,
}

impl FallbackLimiter {
    /// Create an empty fallback limiter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide locally. The result is always marked degraded.
    ///
    /// The whole check runs while the key's shard entry is held, so
    /// concurrent callers in this process cannot over-admit.
    pub fn admit(&self, store_key: &str, policy: &Policy, cost: f64, now_ms: u64) -> AdmitResult {
        self.storage
            .with_entry_mut(
                store_key.to_string(),
                || LocalEntry::fresh(policy, now_ms),
                |entry| {
                    // The policy for a key may change between calls
                    let matches_kind = matches!(
                        (&*entry, policy),
                        (LocalEntry::Window { .. }, Policy::SlidingWindow(_))
                            | (LocalEntry::Bucket { .. }, Policy::TokenBucket(_))
                    );
                    if !matches_kind {
                        *entry = LocalEntry::fresh(policy, now_ms);
                    }

                    match (entry, policy) {
                        (
                            LocalEntry::Window {
                                log,
                                policy: stored,
                            },
                            Policy::SlidingWindow(window),
                        ) => {
                            *stored = *window;
                            log.admit(now_ms, window)
                        }
                        (
                            LocalEntry::Bucket {
                                state,
                                policy: stored,
                            },
                            Policy::TokenBucket(bucket),
                        ) => {
                            *stored = *bucket;
                            state.take(now_ms, bucket, cost)
                        }
                        // Reset above guarantees the kinds line up
                        _ => AdmitResult::fail_open(now_ms),
                    }
                },
            )
            .into_degraded()
    }

    /// Drop entries whose window has passed or whose bucket has refilled.
    ///
    /// Returns the number of entries removed.
    pub fn purge_idle(&self, now_ms: u64) -> usize {
        let before = self.storage.len();
        self.storage.retain(|_, entry| !entry.is_idle(now_ms));
        let removed = before.saturating_sub(self.storage.len());
        if removed > 0 {
            tracing::debug!(removed, "Purged idle fallback admission entries");
        }
        removed
    }

    /// Number of keys tracked locally.
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    /// Whether no keys are tracked locally.
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Forget all local state.
    pub fn clear(&self) {
        self.storage.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_sliding_window_fallback() {
        let fallback = FallbackLimiter::new();
        let policy = Policy::sliding_window(2, Duration::from_secs(1)).unwrap();

        let first = fallback.admit("ratelimit:sliding:k", &policy, 1.0, 0);
        assert!(first.allowed);
        assert!(first.degraded);
        assert!(fallback.admit("ratelimit:sliding:k", &policy, 1.0, 1).allowed);
        assert!(!fallback.admit("ratelimit:sliding:k", &policy, 1.0, 2).allowed);

        // Keys are independent
        assert!(fallback.admit("ratelimit:sliding:other", &policy, 1.0, 2).allowed);
    }

    #[test]
    fn test_token_bucket_fallback() {
        let fallback = FallbackLimiter::new();
        let policy = Policy::token_bucket(1.0, 1.0).unwrap();

        assert!(fallback.admit("tokenbucket:k", &policy, 1.0, 0).allowed);
        assert!(!fallback.admit("tokenbucket:k", &policy, 1.0, 100).allowed);
        assert!(fallback.admit("tokenbucket:k", &policy, 1.0, 1_000).allowed);
    }

    #[test]
    fn test_policy_kind_change_resets_entry() {
        let fallback = FallbackLimiter::new();
        let window = Policy::sliding_window(1, Duration::from_secs(10)).unwrap();
        let bucket = Policy::token_bucket(5.0, 1.0).unwrap();

        assert!(fallback.admit("k", &window, 1.0, 0).allowed);
        assert!(!fallback.admit("k", &window, 1.0, 1).allowed);
        assert!(fallback.admit("k", &bucket, 1.0, 2).allowed);
    }

    #[test]
    fn test_purge_idle() {
        let fallback = FallbackLimiter::new();
        let window = Policy::sliding_window(5, Duration::from_secs(1)).unwrap();
        let bucket = Policy::token_bucket(2.0, 1.0).unwrap();

        fallback.admit("a", &window, 1.0, 0);
        fallback.admit("b", &bucket, 1.0, 0);
        assert_eq!(fallback.len(), 2);

        assert_eq!(fallback.purge_idle(500), 0);
        assert_eq!(fallback.purge_idle(1_000), 2);
        assert!(fallback.is_empty());
    }
}
