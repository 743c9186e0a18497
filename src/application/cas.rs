//! Compare-and-swap loops over the shared store.

use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

use crate::application::codec::RecordCodec;
use crate::application::deadline::bounded_until;
use crate::application::ports::{SharedStore, StoreError};

/// Retry behaviour for compare-and-swap loops.
///
/// Attempts are also bounded by the caller's timeout, which covers the whole
/// loop rather than each store call.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum attempts before giving up on a contended key.
    pub max_retries: u32,
    /// Upper bound of the random delay between attempts, in milliseconds.
    pub retry_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 16,
            retry_delay_ms: 2,
        }
    }
}

/// What a read-modify-write step wants to do with the record it was given.
pub(crate) enum Step<T, R> {
    /// Persist `T` and return `R` once the swap succeeds
    Write(T, R),
    /// Like `Write`, with a record-specific time to live
    WriteExpiring(T, Duration, R),
    /// Leave the record untouched and return `R`
    Keep(R),
}

/// Read-modify-write `key` atomically using compare-and-swap.
///
/// `step` receives the decoded current record (`None` when absent or
/// undecodable) and may be called several times under contention, so it must
/// be a pure function of its input.
///
/// The whole loop finishes within `timeout`. Running out of attempts or time
/// after losing at least one race reports `StoreError::Contention`, since the
/// store did answer; a first attempt that cannot finish reports the store
/// error itself.
pub(crate) async fn update<T, R, F>(
    store: &dyn SharedStore,
    key: &str,
    timeout: Duration,
    ttl: Option<Duration>,
    retry: &RetryConfig,
    mut step: F,
) -> Result<R, StoreError>
where
    T: RecordCodec,
    F: FnMut(Option<T>) -> Step<T, R>,
{
    let deadline = Instant::now() + timeout;
    let mut attempts = 0;

    loop {
        attempts += 1;
        let outcome = attempt::<T, R, F>(store, key, ttl, &mut step);
        match bounded_until(deadline, timeout, outcome).await {
            Ok(Some(result)) => return Ok(result),
            Ok(None) => {}
            Err(StoreError::Timeout(_)) if attempts > 1 => {
                return Err(contended(key, attempts));
            }
            Err(e) => return Err(e),
        }

        if attempts >= retry.max_retries {
            return Err(contended(key, attempts));
        }
        // Create rng here to avoid holding non-Send type across await
        let jitter = Duration::from_millis(rand::rng().random_range(0..retry.retry_delay_ms + 1));
        if Instant::now() + jitter >= deadline {
            return Err(contended(key, attempts));
        }
        tracing::trace!(key = %key, attempts, "Compare-and-swap conflict, retrying");
        tokio::time::sleep(jitter).await;
    }
}

fn contended(key: &str, attempts: u32) -> StoreError {
    tracing::debug!(key = %key, attempts, "Giving up on contended key");
    StoreError::Contention {
        key: key.to_string(),
        attempts,
    }
}

/// One read, step and swap. `None` means the swap lost a race.
async fn attempt<T, R, F>(
    store: &dyn SharedStore,
    key: &str,
    ttl: Option<Duration>,
    step: &mut F,
) -> Result<Option<R>, StoreError>
where
    T: RecordCodec,
    F: FnMut(Option<T>) -> Step<T, R>,
{
    let current = store.get(key).await?;
    let decoded = match current.as_deref() {
        Some(bytes) => match T::decode(bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Discarding undecodable record");
                None
            }
        },
        None => None,
    };

    let (record, ttl, result) = match step(decoded) {
        Step::Keep(result) => return Ok(Some(result)),
        Step::Write(record, result) => (record, ttl, result),
        Step::WriteExpiring(record, record_ttl, result) => (record, Some(record_ttl), result),
    };

    let bytes = record.encode()?;
    if store.compare_and_swap(key, current.as_deref(), bytes, ttl).await? {
        Ok(Some(result))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::bucket::TokenBucketState;
    use crate::infrastructure::memory_store::MemoryStore;
    use crate::infrastructure::mocks::{FlakyStore, MockClock, Operation, StoreMode};
    use std::sync::Arc;

    fn store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::new(Arc::new(MockClock::new(0))))
    }

    fn increment(current: Option<TokenBucketState>) -> Step<TokenBucketState, ()> {
        let mut state = current.unwrap_or(TokenBucketState {
            tokens: 0.0,
            last_refill_ms: 0,
        });
        state.tokens += 1.0;
        Step::Write(state, ())
    }

    #[tokio::test]
    async fn test_update_creates_and_modifies() {
        let store = store();
        let retry = RetryConfig::default();
        let timeout = Duration::from_millis(100);

        let created = update(store.as_ref(), "b", timeout, None, &retry, |current| {
            assert!(current.is_none());
            let state = TokenBucketState {
                tokens: 3.0,
                last_refill_ms: 0,
            };
            Step::Write(state, state.tokens)
        })
        .await
        .unwrap();
        assert_eq!(created, 3.0);

        let after = update(
            store.as_ref(),
            "b",
            timeout,
            None,
            &retry,
            |current: Option<TokenBucketState>| {
                let mut state = current.unwrap();
                state.tokens -= 1.0;
                Step::Write(state, state.tokens)
            },
        )
        .await
        .unwrap();
        assert_eq!(after, 2.0);
    }

    #[tokio::test]
    async fn test_keep_does_not_write() {
        let store = store();
        let result = update(
            store.as_ref(),
            "absent",
            Duration::from_millis(100),
            None,
            &RetryConfig::default(),
            |current: Option<TokenBucketState>| Step::Keep(current.is_some()),
        )
        .await
        .unwrap();
        assert!(!result);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_not_lost() {
        let store = store();
        let mut handles = Vec::new();

        for _ in 0..20 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let retry = RetryConfig {
                    max_retries: 1_000,
                    retry_delay_ms: 1,
                };
                update(
                    store.as_ref(),
                    "counter",
                    Duration::from_secs(1),
                    None,
                    &retry,
                    |current: Option<TokenBucketState>| {
                        let mut state = current.unwrap_or(TokenBucketState {
                            tokens: 0.0,
                            last_refill_ms: 0,
                        });
                        state.tokens += 1.0;
                        Step::Write(state, ())
                    },
                )
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let bytes = store.get("counter").await.unwrap().unwrap();
        assert_eq!(TokenBucketState::decode(&bytes).unwrap().tokens, 20.0);
    }

    #[tokio::test]
    async fn test_lost_races_report_contention() {
        let flaky = FlakyStore::new(store());
        flaky.set_mode_for(Operation::CompareAndSwap, StoreMode::Conflicting);
        let retry = RetryConfig {
            max_retries: 3,
            retry_delay_ms: 0,
        };

        let result = update(&flaky, "k", Duration::from_secs(1), None, &retry, increment).await;
        assert_eq!(
            result,
            Err(StoreError::Contention {
                key: "k".to_string(),
                attempts: 3,
            })
        );
        // Three reads and three swaps
        assert_eq!(flaky.calls(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_whole_loop_is_bounded_by_timeout() {
        let flaky = FlakyStore::new(store()).with_latency(Duration::from_millis(30));
        flaky.set_mode_for(Operation::CompareAndSwap, StoreMode::Conflicting);
        let timeout = Duration::from_millis(100);

        let started = tokio::time::Instant::now();
        let result = update(&flaky, "k", timeout, None, &RetryConfig::default(), increment).await;

        assert!(matches!(result, Err(StoreError::Contention { .. })));
        // Sixteen attempts at 60ms each would take close to a second
        assert!(started.elapsed() < timeout + Duration::from_millis(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_swap_that_never_answers_times_out() {
        let flaky = FlakyStore::new(store());
        flaky.set_mode_for(Operation::CompareAndSwap, StoreMode::Hanging);
        let timeout = Duration::from_millis(100);

        let started = tokio::time::Instant::now();
        let result = update(&flaky, "k", timeout, None, &RetryConfig::default(), increment).await;

        assert_eq!(result, Err(StoreError::Timeout(timeout)));
        assert!(started.elapsed() < timeout * 2);
    }
}
