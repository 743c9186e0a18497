//! Integration tests for store-backed admission control.

mod common;

use proptest::prelude::*;
use resilience_gate::infrastructure::mocks::{FlakyStore, MockClock};
use resilience_gate::{
    AdmitResult, MemoryStore, Metrics, Policy, RateLimiter, RatePolicy, RetryConfig,
};
use std::sync::Arc;
use std::time::Duration;

fn limiter(clock: &MockClock) -> RateLimiter {
    let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
    RateLimiter::new(store, Arc::new(clock.clone()), Metrics::new())
}

/// Limiter over a store where every call takes a millisecond, with the
/// default retry behaviour.
fn slow_limiter(clock: &MockClock) -> RateLimiter {
    let store = Arc::new(common::slow_store(clock, Duration::from_millis(1)));
    RateLimiter::new(store, Arc::new(clock.clone()), Metrics::new())
}

/// Admit `callers` requests for `key` concurrently and collect the results.
async fn burst(
    limiter: &RateLimiter,
    policy: &RatePolicy,
    key: &str,
    callers: usize,
) -> Vec<AdmitResult> {
    let mut tasks = Vec::with_capacity(callers);
    for _ in 0..callers {
        let limiter = limiter.clone();
        let policy = policy.clone();
        let key = key.to_string();
        tasks.push(tokio::spawn(async move { limiter.admit(&key, &policy).await }));
    }

    let mut results = Vec::with_capacity(callers);
    for task in tasks {
        results.push(task.await.unwrap());
    }
    results
}

fn allowed(results: &[AdmitResult]) -> usize {
    results.iter().filter(|r| r.allowed).count()
}

#[tokio::test]
async fn test_fourth_request_within_window_is_denied() {
    common::init_tracing();
    let clock = MockClock::new(1_700_000_000_000);
    let limiter = limiter(&clock);
    let policy = RatePolicy::new(Policy::sliding_window(3, Duration::from_millis(1_000)).unwrap());

    let mut results = Vec::new();
    for _ in 0..4 {
        results.push(limiter.admit("ip:1.2.3.4", &policy).await);
        clock.advance(Duration::from_millis(50));
    }

    assert!(results[..3].iter().all(|r| r.allowed));
    assert!(!results[3].allowed);
    assert_eq!(results[3].remaining, 0);
    assert!(results.iter().all(|r| !r.degraded));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sliding_window_never_exceeds_limit() {
    let clock = MockClock::new(1_700_000_000_000);
    let limiter = limiter(&clock);
    let policy = RatePolicy::new(Policy::sliding_window(10, Duration::from_secs(60)).unwrap());

    let mut tasks = Vec::new();
    for _ in 0..100 {
        let limiter = limiter.clone();
        let policy = policy.clone();
        tasks.push(tokio::spawn(async move {
            limiter.admit("hot-key", &policy).await
        }));
    }

    let mut allowed = 0;
    for task in tasks {
        if task.await.unwrap().allowed {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 10);
    assert_eq!(limiter.metrics().requests_throttled(), 90);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_token_bucket_loses_no_updates() {
    let clock = MockClock::new(1_700_000_000_000);
    // Enough attempts for every caller to win its swap eventually
    let limiter = limiter(&clock).with_retry(RetryConfig {
        max_retries: 1_000,
        retry_delay_ms: 1,
    });
    let policy = RatePolicy::new(Policy::token_bucket(20.0, 0.001).unwrap());

    let mut tasks = Vec::new();
    for _ in 0..60 {
        let limiter = limiter.clone();
        let policy = policy.clone();
        tasks.push(tokio::spawn(async move {
            limiter.admit("bucket", &policy).await
        }));
    }

    let mut allowed = 0;
    for task in tasks {
        let result = task.await.unwrap();
        assert!(!result.degraded);
        if result.allowed {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_contended_token_bucket_never_over_admits() {
    common::init_tracing();
    let clock = MockClock::new(1_700_000_000_000);
    let limiter = slow_limiter(&clock);
    let policy = RatePolicy::new(Policy::token_bucket(300.0, 0.001).unwrap())
        .with_store_timeout(Duration::from_secs(5))
        .unwrap();

    let results = burst(&limiter, &policy, "bucket", 400).await;

    let admitted = allowed(&results);
    assert!(admitted > 0);
    assert!(admitted <= 300, "admitted {} with capacity 300", admitted);
    assert!(results.iter().all(|r| !r.degraded));
    assert!(limiter.fallback().is_empty());
    assert_eq!(limiter.metrics().store_errors(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_sliding_window_law_holds_across_windows_under_load() {
    let clock = MockClock::new(1_700_000_000_000);
    let limiter = slow_limiter(&clock);
    let policy = RatePolicy::new(Policy::sliding_window(10, Duration::from_millis(1_000)).unwrap());

    // Bursts half a window apart: any two neighbours share one window
    let mut per_burst = Vec::new();
    for _ in 0..6 {
        let results = burst(&limiter, &policy, "hot-key", 50).await;
        assert!(results.iter().all(|r| !r.degraded));
        per_burst.push(allowed(&results));
        clock.advance(Duration::from_millis(500));
    }

    assert_eq!(per_burst[0], 10);
    for pair in per_burst.windows(2) {
        assert!(pair[0] + pair[1] <= 10, "bursts admitted {:?}", per_burst);
    }
    // Every full window reopens exactly the slots that left it
    assert_eq!(per_burst.iter().sum::<usize>(), 30);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_token_bucket_law_holds_across_refills_under_load() {
    let clock = MockClock::new(1_700_000_000_000);
    let limiter = slow_limiter(&clock);
    let policy = RatePolicy::new(Policy::token_bucket(20.0, 10.0).unwrap())
        .with_store_timeout(Duration::from_secs(1))
        .unwrap();

    let mut admitted = 0;
    for second in 0..5u32 {
        let results = burst(&limiter, &policy, "bucket", 60).await;
        assert!(results.iter().all(|r| !r.degraded));
        admitted += allowed(&results);

        let budget = 20 + 10 * second as usize;
        assert!(admitted <= budget, "admitted {} with budget {}", admitted, budget);
        clock.advance(Duration::from_secs(1));
    }
    assert!(admitted > 0);
}

#[tokio::test]
async fn test_token_bucket_refills_to_capacity() {
    let clock = MockClock::new(1_700_000_000_000);
    let limiter = limiter(&clock);
    let policy = RatePolicy::new(Policy::token_bucket(5.0, 1.0).unwrap());

    for _ in 0..5 {
        assert!(limiter.admit("k", &policy).await.allowed);
    }
    let empty = limiter.admit("k", &policy).await;
    assert!(!empty.allowed);
    assert_eq!(empty.reset_at_ms, 1_700_000_001_000);

    // capacity / refill_rate seconds later the bucket is full again
    clock.advance(Duration::from_secs(5));
    for _ in 0..5 {
        assert!(limiter.admit("k", &policy).await.allowed);
    }
    assert!(!limiter.admit("k", &policy).await.allowed);
}

#[tokio::test]
async fn test_keys_and_algorithms_are_independent() {
    let clock = MockClock::new(1_700_000_000_000);
    let limiter = limiter(&clock);
    let window = RatePolicy::new(Policy::sliding_window(1, Duration::from_secs(60)).unwrap());
    let bucket = RatePolicy::new(Policy::token_bucket(1.0, 0.01).unwrap());

    assert!(limiter.admit("a", &window).await.allowed);
    assert!(limiter.admit("b", &window).await.allowed);
    assert!(limiter.admit("a", &bucket).await.allowed);
    assert!(!limiter.admit("a", &window).await.allowed);
    assert!(!limiter.admit("a", &bucket).await.allowed);
}

#[tokio::test]
async fn test_instances_share_limits_through_the_store() {
    let clock = MockClock::new(1_700_000_000_000);
    let shared: Arc<FlakyStore> = Arc::new(common::flaky_store(&clock));
    let policy = RatePolicy::new(Policy::sliding_window(2, Duration::from_secs(60)).unwrap());

    let first = RateLimiter::new(shared.clone(), Arc::new(clock.clone()), Metrics::new());
    let second = RateLimiter::new(shared, Arc::new(clock.clone()), Metrics::new());

    assert!(first.admit("user:1", &policy).await.allowed);
    assert!(second.admit("user:1", &policy).await.allowed);
    assert!(!first.admit("user:1", &policy).await.allowed);
    assert!(!second.admit("user:1", &policy).await.allowed);
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
        .block_on(future)
}

proptest! {
    #[test]
    fn prop_sliding_window_admits_at_most_limit_per_window(
        limit in 1u32..8,
        window_ms in 10u64..500,
        gaps in prop::collection::vec(0u64..100, 1..80),
    ) {
        let clock = MockClock::new(1_000_000);
        let limiter = limiter(&clock);
        let policy = RatePolicy::new(
            Policy::sliding_window(limit, Duration::from_millis(window_ms)).unwrap(),
        );

        let mut admitted_at = Vec::new();
        block_on(async {
            let mut now = 1_000_000u64;
            for gap in &gaps {
                clock.advance(Duration::from_millis(*gap));
                now += gap;
                if limiter.admit("k", &policy).await.allowed {
                    admitted_at.push(now);
                }
            }
        });

        for (i, &t) in admitted_at.iter().enumerate() {
            let in_window = admitted_at[..=i]
                .iter()
                .filter(|&&earlier| earlier + window_ms > t)
                .count();
            prop_assert!(in_window <= limit as usize);
        }
    }

    #[test]
    fn prop_token_bucket_stays_within_capacity(
        capacity in 1u32..20,
        rate in 1u32..10,
        steps in prop::collection::vec((0u64..2_000, 1u32..4), 1..60),
    ) {
        let clock = MockClock::new(1_000_000);
        let limiter = limiter(&clock);
        let policy = RatePolicy::new(
            Policy::token_bucket(capacity as f64, rate as f64).unwrap(),
        );

        block_on(async {
            for (gap, cost) in &steps {
                clock.advance(Duration::from_millis(*gap));
                let cost = (*cost).min(capacity) as f64;
                let result = limiter.admit_with_cost("k", &policy, cost).await.unwrap();
                assert!(result.remaining <= capacity as u64);
            }
        });
    }
}
