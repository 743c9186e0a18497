//! Deadlines for shared store calls.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use crate::application::ports::StoreError;

/// Run a store call under a deadline. An elapsed deadline becomes
/// `StoreError::Timeout`.
pub(crate) async fn bounded<T, F>(timeout: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(timeout)),
    }
}

/// Run a store call that must finish by `deadline`, a point shared by
/// several calls. `budget` is the total allowance reported on timeout.
pub(crate) async fn bounded_until<T, F>(
    deadline: Instant,
    budget: Duration,
    call: F,
) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout_at(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(budget)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_deadline_is_timeout() {
        let result: Result<(), StoreError> = bounded(Duration::from_millis(50), async {
            std::future::pending::<()>().await;
            Ok(())
        })
        .await;
        assert_eq!(result, Err(StoreError::Timeout(Duration::from_millis(50))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_deadline_covers_several_calls() {
        let budget = Duration::from_millis(100);
        let deadline = Instant::now() + budget;

        let first: Result<(), StoreError> = bounded_until(deadline, budget, async {
            tokio::time::sleep(Duration::from_millis(70)).await;
            Ok(())
        })
        .await;
        assert!(first.is_ok());

        let second: Result<(), StoreError> = bounded_until(deadline, budget, async {
            tokio::time::sleep(Duration::from_millis(70)).await;
            Ok(())
        })
        .await;
        assert_eq!(second, Err(StoreError::Timeout(budget)));
    }

    #[tokio::test]
    async fn test_inner_result_passes_through() {
        let ok: Result<u32, StoreError> = bounded(Duration::from_secs(1), async { Ok(7) }).await;
        assert_eq!(ok, Ok(7));

        let err: Result<u32, StoreError> = bounded(Duration::from_secs(1), async {
            Err(StoreError::Unavailable("down".into()))
        })
        .await;
        assert!(matches!(err, Err(StoreError::Unavailable(_))));
    }
}
