//! Periodic background maintenance tasks.
//!
//! Used to evict expired entries from in-process caches. The shared store
//! stays authoritative, so a missed or late tick only costs memory.

use std::fmt;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Error returned when a background task does not stop cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
    /// The task panicked while running
    TaskPanicked,
    /// The task was cancelled before it could stop on its own
    TaskCancelled,
}

impl fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownError::TaskPanicked => write!(f, "cleanup task panicked"),
            ShutdownError::TaskCancelled => write!(f, "cleanup task was cancelled"),
        }
    }
}

impl std::error::Error for ShutdownError {}

/// Handle to a running cleanup task.
///
/// Dropping the handle also stops the task, at its next wake-up.
#[derive(Debug)]
pub struct CleanupHandle {
    name: &'static str,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl CleanupHandle {
    /// Spawn `tick` every `period` on the current tokio runtime.
    ///
    /// The first run happens one full period after spawning.
    pub(crate) fn spawn<F>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let period = period.max(Duration::from_millis(1));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => tick(),
                }
            }
            tracing::debug!(task = name, "Cleanup task stopped");
        });

        tracing::debug!(task = name, period_ms = period.as_millis() as u64, "Cleanup task started");
        Self {
            name,
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }

    /// Name given to the task, for logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the task is still running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop the task and wait for it to finish.
    ///
    /// # Errors
    /// Returns `ShutdownError` if the task panicked or was cancelled.
    pub async fn shutdown(mut self) -> Result<(), ShutdownError> {
        if let Some(tx) = self.shutdown_tx.take() {
            // The task may already be gone; joining below reports why
            let _ = tx.send(());
        }

        match self.task.await {
            Ok(()) => Ok(()),
            Err(e) if e.is_panic() => Err(ShutdownError::TaskPanicked),
            Err(_) => Err(ShutdownError::TaskCancelled),
        }
    }
}
