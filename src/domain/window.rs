//! In-process sliding window log.
//!
//! Mirrors the store-side algorithm for a single process: prune, count,
//! conditionally record.

use std::collections::VecDeque;

use crate::domain::decision::AdmitResult;
use crate::domain::policy::SlidingWindowPolicy;

/// Timestamps (Unix ms) of admitted requests inside the trailing window.
///
/// # Example
/// ```
/// use resilience_gate::domain::window::WindowLog;
/// use resilience_gate::SlidingWindowPolicy;
/// use std::time::Duration;
///
/// let policy = SlidingWindowPolicy::new(2, Duration::from_secs(1)).unwrap();
/// let mut log = WindowLog::new();
///
/// assert!(log.admit(0, &policy).allowed);
/// assert!(log.admit(10, &policy).allowed);
/// assert!(!log.admit(20, &policy).allowed);
///
/// // The oldest entry leaves the window at 1000ms
/// assert!(log.admit(1_000, &policy).allowed);
/// ```
#[derive(Debug, Clone, Default)]
pub struct WindowLog {
    admitted: VecDeque<u64>,
}

impl WindowLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop entries at or before `now - window`.
    fn prune(&mut self, now_ms: u64, window_ms: u64) {
        let cutoff = now_ms.saturating_sub(window_ms);
        while let Some(&oldest) = self.admitted.front() {
            if oldest <= cutoff && now_ms >= window_ms {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }

    /// Decide whether a request at `now_ms` is admitted, recording it if so.
    pub fn admit(&mut self, now_ms: u64, policy: &SlidingWindowPolicy) -> AdmitResult {
        let window_ms = policy.window_ms();
        let limit = u64::from(policy.max_requests());
        self.prune(now_ms, window_ms);

        let count = self.admitted.len() as u64;
        if count < limit {
            self.admitted.push_back(now_ms);
            let oldest = self.admitted.front().copied().unwrap_or(now_ms);
            AdmitResult::allowed(limit - count - 1, oldest.saturating_add(window_ms))
        } else {
            let oldest = self.admitted.front().copied().unwrap_or(now_ms);
            AdmitResult::denied(oldest.saturating_add(window_ms))
        }
    }

    /// Number of entries currently recorded (may include expired ones until
    /// the next `admit`).
    pub fn len(&self) -> usize {
        self.admitted.len()
    }

    /// Whether nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.admitted.is_empty()
    }

    /// Whether every entry has left the window.
    pub fn is_idle(&self, now_ms: u64, window_ms: u64) -> bool {
        self.admitted
            .back()
            .map_or(true, |&newest| now_ms.saturating_sub(newest) >= window_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn policy(max: u32, window_ms: u64) -> SlidingWindowPolicy {
        SlidingWindowPolicy::new(max, Duration::from_millis(window_ms)).unwrap()
    }

    #[test]
    fn test_remaining_counts_down() {
        let policy = policy(3, 1_000);
        let mut log = WindowLog::new();

        assert_eq!(log.admit(100, &policy).remaining, 2);
        assert_eq!(log.admit(150, &policy).remaining, 1);
        assert_eq!(log.admit(200, &policy).remaining, 0);

        let denied = log.admit(250, &policy);
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.reset_at_ms, 1_100);
    }

    #[test]
    fn test_denied_requests_are_not_recorded() {
        let policy = policy(1, 1_000);
        let mut log = WindowLog::new();

        assert!(log.admit(5_000, &policy).allowed);
        for t in 5_001..5_010 {
            assert!(!log.admit(t, &policy).allowed);
        }
        assert_eq!(log.len(), 1);
        assert!(log.admit(6_000, &policy).allowed);
    }

    #[test]
    fn test_early_timestamps_do_not_underflow() {
        let policy = policy(1, 10_000);
        let mut log = WindowLog::new();

        assert!(log.admit(0, &policy).allowed);
        assert!(!log.admit(5, &policy).allowed);
    }

    #[test]
    fn test_idle_detection() {
        let mut log = WindowLog::new();
        assert!(log.is_idle(0, 1_000));

        log.admit(5_000, &policy(10, 1_000));
        assert!(!log.is_idle(5_500, 1_000));
        assert!(log.is_idle(6_000, 1_000));
    }
}
