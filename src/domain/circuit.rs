//! Circuit record and its transition law.
//!
//! Transitions are pure functions of the current record and the clock. The
//! OPEN -> HALF_OPEN move is evaluated lazily on access; nothing runs on a
//! timer.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitState {
    /// Calls pass through to the dependency
    Closed,
    /// Calls are short-circuited
    Open,
    /// A single probe call is testing whether the dependency recovered
    HalfOpen,
}

impl CircuitState {
    /// Lowercase name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// How a call should be treated given the current record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Circuit closed, invoke the dependency
    Pass,
    /// Cooldown elapsed, this caller may claim the probe
    Probe,
    /// Short-circuit without invoking the dependency
    Reject,
}

/// Shared per-dependency circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitRecord {
    /// Current state
    pub state: CircuitState,
    /// Failures since the circuit last closed
    pub consecutive_failures: u32,
    /// Unix milliseconds of the last state change
    pub last_transition_at_ms: u64,
}

impl CircuitRecord {
    /// A fresh, closed record.
    pub fn closed(now_ms: u64) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_transition_at_ms: now_ms,
        }
    }

    fn cooled_down(&self, now_ms: u64, reset_timeout: Duration) -> bool {
        let reset_ms: u64 = reset_timeout.as_millis().try_into().unwrap_or(u64::MAX);
        now_ms.saturating_sub(self.last_transition_at_ms) >= reset_ms
    }

    /// Classify a call arriving at `now_ms`.
    ///
    /// In `HalfOpen` a probe is already in flight, so callers are rejected
    /// until that probe reports. A probe that never reports is superseded
    /// after another `reset_timeout`.
    pub fn access(&self, now_ms: u64, reset_timeout: Duration) -> Access {
        match self.state {
            CircuitState::Closed => Access::Pass,
            CircuitState::Open | CircuitState::HalfOpen => {
                if self.cooled_down(now_ms, reset_timeout) {
                    Access::Probe
                } else {
                    Access::Reject
                }
            }
        }
    }

    /// Claim the probe: move to `HalfOpen` stamped with `now_ms`.
    pub fn begin_probe(&self, now_ms: u64) -> Self {
        Self {
            state: CircuitState::HalfOpen,
            consecutive_failures: self.consecutive_failures,
            last_transition_at_ms: now_ms,
        }
    }

    /// Apply a successful call.
    pub fn on_success(&self, now_ms: u64) -> Self {
        match self.state {
            CircuitState::Closed => Self {
                consecutive_failures: 0,
                ..*self
            },
            CircuitState::HalfOpen => Self::closed(now_ms),
            // A call admitted before the circuit opened finished late; the
            // probe decides recovery, not stragglers.
            CircuitState::Open => *self,
        }
    }

    /// Apply a failed call.
    pub fn on_failure(&self, now_ms: u64, failure_threshold: u32) -> Self {
        let failures = self.consecutive_failures.saturating_add(1);
        match self.state {
            CircuitState::Closed if failures >= failure_threshold => Self {
                state: CircuitState::Open,
                consecutive_failures: failures,
                last_transition_at_ms: now_ms,
            },
            CircuitState::Closed => Self {
                consecutive_failures: failures,
                ..*self
            },
            CircuitState::HalfOpen => Self {
                state: CircuitState::Open,
                consecutive_failures: failures,
                last_transition_at_ms: now_ms,
            },
            CircuitState::Open => Self {
                consecutive_failures: failures,
                ..*self
            },
        }
    }

    /// Unix milliseconds after which a probe may be attempted, if not closed.
    pub fn retry_at_ms(&self, reset_timeout: Duration) -> Option<u64> {
        match self.state {
            CircuitState::Closed => None,
            _ => {
                let reset_ms: u64 = reset_timeout.as_millis().try_into().unwrap_or(u64::MAX);
                Some(self.last_transition_at_ms.saturating_add(reset_ms))
            }
        }
    }
}
