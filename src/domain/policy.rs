//! Admission policies.
//!
//! A policy is validated once, when it is constructed, so that a running
//! limiter never has to reject a request because of bad configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::domain::error::ErrorKind;

/// Default deadline for a single shared-store round trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(100);

/// Error returned when a policy is constructed with invalid values.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyError {
    /// Sliding window `max_requests` must be greater than zero
    ZeroMaxRequests,
    /// Sliding window duration must be greater than zero
    ZeroWindow,
    /// Token bucket capacity must be finite and greater than zero
    InvalidCapacity(f64),
    /// Token bucket refill rate must be finite and greater than zero
    InvalidRefillRate(f64),
    /// Request cost must be positive and must not exceed the bucket capacity
    InvalidCost {
        /// Requested cost
        cost: f64,
        /// Bucket capacity
        capacity: f64,
    },
    /// Store timeout must be greater than zero
    ZeroStoreTimeout,
    /// Circuit failure threshold must be at least one
    ZeroFailureThreshold,
    /// Circuit reset timeout must be greater than zero
    ZeroResetTimeout,
    /// Session TTL must be greater than zero
    ZeroSessionTtl,
    /// Cleanup interval must be greater than zero
    ZeroCleanupInterval,
}

impl PolicyError {
    /// Taxonomy of this error.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }
}

impl fmt::Display for PolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyError::ZeroMaxRequests => write!(f, "max_requests must be greater than 0"),
            PolicyError::ZeroWindow => write!(f, "window duration must be greater than 0"),
            PolicyError::InvalidCapacity(c) => {
                write!(f, "capacity must be finite and greater than 0, got {}", c)
            }
            PolicyError::InvalidRefillRate(r) => {
                write!(f, "refill rate must be finite and greater than 0, got {}", r)
            }
            PolicyError::InvalidCost { cost, capacity } => {
                write!(f, "cost {} must be in (0, {}]", cost, capacity)
            }
            PolicyError::ZeroStoreTimeout => write!(f, "store timeout must be greater than 0"),
            PolicyError::ZeroFailureThreshold => {
                write!(f, "failure threshold must be at least 1")
            }
            PolicyError::ZeroResetTimeout => write!(f, "reset timeout must be greater than 0"),
            PolicyError::ZeroSessionTtl => write!(f, "session ttl must be greater than 0"),
            PolicyError::ZeroCleanupInterval => {
                write!(f, "cleanup interval must be greater than 0")
            }
        }
    }
}

impl std::error::Error for PolicyError {}

/// Admission algorithm, also used to namespace store keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Algorithm {
    /// Trailing-window request log
    SlidingWindow,
    /// Continuously refilled token bucket
    TokenBucket,
}

impl Algorithm {
    /// Short name used inside store keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::SlidingWindow => "sliding",
            Algorithm::TokenBucket => "tokenbucket",
        }
    }
}

/// Allow at most `max_requests` within any trailing `window`.
///
/// # Example
/// ```
/// use resilience_gate::SlidingWindowPolicy;
/// use std::time::Duration;
///
/// let policy = SlidingWindowPolicy::new(3, Duration::from_secs(1)).unwrap();
/// assert_eq!(policy.max_requests(), 3);
/// assert!(SlidingWindowPolicy::new(0, Duration::from_secs(1)).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingWindowPolicy {
    max_requests: u32,
    window: Duration,
}

impl SlidingWindowPolicy {
    /// Create a sliding window policy.
    ///
    /// # Errors
    /// Returns `PolicyError::ZeroMaxRequests` or `PolicyError::ZeroWindow`.
    pub fn new(max_requests: u32, window: Duration) -> Result<Self, PolicyError> {
        if max_requests == 0 {
            return Err(PolicyError::ZeroMaxRequests);
        }
        if window.as_millis() == 0 {
            return Err(PolicyError::ZeroWindow);
        }
        Ok(Self {
            max_requests,
            window,
        })
    }

    /// Maximum admitted requests per window.
    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Window length in milliseconds.
    pub fn window_ms(&self) -> u64 {
        self.window.as_millis().try_into().unwrap_or(u64::MAX)
    }
}

/// Token bucket with lazy, time-based refill.
///
/// # Example
/// ```
/// use resilience_gate::TokenBucketPolicy;
///
/// let policy = TokenBucketPolicy::new(10.0, 2.0).unwrap();
/// assert_eq!(policy.capacity(), 10.0);
/// assert!(TokenBucketPolicy::new(10.0, 0.0).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketPolicy {
    capacity: f64,
    refill_rate_per_sec: f64,
}

impl TokenBucketPolicy {
    /// Create a token bucket policy.
    ///
    /// # Errors
    /// Returns `PolicyError::InvalidCapacity` or `PolicyError::InvalidRefillRate`
    /// when a value is not finite or not strictly positive.
    pub fn new(capacity: f64, refill_rate_per_sec: f64) -> Result<Self, PolicyError> {
        if !capacity.is_finite() || capacity <= 0.0 {
            return Err(PolicyError::InvalidCapacity(capacity));
        }
        if !refill_rate_per_sec.is_finite() || refill_rate_per_sec <= 0.0 {
            return Err(PolicyError::InvalidRefillRate(refill_rate_per_sec));
        }
        Ok(Self {
            capacity,
            refill_rate_per_sec,
        })
    }

    /// Maximum number of tokens.
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Tokens added per second.
    pub fn refill_rate_per_sec(&self) -> f64 {
        self.refill_rate_per_sec
    }

    /// Check that a request cost can ever be satisfied by this bucket.
    pub fn validate_cost(&self, cost: f64) -> Result<(), PolicyError> {
        if !cost.is_finite() || cost <= 0.0 || cost > self.capacity {
            return Err(PolicyError::InvalidCost {
                cost,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Milliseconds needed to refill `tokens`.
    pub fn millis_to_refill(&self, tokens: f64) -> u64 {
        if tokens <= 0.0 {
            return 0;
        }
        (tokens / self.refill_rate_per_sec * 1000.0).ceil() as u64
    }
}

/// The algorithm and its parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Policy {
    /// Sliding window policy
    SlidingWindow(SlidingWindowPolicy),
    /// Token bucket policy
    TokenBucket(TokenBucketPolicy),
}

impl Policy {
    /// Create a sliding window policy.
    pub fn sliding_window(max_requests: u32, window: Duration) -> Result<Self, PolicyError> {
        SlidingWindowPolicy::new(max_requests, window).map(Policy::SlidingWindow)
    }

    /// Create a token bucket policy.
    pub fn token_bucket(capacity: f64, refill_rate_per_sec: f64) -> Result<Self, PolicyError> {
        TokenBucketPolicy::new(capacity, refill_rate_per_sec).map(Policy::TokenBucket)
    }

    /// Which algorithm this policy uses.
    pub fn algorithm(&self) -> Algorithm {
        match self {
            Policy::SlidingWindow(_) => Algorithm::SlidingWindow,
            Policy::TokenBucket(_) => Algorithm::TokenBucket,
        }
    }
}

/// A policy together with the per-policy store settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RatePolicy {
    policy: Policy,
    store_timeout: Duration,
    fallback_enabled: bool,
}

impl RatePolicy {
    /// Wrap a policy with the default store timeout and fallback enabled.
    pub fn new(policy: Policy) -> Self {
        Self {
            policy,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            fallback_enabled: true,
        }
    }

    /// Set the deadline for store calls made under this policy.
    ///
    /// # Errors
    /// Returns `PolicyError::ZeroStoreTimeout` if `timeout` is zero.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Result<Self, PolicyError> {
        if timeout.is_zero() {
            return Err(PolicyError::ZeroStoreTimeout);
        }
        self.store_timeout = timeout;
        Ok(self)
    }

    /// Enable or disable the in-process fallback.
    ///
    /// With the fallback disabled, a store outage makes the limiter fail open.
    pub fn with_fallback(mut self, enabled: bool) -> Self {
        self.fallback_enabled = enabled;
        self
    }

    /// The admission algorithm and parameters.
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Deadline for each store call.
    pub fn store_timeout(&self) -> Duration {
        self.store_timeout
    }

    /// Whether the in-process fallback is used during store outages.
    pub fn fallback_enabled(&self) -> bool {
        self.fallback_enabled
    }
}

impl From<Policy> for RatePolicy {
    fn from(policy: Policy) -> Self {
        RatePolicy::new(policy)
    }
}
