//! Store key namespaces.
//!
//! Every persisted record lives under a fixed prefix so records never collide
//! and an operator can inspect or flush one namespace at a time.

use crate::domain::policy::Algorithm;

/// Prefix for sliding window logs: `ratelimit:{algorithm}:{key}`.
pub const RATE_LIMIT_PREFIX: &str = "ratelimit:";
/// Prefix for token buckets: `tokenbucket:{key}`.
pub const TOKEN_BUCKET_PREFIX: &str = "tokenbucket:";
/// Prefix for circuit records: `circuit:{dependency}`.
pub const CIRCUIT_PREFIX: &str = "circuit:";
/// Prefix for session records: `session:{id}`.
pub const SESSION_PREFIX: &str = "session:";
/// Prefix for per-user session indexes: `sessionindex:{user}`.
pub const SESSION_INDEX_PREFIX: &str = "sessionindex:";

/// Key holding the admission state for `limiter_key` under `algorithm`.
pub fn admission_key(algorithm: Algorithm, limiter_key: &str) -> String {
    match algorithm {
        Algorithm::SlidingWindow => {
            format!("{}{}:{}", RATE_LIMIT_PREFIX, algorithm.as_str(), limiter_key)
        }
        Algorithm::TokenBucket => format!("{}{}", TOKEN_BUCKET_PREFIX, limiter_key),
    }
}

/// Key of the circuit record for a dependency.
pub fn circuit_key(dependency: &str) -> String {
    format!("{}{}", CIRCUIT_PREFIX, dependency)
}

/// Key of a session record.
pub fn session_key(session_id: &str) -> String {
    format!("{}{}", SESSION_PREFIX, session_id)
}

/// Key of the sorted set listing a user's sessions.
pub fn session_index_key(user_id: &str) -> String {
    format!("{}{}", SESSION_INDEX_PREFIX, user_id)
}
