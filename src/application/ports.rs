//! Ports (interfaces) for the application layer.
//!
//! In hexagonal architecture, ports define the interfaces that the application
//! layer needs. Infrastructure adapters implement these ports.

use async_trait::async_trait;
use std::fmt::{self, Debug};
use std::hash::Hash;
use std::time::Duration;

use crate::domain::error::ErrorKind;

/// Port for obtaining current time.
///
/// Time is expressed as Unix epoch milliseconds so that timestamps written by
/// one process instance mean the same thing to every other instance.
/// Infrastructure provides concrete implementations (SystemClock, MockClock).
pub trait Clock: Send + Sync + Debug {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> u64;
}

/// Error returned by a shared store operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached
    Unavailable(String),
    /// The operation did not finish within its deadline
    Timeout(Duration),
    /// The store answered with an error
    Backend(String),
    /// A stored value could not be encoded or decoded
    Codec(String),
    /// The store answered, but a compare-and-swap loop kept losing races on
    /// `key` until it ran out of attempts or time
    Contention {
        /// Contended key
        key: String,
        /// Swaps attempted before giving up
        attempts: u32,
    },
}

impl StoreError {
    /// Taxonomy of this error.
    ///
    /// An undecodable value reports `DependencyFailure`; everything else means
    /// the store could not serve the call in time.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Codec(_) => ErrorKind::DependencyFailure,
            StoreError::Unavailable(_)
            | StoreError::Timeout(_)
            | StoreError::Backend(_)
            | StoreError::Contention { .. } => ErrorKind::StoreUnavailable,
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Unavailable(reason) => write!(f, "store unavailable: {}", reason),
            StoreError::Timeout(after) => write!(f, "store call timed out after {:?}", after),
            StoreError::Backend(reason) => write!(f, "store error: {}", reason),
            StoreError::Codec(reason) => write!(f, "store value codec error: {}", reason),
            StoreError::Contention { key, attempts } => {
                write!(f, "contention on {} after {} attempts", key, attempts)
            }
        }
    }
}

impl std::error::Error for StoreError {}

/// One primitive operation inside an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Set a value with optional TTL
    Set {
        /// Key
        key: String,
        /// Value
        value: Vec<u8>,
        /// Time to live
        ttl: Option<Duration>,
    },
    /// Delete a key
    Del {
        /// Key
        key: String,
    },
    /// Set a key's time to live
    Expire {
        /// Key
        key: String,
        /// Time to live
        ttl: Duration,
    },
    /// Add a member to a sorted set
    ZAdd {
        /// Key
        key: String,
        /// Member
        member: String,
        /// Score
        score: f64,
    },
    /// Add a member only while the set holds fewer than `cap` members.
    /// Replies `Int(1)` when the member was added, `Int(0)` otherwise.
    ZAddCapped {
        /// Key
        key: String,
        /// Member
        member: String,
        /// Score
        score: f64,
        /// Cardinality the set must stay below for the add to happen
        cap: u64,
    },
    /// Remove a member from a sorted set
    ZRem {
        /// Key
        key: String,
        /// Member
        member: String,
    },
    /// Remove all members with `min <= score <= max`
    ZRemRangeByScore {
        /// Key
        key: String,
        /// Lower bound (inclusive)
        min: f64,
        /// Upper bound (inclusive)
        max: f64,
    },
    /// Count members of a sorted set
    ZCard {
        /// Key
        key: String,
    },
    /// The lowest-scored member of a sorted set, if any
    ZFirst {
        /// Key
        key: String,
    },
}

/// Reply to one `Command`, in batch order.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// The command returned nothing of interest
    Ok,
    /// A count or boolean-as-integer result
    Int(i64),
    /// A `(member, score)` result, absent when the set is empty
    Member(Option<(String, f64)>),
}

impl Reply {
    /// Integer payload, if this reply carries one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Reply::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Member payload, if this reply carries one.
    pub fn as_member(&self) -> Option<&(String, f64)> {
        match self {
            Reply::Member(m) => m.as_ref(),
            _ => None,
        }
    }
}

/// Port for the external key-value store used for cross-instance coordination.
///
/// Every operation is individually atomic. `atomic` composes several
/// operations into one atomic unit and `compare_and_swap` supports
/// read-modify-write loops. Any store offering these primitives satisfies
/// the contract; infrastructure provides `MemoryStore` and `RedisStore`.
#[async_trait]
pub trait SharedStore: Send + Sync + Debug {
    /// Read a value.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write a value, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>)
        -> Result<(), StoreError>;

    /// Delete a key. Returns whether it existed.
    async fn del(&self, key: &str) -> Result<bool, StoreError>;

    /// Increment an integer value, creating it at 0 first. Returns the new value.
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    /// Set a key's time to live. Returns whether the key exists.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Add or re-score a sorted set member.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError>;

    /// Remove a sorted set member. Returns whether it existed.
    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Remove members with `min <= score <= max`. Returns how many were removed.
    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64)
        -> Result<u64, StoreError>;

    /// Number of members in a sorted set.
    async fn zcard(&self, key: &str) -> Result<u64, StoreError>;

    /// Members with `min <= score <= max`, in ascending score order.
    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<(String, f64)>, StoreError>;

    /// Execute `commands` as one atomic unit, returning one reply per command.
    async fn atomic(&self, commands: Vec<Command>) -> Result<Vec<Reply>, StoreError>;

    /// Write `new` only if the current value equals `expected` (`None` meaning
    /// "absent"). Returns whether the swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    /// Check that the store answers.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Port for in-process concurrent key-value storage.
///
/// Used for state owned by a single process: the rate limiter's fallback
/// entries, the circuit breaker's local mirror and the session cache.
/// Infrastructure provides concrete implementations (ShardedStorage).
pub trait Storage<K, V>: Send + Sync + Debug
where
    K: Hash + Eq + Clone + Send + Sync,
    V: Send + Sync,
{
    /// Access an entry with mutable access, creating it if necessary.
    ///
    /// The accessor runs while the entry is exclusively held, so the whole
    /// read-modify-write is atomic with respect to other callers.
    fn with_entry_mut<F, R>(&self, key: K, factory: impl FnOnce() -> V, accessor: F) -> R
    where
        F: FnOnce(&mut V) -> R;

    /// Clone out a value.
    fn get_cloned(&self, key: &K) -> Option<V>
    where
        V: Clone;

    /// Insert or replace a value.
    fn insert(&self, key: K, value: V);

    /// Remove a value, returning it.
    fn remove(&self, key: &K) -> Option<V>;

    /// Get the number of entries in the storage.
    fn len(&self) -> usize;

    /// Check if the storage is empty.
    fn is_empty(&self) -> bool;

    /// Clear all entries from the storage.
    fn clear(&self);

    /// Remove entries for which the predicate returns false.
    fn retain<F>(&self, f: F)
    where
        F: FnMut(&K, &mut V) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_kinds() {
        assert_eq!(
            StoreError::Timeout(Duration::from_millis(50)).kind(),
            ErrorKind::StoreUnavailable
        );
        assert_eq!(
            StoreError::Codec("truncated".into()).kind(),
            ErrorKind::DependencyFailure
        );

        let contended = StoreError::Contention {
            key: "tokenbucket:user:7".into(),
            attempts: 16,
        };
        assert_eq!(contended.kind(), ErrorKind::StoreUnavailable);
        assert_eq!(
            contended.to_string(),
            "contention on tokenbucket:user:7 after 16 attempts"
        );
    }
}
