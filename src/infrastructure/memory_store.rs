//! In-memory `SharedStore`.
//!
//! Suitable for a single process, for tests and for local development.
//! Every call, including a whole `atomic` batch, runs under one lock, which
//! gives the same isolation a real store gives across processes.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::application::ports::{Clock, Command, Reply, SharedStore, StoreError};

#[derive(Debug, Clone)]
enum Value {
    Bytes(Vec<u8>),
    SortedSet(HashMap<String, f64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at_ms: Option<u64>,
}

impl Entry {
    fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms.map_or(false, |at| now_ms >= at)
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Backend(format!(
        "WRONGTYPE operation against key {} holding the wrong kind of value",
        key
    ))
}

fn deadline(now_ms: u64, ttl: Duration) -> u64 {
    let ttl_ms: u64 = ttl.as_millis().try_into().unwrap_or(u64::MAX);
    now_ms.saturating_add(ttl_ms)
}

#[derive(Debug, Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
}

impl Keyspace {
    /// Live entry for `key`, dropping it first if it has expired.
    fn live(&mut self, key: &str, now_ms: u64) -> Option<&mut Entry> {
        if self
            .entries
            .get(key)
            .map_or(false, |entry| entry.is_expired(now_ms))
        {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn get(&mut self, key: &str, now_ms: u64) -> Result<Option<Vec<u8>>, StoreError> {
        match self.live(key, now_ms) {
            None => Ok(None),
            Some(Entry {
                value: Value::Bytes(bytes),
                ..
            }) => Ok(Some(bytes.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn set(&mut self, key: &str, value: Vec<u8>, ttl: Option<Duration>, now_ms: u64) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Bytes(value),
                expires_at_ms: ttl.map(|ttl| deadline(now_ms, ttl)),
            },
        );
    }

    fn del(&mut self, key: &str, now_ms: u64) -> bool {
        let existed = self.live(key, now_ms).is_some();
        self.entries.remove(key);
        existed
    }

    fn incr(&mut self, key: &str, now_ms: u64) -> Result<i64, StoreError> {
        if self.live(key, now_ms).is_none() {
            self.set(key, b"0".to_vec(), None, now_ms);
        }
        let entry = self
            .live(key, now_ms)
            .ok_or_else(|| StoreError::Backend("entry vanished".into()))?;
        let Value::Bytes(bytes) = &mut entry.value else {
            return Err(wrong_type(key));
        };
        let current: i64 = std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| StoreError::Backend("value is not an integer".into()))?;
        let next = current
            .checked_add(1)
            .ok_or_else(|| StoreError::Backend("increment would overflow".into()))?;
        *bytes = next.to_string().into_bytes();
        Ok(next)
    }

    fn expire(&mut self, key: &str, ttl: Duration, now_ms: u64) -> bool {
        match self.live(key, now_ms) {
            Some(entry) => {
                entry.expires_at_ms = Some(deadline(now_ms, ttl));
                true
            }
            None => false,
        }
    }

    fn zset_mut(
        &mut self,
        key: &str,
        now_ms: u64,
        create: bool,
    ) -> Result<Option<&mut HashMap<String, f64>>, StoreError> {
        if create && self.live(key, now_ms).is_none() {
            self.entries.insert(
                key.to_string(),
                Entry {
                    value: Value::SortedSet(HashMap::new()),
                    expires_at_ms: None,
                },
            );
        }
        match self.live(key, now_ms) {
            None => Ok(None),
            Some(Entry {
                value: Value::SortedSet(set),
                ..
            }) => Ok(Some(set)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    /// Sorted sets disappear once empty.
    fn drop_if_empty(&mut self, key: &str) {
        if let Some(Entry {
            value: Value::SortedSet(set),
            ..
        }) = self.entries.get(key)
        {
            if set.is_empty() {
                self.entries.remove(key);
            }
        }
    }

    fn zadd(&mut self, key: &str, member: &str, score: f64, now_ms: u64) -> Result<bool, StoreError> {
        let set = self
            .zset_mut(key, now_ms, true)?
            .ok_or_else(|| StoreError::Backend("entry vanished".into()))?;
        Ok(set.insert(member.to_string(), score).is_none())
    }

    fn zadd_capped(
        &mut self,
        key: &str,
        member: &str,
        score: f64,
        cap: u64,
        now_ms: u64,
    ) -> Result<bool, StoreError> {
        if self.zcard(key, now_ms)? >= cap {
            return Ok(false);
        }
        self.zadd(key, member, score, now_ms)
    }

    fn zrem(&mut self, key: &str, member: &str, now_ms: u64) -> Result<bool, StoreError> {
        let removed = match self.zset_mut(key, now_ms, false)? {
            Some(set) => set.remove(member).is_some(),
            None => false,
        };
        self.drop_if_empty(key);
        Ok(removed)
    }

    fn zrem_range_by_score(
        &mut self,
        key: &str,
        min: f64,
        max: f64,
        now_ms: u64,
    ) -> Result<u64, StoreError> {
        let removed = match self.zset_mut(key, now_ms, false)? {
            Some(set) => {
                let before = set.len();
                set.retain(|_, score| *score < min || *score > max);
                (before - set.len()) as u64
            }
            None => 0,
        };
        self.drop_if_empty(key);
        Ok(removed)
    }

    fn zrange_by_score(
        &mut self,
        key: &str,
        min: f64,
        max: f64,
        now_ms: u64,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        let mut members: Vec<(String, f64)> = match self.zset_mut(key, now_ms, false)? {
            Some(set) => set
                .iter()
                .filter(|(_, score)| **score >= min && **score <= max)
                .map(|(member, score)| (member.clone(), *score))
                .collect(),
            None => Vec::new(),
        };
        members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(members)
    }

    fn zcard(&mut self, key: &str, now_ms: u64) -> Result<u64, StoreError> {
        Ok(self
            .zset_mut(key, now_ms, false)?
            .map_or(0, |set| set.len() as u64))
    }

    fn zfirst(&mut self, key: &str, now_ms: u64) -> Result<Option<(String, f64)>, StoreError> {
        Ok(self
            .zrange_by_score(key, f64::NEG_INFINITY, f64::INFINITY, now_ms)?
            .into_iter()
            .next())
    }

    fn apply(&mut self, command: Command, now_ms: u64) -> Result<Reply, StoreError> {
        match command {
            Command::Set { key, value, ttl } => {
                self.set(&key, value, ttl, now_ms);
                Ok(Reply::Ok)
            }
            Command::Del { key } => Ok(Reply::Int(i64::from(self.del(&key, now_ms)))),
            Command::Expire { key, ttl } => {
                Ok(Reply::Int(i64::from(self.expire(&key, ttl, now_ms))))
            }
            Command::ZAdd { key, member, score } => {
                Ok(Reply::Int(i64::from(self.zadd(&key, &member, score, now_ms)?)))
            }
            Command::ZAddCapped {
                key,
                member,
                score,
                cap,
            } => {
                let added = self.zadd_capped(&key, &member, score, cap, now_ms)?;
                Ok(Reply::Int(i64::from(added)))
            }
            Command::ZRem { key, member } => {
                Ok(Reply::Int(i64::from(self.zrem(&key, &member, now_ms)?)))
            }
            Command::ZRemRangeByScore { key, min, max } => {
                let removed = self.zrem_range_by_score(&key, min, max, now_ms)?;
                Ok(Reply::Int(removed.try_into().unwrap_or(i64::MAX)))
            }
            Command::ZCard { key } => {
                let count = self.zcard(&key, now_ms)?;
                Ok(Reply::Int(count.try_into().unwrap_or(i64::MAX)))
            }
            Command::ZFirst { key } => Ok(Reply::Member(self.zfirst(&key, now_ms)?)),
        }
    }
}

/// `SharedStore` kept in process memory.
///
/// Key expiry follows the injected clock, so tests driving a `MockClock`
/// see keys expire exactly when the clock says so.
///
/// # Example
/// ```
/// use resilience_gate::infrastructure::memory_store::MemoryStore;
/// use resilience_gate::infrastructure::clock::SystemClock;
/// use resilience_gate::application::ports::SharedStore;
/// use std::sync::Arc;
///
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// let store = MemoryStore::new(Arc::new(SystemClock::new()));
/// store.set("greeting", b"hi".to_vec(), None).await.unwrap();
/// assert_eq!(store.get("greeting").await.unwrap(), Some(b"hi".to_vec()));
/// # });
/// ```
#[derive(Debug)]
pub struct MemoryStore {
    keyspace: Mutex<Keyspace>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create an empty store whose TTLs follow `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            keyspace: Mutex::new(Keyspace::default()),
            clock,
        }
    }

    fn keyspace(&self) -> MutexGuard<'_, Keyspace> {
        // A panic while holding the lock cannot leave an entry half-written,
        // every mutation is a single map operation.
        self.keyspace.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now_ms = self.clock.now_millis();
        let mut keyspace = self.keyspace();
        keyspace.entries.retain(|_, entry| !entry.is_expired(now_ms));
        keyspace.entries.len()
    }

    /// Whether no live keys remain.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining time to live of `key`, if it exists and has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now_ms = self.clock.now_millis();
        let mut keyspace = self.keyspace();
        let at = keyspace.live(key, now_ms)?.expires_at_ms?;
        Some(Duration::from_millis(at.saturating_sub(now_ms)))
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let now_ms = self.clock.now_millis();
        self.keyspace().get(key, now_ms)
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let now_ms = self.clock.now_millis();
        self.keyspace().set(key, value, ttl, now_ms);
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        let now_ms = self.clock.now_millis();
        Ok(self.keyspace().del(key, now_ms))
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let now_ms = self.clock.now_millis();
        self.keyspace().incr(key, now_ms)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now_ms = self.clock.now_millis();
        Ok(self.keyspace().expire(key, ttl, now_ms))
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let now_ms = self.clock.now_millis();
        self.keyspace().zadd(key, member, score, now_ms).map(|_| ())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let now_ms = self.clock.now_millis();
        self.keyspace().zrem(key, member, now_ms)
    }

    async fn zrem_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<u64, StoreError> {
        let now_ms = self.clock.now_millis();
        self.keyspace().zrem_range_by_score(key, min, max, now_ms)
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        let now_ms = self.clock.now_millis();
        self.keyspace().zcard(key, now_ms)
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        let now_ms = self.clock.now_millis();
        self.keyspace().zrange_by_score(key, min, max, now_ms)
    }

    async fn atomic(&self, commands: Vec<Command>) -> Result<Vec<Reply>, StoreError> {
        let now_ms = self.clock.now_millis();
        let mut keyspace = self.keyspace();
        commands
            .into_iter()
            .map(|command| keyspace.apply(command, now_ms))
            .collect()
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let now_ms = self.clock.now_millis();
        let mut keyspace = self.keyspace();
        let current = keyspace.get(key, now_ms)?;
        if current.as_deref() != expected {
            return Ok(false);
        }
        keyspace.set(key, new, ttl, now_ms);
        Ok(true)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
