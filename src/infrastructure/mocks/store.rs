//! Shared store double that can simulate outages.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::application::ports::{Command, Reply, SharedStore, StoreError};

/// How `FlakyStore` answers calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Delegate to the wrapped store
    Healthy,
    /// Fail every call immediately with `StoreError::Unavailable`
    Failing,
    /// Never answer, so callers hit their deadlines
    Hanging,
    /// Answer normally, except that compare-and-swap always loses its race
    Conflicting,
}

impl StoreMode {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => StoreMode::Failing,
            2 => StoreMode::Hanging,
            3 => StoreMode::Conflicting,
            _ => StoreMode::Healthy,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            StoreMode::Healthy => 0,
            StoreMode::Failing => 1,
            StoreMode::Hanging => 2,
            StoreMode::Conflicting => 3,
        }
    }
}

/// Store operation, for modes that target a single kind of call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `get`
    Get,
    /// `set`
    Set,
    /// `del`
    Del,
    /// `incr`
    Incr,
    /// `expire`
    Expire,
    /// `zadd`
    ZAdd,
    /// `zrem`
    ZRem,
    /// `zrem_range_by_score`
    ZRemRangeByScore,
    /// `zcard`
    ZCard,
    /// `zrange_by_score`
    ZRangeByScore,
    /// `atomic`
    Atomic,
    /// `compare_and_swap`
    CompareAndSwap,
    /// `ping`
    Ping,
}

/// Wraps a real store and switches between healthy, failing, hanging and
/// conflicting, either for every call or for one `Operation`. An optional
/// latency is added to every call.
///
/// Clones share the same modes, latency and call counter.
///
/// # Examples
///
/// ```
/// use resilience_gate::infrastructure::mocks::{FlakyStore, StoreMode};
/// use resilience_gate::infrastructure::memory_store::MemoryStore;
/// use resilience_gate::infrastructure::clock::SystemClock;
/// use resilience_gate::application::ports::SharedStore;
/// use std::sync::Arc;
///
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// let store = FlakyStore::new(Arc::new(MemoryStore::new(Arc::new(SystemClock::new()))));
/// assert!(store.ping().await.is_ok());
///
/// store.set_mode(StoreMode::Failing);
/// assert!(store.ping().await.is_err());
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct FlakyStore {
    inner: Arc<dyn SharedStore>,
    mode: Arc<AtomicU8>,
    overrides: Arc<Mutex<HashMap<Operation, StoreMode>>>,
    latency_us: Arc<AtomicU64>,
    calls: Arc<AtomicU64>,
}

impl FlakyStore {
    /// Wrap `inner`, starting healthy.
    pub fn new(inner: Arc<dyn SharedStore>) -> Self {
        Self {
            inner,
            mode: Arc::new(AtomicU8::new(StoreMode::Healthy.as_u8())),
            overrides: Arc::new(Mutex::new(HashMap::new())),
            latency_us: Arc::new(AtomicU64::new(0)),
            calls: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Wrap `inner` with `latency` added to every call.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(latency);
        self
    }

    /// Change how subsequent calls are answered.
    pub fn set_mode(&self, mode: StoreMode) {
        self.mode.store(mode.as_u8(), Ordering::SeqCst);
    }

    /// Answer `operation` in `mode`, whatever the store-wide mode is.
    pub fn set_mode_for(&self, operation: Operation, mode: StoreMode) {
        if let Ok(mut overrides) = self.overrides.lock() {
            overrides.insert(operation, mode);
        }
    }

    /// Drop every per-operation mode.
    pub fn clear_operation_modes(&self) {
        if let Ok(mut overrides) = self.overrides.lock() {
            overrides.clear();
        }
    }

    /// Delay added to every call from now on.
    pub fn set_latency(&self, latency: Duration) {
        let micros = latency.as_micros().try_into().unwrap_or(u64::MAX);
        self.latency_us.store(micros, Ordering::SeqCst);
    }

    /// Store-wide mode.
    pub fn mode(&self) -> StoreMode {
        StoreMode::from_u8(self.mode.load(Ordering::SeqCst))
    }

    /// Mode that applies to `operation`.
    pub fn mode_for(&self, operation: Operation) -> StoreMode {
        self.overrides
            .lock()
            .ok()
            .and_then(|overrides| overrides.get(&operation).copied())
            .unwrap_or_else(|| self.mode())
    }

    /// Calls received so far, in any mode.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Apply latency and the mode for `operation`. Returns the mode so that
    /// `compare_and_swap` can act on `Conflicting`.
    async fn gate(&self, operation: Operation) -> Result<StoreMode, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = self.latency_us.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_micros(latency)).await;
        }
        let mode = self.mode_for(operation);
        match mode {
            StoreMode::Healthy | StoreMode::Conflicting => Ok(mode),
            StoreMode::Failing => Err(StoreError::Unavailable("simulated outage".into())),
            StoreMode::Hanging => {
                std::future::pending::<()>().await;
                Ok(mode)
            }
        }
    }
}

#[async_trait]
impl SharedStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.gate(Operation::Get).await?;
        self.inner.get(key).await
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.gate(Operation::Set).await?;
        self.inner.set(key, value, ttl).await
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        self.gate(Operation::Del).await?;
        self.inner.del(key).await
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        self.gate(Operation::Incr).await?;
        self.inner.incr(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.gate(Operation::Expire).await?;
        self.inner.expire(key, ttl).await
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        self.gate(Operation::ZAdd).await?;
        self.inner.zadd(key, member, score).await
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.gate(Operation::ZRem).await?;
        self.inner.zrem(key, member).await
    }

    async fn zrem_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<u64, StoreError> {
        self.gate(Operation::ZRemRangeByScore).await?;
        self.inner.zrem_range_by_score(key, min, max).await
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        self.gate(Operation::ZCard).await?;
        self.inner.zcard(key).await
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        self.gate(Operation::ZRangeByScore).await?;
        self.inner.zrange_by_score(key, min, max).await
    }

    async fn atomic(&self, commands: Vec<Command>) -> Result<Vec<Reply>, StoreError> {
        self.gate(Operation::Atomic).await?;
        self.inner.atomic(commands).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        if self.gate(Operation::CompareAndSwap).await? == StoreMode::Conflicting {
            return Ok(false);
        }
        self.inner.compare_and_swap(key, expected, new, ttl).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.gate(Operation::Ping).await?;
        self.inner.ping().await
    }
}
