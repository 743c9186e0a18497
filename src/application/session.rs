//! Session coordination across process instances.
//!
//! Session records live in the shared store so that any instance can serve
//! any session. Each instance keeps a read-through cache, but the store is
//! authoritative: when it cannot be reached, lookups fail closed and report
//! the session as absent. A cached record is served during an outage only if
//! the store confirmed it within `stale_read_window` (zero by default).

use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::application::cas::{self, RetryConfig, Step};
use crate::application::cleanup::CleanupHandle;
use crate::application::codec::RecordCodec;
use crate::application::deadline::bounded;
use crate::application::metrics::Metrics;
use crate::application::ports::{Clock, Command, SharedStore, Storage, StoreError};
use crate::domain::error::ErrorKind;
use crate::domain::keys;
use crate::domain::policy::{PolicyError, DEFAULT_STORE_TIMEOUT};
use crate::domain::session::{SessionId, SessionPatch, SessionRecord};
use crate::infrastructure::storage::ShardedStorage;

/// Configuration for the session coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Sliding expiration period for new sessions (default: 30 minutes)
    pub ttl: Duration,
    /// Deadline for each store call
    pub store_timeout: Duration,
    /// How long a store-confirmed cached record may be served while the
    /// store is unreachable (default: zero, never)
    pub stale_read_window: Duration,
    /// Period of the local cache cleanup task (default: 60 seconds)
    pub cleanup_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30 * 60),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            stale_read_window: Duration::ZERO,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl SessionConfig {
    /// Create a validated configuration with the given TTL.
    ///
    /// # Errors
    /// Returns `PolicyError::ZeroSessionTtl` if `ttl` is zero.
    pub fn new(ttl: Duration) -> Result<Self, PolicyError> {
        let config = Self {
            ttl,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Set the store deadline.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Result<Self, PolicyError> {
        self.store_timeout = timeout;
        self.validate()?;
        Ok(self)
    }

    /// Allow serving store-confirmed cached records for up to `window`
    /// during a store outage.
    pub fn with_stale_read_window(mut self, window: Duration) -> Self {
        self.stale_read_window = window;
        self
    }

    /// Set the local cleanup period.
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Result<Self, PolicyError> {
        self.cleanup_interval = interval;
        self.validate()?;
        Ok(self)
    }

    /// Check every field.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.ttl.is_zero() {
            return Err(PolicyError::ZeroSessionTtl);
        }
        if self.store_timeout.is_zero() {
            return Err(PolicyError::ZeroStoreTimeout);
        }
        if self.cleanup_interval.is_zero() {
            return Err(PolicyError::ZeroCleanupInterval);
        }
        Ok(())
    }
}

/// Error returned by session operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The shared store could not be reached or answered with an error
    StoreUnavailable(StoreError),
    /// A session record could not be encoded
    Codec(String),
}

impl SessionError {
    /// Taxonomy of this error.
    ///
    /// An unreadable record is a fault of the data the store handed back, not
    /// an outage, so it reports `DependencyFailure`.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            SessionError::Codec(_) => ErrorKind::DependencyFailure,
        }
    }
}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Codec(reason) => SessionError::Codec(reason),
            other => SessionError::StoreUnavailable(other),
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::StoreUnavailable(e) => write!(f, "session store unavailable: {}", e),
            SessionError::Codec(reason) => write!(f, "session record codec error: {}", reason),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::StoreUnavailable(e) => Some(e),
            SessionError::Codec(_) => None,
        }
    }
}

/// Result of `SessionCoordinator::update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The patch was applied
    Updated,
    /// No live session with that id
    NotFound,
}

/// Point-in-time health of a coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHealth {
    /// Whether the store answered a ping
    pub store_reachable: bool,
    /// Entries in this instance's cache
    pub cached_sessions: usize,
    /// Entries evicted by the last cleanup run
    pub last_cleanup_evicted: u64,
    /// Unix ms of the last cleanup run, if any
    pub last_cleanup_at_ms: Option<u64>,
}

#[derive(Debug, Clone)]
struct CachedSession {
    record: SessionRecord,
    /// Unix ms at which the store last confirmed this record
    confirmed_at_ms: u64,
}

#[derive(Debug, Default)]
struct CleanupStats {
    evicted: AtomicU64,
    at_ms: AtomicU64,
}

enum Lookup {
    Live(SessionRecord),
    Dead(SessionRecord),
    Absent,
}

/// Creates, resolves, updates and destroys sessions in the shared store.
///
/// Cloning is cheap; clones share the cache and metrics.
#[derive(Debug, Clone)]
pub struct SessionCoordinator {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
    config: SessionConfig,
    cache: Arc<ShardedStorage<String, CachedSession>>,
    stats: Arc<CleanupStats>,
    retry: RetryConfig,
}

impl SessionCoordinator {
    /// Create a coordinator with default configuration.
    pub fn new(store: Arc<dyn SharedStore>, clock: Arc<dyn Clock>, metrics: Metrics) -> Self {
        Self {
            store,
            clock,
            metrics,
            config: SessionConfig::default(),
            cache: Arc::new(ShardedStorage::new()),
            stats: Arc::new(CleanupStats::default()),
            retry: RetryConfig::default(),
        }
    }

    /// Create a coordinator with custom configuration.
    ///
    /// # Errors
    /// Returns the validation error of `config`.
    pub fn with_config(
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
        metrics: Metrics,
        config: SessionConfig,
    ) -> Result<Self, PolicyError> {
        config.validate()?;
        let mut coordinator = Self::new(store, clock, metrics);
        coordinator.config = config;
        Ok(coordinator)
    }

    /// Install a configuration that has already passed `validate`.
    pub(crate) fn with_validated_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Get the configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Get a reference to the metrics.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Create a session with the configured TTL.
    pub async fn create(&self, user_id: &str, payload: Value) -> Result<SessionId, SessionError> {
        self.create_with_ttl(user_id, payload, self.config.ttl).await
    }

    /// Create a session with an explicit TTL.
    ///
    /// # Errors
    /// Returns `SessionError::StoreUnavailable` if the record could not be
    /// written; no session exists in that case.
    pub async fn create_with_ttl(
        &self,
        user_id: &str,
        payload: Value,
        ttl: Duration,
    ) -> Result<SessionId, SessionError> {
        let now_ms = self.clock.now_millis();
        let id = SessionId::generate();
        let record = SessionRecord::new(user_id, payload, now_ms, ttl.max(Duration::from_millis(1)));
        let bytes = record.encode()?;
        let ttl = record.remaining_ttl(now_ms);

        let mut commands = vec![Command::Set {
            key: keys::session_key(id.as_str()),
            value: bytes,
            ttl: Some(ttl),
        }];
        commands.extend(self.index_commands(&id, &record, now_ms));

        if let Err(e) = bounded(self.config.store_timeout, self.store.atomic(commands)).await {
            self.metrics.record_store_error();
            tracing::warn!(user = %user_id, error = %e, "Failed to create session");
            return Err(e.into());
        }

        self.cache_confirmed(&id, record, now_ms);
        self.metrics.record_session_created();
        tracing::debug!(user = %user_id, ttl_ms = ttl.as_millis() as u64, "Session created");
        Ok(id)
    }

    /// Resolve a session, sliding its expiration forward.
    ///
    /// Returns `None` when the session is unknown, expired or destroyed, and
    /// also when the store cannot be reached (fail closed). See `lookup` to
    /// tell those cases apart.
    pub async fn get(&self, id: &SessionId) -> Option<SessionRecord> {
        match self.lookup(id).await {
            Ok(Some(record)) => {
                self.metrics.record_session_resolved();
                Some(record)
            }
            Ok(None) => {
                self.metrics.record_session_missed();
                None
            }
            Err(e) => {
                self.metrics.record_session_missed();
                tracing::warn!(
                    session = %id,
                    error = %e,
                    "Session store unavailable, treating session as absent"
                );
                None
            }
        }
    }

    /// Resolve a session, reporting store failures instead of hiding them.
    ///
    /// A live record is touched and written back. An expired or destroyed
    /// record is deleted.
    ///
    /// # Errors
    /// Returns `SessionError::StoreUnavailable` when the store cannot be
    /// reached and no cached record is fresh enough to serve.
    pub async fn lookup(&self, id: &SessionId) -> Result<Option<SessionRecord>, SessionError> {
        let now_ms = self.clock.now_millis();
        let key = keys::session_key(id.as_str());

        let found = cas::update(
            self.store.as_ref(),
            &key,
            self.config.store_timeout,
            None,
            &self.retry,
            |current: Option<SessionRecord>| match current {
                None => Step::Keep(Lookup::Absent),
                Some(record) if !record.is_live(now_ms) => Step::Keep(Lookup::Dead(record)),
                Some(mut record) => {
                    record.touch(now_ms);
                    let ttl = record.remaining_ttl(now_ms);
                    Step::WriteExpiring(record.clone(), ttl, Lookup::Live(record))
                }
            },
        )
        .await;

        match found {
            Ok(Lookup::Live(record)) => {
                self.refresh_index(id, &record, now_ms).await;
                self.cache_confirmed(id, record.clone(), now_ms);
                Ok(Some(record))
            }
            Ok(Lookup::Dead(record)) => {
                self.cache.remove(&id.to_string());
                self.remove_from_store(id, Some(&record.user_id)).await;
                tracing::debug!(session = %id, "Removed expired session");
                Ok(None)
            }
            Ok(Lookup::Absent) => {
                self.cache.remove(&id.to_string());
                Ok(None)
            }
            Err(e) => {
                self.metrics.record_store_error();
                match self.stale_cached(id, now_ms) {
                    Some(record) => {
                        tracing::warn!(
                            session = %id,
                            error = %e,
                            "Session store unavailable, serving recently confirmed cached session"
                        );
                        Ok(Some(record))
                    }
                    None => Err(e.into()),
                }
            }
        }
    }

    /// Apply a partial update to a live session.
    ///
    /// # Errors
    /// Returns `SessionError::StoreUnavailable` if the store cannot be reached.
    pub async fn update(
        &self,
        id: &SessionId,
        patch: SessionPatch,
    ) -> Result<UpdateOutcome, SessionError> {
        let now_ms = self.clock.now_millis();
        let key = keys::session_key(id.as_str());

        let updated = cas::update(
            self.store.as_ref(),
            &key,
            self.config.store_timeout,
            None,
            &self.retry,
            |current: Option<SessionRecord>| match current {
                Some(mut record) if record.is_live(now_ms) => {
                    record.apply(patch.clone());
                    let ttl = record.remaining_ttl(now_ms).max(Duration::from_millis(1));
                    Step::WriteExpiring(record.clone(), ttl, Some(record))
                }
                _ => Step::Keep(None),
            },
        )
        .await
        .map_err(|e| {
            self.metrics.record_store_error();
            SessionError::from(e)
        })?;

        match updated {
            Some(record) => {
                self.refresh_index(id, &record, now_ms).await;
                self.cache_confirmed(id, record, now_ms);
                Ok(UpdateOutcome::Updated)
            }
            None => {
                self.cache.remove(&id.to_string());
                Ok(UpdateOutcome::NotFound)
            }
        }
    }

    /// End a session immediately, on every instance.
    ///
    /// Destroying an unknown session succeeds.
    ///
    /// # Errors
    /// Returns `SessionError::StoreUnavailable` if the record could not be
    /// removed. The local cache entry is dropped regardless.
    pub async fn destroy(&self, id: &SessionId) -> Result<(), SessionError> {
        let cached_user = self
            .cache
            .remove(&id.to_string())
            .map(|cached| cached.record.user_id);
        let key = keys::session_key(id.as_str());
        let timeout = self.config.store_timeout;

        let stored_user = match bounded(timeout, self.store.get(&key)).await {
            Ok(bytes) => bytes
                .and_then(|bytes| SessionRecord::decode(&bytes).ok())
                .map(|record| record.user_id),
            Err(e) => {
                self.metrics.record_store_error();
                return Err(e.into());
            }
        };

        let mut commands = vec![Command::Del { key }];
        if let Some(user_id) = stored_user.or(cached_user) {
            commands.push(Command::ZRem {
                key: keys::session_index_key(&user_id),
                member: id.to_string(),
            });
        }
        if let Err(e) = bounded(timeout, self.store.atomic(commands)).await {
            self.metrics.record_store_error();
            return Err(e.into());
        }

        self.metrics.record_session_destroyed();
        tracing::debug!(session = %id, "Session destroyed");
        Ok(())
    }

    /// Live sessions belonging to `user_id`.
    ///
    /// Index entries pointing at missing or dead sessions are pruned.
    pub async fn sessions_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<(SessionId, SessionRecord)>, SessionError> {
        let now_ms = self.clock.now_millis();
        let index = keys::session_index_key(user_id);
        let timeout = self.config.store_timeout;

        let members = bounded(
            timeout,
            self.store
                .zrange_by_score(&index, f64::NEG_INFINITY, f64::INFINITY),
        )
        .await
        .map_err(|e| {
            self.metrics.record_store_error();
            SessionError::from(e)
        })?;

        let mut live = Vec::with_capacity(members.len());
        let mut stale = Vec::new();
        for (member, _) in members {
            let bytes = bounded(timeout, self.store.get(&keys::session_key(&member)))
                .await
                .map_err(|e| {
                    self.metrics.record_store_error();
                    SessionError::from(e)
                })?;
            match bytes.and_then(|bytes| SessionRecord::decode(&bytes).ok()) {
                Some(record) if record.is_live(now_ms) && record.user_id == user_id => {
                    live.push((SessionId::new(member), record));
                }
                _ => stale.push(member),
            }
        }

        if !stale.is_empty() {
            let commands = stale
                .into_iter()
                .map(|member| Command::ZRem {
                    key: index.clone(),
                    member,
                })
                .collect();
            if let Err(e) = bounded(timeout, self.store.atomic(commands)).await {
                tracing::warn!(user = %user_id, error = %e, "Failed to prune session index");
            }
        }

        Ok(live)
    }

    /// Destroy every session of `user_id`. Returns how many were removed.
    pub async fn destroy_user_sessions(&self, user_id: &str) -> Result<usize, SessionError> {
        let index = keys::session_index_key(user_id);
        let timeout = self.config.store_timeout;

        let members = bounded(
            timeout,
            self.store
                .zrange_by_score(&index, f64::NEG_INFINITY, f64::INFINITY),
        )
        .await
        .map_err(|e| {
            self.metrics.record_store_error();
            SessionError::from(e)
        })?;

        let mut commands: Vec<Command> = members
            .iter()
            .map(|(member, _)| Command::Del {
                key: keys::session_key(member),
            })
            .collect();
        commands.push(Command::Del { key: index });

        let replies = bounded(timeout, self.store.atomic(commands))
            .await
            .map_err(|e| {
                self.metrics.record_store_error();
                SessionError::from(e)
            })?;

        // Index members whose record had already expired delete nothing
        let destroyed = replies
            .iter()
            .take(members.len())
            .filter(|reply| reply.as_int() == Some(1))
            .count();

        self.cache.retain(|_, cached| cached.record.user_id != user_id);
        for _ in 0..destroyed {
            self.metrics.record_session_destroyed();
        }
        tracing::info!(user = %user_id, count = destroyed, "Destroyed all sessions for user");
        Ok(destroyed)
    }

    /// Evict cache entries past their expiry. Returns how many were evicted.
    ///
    /// Only this instance's cache is touched; the store expires records by
    /// itself.
    pub fn cleanup_local(&self) -> usize {
        let now_ms = self.clock.now_millis();
        let before = self.cache.len();
        self.cache.retain(|_, cached| cached.record.is_live(now_ms));
        let evicted = before.saturating_sub(self.cache.len());

        self.stats.evicted.store(evicted as u64, Ordering::Relaxed);
        self.stats.at_ms.store(now_ms, Ordering::Relaxed);
        if evicted > 0 {
            self.metrics.record_sessions_evicted(evicted as u64);
            tracing::debug!(evicted, "Evicted expired sessions from local cache");
        }
        evicted
    }

    /// Run `cleanup_local` every `cleanup_interval` in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_cleanup(&self) -> CleanupHandle {
        let coordinator = self.clone();
        CleanupHandle::spawn("session-cache", self.config.cleanup_interval, move || {
            coordinator.cleanup_local();
        })
    }

    /// Report store reachability and cache statistics.
    pub async fn health(&self) -> SessionHealth {
        let store_reachable = bounded(self.config.store_timeout, self.store.ping())
            .await
            .is_ok();
        let at_ms = self.stats.at_ms.load(Ordering::Relaxed);
        SessionHealth {
            store_reachable,
            cached_sessions: self.cache.len(),
            last_cleanup_evicted: self.stats.evicted.load(Ordering::Relaxed),
            last_cleanup_at_ms: (at_ms > 0).then_some(at_ms),
        }
    }

    /// Number of sessions in this instance's cache.
    pub fn cached_sessions(&self) -> usize {
        self.cache.len()
    }

    fn cache_confirmed(&self, id: &SessionId, record: SessionRecord, now_ms: u64) {
        self.cache.insert(
            id.to_string(),
            CachedSession {
                record,
                confirmed_at_ms: now_ms,
            },
        );
    }

    /// A cached live record confirmed by the store within the stale window.
    fn stale_cached(&self, id: &SessionId, now_ms: u64) -> Option<SessionRecord> {
        let window_ms: u64 = self
            .config
            .stale_read_window
            .as_millis()
            .try_into()
            .unwrap_or(u64::MAX);
        if window_ms == 0 {
            return None;
        }
        let cached = self.cache.get_cloned(&id.to_string())?;
        let fresh = now_ms.saturating_sub(cached.confirmed_at_ms) <= window_ms;
        (fresh && cached.record.is_live(now_ms)).then_some(cached.record)
    }

    fn index_commands(&self, id: &SessionId, record: &SessionRecord, now_ms: u64) -> Vec<Command> {
        let index = keys::session_index_key(&record.user_id);
        vec![
            Command::ZAdd {
                key: index.clone(),
                member: id.to_string(),
                score: record.expires_at_ms as f64,
            },
            Command::ZRemRangeByScore {
                key: index.clone(),
                min: f64::NEG_INFINITY,
                max: now_ms as f64 - 1.0,
            },
            Command::Expire {
                key: index,
                ttl: record.remaining_ttl(now_ms).max(self.config.ttl),
            },
        ]
    }

    /// Keep the user's index scored by the session's new expiry.
    async fn refresh_index(&self, id: &SessionId, record: &SessionRecord, now_ms: u64) {
        let commands = self.index_commands(id, record, now_ms);
        if let Err(e) = bounded(self.config.store_timeout, self.store.atomic(commands)).await {
            tracing::warn!(session = %id, error = %e, "Failed to refresh session index");
        }
    }

    async fn remove_from_store(&self, id: &SessionId, user_id: Option<&str>) {
        let mut commands = vec![Command::Del {
            key: keys::session_key(id.as_str()),
        }];
        if let Some(user_id) = user_id {
            commands.push(Command::ZRem {
                key: keys::session_index_key(user_id),
                member: id.to_string(),
            });
        }
        if let Err(e) = bounded(self.config.store_timeout, self.store.atomic(commands)).await {
            tracing::warn!(session = %id, error = %e, "Failed to remove dead session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::memory_store::MemoryStore;
    use crate::infrastructure::mocks::{FlakyStore, MockClock, StoreMode};
    use serde_json::json;

    fn coordinator(config: SessionConfig) -> (SessionCoordinator, FlakyStore, MockClock) {
        let clock = MockClock::new(1_000_000);
        let store = FlakyStore::new(Arc::new(MemoryStore::new(Arc::new(clock.clone()))));
        let coordinator = SessionCoordinator::with_config(
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            Metrics::new(),
            config,
        )
        .unwrap();
        (coordinator, store, clock)
    }

    fn ttl_config(secs: u64) -> SessionConfig {
        SessionConfig::new(Duration::from_secs(secs)).unwrap()
    }

    #[test]
    fn test_config_validation() {
        assert_eq!(
            SessionConfig::new(Duration::ZERO),
            Err(PolicyError::ZeroSessionTtl)
        );
        assert!(SessionConfig::default()
            .with_cleanup_interval(Duration::ZERO)
            .is_err());
        assert_eq!(SessionConfig::default().stale_read_window, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let (sessions, _store, _clock) = coordinator(ttl_config(60));
        let id = sessions.create("u1", json!({"role": "admin"})).await.unwrap();
        assert_eq!(id.as_str().len(), 64);

        let record = sessions.get(&id).await.unwrap();
        assert_eq!(record.user_id, "u1");
        assert_eq!(record.payload, json!({"role": "admin"}));
        assert!(record.is_active);
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let (sessions, _store, _clock) = coordinator(ttl_config(60));
        let a = sessions.create("u1", json!(null)).await.unwrap();
        let b = sessions.create("u1", json!(null)).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_sliding_expiration() {
        let (sessions, _store, clock) = coordinator(ttl_config(10));
        let id = sessions.create("u1", json!({})).await.unwrap();

        clock.advance(Duration::from_secs(8));
        let record = sessions.get(&id).await.unwrap();
        assert_eq!(record.expires_at_ms, clock.now_millis() + 10_000);

        // Past the original expiry, within the refreshed one
        clock.advance(Duration::from_secs(8));
        assert!(sessions.get(&id).await.is_some());

        clock.advance(Duration::from_secs(11));
        assert!(sessions.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_update() {
        let (sessions, _store, _clock) = coordinator(ttl_config(60));
        let id = sessions.create("u1", json!({"a": 1})).await.unwrap();

        let outcome = sessions
            .update(&id, SessionPatch::new().with_payload_field("b", json!(2)))
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Updated);
        assert_eq!(
            sessions.get(&id).await.unwrap().payload,
            json!({"a": 1, "b": 2})
        );

        let missing = SessionId::new("does-not-exist");
        assert_eq!(
            sessions.update(&missing, SessionPatch::new()).await.unwrap(),
            UpdateOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn test_destroy_is_immediate() {
        let (sessions, _store, _clock) = coordinator(ttl_config(60));
        let id = sessions.create("u1", json!({})).await.unwrap();

        sessions.destroy(&id).await.unwrap();
        assert!(sessions.get(&id).await.is_none());
        assert_eq!(sessions.cached_sessions(), 0);
        assert_eq!(
            sessions.update(&id, SessionPatch::new()).await.unwrap(),
            UpdateOutcome::NotFound
        );
        // Idempotent
        sessions.destroy(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_user_index() {
        let (sessions, _store, _clock) = coordinator(ttl_config(60));
        let a = sessions.create("u1", json!({})).await.unwrap();
        let b = sessions.create("u1", json!({})).await.unwrap();
        let other = sessions.create("u2", json!({})).await.unwrap();

        let mut ids: Vec<SessionId> = sessions
            .sessions_for_user("u1")
            .await
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        ids.sort();
        let mut expected = vec![a.clone(), b.clone()];
        expected.sort();
        assert_eq!(ids, expected);

        assert_eq!(sessions.destroy_user_sessions("u1").await.unwrap(), 2);
        assert!(sessions.get(&a).await.is_none());
        assert!(sessions.get(&b).await.is_none());
        assert!(sessions.get(&other).await.is_some());
    }

    #[tokio::test]
    async fn test_destroy_user_sessions_counts_only_live_records() {
        let (sessions, _store, clock) = coordinator(ttl_config(60));
        sessions
            .create_with_ttl("u1", json!({}), Duration::from_secs(5))
            .await
            .unwrap();
        let live = sessions.create("u1", json!({})).await.unwrap();

        // The short session's record expires; its index entry lingers
        clock.advance(Duration::from_secs(10));
        assert_eq!(sessions.destroy_user_sessions("u1").await.unwrap(), 1);
        assert_eq!(sessions.metrics().sessions_destroyed(), 1);
        assert!(sessions.get(&live).await.is_none());
    }

    #[tokio::test]
    async fn test_store_outage_fails_closed() {
        let (sessions, store, _clock) = coordinator(ttl_config(60));
        let id = sessions.create("u1", json!({})).await.unwrap();
        assert!(sessions.get(&id).await.is_some());

        store.set_mode(StoreMode::Failing);
        assert!(sessions.get(&id).await.is_none());
        assert!(matches!(
            sessions.lookup(&id).await,
            Err(SessionError::StoreUnavailable(_))
        ));
        assert!(matches!(
            sessions.create("u1", json!({})).await,
            Err(SessionError::StoreUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_stale_read_window() {
        let config = ttl_config(60).with_stale_read_window(Duration::from_secs(5));
        let (sessions, store, clock) = coordinator(config);
        let id = sessions.create("u1", json!({})).await.unwrap();

        store.set_mode(StoreMode::Failing);
        clock.advance(Duration::from_secs(4));
        assert!(sessions.get(&id).await.is_some());

        clock.advance(Duration::from_secs(2));
        assert!(sessions.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_cleanup_local() {
        let (sessions, _store, clock) = coordinator(ttl_config(10));
        sessions.create("u1", json!({})).await.unwrap();
        sessions
            .create_with_ttl("u1", json!({}), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(sessions.cached_sessions(), 2);

        clock.advance(Duration::from_secs(11));
        assert_eq!(sessions.cleanup_local(), 1);
        assert_eq!(sessions.cached_sessions(), 1);

        let health = sessions.health().await;
        assert!(health.store_reachable);
        assert_eq!(health.last_cleanup_evicted, 1);
        assert_eq!(health.last_cleanup_at_ms, Some(clock.now_millis()));
        assert_eq!(sessions.metrics().sessions_evicted(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_cleanup() {
        let config = ttl_config(1)
            .with_cleanup_interval(Duration::from_secs(5))
            .unwrap();
        let (sessions, _store, clock) = coordinator(config);
        sessions.create("u1", json!({})).await.unwrap();
        clock.advance(Duration::from_secs(2));

        let handle = sessions.start_cleanup();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(sessions.cached_sessions(), 0);

        handle.shutdown().await.unwrap();
    }

    #[test]
    fn test_error_mapping() {
        let codec = SessionError::from(StoreError::Codec("bad".into()));
        assert_eq!(codec, SessionError::Codec("bad".into()));
        assert_eq!(codec.kind(), ErrorKind::DependencyFailure);

        let contended = SessionError::from(StoreError::Contention {
            key: "session:abc".into(),
            attempts: 16,
        });
        assert_eq!(contended.kind(), ErrorKind::StoreUnavailable);

        let unavailable = SessionError::from(StoreError::Timeout(Duration::from_millis(5)));
        assert_eq!(unavailable.kind(), ErrorKind::StoreUnavailable);
        assert!(unavailable.to_string().contains("timed out"));
    }
}
