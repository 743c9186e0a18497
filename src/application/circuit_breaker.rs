//! Circuit breaker guarding calls to downstream dependencies.
//!
//! Circuit records live in the shared store so that every instance sees the
//! same state for a dependency. Transitions are evaluated lazily when a call
//! arrives. The OPEN -> HALF_OPEN move is a compare-and-swap on the stored
//! record, so exactly one caller wins the probe.
//!
//! If the store cannot be reached, each instance falls back to a local mirror
//! of the last record it saw and keeps applying its own outcomes to it. With
//! nothing known the circuit is treated as closed.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::application::cas::{self, RetryConfig, Step};
use crate::application::deadline::bounded;
use crate::application::metrics::Metrics;
use crate::application::ports::{Clock, SharedStore, Storage, StoreError};
use crate::domain::circuit::{Access, CircuitRecord, CircuitState};
use crate::domain::error::ErrorKind;
use crate::domain::keys;
use crate::domain::policy::{PolicyError, DEFAULT_STORE_TIMEOUT};
use crate::infrastructure::storage::ShardedStorage;

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening circuit
    pub failure_threshold: u32,
    /// Time an open circuit waits before letting a probe through
    pub reset_timeout: Duration,
    /// Deadline for each store call
    pub store_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a validated configuration with the default store timeout.
    ///
    /// # Errors
    /// Returns `PolicyError::ZeroFailureThreshold` or
    /// `PolicyError::ZeroResetTimeout`.
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Result<Self, PolicyError> {
        let config = Self {
            failure_threshold,
            reset_timeout,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Set the store deadline.
    ///
    /// # Errors
    /// Returns `PolicyError::ZeroStoreTimeout` if `timeout` is zero.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Result<Self, PolicyError> {
        self.store_timeout = timeout;
        self.validate()?;
        Ok(self)
    }

    /// Check every field.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.failure_threshold == 0 {
            return Err(PolicyError::ZeroFailureThreshold);
        }
        if self.reset_timeout.is_zero() {
            return Err(PolicyError::ZeroResetTimeout);
        }
        if self.store_timeout.is_zero() {
            return Err(PolicyError::ZeroStoreTimeout);
        }
        Ok(())
    }
}

/// Error returned by `CircuitBreaker::execute`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecuteError<E> {
    /// The circuit is open; the operation was not attempted
    Open {
        /// Dependency whose circuit is open
        dependency: String,
    },
    /// The operation ran and failed
    Dependency(E),
    /// The fallback ran and failed as well
    Fallback {
        /// The operation's error, or `None` if the circuit was open
        primary: Option<E>,
        /// The fallback's error
        fallback: E,
    },
}

impl<E> ExecuteError<E> {
    /// Taxonomy of this error.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::DependencyFailure
    }

    /// Whether the call was short-circuited without reaching the dependency.
    pub fn is_open(&self) -> bool {
        matches!(self, ExecuteError::Open { .. })
    }
}

impl<E: fmt::Display> fmt::Display for ExecuteError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecuteError::Open { dependency } => {
                write!(f, "circuit open for dependency {}", dependency)
            }
            ExecuteError::Dependency(e) => write!(f, "dependency call failed: {}", e),
            ExecuteError::Fallback {
                primary: Some(primary),
                fallback,
            } => write!(
                f,
                "dependency call failed ({}) and fallback failed: {}",
                primary, fallback
            ),
            ExecuteError::Fallback {
                primary: None,
                fallback,
            } => write!(f, "circuit open and fallback failed: {}", fallback),
        }
    }
}

impl<E> std::error::Error for ExecuteError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExecuteError::Open { .. } => None,
            ExecuteError::Dependency(e) => Some(e),
            ExecuteError::Fallback { fallback, .. } => Some(fallback),
        }
    }
}

/// How a call was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ticket {
    /// Circuit was closed
    Pass,
    /// This call is the probe claimed at the given time
    Probe(u64),
    /// Circuit open, do not call
    Reject,
}

/// Store-backed circuit breaker, one circuit per dependency name.
///
/// Cloning is cheap; clones share the store, local mirror and metrics.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
    default_config: CircuitBreakerConfig,
    overrides: HashMap<String, CircuitBreakerConfig>,
    mirror: Arc<ShardedStorage<String, CircuitRecord>>,
    retry: RetryConfig,
}

impl CircuitBreaker {
    /// Create a circuit breaker with default configuration.
    pub fn new(store: Arc<dyn SharedStore>, clock: Arc<dyn Clock>, metrics: Metrics) -> Self {
        Self {
            store,
            clock,
            metrics,
            default_config: CircuitBreakerConfig::default(),
            overrides: HashMap::new(),
            mirror: Arc::new(ShardedStorage::new()),
            retry: RetryConfig::default(),
        }
    }

    /// Create a circuit breaker with a custom default configuration.
    ///
    /// # Errors
    /// Returns the validation error of `config`.
    pub fn with_config(
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
        metrics: Metrics,
        config: CircuitBreakerConfig,
    ) -> Result<Self, PolicyError> {
        config.validate()?;
        let mut breaker = Self::new(store, clock, metrics);
        breaker.default_config = config;
        Ok(breaker)
    }

    /// Use `config` for `dependency` instead of the default.
    ///
    /// # Errors
    /// Returns the validation error of `config`.
    pub fn with_dependency(
        mut self,
        dependency: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> Result<Self, PolicyError> {
        config.validate()?;
        self.overrides.insert(dependency.into(), config);
        Ok(self)
    }

    /// Install configurations that have already passed `validate`.
    pub(crate) fn with_validated_configs(
        mut self,
        default_config: CircuitBreakerConfig,
        overrides: HashMap<String, CircuitBreakerConfig>,
    ) -> Self {
        self.default_config = default_config;
        self.overrides = overrides;
        self
    }

    /// Override retry behaviour for record updates.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Configuration in effect for `dependency`.
    pub fn config_for(&self, dependency: &str) -> &CircuitBreakerConfig {
        self.overrides
            .get(dependency)
            .unwrap_or(&self.default_config)
    }

    /// Get a reference to the metrics.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Run `operation` under the circuit for `dependency`.
    ///
    /// An open circuit returns `ExecuteError::Open` without calling
    /// `operation`. A failure is recorded and returned as
    /// `ExecuteError::Dependency`.
    pub async fn execute<T, E, F, Fut>(
        &self,
        dependency: &str,
        operation: F,
    ) -> Result<T, ExecuteError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(
            dependency,
            operation,
            None::<fn() -> std::future::Ready<Result<T, E>>>,
        )
        .await
    }

    /// Like `execute`, but runs `fallback` when the circuit is open or the
    /// operation fails. The failure is still recorded against the circuit.
    pub async fn execute_with_fallback<T, E, F, Fut, G, GFut>(
        &self,
        dependency: &str,
        operation: F,
        fallback: G,
    ) -> Result<T, ExecuteError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        G: FnOnce() -> GFut,
        GFut: Future<Output = Result<T, E>>,
    {
        self.run(dependency, operation, Some(fallback)).await
    }

    async fn run<T, E, F, Fut, G, GFut>(
        &self,
        dependency: &str,
        operation: F,
        fallback: Option<G>,
    ) -> Result<T, ExecuteError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        G: FnOnce() -> GFut,
        GFut: Future<Output = Result<T, E>>,
    {
        let config = self.config_for(dependency).clone();
        let ticket = self.enter(dependency, &config).await;

        if ticket == Ticket::Reject {
            self.metrics.record_short_circuit();
            tracing::debug!(dependency = %dependency, "Circuit open, short-circuiting call");
            return match fallback {
                Some(fallback) => {
                    self.metrics.record_fallback();
                    fallback()
                        .await
                        .map_err(|e| ExecuteError::Fallback {
                            primary: None,
                            fallback: e,
                        })
                }
                None => Err(ExecuteError::Open {
                    dependency: dependency.to_string(),
                }),
            };
        }

        match operation().await {
            Ok(value) => {
                self.record_outcome(dependency, &config, ticket, true).await;
                Ok(value)
            }
            Err(e) => {
                self.metrics.record_dependency_failure();
                self.record_outcome(dependency, &config, ticket, false)
                    .await;
                match fallback {
                    Some(fallback) => {
                        self.metrics.record_fallback();
                        fallback().await.map_err(|fallback_error| ExecuteError::Fallback {
                            primary: Some(e),
                            fallback: fallback_error,
                        })
                    }
                    None => Err(ExecuteError::Dependency(e)),
                }
            }
        }
    }

    /// Decide how a call is let through, claiming the probe if it is due.
    async fn enter(&self, dependency: &str, config: &CircuitBreakerConfig) -> Ticket {
        let now_ms = self.clock.now_millis();
        let key = keys::circuit_key(dependency);
        let reset_timeout = config.reset_timeout;

        let claimed = cas::update(
            self.store.as_ref(),
            &key,
            config.store_timeout,
            None,
            &self.retry,
            |current: Option<CircuitRecord>| {
                let record = current.unwrap_or_else(|| CircuitRecord::closed(now_ms));
                match record.access(now_ms, reset_timeout) {
                    Access::Pass => Step::Keep((Ticket::Pass, record)),
                    Access::Reject => Step::Keep((Ticket::Reject, record)),
                    Access::Probe => {
                        let probing = record.begin_probe(now_ms);
                        Step::Write(probing, (Ticket::Probe(now_ms), probing))
                    }
                }
            },
        )
        .await;

        let ticket = match claimed {
            Ok((ticket, record)) => {
                self.mirror.insert(dependency.to_string(), record);
                ticket
            }
            Err(e) => {
                self.metrics.record_store_error();
                tracing::warn!(
                    dependency = %dependency,
                    error = %e,
                    "Circuit store unavailable, using local circuit state"
                );
                self.mirror.with_entry_mut(
                    dependency.to_string(),
                    || CircuitRecord::closed(now_ms),
                    |record| match record.access(now_ms, reset_timeout) {
                        Access::Pass => Ticket::Pass,
                        Access::Reject => Ticket::Reject,
                        Access::Probe => {
                            *record = record.begin_probe(now_ms);
                            Ticket::Probe(now_ms)
                        }
                    },
                )
            }
        };

        if let Ticket::Probe(_) = ticket {
            tracing::info!(dependency = %dependency, "Circuit half-open, probing dependency");
        }
        ticket
    }

    /// Apply a call outcome to the stored record, or to the local mirror if
    /// the store cannot be updated.
    ///
    /// Only outcomes that match the record's state count: calls admitted
    /// while closed affect a closed circuit, and only the current probe
    /// decides a half-open one.
    async fn record_outcome(
        &self,
        dependency: &str,
        config: &CircuitBreakerConfig,
        ticket: Ticket,
        success: bool,
    ) {
        let now_ms = self.clock.now_millis();
        let key = keys::circuit_key(dependency);
        let threshold = config.failure_threshold;

        let transition = move |before: CircuitRecord| -> CircuitRecord {
            let applies = match (ticket, before.state) {
                (Ticket::Pass, CircuitState::Closed) => true,
                (Ticket::Probe(claimed_at), CircuitState::HalfOpen) => {
                    before.last_transition_at_ms == claimed_at
                }
                _ => false,
            };
            if !applies {
                before
            } else if success {
                before.on_success(now_ms)
            } else {
                before.on_failure(now_ms, threshold)
            }
        };

        let updated = cas::update(
            self.store.as_ref(),
            &key,
            config.store_timeout,
            None,
            &self.retry,
            |current: Option<CircuitRecord>| {
                let before = current.unwrap_or_else(|| CircuitRecord::closed(now_ms));
                let after = transition(before);
                if after == before {
                    Step::Keep((before, after))
                } else {
                    Step::Write(after, (before, after))
                }
            },
        )
        .await;

        let (before, after) = match updated {
            Ok((before, after)) => {
                self.mirror.insert(dependency.to_string(), after);
                (before, after)
            }
            Err(e) => {
                self.metrics.record_store_error();
                tracing::warn!(
                    dependency = %dependency,
                    error = %e,
                    "Failed to record circuit outcome in store, updating local state only"
                );
                self.mirror.with_entry_mut(
                    dependency.to_string(),
                    || CircuitRecord::closed(now_ms),
                    |record| {
                        let before = *record;
                        *record = transition(before);
                        (before, *record)
                    },
                )
            }
        };

        if before.state != after.state {
            match after.state {
                CircuitState::Open => {
                    self.metrics.record_circuit_opened();
                    tracing::warn!(
                        dependency = %dependency,
                        consecutive_failures = after.consecutive_failures,
                        from = before.state.as_str(),
                        "Circuit opened"
                    );
                }
                CircuitState::Closed => {
                    tracing::info!(dependency = %dependency, "Circuit closed, dependency recovered");
                }
                CircuitState::HalfOpen => {}
            }
        }
    }

    /// Last known state of the circuit for `dependency`.
    ///
    /// Reads the store; falls back to the local mirror, then to `Closed`.
    /// The state is reported as stored: an open circuit whose cooldown has
    /// elapsed stays `Open` until the next call claims the probe.
    pub async fn state(&self, dependency: &str) -> CircuitState {
        self.record(dependency)
            .await
            .map_or(CircuitState::Closed, |record| record.state)
    }

    /// Last known record for `dependency`, if any.
    pub async fn record(&self, dependency: &str) -> Option<CircuitRecord> {
        let key = keys::circuit_key(dependency);
        let timeout = self.config_for(dependency).store_timeout;
        match cas::update(
            self.store.as_ref(),
            &key,
            timeout,
            None,
            &self.retry,
            |current: Option<CircuitRecord>| Step::Keep(current),
        )
        .await
        {
            Ok(Some(record)) => {
                self.mirror.insert(dependency.to_string(), record);
                Some(record)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::debug!(dependency = %dependency, error = %e, "Reading local circuit state");
                self.mirror.get_cloned(&dependency.to_string())
            }
        }
    }

    /// Force the circuit for `dependency` closed, on every instance.
    ///
    /// # Errors
    /// Returns the store error if the shared record could not be removed. The
    /// local mirror is cleared regardless.
    pub async fn reset(&self, dependency: &str) -> Result<(), StoreError> {
        self.mirror.remove(&dependency.to_string());
        let key = keys::circuit_key(dependency);
        let timeout = self.config_for(dependency).store_timeout;
        bounded(timeout, self.store.del(&key)).await?;
        tracing::info!(dependency = %dependency, "Circuit reset");
        Ok(())
    }
}
