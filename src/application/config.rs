//! Declarative configuration.
//!
//! `ResilienceConfig` mirrors the JSON configuration surface. `build()`
//! validates every policy up front, so a bad value fails at startup with an
//! error naming the offending policy rather than at request time.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::application::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::application::gate::AdmissionGate;
use crate::application::limiter::RateLimiter;
use crate::application::metrics::Metrics;
use crate::application::ports::{Clock, SharedStore};
use crate::application::session::{SessionConfig, SessionCoordinator};
use crate::domain::error::ErrorKind;
use crate::domain::policy::{Algorithm, Policy, PolicyError, RatePolicy};
use crate::domain::tier::PolicyTable;

/// Tier used when `defaultTier` is not set.
pub const DEFAULT_TIER: &str = "default";

/// Error returned when configuration cannot be parsed or validated.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// The document is not valid configuration JSON
    Parse(String),
    /// A required option is missing from a policy
    MissingField {
        /// Policy name (`rateLimits.<tier>`, `circuits.<dep>`, ...)
        policy: String,
        /// Option name
        field: &'static str,
    },
    /// A policy has an invalid value
    InvalidPolicy {
        /// Policy name
        policy: String,
        /// What is wrong with it
        source: PolicyError,
    },
    /// `defaultTier` names a tier that is not defined
    UnknownDefaultTier(String),
}

impl ConfigError {
    /// Taxonomy of this error.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Parse(reason) => write!(f, "invalid configuration: {}", reason),
            ConfigError::MissingField { policy, field } => {
                write!(f, "{}: missing required option {}", policy, field)
            }
            ConfigError::InvalidPolicy { policy, source } => write!(f, "{}: {}", policy, source),
            ConfigError::UnknownDefaultTier(tier) => {
                write!(f, "defaultTier {} is not defined under rateLimits", tier)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidPolicy { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// One `rateLimits` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RateLimitSettings {
    /// `slidingWindow` or `tokenBucket`
    pub algorithm: Algorithm,
    /// Sliding window length
    pub window_ms: Option<u64>,
    /// Sliding window limit
    pub max_requests: Option<u32>,
    /// Token bucket capacity
    pub capacity: Option<f64>,
    /// Token bucket refill rate
    pub refill_rate_per_second: Option<f64>,
    /// Deadline for store calls
    pub store_timeout_ms: Option<u64>,
    /// Use the in-process fallback during store outages (default true)
    pub fallback_enabled: Option<bool>,
}

/// One `circuits` entry, or `defaultCircuit`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CircuitSettings {
    /// Consecutive failures that open the circuit
    pub failure_threshold: Option<u32>,
    /// Time an open circuit waits before a probe
    pub reset_timeout_ms: Option<u64>,
    /// Deadline for store calls
    pub store_timeout_ms: Option<u64>,
}

/// The `session` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SessionSettings {
    /// Sliding expiration period
    pub session_ttl_seconds: Option<u64>,
    /// Deadline for store calls
    pub store_timeout_ms: Option<u64>,
    /// How long confirmed cache entries may be served during an outage
    pub stale_read_window_ms: Option<u64>,
    /// Period of the local cache cleanup
    pub cleanup_interval_seconds: Option<u64>,
}

/// Configuration document.
///
/// # Example
/// ```
/// use resilience_gate::ResilienceConfig;
///
/// let config = ResilienceConfig::from_json_str(r#"{
///     "rateLimits": {
///         "default": { "algorithm": "slidingWindow", "windowMs": 60000, "maxRequests": 100 },
///         "admin": { "algorithm": "tokenBucket", "capacity": 500, "refillRatePerSecond": 50 }
///     },
///     "circuits": { "payments-api": { "failureThreshold": 3, "resetTimeoutMs": 10000 } },
///     "session": { "sessionTtlSeconds": 1800 }
/// }"#).unwrap();
///
/// let settings = config.build().unwrap();
/// assert_eq!(settings.policies.len(), 1);
/// assert_eq!(settings.circuits["payments-api"].failure_threshold, 3);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ResilienceConfig {
    /// Admission policies by tier
    #[serde(default)]
    pub rate_limits: BTreeMap<String, RateLimitSettings>,
    /// Tier used for requests without a known tier
    #[serde(default)]
    pub default_tier: Option<String>,
    /// Per-dependency circuit overrides
    #[serde(default)]
    pub circuits: BTreeMap<String, CircuitSettings>,
    /// Circuit settings for dependencies without an override
    #[serde(default)]
    pub default_circuit: Option<CircuitSettings>,
    /// Session coordinator settings
    #[serde(default)]
    pub session: Option<SessionSettings>,
}

/// Validated configuration, ready to construct components.
#[derive(Debug, Clone)]
pub struct ResilienceSettings {
    /// Tiered admission policies
    pub policies: PolicyTable,
    /// Circuit configuration for dependencies without an override
    pub default_circuit: CircuitBreakerConfig,
    /// Per-dependency circuit configuration
    pub circuits: HashMap<String, CircuitBreakerConfig>,
    /// Session configuration
    pub session: SessionConfig,
}

/// Every component, sharing one store, clock and metrics collector.
#[derive(Debug, Clone)]
pub struct Resilience {
    /// Request interceptor (owns the rate limiter)
    pub gate: AdmissionGate,
    /// Circuit breaker
    pub breaker: CircuitBreaker,
    /// Session coordinator
    pub sessions: SessionCoordinator,
    /// Shared metrics
    pub metrics: Metrics,
}

impl ResilienceConfig {
    /// Parse a JSON document.
    ///
    /// # Errors
    /// Returns `ConfigError::Parse` for malformed JSON, unknown options or
    /// wrongly typed values.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Validate every policy.
    ///
    /// With no `rateLimits` at all, the default tier admits 100 requests per
    /// minute on a sliding window.
    ///
    /// # Errors
    /// Returns the first invalid policy found, by name.
    pub fn build(&self) -> Result<ResilienceSettings, ConfigError> {
        let mut tiers = BTreeMap::new();
        for (tier, settings) in &self.rate_limits {
            tiers.insert(tier.clone(), rate_policy(&format!("rateLimits.{}", tier), settings)?);
        }

        let default_tier = self.default_tier.as_deref().unwrap_or(DEFAULT_TIER);
        let default_policy = match tiers.remove(default_tier) {
            Some(policy) => policy,
            None if self.default_tier.is_some() || !tiers.is_empty() => {
                return Err(ConfigError::UnknownDefaultTier(default_tier.to_string()));
            }
            None => RatePolicy::new(
                Policy::sliding_window(100, Duration::from_secs(60))
                    .map_err(|source| invalid(default_tier, source))?,
            ),
        };
        let policies = tiers
            .into_iter()
            .fold(PolicyTable::new(default_policy), |table, (tier, policy)| {
                table.with_tier(tier, policy)
            });

        let default_circuit = match &self.default_circuit {
            Some(settings) => circuit_config("defaultCircuit", settings)?,
            None => CircuitBreakerConfig::default(),
        };
        let mut circuits = HashMap::new();
        for (dependency, settings) in &self.circuits {
            let name = format!("circuits.{}", dependency);
            circuits.insert(
                dependency.clone(),
                circuit_config_over(&name, settings, &default_circuit)?,
            );
        }

        let session = match &self.session {
            Some(settings) => session_config(settings)?,
            None => SessionConfig::default(),
        };

        Ok(ResilienceSettings {
            policies,
            default_circuit,
            circuits,
            session,
        })
    }
}

impl ResilienceSettings {
    /// Construct every component over `store`.
    pub fn assemble(&self, store: Arc<dyn SharedStore>, clock: Arc<dyn Clock>) -> Resilience {
        let metrics = Metrics::new();
        let limiter = RateLimiter::new(Arc::clone(&store), Arc::clone(&clock), metrics.clone());

        let breaker = CircuitBreaker::new(Arc::clone(&store), Arc::clone(&clock), metrics.clone())
            .with_validated_configs(self.default_circuit.clone(), self.circuits.clone());

        let sessions = SessionCoordinator::new(store, clock, metrics.clone())
            .with_validated_config(self.session.clone());

        Resilience {
            gate: AdmissionGate::new(limiter, self.policies.clone()),
            breaker,
            sessions,
            metrics,
        }
    }
}

fn invalid(policy: &str, source: PolicyError) -> ConfigError {
    ConfigError::InvalidPolicy {
        policy: policy.to_string(),
        source,
    }
}

fn required<T: Copy>(policy: &str, value: Option<T>, field: &'static str) -> Result<T, ConfigError> {
    value.ok_or_else(|| ConfigError::MissingField {
        policy: policy.to_string(),
        field,
    })
}

fn rate_policy(name: &str, settings: &RateLimitSettings) -> Result<RatePolicy, ConfigError> {
    let policy = match settings.algorithm {
        Algorithm::SlidingWindow => Policy::sliding_window(
            required(name, settings.max_requests, "maxRequests")?,
            Duration::from_millis(required(name, settings.window_ms, "windowMs")?),
        ),
        Algorithm::TokenBucket => Policy::token_bucket(
            required(name, settings.capacity, "capacity")?,
            required(name, settings.refill_rate_per_second, "refillRatePerSecond")?,
        ),
    }
    .map_err(|source| invalid(name, source))?;

    let mut rate_policy =
        RatePolicy::new(policy).with_fallback(settings.fallback_enabled.unwrap_or(true));
    if let Some(ms) = settings.store_timeout_ms {
        rate_policy = rate_policy
            .with_store_timeout(Duration::from_millis(ms))
            .map_err(|source| invalid(name, source))?;
    }
    Ok(rate_policy)
}

fn circuit_config(name: &str, settings: &CircuitSettings) -> Result<CircuitBreakerConfig, ConfigError> {
    circuit_config_over(name, settings, &CircuitBreakerConfig::default())
}

fn circuit_config_over(
    name: &str,
    settings: &CircuitSettings,
    base: &CircuitBreakerConfig,
) -> Result<CircuitBreakerConfig, ConfigError> {
    let config = CircuitBreakerConfig {
        failure_threshold: settings.failure_threshold.unwrap_or(base.failure_threshold),
        reset_timeout: settings
            .reset_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(base.reset_timeout),
        store_timeout: settings
            .store_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(base.store_timeout),
    };
    config.validate().map_err(|source| invalid(name, source))?;
    Ok(config)
}

fn session_config(settings: &SessionSettings) -> Result<SessionConfig, ConfigError> {
    let base = SessionConfig::default();
    let config = SessionConfig {
        ttl: settings
            .session_ttl_seconds
            .map(Duration::from_secs)
            .unwrap_or(base.ttl),
        store_timeout: settings
            .store_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(base.store_timeout),
        stale_read_window: settings
            .stale_read_window_ms
            .map(Duration::from_millis)
            .unwrap_or(base.stale_read_window),
        cleanup_interval: settings
            .cleanup_interval_seconds
            .map(Duration::from_secs)
            .unwrap_or(base.cleanup_interval),
    };
    config.validate().map_err(|source| invalid("session", source))?;
    Ok(config)
}
