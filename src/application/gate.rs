//! Request interceptor combining admission control with handler outcomes.
//!
//! The dispatch layer wraps each handler in `AdmissionGate::handle` and gets
//! back an `Outcome` it can render directly. A throttled request never reaches
//! its handler, and an open circuit is reported separately from throttling.

use std::future::Future;
use std::time::Duration;

use crate::application::circuit_breaker::ExecuteError;
use crate::application::limiter::RateLimiter;
use crate::domain::error::ErrorKind;
use crate::domain::tier::PolicyTable;

/// Identity of an inbound unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    key: String,
    tier: Option<String>,
}

impl RequestContext {
    /// A request limited under `key` (e.g. `ip:1.2.3.4` or `user:42`).
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            tier: None,
        }
    }

    /// Select the policy tier (caller role, endpoint weight, ...).
    pub fn with_tier(mut self, tier: impl Into<String>) -> Self {
        self.tier = Some(tier.into());
        self
    }

    /// Limiter key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Policy tier, if any.
    pub fn tier(&self) -> Option<&str> {
        self.tier.as_deref()
    }
}

/// What happened to a request passed through the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T, E> {
    /// The handler ran and succeeded (possibly through a fallback)
    Completed(T),
    /// The request was over its limit; the handler did not run
    Throttled {
        /// How long the caller should wait before retrying
        retry_after: Duration,
        /// Unix ms at which the limit next relaxes
        reset_at_ms: u64,
    },
    /// A guarded dependency's circuit is open and no fallback absorbed it
    Unavailable {
        /// Dependency whose circuit is open
        dependency: String,
    },
    /// The handler failed
    Failed(E),
}

impl<T, E> Outcome<T, E> {
    /// HTTP-style status for the dispatch layer.
    pub fn status_code(&self) -> u16 {
        match self {
            Outcome::Completed(_) => 200,
            Outcome::Throttled { .. } => 429,
            Outcome::Unavailable { .. } => 503,
            Outcome::Failed(_) => 500,
        }
    }

    /// Taxonomy of a non-completed outcome.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Outcome::Completed(_) => None,
            Outcome::Throttled { .. } => Some(ErrorKind::AdmissionDenied),
            Outcome::Unavailable { .. } | Outcome::Failed(_) => {
                Some(ErrorKind::DependencyFailure)
            }
        }
    }

    /// Whether the handler ran and succeeded.
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed(_))
    }
}

impl<T, E> From<Result<T, ExecuteError<E>>> for Outcome<T, E> {
    fn from(result: Result<T, ExecuteError<E>>) -> Self {
        match result {
            Ok(value) => Outcome::Completed(value),
            Err(ExecuteError::Open { dependency }) => Outcome::Unavailable { dependency },
            Err(ExecuteError::Dependency(e)) => Outcome::Failed(e),
            Err(ExecuteError::Fallback { fallback, .. }) => Outcome::Failed(fallback),
        }
    }
}

/// Admits requests against a tiered policy table before running handlers.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    limiter: RateLimiter,
    policies: PolicyTable,
}

impl AdmissionGate {
    /// Create a gate.
    pub fn new(limiter: RateLimiter, policies: PolicyTable) -> Self {
        Self { limiter, policies }
    }

    /// The limiter behind this gate.
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// The policy table.
    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    /// Admit `ctx` and, if allowed, run `handler`.
    ///
    /// The handler reports dependency errors as `ExecuteError`, which is what
    /// `CircuitBreaker::execute` returns.
    pub async fn handle<T, E, F, Fut>(&self, ctx: &RequestContext, handler: F) -> Outcome<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ExecuteError<E>>>,
    {
        let policy = self.policies.select(ctx.tier());
        let decision = self.limiter.admit(ctx.key(), policy).await;

        if !decision.allowed {
            let retry_after = decision.retry_after(self.limiter.now_millis());
            tracing::debug!(
                key = %ctx.key(),
                tier = ctx.tier().unwrap_or("default"),
                retry_after_ms = retry_after.as_millis() as u64,
                "Request throttled"
            );
            return Outcome::Throttled {
                retry_after,
                reset_at_ms: decision.reset_at_ms,
            };
        }

        let outcome = Outcome::from(handler().await);
        if let Outcome::Unavailable { dependency } = &outcome {
            tracing::debug!(key = %ctx.key(), dependency = %dependency, "Dependency unavailable");
        }
        outcome
    }
}
