//! Tiered policy selection.
//!
//! Picks the admission policy for a request (by caller role, endpoint weight,
//! ...) before the limiter runs. Selection is a pure lookup.

use std::collections::HashMap;

use crate::domain::policy::RatePolicy;

/// Named tiers mapped to policies, with a default for unknown tiers.
///
/// # Example
/// ```
/// use resilience_gate::{Policy, PolicyTable, RatePolicy};
/// use std::time::Duration;
///
/// let default = RatePolicy::new(Policy::sliding_window(100, Duration::from_secs(60)).unwrap());
/// let admin = RatePolicy::new(Policy::token_bucket(500.0, 50.0).unwrap());
///
/// let table = PolicyTable::new(default.clone()).with_tier("admin", admin.clone());
/// assert_eq!(table.select(Some("admin")), &admin);
/// assert_eq!(table.select(Some("guest")), &default);
/// assert_eq!(table.select(None), &default);
/// ```
#[derive(Debug, Clone)]
pub struct PolicyTable {
    tiers: HashMap<String, RatePolicy>,
    default: RatePolicy,
}

impl PolicyTable {
    /// Create a table with only a default policy.
    pub fn new(default: RatePolicy) -> Self {
        Self {
            tiers: HashMap::new(),
            default,
        }
    }

    /// Add or replace a named tier.
    pub fn with_tier(mut self, tier: impl Into<String>, policy: RatePolicy) -> Self {
        self.tiers.insert(tier.into(), policy);
        self
    }

    /// Policy for `tier`, or the default.
    pub fn select(&self, tier: Option<&str>) -> &RatePolicy {
        tier.and_then(|t| self.tiers.get(t)).unwrap_or(&self.default)
    }

    /// The default policy.
    pub fn default_policy(&self) -> &RatePolicy {
        &self.default
    }

    /// Number of named tiers.
    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    /// Whether there are no named tiers.
    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }
}
