//! Session records and their lifecycle.

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Number of random bytes in a session identifier.
const SESSION_ID_BYTES: usize = 32;

/// Opaque, unguessable session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a new identifier from the thread-local CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; SESSION_ID_BYTES];
        rand::rng().fill(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// Wrap an identifier received from a client.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Lifecycle of a session. `Expired` and `Destroyed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Usable
    Active,
    /// TTL elapsed without access
    Expired,
    /// Explicitly ended
    Destroyed,
}

/// A principal's session as persisted in the shared store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Owning principal
    pub user_id: String,
    /// Opaque principal data
    pub payload: Value,
    /// Unix ms of creation
    pub created_at_ms: u64,
    /// Unix ms of the last successful read or update
    pub last_accessed_at_ms: u64,
    /// Unix ms after which the session is absent
    pub expires_at_ms: u64,
    /// Sliding expiration period
    pub ttl_ms: u64,
    /// False once destroyed
    pub is_active: bool,
}

impl SessionRecord {
    /// A new active session.
    pub fn new(user_id: impl Into<String>, payload: Value, now_ms: u64, ttl: Duration) -> Self {
        let ttl_ms = duration_ms(ttl);
        Self {
            user_id: user_id.into(),
            payload,
            created_at_ms: now_ms,
            last_accessed_at_ms: now_ms,
            expires_at_ms: now_ms.saturating_add(ttl_ms),
            ttl_ms,
            is_active: true,
        }
    }

    /// Current lifecycle status.
    pub fn status(&self, now_ms: u64) -> SessionStatus {
        if !self.is_active {
            SessionStatus::Destroyed
        } else if now_ms > self.expires_at_ms {
            SessionStatus::Expired
        } else {
            SessionStatus::Active
        }
    }

    /// Whether the session may be used at `now_ms`.
    pub fn is_live(&self, now_ms: u64) -> bool {
        self.status(now_ms) == SessionStatus::Active
    }

    /// Sliding expiration: record an access and push expiry out by the TTL.
    pub fn touch(&mut self, now_ms: u64) {
        self.last_accessed_at_ms = self.last_accessed_at_ms.max(now_ms);
        self.expires_at_ms = self.last_accessed_at_ms.saturating_add(self.ttl_ms);
    }

    /// Time left before expiry, zero if already expired.
    pub fn remaining_ttl(&self, now_ms: u64) -> Duration {
        Duration::from_millis(self.expires_at_ms.saturating_sub(now_ms))
    }

    /// Apply a partial update.
    pub fn apply(&mut self, patch: SessionPatch) {
        if let Some(payload) = patch.payload {
            self.payload = payload;
        }
        if !patch.payload_fields.is_empty() {
            if !self.payload.is_object() {
                self.payload = Value::Object(serde_json::Map::new());
            }
            if let Value::Object(map) = &mut self.payload {
                for (field, value) in patch.payload_fields {
                    map.insert(field, value);
                }
            }
        }
        if let Some(ttl) = patch.ttl {
            self.ttl_ms = duration_ms(ttl);
            self.expires_at_ms = self.last_accessed_at_ms.saturating_add(self.ttl_ms);
        }
    }
}

/// Partial update for `SessionCoordinator::update`.
///
/// # Example
/// ```
/// use resilience_gate::SessionPatch;
/// use serde_json::json;
///
/// let patch = SessionPatch::new()
///     .with_payload_field("role", json!("admin"))
///     .with_payload_field("tenant", json!(42));
/// assert!(!patch.is_empty());
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionPatch {
    payload: Option<Value>,
    payload_fields: Vec<(String, Value)>,
    ttl: Option<Duration>,
}

impl SessionPatch {
    /// An empty patch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole payload.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Set one top-level field of an object payload, applied after any
    /// whole-payload replacement.
    pub fn with_payload_field(mut self, field: impl Into<String>, value: Value) -> Self {
        self.payload_fields.push((field.into(), value));
        self
    }

    /// Change the sliding expiration period.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Whether the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        self.payload.is_none() && self.payload_fields.is_empty() && self.ttl.is_none()
    }
}

fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX)
}
