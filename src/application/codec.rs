//! Encoding of records kept in the shared store.
//!
//! Fixed-shape hot-path records (circuit records, token buckets) use bincode.
//! Session records carry an arbitrary JSON payload and are stored as JSON.

use crate::application::ports::StoreError;
use crate::domain::bucket::TokenBucketState;
use crate::domain::circuit::CircuitRecord;
use crate::domain::session::SessionRecord;

/// A record that can be persisted in the shared store.
pub trait RecordCodec: Sized {
    /// Serialize for storage.
    fn encode(&self) -> Result<Vec<u8>, StoreError>;

    /// Deserialize from storage.
    fn decode(bytes: &[u8]) -> Result<Self, StoreError>;
}

impl RecordCodec for CircuitRecord {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serialize(self).map_err(|e| StoreError::Codec(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        bincode::deserialize(bytes).map_err(|e| StoreError::Codec(e.to_string()))
    }
}

impl RecordCodec for TokenBucketState {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serialize(self).map_err(|e| StoreError::Codec(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        bincode::deserialize(bytes).map_err(|e| StoreError::Codec(e.to_string()))
    }
}

impl RecordCodec for SessionRecord {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(self).map_err(|e| StoreError::Codec(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Codec(e.to_string()))
    }
}
