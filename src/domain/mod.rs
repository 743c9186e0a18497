//! Domain layer - pure types and algorithms with no I/O.
//!
//! This layer contains the core concepts and invariants of the system:
//! - Admission policies and their validation
//! - Sliding window and token bucket arithmetic
//! - The circuit breaker transition law
//! - Session records and their lifecycle
//! - Store key namespaces and the error taxonomy
//!
//! All types in this layer are pure and easily testable.

pub mod bucket;
pub mod circuit;
pub mod decision;
pub mod error;
pub mod keys;
pub mod policy;
pub mod session;
pub mod tier;
pub mod window;
