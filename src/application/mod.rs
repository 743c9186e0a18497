//! Application layer - orchestration of domain logic.
//!
//! This layer coordinates the domain logic and manages the runtime behavior:
//! - Rate limiter (store-backed admission with in-process fallback)
//! - Circuit breaker (per-dependency guard with single-flight probes)
//! - Session coordinator (shared sessions with a fail-closed cache)
//! - Admission gate (request interceptor)
//! - Background cleanup tasks and declarative configuration
//!
//! ## Ports
//!
//! The application layer defines ports (traits) that infrastructure
//! adapters must implement. This keeps the application layer independent
//! from infrastructure details.

pub(crate) mod cas;
pub mod circuit_breaker;
pub mod cleanup;
pub mod codec;
pub mod config;
pub(crate) mod deadline;
pub mod fallback;
pub mod gate;
pub mod limiter;
pub mod metrics;
pub mod ports;
pub mod session;
