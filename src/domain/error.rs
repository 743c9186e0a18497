//! Error taxonomy shared by every component.

use std::fmt;

/// Exhaustive classification of everything that can go wrong (or merely say
/// "no") inside the core.
///
/// Every error type exposed by this crate reports its kind, so callers can
/// branch on the taxonomy without inspecting concrete error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A unit of work was rejected by the rate limiter. Expected, not a fault.
    AdmissionDenied,
    /// A guarded dependency failed, or its circuit is open. Also covers a
    /// stored record that can no longer be decoded.
    DependencyFailure,
    /// The shared store could not be reached in time.
    StoreUnavailable,
    /// A policy or configuration value is invalid.
    Configuration,
}

impl ErrorKind {
    /// Whether an error of this kind may be surfaced to the end caller.
    ///
    /// Store outages and throttling are absorbed by the core and turned into
    /// degraded decisions or ordinary responses instead.
    pub fn is_caller_visible(&self) -> bool {
        matches!(self, ErrorKind::DependencyFailure | ErrorKind::Configuration)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::AdmissionDenied => "admission denied",
            ErrorKind::DependencyFailure => "dependency failure",
            ErrorKind::StoreUnavailable => "store unavailable",
            ErrorKind::Configuration => "configuration error",
        };
        f.write_str(name)
    }
}
