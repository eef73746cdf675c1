//! Error types for callguard

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for callguard
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the layer itself (configuration, alert delivery)
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Alert channel delivery failed
    #[error("Alert channel error: {0}")]
    Channel(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Raised when a circuit breaker refuses to invoke its dependency
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Circuit breaker for '{dependency}' is open, retry in {} seconds", retry_after.as_secs())]
pub struct CircuitOpenError {
    /// Dependency the breaker protects
    pub dependency: String,
    /// Time left until the breaker admits a trial call
    pub retry_after: Duration,
}

/// Raised when an operation misses its deadline
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct TimeoutError {
    /// Rendered timeout message
    pub message: String,
    /// Deadline that elapsed, in milliseconds
    pub timeout_ms: u64,
}

/// Outcome of a guarded call.
///
/// The layer adds exactly three failure kinds of its own. Everything the
/// dependency itself raised is carried unchanged in [`CallError::Operation`].
#[derive(Error, Debug)]
pub enum CallError<E> {
    /// We refused to call the dependency
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    /// The dependency was too slow
    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    /// The caller cancelled the call
    #[error("Operation aborted")]
    Aborted,

    /// The dependency itself failed
    #[error(transparent)]
    Operation(E),
}

impl<E> CallError<E> {
    /// `true` when the breaker short-circuited the call
    #[must_use]
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen(_))
    }

    /// `true` when the deadline elapsed
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// `true` when the caller cancelled
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    /// Borrow the dependency's own error, if that is what this is
    #[must_use]
    pub fn operation(&self) -> Option<&E> {
        match self {
            Self::Operation(e) => Some(e),
            _ => None,
        }
    }

    /// Take the dependency's own error, if that is what this is
    pub fn into_operation(self) -> Option<E> {
        match self {
            Self::Operation(e) => Some(e),
            _ => None,
        }
    }

    /// Map the dependency error, keeping layer failures as they are
    pub fn map_operation<F, U>(self, f: F) -> CallError<U>
    where
        F: FnOnce(E) -> U,
    {
        match self {
            Self::CircuitOpen(e) => CallError::CircuitOpen(e),
            Self::Timeout(e) => CallError::Timeout(e),
            Self::Aborted => CallError::Aborted,
            Self::Operation(e) => CallError::Operation(f(e)),
        }
    }
}

impl<E> CallError<CallError<E>> {
    /// Collapse a nested outcome, e.g. a deadline placed around a retry loop
    pub fn flatten(self) -> CallError<E> {
        match self {
            Self::CircuitOpen(e) => CallError::CircuitOpen(e),
            Self::Timeout(e) => CallError::Timeout(e),
            Self::Aborted => CallError::Aborted,
            Self::Operation(inner) => inner,
        }
    }
}
