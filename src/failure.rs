//! What the reliability layer is allowed to know about a failed call
//!
//! The layer never interprets call semantics. It only looks at a failure's
//! type-like kind, its message, an HTTP-like status and a transport error code.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::error::CallError;

/// Inspectable surface of a failure
pub trait FailureDetails: fmt::Display {
    /// Type-like name (`"ValidationError"`, `"TimeoutError"`, ...)
    fn kind(&self) -> &str;

    /// HTTP-like status code, if the failure carries one
    fn status_code(&self) -> Option<u16> {
        None
    }

    /// Transport error code (`"ECONNRESET"`, `"ETIMEDOUT"`, ...)
    fn error_code(&self) -> Option<&str> {
        None
    }
}

/// A ready-made failure value for wrapped calls
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct DependencyError {
    /// Type-like name
    pub kind: String,
    /// Human-readable message
    pub message: String,
    /// HTTP-like status
    pub status: Option<u16>,
    /// Transport error code
    pub code: Option<String>,
}

impl DependencyError {
    /// Create a failure with a kind and message
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            status: None,
            code: None,
        }
    }

    /// Failure carrying an HTTP-like status
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::new("HttpError", message).with_status(status)
    }

    /// Transport-level failure carrying an error code
    pub fn network(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new("NetworkError", message).with_code(code)
    }

    /// Attach a status
    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Attach an error code
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl FailureDetails for DependencyError {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn status_code(&self) -> Option<u16> {
        self.status
    }

    fn error_code(&self) -> Option<&str> {
        self.code.as_deref()
    }
}

impl<E: FailureDetails> FailureDetails for CallError<E> {
    fn kind(&self) -> &str {
        match self {
            Self::CircuitOpen(_) => "CircuitBreakerError",
            Self::Timeout(_) => "TimeoutError",
            Self::Aborted => "AbortError",
            Self::Operation(e) => e.kind(),
        }
    }

    fn status_code(&self) -> Option<u16> {
        match self {
            Self::Operation(e) => e.status_code(),
            _ => None,
        }
    }

    fn error_code(&self) -> Option<&str> {
        match self {
            Self::Timeout(_) => Some("ETIMEDOUT"),
            Self::Operation(e) => e.error_code(),
            _ => None,
        }
    }
}

impl FailureDetails for io::Error {
    fn kind(&self) -> &str {
        "IoError"
    }

    fn error_code(&self) -> Option<&str> {
        match io::Error::kind(self) {
            io::ErrorKind::ConnectionReset => Some("ECONNRESET"),
            io::ErrorKind::ConnectionRefused => Some("ECONNREFUSED"),
            io::ErrorKind::ConnectionAborted => Some("ECONNABORTED"),
            io::ErrorKind::TimedOut => Some("ETIMEDOUT"),
            io::ErrorKind::NotFound => Some("ENOENT"),
            io::ErrorKind::PermissionDenied => Some("EACCES"),
            io::ErrorKind::BrokenPipe => Some("EPIPE"),
            _ => None,
        }
    }
}

impl FailureDetails for reqwest::Error {
    fn kind(&self) -> &str {
        "HttpError"
    }

    fn status_code(&self) -> Option<u16> {
        self.status().map(|s| s.as_u16())
    }

    fn error_code(&self) -> Option<&str> {
        if self.is_timeout() {
            Some("ETIMEDOUT")
        } else if self.is_connect() {
            Some("ECONNREFUSED")
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TimeoutError;

    #[test]
    fn test_call_error_delegates_to_operation() {
        let err: CallError<DependencyError> =
            CallError::Operation(DependencyError::http(503, "Service Unavailable"));
        assert_eq!(err.kind(), "HttpError");
        assert_eq!(err.status_code(), Some(503));
    }

    #[test]
    fn test_timeout_reports_etimedout() {
        let err: CallError<DependencyError> = CallError::Timeout(TimeoutError {
            message: "slow".to_string(),
            timeout_ms: 10,
        });
        assert_eq!(err.kind(), "TimeoutError");
        assert_eq!(err.error_code(), Some("ETIMEDOUT"));
    }

    #[test]
    fn test_io_error_codes() {
        let err = io::Error::from(io::ErrorKind::ConnectionReset);
        assert_eq!(FailureDetails::error_code(&err), Some("ECONNRESET"));
        let err = io::Error::other("boom");
        assert_eq!(FailureDetails::error_code(&err), None);
    }
}
