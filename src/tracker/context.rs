//! Structured error context and the raw error report handed to the tracker

use std::collections::BTreeMap;
use std::panic::Location;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::failure::FailureDetails;

/// Where and for whom an error happened.
///
/// Fixed fields cover what every call site knows; `extra` is the open
/// extension map for anything else.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorContext {
    /// Authenticated user
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Request correlation id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Request or upstream URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// HTTP method
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Route / endpoint name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Dependency the failing call went to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dependency: Option<String>,
    /// Anything else
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl ErrorContext {
    /// Empty context
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the user id
    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Set the request id
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Set the URL
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Set the HTTP method
    #[must_use]
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    /// Set the endpoint
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Set the dependency
    #[must_use]
    pub fn with_dependency(mut self, dependency: impl Into<String>) -> Self {
        self.dependency = Some(dependency.into());
        self
    }

    /// Add an extension value
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Fold a newer context into this one; fields set in `newer` win
    pub fn merge(&mut self, newer: ErrorContext) {
        fn take(slot: &mut Option<String>, value: Option<String>) {
            if value.is_some() {
                *slot = value;
            }
        }
        take(&mut self.user_id, newer.user_id);
        take(&mut self.request_id, newer.request_id);
        take(&mut self.url, newer.url);
        take(&mut self.method, newer.method);
        take(&mut self.endpoint, newer.endpoint);
        take(&mut self.dependency, newer.dependency);
        self.extra.extend(newer.extra);
    }

    /// Whether the request hit a liveness/readiness endpoint
    #[must_use]
    pub fn is_health_endpoint(&self) -> bool {
        [self.endpoint.as_deref(), self.url.as_deref()]
            .into_iter()
            .flatten()
            .any(|p| {
                request_path(p)
                    .split('/')
                    .any(|segment| HEALTH_SEGMENTS.iter().any(|h| segment.eq_ignore_ascii_case(h)))
            })
    }
}

/// Path segments that name a liveness/readiness endpoint
const HEALTH_SEGMENTS: &[&str] = &["health", "healthz", "ready", "readyz", "live", "livez"];

/// Path part of a URL or endpoint, without scheme, host, query or fragment
fn request_path(target: &str) -> &str {
    let path = match target.split_once("://") {
        Some((_, rest)) => rest.find('/').map_or("", |i| &rest[i..]),
        None => target,
    };
    path.split(['?', '#']).next().unwrap_or_default()
}

/// One raw error occurrence
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    /// Type-like name
    pub kind: String,
    /// Message as raised
    pub message: String,
    /// HTTP-like status
    pub status: Option<u16>,
    /// Transport error code
    pub code: Option<String>,
    /// Call-site frames, innermost first
    pub stack: Vec<String>,
}

impl ErrorReport {
    /// Report without call-site information
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            status: None,
            code: None,
            stack: Vec::new(),
        }
    }

    /// Report from a call failure; the caller's location becomes the first frame
    #[track_caller]
    pub fn from_failure<F: FailureDetails + ?Sized>(failure: &F) -> Self {
        Self::from_failure_at(failure, Location::caller())
    }

    /// Report from a call failure raised at `location`
    pub fn from_failure_at<F: FailureDetails + ?Sized>(failure: &F, location: &Location<'_>) -> Self {
        Self {
            kind: failure.kind().to_string(),
            message: failure.to_string(),
            status: failure.status_code(),
            code: failure.error_code().map(str::to_string),
            stack: vec![caller_frame(location)],
        }
    }

    /// Report from any error; the source chain is appended to the message
    #[track_caller]
    pub fn from_error<E: std::error::Error + ?Sized>(error: &E) -> Self {
        let mut message = error.to_string();
        let mut source = error.source();
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        Self {
            kind: "Error".to_string(),
            message,
            status: None,
            code: None,
            stack: vec![caller_frame(Location::caller())],
        }
    }

    /// Replace the type-like name
    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
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

    /// Replace the frames
    #[must_use]
    pub fn with_stack<I, S>(mut self, frames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stack = frames.into_iter().map(Into::into).collect();
        self
    }

    /// Push an outer frame
    #[must_use]
    pub fn with_frame(mut self, frame: impl Into<String>) -> Self {
        self.stack.push(frame.into());
        self
    }
}

fn caller_frame(location: &Location<'_>) -> String {
    format!("{}:{}", location.file(), location.line())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::DependencyError;

    #[test]
    fn test_merge_prefers_newer_fields() {
        let mut ctx = ErrorContext::new()
            .with_user("u1")
            .with_url("/api/videos")
            .with_extra("attempt", 1);
        ctx.merge(
            ErrorContext::new()
                .with_request_id("req-9")
                .with_url("/api/videos/42")
                .with_extra("attempt", 2)
                .with_extra("region", "eu"),
        );

        assert_eq!(ctx.user_id.as_deref(), Some("u1"));
        assert_eq!(ctx.request_id.as_deref(), Some("req-9"));
        assert_eq!(ctx.url.as_deref(), Some("/api/videos/42"));
        assert_eq!(ctx.extra["attempt"], Value::from(2));
        assert_eq!(ctx.extra["region"], Value::from("eu"));
    }

    #[test]
    fn test_health_endpoint_detection() {
        assert!(ErrorContext::new().with_endpoint("/api/health").is_health_endpoint());
        assert!(ErrorContext::new().with_url("http://x/readyz").is_health_endpoint());
        assert!(!ErrorContext::new().with_url("/api/videos").is_health_endpoint());
        assert!(ErrorContext::new().with_url("https://svc:8080/livez?full=1").is_health_endpoint());
    }

    #[test]
    fn test_health_lookalike_paths_are_not_health_endpoints() {
        for path in [
            "/api/livestreams/42",
            "/api/healthcare-providers",
            "/api/already-seen",
            "https://health.example.com/api/videos",
            "/api/videos?next=/health",
        ] {
            assert!(
                !ErrorContext::new().with_url(path).is_health_endpoint(),
                "{path} treated as a health endpoint"
            );
        }
    }

    #[test]
    fn test_from_failure_records_call_site() {
        let report = ErrorReport::from_failure(&DependencyError::http(502, "Bad Gateway"));
        assert_eq!(report.kind, "HttpError");
        assert_eq!(report.status, Some(502));
        assert_eq!(report.stack.len(), 1);
        assert!(report.stack[0].contains("context.rs"));
    }

    #[test]
    fn test_from_error_includes_source_chain() {
        let inner = std::io::Error::other("disk full");
        let outer = crate::Error::Io(inner);
        let report = ErrorReport::from_error(&outer);
        assert_eq!(report.message, "IO error: disk full: disk full");
    }
}
