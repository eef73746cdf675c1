//! Deadline guard for a single operation attempt

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{CallError, TimeoutError};

/// Kind of work being guarded. Each kind has its own natural duration, so
/// each gets its own default deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Single database query; a hang holds a pooled connection
    DatabaseQuery,
    /// Generic remote API request
    #[default]
    ExternalApi,
    /// LLM / generation request
    AiGeneration,
    /// Liveness or readiness probe
    HealthCheck,
    /// Large media upload
    FileUpload,
    /// Transcode or other long media job
    VideoProcessing,
}

impl OperationKind {
    /// Default per-attempt deadline
    #[must_use]
    pub fn default_timeout(self) -> Duration {
        match self {
            Self::DatabaseQuery | Self::HealthCheck => Duration::from_secs(5),
            Self::ExternalApi => Duration::from_secs(30),
            Self::AiGeneration => Duration::from_secs(120),
            Self::FileUpload => Duration::from_secs(30 * 60),
            Self::VideoProcessing => Duration::from_secs(20 * 60),
        }
    }

    /// Name used in messages and logs
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DatabaseQuery => "database query",
            Self::ExternalApi => "external API call",
            Self::AiGeneration => "AI generation",
            Self::HealthCheck => "health check",
            Self::FileUpload => "file upload",
            Self::VideoProcessing => "video processing",
        }
    }
}

/// Deadline and failure message for one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutPolicy {
    /// Deadline
    pub duration: Duration,
    /// Message template; `{timeout_ms}` and `{operation}` are substituted
    pub message: String,
    /// Label substituted for `{operation}`
    pub operation: String,
}

impl TimeoutPolicy {
    /// Policy with the default message
    pub fn new(duration: Duration, operation: impl Into<String>) -> Self {
        Self {
            duration,
            message: "{operation} timed out after {timeout_ms}ms".to_string(),
            operation: operation.into(),
        }
    }

    /// Policy with the default deadline for `kind`
    #[must_use]
    pub fn for_kind(kind: OperationKind) -> Self {
        Self::new(kind.default_timeout(), kind.as_str())
    }

    /// Replace the message template
    #[must_use]
    pub fn with_message(mut self, template: impl Into<String>) -> Self {
        self.message = template.into();
        self
    }

    /// Deadline in whole milliseconds
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn timeout_ms(&self) -> u64 {
        self.duration.as_millis() as u64
    }

    /// Build the failure reported when the deadline elapses
    #[must_use]
    pub fn error(&self) -> TimeoutError {
        let timeout_ms = self.timeout_ms();
        TimeoutError {
            message: self
                .message
                .replace("{timeout_ms}", &timeout_ms.to_string())
                .replace("{operation}", &self.operation),
            timeout_ms,
        }
    }
}

/// Race `fut` against the policy's deadline.
///
/// Whichever settles first decides the outcome. On timeout the operation
/// future is dropped, so its later completion can never be observed.
///
/// # Errors
///
/// [`CallError::Timeout`] if the deadline elapses first, otherwise the
/// operation's own error as [`CallError::Operation`].
pub async fn with_timeout<Fut, T, E>(fut: Fut, policy: &TimeoutPolicy) -> Result<T, CallError<E>>
where
    Fut: Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(policy.duration, fut).await {
        Ok(result) => result.map_err(CallError::Operation),
        Err(_) => {
            debug!(operation = %policy.operation, timeout_ms = policy.timeout_ms(), "Deadline elapsed");
            Err(CallError::Timeout(policy.error()))
        }
    }
}

/// Like [`with_timeout`], but the caller may cancel through `cancel`.
///
/// Cancellation yields [`CallError::Aborted`], never a timeout, and the
/// pending timer is dropped with the losing branches.
///
/// # Errors
///
/// [`CallError::Aborted`], [`CallError::Timeout`] or the operation's error.
pub async fn with_timeout_cancellable<Fut, T, E>(
    fut: Fut,
    policy: &TimeoutPolicy,
    cancel: &CancellationToken,
) -> Result<T, CallError<E>>
where
    Fut: Future<Output = Result<T, E>>,
{
    if cancel.is_cancelled() {
        return Err(CallError::Aborted);
    }

    tokio::select! {
        biased;
        () = cancel.cancelled() => {
            debug!(operation = %policy.operation, "Operation aborted by caller");
            Err(CallError::Aborted)
        }
        result = with_timeout(fut, policy) => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::DependencyError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::sleep;

    fn policy(ms: u64) -> TimeoutPolicy {
        TimeoutPolicy::new(Duration::from_millis(ms), "test op")
    }

    #[tokio::test(start_paused = true)]
    async fn test_completes_before_deadline() {
        let result: Result<u32, CallError<DependencyError>> = with_timeout(
            async {
                sleep(Duration::from_millis(40)).await;
                Ok(7)
            },
            &policy(50),
        )
        .await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_misses_deadline() {
        let settled = Arc::new(AtomicU32::new(0));
        let settled_in_op = Arc::clone(&settled);

        let result: Result<u32, CallError<DependencyError>> = with_timeout(
            async move {
                sleep(Duration::from_millis(60)).await;
                settled_in_op.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            },
            &policy(50),
        )
        .await;

        match result {
            Err(CallError::Timeout(e)) => {
                assert_eq!(e.timeout_ms, 50);
                assert_eq!(e.message, "test op timed out after 50ms");
            }
            other => panic!("expected timeout, got {other:?}"),
        }

        // The late completion is never observed
        sleep(Duration::from_millis(100)).await;
        assert_eq!(settled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_error_passes_through() {
        let result: Result<(), CallError<DependencyError>> = with_timeout(
            async { Err(DependencyError::http(400, "bad request")) },
            &policy(50),
        )
        .await;
        let err = result.unwrap_err().into_operation().unwrap();
        assert_eq!(err.status, Some(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_wins_over_timer() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let result: Result<(), CallError<DependencyError>> = with_timeout_cancellable(
            async {
                sleep(Duration::from_secs(10)).await;
                Ok(())
            },
            &policy(50),
            &cancel,
        )
        .await;
        assert!(result.unwrap_err().is_aborted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_cancelled_never_polls() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let polled = AtomicU32::new(0);

        let result: Result<(), CallError<DependencyError>> = with_timeout_cancellable(
            async {
                polled.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            &policy(50),
            &cancel,
        )
        .await;
        assert!(result.unwrap_err().is_aborted());
        assert_eq!(polled.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_custom_message_template() {
        let policy = TimeoutPolicy::for_kind(OperationKind::DatabaseQuery)
            .with_message("query exceeded {timeout_ms}ms");
        let err = policy.error();
        assert_eq!(err.message, "query exceeded 5000ms");
        assert_eq!(err.timeout_ms, 5000);
    }

    #[test]
    fn test_media_deadlines_are_long() {
        assert!(OperationKind::FileUpload.default_timeout() >= Duration::from_secs(600));
        assert!(OperationKind::DatabaseQuery.default_timeout() <= Duration::from_secs(10));
    }
}
