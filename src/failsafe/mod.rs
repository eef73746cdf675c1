//! Failsafe mechanisms: circuit breaker, retry, timeout, and their composition

mod circuit_breaker;
mod registry;
mod retry;
mod timeout;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerStats, CircuitState, StateTransition};
pub use registry::FailsafeRegistry;
pub use retry::{RetryCheck, RetryPolicy, with_retry, with_retry_cancellable};
pub use timeout::{OperationKind, TimeoutPolicy, with_timeout, with_timeout_cancellable};

use std::future::Future;
use std::panic::Location;
use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ResolvedDependency;
use crate::error::CallError;
use crate::failure::FailureDetails;
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::tracker::{ErrorContext, ErrorReport, ErrorTracker};

/// Everything that guards calls to one dependency.
///
/// `execute` nests the layers as breaker → retry → timeout → operation:
/// the breaker sees one outcome per logical call, an open breaker costs zero
/// attempts, and every attempt gets its own deadline.
pub struct Failsafe {
    name: String,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    timeout: TimeoutPolicy,
    critical: bool,
    tracker: Option<Arc<ErrorTracker>>,
    metrics: Arc<dyn MetricsSink>,
}

impl Failsafe {
    /// Create a new failsafe from resolved dependency settings
    #[must_use]
    pub fn new(name: &str, config: &ResolvedDependency) -> Self {
        Self {
            name: name.to_string(),
            breaker: Arc::new(CircuitBreaker::new(name, &config.circuit_breaker)),
            retry: RetryPolicy::new(name, &config.retry),
            timeout: TimeoutPolicy::new(config.timeout, name),
            critical: config.critical,
            tracker: None,
            metrics: Arc::new(NoopMetrics),
        }
    }

    /// Forward terminal failures to `tracker`
    #[must_use]
    pub fn with_tracker(mut self, tracker: Arc<ErrorTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Report calls and breaker transitions to `metrics`
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        let sink = Arc::clone(&metrics);
        self.breaker
            .on_state_change(move |t| sink.record_state_change(&t.dependency, t.to));
        self.metrics = metrics;
        self
    }

    /// Replace the retry policy
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Replace the per-attempt deadline
    #[must_use]
    pub fn with_timeout_policy(mut self, policy: TimeoutPolicy) -> Self {
        self.timeout = policy;
        self
    }

    /// Dependency name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Breaker for this dependency
    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Retry policy in use
    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Per-attempt deadline in use
    #[must_use]
    pub fn timeout_policy(&self) -> &TimeoutPolicy {
        &self.timeout
    }

    /// A failing check for this dependency makes the system unhealthy
    #[must_use]
    pub fn is_critical(&self) -> bool {
        self.critical
    }

    /// Run `f` through breaker, retry and timeout.
    ///
    /// `f` is invoked once per attempt. A tracked failure is attributed to
    /// the line that called `execute`.
    ///
    /// # Errors
    ///
    /// [`CallError::CircuitOpen`], [`CallError::Timeout`] or the last
    /// attempt's own failure.
    #[track_caller]
    pub fn execute<F, Fut, T, E>(&self, f: F) -> impl Future<Output = Result<T, CallError<E>>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: FailureDetails,
    {
        self.run(Location::caller(), ErrorContext::default(), None, f)
    }

    /// Like [`execute`](Self::execute), attaching `context` to a tracked failure
    ///
    /// # Errors
    ///
    /// As [`execute`](Self::execute).
    #[track_caller]
    pub fn execute_with_context<F, Fut, T, E>(
        &self,
        context: ErrorContext,
        f: F,
    ) -> impl Future<Output = Result<T, CallError<E>>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: FailureDetails,
    {
        self.run(Location::caller(), context, None, f)
    }

    /// Like [`execute_with_context`](Self::execute_with_context), abandoning
    /// the call as soon as `cancel` fires
    ///
    /// # Errors
    ///
    /// [`CallError::Aborted`] on cancellation, otherwise as [`execute`](Self::execute).
    #[track_caller]
    pub fn execute_cancellable<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        context: ErrorContext,
        f: F,
    ) -> impl Future<Output = Result<T, CallError<E>>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: FailureDetails,
    {
        self.run(Location::caller(), context, Some(cancel), f)
    }

    #[tracing::instrument(skip(self, call_site, context, cancel, f), fields(dependency = %self.name))]
    async fn run<F, Fut, T, E>(
        &self,
        call_site: &'static Location<'static>,
        context: ErrorContext,
        cancel: Option<&CancellationToken>,
        mut f: F,
    ) -> Result<T, CallError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: FailureDetails,
    {
        let start = Instant::now();
        let timeout = &self.timeout;

        let attempt = || {
            let fut = f();
            async move {
                match cancel {
                    Some(token) => with_timeout_cancellable(fut, timeout, token).await,
                    None => with_timeout(fut, timeout).await,
                }
            }
        };

        let result = self
            .breaker
            .execute(|| async move {
                match cancel {
                    Some(token) => with_retry_cancellable(&self.retry, token, attempt).await,
                    None => with_retry(&self.retry, attempt).await,
                }
            })
            .await;

        self.metrics
            .record_call(&self.name, result.is_ok(), start.elapsed());

        if let Err(e) = &result
            && !e.is_aborted()
            && let Some(tracker) = &self.tracker
        {
            let report = ErrorReport::from_failure_at(e, call_site)
                .with_frame(format!("{}::execute", self.name));
            tracker.track(report, context.with_dependency(&self.name));
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ReliabilityConfig, TrackerConfig};
    use crate::failure::DependencyError;
    use crate::tracker::ErrorCategory;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn failsafe(name: &str) -> Failsafe {
        let mut dep = ReliabilityConfig::default().dependency(name);
        dep.retry.jitter = false;
        dep.timeout = Duration::from_millis(200);
        Failsafe::new(name, &dep)
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_inside_one_breaker_outcome() {
        let fs = failsafe("openai");
        let calls = AtomicU32::new(0);

        let result: Result<(), CallError<DependencyError>> = fs
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DependencyError::http(503, "overloaded"))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.unwrap_err().into_operation().unwrap().status, Some(503));
        assert_eq!(fs.breaker().stats().total_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_attempt_gets_its_own_deadline() {
        let fs = failsafe("youtube");
        let calls = AtomicU32::new(0);

        let result: Result<u32, CallError<DependencyError>> = fs
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_costs_no_attempts() {
        let fs = failsafe("database");
        fs.breaker().force_open();
        let calls = AtomicU32::new(0);

        let result: Result<(), CallError<DependencyError>> = fs
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_failure_is_tracked_with_dependency() {
        let tracker = Arc::new(ErrorTracker::new(&TrackerConfig {
            default_rules: false,
            ..TrackerConfig::default()
        }));
        let fs = failsafe("database").with_tracker(Arc::clone(&tracker));

        let _: Result<(), CallError<DependencyError>> = fs
            .execute_with_context(ErrorContext::new().with_request_id("req-1"), || async {
                Err(DependencyError::new("QueryError", "relation \"videos\" does not exist"))
            })
            .await;

        let errors = tracker.get_errors(&Default::default());
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].category, ErrorCategory::Database);
        assert_eq!(errors[0].context.dependency.as_deref(), Some("database"));
        assert_eq!(errors[0].context.request_id.as_deref(), Some("req-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_sites_are_tracked_separately() {
        let tracker = Arc::new(ErrorTracker::new(&TrackerConfig {
            default_rules: false,
            ..TrackerConfig::default()
        }));
        let fs = failsafe("youtube").with_tracker(Arc::clone(&tracker));
        let bad_request = || async { Err::<(), _>(DependencyError::http(400, "bad request")) };

        let _ = fs.execute(bad_request).await;
        let _ = fs.execute(bad_request).await;
        let _ = fs.execute(bad_request).await;

        let errors = tracker.get_errors(&Default::default());
        assert_eq!(errors.len(), 3);
        for error in &errors {
            assert_eq!(error.count, 1);
            assert!(error.stack[0].starts_with(file!()), "{:?}", error.stack);
            assert_eq!(error.stack[1], "youtube::execute");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_call_site_is_deduplicated() {
        let tracker = Arc::new(ErrorTracker::new(&TrackerConfig {
            default_rules: false,
            ..TrackerConfig::default()
        }));
        let fs = failsafe("youtube").with_tracker(Arc::clone(&tracker));

        for _ in 0..2 {
            let _: Result<(), CallError<DependencyError>> = fs
                .execute(|| async { Err(DependencyError::http(400, "bad request")) })
                .await;
        }

        let errors = tracker.get_errors(&Default::default());
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_call_is_neither_counted_nor_tracked() {
        let tracker = Arc::new(ErrorTracker::new(&TrackerConfig::default()));
        let fs = failsafe("openai").with_tracker(Arc::clone(&tracker));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<(), CallError<DependencyError>> = fs
            .execute_cancellable(&cancel, ErrorContext::new(), || async { Ok(()) })
            .await;

        assert!(result.unwrap_err().is_aborted());
        assert_eq!(fs.breaker().stats().total_failures, 0);
        assert_eq!(tracker.get_error_stats().unique_errors, 0);
    }
}
