//! Retry logic with exponential backoff

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{RetryConfig, RetryOn};
use crate::error::CallError;
use crate::failure::FailureDetails;

/// Programmatic retry predicate that replaces the data-driven `RetryOn` rules
#[derive(Clone)]
pub struct RetryCheck(Arc<dyn Fn(&dyn FailureDetails) -> bool + Send + Sync>);

impl RetryCheck {
    /// Wrap a predicate
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&dyn FailureDetails) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }
}

impl fmt::Debug for RetryCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RetryCheck(..)")
    }
}

/// Named, immutable retry policy
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Policy name (shows up in logs)
    pub name: String,
    /// Whether retries are enabled
    pub enabled: bool,
    /// Maximum attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Upper bound for any delay
    pub max_delay: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
    /// Randomize delays within ±50%
    pub jitter: bool,
    /// Data-driven retryable rules
    pub retry_on: RetryOn,
    check: Option<RetryCheck>,
}

impl RetryPolicy {
    /// Create from config
    pub fn new(name: impl Into<String>, config: &RetryConfig) -> Self {
        Self {
            name: name.into(),
            enabled: config.enabled,
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            multiplier: config.multiplier,
            jitter: config.jitter,
            retry_on: config.retry_on.clone(),
            check: None,
        }
    }

    /// AI provider preset
    #[must_use]
    pub fn ai_api() -> Self {
        Self::new("ai_api", &RetryConfig::ai_api())
    }

    /// Video platform preset
    #[must_use]
    pub fn video_platform() -> Self {
        Self::new("video_platform", &RetryConfig::video_platform())
    }

    /// Database preset
    #[must_use]
    pub fn database() -> Self {
        Self::new("database", &RetryConfig::database())
    }

    /// Generic network preset
    #[must_use]
    pub fn network() -> Self {
        Self::new("network", &RetryConfig::network())
    }

    /// Large upload preset
    #[must_use]
    pub fn file_upload() -> Self {
        Self::new("file_upload", &RetryConfig::file_upload())
    }

    /// Replace the retryable rules with a predicate
    #[must_use]
    pub fn with_check(mut self, check: RetryCheck) -> Self {
        self.check = Some(check);
        self
    }

    /// Toggle jitter
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Un-jittered delay after `attempt` (1-based) failed:
    /// `min(max_delay, base_delay * multiplier^(attempt - 1))`
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.multiplier.max(1.0).powi(exponent);
        let millis = self.base_delay.as_secs_f64() * 1000.0 * factor;
        let max_millis = self.max_delay.as_secs_f64() * 1000.0;

        if !millis.is_finite() || millis >= max_millis {
            return self.max_delay;
        }
        Duration::from_secs_f64(millis.max(0.0) / 1000.0)
    }

    /// Delay actually slept after `attempt` failed, jitter included.
    ///
    /// Jitter scales the backoff by a uniform factor in `[0.5, 1.5)` and the
    /// result is capped at `max_delay` again.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        if !self.jitter {
            return base;
        }
        let factor = 0.5 + rand::random::<f64>();
        base.mul_f64(factor).min(self.max_delay)
    }

    /// Whether `failure` warrants another attempt
    pub fn is_retryable(&self, failure: &dyn FailureDetails) -> bool {
        if let Some(check) = &self.check {
            return (check.0)(failure);
        }

        let rules = &self.retry_on;
        if failure.kind() == "TimeoutError" {
            return rules.retry_timeouts;
        }
        if let Some(code) = failure.error_code()
            && rules.error_codes.iter().any(|c| c.eq_ignore_ascii_case(code))
        {
            return true;
        }
        if let Some(status) = failure.status_code() {
            if rules.status_codes.contains(&status) {
                return true;
            }
            if rules.retry_server_errors && (500..600).contains(&status) {
                return true;
            }
            // A definite client-side status is never worth repeating
            if (400..500).contains(&status) {
                return false;
            }
        }
        if rules.message_patterns.is_empty() {
            return false;
        }
        let message = failure.to_string().to_lowercase();
        rules
            .message_patterns
            .iter()
            .any(|p| message.contains(&p.to_lowercase()))
    }

    fn should_retry<E: FailureDetails>(&self, error: &CallError<E>) -> bool {
        match error {
            CallError::CircuitOpen(_) | CallError::Aborted => false,
            other => self.is_retryable(other),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::network()
    }
}

/// Execute `f` with retry logic
///
/// # Errors
///
/// Returns the last error from `f` if all retry attempts are exhausted or
/// the error is not retryable. Circuit-open and aborted outcomes are never
/// retried.
pub async fn with_retry<F, Fut, T, E>(policy: &RetryPolicy, f: F) -> Result<T, CallError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CallError<E>>>,
    E: FailureDetails,
{
    run(policy, None, f).await
}

/// Like [`with_retry`], checking `cancel` before every attempt and racing
/// every backoff sleep against it.
///
/// # Errors
///
/// [`CallError::Aborted`] on cancellation, otherwise as [`with_retry`].
pub async fn with_retry_cancellable<F, Fut, T, E>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    f: F,
) -> Result<T, CallError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CallError<E>>>,
    E: FailureDetails,
{
    run(policy, Some(cancel), f).await
}

async fn run<F, Fut, T, E>(
    policy: &RetryPolicy,
    cancel: Option<&CancellationToken>,
    mut f: F,
) -> Result<T, CallError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CallError<E>>>,
    E: FailureDetails,
{
    let max_attempts = if policy.enabled { policy.max_attempts } else { 1 };
    let mut attempt = 0u32;

    loop {
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(CallError::Aborted);
        }
        attempt += 1;

        let error = match f().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !policy.should_retry(&error) {
            debug!(policy = %policy.name, attempt, error = %error, "Not retryable");
            return Err(error);
        }
        if attempt >= max_attempts {
            debug!(policy = %policy.name, attempts = attempt, "Max retry attempts reached");
            return Err(error);
        }

        let delay = policy.delay(attempt);
        debug!(
            policy = %policy.name,
            attempt,
            delay_ms = delay.as_millis(),
            error = %error,
            "Retrying after backoff"
        );

        match cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    () = token.cancelled() => return Err(CallError::Aborted),
                    () = sleep(delay) => {}
                }
            }
            None => sleep(delay).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CircuitOpenError, TimeoutError};
    use crate::failure::DependencyError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            "test",
            &RetryConfig {
                max_attempts,
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(1),
                jitter: false,
                ..RetryConfig::network()
            },
        )
    }

    fn op_err(e: DependencyError) -> CallError<DependencyError> {
        CallError::Operation(e)
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_returns_original_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&fast_policy(3), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(op_err(DependencyError::http(503, "Service Unavailable")))
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let err = result.unwrap_err().into_operation().unwrap();
        assert_eq!(err.status, Some(503));
        assert_eq!(err.message, "Service Unavailable");
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_short_circuits() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&fast_policy(5), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(op_err(DependencyError::http(422, "title is required")))
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let result = with_retry(&fast_policy(5), || async {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(op_err(DependencyError::network("ECONNRESET", "socket hang up")))
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        // 100ms + 200ms of backoff, no delay after the success
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_open_is_never_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), CallError<DependencyError>> = with_retry(&fast_policy(3), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CallError::CircuitOpen(CircuitOpenError {
                dependency: "db".to_string(),
                retry_after: Duration::from_secs(5),
            }))
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(result.unwrap_err().is_circuit_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_are_retried() {
        let calls = AtomicU32::new(0);
        let _: Result<(), CallError<DependencyError>> = with_retry(&fast_policy(2), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CallError::Timeout(TimeoutError {
                message: "slow".to_string(),
                timeout_ms: 10,
            }))
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(
            "slow",
            &RetryConfig {
                max_attempts: 5,
                base_delay: Duration::from_secs(60),
                max_delay: Duration::from_secs(60),
                jitter: false,
                ..RetryConfig::network()
            },
        );

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let started = tokio::time::Instant::now();
        let result: Result<(), _> = with_retry_cancellable(&policy, &cancel, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(op_err(DependencyError::http(500, "boom")))
        })
        .await;

        assert!(result.unwrap_err().is_aborted());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_policy_makes_one_attempt() {
        let mut policy = fast_policy(5);
        policy.enabled = false;
        let calls = AtomicU32::new(0);
        let _: Result<(), _> = with_retry(&policy, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(op_err(DependencyError::http(503, "down")))
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let policy = fast_policy(10);
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(5), Duration::from_secs(1));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_within_band_and_cap() {
        let policy = fast_policy(10).with_jitter(true);
        for attempt in 1..=6 {
            let base = policy.backoff(attempt);
            for _ in 0..200 {
                let d = policy.delay(attempt);
                assert!(d >= base.mul_f64(0.5), "{d:?} below band for {base:?}");
                assert!(d <= base.mul_f64(1.5));
                assert!(d <= policy.max_delay);
            }
        }
    }

    #[test]
    fn test_default_retryable_rules() {
        let policy = RetryPolicy::network();
        assert!(policy.is_retryable(&DependencyError::http(429, "Too Many Requests")));
        assert!(policy.is_retryable(&DependencyError::http(502, "Bad Gateway")));
        assert!(policy.is_retryable(&DependencyError::network("ECONNRESET", "reset")));
        assert!(!policy.is_retryable(&DependencyError::http(401, "Unauthorized")));
        assert!(!policy.is_retryable(&DependencyError::http(400, "invalid payload")));
        assert!(!policy.is_retryable(&DependencyError::new("ValidationError", "bad")));
    }

    #[test]
    fn test_database_policy_matches_connection_messages() {
        let policy = RetryPolicy::database();
        assert!(policy.is_retryable(&DependencyError::new(
            "DatabaseError",
            "Connection terminated unexpectedly"
        )));
        assert!(!policy.is_retryable(&DependencyError::new(
            "DatabaseError",
            "unique constraint violated"
        )));
    }

    #[test]
    fn test_custom_check_overrides_rules() {
        let policy = RetryPolicy::network()
            .with_check(RetryCheck::new(|f| f.kind() == "FlakyError"));
        assert!(policy.is_retryable(&DependencyError::new("FlakyError", "try again")));
        assert!(!policy.is_retryable(&DependencyError::http(503, "down")));
    }
}
