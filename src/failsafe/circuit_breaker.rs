//! Circuit breaker implementation

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;
use crate::error::{CallError, CircuitOpenError};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed (allowing requests)
    Closed,
    /// Circuit is open (blocking requests)
    Open,
    /// Circuit is half-open (allowing limited requests to test)
    HalfOpen,
}

impl CircuitState {
    /// Lowercase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }
}

/// A state change, handed to every registered observer exactly once
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateTransition {
    /// Dependency name
    pub dependency: String,
    /// Previous state
    pub from: CircuitState,
    /// New state
    pub to: CircuitState,
    /// Caused by `force_open` / `force_close`
    pub forced: bool,
    /// When it happened
    pub at: DateTime<Utc>,
}

type Observer = Arc<dyn Fn(&StateTransition) + Send + Sync>;

/// Read-only breaker snapshot
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    /// Dependency name
    pub name: String,
    /// Current state
    pub state: CircuitState,
    /// Held open by an operator
    pub forced_open: bool,
    /// Consecutive failures in the current phase
    pub failure_count: u32,
    /// Successes in the current half-open phase
    pub success_count: u32,
    /// Every call presented to the breaker
    pub total_requests: u64,
    /// Every recorded failure
    pub total_failures: u64,
    /// Every recorded success
    pub total_successes: u64,
    /// Calls refused without invoking the dependency
    pub total_rejections: u64,
    /// Last recorded failure
    pub last_failure_time: Option<DateTime<Utc>>,
    /// Last recorded success
    pub last_success_time: Option<DateTime<Utc>>,
    /// Last state change
    pub last_state_change: DateTime<Utc>,
    /// Configured failure threshold
    pub failure_threshold: u32,
    /// Configured success threshold
    pub success_threshold: u32,
    /// Configured open duration, in milliseconds
    pub reset_timeout_ms: u64,
}

struct Inner {
    state: CircuitState,
    forced: bool,
    failures: u32,
    successes: u32,
    trials_in_flight: u32,
    trial_epoch: u64,
    opened_at: Option<Instant>,
    total_requests: u64,
    total_failures: u64,
    total_successes: u64,
    total_rejections: u64,
    last_failure_time: Option<DateTime<Utc>>,
    last_success_time: Option<DateTime<Utc>>,
    last_state_change: DateTime<Utc>,
}

/// Circuit breaker for one dependency.
///
/// All counters and the state live behind a single mutex so that the
/// read-increment-compare-transition sequence is atomic across tasks.
/// Observers run after the lock is released.
pub struct CircuitBreaker {
    /// Dependency name
    name: String,
    /// Configuration
    enabled: bool,
    failure_threshold: u32,
    success_threshold: u32,
    reset_timeout: Duration,
    half_open_max_calls: u32,
    inner: Mutex<Inner>,
    observers: RwLock<Vec<Observer>>,
}

/// Outcome of asking the breaker for admission
enum Admission {
    /// Call freely
    Pass,
    /// Call as one of the bounded half-open trials
    Trial(u64),
}

/// Releases a half-open trial slot when the call finishes or is dropped
struct TrialPermit<'a> {
    breaker: &'a CircuitBreaker,
    epoch: Option<u64>,
}

impl Drop for TrialPermit<'_> {
    fn drop(&mut self) {
        if let Some(epoch) = self.epoch {
            let mut inner = self.breaker.inner.lock();
            if inner.trial_epoch == epoch && inner.trials_in_flight > 0 {
                inner.trials_in_flight -= 1;
            }
        }
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    #[must_use]
    pub fn new(name: &str, config: &CircuitBreakerConfig) -> Self {
        let success_threshold = config.success_threshold.max(1);
        Self {
            name: name.to_string(),
            enabled: config.enabled,
            failure_threshold: config.failure_threshold.max(1),
            success_threshold,
            reset_timeout: config.reset_timeout,
            half_open_max_calls: config.half_open_max_calls.max(success_threshold),
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                forced: false,
                failures: 0,
                successes: 0,
                trials_in_flight: 0,
                trial_epoch: 0,
                opened_at: None,
                total_requests: 0,
                total_failures: 0,
                total_successes: 0,
                total_rejections: 0,
                last_failure_time: None,
                last_success_time: None,
                last_state_change: Utc::now(),
            }),
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Dependency name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a callback invoked once per state transition
    pub fn on_state_change<F>(&self, observer: F)
    where
        F: Fn(&StateTransition) + Send + Sync + 'static,
    {
        self.observers.write().push(Arc::new(observer));
    }

    /// Run `f` through the breaker.
    ///
    /// While open the call is refused without invoking `f`. A cancelled
    /// call ([`CallError::Aborted`]) is not held against the dependency.
    ///
    /// # Errors
    ///
    /// [`CallError::CircuitOpen`] when refused, otherwise whatever `f` returned.
    #[tracing::instrument(skip(self, f), fields(dependency = %self.name))]
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CallError<E>>>,
    {
        let admission = self.admit().map_err(CallError::CircuitOpen)?;
        let _permit = TrialPermit {
            breaker: self,
            epoch: match admission {
                Admission::Pass => None,
                Admission::Trial(epoch) => Some(epoch),
            },
        };

        let result = f().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(CallError::Aborted) => debug!("Call aborted, not counted"),
            Err(_) => self.record_failure(),
        }
        result
    }

    /// Check if requests can proceed.
    ///
    /// For call sites that report outcomes through [`record_success`] /
    /// [`record_failure`] themselves. Does not reserve a half-open trial slot.
    ///
    /// [`record_success`]: Self::record_success
    /// [`record_failure`]: Self::record_failure
    #[tracing::instrument(skip(self), fields(dependency = %self.name))]
    pub fn can_proceed(&self) -> bool {
        match self.admit() {
            Ok(Admission::Pass) => true,
            Ok(Admission::Trial(epoch)) => {
                drop(TrialPermit {
                    breaker: self,
                    epoch: Some(epoch),
                });
                true
            }
            Err(_) => false,
        }
    }

    fn admit(&self) -> Result<Admission, CircuitOpenError> {
        let mut transition = None;
        let outcome = {
            let mut inner = self.inner.lock();
            inner.total_requests += 1;

            if !self.enabled {
                return Ok(Admission::Pass);
            }

            if inner.state == CircuitState::Open {
                let elapsed = inner.opened_at.map_or(self.reset_timeout, |t| t.elapsed());
                if !inner.forced && elapsed >= self.reset_timeout {
                    debug!(dependency = %self.name, "Reset timeout elapsed, transitioning to half-open");
                    transition = self.transition(&mut inner, CircuitState::HalfOpen, false);
                } else {
                    inner.total_rejections += 1;
                    let retry_after = if inner.forced {
                        self.reset_timeout
                    } else {
                        self.reset_timeout.saturating_sub(elapsed)
                    };
                    tracing::trace!("Circuit open, rejecting request");
                    return Err(CircuitOpenError {
                        dependency: self.name.clone(),
                        retry_after,
                    });
                }
            }

            match inner.state {
                CircuitState::Closed => Ok(Admission::Pass),
                CircuitState::HalfOpen if inner.trials_in_flight < self.half_open_max_calls => {
                    inner.trials_in_flight += 1;
                    Ok(Admission::Trial(inner.trial_epoch))
                }
                _ => {
                    inner.total_rejections += 1;
                    debug!(dependency = %self.name, "Half-open trial slots exhausted, rejecting request");
                    Err(CircuitOpenError {
                        dependency: self.name.clone(),
                        retry_after: Duration::ZERO,
                    })
                }
            }
        };
        self.notify(transition);
        outcome
    }

    /// Record a successful request
    #[tracing::instrument(skip(self), fields(dependency = %self.name))]
    pub fn record_success(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            inner.total_successes += 1;
            inner.last_success_time = Some(Utc::now());

            if !self.enabled {
                return;
            }

            match inner.state {
                CircuitState::Closed => {
                    // A single success forgives earlier failures
                    inner.failures = 0;
                    tracing::trace!("Success in closed state, reset failure count");
                    None
                }
                CircuitState::HalfOpen => {
                    inner.successes += 1;
                    debug!(
                        successes = inner.successes,
                        threshold = self.success_threshold,
                        "Success in half-open state"
                    );
                    if inner.successes >= self.success_threshold {
                        self.transition(&mut inner, CircuitState::Closed, false)
                    } else {
                        None
                    }
                }
                CircuitState::Open => {
                    tracing::trace!("Success recorded in open state (ignored)");
                    None
                }
            }
        };
        self.notify(transition);
    }

    /// Record a failed request
    #[tracing::instrument(skip(self), fields(dependency = %self.name))]
    pub fn record_failure(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            inner.total_failures += 1;
            inner.last_failure_time = Some(Utc::now());

            if !self.enabled {
                return;
            }

            match inner.state {
                CircuitState::Closed => {
                    inner.failures += 1;
                    warn!(
                        failures = inner.failures,
                        threshold = self.failure_threshold,
                        "Failure in closed state"
                    );
                    if inner.failures >= self.failure_threshold {
                        self.transition(&mut inner, CircuitState::Open, false)
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => {
                    // Any failure in half-open goes back to open
                    inner.failures += 1;
                    warn!("Failure in half-open state, reopening circuit");
                    self.transition(&mut inner, CircuitState::Open, false)
                }
                CircuitState::Open => {
                    tracing::trace!("Failure recorded in open state (ignored)");
                    None
                }
            }
        };
        self.notify(transition);
    }

    /// Hold the circuit open until [`force_close`](Self::force_close)
    pub fn force_open(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            inner.forced = true;
            let t = self.transition(&mut inner, CircuitState::Open, true);
            // Already open: restart the cooldown under operator control
            inner.opened_at = Some(Instant::now());
            t
        };
        self.notify(transition);
    }

    /// Close the circuit and clear counters, whatever the current state
    pub fn force_close(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            inner.forced = false;
            inner.failures = 0;
            inner.successes = 0;
            self.transition(&mut inner, CircuitState::Closed, true)
        };
        self.notify(transition);
    }

    /// Back to a fresh closed breaker; lifetime totals are kept
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            inner.forced = false;
            let t = self.transition(&mut inner, CircuitState::Closed, false);
            inner.failures = 0;
            inner.successes = 0;
            inner.opened_at = None;
            t
        };
        self.notify(transition);
    }

    /// Get current state
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Snapshot without side effects
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            forced_open: inner.forced,
            failure_count: inner.failures,
            success_count: inner.successes,
            total_requests: inner.total_requests,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
            total_rejections: inner.total_rejections,
            last_failure_time: inner.last_failure_time,
            last_success_time: inner.last_success_time,
            last_state_change: inner.last_state_change,
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            reset_timeout_ms: self.reset_timeout.as_millis() as u64,
        }
    }

    /// Human-readable status for error messages and health output
    #[must_use]
    pub fn status_message(&self) -> String {
        let inner = self.inner.lock();
        if !self.enabled {
            return format!("Dependency '{}': circuit breaker is closed (disabled)", self.name);
        }
        match inner.state {
            CircuitState::Closed => {
                format!("Dependency '{}': circuit breaker is closed", self.name)
            }
            CircuitState::Open if inner.forced => format!(
                "Dependency '{}': circuit breaker is open (forced by operator)",
                self.name
            ),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map_or(Duration::ZERO, |t| t.elapsed());
                let remaining = self.reset_timeout.saturating_sub(elapsed);
                format!(
                    "Dependency '{}': circuit breaker is open after {} failures, retry in {} seconds",
                    self.name,
                    inner.failures,
                    remaining.as_secs()
                )
            }
            CircuitState::HalfOpen => format!(
                "Dependency '{}': circuit breaker is half-open, testing recovery",
                self.name
            ),
        }
    }

    /// Transition to a new state; `None` when already there
    fn transition(
        &self,
        inner: &mut Inner,
        new_state: CircuitState,
        forced: bool,
    ) -> Option<StateTransition> {
        let old_state = inner.state;
        if old_state == new_state {
            return None;
        }

        inner.state = new_state;
        inner.successes = 0;
        inner.trials_in_flight = 0;
        let now = Utc::now();
        inner.last_state_change = now;

        match new_state {
            CircuitState::Closed => {
                inner.failures = 0;
                inner.opened_at = None;
            }
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
            }
            CircuitState::HalfOpen => {
                inner.failures = 0;
                inner.trial_epoch += 1;
            }
        }

        Some(StateTransition {
            dependency: self.name.clone(),
            from: old_state,
            to: new_state,
            forced,
            at: now,
        })
    }

    fn notify(&self, transition: Option<StateTransition>) {
        let Some(transition) = transition else {
            return;
        };

        match transition.to {
            CircuitState::Closed => info!(dependency = %self.name, forced = transition.forced, "Circuit breaker closed"),
            CircuitState::Open => warn!(dependency = %self.name, forced = transition.forced, "Circuit breaker opened"),
            CircuitState::HalfOpen => debug!(dependency = %self.name, "Circuit breaker half-open"),
        }

        let observers = self.observers.read().clone();
        for observer in observers {
            observer(&transition);
        }
    }
}
