//! Point-in-time system health from breaker state and tracker statistics

mod http;

pub use http::health_router;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HealthConfig;
use crate::failsafe::{CircuitBreaker, CircuitBreakerStats, CircuitState, TimeoutPolicy, with_timeout};
use crate::failure::DependencyError;
use crate::tracker::{ErrorStats, ErrorTracker};

/// Name of the synthetic check fed by the error tracker
pub const ERRORS_CHECK: &str = "errors";

/// Overall status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Everything passes
    Healthy,
    /// Something warns, or a non-critical check fails
    Degraded,
    /// A critical check fails
    Unhealthy,
}

/// Status of one check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    /// Fine
    Pass,
    /// Recovering or suspicious
    Warn,
    /// Down
    Fail,
}

/// Result of one check
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    /// Status
    pub status: CheckStatus,
    /// A failure here makes the system unhealthy
    pub critical: bool,
    /// When the check ran
    pub time: DateTime<Utc>,
    /// How long the check took
    pub response_time_ms: u64,
    /// Human-readable detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Failure detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Health snapshot
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Overall status
    pub status: HealthStatus,
    /// Checks by name
    pub checks: BTreeMap<String, CheckResult>,
    /// Seconds since the reporter was created
    #[serde(rename = "uptime")]
    pub uptime_seconds: u64,
    /// When the snapshot was taken
    pub timestamp: DateTime<Utc>,
    /// Crate version
    pub version: &'static str,
}

impl HealthReport {
    /// Overall status from a set of checks
    #[must_use]
    pub fn overall(checks: &BTreeMap<String, CheckResult>) -> HealthStatus {
        if checks
            .values()
            .any(|c| c.critical && c.status == CheckStatus::Fail)
        {
            HealthStatus::Unhealthy
        } else if checks.values().any(|c| c.status != CheckStatus::Pass) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Payload of the metrics endpoint
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// One snapshot per registered breaker
    pub circuit_breakers: Vec<CircuitBreakerStats>,
    /// Tracker aggregates
    pub errors: ErrorStats,
    /// When the snapshot was taken
    pub timestamp: DateTime<Utc>,
}

/// Active check against a dependency
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// `Ok` when the dependency answers
    async fn probe(&self) -> Result<(), DependencyError>;
}

/// Probe backed by an async closure
pub struct FnProbe<F>(F);

/// Wrap an async closure as a [`HealthProbe`]
pub fn probe_fn<F, Fut>(f: F) -> Arc<dyn HealthProbe>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), DependencyError>> + Send + 'static,
{
    Arc::new(FnProbe(f))
}

#[async_trait]
impl<F, Fut> HealthProbe for FnProbe<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), DependencyError>> + Send + 'static,
{
    async fn probe(&self) -> Result<(), DependencyError> {
        (self.0)().await
    }
}

#[derive(Clone)]
struct Registration {
    breaker: Arc<CircuitBreaker>,
    critical: bool,
    probe: Option<Arc<dyn HealthProbe>>,
}

/// Builds [`HealthReport`]s from registered breakers and the error tracker
pub struct HealthReporter {
    config: HealthConfig,
    dependencies: RwLock<BTreeMap<String, Registration>>,
    tracker: Option<Arc<ErrorTracker>>,
    started: Instant,
    latest: RwLock<Option<HealthReport>>,
}

impl HealthReporter {
    /// Reporter with no dependencies
    #[must_use]
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            config: config.clone(),
            dependencies: RwLock::new(BTreeMap::new()),
            tracker: None,
            started: Instant::now(),
            latest: RwLock::new(None),
        }
    }

    /// Include the `errors` check and tracker aggregates
    #[must_use]
    pub fn with_tracker(mut self, tracker: Arc<ErrorTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Watch `breaker`; re-registering a name replaces the breaker and keeps its probe
    pub fn register(&self, breaker: Arc<CircuitBreaker>, critical: bool) {
        let name = breaker.name().to_string();
        let mut deps = self.dependencies.write();
        let probe = deps.get(&name).and_then(|r| r.probe.clone());
        deps.insert(
            name,
            Registration {
                breaker,
                critical,
                probe,
            },
        );
    }

    /// Attach an active probe; `false` if the dependency is not registered
    pub fn set_probe(&self, dependency: &str, probe: Arc<dyn HealthProbe>) -> bool {
        self.dependencies
            .write()
            .get_mut(dependency)
            .map(|r| r.probe = Some(probe))
            .is_some()
    }

    /// Registered dependency names
    #[must_use]
    pub fn dependencies(&self) -> Vec<String> {
        self.dependencies.read().keys().cloned().collect()
    }

    /// Run every check now
    pub async fn check(&self) -> HealthReport {
        let registrations: Vec<(String, Registration)> = self
            .dependencies
            .read()
            .iter()
            .map(|(name, r)| (name.clone(), r.clone()))
            .collect();

        let probe_policy = TimeoutPolicy::new(self.config.probe_timeout, "health probe")
            .with_message("{operation} timed out after {timeout_ms}ms");
        let results = join_all(
            registrations
                .iter()
                .map(|(name, r)| check_dependency(name, r, &probe_policy)),
        )
        .await;

        let mut checks: BTreeMap<String, CheckResult> = registrations
            .into_iter()
            .map(|(name, _)| name)
            .zip(results)
            .collect();

        if let Some(tracker) = &self.tracker {
            checks.insert(ERRORS_CHECK.to_string(), errors_check(tracker));
        }

        HealthReport {
            status: HealthReport::overall(&checks),
            checks,
            uptime_seconds: self.started.elapsed().as_secs(),
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    /// Run every check and keep the result as the latest snapshot
    pub async fn refresh(&self) -> HealthReport {
        let report = self.check().await;
        let previous = self
            .latest
            .write()
            .replace(report.clone())
            .map(|r| r.status);

        if previous != Some(report.status) {
            match report.status {
                HealthStatus::Healthy => info!("System healthy"),
                HealthStatus::Degraded => warn!(status = ?report.status, "System degraded"),
                HealthStatus::Unhealthy => warn!(status = ?report.status, "System unhealthy"),
            }
        }
        report
    }

    /// Most recent snapshot from [`refresh`](Self::refresh)
    #[must_use]
    pub fn latest(&self) -> Option<HealthReport> {
        self.latest.read().clone()
    }

    /// Breaker snapshots plus tracker aggregates
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        let circuit_breakers = self
            .dependencies
            .read()
            .values()
            .map(|r| r.breaker.stats())
            .collect();
        MetricsSnapshot {
            circuit_breakers,
            errors: self
                .tracker
                .as_ref()
                .map(|t| t.get_error_stats())
                .unwrap_or_default(),
            timestamp: Utc::now(),
        }
    }

    /// Refresh every `interval` until cancelled
    pub fn spawn_periodic(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let reporter = Arc::clone(self);
        let period = self.config.interval;
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        reporter.refresh().await;
                    }
                }
            }
            debug!("Health refresh stopped");
        })
    }
}

#[allow(clippy::cast_possible_truncation)]
async fn check_dependency(name: &str, registration: &Registration, policy: &TimeoutPolicy) -> CheckResult {
    let start = Instant::now();
    let breaker = &registration.breaker;
    let state = breaker.state();

    let mut status = match state {
        CircuitState::Closed => CheckStatus::Pass,
        CircuitState::HalfOpen => CheckStatus::Warn,
        CircuitState::Open => CheckStatus::Fail,
    };
    let mut error = (state == CircuitState::Open).then(|| breaker.status_message());

    // An open breaker already says the dependency is down; don't poke it
    if state != CircuitState::Open
        && let Some(probe) = &registration.probe
    {
        if let Err(e) = with_timeout(probe.probe(), policy).await {
            debug!(dependency = %name, error = %e, "Health probe failed");
            status = CheckStatus::Fail;
            error = Some(e.to_string());
        }
    }

    CheckResult {
        status,
        critical: registration.critical,
        time: Utc::now(),
        response_time_ms: start.elapsed().as_millis() as u64,
        output: Some(breaker.status_message()),
        error,
    }
}

fn errors_check(tracker: &ErrorTracker) -> CheckResult {
    let stats = tracker.get_error_stats();
    let (status, output) = if stats.unresolved_critical_last_hour > 0 {
        (
            CheckStatus::Warn,
            format!(
                "{} unresolved critical errors in the last hour",
                stats.unresolved_critical_last_hour
            ),
        )
    } else {
        (
            CheckStatus::Pass,
            format!("{} errors in the last hour", stats.last_hour),
        )
    };
    CheckResult {
        status,
        critical: false,
        time: Utc::now(),
        response_time_ms: 0,
        output: Some(output),
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CircuitBreakerConfig, TrackerConfig};
    use crate::tracker::{ErrorContext, ErrorReport};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn breaker(name: &str) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            name,
            &CircuitBreakerConfig {
                failure_threshold: 1,
                success_threshold: 1,
                reset_timeout: Duration::from_secs(30),
                ..CircuitBreakerConfig::default()
            },
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_closed_is_healthy() {
        let reporter = HealthReporter::new(&HealthConfig::default());
        reporter.register(breaker("database"), true);
        reporter.register(breaker("openai"), false);

        let report = reporter.check().await;
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.checks.len(), 2);
        assert_eq!(report.checks["database"].status, CheckStatus::Pass);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_critical_open_is_degraded() {
        let reporter = HealthReporter::new(&HealthConfig::default());
        let openai = breaker("openai");
        reporter.register(breaker("database"), true);
        reporter.register(Arc::clone(&openai), false);
        openai.record_failure();

        let report = reporter.check().await;
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.checks["openai"].status, CheckStatus::Fail);
        assert!(report.checks["openai"].error.as_deref().unwrap().contains("open"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_open_is_unhealthy() {
        let reporter = HealthReporter::new(&HealthConfig::default());
        let db = breaker("database");
        reporter.register(Arc::clone(&db), true);
        db.force_open();

        assert_eq!(reporter.check().await.status, HealthStatus::Unhealthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_warns() {
        let reporter = HealthReporter::new(&HealthConfig::default());
        let db = breaker("database");
        reporter.register(Arc::clone(&db), true);
        db.record_failure();
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(db.can_proceed());

        let report = reporter.check().await;
        assert_eq!(report.checks["database"].status, CheckStatus::Warn);
        assert_eq!(report.status, HealthStatus::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_and_timeout() {
        let reporter = HealthReporter::new(&HealthConfig {
            probe_timeout: Duration::from_millis(100),
            ..HealthConfig::default()
        });
        reporter.register(breaker("database"), true);
        reporter.register(breaker("youtube"), false);
        assert!(reporter.set_probe(
            "database",
            probe_fn(|| async { Err(DependencyError::network("ECONNREFUSED", "connection refused")) }),
        ));
        assert!(reporter.set_probe(
            "youtube",
            probe_fn(|| async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            }),
        ));
        assert!(!reporter.set_probe("missing", probe_fn(|| async { Ok(()) })));

        let report = reporter.check().await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.checks["database"].error.as_deref(), Some("connection refused"));
        assert_eq!(
            report.checks["youtube"].error.as_deref(),
            Some("health probe timed out after 100ms")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_check_warns_on_recent_critical() {
        let tracker = Arc::new(ErrorTracker::new(&TrackerConfig {
            default_rules: false,
            ..TrackerConfig::default()
        }));
        let reporter = HealthReporter::new(&HealthConfig::default()).with_tracker(Arc::clone(&tracker));
        assert_eq!(reporter.check().await.status, HealthStatus::Healthy);

        tracker.track(
            ErrorReport::new("Error", "readiness failed"),
            ErrorContext::new().with_endpoint("/ready"),
        );
        let report = reporter.check().await;
        assert_eq!(report.checks[ERRORS_CHECK].status, CheckStatus::Warn);
        assert_eq!(report.status, HealthStatus::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_keeps_latest_and_metrics() {
        let reporter = HealthReporter::new(&HealthConfig::default());
        reporter.register(breaker("database"), true);
        assert!(reporter.latest().is_none());

        reporter.refresh().await;
        assert_eq!(reporter.latest().unwrap().status, HealthStatus::Healthy);

        let metrics = reporter.metrics();
        assert_eq!(metrics.circuit_breakers.len(), 1);
        assert_eq!(metrics.circuit_breakers[0].name, "database");
        assert_eq!(metrics.errors.unique_errors, 0);
    }

    #[test]
    fn test_report_serializes_lowercase() {
        let mut checks = BTreeMap::new();
        checks.insert(
            "database".to_string(),
            CheckResult {
                status: CheckStatus::Warn,
                critical: true,
                time: Utc::now(),
                response_time_ms: 3,
                output: None,
                error: None,
            },
        );
        let report = HealthReport {
            status: HealthReport::overall(&checks),
            checks,
            uptime_seconds: 5,
            timestamp: Utc::now(),
            version: "0.0.0",
        };
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["status"], "degraded");
        assert_eq!(value["uptime"], 5);
        assert!(value.get("uptime_seconds").is_none());
        assert_eq!(value["checks"]["database"]["status"], "warn");
        assert!(value["checks"]["database"].get("output").is_none());
    }
}
