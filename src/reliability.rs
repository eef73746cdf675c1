//! Application context wiring the reliability components together

use std::sync::Arc;

use axum::Router;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Result;
use crate::alert::AlertDispatcher;
use crate::config::ReliabilityConfig;
use crate::failsafe::{Failsafe, FailsafeRegistry};
use crate::health::{HealthReporter, health_router};
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::tracker::ErrorTracker;

/// Registry, tracker, alert delivery and health reporting for one application.
///
/// Build one per process (or per test) and pass it around; nothing in the
/// crate keeps global state.
pub struct Reliability {
    config: ReliabilityConfig,
    registry: FailsafeRegistry,
    tracker: Arc<ErrorTracker>,
    dispatcher: Arc<AlertDispatcher>,
    health: Arc<HealthReporter>,
}

impl Reliability {
    /// Context without metrics
    ///
    /// # Errors
    ///
    /// Fails if a configured alert channel cannot be built.
    pub fn new(config: ReliabilityConfig) -> Result<Self> {
        Self::with_metrics(config, Arc::new(NoopMetrics))
    }

    /// Context reporting to `metrics`
    ///
    /// # Errors
    ///
    /// Fails if a configured alert channel cannot be built.
    pub fn with_metrics(config: ReliabilityConfig, metrics: Arc<dyn MetricsSink>) -> Result<Self> {
        let tracker = Arc::new(ErrorTracker::new(&config.tracker).with_metrics(Arc::clone(&metrics)));
        let dispatcher = Arc::new(AlertDispatcher::from_config(&config.channels)?);
        let health = Arc::new(HealthReporter::new(&config.health).with_tracker(Arc::clone(&tracker)));
        let registry = FailsafeRegistry::new(&config)
            .with_tracker(Arc::clone(&tracker))
            .with_metrics(metrics);

        registry.preload();
        for failsafe in registry.all() {
            health.register(Arc::clone(failsafe.breaker()), failsafe.is_critical());
        }

        Ok(Self {
            config,
            registry,
            tracker,
            dispatcher,
            health,
        })
    }

    /// Failsafe for `dependency`, created from defaults on first use and
    /// registered with the health reporter
    pub fn failsafe(&self, dependency: &str) -> Arc<Failsafe> {
        if let Some(existing) = self.registry.get(dependency) {
            return existing;
        }
        let failsafe = self.registry.get_or_create(dependency);
        self.health
            .register(Arc::clone(failsafe.breaker()), failsafe.is_critical());
        failsafe
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &ReliabilityConfig {
        &self.config
    }

    /// Failsafe registry
    #[must_use]
    pub fn registry(&self) -> &FailsafeRegistry {
        &self.registry
    }

    /// Error tracker
    #[must_use]
    pub fn tracker(&self) -> &Arc<ErrorTracker> {
        &self.tracker
    }

    /// Alert channels
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<AlertDispatcher> {
        &self.dispatcher
    }

    /// Health reporter
    #[must_use]
    pub fn health(&self) -> &Arc<HealthReporter> {
        &self.health
    }

    /// `/health`, `/health/live` and `/metrics`
    #[must_use]
    pub fn router(&self) -> Router {
        health_router(Arc::clone(&self.health))
    }

    /// Start the retention sweep, alert delivery and periodic health refresh
    pub fn spawn_background(&self) -> BackgroundTasks {
        let cancel = CancellationToken::new();
        let mut handles = vec![
            self.tracker.spawn_cleanup(cancel.child_token()),
            self.health.spawn_periodic(cancel.child_token()),
        ];
        match self
            .tracker
            .spawn_dispatcher(Arc::clone(&self.dispatcher), cancel.child_token())
        {
            Some(handle) => handles.push(handle),
            None => warn!("Alert dispatcher already running"),
        }
        info!(tasks = handles.len(), "Background tasks started");
        BackgroundTasks { cancel, handles }
    }
}

/// Handle to the tasks started by [`Reliability::spawn_background`]
pub struct BackgroundTasks {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Token cancelled on shutdown
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop every task and wait for it to finish
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Background tasks stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CallError;
    use crate::failsafe::CircuitState;
    use crate::failure::DependencyError;
    use crate::health::HealthStatus;

    #[tokio::test(start_paused = true)]
    async fn test_configured_dependencies_are_watched() {
        let reliability = Reliability::new(ReliabilityConfig::default()).unwrap();
        assert_eq!(
            reliability.health().dependencies(),
            vec!["database", "gemini", "openai", "youtube"]
        );

        reliability.failsafe("storage");
        assert!(reliability.health().dependencies().contains(&"storage".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_reach_tracker_and_health() {
        let reliability = Reliability::new(ReliabilityConfig::default()).unwrap();
        let db = reliability.failsafe("database");

        for _ in 0..3 {
            let _: std::result::Result<(), CallError<DependencyError>> = db
                .execute(|| async { Err(DependencyError::new("QueryError", "syntax error at or near")) })
                .await;
        }

        assert_eq!(db.breaker().state(), CircuitState::Open);
        assert_eq!(reliability.tracker().get_error_stats().total_occurrences, 3);
        assert_eq!(reliability.health().check().await.status, HealthStatus::Unhealthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_tasks_shut_down() {
        let reliability = Reliability::new(ReliabilityConfig::default()).unwrap();
        let tasks = reliability.spawn_background();
        let token = tasks.cancellation_token();
        assert!(!token.is_cancelled());
        tasks.shutdown().await;
        assert!(token.is_cancelled());
        assert!(
            reliability
                .tracker()
                .spawn_dispatcher(Arc::clone(reliability.dispatcher()), CancellationToken::new())
                .is_none()
        );
    }
}
