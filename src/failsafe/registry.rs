//! Per-dependency failsafes, keyed by name

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use super::{CircuitBreaker, CircuitBreakerStats, Failsafe};
use crate::config::ReliabilityConfig;
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::tracker::ErrorTracker;

/// Registry of failsafes.
///
/// One instance per application context, never a process global, so tests
/// can build isolated registries. Unknown names are created on first use
/// from the configured defaults.
pub struct FailsafeRegistry {
    config: ReliabilityConfig,
    failsafes: DashMap<String, Arc<Failsafe>>,
    tracker: Option<Arc<ErrorTracker>>,
    metrics: Arc<dyn MetricsSink>,
}

impl FailsafeRegistry {
    /// Create a new registry
    #[must_use]
    pub fn new(config: &ReliabilityConfig) -> Self {
        Self {
            config: config.clone(),
            failsafes: DashMap::new(),
            tracker: None,
            metrics: Arc::new(NoopMetrics),
        }
    }

    /// Failsafes created from now on forward failures to `tracker`
    #[must_use]
    pub fn with_tracker(mut self, tracker: Arc<ErrorTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Failsafes created from now on report to `metrics`
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Create every dependency named in the configuration
    pub fn preload(&self) {
        for name in self.config.dependencies.keys() {
            self.get_or_create(name);
        }
    }

    /// Failsafe for `name`, created on first use
    pub fn get_or_create(&self, name: &str) -> Arc<Failsafe> {
        if let Some(existing) = self.failsafes.get(name) {
            return Arc::clone(&*existing);
        }
        let entry = self
            .failsafes
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(dependency = %name, "Creating failsafe");
                Arc::new(self.build(name))
            });
        Arc::clone(&*entry)
    }

    /// Failsafe for `name`, if it exists
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Failsafe>> {
        self.failsafes.get(name).map(|f| Arc::clone(&*f))
    }

    /// Install a custom failsafe, replacing any with the same name
    pub fn insert(&self, failsafe: Failsafe) -> Arc<Failsafe> {
        let failsafe = Arc::new(failsafe);
        self.failsafes
            .insert(failsafe.name().to_string(), Arc::clone(&failsafe));
        failsafe
    }

    /// All failsafes, sorted by name
    #[must_use]
    pub fn all(&self) -> Vec<Arc<Failsafe>> {
        let mut all: Vec<Arc<Failsafe>> = self.failsafes.iter().map(|f| Arc::clone(&*f)).collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    /// All breakers, sorted by name
    #[must_use]
    pub fn breakers(&self) -> Vec<Arc<CircuitBreaker>> {
        self.all().iter().map(|f| Arc::clone(f.breaker())).collect()
    }

    /// Breaker snapshots, sorted by name
    #[must_use]
    pub fn stats(&self) -> Vec<CircuitBreakerStats> {
        self.all().iter().map(|f| f.breaker().stats()).collect()
    }

    /// Configuration the registry builds from
    #[must_use]
    pub fn config(&self) -> &ReliabilityConfig {
        &self.config
    }

    fn build(&self, name: &str) -> Failsafe {
        let mut failsafe =
            Failsafe::new(name, &self.config.dependency(name)).with_metrics(Arc::clone(&self.metrics));
        if let Some(tracker) = &self.tracker {
            failsafe = failsafe.with_tracker(Arc::clone(tracker));
        }
        failsafe
    }
}
