//! Metrics sink invoked synchronously by the tracker and the failsafe layer

use std::time::Duration;

use crate::failsafe::CircuitState;
use crate::tracker::{ErrorCategory, Severity};

/// Receives counters and gauges from the reliability layer.
///
/// Calls are synchronous and must not block; implementations that need I/O
/// should buffer internally.
pub trait MetricsSink: Send + Sync {
    /// An error was tracked
    fn record_error(&self, category: ErrorCategory, severity: Severity);

    /// An alert rule fired
    fn record_alert(&self, rule_id: &str, severity: Severity);

    /// A circuit breaker changed state
    fn record_state_change(&self, dependency: &str, state: CircuitState);

    /// A guarded call finished
    fn record_call(&self, dependency: &str, success: bool, latency: Duration);
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_error(&self, _: ErrorCategory, _: Severity) {}
    fn record_alert(&self, _: &str, _: Severity) {}
    fn record_state_change(&self, _: &str, _: CircuitState) {}
    fn record_call(&self, _: &str, _: bool, _: Duration) {}
}

/// Forwards to whichever recorder is installed for the `metrics` facade
#[derive(Debug, Default, Clone, Copy)]
pub struct RecorderMetrics;

impl MetricsSink for RecorderMetrics {
    fn record_error(&self, category: ErrorCategory, severity: Severity) {
        telemetry_metrics::counter!(
            "callguard_errors_total",
            "category" => category.as_str(),
            "severity" => severity.as_str()
        )
        .increment(1);
    }

    fn record_alert(&self, rule_id: &str, severity: Severity) {
        telemetry_metrics::counter!(
            "callguard_alerts_total",
            "rule" => rule_id.to_string(),
            "severity" => severity.as_str()
        )
        .increment(1);
    }

    fn record_state_change(&self, dependency: &str, state: CircuitState) {
        let value = match state {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        };
        telemetry_metrics::gauge!("callguard_circuit_state", "dependency" => dependency.to_string())
            .set(value);
    }

    fn record_call(&self, dependency: &str, success: bool, latency: Duration) {
        let outcome = if success { "success" } else { "failure" };
        telemetry_metrics::counter!(
            "callguard_calls_total",
            "dependency" => dependency.to_string(),
            "outcome" => outcome
        )
        .increment(1);
        telemetry_metrics::histogram!(
            "callguard_call_duration_seconds",
            "dependency" => dependency.to_string()
        )
        .record(latency.as_secs_f64());
    }
}
