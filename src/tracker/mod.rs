//! Error tracking: classification, fingerprinting, deduplication and alerting
//!
//! Every failure the layer sees (and any the application hands over) ends up
//! in [`ErrorTracker::track_error`]. Occurrences sharing a fingerprint are
//! folded into one [`TrackedError`]; alert rules are evaluated synchronously
//! after each occurrence and fired alerts are queued for background delivery.

mod classify;
mod context;
mod fingerprint;

pub use classify::{ErrorCategory, Severity, categorize, infer_severity};
pub use context::{ErrorContext, ErrorReport};
pub use fingerprint::{fingerprint, normalize_message};

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alert::{Alert, AlertDispatcher, AlertEngine, AlertRule, Occurrence};
use crate::config::TrackerConfig;
use crate::failure::FailureDetails;
use crate::metrics::{MetricsSink, NoopMetrics};

const HOUR: Duration = Duration::from_secs(3600);
const DAY: Duration = Duration::from_secs(24 * 3600);

/// All occurrences of one logical error
#[derive(Debug, Clone, Serialize)]
pub struct TrackedError {
    /// Stable grouping key
    pub fingerprint: String,
    /// Category
    pub category: ErrorCategory,
    /// Highest severity seen so far
    pub severity: Severity,
    /// Type-like name of the first occurrence
    pub kind: String,
    /// Message of the first occurrence
    pub message: String,
    /// Status of the latest occurrence that carried one
    pub status: Option<u16>,
    /// Error code of the latest occurrence that carried one
    pub code: Option<String>,
    /// Frames of the first occurrence
    pub stack: Vec<String>,
    /// Occurrences
    pub count: u64,
    /// First occurrence
    pub first_seen: DateTime<Utc>,
    /// Latest occurrence
    pub last_seen: DateTime<Utc>,
    /// Context merged across occurrences, newest wins
    pub context: ErrorContext,
    /// Triaged by someone
    pub resolved: bool,
    /// When it was resolved
    pub resolved_at: Option<DateTime<Utc>>,
    /// Who resolved it
    pub resolved_by: Option<String>,
    #[serde(skip)]
    last_seen_at: Instant,
}

/// Filter for [`ErrorTracker::get_errors`]
#[derive(Debug, Clone, Default)]
pub struct ErrorFilter {
    /// Only this category
    pub category: Option<ErrorCategory>,
    /// At least this severity
    pub min_severity: Option<Severity>,
    /// Only resolved (`true`) or unresolved (`false`) errors
    pub resolved: Option<bool>,
    /// At most this many, most recent first
    pub limit: Option<usize>,
}

/// Short form used in [`ErrorStats::top_errors`]
#[derive(Debug, Clone, Serialize)]
pub struct ErrorSummary {
    /// Fingerprint
    pub fingerprint: String,
    /// Category
    pub category: ErrorCategory,
    /// Severity
    pub severity: Severity,
    /// Message
    pub message: String,
    /// Occurrences
    pub count: u64,
    /// Latest occurrence
    pub last_seen: DateTime<Utc>,
}

/// Aggregate counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorStats {
    /// Distinct fingerprints
    pub unique_errors: usize,
    /// Sum of all counts
    pub total_occurrences: u64,
    /// Fingerprints not yet resolved
    pub unresolved: usize,
    /// Distinct fingerprints per category
    pub by_category: BTreeMap<ErrorCategory, usize>,
    /// Distinct fingerprints per severity
    pub by_severity: BTreeMap<Severity, usize>,
    /// Occurrences within the last hour
    pub last_hour: usize,
    /// Unresolved critical errors seen within the last hour
    pub unresolved_critical_last_hour: usize,
    /// Alerts in history
    pub alerts_total: usize,
    /// Alerts fired within the last 24 hours
    pub alerts_last_24h: usize,
    /// Ten most frequent errors
    pub top_errors: Vec<ErrorSummary>,
}

/// Result of a retention sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Tracked errors dropped
    pub errors_removed: usize,
    /// Alerts dropped
    pub alerts_removed: usize,
}

struct TrackerState {
    errors: HashMap<String, TrackedError>,
    occurrences: VecDeque<Occurrence>,
    engine: AlertEngine,
}

/// Process-wide error aggregator.
///
/// All state sits behind one mutex; classification and fingerprinting happen
/// before it is taken, logging and alert queueing after it is released.
pub struct ErrorTracker {
    config: TrackerConfig,
    state: Mutex<TrackerState>,
    alert_tx: mpsc::Sender<Alert>,
    alert_rx: Mutex<Option<mpsc::Receiver<Alert>>>,
    metrics: Arc<dyn MetricsSink>,
}

impl ErrorTracker {
    /// Tracker with the given configuration and no metrics
    #[must_use]
    pub fn new(config: &TrackerConfig) -> Self {
        let rules = if config.default_rules {
            AlertRule::defaults()
        } else {
            Vec::new()
        };
        let (alert_tx, alert_rx) = mpsc::channel(config.alert_queue_size.max(1));
        Self {
            config: config.clone(),
            state: Mutex::new(TrackerState {
                errors: HashMap::new(),
                occurrences: VecDeque::new(),
                engine: AlertEngine::new(rules, config.max_alerts),
            }),
            alert_tx,
            alert_rx: Mutex::new(Some(alert_rx)),
            metrics: Arc::new(NoopMetrics),
        }
    }

    /// Report to `metrics`
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Track with inferred category and severity
    pub fn track(&self, report: ErrorReport, context: ErrorContext) -> String {
        self.track_error(report, context, None, None)
    }

    /// Track a call failure; the caller's location becomes the first frame
    #[track_caller]
    pub fn track_failure<F: FailureDetails + ?Sized>(
        &self,
        failure: &F,
        context: ErrorContext,
    ) -> String {
        self.track_error(ErrorReport::from_failure(failure), context, None, None)
    }

    /// Record one occurrence and return its fingerprint.
    ///
    /// `category` and `severity` override inference when given. A repeat of a
    /// known fingerprint bumps its count, escalates (never lowers) its
    /// severity and merges context; a repeat of a resolved error reopens it.
    pub fn track_error(
        &self,
        report: ErrorReport,
        context: ErrorContext,
        category: Option<ErrorCategory>,
        severity: Option<Severity>,
    ) -> String {
        let category = category.unwrap_or_else(|| categorize(&report, &context));
        let severity = severity.unwrap_or_else(|| infer_severity(category, &report, &context));
        let fp = fingerprint(category, &report.message, &report.stack, self.config.stack_frames);
        let now = Instant::now();
        let wall = Utc::now();

        let (alerts, outcome, count) = {
            let mut state = self.state.lock();
            let TrackerState {
                errors,
                occurrences,
                engine,
            } = &mut *state;

            let outcome = match errors.entry(fp.clone()) {
                Entry::Occupied(mut entry) => {
                    let tracked = entry.get_mut();
                    tracked.count += 1;
                    tracked.last_seen = wall;
                    tracked.last_seen_at = now;
                    tracked.severity = tracked.severity.max(severity);
                    if report.status.is_some() {
                        tracked.status = report.status;
                    }
                    if report.code.is_some() {
                        tracked.code = report.code;
                    }
                    tracked.context.merge(context);
                    if tracked.resolved {
                        tracked.resolved = false;
                        tracked.resolved_at = None;
                        tracked.resolved_by = None;
                        Outcome::Reopened
                    } else {
                        Outcome::Repeat
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert(TrackedError {
                        fingerprint: fp.clone(),
                        category,
                        severity,
                        kind: report.kind,
                        message: report.message,
                        status: report.status,
                        code: report.code,
                        stack: report.stack,
                        count: 1,
                        first_seen: wall,
                        last_seen: wall,
                        context,
                        resolved: false,
                        resolved_at: None,
                        resolved_by: None,
                        last_seen_at: now,
                    });
                    Outcome::New
                }
            };

            occurrences.push_back(Occurrence { at: now, category });
            let keep = engine.max_window().max(HOUR);
            prune_occurrences(occurrences, now, keep, self.config.max_occurrences);

            let Some(tracked) = errors.get(&fp) else {
                return fp;
            };
            let alerts = engine.evaluate(tracked, occurrences, now);
            (alerts, outcome, tracked.count)
        };

        self.metrics.record_error(category, severity);
        match outcome {
            Outcome::New if severity >= Severity::High => {
                error!(fingerprint = %fp, %category, %severity, "New error tracked");
            }
            Outcome::New => warn!(fingerprint = %fp, %category, %severity, "New error tracked"),
            Outcome::Reopened => {
                warn!(fingerprint = %fp, %category, count, "Resolved error recurred, reopening");
            }
            Outcome::Repeat => debug!(fingerprint = %fp, %category, count, "Repeated error"),
        }

        for alert in alerts {
            self.metrics.record_alert(&alert.rule_id, alert.severity);
            match self.alert_tx.try_send(alert) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(alert)) => {
                    warn!(rule = %alert.rule_id, "Alert queue full, dropping delivery");
                }
                Err(mpsc::error::TrySendError::Closed(alert)) => {
                    debug!(rule = %alert.rule_id, "No alert dispatcher running");
                }
            }
        }

        fp
    }

    /// One tracked error
    #[must_use]
    pub fn get_error(&self, fingerprint: &str) -> Option<TrackedError> {
        self.state.lock().errors.get(fingerprint).cloned()
    }

    /// Tracked errors matching `filter`, most recently seen first
    #[must_use]
    pub fn get_errors(&self, filter: &ErrorFilter) -> Vec<TrackedError> {
        let mut errors: Vec<TrackedError> = self
            .state
            .lock()
            .errors
            .values()
            .filter(|e| filter.category.is_none_or(|c| e.category == c))
            .filter(|e| filter.min_severity.is_none_or(|s| e.severity >= s))
            .filter(|e| filter.resolved.is_none_or(|r| e.resolved == r))
            .cloned()
            .collect();
        errors.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at));
        if let Some(limit) = filter.limit {
            errors.truncate(limit);
        }
        errors
    }

    /// Mark an error as triaged; `false` if the fingerprint is unknown
    pub fn resolve_error(&self, fingerprint: &str, resolved_by: &str) -> bool {
        let mut state = self.state.lock();
        let Some(tracked) = state.errors.get_mut(fingerprint) else {
            return false;
        };
        tracked.resolved = true;
        tracked.resolved_at = Some(Utc::now());
        tracked.resolved_by = Some(resolved_by.to_string());
        drop(state);
        info!(fingerprint, resolved_by, "Error resolved");
        true
    }

    /// Aggregate counters
    #[must_use]
    pub fn get_error_stats(&self) -> ErrorStats {
        let now = Instant::now();
        let state = self.state.lock();
        let mut stats = ErrorStats {
            unique_errors: state.errors.len(),
            alerts_total: state.engine.len(),
            alerts_last_24h: state.engine.count_since(now, DAY),
            last_hour: state
                .occurrences
                .iter()
                .filter(|o| now.saturating_duration_since(o.at) <= HOUR)
                .count(),
            ..ErrorStats::default()
        };

        for e in state.errors.values() {
            stats.total_occurrences += e.count;
            *stats.by_category.entry(e.category).or_default() += 1;
            *stats.by_severity.entry(e.severity).or_default() += 1;
            if !e.resolved {
                stats.unresolved += 1;
                if e.severity == Severity::Critical
                    && now.saturating_duration_since(e.last_seen_at) <= HOUR
                {
                    stats.unresolved_critical_last_hour += 1;
                }
            }
        }

        let mut top: Vec<&TrackedError> = state.errors.values().collect();
        top.sort_by(|a, b| b.count.cmp(&a.count).then(b.last_seen_at.cmp(&a.last_seen_at)));
        stats.top_errors = top
            .into_iter()
            .take(10)
            .map(|e| ErrorSummary {
                fingerprint: e.fingerprint.clone(),
                category: e.category,
                severity: e.severity,
                message: e.message.clone(),
                count: e.count,
                last_seen: e.last_seen,
            })
            .collect();
        stats
    }

    /// Most recent alerts first
    #[must_use]
    pub fn recent_alerts(&self, limit: usize) -> Vec<Alert> {
        self.state.lock().engine.recent(limit)
    }

    /// Add a rule, replacing any rule with the same id
    pub fn add_rule(&self, rule: AlertRule) {
        debug!(rule = %rule.id, "Alert rule added");
        self.state.lock().engine.upsert_rule(rule);
    }

    /// Remove a rule; `true` if it existed
    pub fn remove_rule(&self, id: &str) -> bool {
        self.state.lock().engine.remove_rule(id)
    }

    /// Enable or disable a rule; `true` if it exists
    pub fn set_rule_enabled(&self, id: &str, enabled: bool) -> bool {
        self.state.lock().engine.set_enabled(id, enabled)
    }

    /// Current rules
    #[must_use]
    pub fn rules(&self) -> Vec<AlertRule> {
        self.state.lock().engine.rules().to_vec()
    }

    /// Forget everything: errors, occurrences, alerts and rate limits
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.errors.clear();
        state.occurrences.clear();
        state.engine.clear();
    }

    /// Drop errors and alerts older than the retention window
    pub fn cleanup(&self) -> CleanupReport {
        let now = Instant::now();
        let retention = self.config.retention;
        let report = {
            let mut state = self.state.lock();
            let before = state.errors.len();
            state
                .errors
                .retain(|_, e| now.saturating_duration_since(e.last_seen_at) <= retention);
            let errors_removed = before - state.errors.len();
            let alerts_removed = state.engine.prune(now, retention);

            let keep = state.engine.max_window().max(HOUR);
            prune_occurrences(&mut state.occurrences, now, keep, self.config.max_occurrences);

            CleanupReport {
                errors_removed,
                alerts_removed,
            }
        };
        if report != CleanupReport::default() {
            info!(
                errors_removed = report.errors_removed,
                alerts_removed = report.alerts_removed,
                "Retention sweep"
            );
        }
        report
    }

    /// Run [`cleanup`](Self::cleanup) every `cleanup_interval` until cancelled
    pub fn spawn_cleanup(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        let period = self.config.cleanup_interval;
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        tracker.cleanup();
                    }
                }
            }
            debug!("Retention sweep stopped");
        })
    }

    /// Start delivering queued alerts through `dispatcher`.
    ///
    /// The queue has a single consumer; `None` if it was already started.
    pub fn spawn_dispatcher(
        &self,
        dispatcher: Arc<AlertDispatcher>,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let rx = self.alert_rx.lock().take()?;
        Some(tokio::spawn(dispatcher.run(rx, cancel)))
    }
}

enum Outcome {
    New,
    Repeat,
    Reopened,
}

fn prune_occurrences(
    occurrences: &mut VecDeque<Occurrence>,
    now: Instant,
    keep: Duration,
    cap: usize,
) {
    while occurrences
        .front()
        .is_some_and(|o| now.saturating_duration_since(o.at) > keep)
    {
        occurrences.pop_front();
    }
    while occurrences.len() > cap {
        occurrences.pop_front();
    }
}
