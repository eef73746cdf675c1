//! Alert rules, rate-limited evaluation and delivery
//!
//! Rules are evaluated synchronously after every tracked error. A rule that
//! fired less than `rate_limit` ago is skipped outright: qualifying errors in
//! that window are suppressed, not queued. The firing time is recorded before
//! delivery is attempted, so a failing channel never re-arms a rule.

mod channels;
mod dispatch;

pub use channels::{AlertChannel, ConsoleChannel, SlackChannel, WebhookChannel};
pub use dispatch::AlertDispatcher;

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::humantime_serde;
use crate::tracker::{ErrorCategory, Severity, TrackedError};

/// Delivery channel kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Process log
    Console,
    /// Email (transport supplied by the embedding service)
    Email,
    /// Slack incoming webhook
    Slack,
    /// Generic JSON webhook
    Webhook,
}

/// What a rule looks at
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertCondition {
    /// The error just tracked matches a category and/or minimum severity
    SpecificError {
        /// Required category
        #[serde(default)]
        category: Option<ErrorCategory>,
        /// Minimum severity
        #[serde(default)]
        min_severity: Option<Severity>,
    },
    /// At least `threshold` occurrences within `window`
    ErrorCount {
        /// Occurrence threshold
        threshold: u64,
        /// Sliding window
        #[serde(with = "humantime_serde")]
        window: Duration,
        /// Only count this category
        #[serde(default)]
        category: Option<ErrorCategory>,
    },
    /// Occurrences per minute over `window` reach `per_minute`
    ErrorRate {
        /// Rate threshold
        per_minute: f64,
        /// Sliding window
        #[serde(with = "humantime_serde")]
        window: Duration,
    },
}

impl AlertCondition {
    /// Window the condition needs occurrence history for
    #[must_use]
    pub fn window(&self) -> Duration {
        match self {
            Self::SpecificError { .. } => Duration::ZERO,
            Self::ErrorCount { window, .. } | Self::ErrorRate { window, .. } => *window,
        }
    }
}

/// Alert rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    /// Stable id (rate limiting is keyed on it)
    pub id: String,
    /// Display name
    pub name: String,
    /// Condition
    pub condition: AlertCondition,
    /// Severity of the resulting alert
    pub severity: Severity,
    /// Where to deliver
    pub channels: Vec<ChannelKind>,
    /// Minimum time between two firings
    #[serde(with = "humantime_serde")]
    pub rate_limit: Duration,
    /// Whether the rule is evaluated
    pub enabled: bool,
}

impl AlertRule {
    /// Enabled rule, console delivery, 15 minute rate limit
    pub fn new(id: impl Into<String>, name: impl Into<String>, condition: AlertCondition) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            condition,
            severity: Severity::High,
            channels: vec![ChannelKind::Console],
            rate_limit: Duration::from_secs(15 * 60),
            enabled: true,
        }
    }

    /// Set the alert severity
    #[must_use]
    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Set the delivery channels
    #[must_use]
    pub fn channels(mut self, channels: impl Into<Vec<ChannelKind>>) -> Self {
        self.channels = channels.into();
        self
    }

    /// Set the rate limit in minutes
    #[must_use]
    pub fn rate_limit_minutes(mut self, minutes: u64) -> Self {
        self.rate_limit = Duration::from_secs(minutes * 60);
        self
    }

    /// Built-in rules
    #[must_use]
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new(
                "critical-errors",
                "Critical error",
                AlertCondition::SpecificError {
                    category: None,
                    min_severity: Some(Severity::Critical),
                },
            )
            .severity(Severity::Critical)
            .channels([ChannelKind::Console, ChannelKind::Slack, ChannelKind::Webhook])
            .rate_limit_minutes(5),
            Self::new(
                "high-error-rate",
                "High error rate",
                AlertCondition::ErrorRate {
                    per_minute: 10.0,
                    window: Duration::from_secs(5 * 60),
                },
            )
            .severity(Severity::High)
            .channels([ChannelKind::Console, ChannelKind::Slack])
            .rate_limit_minutes(15),
            Self::new(
                "database-errors",
                "Repeated database errors",
                AlertCondition::ErrorCount {
                    threshold: 5,
                    window: Duration::from_secs(5 * 60),
                    category: Some(ErrorCategory::Database),
                },
            )
            .severity(Severity::High)
            .channels([ChannelKind::Console, ChannelKind::Webhook])
            .rate_limit_minutes(15),
            Self::new(
                "auth-failures",
                "Authentication failures",
                AlertCondition::ErrorCount {
                    threshold: 10,
                    window: Duration::from_secs(10 * 60),
                    category: Some(ErrorCategory::Authentication),
                },
            )
            .severity(Severity::Medium)
            .rate_limit_minutes(30),
        ]
    }
}

/// One firing of a rule against a tracked error
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    /// Alert id
    pub id: Uuid,
    /// Rule that fired
    pub rule_id: String,
    /// Rule display name
    pub rule_name: String,
    /// Error that triggered it
    pub fingerprint: String,
    /// Category of the triggering error
    pub category: ErrorCategory,
    /// Alert severity (from the rule)
    pub severity: Severity,
    /// Rendered message
    pub message: String,
    /// Where to deliver
    pub channels: Vec<ChannelKind>,
    /// When it fired
    pub timestamp: DateTime<Utc>,
    #[serde(skip)]
    pub(crate) fired_at: Instant,
}

/// One error occurrence, kept for windowed conditions
#[derive(Debug, Clone)]
pub(crate) struct Occurrence {
    pub(crate) at: Instant,
    pub(crate) category: ErrorCategory,
}

/// Rule set, rate-limit bookkeeping and alert history.
///
/// Holds no lock of its own; the tracker owns it behind its state mutex.
#[derive(Debug, Default)]
pub struct AlertEngine {
    rules: Vec<AlertRule>,
    last_fired: HashMap<String, Instant>,
    history: VecDeque<Alert>,
    max_history: usize,
}

impl AlertEngine {
    /// Engine with the given rules
    #[must_use]
    pub fn new(rules: Vec<AlertRule>, max_history: usize) -> Self {
        Self {
            rules,
            last_fired: HashMap::new(),
            history: VecDeque::new(),
            max_history: max_history.max(1),
        }
    }

    /// Add or replace a rule (matched by id)
    pub fn upsert_rule(&mut self, rule: AlertRule) {
        if let Some(existing) = self.rules.iter_mut().find(|r| r.id == rule.id) {
            *existing = rule;
        } else {
            self.rules.push(rule);
        }
    }

    /// Remove a rule; `true` if it existed
    pub fn remove_rule(&mut self, id: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|r| r.id != id);
        self.last_fired.remove(id);
        self.rules.len() != before
    }

    /// Enable or disable a rule; `true` if it exists
    pub fn set_enabled(&mut self, id: &str, enabled: bool) -> bool {
        self.rules
            .iter_mut()
            .find(|r| r.id == id)
            .map(|r| r.enabled = enabled)
            .is_some()
    }

    /// Current rules
    #[must_use]
    pub fn rules(&self) -> &[AlertRule] {
        &self.rules
    }

    /// Longest window any enabled rule needs
    #[must_use]
    pub fn max_window(&self) -> Duration {
        self.rules
            .iter()
            .filter(|r| r.enabled)
            .map(|r| r.condition.window())
            .max()
            .unwrap_or_default()
    }

    /// Evaluate every enabled rule against the error just tracked.
    ///
    /// Returns the alerts that fired; they are already in history and their
    /// rules are already rate limited.
    pub(crate) fn evaluate(
        &mut self,
        error: &TrackedError,
        occurrences: &VecDeque<Occurrence>,
        now: Instant,
    ) -> Vec<Alert> {
        let mut fired = Vec::new();

        for rule in self.rules.iter().filter(|r| r.enabled) {
            if let Some(last) = self.last_fired.get(&rule.id)
                && now.saturating_duration_since(*last) < rule.rate_limit
            {
                debug!(rule = %rule.id, "Rule rate limited, skipping");
                continue;
            }

            if !condition_met(&rule.condition, error, occurrences, now) {
                continue;
            }

            self.last_fired.insert(rule.id.clone(), now);
            let alert = Alert {
                id: Uuid::new_v4(),
                rule_id: rule.id.clone(),
                rule_name: rule.name.clone(),
                fingerprint: error.fingerprint.clone(),
                category: error.category,
                severity: rule.severity,
                message: format!(
                    "[{}] {}: {} (seen {} times)",
                    rule.severity.as_str().to_uppercase(),
                    rule.name,
                    error.message,
                    error.count
                ),
                channels: rule.channels.clone(),
                timestamp: Utc::now(),
                fired_at: now,
            };
            warn!(
                rule = %rule.id,
                fingerprint = %error.fingerprint,
                severity = %rule.severity,
                "Alert fired"
            );
            fired.push(alert);
        }

        for alert in &fired {
            if self.history.len() >= self.max_history {
                self.history.pop_front();
            }
            self.history.push_back(alert.clone());
        }
        fired
    }

    /// Most recent alerts first
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<Alert> {
        self.history.iter().rev().take(limit).cloned().collect()
    }

    /// Alerts fired within `window` of `now`
    #[must_use]
    pub fn count_since(&self, now: Instant, window: Duration) -> usize {
        self.history
            .iter()
            .filter(|a| now.saturating_duration_since(a.fired_at) <= window)
            .count()
    }

    /// Number of alerts in history
    #[must_use]
    pub fn len(&self) -> usize {
        self.history.len()
    }

    /// Whether history is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Drop alerts older than `retention`; returns how many went
    pub(crate) fn prune(&mut self, now: Instant, retention: Duration) -> usize {
        let before = self.history.len();
        self.history
            .retain(|a| now.saturating_duration_since(a.fired_at) <= retention);
        before - self.history.len()
    }

    pub(crate) fn clear(&mut self) {
        self.history.clear();
        self.last_fired.clear();
    }
}

fn condition_met(
    condition: &AlertCondition,
    error: &TrackedError,
    occurrences: &VecDeque<Occurrence>,
    now: Instant,
) -> bool {
    match condition {
        AlertCondition::SpecificError {
            category,
            min_severity,
        } => {
            category.is_none_or(|c| c == error.category)
                && min_severity.is_none_or(|s| error.severity >= s)
        }
        AlertCondition::ErrorCount {
            threshold,
            window,
            category,
        } => {
            let count = count_in_window(occurrences, now, *window, *category);
            count >= *threshold
        }
        AlertCondition::ErrorRate { per_minute, window } => {
            let minutes = window.as_secs_f64() / 60.0;
            if minutes <= 0.0 {
                return false;
            }
            #[allow(clippy::cast_precision_loss)]
            let rate = count_in_window(occurrences, now, *window, None) as f64 / minutes;
            rate >= *per_minute
        }
    }
}

fn count_in_window(
    occurrences: &VecDeque<Occurrence>,
    now: Instant,
    window: Duration,
    category: Option<ErrorCategory>,
) -> u64 {
    occurrences
        .iter()
        .rev()
        .take_while(|o| now.saturating_duration_since(o.at) <= window)
        .filter(|o| category.is_none_or(|c| c == o.category))
        .count() as u64
}
