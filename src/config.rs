//! Configuration management

use std::{collections::HashMap, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::failsafe::OperationKind;
use crate::{Error, Result};

/// Environment variable prefix for overrides (`CALLGUARD_TRACKER__RETENTION=3d`)
pub const ENV_PREFIX: &str = "CALLGUARD_";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReliabilityConfig {
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Circuit breaker defaults for dependencies without an override
    pub circuit_breaker: CircuitBreakerConfig,
    /// Retry defaults for dependencies without an override
    pub retry: RetryConfig,
    /// Per-dependency overrides
    pub dependencies: HashMap<String, DependencyConfig>,
    /// Error tracker configuration
    pub tracker: TrackerConfig,
    /// Health reporting configuration
    pub health: HealthConfig,
    /// Alert channel configuration
    pub channels: ChannelsConfig,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        let mut dependencies = HashMap::new();
        for name in ["openai", "gemini"] {
            dependencies.insert(
                name.to_string(),
                DependencyConfig {
                    circuit_breaker: Some(CircuitBreakerConfig::external_api()),
                    retry: Some(RetryConfig::ai_api()),
                    kind: OperationKind::AiGeneration,
                    ..Default::default()
                },
            );
        }
        dependencies.insert(
            "youtube".to_string(),
            DependencyConfig {
                circuit_breaker: Some(CircuitBreakerConfig::external_api()),
                retry: Some(RetryConfig::video_platform()),
                kind: OperationKind::ExternalApi,
                ..Default::default()
            },
        );
        dependencies.insert(
            "database".to_string(),
            DependencyConfig {
                circuit_breaker: Some(CircuitBreakerConfig::database()),
                retry: Some(RetryConfig::database()),
                kind: OperationKind::DatabaseQuery,
                critical: true,
                ..Default::default()
            },
        );

        Self {
            logging: LoggingConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            dependencies,
            tracker: TrackerConfig::default(),
            health: HealthConfig::default(),
            channels: ChannelsConfig::default(),
        }
    }
}

impl ReliabilityConfig {
    /// Load configuration from file and environment.
    ///
    /// Both are layered over [`Default`], so a file that configures one
    /// dependency keeps the built-in presets for the others.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Check invariants that serde cannot express
    pub fn validate(&self) -> Result<()> {
        self.circuit_breaker.validate("circuit_breaker")?;
        self.retry.validate("retry")?;

        for (name, dep) in &self.dependencies {
            if let Some(cb) = &dep.circuit_breaker {
                cb.validate(&format!("dependencies.{name}.circuit_breaker"))?;
            }
            if let Some(retry) = &dep.retry {
                retry.validate(&format!("dependencies.{name}.retry"))?;
            }
            if dep.timeout.is_some_and(|t| t.is_zero()) {
                return Err(Error::Config(format!(
                    "dependencies.{name}.timeout must be greater than zero"
                )));
            }
        }

        if self.tracker.retention.is_zero() || self.tracker.cleanup_interval.is_zero() {
            return Err(Error::Config(
                "tracker.retention and tracker.cleanup_interval must be greater than zero"
                    .to_string(),
            ));
        }
        if self.tracker.alert_queue_size == 0 {
            return Err(Error::Config(
                "tracker.alert_queue_size must be greater than zero".to_string(),
            ));
        }
        if self.health.interval.is_zero() {
            return Err(Error::Config(
                "health.interval must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Effective settings for a dependency, falling back to the defaults
    #[must_use]
    pub fn dependency(&self, name: &str) -> ResolvedDependency {
        let dep = self.dependencies.get(name).cloned().unwrap_or_default();
        ResolvedDependency {
            circuit_breaker: dep
                .circuit_breaker
                .unwrap_or_else(|| self.circuit_breaker.clone()),
            retry: dep.retry.unwrap_or_else(|| self.retry.clone()),
            timeout: dep.timeout.unwrap_or_else(|| dep.kind.default_timeout()),
            kind: dep.kind,
            critical: dep.critical,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (text, json)
    pub format: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: None,
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Enable circuit breaker
    pub enabled: bool,
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Half-open successes before closing
    pub success_threshold: u32,
    /// Time to wait before half-open
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,
    /// Concurrent trial calls admitted while half-open
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::external_api()
    }
}

impl CircuitBreakerConfig {
    /// Preset for remote APIs (AI providers, video platform)
    #[must_use]
    pub fn external_api() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(60),
            half_open_max_calls: 2,
        }
    }

    /// Preset for the database: high call volume, small blast radius
    #[must_use]
    pub fn database() -> Self {
        Self {
            enabled: true,
            failure_threshold: 3,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(10),
            half_open_max_calls: 2,
        }
    }

    fn validate(&self, path: &str) -> Result<()> {
        if self.failure_threshold == 0 || self.success_threshold == 0 {
            return Err(Error::Config(format!(
                "{path}: failure_threshold and success_threshold must be greater than zero"
            )));
        }
        Ok(())
    }
}

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Enable retries
    pub enabled: bool,
    /// Maximum attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Upper bound for any delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
    /// Randomize each delay within ±50%
    pub jitter: bool,
    /// Which failures are worth another attempt
    pub retry_on: RetryOn,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::network()
    }
}

impl RetryConfig {
    /// Generic network calls
    #[must_use]
    pub fn network() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
            retry_on: RetryOn::default(),
        }
    }

    /// AI provider requests: slow, rate limited, worth waiting for
    #[must_use]
    pub fn ai_api() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            retry_on: RetryOn {
                message_patterns: vec![
                    "rate limit".to_string(),
                    "overloaded".to_string(),
                    "temporarily unavailable".to_string(),
                ],
                ..RetryOn::default()
            },
            ..Self::network()
        }
    }

    /// Video platform API: quota errors recover slowly
    #[must_use]
    pub fn video_platform() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            retry_on: RetryOn {
                message_patterns: vec!["backenderror".to_string(), "rate limit".to_string()],
                ..RetryOn::default()
            },
            ..Self::network()
        }
    }

    /// Database queries: fail fast, only retry connection trouble
    #[must_use]
    pub fn database() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            retry_on: RetryOn {
                status_codes: Vec::new(),
                retry_server_errors: false,
                message_patterns: vec![
                    "connection".to_string(),
                    "deadlock".to_string(),
                    "too many clients".to_string(),
                ],
                ..RetryOn::default()
            },
            ..Self::network()
        }
    }

    /// Large uploads: few attempts, long pauses
    #[must_use]
    pub fn file_upload() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
            ..Self::network()
        }
    }

    fn validate(&self, path: &str) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config(format!(
                "{path}: max_attempts must be at least 1"
            )));
        }
        if self.multiplier < 1.0 || !self.multiplier.is_finite() {
            return Err(Error::Config(format!(
                "{path}: multiplier must be a finite number >= 1.0"
            )));
        }
        if self.base_delay > self.max_delay {
            return Err(Error::Config(format!(
                "{path}: base_delay must not exceed max_delay"
            )));
        }
        Ok(())
    }
}

/// Failure conditions that warrant another attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOn {
    /// Transport error codes
    pub error_codes: Vec<String>,
    /// HTTP-like statuses
    pub status_codes: Vec<u16>,
    /// Any 5xx status
    pub retry_server_errors: bool,
    /// Deadline misses
    pub retry_timeouts: bool,
    /// Case-insensitive message substrings
    pub message_patterns: Vec<String>,
}

impl Default for RetryOn {
    fn default() -> Self {
        Self {
            error_codes: ["ECONNRESET", "ETIMEDOUT", "ECONNREFUSED", "ENOTFOUND", "EPIPE", "EAI_AGAIN"]
                .iter()
                .map(ToString::to_string)
                .collect(),
            status_codes: vec![408, 429],
            retry_server_errors: true,
            retry_timeouts: true,
            message_patterns: Vec::new(),
        }
    }
}

/// Per-dependency overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DependencyConfig {
    /// Circuit breaker override
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    /// Retry override
    pub retry: Option<RetryConfig>,
    /// Kind of work; picks the default deadline
    pub kind: OperationKind,
    /// Explicit per-attempt deadline
    #[serde(with = "humantime_serde::option")]
    pub timeout: Option<Duration>,
    /// A failing check for this dependency makes the system unhealthy
    pub critical: bool,
}

/// Dependency settings after defaults are applied
#[derive(Debug, Clone)]
pub struct ResolvedDependency {
    /// Circuit breaker settings
    pub circuit_breaker: CircuitBreakerConfig,
    /// Retry settings
    pub retry: RetryConfig,
    /// Per-attempt deadline
    pub timeout: Duration,
    /// Kind of work
    pub kind: OperationKind,
    /// Critical for overall health
    pub critical: bool,
}

/// Error tracker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// How long tracked errors and alerts are kept after last activity
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
    /// How often the retention sweep runs
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
    /// Stack frames that take part in fingerprinting
    pub stack_frames: usize,
    /// Maximum alerts kept in history
    pub max_alerts: usize,
    /// Maximum occurrences kept for windowed rule conditions
    pub max_occurrences: usize,
    /// Pending deliveries before new alerts are dropped
    pub alert_queue_size: usize,
    /// Install the built-in alert rules
    pub default_rules: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(7 * 24 * 3600),
            cleanup_interval: Duration::from_secs(60),
            stack_frames: 3,
            max_alerts: 1000,
            max_occurrences: 10_000,
            alert_queue_size: 256,
            default_rules: true,
        }
    }
}

/// Health reporting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Snapshot refresh interval
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Deadline for a single dependency probe
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            probe_timeout: OperationKind::HealthCheck.default_timeout(),
        }
    }
}

/// Alert channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    /// Log alerts through tracing
    pub console: bool,
    /// Generic webhook endpoint (JSON POST)
    pub webhook_url: Option<String>,
    /// Slack incoming-webhook URL
    pub slack_webhook_url: Option<String>,
    /// HTTP timeout for webhook deliveries
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            console: true,
            webhook_url: None,
            slack_webhook_url: None,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Human-readable durations: `"100ms"`, `"30s"`, `"5m"`, `"2h"`, `"7d"`
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to a human-readable string
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format(*duration))
    }

    /// Deserialize a human-readable duration string
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Render a duration with the largest exact unit
    #[must_use]
    pub fn format(duration: Duration) -> String {
        if duration.subsec_nanos() != 0 {
            return format!("{}ms", duration.as_millis());
        }
        let secs = duration.as_secs();
        match secs {
            0 => "0s".to_string(),
            s if s % 86_400 == 0 => format!("{}d", s / 86_400),
            s if s % 3600 == 0 => format!("{}h", s / 3600),
            s if s % 60 == 0 => format!("{}m", s / 60),
            s => format!("{s}s"),
        }
    }

    /// Parse `"30s"`, `"5m"`, `"100ms"`; a bare number means seconds
    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let number = |v: &str| v.trim().parse::<u64>().map_err(|e| format!("{s:?}: {e}"));

        if let Some(ms) = s.strip_suffix("ms") {
            number(ms).map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            number(secs).map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            number(mins).map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            number(hours).map(|h| Duration::from_secs(h * 3600))
        } else if let Some(days) = s.strip_suffix('d') {
            number(days).map(|d| Duration::from_secs(d * 86_400))
        } else {
            number(s).map(Duration::from_secs)
        }
    }

    /// Same format for `Option<Duration>`
    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        /// Serialize an optional duration
        ///
        /// # Errors
        ///
        /// Returns a serialization error if the serializer fails.
        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => serializer.serialize_some(&super::format(*d)),
                None => serializer.serialize_none(),
            }
        }

        /// Deserialize an optional duration
        ///
        /// # Errors
        ///
        /// Returns a deserialization error if the string cannot be parsed as a duration.
        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<String>::deserialize(deserializer)?
                .map(|s| super::parse(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
