//! Callguard Library
//!
//! Call-reliability layer for services that depend on slow or flaky
//! dependencies (AI providers, video platforms, databases).
//!
//! # Features
//!
//! - **Circuit breakers**: per-dependency fail-fast with bounded half-open trials
//! - **Retries**: named backoff policies with jitter and cancellation
//! - **Timeouts**: per-kind deadlines raced against caller cancellation
//! - **Error tracking**: classification, fingerprinting, deduplication
//! - **Alerting**: rate-limited rules delivered to console, Slack or webhooks
//! - **Health**: point-in-time reports and an HTTP adapter for ops tooling
//!
//! # Composition
//!
//! [`failsafe::Failsafe::execute`] nests the guards as
//! breaker → retry → timeout → operation and hands terminal failures to the
//! [`tracker::ErrorTracker`]. The [`Reliability`] context wires every
//! component from one [`config::ReliabilityConfig`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod alert;
pub mod config;
pub mod error;
pub mod failsafe;
pub mod failure;
pub mod health;
pub mod metrics;
pub mod reliability;
pub mod tracker;

pub use error::{CallError, CircuitOpenError, Error, Result, TimeoutError};
pub use failure::{DependencyError, FailureDetails};
pub use reliability::{BackgroundTasks, Reliability};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` wins over `level` when set. `format` is `"json"` or text.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Config(format!("tracing already initialized: {e}")))?,
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Config(format!("tracing already initialized: {e}")))?,
    }

    Ok(())
}
