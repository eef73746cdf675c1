//! Alert delivery channels

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::{error, info, warn};

use super::{Alert, ChannelKind};
use crate::{Error, Result};
use crate::tracker::Severity;

/// Delivers alerts to one destination
#[async_trait]
pub trait AlertChannel: Send + Sync {
    /// Which kind of channel this is
    fn kind(&self) -> ChannelKind;

    /// Deliver one alert
    async fn send(&self, alert: &Alert) -> Result<()>;
}

/// Writes alerts to the process log
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleChannel;

#[async_trait]
impl AlertChannel for ConsoleChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Console
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        match alert.severity {
            Severity::Critical | Severity::High => error!(
                alert_id = %alert.id,
                rule = %alert.rule_id,
                fingerprint = %alert.fingerprint,
                category = %alert.category,
                "{}",
                alert.message
            ),
            Severity::Medium => warn!(
                alert_id = %alert.id,
                rule = %alert.rule_id,
                fingerprint = %alert.fingerprint,
                "{}",
                alert.message
            ),
            Severity::Low => info!(alert_id = %alert.id, rule = %alert.rule_id, "{}", alert.message),
        }
        Ok(())
    }
}

fn http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Channel(format!("Failed to create alert HTTP client: {e}")))
}

/// POSTs the alert as JSON to a generic webhook
#[derive(Debug, Clone)]
pub struct WebhookChannel {
    client: Client,
    url: String,
}

impl WebhookChannel {
    /// Channel posting to `url`
    ///
    /// # Errors
    ///
    /// [`Error::Channel`] if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AlertChannel for WebhookChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Webhook
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        self.client
            .post(&self.url)
            .json(alert)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Posts the alert text to a Slack incoming webhook
#[derive(Debug, Clone)]
pub struct SlackChannel {
    client: Client,
    url: String,
}

impl SlackChannel {
    /// Channel posting to the incoming-webhook `url`
    ///
    /// # Errors
    ///
    /// [`Error::Channel`] if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            url: url.into(),
        })
    }

    fn payload(alert: &Alert) -> serde_json::Value {
        let icon = match alert.severity {
            Severity::Critical => ":rotating_light:",
            Severity::High => ":warning:",
            Severity::Medium => ":large_yellow_circle:",
            Severity::Low => ":information_source:",
        };
        json!({
            "text": format!("{icon} {}", alert.message),
            "attachments": [{
                "fields": [
                    { "title": "Rule", "value": alert.rule_name, "short": true },
                    { "title": "Category", "value": alert.category.as_str(), "short": true },
                    { "title": "Fingerprint", "value": alert.fingerprint, "short": true },
                    { "title": "Time", "value": alert.timestamp.to_rfc3339(), "short": true },
                ]
            }]
        })
    }
}

#[async_trait]
impl AlertChannel for SlackChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Slack
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        self.client
            .post(&self.url)
            .json(&Self::payload(alert))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::ErrorCategory;
    use chrono::Utc;
    use tokio::time::Instant;
    use uuid::Uuid;

    fn alert() -> Alert {
        Alert {
            id: Uuid::new_v4(),
            rule_id: "critical-errors".to_string(),
            rule_name: "Critical error".to_string(),
            fingerprint: "abcd1234abcd1234".to_string(),
            category: ErrorCategory::Database,
            severity: Severity::Critical,
            message: "[CRITICAL] Critical error: db down (seen 1 times)".to_string(),
            channels: vec![ChannelKind::Slack],
            timestamp: Utc::now(),
            fired_at: Instant::now(),
        }
    }

    #[test]
    fn test_slack_payload_shape() {
        let payload = SlackChannel::payload(&alert());
        assert_eq!(
            payload["text"],
            ":rotating_light: [CRITICAL] Critical error: db down (seen 1 times)"
        );
        assert_eq!(payload["attachments"][0]["fields"][1]["value"], "database");
    }

    #[test]
    fn test_alert_serializes_without_instant() {
        let value = serde_json::to_value(alert()).unwrap();
        assert_eq!(value["rule_id"], "critical-errors");
        assert_eq!(value["severity"], "critical");
        assert_eq!(value["channels"][0], "slack");
        assert!(value.get("fired_at").is_none());
    }

    #[tokio::test]
    async fn test_webhook_gives_up_after_request_timeout() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/alerts", listener.local_addr().unwrap());
        // Accept and hold the connection without ever answering
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            drop(socket);
        });

        let channel = WebhookChannel::new(url, Duration::from_millis(200)).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), channel.send(&alert()))
            .await
            .expect("request timeout not applied");
        assert!(matches!(result, Err(Error::Http(e)) if e.is_timeout()));
        server.abort();
    }

    #[tokio::test]
    async fn test_console_channel_never_fails() {
        assert!(ConsoleChannel.send(&alert()).await.is_ok());
    }
}
