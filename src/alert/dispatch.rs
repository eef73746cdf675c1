//! Background alert delivery

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::channels::{AlertChannel, ConsoleChannel, SlackChannel, WebhookChannel};
use super::{Alert, ChannelKind};
use crate::Result;
use crate::config::ChannelsConfig;

/// Routes fired alerts to their channels.
///
/// Delivery never blocks error tracking: the tracker enqueues, a background
/// task drains the queue and calls [`deliver`](Self::deliver).
#[derive(Default)]
pub struct AlertDispatcher {
    channels: RwLock<HashMap<ChannelKind, Arc<dyn AlertChannel>>>,
}

impl AlertDispatcher {
    /// Dispatcher with no channels
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatcher with the channels the configuration enables
    ///
    /// # Errors
    ///
    /// [`Error::Channel`](crate::Error::Channel) if an HTTP channel cannot be built.
    pub fn from_config(config: &ChannelsConfig) -> Result<Self> {
        let dispatcher = Self::new();
        if config.console {
            dispatcher.register(Arc::new(ConsoleChannel));
        }
        if let Some(url) = &config.webhook_url {
            dispatcher.register(Arc::new(WebhookChannel::new(url, config.request_timeout)?));
        }
        if let Some(url) = &config.slack_webhook_url {
            dispatcher.register(Arc::new(SlackChannel::new(url, config.request_timeout)?));
        }
        Ok(dispatcher)
    }

    /// Install a channel, replacing any channel of the same kind
    pub fn register(&self, channel: Arc<dyn AlertChannel>) {
        let kind = channel.kind();
        if self.channels.write().insert(kind, channel).is_some() {
            debug!(?kind, "Replaced alert channel");
        }
    }

    /// Kinds with an installed channel
    #[must_use]
    pub fn kinds(&self) -> Vec<ChannelKind> {
        self.channels.read().keys().copied().collect()
    }

    /// Send `alert` to every channel it names, concurrently.
    ///
    /// Channels that are not installed are skipped. Returns the number of
    /// deliveries that failed; failures are logged, never propagated.
    pub async fn deliver(&self, alert: &Alert) -> usize {
        let targets: Vec<Arc<dyn AlertChannel>> = {
            let channels = self.channels.read();
            alert
                .channels
                .iter()
                .filter_map(|kind| {
                    let channel = channels.get(kind).cloned();
                    if channel.is_none() {
                        debug!(?kind, rule = %alert.rule_id, "No channel installed, skipping");
                    }
                    channel
                })
                .collect()
        };

        let results = join_all(targets.iter().map(|c| async move { (c.kind(), c.send(alert).await) })).await;

        let mut failed = 0;
        for (kind, result) in results {
            if let Err(e) = result {
                failed += 1;
                warn!(?kind, alert_id = %alert.id, rule = %alert.rule_id, error = %e, "Alert delivery failed");
            }
        }
        failed
    }

    /// Drain `rx` until it closes or `cancel` fires
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<Alert>, cancel: CancellationToken) {
        info!("Alert dispatcher started");
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(alert) => {
                        self.deliver(&alert).await;
                    }
                    None => break,
                },
            }
        }
        info!("Alert dispatcher stopped");
    }
}
