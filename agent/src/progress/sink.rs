//! Event sinks
//!
//! A sink delivers one event and reports whether that worked. Retrying is
//! the emitter's business, not the sink's.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

use crate::errors::UpgradeError;
use crate::models::event::UpgradeEvent;
use crate::mqtt::client::MqttPublisher;
use crate::mqtt::topics::Topics;

/// Line prefix consumers grep for on stderr
pub const PROGRESS_PREFIX: &str = "JSON_PROGRESS: ";

/// Delivers progress events
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: &UpgradeEvent) -> Result<(), UpgradeError>;
}

/// One JSON line per event on stderr
#[derive(Debug, Clone, Default)]
pub struct StderrSink;

#[async_trait]
impl EventSink for StderrSink {
    async fn emit(&self, event: &UpgradeEvent) -> Result<(), UpgradeError> {
        let line = serde_json::to_string(event)?;
        let mut stderr = std::io::stderr().lock();
        writeln!(stderr, "{}{}", PROGRESS_PREFIX, line)?;
        stderr.flush()?;
        Ok(())
    }
}

/// In-process channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<UpgradeEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UpgradeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn emit(&self, event: &UpgradeEvent) -> Result<(), UpgradeError> {
        self.tx
            .send(event.clone())
            .map_err(|_| UpgradeError::Internal("event channel closed".to_string()))
    }
}

/// Publishes to `upgrade/job/<job_id>/events`
#[derive(Clone)]
pub struct MqttSink {
    publisher: MqttPublisher,
}

impl MqttSink {
    pub fn new(publisher: MqttPublisher) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl EventSink for MqttSink {
    async fn emit(&self, event: &UpgradeEvent) -> Result<(), UpgradeError> {
        self.publisher
            .publish_json(&Topics::job_events(&event.job_id), event)
            .await
    }
}

/// POSTs each event as JSON
#[derive(Debug, Clone)]
pub struct WebhookSink {
    client: Client,
    url: Url,
}

impl WebhookSink {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, UpgradeError> {
        let url = Url::parse(url).map_err(|e| UpgradeError::ConfigError(format!("invalid webhook url {}: {}", url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(UpgradeError::ConfigError(format!(
                "webhook url must be http or https, got {}",
                url.scheme()
            )));
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl EventSink for WebhookSink {
    async fn emit(&self, event: &UpgradeEvent) -> Result<(), UpgradeError> {
        debug!("POST {} {}", self.url, event.event_type);
        self.client
            .post(self.url.clone())
            .json(event)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Delivers to every sink; fails if any sink failed
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl EventSink for FanoutSink {
    async fn emit(&self, event: &UpgradeEvent) -> Result<(), UpgradeError> {
        let mut failures = Vec::new();
        for sink in &self.sinks {
            if let Err(e) = sink.emit(event).await {
                failures.push(e.to_string());
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(UpgradeError::Internal(format!("event delivery failed: {}", failures.join("; "))))
        }
    }
}
