//! HTTP webhook channel

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Channel, ChannelError, DeliveryResult};
use crate::alerts::model::{Alert, AlertBatch};
use crate::alerts::router::ChannelConfig;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// POSTs alerts as JSON to a fixed URL
pub struct WebhookChannel {
    id: String,
    url: String,
    headers: HashMap<String, String>,
    timeout: Duration,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            headers: HashMap::new(),
            timeout: DEFAULT_TIMEOUT,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Per-request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build from a channel config: `{"url": ..., "headers": {...}, "timeout_ms": ...}`
    pub fn from_config(config: &ChannelConfig) -> Result<Self, ChannelError> {
        let url = config
            .config
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| ChannelError::Config(format!("channel {} has no url", config.id)))?;

        let mut channel = Self::new(config.id.clone(), url);
        if let Some(headers) = config.config.get("headers").and_then(Value::as_object) {
            for (key, value) in headers {
                if let Some(value) = value.as_str() {
                    channel = channel.with_header(key.clone(), value);
                }
            }
        }
        if let Some(ms) = config.config.get("timeout_ms").and_then(Value::as_u64) {
            channel = channel.with_timeout(Duration::from_millis(ms));
        }
        Ok(channel)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn post(&self, payload: &Value) -> Result<DeliveryResult, ChannelError> {
        let mut request = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(payload);

        for (key, value) in &self.headers {
            request = request.header(key, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ChannelError::Request(format!("Failed to send webhook: {}", e)))?;

        if !response.status().is_success() {
            return Err(ChannelError::Status(response.status().as_u16()));
        }

        tracing::debug!(channel_id = %self.id, url = %self.url, "Webhook notification sent");
        Ok(DeliveryResult::ok())
    }
}

fn alert_payload(alert: &Alert) -> Value {
    json!({
        "alert_id": alert.id,
        "alert_type": alert.alert_type,
        "priority": alert.priority,
        "title": alert.title,
        "message": alert.message,
        "data": alert.data,
        "rule_id": alert.rule_id,
        "timestamp": alert.timestamp.to_rfc3339(),
    })
}

#[async_trait]
impl Channel for WebhookChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn channel_type(&self) -> &str {
        "webhook"
    }

    async fn send(&self, alert: &Alert) -> Result<DeliveryResult, ChannelError> {
        self.post(&alert_payload(alert)).await
    }

    async fn send_batch(&self, batch: &AlertBatch) -> Result<DeliveryResult, ChannelError> {
        let payload = json!({
            "batch_id": batch.id,
            "alert_type": batch.alert_type,
            "priority": batch.priority,
            "summary": batch.summary,
            "count": batch.len(),
            "alerts": batch.alerts.iter().map(alert_payload).collect::<Vec<_>>(),
            "timestamp": batch.timestamp.to_rfc3339(),
        });
        self.post(&payload).await
    }

    async fn health_check(&self) -> bool {
        reqwest::Url::parse(&self.url)
            .map(|u| matches!(u.scheme(), "http" | "https"))
            .unwrap_or(false)
    }
}
