//! Delivery channels
//!
//! A [`Channel`] pushes alerts to an external destination. Channels are
//! registered with the alert manager together with an optional
//! [`ChannelConfig`](crate::alerts::ChannelConfig) that controls routing.

pub mod log;
pub mod webhook;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::alerts::model::{Alert, AlertBatch};

pub use self::log::LogChannel;
pub use webhook::WebhookChannel;

/// Outcome of one send attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryResult {
    pub success: bool,
    pub error: Option<String>,
    pub retry_count: u32,
    pub timestamp: DateTime<Utc>,
}

impl DeliveryResult {
    /// Successful delivery at the current time
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
            retry_count: 0,
            timestamp: Utc::now(),
        }
    }

    /// Failed delivery with an error message
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            retry_count: 0,
            timestamp: Utc::now(),
        }
    }
}

/// A destination alerts can be delivered to
#[async_trait]
pub trait Channel: Send + Sync {
    /// Registration id, unique per manager
    fn id(&self) -> &str;

    /// Kind of channel, e.g. `"webhook"`
    fn channel_type(&self) -> &str;

    /// Deliver one alert
    async fn send(&self, alert: &Alert) -> Result<DeliveryResult, ChannelError>;

    /// Deliver a batch; by default folded into a single summary alert
    async fn send_batch(&self, batch: &AlertBatch) -> Result<DeliveryResult, ChannelError> {
        self.send(&batch.to_summary_alert()).await
    }

    async fn health_check(&self) -> bool {
        true
    }
}

/// Channel errors
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Request error: {0}")]
    Request(String),

    #[error("Destination returned status {0}")]
    Status(u16),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel unavailable: {0}")]
    Unavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::batcher::build_batch;
    use crate::alerts::model::{AlertType, NewAlert};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<Alert>>,
    }

    #[async_trait]
    impl Channel for Recording {
        fn id(&self) -> &str {
            "rec"
        }

        fn channel_type(&self) -> &str {
            "memory"
        }

        async fn send(&self, alert: &Alert) -> Result<DeliveryResult, ChannelError> {
            self.seen.lock().push(alert.clone());
            Ok(DeliveryResult::ok())
        }
    }

    #[tokio::test]
    async fn test_default_send_batch_folds_alerts() {
        let channel = Recording::default();
        let alerts = (0..3)
            .map(|i| NewAlert::new(AlertType::VolumeSpike, format!("Spike {}", i), "m").into_alert())
            .collect();
        let batch = build_batch(AlertType::VolumeSpike, alerts);

        let result = channel.send_batch(&batch).await.unwrap();
        assert!(result.success);
        assert!(channel.health_check().await);

        let seen = channel.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].id, batch.id);
        assert!(seen[0].message.contains("- Spike 2"));
    }

    #[test]
    fn test_delivery_result_constructors() {
        assert!(DeliveryResult::ok().success);
        let failed = DeliveryResult::failed("nope");
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("nope"));
    }
}
