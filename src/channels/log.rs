//! Channel that writes alerts to the log

use async_trait::async_trait;

use super::{Channel, ChannelError, DeliveryResult};
use crate::alerts::model::{Alert, AlertBatch, AlertPriority};

/// Emits each alert as a `tracing` event; high and critical alerts log at warn
pub struct LogChannel {
    id: String,
}

impl LogChannel {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl Default for LogChannel {
    fn default() -> Self {
        Self::new("log")
    }
}

#[async_trait]
impl Channel for LogChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn channel_type(&self) -> &str {
        "log"
    }

    async fn send(&self, alert: &Alert) -> Result<DeliveryResult, ChannelError> {
        if alert.priority >= AlertPriority::High {
            tracing::warn!(
                alert_id = %alert.id,
                alert_type = %alert.alert_type,
                priority = %alert.priority,
                rule_id = ?alert.rule_id,
                "{}: {}",
                alert.title,
                alert.message
            );
        } else {
            tracing::info!(
                alert_id = %alert.id,
                alert_type = %alert.alert_type,
                priority = %alert.priority,
                rule_id = ?alert.rule_id,
                "{}: {}",
                alert.title,
                alert.message
            );
        }
        Ok(DeliveryResult::ok())
    }

    async fn send_batch(&self, batch: &AlertBatch) -> Result<DeliveryResult, ChannelError> {
        tracing::info!(
            batch_id = %batch.id,
            alert_type = %batch.alert_type,
            priority = %batch.priority,
            count = batch.len(),
            "{}",
            batch.summary
        );
        Ok(DeliveryResult::ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::model::{AlertType, NewAlert};

    #[test]
    fn test_log_channel_always_succeeds() {
        let channel = LogChannel::default();
        assert_eq!(channel.id(), "log");
        assert_eq!(channel.channel_type(), "log");

        let alert = NewAlert::new(AlertType::RugWarning, "Rug", "liquidity pulled")
            .with_priority(AlertPriority::Critical)
            .into_alert();
        let result = tokio_test::assert_ok!(tokio_test::block_on(channel.send(&alert)));
        assert!(result.success);
        assert!(tokio_test::block_on(channel.health_check()));
    }
}
