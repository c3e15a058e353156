//! Pipeline event fan-out
//!
//! Every observer gets its own receiver via [`EventBus::subscribe`]; slow
//! receivers lag and skip rather than block the pipeline.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use super::model::AlertType;

/// Events emitted by the alert pipeline
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    Deduplicated {
        alert_id: String,
        original_id: Option<String>,
        reason: String,
    },
    Batched {
        alert_id: String,
        alert_type: AlertType,
    },
    BatchFlushed {
        batch_id: String,
        alert_type: AlertType,
        count: usize,
    },
    /// Undersized buffer discarded by the drop policy
    BatchDropped {
        alert_type: AlertType,
        count: usize,
    },
    NotRouted {
        alert_id: String,
        reason: String,
    },
    Sent {
        alert_id: String,
        channel_id: String,
    },
    Failed {
        alert_id: String,
        channel_id: String,
        error: String,
    },
    RateLimited {
        alert_id: String,
        channel_id: String,
    },
    DeliverySuccess {
        delivery_id: String,
        channel_id: String,
        latency_ms: i64,
    },
    DeliveryRetry {
        delivery_id: String,
        alert_id: String,
        channel_id: String,
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
    },
    DeliveryFailure {
        delivery_id: String,
        alert_id: String,
        channel_id: String,
        retry_count: u32,
        error: String,
    },
}

impl PipelineEvent {
    /// Short event name, e.g. `delivery_retry`
    pub fn name(&self) -> &'static str {
        match self {
            PipelineEvent::Deduplicated { .. } => "deduplicated",
            PipelineEvent::Batched { .. } => "batched",
            PipelineEvent::BatchFlushed { .. } => "batch_flushed",
            PipelineEvent::BatchDropped { .. } => "batch_dropped",
            PipelineEvent::NotRouted { .. } => "not_routed",
            PipelineEvent::Sent { .. } => "sent",
            PipelineEvent::Failed { .. } => "failed",
            PipelineEvent::RateLimited { .. } => "rate_limited",
            PipelineEvent::DeliverySuccess { .. } => "delivery_success",
            PipelineEvent::DeliveryRetry { .. } => "delivery_retry",
            PipelineEvent::DeliveryFailure { .. } => "delivery_failure",
        }
    }
}

/// Broadcast bus shared by pipeline components
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event; having no subscribers is not an error
    pub fn publish(&self, event: PipelineEvent) {
        tracing::trace!(event = event.name(), "Pipeline event");
        let _ = self.tx.send(event);
    }

    /// Subscribe to events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    /// Number of live receivers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
