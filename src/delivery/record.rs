//! Delivery record types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of one (alert, channel) delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sending,
    Sent,
    Failed,
    Retrying,
    Cancelled,
}

impl DeliveryStatus {
    /// No further transitions happen from here
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeliveryStatus::Sent | DeliveryStatus::Failed | DeliveryStatus::Cancelled
        )
    }
}

/// Tracks the attempts to deliver one alert or batch to one channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: String,
    /// Alert or batch id
    pub alert_id: String,
    pub channel_id: String,
    pub status: DeliveryStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Start of the most recent attempt
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl DeliveryRecord {
    pub fn new(id: String, alert_id: impl Into<String>, channel_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            alert_id: alert_id.into(),
            channel_id: channel_id.into(),
            status: DeliveryStatus::Pending,
            retry_count: 0,
            last_error: None,
            created_at: now,
            sent_at: None,
            delivered_at: None,
            next_retry_at: None,
        }
    }

    /// Milliseconds from creation to successful delivery
    pub fn delivery_ms(&self) -> Option<i64> {
        self.delivered_at
            .map(|at| (at - self.created_at).num_milliseconds())
    }

    /// Most recent state change, used for retention
    pub fn last_activity(&self) -> DateTime<Utc> {
        [self.delivered_at, self.sent_at, self.next_retry_at]
            .into_iter()
            .flatten()
            .fold(self.created_at, |a, b| a.max(b))
    }
}
