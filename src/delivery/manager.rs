//! Delivery bookkeeping and retry scheduling
//!
//! One record per (alert, channel) attempt. Failures are rescheduled with
//! capped exponential backoff until `max_retries` is exceeded; the alert
//! manager's retry worker picks up due records via
//! [`DeliveryManager::get_deliveries_for_retry`].

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

use super::record::{DeliveryRecord, DeliveryStatus};
use crate::alerts::events::{EventBus, PipelineEvent};
use crate::config::{DeliveryConfig, RetryConfig};
use crate::id::next_id;

/// Backoff before the `retry_count`-th retry (1-based), capped at the maximum
pub fn backoff_delay(retry: &RetryConfig, retry_count: u32) -> Duration {
    let exponent = retry_count.saturating_sub(1).min(i32::MAX as u32) as i32;
    let raw = retry.initial_delay_ms as f64 * retry.backoff_multiplier.powi(exponent);
    let capped = if raw.is_finite() {
        raw.min(retry.max_delay_ms as f64)
    } else {
        retry.max_delay_ms as f64
    };
    Duration::milliseconds(capped.max(0.0) as i64)
}

/// Aggregate delivery statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeliveryStats {
    pub total: usize,
    pub pending: usize,
    pub sending: usize,
    pub sent: usize,
    pub failed: usize,
    pub retrying: usize,
    pub cancelled: usize,
    /// sent / (sent + failed), 0 when nothing finished
    pub success_rate: f64,
    /// Mean of the rolling latency samples
    pub avg_latency_ms: f64,
}

/// Statistics for one channel
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChannelDeliveryStats {
    pub channel_id: String,
    pub total: usize,
    pub sent: usize,
    pub failed: usize,
    pub retrying: usize,
    pub success_rate: f64,
    pub avg_delivery_ms: f64,
}

/// Owns all delivery records
pub struct DeliveryManager {
    retry: RetryConfig,
    config: DeliveryConfig,
    records: DashMap<String, DeliveryRecord>,
    latencies: Mutex<VecDeque<i64>>,
    events: EventBus,
}

impl DeliveryManager {
    pub fn new(retry: RetryConfig, config: DeliveryConfig, events: EventBus) -> Self {
        Self {
            retry,
            config,
            records: DashMap::new(),
            latencies: Mutex::new(VecDeque::new()),
            events,
        }
    }

    /// Create a pending record
    pub fn create_delivery(&self, alert_id: &str, channel_id: &str) -> DeliveryRecord {
        let record = DeliveryRecord::new(next_id("delivery"), alert_id, channel_id, Utc::now());
        self.records.insert(record.id.clone(), record.clone());
        record
    }

    /// Get a delivery record by ID
    pub fn get(&self, id: &str) -> Option<DeliveryRecord> {
        self.records.get(id).map(|r| r.clone())
    }

    /// Move a non-terminal record to `sending`
    pub fn mark_sending(&self, id: &str) -> bool {
        match self.records.get_mut(id) {
            Some(mut record) if !record.status.is_terminal() => {
                record.status = DeliveryStatus::Sending;
                record.sent_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    /// Mark a delivery sent; returns None if it is unknown or already terminal
    pub fn record_success(&self, id: &str) -> Option<DeliveryRecord> {
        self.record_success_at(id, Utc::now())
    }

    pub fn record_success_at(&self, id: &str, now: DateTime<Utc>) -> Option<DeliveryRecord> {
        let record = {
            let mut record = self.records.get_mut(id)?;
            if record.status.is_terminal() {
                return None;
            }
            record.status = DeliveryStatus::Sent;
            record.sent_at.get_or_insert(now);
            record.delivered_at = Some(now);
            record.next_retry_at = None;
            record.clone()
        };

        let latency_ms = record.delivery_ms().unwrap_or(0);
        {
            let mut latencies = self.latencies.lock();
            latencies.push_back(latency_ms);
            while latencies.len() > self.config.latency_samples.max(1) {
                latencies.pop_front();
            }
        }

        self.events.publish(PipelineEvent::DeliverySuccess {
            delivery_id: record.id.clone(),
            channel_id: record.channel_id.clone(),
            latency_ms,
        });
        Some(record)
    }

    /// Count a failed attempt at the current time
    pub fn record_failure(&self, id: &str, error: &str) -> Option<DeliveryRecord> {
        self.record_failure_at(id, error, Utc::now())
    }

    /// Count a failed attempt; reschedules or marks the record failed
    pub fn record_failure_at(&self, id: &str, error: &str, now: DateTime<Utc>) -> Option<DeliveryRecord> {
        let record = {
            let mut record = self.records.get_mut(id)?;
            if record.status.is_terminal() {
                return None;
            }
            record.retry_count += 1;
            record.last_error = Some(error.to_string());

            if self.retry.enabled && record.retry_count <= self.retry.max_retries {
                record.status = DeliveryStatus::Retrying;
                record.next_retry_at = Some(now + backoff_delay(&self.retry, record.retry_count));
            } else {
                record.status = DeliveryStatus::Failed;
                record.next_retry_at = None;
            }
            record.clone()
        };

        match (record.status, record.next_retry_at) {
            (DeliveryStatus::Retrying, Some(next_retry_at)) => {
                tracing::debug!(
                    delivery_id = %record.id,
                    channel_id = %record.channel_id,
                    retry_count = record.retry_count,
                    next_retry_at = %next_retry_at,
                    "Delivery failed, retry scheduled"
                );
                self.events.publish(PipelineEvent::DeliveryRetry {
                    delivery_id: record.id.clone(),
                    alert_id: record.alert_id.clone(),
                    channel_id: record.channel_id.clone(),
                    retry_count: record.retry_count,
                    next_retry_at,
                });
            }
            _ => {
                tracing::warn!(
                    delivery_id = %record.id,
                    alert_id = %record.alert_id,
                    channel_id = %record.channel_id,
                    retry_count = record.retry_count,
                    error = %error,
                    "Delivery failed permanently"
                );
                self.events.publish(PipelineEvent::DeliveryFailure {
                    delivery_id: record.id.clone(),
                    alert_id: record.alert_id.clone(),
                    channel_id: record.channel_id.clone(),
                    retry_count: record.retry_count,
                    error: error.to_string(),
                });
            }
        }
        Some(record)
    }

    /// Retrying records whose backoff has elapsed, oldest first
    pub fn get_deliveries_for_retry(&self, now: DateTime<Utc>) -> Vec<DeliveryRecord> {
        let mut due: Vec<DeliveryRecord> = self
            .records
            .iter()
            .filter(|r| {
                r.status == DeliveryStatus::Retrying && r.next_retry_at.is_some_and(|at| at <= now)
            })
            .map(|r| r.clone())
            .collect();
        due.sort_by_key(|r| r.next_retry_at);
        due
    }

    /// Cancel a delivery that has not been sent
    pub fn cancel(&self, id: &str) -> bool {
        match self.records.get_mut(id) {
            Some(mut record) if record.status != DeliveryStatus::Sent => {
                record.status = DeliveryStatus::Cancelled;
                record.next_retry_at = None;
                true
            }
            _ => false,
        }
    }

    /// Records with a send in progress
    pub fn in_flight(&self) -> Vec<DeliveryRecord> {
        self.records
            .iter()
            .filter(|r| r.status == DeliveryStatus::Sending)
            .map(|r| r.clone())
            .collect()
    }

    /// Records still waiting on a retry
    pub fn retrying_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.status == DeliveryStatus::Retrying)
            .count()
    }

    /// Aggregate statistics over all records
    pub fn stats(&self) -> DeliveryStats {
        let mut stats = DeliveryStats::default();
        for record in self.records.iter() {
            stats.total += 1;
            match record.status {
                DeliveryStatus::Pending => stats.pending += 1,
                DeliveryStatus::Sending => stats.sending += 1,
                DeliveryStatus::Sent => stats.sent += 1,
                DeliveryStatus::Failed => stats.failed += 1,
                DeliveryStatus::Retrying => stats.retrying += 1,
                DeliveryStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats.success_rate = success_rate(stats.sent, stats.failed);

        let latencies = self.latencies.lock();
        if !latencies.is_empty() {
            stats.avg_latency_ms = latencies.iter().sum::<i64>() as f64 / latencies.len() as f64;
        }
        stats
    }

    /// Statistics for one channel
    pub fn channel_stats(&self, channel_id: &str) -> ChannelDeliveryStats {
        let mut stats = ChannelDeliveryStats {
            channel_id: channel_id.to_string(),
            ..Default::default()
        };
        let mut delivery_total = 0i64;

        for record in self.records.iter().filter(|r| r.channel_id == channel_id) {
            stats.total += 1;
            match record.status {
                DeliveryStatus::Sent => {
                    stats.sent += 1;
                    delivery_total += record.delivery_ms().unwrap_or(0);
                }
                DeliveryStatus::Failed => stats.failed += 1,
                DeliveryStatus::Retrying => stats.retrying += 1,
                _ => {}
            }
        }

        stats.success_rate = success_rate(stats.sent, stats.failed);
        if stats.sent > 0 {
            stats.avg_delivery_ms = delivery_total as f64 / stats.sent as f64;
        }
        stats
    }

    /// Purge terminal records idle for longer than `older_than`
    pub fn cleanup(&self, older_than: Duration) -> usize {
        self.cleanup_at(older_than, Utc::now())
    }

    /// Purge terminal records older than `older_than` at `now`
    pub fn cleanup_at(&self, older_than: Duration, now: DateTime<Utc>) -> usize {
        let cutoff = now - older_than;
        let before = self.records.len();
        self.records
            .retain(|_, r| !(r.status.is_terminal() && r.last_activity() < cutoff));
        before - self.records.len()
    }

    /// Purge using the configured retention
    pub fn cleanup_expired(&self) -> usize {
        self.cleanup(Duration::milliseconds(self.config.retention_ms as i64))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn success_rate(sent: usize, failed: usize) -> f64 {
    let finished = sent + failed;
    if finished == 0 {
        0.0
    } else {
        sent as f64 / finished as f64
    }
}
