//! Per-type alert batching
//!
//! Batchable alerts are buffered per type. A buffer is flushed when its
//! window timer fires, when it reaches `max_size`, or on demand. Timer and
//! size flushes are pushed to the sink channel; on-demand flushes are
//! returned to the caller.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::model::{Alert, AlertBatch, AlertPriority, AlertType};
use crate::config::{BatchConfig, UndersizedPolicy};
use crate::id::next_id;

/// How many names a summary lists before collapsing into a count
const SUMMARY_NAMES: usize = 5;

/// What a flushed buffer turned into
#[derive(Debug, Clone)]
pub enum BatchOutput {
    /// At least `min_size` alerts: deliver as one batch
    Batch(AlertBatch),
    /// Fewer than `min_size` alerts: deliver individually
    Undersized(Vec<Alert>),
    /// Fewer than `min_size` alerts, discarded by policy
    Dropped { alert_type: AlertType, count: usize },
}

/// Whether `add` kept the alert
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchDecision {
    pub batched: bool,
    pub reason: Option<String>,
}

impl BatchDecision {
    fn pass(reason: &str) -> Self {
        Self {
            batched: false,
            reason: Some(reason.to_string()),
        }
    }
}

struct Buffer {
    alerts: Vec<Alert>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

struct BatcherInner {
    config: BatchConfig,
    types: HashSet<AlertType>,
    buffers: Mutex<HashMap<AlertType, Buffer>>,
    sink: mpsc::UnboundedSender<BatchOutput>,
    generation: AtomicU64,
    stopped: AtomicBool,
}

/// Time-windowed batcher; cheap to clone
#[derive(Clone)]
pub struct Batcher {
    inner: Arc<BatcherInner>,
}

impl Batcher {
    pub fn new(config: BatchConfig, sink: mpsc::UnboundedSender<BatchOutput>) -> Self {
        let types = config.types.iter().copied().collect();
        Self {
            inner: Arc::new(BatcherInner {
                config,
                types,
                buffers: Mutex::new(HashMap::new()),
                sink,
                generation: AtomicU64::new(0),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Whether an alert would be buffered rather than passed through
    pub fn is_batchable(&self, alert: &Alert) -> bool {
        self.inner.config.enabled
            && !self.inner.stopped.load(Ordering::SeqCst)
            && alert.priority != AlertPriority::Critical
            && self.inner.types.contains(&alert.alert_type)
    }

    /// Buffer the alert if it is batchable
    pub fn add(&self, alert: &Alert) -> BatchDecision {
        if !self.inner.config.enabled {
            return BatchDecision::pass("batching disabled");
        }
        if self.inner.stopped.load(Ordering::SeqCst) {
            return BatchDecision::pass("batcher stopped");
        }
        if alert.priority == AlertPriority::Critical {
            return BatchDecision::pass("critical alerts bypass batching");
        }
        if !self.inner.types.contains(&alert.alert_type) {
            return BatchDecision::pass("type not batchable");
        }

        let full = {
            let mut buffers = self.inner.buffers.lock();
            let buffer = buffers
                .entry(alert.alert_type)
                .or_insert_with(|| self.new_buffer(alert.alert_type));
            buffer.alerts.push(alert.clone());

            if buffer.alerts.len() >= self.inner.config.max_size {
                buffers.remove(&alert.alert_type)
            } else {
                None
            }
        };

        if let Some(buffer) = full {
            tracing::debug!(alert_type = %alert.alert_type, "Batch buffer full, flushing");
            self.inner.emit(self.inner.finish(alert.alert_type, buffer));
        }

        BatchDecision {
            batched: true,
            reason: None,
        }
    }

    fn new_buffer(&self, alert_type: AlertType) -> Buffer {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let timer = tokio::runtime::Handle::try_current().ok().map(|handle| {
            let weak: Weak<BatcherInner> = Arc::downgrade(&self.inner);
            let window = self.inner.config.window();
            handle.spawn(async move {
                tokio::time::sleep(window).await;
                if let Some(inner) = weak.upgrade() {
                    inner.flush_generation(alert_type, generation);
                }
            })
        });

        Buffer {
            alerts: Vec::new(),
            generation,
            timer,
        }
    }

    /// Flush one type now; `None` if nothing was buffered
    pub fn flush(&self, alert_type: AlertType) -> Option<BatchOutput> {
        let buffer = self.inner.buffers.lock().remove(&alert_type)?;
        Some(self.inner.finish(alert_type, buffer))
    }

    /// Flush every buffer now
    pub fn flush_all(&self) -> Vec<BatchOutput> {
        let drained: Vec<(AlertType, Buffer)> = self.inner.buffers.lock().drain().collect();
        drained
            .into_iter()
            .map(|(alert_type, buffer)| self.inner.finish(alert_type, buffer))
            .collect()
    }

    /// Refuse new alerts and flush everything
    pub fn stop(&self) -> Vec<BatchOutput> {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.flush_all()
    }

    /// Alerts currently held in buffers
    pub fn pending_count(&self) -> usize {
        self.inner.buffers.lock().values().map(|b| b.alerts.len()).sum()
    }

    /// Types with alerts currently buffered
    pub fn buffered_types(&self) -> Vec<AlertType> {
        self.inner.buffers.lock().keys().copied().collect()
    }
}

impl BatcherInner {
    /// Timer flush; ignored if the buffer was already flushed and replaced
    fn flush_generation(&self, alert_type: AlertType, generation: u64) {
        let buffer = {
            let mut buffers = self.buffers.lock();
            match buffers.get(&alert_type) {
                Some(b) if b.generation == generation => buffers.remove(&alert_type),
                _ => None,
            }
        };

        if let Some(mut buffer) = buffer {
            // running inside the timer task itself
            buffer.timer = None;
            tracing::debug!(alert_type = %alert_type, "Batch window elapsed, flushing");
            self.emit(self.finish(alert_type, buffer));
        }
    }

    fn finish(&self, alert_type: AlertType, mut buffer: Buffer) -> BatchOutput {
        if let Some(timer) = buffer.timer.take() {
            timer.abort();
        }
        let alerts = buffer.alerts;

        if alerts.len() >= self.config.min_size.max(1) {
            return BatchOutput::Batch(build_batch(alert_type, alerts));
        }

        match self.config.undersized {
            UndersizedPolicy::Deliver => BatchOutput::Undersized(alerts),
            UndersizedPolicy::Drop => {
                tracing::info!(
                    alert_type = %alert_type,
                    count = alerts.len(),
                    "Dropping undersized batch"
                );
                BatchOutput::Dropped {
                    alert_type,
                    count: alerts.len(),
                }
            }
        }
    }

    fn emit(&self, output: BatchOutput) {
        if self.sink.send(output).is_err() {
            tracing::warn!("Batch sink closed, flushed batch lost");
        }
    }
}

/// Build a batch with max member priority and a type-specific summary
pub fn build_batch(alert_type: AlertType, alerts: Vec<Alert>) -> AlertBatch {
    let priority = alerts
        .iter()
        .map(|a| a.priority)
        .max()
        .unwrap_or_default();

    AlertBatch {
        id: next_id("batch"),
        alert_type,
        priority,
        summary: summarize(alert_type, &alerts),
        alerts,
        timestamp: Utc::now(),
    }
}

fn summarize(alert_type: AlertType, alerts: &[Alert]) -> String {
    let n = alerts.len();
    match alert_type {
        AlertType::TokenDiscovery => format!("{} new tokens discovered: {}", n, names(alerts)),
        AlertType::WhaleActivity => {
            format!("{} whale movements across {} wallets", n, distinct_wallets(alerts))
        }
        AlertType::SmartMoney => {
            format!("{} smart money moves across {} wallets", n, distinct_wallets(alerts))
        }
        AlertType::VolumeSpike => format!("{} volume spikes: {}", n, names(alerts)),
        AlertType::PriceAlert => format!("{} price alerts: {}", n, names(alerts)),
        AlertType::LiquidityChange => format!("{} liquidity changes: {}", n, names(alerts)),
        other => format!("{} {} alerts", n, other),
    }
}

fn names(alerts: &[Alert]) -> String {
    let labels: Vec<String> = alerts
        .iter()
        .map(|a| {
            a.data_str("symbol")
                .or_else(|| a.data_str("name"))
                .or_else(|| a.data_str("mint").map(|m| m.chars().take(8).collect()))
                .unwrap_or_else(|| a.title.clone())
        })
        .collect();

    let mut text = labels
        .iter()
        .take(SUMMARY_NAMES)
        .cloned()
        .collect::<Vec<_>>()
        .join(", ");
    if labels.len() > SUMMARY_NAMES {
        text.push_str(&format!(" and {} more", labels.len() - SUMMARY_NAMES));
    }
    text
}

fn distinct_wallets(alerts: &[Alert]) -> usize {
    alerts
        .iter()
        .filter_map(|a| a.data_str("wallet"))
        .collect::<HashSet<_>>()
        .len()
}
