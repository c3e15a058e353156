//! Alert pipeline orchestration
//!
//! `send_alert` runs an alert through deduplication, batching, routing and
//! channel fan-out. Flushed batches arrive on an internal channel and are
//! delivered by the task spawned in [`AlertManager::start`], which also runs
//! the dedup sweep and the retry worker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use super::batcher::{BatchOutput, Batcher};
use super::dedup::{DedupStats, Deduplicator};
use super::events::{EventBus, PipelineEvent};
use super::model::{Alert, AlertBatch, NewAlert};
use super::rate_limit::ChannelLimiter;
use super::router::{ChannelConfig, RouteDecision, Router};
use crate::channels::{Channel, ChannelError, DeliveryResult};
use crate::config::PipelineConfig;
use crate::delivery::{DeliveryManager, DeliveryRecord, DeliveryStats};

/// How long `stop` waits for background tasks to finish their current work
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// What a delivery attempt carries
#[derive(Debug, Clone)]
enum Payload {
    Alert(Alert),
    Batch(AlertBatch),
}

impl Payload {
    fn id(&self) -> &str {
        match self {
            Payload::Alert(a) => &a.id,
            Payload::Batch(b) => &b.id,
        }
    }

    async fn send_via(&self, channel: &dyn Channel) -> Result<DeliveryResult, ChannelError> {
        match self {
            Payload::Alert(a) => channel.send(a).await,
            Payload::Batch(b) => channel.send_batch(b).await,
        }
    }
}

/// Result of `send_alert`
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SendOutcome {
    Deduplicated {
        alert_id: String,
        original_id: Option<String>,
    },
    Batched {
        alert_id: String,
    },
    Delivered(DeliveryReport),
}

/// Per-channel results of delivering one alert or batch
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeliveryReport {
    pub alert_id: String,
    pub routed: bool,
    pub reason: Option<String>,
    pub sent: Vec<String>,
    /// (channel id, error)
    pub failed: Vec<(String, String)>,
    pub rate_limited: Vec<String>,
    /// Channels whose delivery was cancelled while the send was in flight
    pub cancelled: Vec<String>,
}

/// How one channel attempt ended
enum Attempt {
    Sent,
    Failed(String),
    Cancelled,
}

/// Pipeline counters
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub total: u64,
    pub deduplicated: u64,
    pub batched: u64,
    pub sent: u64,
    pub failed: u64,
    /// Buffered alerts plus deliveries waiting on a retry
    pub pending: u64,
    pub channels: usize,
    pub dedup: DedupStats,
    pub deliveries: DeliveryStats,
}

#[derive(Default)]
struct Counters {
    total: AtomicU64,
    deduplicated: AtomicU64,
    batched: AtomicU64,
    sent: AtomicU64,
    failed: AtomicU64,
}

/// Alert pipeline front door
pub struct AlertManager {
    config: PipelineConfig,
    dedup: Arc<Deduplicator>,
    batcher: Batcher,
    batch_rx: Mutex<Option<mpsc::UnboundedReceiver<BatchOutput>>>,
    router: Router,
    channels: RwLock<HashMap<String, Arc<dyn Channel>>>,
    deliveries: DeliveryManager,
    /// Payloads of deliveries that may still be retried
    payloads: DashMap<String, Arc<Payload>>,
    limiter: ChannelLimiter,
    events: EventBus,
    counters: Counters,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl AlertManager {
    pub fn new(config: PipelineConfig) -> Self {
        let events = EventBus::new(config.events.capacity);
        let (batch_tx, batch_rx) = mpsc::unbounded_channel();

        Self {
            dedup: Arc::new(Deduplicator::new(config.dedup.clone())),
            batcher: Batcher::new(config.batch.clone(), batch_tx),
            batch_rx: Mutex::new(Some(batch_rx)),
            router: Router::new(),
            channels: RwLock::new(HashMap::new()),
            deliveries: DeliveryManager::new(
                config.retry.clone(),
                config.delivery.clone(),
                events.clone(),
            ),
            payloads: DashMap::new(),
            limiter: ChannelLimiter::new(),
            events,
            counters: Counters::default(),
            tasks: Mutex::new(Vec::new()),
            shutdown: Mutex::new(None),
            config,
        }
    }

    /// Register a channel; without a config it gets default routing only
    pub fn register_channel(&self, channel: Arc<dyn Channel>, config: Option<ChannelConfig>) {
        let id = channel.id().to_string();
        let mut config =
            config.unwrap_or_else(|| ChannelConfig::new(id.clone(), channel.channel_type()));
        config.id = id.clone();

        tracing::info!(channel_id = %id, channel_type = %channel.channel_type(), "Channel registered");
        self.router.register(config);
        self.channels.write().insert(id, channel);
    }

    /// Remove a channel; its pending retries are cancelled by the retry worker
    pub fn unregister_channel(&self, id: &str) -> bool {
        let removed = self.channels.write().remove(id).is_some();
        self.router.unregister(id);
        self.limiter.reset(id);
        if removed {
            tracing::info!(channel_id = %id, "Channel unregistered");
        }
        removed
    }

    /// Enable or disable routing to a channel
    pub fn set_channel_enabled(&self, id: &str, enabled: bool) -> bool {
        self.router.set_enabled(id, enabled)
    }

    /// Routing configs of all registered channels
    pub fn channel_configs(&self) -> Vec<ChannelConfig> {
        self.router.channels()
    }

    /// Receive pipeline events
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// Delivery records and their stats
    pub fn deliveries(&self) -> &DeliveryManager {
        &self.deliveries
    }

    /// Run an alert through the pipeline
    pub async fn send_alert(&self, alert: NewAlert) -> SendOutcome {
        let alert = alert.into_alert();
        self.counters.total.fetch_add(1, Ordering::Relaxed);

        let dedup = self.dedup.check(&alert);
        if dedup.is_duplicate {
            self.counters.deduplicated.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                alert_id = %alert.id,
                original_id = ?dedup.original_id,
                "Duplicate alert suppressed"
            );
            self.events.publish(PipelineEvent::Deduplicated {
                alert_id: alert.id.clone(),
                original_id: dedup.original_id.clone(),
                reason: dedup.reason.unwrap_or_default(),
            });
            return SendOutcome::Deduplicated {
                alert_id: alert.id,
                original_id: dedup.original_id,
            };
        }

        if self.batcher.add(&alert).batched {
            self.counters.batched.fetch_add(1, Ordering::Relaxed);
            self.events.publish(PipelineEvent::Batched {
                alert_id: alert.id.clone(),
                alert_type: alert.alert_type,
            });
            return SendOutcome::Batched { alert_id: alert.id };
        }

        SendOutcome::Delivered(self.deliver_alert(&alert).await)
    }

    /// Route and deliver one alert, skipping dedup and batching
    pub async fn deliver_alert(&self, alert: &Alert) -> DeliveryReport {
        let decision = self.router.route(alert);
        self.dispatch(Arc::new(Payload::Alert(alert.clone())), decision)
            .await
    }

    /// Route and deliver a flushed batch
    pub async fn deliver_batch(&self, batch: &AlertBatch) -> DeliveryReport {
        let decision = self.router.route_batch(batch);
        self.dispatch(Arc::new(Payload::Batch(batch.clone())), decision)
            .await
    }

    async fn dispatch(&self, payload: Arc<Payload>, decision: RouteDecision) -> DeliveryReport {
        let mut report = DeliveryReport {
            alert_id: payload.id().to_string(),
            routed: decision.should_route,
            reason: decision.reason.clone(),
            ..Default::default()
        };

        let targets: Vec<Arc<dyn Channel>> = {
            let channels = self.channels.read();
            decision
                .channel_ids
                .iter()
                .filter_map(|id| channels.get(id).cloned())
                .collect()
        };

        if !decision.should_route || targets.is_empty() {
            report.routed = false;
            let reason = decision
                .reason
                .unwrap_or_else(|| "no matching channels".to_string());
            tracing::warn!(alert_id = %report.alert_id, reason = %reason, "Alert not routed");
            self.events.publish(PipelineEvent::NotRouted {
                alert_id: report.alert_id.clone(),
                reason: reason.clone(),
            });
            report.reason = Some(reason);
            return report;
        }

        let mut attempts = Vec::with_capacity(targets.len());
        for channel in targets {
            let limited = self
                .router
                .get(channel.id())
                .and_then(|c| c.rate_limit)
                .is_some_and(|limit| !self.limiter.try_acquire(channel.id(), &limit));
            if limited {
                tracing::debug!(alert_id = %report.alert_id, channel_id = %channel.id(), "Channel rate limited");
                self.events.publish(PipelineEvent::RateLimited {
                    alert_id: report.alert_id.clone(),
                    channel_id: channel.id().to_string(),
                });
                report.rate_limited.push(channel.id().to_string());
                continue;
            }

            let record = self.deliveries.create_delivery(payload.id(), channel.id());
            self.payloads.insert(record.id.clone(), Arc::clone(&payload));
            attempts.push(self.attempt(channel, Arc::clone(&payload), record));
        }

        for (channel_id, attempt) in join_all(attempts).await {
            match attempt {
                Attempt::Sent => report.sent.push(channel_id),
                Attempt::Failed(e) => report.failed.push((channel_id, e)),
                Attempt::Cancelled => report.cancelled.push(channel_id),
            }
        }
        report
    }

    /// One send on one channel; counters and events follow the record, so a
    /// delivery cancelled mid-send is neither sent nor failed
    async fn attempt(
        &self,
        channel: Arc<dyn Channel>,
        payload: Arc<Payload>,
        record: DeliveryRecord,
    ) -> (String, Attempt) {
        let channel_id = channel.id().to_string();
        self.deliveries.mark_sending(&record.id);

        let error = match payload.send_via(channel.as_ref()).await {
            Ok(result) if result.success => None,
            Ok(result) => Some(
                result
                    .error
                    .unwrap_or_else(|| "channel reported failure".to_string()),
            ),
            Err(e) => Some(e.to_string()),
        };

        let attempt = match error {
            None => match self.deliveries.record_success(&record.id) {
                Some(_) => {
                    self.payloads.remove(&record.id);
                    self.counters.sent.fetch_add(1, Ordering::Relaxed);
                    self.events.publish(PipelineEvent::Sent {
                        alert_id: record.alert_id.clone(),
                        channel_id: channel_id.clone(),
                    });
                    Attempt::Sent
                }
                None => Attempt::Cancelled,
            },
            Some(e) => {
                tracing::warn!(
                    alert_id = %record.alert_id,
                    channel_id = %channel_id,
                    error = %e,
                    "Channel send failed"
                );
                match self.deliveries.record_failure(&record.id, &e) {
                    Some(updated) => {
                        if updated.status.is_terminal() {
                            self.payloads.remove(&record.id);
                            self.counters.failed.fetch_add(1, Ordering::Relaxed);
                        }
                        self.events.publish(PipelineEvent::Failed {
                            alert_id: record.alert_id.clone(),
                            channel_id: channel_id.clone(),
                            error: e.clone(),
                        });
                        Attempt::Failed(e)
                    }
                    None => Attempt::Cancelled,
                }
            }
        };

        if matches!(attempt, Attempt::Cancelled) {
            tracing::debug!(
                delivery_id = %record.id,
                channel_id = %channel_id,
                "Delivery cancelled during send"
            );
            self.payloads.remove(&record.id);
        }
        (channel_id, attempt)
    }

    /// Re-send every delivery whose backoff has elapsed
    pub async fn process_retries(&self) -> usize {
        let due = self.deliveries.get_deliveries_for_retry(Utc::now());
        let mut attempts = Vec::with_capacity(due.len());

        for record in due {
            let channel = self.channels.read().get(&record.channel_id).cloned();
            let payload = self.payloads.get(&record.id).map(|p| Arc::clone(&p));
            match (channel, payload) {
                (Some(channel), Some(payload)) => {
                    attempts.push(self.attempt(channel, payload, record));
                }
                _ => {
                    tracing::debug!(
                        delivery_id = %record.id,
                        channel_id = %record.channel_id,
                        "Retry target gone, cancelling delivery"
                    );
                    self.deliveries.cancel(&record.id);
                    self.payloads.remove(&record.id);
                }
            }
        }

        let count = attempts.len();
        join_all(attempts).await;
        count
    }

    async fn handle_batch_output(&self, output: BatchOutput) -> usize {
        match output {
            BatchOutput::Batch(batch) => {
                tracing::info!(
                    batch_id = %batch.id,
                    alert_type = %batch.alert_type,
                    count = batch.len(),
                    "Delivering batch"
                );
                self.events.publish(PipelineEvent::BatchFlushed {
                    batch_id: batch.id.clone(),
                    alert_type: batch.alert_type,
                    count: batch.len(),
                });
                self.deliver_batch(&batch).await;
                batch.len()
            }
            BatchOutput::Undersized(alerts) => {
                let count = alerts.len();
                join_all(alerts.iter().map(|a| self.deliver_alert(a))).await;
                count
            }
            BatchOutput::Dropped { alert_type, count } => {
                self.events
                    .publish(PipelineEvent::BatchDropped { alert_type, count });
                count
            }
        }
    }

    /// Flush all batch buffers and deliver the results; returns alerts flushed
    pub async fn flush_batches(&self) -> usize {
        let mut outputs = self.drain_sink();
        outputs.extend(self.batcher.flush_all());

        let mut flushed = 0;
        for output in outputs {
            flushed += self.handle_batch_output(output).await;
        }
        flushed
    }

    /// Outputs queued by timers while no consumer task is running
    fn drain_sink(&self) -> Vec<BatchOutput> {
        let mut outputs = Vec::new();
        if let Some(rx) = self.batch_rx.lock().as_mut() {
            while let Ok(output) = rx.try_recv() {
                outputs.push(output);
            }
        }
        outputs
    }

    /// Spawn the batch consumer, the dedup sweep and the retry worker
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown.lock() = Some(shutdown_tx);

        if let Some(mut rx) = self.batch_rx.lock().take() {
            let manager = Arc::clone(self);
            let mut shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        output = rx.recv() => match output {
                            Some(output) => {
                                manager.handle_batch_output(output).await;
                            }
                            None => break,
                        },
                        _ = shutdown.changed() => break,
                    }
                }
                // hand the receiver back so `stop` can drain what is left
                *manager.batch_rx.lock() = Some(rx);
            }));
        }

        self.dedup.start();

        let manager = Arc::clone(self);
        let mut shutdown = shutdown_rx;
        let interval = Duration::from_millis(self.config.retry.check_interval_ms.max(1));
        let retry_enabled = self.config.retry.enabled;
        tasks.push(tokio::spawn(async move {
            tracing::info!("Delivery worker started with interval {:?}", interval);
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => {
                        tracing::info!("Delivery worker shutting down");
                        break;
                    }
                }
                if retry_enabled {
                    let retried = manager.process_retries().await;
                    if retried > 0 {
                        tracing::debug!("Retried {} deliveries", retried);
                    }
                }
                let purged = manager.deliveries.cleanup_expired();
                if purged > 0 {
                    tracing::debug!("Purged {} delivery records", purged);
                }
            }
        }));

        tracing::info!(channels = self.channels.read().len(), "Alert manager started");
    }

    /// Let background tasks finish in-flight sends, then flush and deliver
    /// every remaining batch
    pub async fn stop(&self) {
        if let Some(shutdown) = self.shutdown.lock().take() {
            let _ = shutdown.send(true);
        }
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for mut task in tasks {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                tracing::warn!("Background task still busy after {:?}, aborting", SHUTDOWN_GRACE);
                task.abort();
            }
        }
        self.dedup.stop();

        let remaining = self.batcher.stop();
        let mut outputs = self.drain_sink();
        outputs.extend(remaining);
        for output in outputs {
            self.handle_batch_output(output).await;
        }
        tracing::info!("Alert manager stopped");
    }

    /// Get pipeline statistics
    pub fn get_stats(&self) -> ManagerStats {
        let pending = self.batcher.pending_count() + self.deliveries.retrying_count();
        ManagerStats {
            total: self.counters.total.load(Ordering::Relaxed),
            deduplicated: self.counters.deduplicated.load(Ordering::Relaxed),
            batched: self.counters.batched.load(Ordering::Relaxed),
            sent: self.counters.sent.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            pending: pending as u64,
            channels: self.channels.read().len(),
            dedup: self.dedup.stats(),
            deliveries: self.deliveries.stats(),
        }
    }

    /// Health of every registered channel, checked concurrently
    pub async fn health_check(&self) -> HashMap<String, bool> {
        let channels: Vec<Arc<dyn Channel>> = self.channels.read().values().cloned().collect();
        let checks = channels.iter().map(|c| async move {
            (c.id().to_string(), c.health_check().await)
        });
        join_all(checks).await.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::model::{AlertPriority, AlertType};
    use crate::alerts::rate_limit::ChannelRateLimit;
    use crate::config::{BatchConfig, RetryConfig};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct MockChannel {
        id: String,
        fail: bool,
        delay: Duration,
        sends: AtomicUsize,
        batches: AtomicUsize,
        completed: AtomicUsize,
    }

    impl MockChannel {
        fn new(id: &str, fail: bool) -> Arc<Self> {
            Self::build(id, fail, Duration::ZERO)
        }

        fn slow(id: &str, delay_ms: u64) -> Arc<Self> {
            Self::build(id, false, Duration::from_millis(delay_ms))
        }

        fn build(id: &str, fail: bool, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                fail,
                delay,
                sends: AtomicUsize::new(0),
                batches: AtomicUsize::new(0),
                completed: AtomicUsize::new(0),
            })
        }

        async fn finish(&self) {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Channel for MockChannel {
        fn id(&self) -> &str {
            &self.id
        }

        fn channel_type(&self) -> &str {
            "mock"
        }

        async fn send(&self, _alert: &Alert) -> Result<DeliveryResult, ChannelError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            self.finish().await;
            if self.fail {
                Err(ChannelError::Unavailable("mock down".into()))
            } else {
                Ok(DeliveryResult::ok())
            }
        }

        async fn send_batch(&self, _batch: &AlertBatch) -> Result<DeliveryResult, ChannelError> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            self.finish().await;
            Ok(DeliveryResult::ok())
        }

        async fn health_check(&self) -> bool {
            !self.fail
        }
    }

    fn config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.batch.enabled = false;
        config
    }

    fn alert(title: &str, priority: AlertPriority) -> NewAlert {
        NewAlert::new(AlertType::PriceAlert, title, "moved").with_priority(priority)
    }

    #[tokio::test]
    async fn test_duplicate_suppressed() {
        let manager = AlertManager::new(config());
        let channel = MockChannel::new("a", false);
        manager.register_channel(channel.clone(), None);

        let first = manager.send_alert(alert("SOL up", AlertPriority::Normal)).await;
        assert!(matches!(first, SendOutcome::Delivered(ref r) if r.sent == vec!["a"]));

        let second = manager.send_alert(alert("SOL up", AlertPriority::Normal)).await;
        assert!(matches!(second, SendOutcome::Deduplicated { original_id: Some(_), .. }));

        let stats = manager.get_stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.deduplicated, 1);
        assert_eq!(stats.sent, 1);
        assert_eq!(channel.sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_does_not_block_other_channels() {
        let manager = AlertManager::new(config());
        let good = MockChannel::new("good", false);
        let bad = MockChannel::new("bad", true);
        manager.register_channel(good.clone(), None);
        manager.register_channel(bad.clone(), None);
        let mut events = manager.subscribe();

        let outcome = manager
            .send_alert(alert("Rug", AlertPriority::Critical))
            .await;
        let SendOutcome::Delivered(report) = outcome else {
            panic!("expected delivery");
        };
        assert_eq!(report.sent, vec!["good"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "bad");

        // first failure is retried, so not yet counted as failed
        let stats = manager.get_stats();
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.pending, 1);

        let mut names = Vec::new();
        while let Ok(event) = events.try_recv() {
            names.push(event.name());
        }
        assert!(names.contains(&"sent"));
        assert!(names.contains(&"failed"));
        assert!(names.contains(&"delivery_retry"));
    }

    #[tokio::test]
    async fn test_retry_until_exhausted() {
        let mut config = config();
        config.retry = RetryConfig {
            max_retries: 1,
            initial_delay_ms: 0,
            ..Default::default()
        };
        let manager = AlertManager::new(config);
        let bad = MockChannel::new("bad", true);
        manager.register_channel(bad.clone(), None);

        manager.send_alert(alert("x", AlertPriority::Normal)).await;
        assert_eq!(manager.process_retries().await, 1);
        assert_eq!(manager.process_retries().await, 0);

        assert_eq!(bad.sends.load(Ordering::SeqCst), 2);
        let stats = manager.get_stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.deliveries.failed, 1);
    }

    #[tokio::test]
    async fn test_batched_alerts_delivered_on_flush() {
        let mut config = PipelineConfig::default();
        config.batch = BatchConfig {
            min_size: 2,
            ..Default::default()
        };
        let manager = AlertManager::new(config);
        let channel = MockChannel::new("a", false);
        manager.register_channel(channel.clone(), None);

        for i in 0..3 {
            let outcome = manager
                .send_alert(NewAlert::new(
                    AlertType::VolumeSpike,
                    format!("Spike {}", i),
                    "volume",
                ).with_data(serde_json::json!({"subject": format!("T{}", i)})))
                .await;
            assert!(matches!(outcome, SendOutcome::Batched { .. }));
        }
        assert_eq!(manager.get_stats().pending, 3);

        assert_eq!(manager.flush_batches().await, 3);
        assert_eq!(channel.batches.load(Ordering::SeqCst), 1);
        assert_eq!(channel.sends.load(Ordering::SeqCst), 0);
        assert_eq!(manager.get_stats().pending, 0);
    }

    #[tokio::test]
    async fn test_undersized_batch_delivered_individually_on_stop() {
        let manager = AlertManager::new(PipelineConfig::default());
        let channel = MockChannel::new("a", false);
        manager.register_channel(channel.clone(), None);

        manager
            .send_alert(NewAlert::new(AlertType::TokenDiscovery, "New token", "found"))
            .await;
        manager.stop().await;

        assert_eq!(channel.sends.load(Ordering::SeqCst), 1);
        assert_eq!(channel.batches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_not_routed_without_channels() {
        let manager = AlertManager::new(config());
        let outcome = manager.send_alert(alert("x", AlertPriority::High)).await;
        let SendOutcome::Delivered(report) = outcome else {
            panic!("expected delivery attempt");
        };
        assert!(!report.routed);
        assert!(report.sent.is_empty());
    }

    #[tokio::test]
    async fn test_rate_limited_channel() {
        let manager = AlertManager::new(config());
        let channel = MockChannel::new("tg", false);
        let limit = ChannelRateLimit {
            max_per_minute: Some(1),
            max_per_hour: None,
        };
        manager.register_channel(
            channel.clone(),
            Some(ChannelConfig::new("tg", "mock").with_rate_limit(limit)),
        );

        manager.send_alert(alert("one", AlertPriority::Normal)).await;
        let outcome = manager.send_alert(alert("two", AlertPriority::Normal)).await;
        assert!(matches!(outcome, SendOutcome::Delivered(ref r) if r.rate_limited == vec!["tg"]));
        assert_eq!(channel.sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unregister_cancels_pending_retries() {
        let mut config = config();
        config.retry.initial_delay_ms = 0;
        let manager = AlertManager::new(config);
        manager.register_channel(MockChannel::new("bad", true), None);

        let outcome = manager.send_alert(alert("x", AlertPriority::Normal)).await;
        assert!(matches!(outcome, SendOutcome::Delivered(_)));
        assert!(manager.unregister_channel("bad"));

        assert_eq!(manager.process_retries().await, 0);
        let stats = manager.deliveries().stats();
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.retrying, 0);
        assert!(manager
            .deliveries()
            .get_deliveries_for_retry(Utc::now())
            .is_empty());
    }

    #[tokio::test]
    async fn test_health_check_all_channels() {
        let manager = AlertManager::new(config());
        manager.register_channel(MockChannel::new("up", false), None);
        manager.register_channel(MockChannel::new("down", true), None);

        let health = manager.health_check().await;
        assert_eq!(health.get("up"), Some(&true));
        assert_eq!(health.get("down"), Some(&false));
    }

    #[tokio::test]
    async fn test_start_delivers_timer_flushes() {
        let mut config = PipelineConfig::default();
        config.batch.window_ms = 20;
        config.batch.min_size = 1;
        let manager = Arc::new(AlertManager::new(config));
        let channel = MockChannel::new("a", false);
        manager.register_channel(channel.clone(), None);
        manager.start();

        manager
            .send_alert(NewAlert::new(AlertType::WhaleActivity, "Whale", "bought"))
            .await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(channel.batches.load(Ordering::SeqCst), 1);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_batches() {
        let mut config = PipelineConfig::default();
        config.batch.window_ms = 10;
        config.batch.min_size = 1;
        let manager = Arc::new(AlertManager::new(config));
        let channel = MockChannel::slow("slow", 300);
        manager.register_channel(channel.clone(), None);
        manager.start();

        manager
            .send_alert(NewAlert::new(AlertType::WhaleActivity, "Whale", "bought"))
            .await;
        manager
            .send_alert(
                NewAlert::new(AlertType::VolumeSpike, "Spike", "volume")
                    .with_data(serde_json::json!({"subject": "T1"})),
            )
            .await;
        // both timers fire; the consumer is mid-send on the first batch
        tokio::time::sleep(Duration::from_millis(60)).await;
        manager.stop().await;

        assert_eq!(channel.completed.load(Ordering::SeqCst), 2);
        let stats = manager.get_stats();
        assert_eq!(stats.sent, 2);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.deliveries.sending, 0);
        assert_eq!(stats.deliveries.sent, 2);
    }

    #[tokio::test]
    async fn test_cancel_during_send_is_not_counted() {
        let manager = Arc::new(AlertManager::new(config()));
        let channel = MockChannel::slow("slow", 100);
        manager.register_channel(channel.clone(), None);
        let mut events = manager.subscribe();

        let sender = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.send_alert(alert("x", AlertPriority::Normal)).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        let in_flight = manager.deliveries().in_flight();
        assert_eq!(in_flight.len(), 1);
        assert!(manager.deliveries().cancel(&in_flight[0].id));

        let outcome = sender.await.unwrap();
        let SendOutcome::Delivered(report) = outcome else {
            panic!("expected delivery attempt");
        };
        assert!(report.sent.is_empty());
        assert!(report.failed.is_empty());
        assert_eq!(report.cancelled, vec!["slow"]);

        let stats = manager.get_stats();
        assert_eq!(stats.sent, 0);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.deliveries.sent, 0);
        assert_eq!(stats.deliveries.cancelled, 1);
        while let Ok(event) = events.try_recv() {
            assert_ne!(event.name(), "sent");
        }
    }
}
