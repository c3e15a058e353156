//! Content-hash deduplication with a sliding time window
//!
//! Entries live in a moka cache whose TTL equals the window; the age check
//! on lookup is authoritative, the cache TTL and the background sweep only
//! bound memory.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::ops::compute::Op;
use moka::sync::Cache;
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use tokio::task::JoinHandle;

use super::model::{Alert, AlertType};
use crate::config::{DedupAlgorithm, DedupConfig};

/// Upper bound on remembered alerts
const MAX_ENTRIES: u64 = 100_000;

/// Message prefix length used by the fallback key
const FALLBACK_MESSAGE_CHARS: usize = 100;

#[derive(Debug, Clone)]
struct DedupEntry {
    alert_id: String,
    first_seen: DateTime<Utc>,
}

/// Outcome of a duplicate check
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DedupResult {
    pub is_duplicate: bool,
    pub original_id: Option<String>,
    pub reason: Option<String>,
}

impl DedupResult {
    fn unique() -> Self {
        Self {
            is_duplicate: false,
            original_id: None,
            reason: None,
        }
    }
}

/// Deduplication statistics
#[derive(Debug, Clone, Serialize)]
pub struct DedupStats {
    pub checks: u64,
    pub duplicates: u64,
    pub entries: u64,
    pub window_ms: u64,
}

/// Sliding-window duplicate detector
pub struct Deduplicator {
    config: DedupConfig,
    cache: Cache<u64, DedupEntry>,
    checks: AtomicU64,
    duplicates: AtomicU64,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Deduplicator {
    pub fn new(config: DedupConfig) -> Self {
        let mut builder = Cache::builder().max_capacity(MAX_ENTRIES);
        if config.window_ms > 0 {
            builder = builder.time_to_live(config.window());
        }
        Self {
            config,
            cache: builder.build(),
            checks: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            sweeper: Mutex::new(None),
        }
    }

    /// Check an alert at the current time
    pub fn check(&self, alert: &Alert) -> DedupResult {
        self.check_at(alert, Utc::now())
    }

    /// Check an alert at `now`; a miss records the alert as first sighting
    pub fn check_at(&self, alert: &Alert, now: DateTime<Utc>) -> DedupResult {
        if !self.config.enabled {
            return DedupResult::unique();
        }
        self.checks.fetch_add(1, Ordering::Relaxed);

        let hash = match content_hash(alert, self.config.algorithm) {
            Some(h) => h,
            None => {
                tracing::warn!(alert_id = %alert.id, "Failed to hash alert, treating as unique");
                return DedupResult::unique();
            }
        };

        // lookup and first-sighting insert are atomic per key
        let window = self.window();
        let mut result = DedupResult::unique();
        self.cache.entry(hash).and_compute_with(|existing| {
            if let Some(entry) = existing.map(|e| e.into_value()) {
                let age = now - entry.first_seen;
                if age < window && age >= chrono::Duration::zero() {
                    result = DedupResult {
                        is_duplicate: true,
                        reason: Some(format!(
                            "duplicate of {} sent {} ago",
                            entry.alert_id,
                            describe_age(age)
                        )),
                        original_id: Some(entry.alert_id),
                    };
                    return Op::Nop;
                }
            }
            Op::Put(DedupEntry {
                alert_id: alert.id.clone(),
                first_seen: now,
            })
        });

        if result.is_duplicate {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Remove entries older than the window; returns how many were removed
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let window = self.window();
        let expired: Vec<u64> = self
            .cache
            .iter()
            .filter(|(_, entry)| now - entry.first_seen >= window)
            .map(|(key, _)| *key)
            .collect();

        for key in &expired {
            self.cache.invalidate(key);
        }
        self.cache.run_pending_tasks();
        expired.len()
    }

    /// Start the periodic sweep
    pub fn start(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() || !self.config.enabled {
            return;
        }

        let interval = Duration::from_millis(self.config.sweep_interval_ms.max(1));
        let dedup = Arc::clone(self);
        *sweeper = Some(tokio::spawn(async move {
            tracing::debug!("Dedup sweep started with interval {:?}", interval);
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = dedup.sweep(Utc::now());
                if removed > 0 {
                    tracing::debug!("Dedup sweep removed {} entries", removed);
                }
            }
        }));
    }

    /// Stop the periodic sweep
    pub fn stop(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }

    /// Forget every remembered alert
    pub fn clear(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks();
    }

    /// Get dedup statistics
    pub fn stats(&self) -> DedupStats {
        self.cache.run_pending_tasks();
        DedupStats {
            checks: self.checks.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            entries: self.cache.entry_count(),
            window_ms: self.config.window_ms,
        }
    }

    fn window(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.config.window_ms as i64)
    }
}

/// Hash an alert according to the configured mode
fn content_hash(alert: &Alert, algorithm: DedupAlgorithm) -> Option<u64> {
    match algorithm {
        DedupAlgorithm::Exact => {
            let content = serde_json::to_string(&(
                alert.alert_type,
                alert.priority,
                &alert.title,
                &alert.message,
                &alert.data,
                &alert.dedup_key,
            ))
            .ok()?;
            Some(fxhash::hash64(content.as_bytes()))
        }
        DedupAlgorithm::Hash => Some(fxhash::hash64(dedup_key(alert).as_bytes())),
        DedupAlgorithm::Fuzzy => Some(fxhash::hash64(normalize(&dedup_key(alert)).as_bytes())),
    }
}

/// Explicit key, or a composite of type and type-specific payload fields
pub fn dedup_key(alert: &Alert) -> String {
    if let Some(key) = &alert.dedup_key {
        return key.clone();
    }

    let subject = alert
        .data_str("mint")
        .or_else(|| alert.data_str("subject"))
        .or_else(|| alert.data_str("token"));
    let kind = alert.alert_type.as_str();

    let composite = match alert.alert_type {
        AlertType::TokenDiscovery
        | AlertType::LiquidityChange
        | AlertType::VolumeSpike
        | AlertType::AuthorityChange
        | AlertType::RugWarning => subject.map(|s| format!("{}:{}", kind, s)),
        AlertType::WhaleActivity | AlertType::SmartMoney => {
            match (alert.data_str("wallet"), subject) {
                (Some(wallet), Some(s)) => Some(format!("{}:{}:{}", kind, wallet, s)),
                _ => None,
            }
        }
        AlertType::PriceAlert => {
            let symbol = alert.data_str("symbol").or(subject);
            match (symbol, alert.data_str("trigger")) {
                (Some(symbol), Some(trigger)) => Some(format!("{}:{}:{}", kind, symbol, trigger)),
                _ => None,
            }
        }
        AlertType::TradingSignal | AlertType::System => None,
    };

    composite.unwrap_or_else(|| {
        let message: String = alert.message.chars().take(FALLBACK_MESSAGE_CHARS).collect();
        format!("{}:{}:{}", kind, alert.title, message)
    })
}

/// Lowercase, strip punctuation, collapse whitespace
fn normalize(key: &str) -> String {
    static PUNCT: OnceLock<Regex> = OnceLock::new();
    let punct = PUNCT.get_or_init(|| Regex::new(r"[^\w\s]").expect("valid regex"));

    let lowered = key.to_lowercase();
    let stripped = punct.replace_all(&lowered, " ");
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn describe_age(age: chrono::Duration) -> String {
    let secs = age.num_seconds();
    if secs < 1 {
        format!("{}ms", age.num_milliseconds())
    } else if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::model::NewAlert;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    fn dedup(algorithm: DedupAlgorithm) -> Deduplicator {
        Deduplicator::new(DedupConfig {
            enabled: true,
            window_ms: 60_000,
            algorithm,
            sweep_interval_ms: 1000,
        })
    }

    fn discovery(mint: &str) -> Alert {
        NewAlert::new(AlertType::TokenDiscovery, "New token", "found")
            .with_data(json!({"mint": mint}))
            .into_alert()
    }

    #[test]
    fn test_duplicate_within_window() {
        let d = dedup(DedupAlgorithm::Hash);
        let now = Utc::now();
        let first = discovery("mint-1");
        let second = discovery("mint-1");

        assert!(!d.check_at(&first, now).is_duplicate);
        let result = d.check_at(&second, now + ChronoDuration::seconds(5));
        assert!(result.is_duplicate);
        assert_eq!(result.original_id.as_deref(), Some(first.id.as_str()));
        assert!(result.reason.unwrap().contains("5s"));
    }

    #[test]
    fn test_not_duplicate_after_window() {
        let d = dedup(DedupAlgorithm::Hash);
        let now = Utc::now();
        assert!(!d.check_at(&discovery("mint-1"), now).is_duplicate);
        assert!(!d
            .check_at(&discovery("mint-1"), now + ChronoDuration::seconds(61))
            .is_duplicate);
        // the late sighting restarts the window
        assert!(d
            .check_at(&discovery("mint-1"), now + ChronoDuration::seconds(62))
            .is_duplicate);
    }

    #[test]
    fn test_explicit_key_wins() {
        let d = dedup(DedupAlgorithm::Hash);
        let now = Utc::now();
        let a = NewAlert::new(AlertType::System, "A", "one")
            .with_dedup_key("k1")
            .into_alert();
        let b = NewAlert::new(AlertType::PriceAlert, "B", "two")
            .with_dedup_key("k1")
            .into_alert();
        assert!(!d.check_at(&a, now).is_duplicate);
        assert!(d.check_at(&b, now).is_duplicate);
    }

    #[test]
    fn test_different_subjects_are_unique() {
        let d = dedup(DedupAlgorithm::Hash);
        let now = Utc::now();
        assert!(!d.check_at(&discovery("mint-1"), now).is_duplicate);
        assert!(!d.check_at(&discovery("mint-2"), now).is_duplicate);
    }

    #[test]
    fn test_composite_keys() {
        let whale = NewAlert::new(AlertType::WhaleActivity, "t", "m")
            .with_data(json!({"wallet": "W1", "mint": "M1"}))
            .into_alert();
        assert_eq!(dedup_key(&whale), "whale_activity:W1:M1");

        let price = NewAlert::new(AlertType::PriceAlert, "t", "m")
            .with_data(json!({"symbol": "SOL", "trigger": "above_200"}))
            .into_alert();
        assert_eq!(dedup_key(&price), "price_alert:SOL:above_200");

        let signal = NewAlert::new(AlertType::TradingSignal, "Buy", "x".repeat(300)).into_alert();
        let key = dedup_key(&signal);
        assert!(key.starts_with("trading_signal:Buy:"));
        assert_eq!(key.len(), "trading_signal:Buy:".len() + 100);
    }

    #[test]
    fn test_fuzzy_ignores_case_and_punctuation() {
        let d = dedup(DedupAlgorithm::Fuzzy);
        let now = Utc::now();
        let a = NewAlert::new(AlertType::System, "Node DOWN!", "disk  full").into_alert();
        let b = NewAlert::new(AlertType::System, "node down", "disk full.").into_alert();
        assert!(!d.check_at(&a, now).is_duplicate);
        assert!(d.check_at(&b, now).is_duplicate);

        let strict = dedup(DedupAlgorithm::Hash);
        assert!(!strict.check_at(&a, now).is_duplicate);
        assert!(!strict.check_at(&b, now).is_duplicate);
    }

    #[test]
    fn test_exact_mode_considers_payload() {
        let d = dedup(DedupAlgorithm::Exact);
        let now = Utc::now();
        let a = NewAlert::new(AlertType::TokenDiscovery, "t", "m")
            .with_data(json!({"mint": "M", "price": 1}))
            .into_alert();
        let b = NewAlert::new(AlertType::TokenDiscovery, "t", "m")
            .with_data(json!({"mint": "M", "price": 2}))
            .into_alert();
        assert!(!d.check_at(&a, now).is_duplicate);
        assert!(!d.check_at(&b, now).is_duplicate);
        assert!(d.check_at(&a.clone(), now).is_duplicate);
    }

    #[test]
    fn test_disabled_never_duplicate() {
        let d = Deduplicator::new(DedupConfig {
            enabled: false,
            ..DedupConfig::default()
        });
        let alert = discovery("m");
        assert!(!d.check(&alert).is_duplicate);
        assert!(!d.check(&alert).is_duplicate);
        assert_eq!(d.stats().checks, 0);
    }

    #[test]
    fn test_sweep_removes_expired() {
        let d = dedup(DedupAlgorithm::Hash);
        let now = Utc::now();
        d.check_at(&discovery("old"), now - ChronoDuration::seconds(120));
        d.check_at(&discovery("fresh"), now);

        assert_eq!(d.sweep(now), 1);
        assert_eq!(d.stats().entries, 1);
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("  Hello,   WORLD!! "), "hello world");
    }

    #[test]
    fn test_concurrent_checks_have_one_unique_verdict() {
        use std::sync::Barrier;

        for _ in 0..50 {
            let d = Arc::new(dedup(DedupAlgorithm::Hash));
            let barrier = Arc::new(Barrier::new(8));
            let alert = discovery("mint-race");

            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let d = Arc::clone(&d);
                    let barrier = Arc::clone(&barrier);
                    let alert = alert.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        d.check(&alert).is_duplicate
                    })
                })
                .collect();

            let unique = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|duplicate| !duplicate)
                .count();
            assert_eq!(unique, 1);
            assert_eq!(d.stats().duplicates, 7);
        }
    }
}
