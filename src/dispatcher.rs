//! Rule evaluation to alert delivery bridge
//!
//! The dispatcher evaluates a snapshot, turns each matched rule into an
//! alert and hands it to the alert manager. It keeps its own coarse
//! `rule_id:subject` suppression window on top of the manager's
//! content-based deduplication.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use regex::{Captures, Regex};
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::alerts::manager::{AlertManager, SendOutcome};
use crate::alerts::model::{AlertPriority, AlertType, NewAlert};
use crate::config::DispatcherConfig;
use crate::id::next_id;
use crate::rules::evaluator::{display_value, lookup};
use crate::rules::{EvaluationResult, Rule, RuleEngine, RulePriority, Snapshot};

/// Matched conditions listed in a message before collapsing
const MAX_CONDITION_LINES: usize = 5;

/// Snapshot fields copied into alert payloads
const PAYLOAD_FIELDS: &[&str] = &[
    "mint",
    "symbol",
    "name",
    "price",
    "price_usd",
    "price_change",
    "market_cap",
    "liquidity",
    "volume",
    "volume_24h",
    "holders",
    "wallet",
    "amount",
    "amount_usd",
    "trigger",
    "signature",
];

/// Tag keywords in precedence order
const TAG_TYPES: &[(&str, AlertType)] = &[
    ("whale", AlertType::WhaleActivity),
    ("smart_money", AlertType::SmartMoney),
    ("liquidity", AlertType::LiquidityChange),
    ("volume", AlertType::VolumeSpike),
    ("price", AlertType::PriceAlert),
    ("authority", AlertType::AuthorityChange),
    ("rug", AlertType::RugWarning),
];

/// Outcome of processing one snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchReport {
    /// Enabled rules at evaluation time
    pub evaluated: usize,
    pub matched: usize,
    /// Matches dropped by the rule and subject window
    pub suppressed: usize,
    /// Alerts handed to the alert manager
    pub sent: usize,
    pub outcomes: Vec<SendOutcome>,
}

/// Dispatcher statistics
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStats {
    pub snapshots: u64,
    pub matched: u64,
    pub suppressed: u64,
    pub sent: u64,
    pub tracked_keys: usize,
}

#[derive(Default)]
struct Counters {
    snapshots: AtomicU64,
    matched: AtomicU64,
    suppressed: AtomicU64,
    sent: AtomicU64,
}

pub struct Dispatcher {
    engine: Arc<RuleEngine>,
    manager: Arc<AlertManager>,
    config: DispatcherConfig,
    recent: Mutex<HashMap<String, DateTime<Utc>>>,
    counters: Counters,
}

impl Dispatcher {
    pub fn new(engine: Arc<RuleEngine>, manager: Arc<AlertManager>, config: DispatcherConfig) -> Self {
        Self {
            engine,
            manager,
            config,
            recent: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    /// Evaluate a snapshot and forward every unsuppressed match
    pub async fn process(&self, snapshot: &Snapshot) -> DispatchReport {
        self.counters.snapshots.fetch_add(1, Ordering::Relaxed);
        let mut report = DispatchReport {
            evaluated: self.engine.stats().enabled_rules,
            ..Default::default()
        };

        for result in self.engine.evaluate(snapshot) {
            report.matched += 1;
            self.counters.matched.fetch_add(1, Ordering::Relaxed);

            let Some(rule) = self.engine.get_rule(&result.rule_id) else {
                tracing::warn!(rule_id = %result.rule_id, "Matched rule disappeared before dispatch");
                continue;
            };

            let key = format!("{}:{}", rule.id, result.subject);
            if self.recently_sent(&key, snapshot.timestamp) {
                report.suppressed += 1;
                self.counters.suppressed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(rule_id = %rule.id, subject = %result.subject, "Dispatch suppressed");
                continue;
            }

            let alert = build_alert(&rule, &result, snapshot);
            let outcome = self.manager.send_alert(alert).await;
            report.sent += 1;
            self.counters.sent.fetch_add(1, Ordering::Relaxed);
            report.outcomes.push(outcome);
        }

        report
    }

    /// Send a synthetic match for a rule without touching its cooldown state
    pub async fn test_delivery(&self, rule_id: &str, subject: &str) -> Result<SendOutcome, DispatchError> {
        let rule = self
            .engine
            .get_rule(rule_id)
            .ok_or_else(|| DispatchError::RuleNotFound(rule_id.to_string()))?;

        let snapshot = Snapshot::new(subject, json!({}));
        let result = EvaluationResult {
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            subject: subject.to_string(),
            matched: true,
            matched_conditions: vec!["Manual test delivery".to_string()],
            failed_conditions: Vec::new(),
            timestamp: snapshot.timestamp,
        };

        let alert = build_alert(&rule, &result, &snapshot).with_dedup_key(next_id("test"));
        tracing::info!(rule_id = %rule.id, subject = %subject, "Sending test delivery");
        Ok(self.manager.send_alert(alert).await)
    }

    /// Get dispatcher statistics
    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            snapshots: self.counters.snapshots.load(Ordering::Relaxed),
            matched: self.counters.matched.load(Ordering::Relaxed),
            suppressed: self.counters.suppressed.load(Ordering::Relaxed),
            sent: self.counters.sent.load(Ordering::Relaxed),
            tracked_keys: self.recent.lock().len(),
        }
    }

    /// Check and record a rule and subject key; prunes entries past twice the window
    fn recently_sent(&self, key: &str, now: DateTime<Utc>) -> bool {
        let window = Duration::milliseconds(self.config.dedup_window_ms as i64);
        let mut recent = self.recent.lock();
        recent.retain(|_, sent| now - *sent <= window * 2);

        match recent.get(key) {
            Some(sent) if now - *sent < window => true,
            _ => {
                recent.insert(key.to_string(), now);
                false
            }
        }
    }
}

/// Build the alert for a matched rule
pub fn build_alert(rule: &Rule, result: &EvaluationResult, snapshot: &Snapshot) -> NewAlert {
    let title = match &rule.message {
        Some(template) if !template.trim().is_empty() => render_template(template, rule, snapshot),
        _ => rule.name.clone(),
    };

    let mut alert = NewAlert::new(alert_type_for(rule), title, compose_message(rule, result))
        .with_priority(priority_for(rule.priority))
        .with_data(payload_for(rule, result, snapshot))
        .with_rule(rule.id.clone());
    for channel in &rule.channels {
        alert = alert.with_channel(channel.clone());
    }
    alert
}

/// Map a rule priority onto an alert priority
pub fn priority_for(priority: RulePriority) -> AlertPriority {
    match priority {
        RulePriority::Critical => AlertPriority::Critical,
        RulePriority::High => AlertPriority::High,
        RulePriority::Medium => AlertPriority::Normal,
        RulePriority::Low => AlertPriority::Low,
    }
}

/// Tags first, then `metadata.alert_type`, then `metadata.category`
pub fn alert_type_for(rule: &Rule) -> AlertType {
    let tags: Vec<String> = rule.tags.iter().map(|t| t.to_lowercase()).collect();
    for (keyword, alert_type) in TAG_TYPES {
        if tags.iter().any(|t| t.contains(*keyword)) {
            return *alert_type;
        }
    }

    if let Some(explicit) = rule
        .metadata
        .get("alert_type")
        .and_then(Value::as_str)
        .and_then(AlertType::parse)
    {
        return explicit;
    }

    rule.metadata
        .get("category")
        .and_then(Value::as_str)
        .and_then(category_type)
        .unwrap_or(AlertType::TradingSignal)
}

fn category_type(category: &str) -> Option<AlertType> {
    let alert_type = match category.to_lowercase().as_str() {
        "discovery" | "new_token" | "launch" => AlertType::TokenDiscovery,
        "whale" | "whales" => AlertType::WhaleActivity,
        "smart_money" | "insider" => AlertType::SmartMoney,
        "liquidity" => AlertType::LiquidityChange,
        "volume" => AlertType::VolumeSpike,
        "price" | "momentum" => AlertType::PriceAlert,
        "security" | "authority" => AlertType::AuthorityChange,
        "risk" | "rug" | "scam" => AlertType::RugWarning,
        "system" => AlertType::System,
        "signal" | "trading" => AlertType::TradingSignal,
        _ => return None,
    };
    Some(alert_type)
}

fn compose_message(rule: &Rule, result: &EvaluationResult) -> String {
    let mut lines = Vec::new();
    if let Some(description) = rule.description.as_deref().filter(|d| !d.is_empty()) {
        lines.push(description.to_string());
    }

    for condition in result.matched_conditions.iter().take(MAX_CONDITION_LINES) {
        lines.push(format!("- {}", condition));
    }
    let overflow = result.matched_conditions.len().saturating_sub(MAX_CONDITION_LINES);
    if overflow > 0 {
        lines.push(format!("...and {} more", overflow));
    }

    if !result.subject.is_empty() {
        lines.push(format!("Subject: {}", result.subject));
    }
    lines.join("\n")
}

fn payload_for(rule: &Rule, result: &EvaluationResult, snapshot: &Snapshot) -> Value {
    let mut payload = Map::new();
    for field in PAYLOAD_FIELDS {
        if let Some(value) = snapshot.data.get(*field).filter(|v| !v.is_null()) {
            payload.insert(field.to_string(), value.clone());
        }
    }
    payload.insert("subject".to_string(), json!(result.subject));
    payload.insert("rule_id".to_string(), json!(rule.id));
    payload.insert("rule_name".to_string(), json!(rule.name));
    Value::Object(payload)
}

/// Replace `{{path}}`, `{{subject}}` and `{{rule}}`; unknown paths stay as written
pub fn render_template(template: &str, rule: &Rule, snapshot: &Snapshot) -> String {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    let placeholder = PLACEHOLDER
        .get_or_init(|| Regex::new(r"\{\{\s*([\w.]+)\s*\}\}").expect("valid regex"));

    placeholder
        .replace_all(template, |caps: &Captures| match &caps[1] {
            "subject" => snapshot.subject.clone(),
            "rule" => rule.name.clone(),
            path => lookup(&snapshot.data, path)
                .map(display_value)
                .unwrap_or_else(|| caps[0].to_string()),
        })
        .into_owned()
}

/// Dispatcher errors
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Rule not found: {0}")]
    RuleNotFound(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{Channel, ChannelError, DeliveryResult};
    use crate::config::PipelineConfig;
    use crate::alerts::model::Alert;
    use crate::rules::{ComparisonOperator, Condition, NewRule};
    use async_trait::async_trait;

    #[derive(Default)]
    struct Capture {
        alerts: Mutex<Vec<Alert>>,
    }

    #[async_trait]
    impl Channel for Capture {
        fn id(&self) -> &str {
            "capture"
        }

        fn channel_type(&self) -> &str {
            "memory"
        }

        async fn send(&self, alert: &Alert) -> Result<DeliveryResult, ChannelError> {
            self.alerts.lock().push(alert.clone());
            Ok(DeliveryResult::ok())
        }
    }

    fn liquidity_rule() -> NewRule {
        NewRule::new(
            "Liquidity floor",
            Condition::simple("liquidity", ComparisonOperator::GreaterOrEqual, json!(50000)),
        )
        .with_channel("capture")
        .with_priority(RulePriority::High)
        .with_description("Pool is deep enough")
        .with_message("{{symbol}} liquidity at {{liquidity}}")
        .with_tag("liquidity")
    }

    fn setup() -> (Arc<RuleEngine>, Arc<Capture>, Dispatcher) {
        let engine = Arc::new(RuleEngine::new());
        let mut config = PipelineConfig::default();
        config.batch.enabled = false;
        let manager = Arc::new(AlertManager::new(config));
        let capture = Arc::new(Capture::default());
        manager.register_channel(capture.clone(), None);
        let dispatcher = Dispatcher::new(engine.clone(), manager, DispatcherConfig::default());
        (engine, capture, dispatcher)
    }

    fn snapshot(subject: &str) -> Snapshot {
        Snapshot::new(subject, json!({"symbol": "BONK", "liquidity": 75000, "secret": "x"}))
    }

    #[tokio::test]
    async fn test_process_builds_alert() {
        let (engine, capture, dispatcher) = setup();
        let rule = engine.create_rule(liquidity_rule()).unwrap();

        let report = dispatcher.process(&snapshot("mintA")).await;
        assert_eq!(report.evaluated, 1);
        assert_eq!(report.matched, 1);
        assert_eq!(report.sent, 1);

        let alerts = capture.alerts.lock();
        assert_eq!(alerts.len(), 1);
        let alert = &alerts[0];
        assert_eq!(alert.title, "BONK liquidity at 75000");
        assert_eq!(alert.alert_type, AlertType::LiquidityChange);
        assert_eq!(alert.priority, AlertPriority::High);
        assert_eq!(alert.rule_id.as_deref(), Some(rule.id.as_str()));
        assert_eq!(alert.channel_ids, vec!["capture"]);
        assert!(alert.message.starts_with("Pool is deep enough\n- "));
        assert!(alert.message.ends_with("Subject: mintA"));
        assert_eq!(alert.data["liquidity"], 75000);
        assert!(alert.data.get("secret").is_none());
    }

    #[tokio::test]
    async fn test_coarse_window_suppresses_repeat() {
        let (engine, capture, dispatcher) = setup();
        engine
            .create_rule(liquidity_rule().with_cooldown(0).with_max_per_hour(100))
            .unwrap();

        let now = Utc::now();
        dispatcher.process(&snapshot("mintA").at(now)).await;
        let second = dispatcher
            .process(&snapshot("mintA").at(now + Duration::seconds(10)))
            .await;
        assert_eq!(second.matched, 1);
        assert_eq!(second.suppressed, 1);
        assert_eq!(second.sent, 0);

        let other = dispatcher
            .process(&snapshot("mintB").at(now + Duration::seconds(11)))
            .await;
        assert_eq!(other.sent, 1);
        assert_eq!(capture.alerts.lock().len(), 2);

        let stats = dispatcher.stats();
        assert_eq!(stats.snapshots, 3);
        assert_eq!(stats.suppressed, 1);
        assert_eq!(stats.tracked_keys, 2);
    }

    #[test]
    fn test_window_prunes_old_entries() {
        let (_, _, dispatcher) = setup();
        let now = Utc::now();
        assert!(!dispatcher.recently_sent("r:a", now));
        assert!(dispatcher.recently_sent("r:a", now + Duration::minutes(4)));
        assert!(!dispatcher.recently_sent("r:a", now + Duration::minutes(6)));

        assert!(!dispatcher.recently_sent("r:b", now + Duration::minutes(20)));
        assert_eq!(dispatcher.recent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_delivery_leaves_cooldown_untouched() {
        let (engine, capture, dispatcher) = setup();
        let rule = engine.create_rule(liquidity_rule()).unwrap();

        let outcome = dispatcher.test_delivery(&rule.id, "mintZ").await.unwrap();
        assert!(matches!(outcome, SendOutcome::Delivered(_)));
        assert_eq!(capture.alerts.lock().len(), 1);
        assert_eq!(engine.get_rule(&rule.id).unwrap().trigger_count, 0);

        // a real match still fires
        assert_eq!(dispatcher.process(&snapshot("mintZ")).await.sent, 1);

        assert!(matches!(
            dispatcher.test_delivery("missing", "x").await,
            Err(DispatchError::RuleNotFound(_))
        ));
    }

    #[test]
    fn test_alert_type_inference() {
        let engine = RuleEngine::new();
        let base = || {
            NewRule::new("r", Condition::simple("x", ComparisonOperator::Exists, json!(null)))
                .with_channel("c")
        };

        let both = engine
            .create_rule(base().with_tag("price").with_tag("whale-watch"))
            .unwrap();
        assert_eq!(alert_type_for(&both), AlertType::WhaleActivity);

        let explicit = engine
            .create_rule(base().with_metadata("alert_type", json!("rug_warning")))
            .unwrap();
        assert_eq!(alert_type_for(&explicit), AlertType::RugWarning);

        let category = engine
            .create_rule(base().with_metadata("category", json!("discovery")))
            .unwrap();
        assert_eq!(alert_type_for(&category), AlertType::TokenDiscovery);

        let plain = engine.create_rule(base()).unwrap();
        assert_eq!(alert_type_for(&plain), AlertType::TradingSignal);
    }

    #[test]
    fn test_message_overflow() {
        let engine = RuleEngine::new();
        let rule = engine
            .create_rule(
                NewRule::new("r", Condition::simple("x", ComparisonOperator::Exists, json!(null)))
                    .with_channel("c"),
            )
            .unwrap();
        let result = EvaluationResult {
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            subject: String::new(),
            matched: true,
            matched_conditions: (0..8).map(|i| format!("c{}", i)).collect(),
            failed_conditions: Vec::new(),
            timestamp: Utc::now(),
        };

        let message = compose_message(&rule, &result);
        assert_eq!(message.lines().count(), 6);
        assert!(message.ends_with("...and 3 more"));
    }

    #[test]
    fn test_template_keeps_unknown_placeholders() {
        let engine = RuleEngine::new();
        let rule = engine.create_rule(liquidity_rule()).unwrap();
        let snap = snapshot("mintA");
        assert_eq!(
            render_template("{{rule}} on {{subject}}: {{missing.path}}", &rule, &snap),
            "Liquidity floor on mintA: {{missing.path}}"
        );
    }
}
