//! Channel routing
//!
//! Channels are kept in registration order. Explicit routing rules are tried
//! first; when no channel claims the alert, priority decides how many of the
//! enabled channels receive it.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::model::{Alert, AlertBatch, AlertPriority};
use super::rate_limit::ChannelRateLimit;
use crate::rules::evaluator::{as_number, lookup};

/// Routing and delivery settings for a channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub id: String,
    pub channel_type: String,
    pub name: String,
    pub enabled: bool,
    /// Provider-specific settings
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub routing_rules: Vec<RoutingRule>,
    #[serde(default)]
    pub rate_limit: Option<ChannelRateLimit>,
    pub created_at: DateTime<Utc>,
}

impl ChannelConfig {
    pub fn new(id: impl Into<String>, channel_type: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            channel_type: channel_type.into(),
            enabled: true,
            config: Value::Null,
            routing_rules: Vec::new(),
            rate_limit: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_rule(mut self, rule: RoutingRule) -> Self {
        self.routing_rules.push(rule);
        self
    }

    pub fn with_rate_limit(mut self, limit: ChannelRateLimit) -> Self {
        self.rate_limit = Some(limit);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// All rules match (channels without rules never match explicitly)
    pub fn matches(&self, alert: &Alert) -> bool {
        !self.routing_rules.is_empty() && self.routing_rules.iter().all(|r| r.matches(alert))
    }
}

/// One `field operator value` routing check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRule {
    /// `type`, `priority`, `rule_id`, `user_id` or `data.<path>`
    pub field: String,
    pub operator: RoutingOperator,
    pub value: Value,
}

impl RoutingRule {
    pub fn new(field: impl Into<String>, operator: RoutingOperator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }

    /// Check if the rule matches an alert
    pub fn matches(&self, alert: &Alert) -> bool {
        if self.field == "priority" {
            return self.matches_priority(alert.priority);
        }

        let actual = match self.field.as_str() {
            "type" => Value::String(alert.alert_type.as_str().to_string()),
            "rule_id" => alert.rule_id.clone().map(Value::String).unwrap_or(Value::Null),
            "user_id" => alert.user_id.clone().map(Value::String).unwrap_or(Value::Null),
            path => match path.strip_prefix("data.") {
                Some(rest) => lookup(&alert.data, rest).cloned().unwrap_or(Value::Null),
                None => Value::Null,
            },
        };
        self.operator.apply(&actual, &self.value)
    }

    fn matches_priority(&self, actual: AlertPriority) -> bool {
        let parse = |v: &Value| serde_json::from_value::<AlertPriority>(v.clone()).ok();
        match self.operator {
            RoutingOperator::Gte => parse(&self.value).is_some_and(|p| actual >= p),
            RoutingOperator::Lte => parse(&self.value).is_some_and(|p| actual <= p),
            _ => self
                .operator
                .apply(&Value::String(actual.as_str().to_string()), &self.value),
        }
    }
}

/// Routing rule operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingOperator {
    Equals,
    NotEquals,
    In,
    NotIn,
    Contains,
    Gte,
    Lte,
}

impl RoutingOperator {
    fn apply(&self, actual: &Value, expected: &Value) -> bool {
        match self {
            RoutingOperator::Equals => loose_eq(actual, expected),
            RoutingOperator::NotEquals => !loose_eq(actual, expected),
            RoutingOperator::In => expected
                .as_array()
                .is_some_and(|items| items.iter().any(|v| loose_eq(actual, v))),
            RoutingOperator::NotIn => expected
                .as_array()
                .is_some_and(|items| !items.iter().any(|v| loose_eq(actual, v))),
            RoutingOperator::Contains => match (actual, expected) {
                (Value::String(a), Value::String(e)) => a.to_lowercase().contains(&e.to_lowercase()),
                (Value::Array(items), e) => items.iter().any(|v| loose_eq(v, e)),
                _ => false,
            },
            RoutingOperator::Gte => numbers(actual, expected).is_some_and(|(a, e)| a >= e),
            RoutingOperator::Lte => numbers(actual, expected).is_some_and(|(a, e)| a <= e),
        }
    }
}

fn numbers(a: &Value, b: &Value) -> Option<(f64, f64)> {
    Some((as_number(a)?, as_number(b)?))
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::String(x), Value::String(y)) => x.eq_ignore_ascii_case(y),
        _ => match numbers(a, b) {
            Some((x, y)) => x == y,
            None => a == b,
        },
    }
}

/// Routing outcome
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteDecision {
    pub should_route: bool,
    pub channel_ids: Vec<String>,
    pub reason: Option<String>,
}

impl RouteDecision {
    fn to(channel_ids: Vec<String>, reason: &str) -> Self {
        Self {
            should_route: !channel_ids.is_empty(),
            channel_ids,
            reason: Some(reason.to_string()),
        }
    }
}

/// Maps alerts to channel IDs
#[derive(Debug, Default)]
pub struct Router {
    channels: RwLock<Vec<ChannelConfig>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a channel config (replacement keeps its position)
    pub fn register(&self, config: ChannelConfig) {
        let mut channels = self.channels.write();
        match channels.iter_mut().find(|c| c.id == config.id) {
            Some(existing) => *existing = config,
            None => channels.push(config),
        }
    }

    /// Unregister a channel
    pub fn unregister(&self, id: &str) -> Option<ChannelConfig> {
        let mut channels = self.channels.write();
        let idx = channels.iter().position(|c| c.id == id)?;
        Some(channels.remove(idx))
    }

    /// Get a channel config by ID
    pub fn get(&self, id: &str) -> Option<ChannelConfig> {
        self.channels.read().iter().find(|c| c.id == id).cloned()
    }

    /// Enable or disable a channel
    pub fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        let mut channels = self.channels.write();
        match channels.iter_mut().find(|c| c.id == id) {
            Some(c) => {
                c.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// List all channel configs in registration order
    pub fn channels(&self) -> Vec<ChannelConfig> {
        self.channels.read().clone()
    }

    /// Select destination channels for an alert
    pub fn route(&self, alert: &Alert) -> RouteDecision {
        let channels = self.channels.read();
        let enabled: Vec<&ChannelConfig> = channels.iter().filter(|c| c.enabled).collect();

        if enabled.is_empty() {
            return RouteDecision {
                should_route: false,
                channel_ids: Vec::new(),
                reason: Some("no enabled channels".to_string()),
            };
        }

        if !alert.channel_ids.is_empty() {
            let targeted: Vec<String> = enabled
                .iter()
                .filter(|c| alert.channel_ids.contains(&c.id))
                .map(|c| c.id.clone())
                .collect();
            if !targeted.is_empty() {
                return RouteDecision::to(targeted, "explicit destination");
            }
            tracing::debug!(
                alert_id = %alert.id,
                requested = ?alert.channel_ids,
                "No requested channel is available, falling back to routing rules"
            );
        }

        let matched: Vec<String> = enabled
            .iter()
            .filter(|c| c.matches(alert))
            .map(|c| c.id.clone())
            .collect();
        if !matched.is_empty() {
            return RouteDecision::to(matched, "routing rules");
        }

        let take = match alert.priority {
            AlertPriority::Critical => enabled.len(),
            AlertPriority::High => 2,
            AlertPriority::Normal | AlertPriority::Low => 1,
        };
        let defaults = enabled.iter().take(take).map(|c| c.id.clone()).collect();
        RouteDecision::to(defaults, "default priority routing")
    }

    /// Route a batch as if it were one alert of the batch's type and priority
    pub fn route_batch(&self, batch: &AlertBatch) -> RouteDecision {
        self.route(&batch.to_summary_alert())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::model::{AlertType, NewAlert};
    use serde_json::json;

    fn router_with(n: usize) -> Router {
        let router = Router::new();
        for i in 0..n {
            router.register(ChannelConfig::new(format!("ch{}", i), "webhook"));
        }
        router
    }

    fn alert(priority: AlertPriority) -> Alert {
        NewAlert::new(AlertType::PriceAlert, "t", "m")
            .with_priority(priority)
            .into_alert()
    }

    #[test]
    fn test_default_routing_by_priority() {
        let router = router_with(3);
        assert_eq!(router.route(&alert(AlertPriority::Critical)).channel_ids.len(), 3);
        assert_eq!(
            router.route(&alert(AlertPriority::High)).channel_ids,
            vec!["ch0", "ch1"]
        );
        assert_eq!(router.route(&alert(AlertPriority::Normal)).channel_ids, vec!["ch0"]);
        assert_eq!(router.route(&alert(AlertPriority::Low)).channel_ids, vec!["ch0"]);
    }

    #[test]
    fn test_disabled_channels_excluded() {
        let router = router_with(3);
        router.set_enabled("ch0", false);
        assert_eq!(router.route(&alert(AlertPriority::Normal)).channel_ids, vec!["ch1"]);
        assert_eq!(router.route(&alert(AlertPriority::Critical)).channel_ids.len(), 2);
    }

    #[test]
    fn test_no_enabled_channels() {
        let router = router_with(1);
        router.set_enabled("ch0", false);
        let decision = router.route(&alert(AlertPriority::Critical));
        assert!(!decision.should_route);
        assert!(decision.channel_ids.is_empty());

        assert!(!Router::new().route(&alert(AlertPriority::Low)).should_route);
    }

    #[test]
    fn test_explicit_rules_all_must_match() {
        let router = router_with(2);
        router.register(
            ChannelConfig::new("whales", "telegram")
                .with_rule(RoutingRule::new("type", RoutingOperator::Equals, json!("whale_activity")))
                .with_rule(RoutingRule::new("data.amount", RoutingOperator::Gte, json!(1000))),
        );

        let big = NewAlert::new(AlertType::WhaleActivity, "t", "m")
            .with_data(json!({"amount": 5000}))
            .into_alert();
        assert_eq!(router.route(&big).channel_ids, vec!["whales"]);

        let small = NewAlert::new(AlertType::WhaleActivity, "t", "m")
            .with_data(json!({"amount": 10}))
            .into_alert();
        assert_eq!(router.route(&small).channel_ids, vec!["ch0"]);
    }

    #[test]
    fn test_priority_rule() {
        let router = router_with(1);
        router.register(
            ChannelConfig::new("pager", "push")
                .with_rule(RoutingRule::new("priority", RoutingOperator::Gte, json!("high"))),
        );
        assert_eq!(router.route(&alert(AlertPriority::High)).channel_ids, vec!["pager"]);
        assert_eq!(router.route(&alert(AlertPriority::Low)).channel_ids, vec!["ch0"]);

        let in_rule = RoutingRule::new("priority", RoutingOperator::In, json!(["low", "normal"]));
        assert!(in_rule.matches(&alert(AlertPriority::Low)));
        assert!(!in_rule.matches(&alert(AlertPriority::Critical)));
    }

    #[test]
    fn test_explicit_destination() {
        let router = router_with(3);
        let targeted = NewAlert::new(AlertType::PriceAlert, "t", "m")
            .with_channel("ch2")
            .with_channel("missing")
            .into_alert();
        assert_eq!(router.route(&targeted).channel_ids, vec!["ch2"]);

        let unknown = NewAlert::new(AlertType::PriceAlert, "t", "m")
            .with_channel("missing")
            .into_alert();
        assert_eq!(router.route(&unknown).channel_ids, vec!["ch0"]);
    }

    #[test]
    fn test_register_replaces_in_place() {
        let router = router_with(2);
        router.register(ChannelConfig::new("ch0", "email").with_name("Mail"));
        let channels = router.channels();
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0].name, "Mail");

        assert!(router.unregister("ch0").is_some());
        assert!(router.get("ch0").is_none());
    }

    #[test]
    fn test_route_batch_uses_batch_priority() {
        let router = router_with(3);
        let members = vec![alert(AlertPriority::Low), alert(AlertPriority::Critical)];
        let batch = crate::alerts::batcher::build_batch(AlertType::PriceAlert, members);
        assert_eq!(router.route_batch(&batch).channel_ids.len(), 3);
    }
}
