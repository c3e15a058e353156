//! Alert and batch types

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::next_id;

/// Alert category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    TokenDiscovery,
    WhaleActivity,
    SmartMoney,
    LiquidityChange,
    VolumeSpike,
    PriceAlert,
    AuthorityChange,
    RugWarning,
    TradingSignal,
    System,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::TokenDiscovery => "token_discovery",
            AlertType::WhaleActivity => "whale_activity",
            AlertType::SmartMoney => "smart_money",
            AlertType::LiquidityChange => "liquidity_change",
            AlertType::VolumeSpike => "volume_spike",
            AlertType::PriceAlert => "price_alert",
            AlertType::AuthorityChange => "authority_change",
            AlertType::RugWarning => "rug_warning",
            AlertType::TradingSignal => "trading_signal",
            AlertType::System => "system",
        }
    }

    /// Parse a snake_case type name
    pub fn parse(name: &str) -> Option<Self> {
        serde_json::from_value(Value::String(name.trim().to_lowercase())).ok()
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alert priority, ordered low to critical
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum AlertPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl AlertPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertPriority::Low => "low",
            AlertPriority::Normal => "normal",
            AlertPriority::High => "high",
            AlertPriority::Critical => "critical",
        }
    }
}

impl fmt::Display for AlertPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single notification event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub alert_type: AlertType,
    pub priority: AlertPriority,
    pub title: String,
    pub message: String,
    /// Arbitrary payload
    #[serde(default)]
    pub data: Value,
    /// Explicit deduplication key
    #[serde(default)]
    pub dedup_key: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub user_id: Option<String>,
    /// Explicit destination channels
    #[serde(default)]
    pub channel_ids: Vec<String>,
    /// Rule that produced the alert
    #[serde(default)]
    pub rule_id: Option<String>,
}

impl Alert {
    /// Look up a top-level payload field as a string
    pub fn data_str(&self, key: &str) -> Option<String> {
        match self.data.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}

/// Alert as submitted by a producer; missing fields are defaulted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAlert {
    #[serde(default)]
    pub id: Option<String>,
    pub alert_type: AlertType,
    #[serde(default)]
    pub priority: Option<AlertPriority>,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub dedup_key: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub channel_ids: Vec<String>,
    #[serde(default)]
    pub rule_id: Option<String>,
}

impl NewAlert {
    pub fn new(alert_type: AlertType, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: None,
            alert_type,
            priority: None,
            title: title.into(),
            message: message.into(),
            data: Value::Object(Default::default()),
            dedup_key: None,
            timestamp: None,
            user_id: None,
            channel_ids: Vec::new(),
            rule_id: None,
        }
    }

    pub fn with_priority(mut self, priority: AlertPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Explicit dedup key, overriding the content-derived one
    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    /// Deliver to this channel instead of the routed ones
    pub fn with_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_ids.push(channel_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_rule(mut self, rule_id: impl Into<String>) -> Self {
        self.rule_id = Some(rule_id.into());
        self
    }

    /// Fill defaults: generated ID, normal priority, current time
    pub fn into_alert(self) -> Alert {
        Alert {
            id: self.id.unwrap_or_else(|| next_id("alert")),
            alert_type: self.alert_type,
            priority: self.priority.unwrap_or_default(),
            title: self.title,
            message: self.message,
            data: self.data,
            dedup_key: self.dedup_key,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            user_id: self.user_id,
            channel_ids: self.channel_ids,
            rule_id: self.rule_id,
        }
    }
}

impl From<Alert> for NewAlert {
    fn from(alert: Alert) -> Self {
        Self {
            id: Some(alert.id),
            alert_type: alert.alert_type,
            priority: Some(alert.priority),
            title: alert.title,
            message: alert.message,
            data: alert.data,
            dedup_key: alert.dedup_key,
            timestamp: Some(alert.timestamp),
            user_id: alert.user_id,
            channel_ids: alert.channel_ids,
            rule_id: alert.rule_id,
        }
    }
}

/// Time-windowed aggregation of same-type alerts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertBatch {
    pub id: String,
    pub alert_type: AlertType,
    /// Highest priority among members
    pub priority: AlertPriority,
    pub alerts: Vec<Alert>,
    pub summary: String,
    pub timestamp: DateTime<Utc>,
}

impl AlertBatch {
    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }

    /// Fold the batch into one alert carrying the summary and member titles
    pub fn to_summary_alert(&self) -> Alert {
        let mut message = self.summary.clone();
        for alert in &self.alerts {
            message.push_str("\n- ");
            message.push_str(&alert.title);
        }

        let mut channel_ids: Vec<String> = Vec::new();
        for id in self.alerts.iter().flat_map(|a| a.channel_ids.iter()) {
            if !channel_ids.contains(id) {
                channel_ids.push(id.clone());
            }
        }

        Alert {
            id: self.id.clone(),
            alert_type: self.alert_type,
            priority: self.priority,
            title: format!("{} {} alerts", self.alerts.len(), self.alert_type),
            message,
            data: serde_json::json!({
                "batch_id": self.id,
                "count": self.alerts.len(),
                "alert_ids": self.alerts.iter().map(|a| a.id.clone()).collect::<Vec<_>>(),
            }),
            dedup_key: None,
            timestamp: self.timestamp,
            user_id: None,
            channel_ids,
            rule_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_filled() {
        let alert = NewAlert::new(AlertType::PriceAlert, "t", "m").into_alert();
        assert!(alert.id.starts_with("alert_"));
        assert_eq!(alert.priority, AlertPriority::Normal);
        assert!(alert.data.is_object());
    }

    #[test]
    fn test_priority_order() {
        assert!(AlertPriority::Critical > AlertPriority::High);
        assert!(AlertPriority::High > AlertPriority::Normal);
        assert!(AlertPriority::Normal > AlertPriority::Low);
    }

    #[test]
    fn test_alert_type_parse() {
        assert_eq!(AlertType::parse("whale_activity"), Some(AlertType::WhaleActivity));
        assert_eq!(AlertType::parse(" Rug_Warning "), Some(AlertType::RugWarning));
        assert_eq!(AlertType::parse("bogus"), None);
    }

    #[test]
    fn test_summary_alert() {
        let a = NewAlert::new(AlertType::TokenDiscovery, "A", "a")
            .with_channel("tg")
            .into_alert();
        let b = NewAlert::new(AlertType::TokenDiscovery, "B", "b")
            .with_channel("tg")
            .into_alert();
        let batch = AlertBatch {
            id: "batch_1".into(),
            alert_type: AlertType::TokenDiscovery,
            priority: AlertPriority::High,
            alerts: vec![a, b],
            summary: "2 new tokens".into(),
            timestamp: Utc::now(),
        };

        let folded = batch.to_summary_alert();
        assert_eq!(folded.id, "batch_1");
        assert_eq!(folded.priority, AlertPriority::High);
        assert!(folded.message.contains("- A"));
        assert!(folded.message.contains("- B"));
        assert_eq!(folded.channel_ids, vec!["tg".to_string()]);
        assert_eq!(folded.data["count"], 2);
    }
}
