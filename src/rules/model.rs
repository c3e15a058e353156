//! Rule, condition and snapshot types

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Trigger definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// Unique rule ID (generated by the engine)
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Optional longer description, used as the alert body
    #[serde(default)]
    pub description: Option<String>,
    /// Whether the rule takes part in evaluation
    pub enabled: bool,
    /// Root condition
    pub condition: Condition,
    /// Priority of alerts produced by this rule
    #[serde(default)]
    pub priority: RulePriority,
    /// Target channel IDs
    pub channels: Vec<String>,
    /// Message template (`{{field.path}}`, `{{subject}}`, `{{rule}}`)
    #[serde(default)]
    pub message: Option<String>,
    /// Minimum seconds between two triggers for the same subject
    pub cooldown_seconds: i64,
    /// Maximum triggers within any trailing hour
    pub max_alerts_per_hour: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_triggered: Option<DateTime<Utc>>,
    #[serde(default)]
    pub trigger_count: u64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl Rule {
    /// Whether the rule carries the given tag (case-insensitive)
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }
}

/// Input for creating a rule; the engine fills in ID and timestamps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRule {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub condition: Condition,
    #[serde(default)]
    pub priority: RulePriority,
    pub channels: Vec<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default = "default_cooldown")]
    pub cooldown_seconds: i64,
    #[serde(default = "default_max_per_hour")]
    pub max_alerts_per_hour: u32,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

fn default_enabled() -> bool {
    true
}

fn default_cooldown() -> i64 {
    300
}

fn default_max_per_hour() -> u32 {
    10
}

impl NewRule {
    /// Create a rule definition with default cooldown (300s) and hourly cap (10)
    pub fn new(name: impl Into<String>, condition: Condition) -> Self {
        Self {
            name: name.into(),
            description: None,
            enabled: true,
            condition,
            priority: RulePriority::default(),
            channels: Vec::new(),
            message: None,
            cooldown_seconds: default_cooldown(),
            max_alerts_per_hour: default_max_per_hour(),
            tags: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channels.push(channel.into());
        self
    }

    pub fn with_priority(mut self, priority: RulePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_cooldown(mut self, seconds: i64) -> Self {
        self.cooldown_seconds = seconds;
        self
    }

    pub fn with_max_per_hour(mut self, max: u32) -> Self {
        self.max_alerts_per_hour = max;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Partial update; `None` fields are left untouched
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub enabled: Option<bool>,
    pub condition: Option<Condition>,
    pub priority: Option<RulePriority>,
    pub channels: Option<Vec<String>>,
    pub message: Option<String>,
    pub cooldown_seconds: Option<i64>,
    pub max_alerts_per_hour: Option<u32>,
    pub tags: Option<Vec<String>>,
    pub metadata: Option<HashMap<String, Value>>,
}

/// Filter for listing rules; all set fields must match
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleFilter {
    pub enabled: Option<bool>,
    pub tag: Option<String>,
    pub channel: Option<String>,
    pub priority: Option<RulePriority>,
}

impl RuleFilter {
    /// Check if a rule passes every set filter
    pub fn matches(&self, rule: &Rule) -> bool {
        if self.enabled.is_some_and(|e| e != rule.enabled) {
            return false;
        }
        if let Some(tag) = &self.tag {
            if !rule.has_tag(tag) {
                return false;
            }
        }
        if let Some(channel) = &self.channel {
            if !rule.channels.iter().any(|c| c == channel) {
                return false;
            }
        }
        if self.priority.is_some_and(|p| p != rule.priority) {
            return false;
        }
        true
    }
}

/// Rule priority level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RulePriority {
    Low,
    #[default]
    #[serde(alias = "normal")]
    Medium,
    High,
    Critical,
}

/// Boolean condition tree node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// Compare a field against a literal
    Simple {
        field: String,
        #[serde(alias = "op")]
        operator: ComparisonOperator,
        value: Value,
    },
    /// Percent change of a field over a lookback timeframe
    Percent {
        field: String,
        #[serde(alias = "op")]
        operator: PercentOperator,
        threshold: f64,
        timeframe: Timeframe,
    },
    /// Raw change of a field over a lookback timeframe
    TimeframeDelta {
        field: String,
        timeframe: Timeframe,
        #[serde(alias = "op")]
        operator: ComparisonOperator,
        value: f64,
    },
    /// Boolean combination of child conditions
    Composite {
        #[serde(alias = "operator")]
        combinator: Combinator,
        conditions: Vec<Condition>,
    },
}

impl Condition {
    /// Compare a field against a literal
    pub fn simple(field: impl Into<String>, operator: ComparisonOperator, value: Value) -> Self {
        Condition::Simple {
            field: field.into(),
            operator,
            value,
        }
    }

    /// Percent change of a field over a timeframe
    pub fn percent(
        field: impl Into<String>,
        operator: PercentOperator,
        threshold: f64,
        timeframe: Timeframe,
    ) -> Self {
        Condition::Percent {
            field: field.into(),
            operator,
            threshold,
            timeframe,
        }
    }

    /// Raw change of a field over a timeframe
    pub fn delta(
        field: impl Into<String>,
        timeframe: Timeframe,
        operator: ComparisonOperator,
        value: f64,
    ) -> Self {
        Condition::TimeframeDelta {
            field: field.into(),
            timeframe,
            operator,
            value,
        }
    }

    /// AND of the given conditions
    pub fn all(conditions: Vec<Condition>) -> Self {
        Condition::Composite {
            combinator: Combinator::And,
            conditions,
        }
    }

    /// OR of the given conditions
    pub fn any(conditions: Vec<Condition>) -> Self {
        Condition::Composite {
            combinator: Combinator::Or,
            conditions,
        }
    }

    /// NOT only looks at the first child
    pub fn not(conditions: Vec<Condition>) -> Self {
        Condition::Composite {
            combinator: Combinator::Not,
            conditions,
        }
    }
}

/// Comparison operators for simple and delta conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOperator {
    #[serde(rename = ">", alias = "gt")]
    GreaterThan,
    #[serde(rename = ">=", alias = "gte")]
    GreaterOrEqual,
    #[serde(rename = "<", alias = "lt")]
    LessThan,
    #[serde(rename = "<=", alias = "lte")]
    LessOrEqual,
    #[serde(rename = "==", alias = "eq")]
    Equals,
    #[serde(rename = "!=", alias = "ne")]
    NotEquals,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "not_contains")]
    NotContains,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not_in")]
    NotIn,
    #[serde(rename = "starts_with")]
    StartsWith,
    #[serde(rename = "ends_with")]
    EndsWith,
    #[serde(rename = "exists")]
    Exists,
}

impl ComparisonOperator {
    pub fn symbol(&self) -> &'static str {
        match self {
            ComparisonOperator::GreaterThan => ">",
            ComparisonOperator::GreaterOrEqual => ">=",
            ComparisonOperator::LessThan => "<",
            ComparisonOperator::LessOrEqual => "<=",
            ComparisonOperator::Equals => "==",
            ComparisonOperator::NotEquals => "!=",
            ComparisonOperator::Contains => "contains",
            ComparisonOperator::NotContains => "not contains",
            ComparisonOperator::In => "in",
            ComparisonOperator::NotIn => "not in",
            ComparisonOperator::StartsWith => "starts with",
            ComparisonOperator::EndsWith => "ends with",
            ComparisonOperator::Exists => "exists",
        }
    }

    /// Whether the operator requires numeric operands
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ComparisonOperator::GreaterThan
                | ComparisonOperator::GreaterOrEqual
                | ComparisonOperator::LessThan
                | ComparisonOperator::LessOrEqual
        )
    }

    /// Apply the operator to two numbers
    pub fn compare_f64(&self, actual: f64, expected: f64) -> bool {
        match self {
            ComparisonOperator::GreaterThan => actual > expected,
            ComparisonOperator::GreaterOrEqual => actual >= expected,
            ComparisonOperator::LessThan => actual < expected,
            ComparisonOperator::LessOrEqual => actual <= expected,
            ComparisonOperator::Equals => actual == expected,
            ComparisonOperator::NotEquals => actual != expected,
            _ => false,
        }
    }
}

impl fmt::Display for ComparisonOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Percent-change operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PercentOperator {
    #[serde(rename = "percent_increase", alias = "increase")]
    Increase,
    #[serde(rename = "percent_decrease", alias = "decrease")]
    Decrease,
    #[serde(rename = "percent_change", alias = "abs")]
    Change,
}

impl PercentOperator {
    /// Check a signed percent change against an unsigned threshold
    pub fn holds(&self, change: f64, threshold: f64) -> bool {
        match self {
            PercentOperator::Increase => change >= threshold,
            PercentOperator::Decrease => change <= -threshold,
            PercentOperator::Change => change.abs() >= threshold,
        }
    }
}

/// Composite combinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Combinator {
    #[serde(rename = "AND", alias = "and")]
    And,
    #[serde(rename = "OR", alias = "or")]
    Or,
    #[serde(rename = "NOT", alias = "not")]
    Not,
}

/// Longest accepted lookback window
pub const MAX_TIMEFRAME_SECS: i64 = 366 * 86400;

/// Named lookback window such as `"15m"` or `"24h"`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timeframe {
    label: String,
    seconds: i64,
}

impl Timeframe {
    /// Parse `<n><unit>` with unit `s`, `m`, `h` or `d`, up to 366 days
    pub fn parse(label: &str) -> Result<Self, String> {
        let label = label.trim();
        let invalid = || format!("invalid timeframe '{}'", label);
        let (split, unit) = label.char_indices().last().ok_or_else(invalid)?;
        let amount: i64 = label[..split].parse().map_err(|_| invalid())?;
        if amount <= 0 {
            return Err(format!("timeframe must be positive: '{}'", label));
        }
        let multiplier = match unit {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            'd' => 86400,
            _ => return Err(format!("unknown timeframe unit in '{}'", label)),
        };
        let seconds = amount
            .checked_mul(multiplier)
            .filter(|s| *s <= MAX_TIMEFRAME_SECS)
            .ok_or_else(|| format!("timeframe too long: '{}'", label))?;
        Ok(Self {
            label: label.to_string(),
            seconds,
        })
    }

    /// Window length
    pub fn duration(&self) -> Duration {
        Duration::seconds(self.seconds)
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl TryFrom<String> for Timeframe {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Timeframe::parse(&value)
    }
}

impl From<Timeframe> for String {
    fn from(value: Timeframe) -> Self {
        value.label
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

/// Data a rule set is evaluated against
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Subject the data describes (token mint, wallet, symbol...)
    pub subject: String,
    /// Current data, flat or nested
    pub data: Value,
    /// Historical data points keyed by timestamp
    #[serde(default)]
    pub history: BTreeMap<DateTime<Utc>, Value>,
    /// Evaluation time
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(subject: impl Into<String>, data: Value) -> Self {
        Self {
            subject: subject.into(),
            data,
            history: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Set the evaluation time
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Add a historical data point
    pub fn with_history(mut self, timestamp: DateTime<Utc>, data: Value) -> Self {
        self.history.insert(timestamp, data);
        self
    }
}

/// Outcome of evaluating one rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub rule_id: String,
    pub rule_name: String,
    pub subject: String,
    pub matched: bool,
    pub matched_conditions: Vec<String>,
    pub failed_conditions: Vec<String>,
    pub timestamp: DateTime<Utc>,
}
