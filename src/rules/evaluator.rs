//! Condition evaluation
//!
//! Pure functions evaluating a condition tree against a [`Snapshot`]. Every
//! gap (missing field, non-numeric operand, missing history) is a non-match
//! recorded in the failed list, never an error.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use super::model::{
    Combinator, ComparisonOperator, Condition, PercentOperator, Snapshot, Timeframe,
};

/// Minimum distance tolerated between the lookback target and a historical point
const MIN_LOOKBACK_TOLERANCE_SECS: i64 = 60;

/// Result of evaluating a condition tree
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConditionOutcome {
    pub matched: bool,
    pub matched_conditions: Vec<String>,
    pub failed_conditions: Vec<String>,
}

impl ConditionOutcome {
    fn pass(description: String) -> Self {
        Self {
            matched: true,
            matched_conditions: vec![description],
            failed_conditions: Vec::new(),
        }
    }

    fn fail(description: String) -> Self {
        Self {
            matched: false,
            matched_conditions: Vec::new(),
            failed_conditions: vec![description],
        }
    }

    fn from_check(matched: bool, description: String) -> Self {
        if matched {
            Self::pass(description)
        } else {
            Self::fail(description)
        }
    }
}

/// Evaluate a condition tree against a snapshot
pub fn evaluate(condition: &Condition, snapshot: &Snapshot) -> ConditionOutcome {
    match condition {
        Condition::Simple {
            field,
            operator,
            value,
        } => evaluate_simple(field, *operator, value, &snapshot.data),
        Condition::Percent {
            field,
            operator,
            threshold,
            timeframe,
        } => evaluate_percent(field, *operator, *threshold, timeframe, snapshot),
        Condition::TimeframeDelta {
            field,
            timeframe,
            operator,
            value,
        } => evaluate_delta(field, timeframe, *operator, *value, snapshot),
        Condition::Composite {
            combinator,
            conditions,
        } => evaluate_composite(*combinator, conditions, snapshot),
    }
}

fn evaluate_composite(
    combinator: Combinator,
    conditions: &[Condition],
    snapshot: &Snapshot,
) -> ConditionOutcome {
    if conditions.is_empty() {
        return ConditionOutcome::fail(format!("{:?} with no conditions", combinator));
    }

    // No short-circuit: every child contributes its descriptions
    let mut outcome = ConditionOutcome::default();
    let mut results = Vec::with_capacity(conditions.len());
    for child in conditions {
        let child_outcome = evaluate(child, snapshot);
        results.push(child_outcome.matched);
        outcome.matched_conditions.extend(child_outcome.matched_conditions);
        outcome.failed_conditions.extend(child_outcome.failed_conditions);
    }

    outcome.matched = match combinator {
        Combinator::And => results.iter().all(|m| *m),
        Combinator::Or => results.iter().any(|m| *m),
        Combinator::Not => !results[0],
    };
    outcome
}

fn evaluate_simple(
    field: &str,
    operator: ComparisonOperator,
    expected: &Value,
    data: &Value,
) -> ConditionOutcome {
    let description = format!("{} {} {}", field, operator, display_value(expected));

    let actual = match lookup(data, field) {
        Some(v) if !v.is_null() => v,
        _ => {
            if operator == ComparisonOperator::Exists {
                return ConditionOutcome::fail(format!("{} exists (field missing)", field));
            }
            return ConditionOutcome::fail(format!("{} (field missing)", description));
        }
    };

    match compare(actual, operator, expected) {
        Some(matched) => ConditionOutcome::from_check(
            matched,
            format!("{} (actual: {})", description, display_value(actual)),
        ),
        None => ConditionOutcome::fail(format!(
            "{} (incomparable value: {})",
            description,
            display_value(actual)
        )),
    }
}

/// Compare an actual value against an expected literal.
///
/// Returns `None` when the operands cannot be compared with this operator.
pub fn compare(actual: &Value, operator: ComparisonOperator, expected: &Value) -> Option<bool> {
    use ComparisonOperator::*;

    match operator {
        GreaterThan | GreaterOrEqual | LessThan | LessOrEqual => {
            let a = as_number(actual)?;
            let e = as_number(expected)?;
            Some(operator.compare_f64(a, e))
        }
        Equals => Some(values_equal(actual, expected)),
        NotEquals => Some(!values_equal(actual, expected)),
        Contains => contains(actual, expected),
        NotContains => contains(actual, expected).map(|c| !c),
        In => member_of(actual, expected),
        NotIn => member_of(actual, expected).map(|c| !c),
        StartsWith => {
            let (a, e) = (as_text(actual)?, as_text(expected)?);
            Some(a.to_lowercase().starts_with(&e.to_lowercase()))
        }
        EndsWith => {
            let (a, e) = (as_text(actual)?, as_text(expected)?);
            Some(a.to_lowercase().ends_with(&e.to_lowercase()))
        }
        Exists => Some(true),
    }
}

fn values_equal(actual: &Value, expected: &Value) -> bool {
    if let (Some(a), Some(e)) = (as_number(actual), as_number(expected)) {
        return a == e;
    }
    match (actual, expected) {
        (Value::String(a), Value::String(e)) => a == e,
        _ => actual == expected,
    }
}

fn contains(actual: &Value, expected: &Value) -> Option<bool> {
    match actual {
        Value::String(haystack) => {
            let needle = as_text(expected)?;
            Some(haystack.to_lowercase().contains(&needle.to_lowercase()))
        }
        Value::Array(items) => Some(items.iter().any(|item| loose_eq(item, expected))),
        _ => None,
    }
}

fn member_of(actual: &Value, expected: &Value) -> Option<bool> {
    match expected {
        Value::Array(items) => Some(items.iter().any(|item| loose_eq(actual, item))),
        Value::String(list) => {
            let needle = as_text(actual)?;
            Some(list.to_lowercase().contains(&needle.to_lowercase()))
        }
        _ => None,
    }
}

/// Case-insensitive for strings, numeric for numbers, structural otherwise
fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::String(x), Value::String(y)) => x.eq_ignore_ascii_case(y),
        _ => values_equal(a, b),
    }
}

fn evaluate_percent(
    field: &str,
    operator: PercentOperator,
    threshold: f64,
    timeframe: &Timeframe,
    snapshot: &Snapshot,
) -> ConditionOutcome {
    let description = format!(
        "{} {} {}% over {}",
        field,
        percent_label(operator),
        threshold,
        timeframe
    );

    let (current, past) = match lookback_pair(field, timeframe, snapshot) {
        Ok(pair) => pair,
        Err(reason) => return ConditionOutcome::fail(format!("{} ({})", description, reason)),
    };

    if past == 0.0 {
        return ConditionOutcome::fail(format!("{} (zero baseline)", description));
    }

    let change = (current - past) / past * 100.0;
    ConditionOutcome::from_check(
        operator.holds(change, threshold),
        format!("{} (actual: {:+.2}%)", description, change),
    )
}

fn evaluate_delta(
    field: &str,
    timeframe: &Timeframe,
    operator: ComparisonOperator,
    value: f64,
    snapshot: &Snapshot,
) -> ConditionOutcome {
    let description = format!("{} change over {} {} {}", field, timeframe, operator, value);

    if !operator.is_numeric()
        && !matches!(
            operator,
            ComparisonOperator::Equals | ComparisonOperator::NotEquals
        )
    {
        return ConditionOutcome::fail(format!("{} (operator not numeric)", description));
    }

    match lookback_pair(field, timeframe, snapshot) {
        Ok((current, past)) => {
            let delta = current - past;
            ConditionOutcome::from_check(
                operator.compare_f64(delta, value),
                format!("{} (actual: {:+})", description, delta),
            )
        }
        Err(reason) => ConditionOutcome::fail(format!("{} ({})", description, reason)),
    }
}

/// Current and historical numeric values of `field`, `timeframe` apart
fn lookback_pair(
    field: &str,
    timeframe: &Timeframe,
    snapshot: &Snapshot,
) -> Result<(f64, f64), String> {
    let current = lookup(&snapshot.data, field)
        .ok_or_else(|| "field missing".to_string())
        .and_then(|v| as_number(v).ok_or_else(|| "current value not numeric".to_string()))?;

    let point = closest_point(snapshot, timeframe)
        .ok_or_else(|| format!("no historical data near -{}", timeframe))?;

    let past = lookup(point, field)
        .ok_or_else(|| "field missing in history".to_string())
        .and_then(|v| as_number(v).ok_or_else(|| "historical value not numeric".to_string()))?;

    Ok((current, past))
}

/// Historical point closest to `snapshot.timestamp - timeframe`, within tolerance
fn closest_point<'a>(snapshot: &'a Snapshot, timeframe: &Timeframe) -> Option<&'a Value> {
    let window = timeframe.duration();
    let target = snapshot.timestamp.checked_sub_signed(window)?;
    let tolerance = lookback_tolerance(window);

    snapshot
        .history
        .iter()
        .map(|(ts, data)| (distance(*ts, target), data))
        .filter(|(d, _)| *d <= tolerance)
        .min_by_key(|(d, _)| *d)
        .map(|(_, data)| data)
}

fn lookback_tolerance(window: Duration) -> Duration {
    std::cmp::max(window / 4, Duration::seconds(MIN_LOOKBACK_TOLERANCE_SECS))
}

fn distance(a: DateTime<Utc>, b: DateTime<Utc>) -> Duration {
    let d = a - b;
    if d < Duration::zero() {
        -d
    } else {
        d
    }
}

fn percent_label(operator: PercentOperator) -> &'static str {
    match operator {
        PercentOperator::Increase => "increased by",
        PercentOperator::Decrease => "decreased by",
        PercentOperator::Change => "changed by",
    }
}

/// Resolve a dot-separated path; a literal dotted key at the top level wins
pub fn lookup<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    if let Some(v) = data.as_object().and_then(|m| m.get(path)) {
        return Some(v);
    }

    let mut current = data;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Coerce to a number: JSON numbers and numeric strings
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Render a value for descriptions (strings without quotes)
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
