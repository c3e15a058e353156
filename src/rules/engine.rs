//! Rule engine: CRUD over the rule store and snapshot evaluation

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use super::evaluator;
use super::model::{Condition, EvaluationResult, NewRule, Rule, RuleFilter, RuleUpdate, Snapshot};
use super::store::RuleStore;
use crate::id::next_id;

/// Stores rules and evaluates them against snapshots
pub struct RuleEngine {
    store: RwLock<RuleStore>,
}

impl RuleEngine {
    pub fn new() -> Self {
        Self {
            store: RwLock::new(RuleStore::new()),
        }
    }

    /// Create a rule; ID and timestamps are generated here
    pub fn create_rule(&self, new_rule: NewRule) -> Result<Rule, RuleError> {
        let now = Utc::now();
        let rule = Rule {
            id: next_id("rule"),
            name: new_rule.name.trim().to_string(),
            description: new_rule.description,
            enabled: new_rule.enabled,
            condition: new_rule.condition,
            priority: new_rule.priority,
            channels: new_rule.channels,
            message: new_rule.message,
            cooldown_seconds: new_rule.cooldown_seconds,
            max_alerts_per_hour: new_rule.max_alerts_per_hour,
            created_at: now,
            updated_at: now,
            last_triggered: None,
            trigger_count: 0,
            tags: new_rule.tags,
            metadata: new_rule.metadata,
        };
        validate_rule(&rule)?;

        tracing::info!(rule_id = %rule.id, rule_name = %rule.name, "Rule created");
        self.store.write().insert(rule.clone());
        Ok(rule)
    }

    /// Apply a partial update; the stored rule is untouched if validation fails
    pub fn update_rule(&self, id: &str, update: RuleUpdate) -> Result<Rule, RuleError> {
        let mut store = self.store.write();
        let current = store
            .get(id)
            .ok_or_else(|| RuleError::NotFound(id.to_string()))?;

        let mut rule = current.clone();
        if let Some(name) = update.name {
            rule.name = name.trim().to_string();
        }
        if let Some(description) = update.description {
            rule.description = Some(description);
        }
        if let Some(enabled) = update.enabled {
            rule.enabled = enabled;
        }
        if let Some(condition) = update.condition {
            rule.condition = condition;
        }
        if let Some(priority) = update.priority {
            rule.priority = priority;
        }
        if let Some(channels) = update.channels {
            rule.channels = channels;
        }
        if let Some(message) = update.message {
            rule.message = Some(message);
        }
        if let Some(cooldown) = update.cooldown_seconds {
            rule.cooldown_seconds = cooldown;
        }
        if let Some(max) = update.max_alerts_per_hour {
            rule.max_alerts_per_hour = max;
        }
        if let Some(tags) = update.tags {
            rule.tags = tags;
        }
        if let Some(metadata) = update.metadata {
            rule.metadata = metadata;
        }
        validate_rule(&rule)?;

        rule.updated_at = Utc::now();
        store.insert(rule.clone());
        tracing::debug!(rule_id = %id, "Rule updated");
        Ok(rule)
    }

    /// Delete a rule and its cooldown / rate-limit state
    pub fn delete_rule(&self, id: &str) -> Result<Rule, RuleError> {
        let removed = self
            .store
            .write()
            .remove(id)
            .ok_or_else(|| RuleError::NotFound(id.to_string()))?;
        tracing::info!(rule_id = %id, "Rule deleted");
        Ok(removed)
    }

    /// Get a rule by ID
    pub fn get_rule(&self, id: &str) -> Option<Rule> {
        self.store.read().get(id).cloned()
    }

    /// List rules matching a filter, oldest first
    pub fn list_rules(&self, filter: &RuleFilter) -> Vec<Rule> {
        let mut rules: Vec<Rule> = self
            .store
            .read()
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        rules.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        rules
    }

    /// Flip the enabled flag; returns the new state
    pub fn toggle_rule(&self, id: &str) -> Result<bool, RuleError> {
        let mut store = self.store.write();
        let rule = store
            .get_mut(id)
            .ok_or_else(|| RuleError::NotFound(id.to_string()))?;
        rule.enabled = !rule.enabled;
        rule.updated_at = Utc::now();
        tracing::info!(rule_id = %id, enabled = rule.enabled, "Rule toggled");
        Ok(rule.enabled)
    }

    /// Evaluate all enabled rules; returns one result per matched rule.
    ///
    /// The snapshot timestamp is the reference time for cooldowns, hourly
    /// caps and historical lookups.
    pub fn evaluate(&self, snapshot: &Snapshot) -> Vec<EvaluationResult> {
        let now = snapshot.timestamp;
        let mut store = self.store.write();
        let mut results = Vec::new();

        for rule_id in store.enabled_ids() {
            let Some(rule) = store.get(&rule_id).cloned() else {
                continue;
            };

            if let Some(reason) = store.check_suppression(&rule, &snapshot.subject, now) {
                tracing::debug!(
                    rule_id = %rule.id,
                    subject = %snapshot.subject,
                    reason = ?reason,
                    "Rule suppressed"
                );
                continue;
            }

            let outcome = evaluator::evaluate(&rule.condition, snapshot);
            if !outcome.matched {
                continue;
            }

            store.record_trigger(&rule.id, &snapshot.subject, now);
            tracing::info!(
                rule_id = %rule.id,
                rule_name = %rule.name,
                subject = %snapshot.subject,
                "Rule matched"
            );

            results.push(EvaluationResult {
                rule_id: rule.id,
                rule_name: rule.name,
                subject: snapshot.subject.clone(),
                matched: true,
                matched_conditions: outcome.matched_conditions,
                failed_conditions: outcome.failed_conditions,
                timestamp: now,
            });
        }

        results
    }

    /// Evaluate one rule without touching cooldowns or counters
    pub fn evaluate_rule(&self, id: &str, snapshot: &Snapshot) -> Result<EvaluationResult, RuleError> {
        let rule = self
            .get_rule(id)
            .ok_or_else(|| RuleError::NotFound(id.to_string()))?;
        let outcome = evaluator::evaluate(&rule.condition, snapshot);

        Ok(EvaluationResult {
            rule_id: rule.id,
            rule_name: rule.name,
            subject: snapshot.subject.clone(),
            matched: outcome.matched,
            matched_conditions: outcome.matched_conditions,
            failed_conditions: outcome.failed_conditions,
            timestamp: snapshot.timestamp,
        })
    }

    /// All rules, oldest first, for external persistence
    pub fn export_rules(&self) -> Vec<Rule> {
        self.list_rules(&RuleFilter::default())
    }

    /// Import rules as-is (IDs preserved); invalid rules are skipped
    pub fn import_rules(&self, rules: Vec<Rule>) -> ImportReport {
        let mut report = ImportReport::default();
        let mut store = self.store.write();

        for rule in rules {
            match validate_rule(&rule) {
                Ok(()) => {
                    if store.insert(rule).is_some() {
                        report.replaced += 1;
                    }
                    report.imported += 1;
                }
                Err(e) => {
                    tracing::warn!(rule_id = %rule.id, error = %e, "Skipping invalid rule");
                    report.skipped.push((rule.id, e.to_string()));
                }
            }
        }

        report
    }

    /// Export all rules as pretty JSON
    pub fn export_json(&self) -> Result<String, RuleError> {
        serde_json::to_string_pretty(&self.export_rules())
            .map_err(|e| RuleError::Serialization(e.to_string()))
    }

    /// Import rules from a JSON array
    pub fn import_json(&self, json: &str) -> Result<ImportReport, RuleError> {
        let rules: Vec<Rule> =
            serde_json::from_str(json).map_err(|e| RuleError::Serialization(e.to_string()))?;
        Ok(self.import_rules(rules))
    }

    /// Get rule engine statistics
    pub fn stats(&self) -> RuleEngineStats {
        let store = self.store.read();
        RuleEngineStats {
            total_rules: store.len(),
            enabled_rules: store.iter().filter(|r| r.enabled).count(),
            total_triggers: store.iter().map(|r| r.trigger_count).sum(),
            active_cooldowns: store.cooldown_entries(),
        }
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Reject rules that break the rule invariants
pub fn validate_rule(rule: &Rule) -> Result<(), RuleError> {
    if rule.name.trim().is_empty() {
        return Err(RuleError::Validation("rule name must not be empty".into()));
    }
    if rule.channels.is_empty() || rule.channels.iter().any(|c| c.trim().is_empty()) {
        return Err(RuleError::Validation(
            "rule must target at least one channel".into(),
        ));
    }
    if rule.cooldown_seconds < 0 {
        return Err(RuleError::Validation(format!(
            "cooldown must be non-negative, got {}",
            rule.cooldown_seconds
        )));
    }
    if rule.max_alerts_per_hour < 1 {
        return Err(RuleError::Validation(
            "max alerts per hour must be at least 1".into(),
        ));
    }
    validate_condition(&rule.condition)
}

fn validate_condition(condition: &Condition) -> Result<(), RuleError> {
    match condition {
        Condition::Simple { field, .. }
        | Condition::Percent { field, .. }
        | Condition::TimeframeDelta { field, .. } => {
            if field.trim().is_empty() {
                return Err(RuleError::Validation("condition field must not be empty".into()));
            }
            Ok(())
        }
        Condition::Composite { conditions, .. } => {
            if conditions.is_empty() {
                return Err(RuleError::Validation(
                    "composite condition needs at least one child".into(),
                ));
            }
            conditions.iter().try_for_each(validate_condition)
        }
    }
}

/// Outcome of an import
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub imported: usize,
    /// Imported rules that replaced an existing ID
    pub replaced: usize,
    /// (rule id, reason)
    pub skipped: Vec<(String, String)>,
}

/// Rule engine statistics
#[derive(Debug, Clone, Serialize)]
pub struct RuleEngineStats {
    pub total_rules: usize,
    pub enabled_rules: usize,
    pub total_triggers: u64,
    pub active_cooldowns: usize,
}

/// Rule engine errors
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("Rule not found: {0}")]
    NotFound(String),

    #[error("Invalid rule: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}
