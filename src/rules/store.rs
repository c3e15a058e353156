//! Rule storage and per-rule trigger history

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};

use super::model::Rule;

/// Trigger history kept per rule, measured back from the newest trigger
const HOURLY_RETENTION_HOURS: i64 = 2;

/// Minimum snapshot time between sweeps of expired cooldowns
const COOLDOWN_SWEEP_SECS: i64 = 60;

/// Why a rule was held back from evaluation
#[derive(Debug, Clone, PartialEq)]
pub enum Suppression {
    /// Cooldown for this subject still running
    Cooldown { remaining_secs: i64 },
    /// Hourly trigger cap reached
    HourlyCap { count: usize, max: u32 },
}

/// Keyed rule collection plus cooldown and hourly trigger state
#[derive(Debug, Default)]
pub struct RuleStore {
    rules: HashMap<String, Rule>,
    /// Last trigger per (rule_id, subject)
    cooldowns: HashMap<(String, String), DateTime<Utc>>,
    /// Sorted trigger timestamps per rule
    hourly: HashMap<String, VecDeque<DateTime<Utc>>>,
    last_sweep: Option<DateTime<Utc>>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a rule, returning the previous version
    pub fn insert(&mut self, rule: Rule) -> Option<Rule> {
        self.rules.insert(rule.id.clone(), rule)
    }

    /// Get a rule by ID
    pub fn get(&self, id: &str) -> Option<&Rule> {
        self.rules.get(id)
    }

    /// Get a mutable rule by ID
    pub fn get_mut(&mut self, id: &str) -> Option<&mut Rule> {
        self.rules.get_mut(id)
    }

    /// Check if a rule exists
    pub fn contains(&self, id: &str) -> bool {
        self.rules.contains_key(id)
    }

    /// Remove a rule together with its trigger history
    pub fn remove(&mut self, id: &str) -> Option<Rule> {
        let removed = self.rules.remove(id)?;
        self.purge_history(id);
        Some(removed)
    }

    /// Drop cooldowns and hourly history for a rule
    pub fn purge_history(&mut self, id: &str) {
        self.cooldowns.retain(|(rule_id, _), _| rule_id != id);
        self.hourly.remove(id);
    }

    /// Iterate over all rules
    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.values()
    }

    /// IDs of enabled rules
    pub fn enabled_ids(&self) -> Vec<String> {
        self.rules
            .values()
            .filter(|r| r.enabled)
            .map(|r| r.id.clone())
            .collect()
    }

    /// Number of rules
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Check if the store holds no rules
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Check cooldown and hourly cap for a rule and subject at `now`
    pub fn check_suppression(
        &mut self,
        rule: &Rule,
        subject: &str,
        now: DateTime<Utc>,
    ) -> Option<Suppression> {
        let key = (rule.id.clone(), subject.to_string());
        if let Some(last) = self.cooldowns.get(&key) {
            let elapsed = now - *last;
            let cooldown = Duration::seconds(rule.cooldown_seconds);
            if elapsed < cooldown {
                return Some(Suppression::Cooldown {
                    remaining_secs: (cooldown - elapsed).num_seconds(),
                });
            }
        }

        let count = self.hourly_count(&rule.id, now);
        if count >= rule.max_alerts_per_hour as usize {
            return Some(Suppression::HourlyCap {
                count,
                max: rule.max_alerts_per_hour,
            });
        }

        None
    }

    /// Most triggers in any hour-long window that a trigger at `now` would
    /// fall into. Timestamps may arrive out of order, so windows ending after
    /// `now` are counted too.
    pub fn hourly_count(&mut self, rule_id: &str, now: DateTime<Utc>) -> usize {
        let Some(window) = self.hourly.get_mut(rule_id) else {
            return 0;
        };
        prune_hourly(window);

        let hour = Duration::hours(1);
        let count_ending_at = |end: DateTime<Utc>| {
            window
                .iter()
                .filter(|ts| **ts > end - hour && **ts <= end)
                .count()
        };

        window
            .iter()
            .filter(|ts| **ts > now && **ts < now + hour)
            .map(|ts| count_ending_at(*ts))
            .fold(count_ending_at(now), usize::max)
    }

    /// Record a trigger: cooldown, hourly window and rule counters
    pub fn record_trigger(&mut self, rule_id: &str, subject: &str, now: DateTime<Utc>) {
        self.cooldowns
            .insert((rule_id.to_string(), subject.to_string()), now);

        let window = self.hourly.entry(rule_id.to_string()).or_default();
        let pos = window.partition_point(|ts| *ts <= now);
        window.insert(pos, now);
        prune_hourly(window);

        if let Some(rule) = self.rules.get_mut(rule_id) {
            rule.trigger_count += 1;
            rule.last_triggered = Some(now);
        }

        let due = self
            .last_sweep
            .map_or(true, |last| now - last >= Duration::seconds(COOLDOWN_SWEEP_SECS));
        if due {
            self.sweep_cooldowns(now);
        }
    }

    /// Remove cooldown entries whose cooldown has run out at `now`; returns
    /// how many were removed
    pub fn sweep_cooldowns(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.cooldowns.len();
        let rules = &self.rules;
        self.cooldowns.retain(|(rule_id, _), last| match rules.get(rule_id) {
            Some(rule) => now - *last < Duration::seconds(rule.cooldown_seconds),
            None => false,
        });
        self.last_sweep = Some(now);
        before - self.cooldowns.len()
    }

    /// Number of (rule, subject) cooldown entries
    pub fn cooldown_entries(&self) -> usize {
        self.cooldowns.len()
    }
}

/// Keep triggers within the retention span of the newest one
fn prune_hourly(window: &mut VecDeque<DateTime<Utc>>) {
    let Some(newest) = window.back().copied() else {
        return;
    };
    let cutoff = newest - Duration::hours(HOURLY_RETENTION_HOURS);
    while window.front().is_some_and(|ts| *ts <= cutoff) {
        window.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::model::{ComparisonOperator, Condition, RulePriority};
    use serde_json::json;

    fn make_rule(id: &str, cooldown: i64, max_per_hour: u32) -> Rule {
        let now = Utc::now();
        Rule {
            id: id.to_string(),
            name: id.to_string(),
            description: None,
            enabled: true,
            condition: Condition::simple("x", ComparisonOperator::GreaterThan, json!(0)),
            priority: RulePriority::Medium,
            channels: vec!["log".to_string()],
            message: None,
            cooldown_seconds: cooldown,
            max_alerts_per_hour: max_per_hour,
            created_at: now,
            updated_at: now,
            last_triggered: None,
            trigger_count: 0,
            tags: vec![],
            metadata: Default::default(),
        }
    }

    #[test]
    fn test_cooldown_per_subject() {
        let mut store = RuleStore::new();
        let rule = make_rule("r1", 300, 100);
        store.insert(rule.clone());
        let now = Utc::now();

        store.record_trigger("r1", "mint-a", now);
        let later = now + Duration::seconds(10);
        assert!(matches!(
            store.check_suppression(&rule, "mint-a", later),
            Some(Suppression::Cooldown { .. })
        ));
        assert_eq!(store.check_suppression(&rule, "mint-b", later), None);
        assert_eq!(
            store.check_suppression(&rule, "mint-a", now + Duration::seconds(300)),
            None
        );
    }

    #[test]
    fn test_hourly_window_prunes() {
        let mut store = RuleStore::new();
        let rule = make_rule("r1", 0, 2);
        store.insert(rule.clone());
        let start = Utc::now();

        store.record_trigger("r1", "a", start);
        store.record_trigger("r1", "b", start + Duration::minutes(10));
        assert!(matches!(
            store.check_suppression(&rule, "c", start + Duration::minutes(20)),
            Some(Suppression::HourlyCap { count: 2, max: 2 })
        ));

        // first trigger falls out of the trailing hour
        assert_eq!(store.hourly_count("r1", start + Duration::minutes(61)), 1);
        assert_eq!(store.check_suppression(&rule, "c", start + Duration::minutes(61)), None);
    }

    #[test]
    fn test_record_trigger_updates_rule() {
        let mut store = RuleStore::new();
        store.insert(make_rule("r1", 0, 10));
        let now = Utc::now();
        store.record_trigger("r1", "a", now);

        let rule = store.get("r1").unwrap();
        assert_eq!(rule.trigger_count, 1);
        assert_eq!(rule.last_triggered, Some(now));
    }

    #[test]
    fn test_remove_purges_history() {
        let mut store = RuleStore::new();
        store.insert(make_rule("r1", 300, 10));
        store.insert(make_rule("r2", 300, 10));
        let now = Utc::now();
        store.record_trigger("r1", "a", now);
        store.record_trigger("r2", "a", now);

        assert!(store.remove("r1").is_some());
        assert_eq!(store.cooldown_entries(), 1);
        assert_eq!(store.hourly_count("r1", now), 0);
        assert!(store.remove("r1").is_none());
    }

    #[test]
    fn test_hourly_cap_holds_for_out_of_order_triggers() {
        let mut store = RuleStore::new();
        let rule = make_rule("r1", 0, 2);
        store.insert(rule.clone());
        let t0 = Utc::now();

        let mut matched = Vec::new();
        for offset in [0, 0, 61, 30] {
            let at = t0 + Duration::minutes(offset);
            if store.check_suppression(&rule, "s", at).is_none() {
                store.record_trigger("r1", "s", at);
                matched.push(at);
            }
        }

        // the late t0+30m snapshot shares an hour with both t0 triggers
        assert_eq!(matched.len(), 3);
        assert!(!matched.contains(&(t0 + Duration::minutes(30))));
        for end in &matched {
            let in_hour = matched
                .iter()
                .filter(|ts| **ts > *end - Duration::hours(1) && *ts <= end)
                .count();
            assert!(in_hour <= 2);
        }
    }

    #[test]
    fn test_late_trigger_counts_against_later_window() {
        let mut store = RuleStore::new();
        let rule = make_rule("r1", 0, 2);
        store.insert(rule.clone());
        let t0 = Utc::now();

        store.record_trigger("r1", "a", t0 + Duration::minutes(40));
        store.record_trigger("r1", "b", t0 + Duration::minutes(50));
        // an hour ending at t0+40m or t0+50m would hold three triggers
        assert!(matches!(
            store.check_suppression(&rule, "c", t0 + Duration::minutes(10)),
            Some(Suppression::HourlyCap { count: 2, max: 2 })
        ));
        assert_eq!(store.check_suppression(&rule, "c", t0 - Duration::minutes(30)), None);
    }

    #[test]
    fn test_expired_cooldowns_are_swept() {
        let mut store = RuleStore::new();
        store.insert(make_rule("r1", 60, 1000));
        let start = Utc::now();

        for i in 0..50 {
            store.record_trigger("r1", &format!("mint-{}", i), start);
        }
        assert_eq!(store.cooldown_entries(), 50);

        // the next trigger after the cooldown sweeps the expired subjects
        store.record_trigger("r1", "mint-new", start + Duration::seconds(120));
        assert_eq!(store.cooldown_entries(), 1);

        store.record_trigger("r1", "mint-other", start + Duration::seconds(130));
        assert_eq!(store.sweep_cooldowns(start + Duration::seconds(185)), 1);
        assert_eq!(store.cooldown_entries(), 1);
    }
}
