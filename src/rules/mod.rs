//! Rule engine for condition-based triggers
//!
//! Rules hold a condition tree plus delivery metadata. The engine evaluates
//! enabled rules against data snapshots and enforces per-subject cooldowns
//! and per-rule hourly caps.

pub mod engine;
pub mod evaluator;
pub mod model;
pub mod store;

pub use engine::{ImportReport, RuleEngine, RuleEngineStats, RuleError};
pub use evaluator::ConditionOutcome;
pub use model::{
    Combinator, ComparisonOperator, Condition, EvaluationResult, NewRule, PercentOperator, Rule,
    RuleFilter, RulePriority, RuleUpdate, Snapshot, Timeframe,
};
pub use store::{RuleStore, Suppression};
