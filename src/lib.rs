//! Tripwire: rule-triggered alert pipeline
//!
//! Data snapshots are evaluated against user-defined rules; matches become
//! alerts that are deduplicated, batched, routed and delivered to pluggable
//! channels with retry tracking.
//!
//! # Features
//!
//! - **Condition Trees**: simple, percent-change, timeframe-delta and AND/OR/NOT conditions
//! - **Cooldowns**: per rule and subject, plus a per rule hourly cap
//! - **Deduplication**: sliding window over exact, composite-key or fuzzy hashes
//! - **Batching**: per-type time windows with size-triggered early flush
//! - **Routing**: field rules per channel with priority-based defaults
//! - **Delivery Tracking**: exponential backoff retries and per-channel stats
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use tripwire::alerts::AlertManager;
//! use tripwire::channels::LogChannel;
//! use tripwire::config::PipelineConfig;
//! use tripwire::dispatcher::Dispatcher;
//! use tripwire::rules::{ComparisonOperator, Condition, NewRule, RuleEngine, Snapshot};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PipelineConfig::default();
//! let engine = Arc::new(RuleEngine::new());
//! let manager = Arc::new(AlertManager::new(config.clone()));
//! manager.register_channel(Arc::new(LogChannel::default()), None);
//! manager.start();
//!
//! engine.create_rule(
//!     NewRule::new(
//!         "Deep pool",
//!         Condition::simple("liquidity", ComparisonOperator::GreaterOrEqual, json!(50000)),
//!     )
//!     .with_channel("log"),
//! )?;
//!
//! let dispatcher = Dispatcher::new(engine, manager.clone(), config.dispatcher);
//! let report = dispatcher
//!     .process(&Snapshot::new("mint123", json!({"liquidity": 75000})))
//!     .await;
//! println!("Matched {} rules", report.matched);
//!
//! manager.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod alerts;
pub mod channels;
pub mod config;
pub mod delivery;
pub mod dispatcher;
pub mod id;
pub mod rules;

// Re-export commonly used types
pub use alerts::{Alert, AlertManager, AlertPriority, AlertType, NewAlert};
pub use channels::{Channel, ChannelError, DeliveryResult};
pub use config::{ConfigError, PipelineConfig};
pub use dispatcher::{DispatchError, Dispatcher};
pub use rules::{Rule, RuleEngine, RuleError, Snapshot};
