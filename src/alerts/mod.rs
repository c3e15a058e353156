//! Alert pipeline
//!
//! Alerts flow through deduplication, per-type batching and routing before
//! being fanned out to the registered channels. [`AlertManager`] ties the
//! stages together and publishes [`PipelineEvent`]s along the way.

pub mod batcher;
pub mod dedup;
pub mod events;
pub mod manager;
pub mod model;
pub mod rate_limit;
pub mod router;

pub use batcher::{BatchDecision, BatchOutput, Batcher};
pub use dedup::{DedupResult, DedupStats, Deduplicator};
pub use events::{EventBus, PipelineEvent};
pub use manager::{AlertManager, DeliveryReport, ManagerStats, SendOutcome};
pub use model::{Alert, AlertBatch, AlertPriority, AlertType, NewAlert};
pub use rate_limit::{ChannelLimiter, ChannelRateLimit};
pub use router::{ChannelConfig, RouteDecision, Router, RoutingOperator, RoutingRule};
