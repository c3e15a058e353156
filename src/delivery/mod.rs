//! Delivery tracking
//!
//! Records every (alert, channel) delivery attempt, schedules retries with
//! exponential backoff and aggregates per-channel statistics.

pub mod manager;
pub mod record;

pub use manager::{backoff_delay, ChannelDeliveryStats, DeliveryManager, DeliveryStats};
pub use record::{DeliveryRecord, DeliveryStatus};
