//! Per-channel send quotas backed by `governor`

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;

use governor::clock::{Clock, DefaultClock};
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Rate limit attached to a channel config
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRateLimit {
    #[serde(default)]
    pub max_per_minute: Option<u32>,
    #[serde(default)]
    pub max_per_hour: Option<u32>,
}

impl ChannelRateLimit {
    /// Check if any quota is set
    pub fn is_limited(&self) -> bool {
        self.max_per_minute.is_some() || self.max_per_hour.is_some()
    }
}

type DirectLimiter<C> = RateLimiter<NotKeyed, InMemoryState, C, NoOpMiddleware<<C as Clock>::Instant>>;

/// Quotas for one channel, rebuilt when its limit changes
struct ChannelQuotas<C: Clock> {
    limit: ChannelRateLimit,
    per_minute: Option<DirectLimiter<C>>,
    per_hour: Option<DirectLimiter<C>>,
}

impl<C: Clock> ChannelQuotas<C> {
    fn new(limit: ChannelRateLimit, clock: &C) -> Self {
        let build = |max: Option<u32>, quota: fn(NonZeroU32) -> Quota| {
            max.and_then(NonZeroU32::new)
                .map(|n| RateLimiter::direct_with_clock(quota(n), clock))
        };
        Self {
            limit,
            per_minute: build(limit.max_per_minute, Quota::per_minute),
            per_hour: build(limit.max_per_hour, Quota::per_hour),
        }
    }

    fn check(&self) -> bool {
        if self.limit.max_per_minute == Some(0) || self.limit.max_per_hour == Some(0) {
            return false;
        }
        // hourly first, so a minute slot is not spent on a send the hourly
        // quota rejects
        let hour_ok = self.per_hour.as_ref().map_or(true, |l| l.check().is_ok());
        hour_ok && self.per_minute.as_ref().map_or(true, |l| l.check().is_ok())
    }
}

/// Per-channel send quotas
pub struct ChannelLimiter<C: Clock = DefaultClock> {
    clock: C,
    channels: Mutex<HashMap<String, Arc<ChannelQuotas<C>>>>,
}

impl ChannelLimiter<DefaultClock> {
    pub fn new() -> Self {
        Self::with_clock(DefaultClock::default())
    }
}

impl Default for ChannelLimiter<DefaultClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> ChannelLimiter<C> {
    /// Build a limiter on a specific clock
    pub fn with_clock(clock: C) -> Self {
        Self {
            clock,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Take a send slot if the channel is within its quotas; returns false if over
    pub fn try_acquire(&self, channel_id: &str, limit: &ChannelRateLimit) -> bool {
        if !limit.is_limited() {
            return true;
        }

        let quotas = {
            let mut channels = self.channels.lock();
            let quotas = channels
                .entry(channel_id.to_string())
                .or_insert_with(|| Arc::new(ChannelQuotas::new(*limit, &self.clock)));
            if quotas.limit != *limit {
                *quotas = Arc::new(ChannelQuotas::new(*limit, &self.clock));
            }
            Arc::clone(quotas)
        };
        quotas.check()
    }

    /// Forget a channel's quota state
    pub fn reset(&self, channel_id: &str) {
        self.channels.lock().remove(channel_id);
    }
}
