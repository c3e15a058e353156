//! Pipeline configuration
//!
//! Every option has a default. Configuration can be read from a JSON file
//! and overridden through `TRIPWIRE_*` environment variables.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::alerts::model::AlertType;

/// Top-level configuration for the alert pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub dedup: DedupConfig,
    pub batch: BatchConfig,
    pub retry: RetryConfig,
    pub delivery: DeliveryConfig,
    pub dispatcher: DispatcherConfig,
    pub events: EventsConfig,
}

/// Deduplication hashing mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupAlgorithm {
    /// Hash the whole alert content
    Exact,
    /// Hash the composite dedup key
    #[default]
    Hash,
    /// Hash a normalized form of the composite key
    Fuzzy,
}

impl DedupAlgorithm {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "exact" => Some(DedupAlgorithm::Exact),
            "hash" => Some(DedupAlgorithm::Hash),
            "fuzzy" => Some(DedupAlgorithm::Fuzzy),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub enabled: bool,
    pub window_ms: u64,
    pub algorithm: DedupAlgorithm,
    /// Interval of the background sweep
    pub sweep_interval_ms: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: 5 * 60 * 1000,
            algorithm: DedupAlgorithm::Hash,
            sweep_interval_ms: 60 * 1000,
        }
    }
}

impl DedupConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// What happens to a buffer holding fewer than `min_size` alerts at flush time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UndersizedPolicy {
    /// Hand the alerts back for individual delivery
    #[default]
    Deliver,
    /// Discard them
    Drop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub enabled: bool,
    pub window_ms: u64,
    pub max_size: usize,
    pub min_size: usize,
    /// Alert types eligible for batching
    pub types: Vec<AlertType>,
    pub undersized: UndersizedPolicy,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: 60 * 1000,
            max_size: 10,
            min_size: 3,
            types: vec![
                AlertType::TokenDiscovery,
                AlertType::WhaleActivity,
                AlertType::VolumeSpike,
            ],
            undersized: UndersizedPolicy::Deliver,
        }
    }
}

impl BatchConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub enabled: bool,
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// How often the retry worker looks for due deliveries
    pub check_interval_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 60 * 1000,
            backoff_multiplier: 2.0,
            check_interval_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Terminal records older than this are purged by cleanup
    pub retention_ms: u64,
    /// Rolling latency samples kept for statistics
    pub latency_samples: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            retention_ms: 60 * 60 * 1000,
            latency_samples: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Window of the per rule and subject suppression
    pub dedup_window_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            dedup_window_ms: 5 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Buffered events per subscriber before lagging
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

impl PipelineConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        let config: Self =
            serde_json::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `TRIPWIRE_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides from any key lookup (environment, tests)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("TRIPWIRE_DEDUP_ENABLED") {
            self.dedup.enabled = parse_bool("TRIPWIRE_DEDUP_ENABLED", &v)?;
        }
        if let Some(v) = lookup("TRIPWIRE_DEDUP_WINDOW_MS") {
            self.dedup.window_ms = parse_num("TRIPWIRE_DEDUP_WINDOW_MS", &v)?;
        }
        if let Some(v) = lookup("TRIPWIRE_DEDUP_ALGORITHM") {
            self.dedup.algorithm = DedupAlgorithm::parse(&v)
                .ok_or_else(|| ConfigError::invalid("TRIPWIRE_DEDUP_ALGORITHM", &v))?;
        }
        if let Some(v) = lookup("TRIPWIRE_BATCH_ENABLED") {
            self.batch.enabled = parse_bool("TRIPWIRE_BATCH_ENABLED", &v)?;
        }
        if let Some(v) = lookup("TRIPWIRE_BATCH_WINDOW_MS") {
            self.batch.window_ms = parse_num("TRIPWIRE_BATCH_WINDOW_MS", &v)?;
        }
        if let Some(v) = lookup("TRIPWIRE_BATCH_MAX_SIZE") {
            self.batch.max_size = parse_num("TRIPWIRE_BATCH_MAX_SIZE", &v)?;
        }
        if let Some(v) = lookup("TRIPWIRE_BATCH_MIN_SIZE") {
            self.batch.min_size = parse_num("TRIPWIRE_BATCH_MIN_SIZE", &v)?;
        }
        if let Some(v) = lookup("TRIPWIRE_BATCH_TYPES") {
            self.batch.types = v
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(|s| AlertType::parse(s).ok_or_else(|| ConfigError::invalid("TRIPWIRE_BATCH_TYPES", s)))
                .collect::<Result<_, _>>()?;
        }
        if let Some(v) = lookup("TRIPWIRE_RETRY_ENABLED") {
            self.retry.enabled = parse_bool("TRIPWIRE_RETRY_ENABLED", &v)?;
        }
        if let Some(v) = lookup("TRIPWIRE_RETRY_MAX") {
            self.retry.max_retries = parse_num("TRIPWIRE_RETRY_MAX", &v)?;
        }
        if let Some(v) = lookup("TRIPWIRE_RETRY_INITIAL_DELAY_MS") {
            self.retry.initial_delay_ms = parse_num("TRIPWIRE_RETRY_INITIAL_DELAY_MS", &v)?;
        }
        if let Some(v) = lookup("TRIPWIRE_RETRY_MAX_DELAY_MS") {
            self.retry.max_delay_ms = parse_num("TRIPWIRE_RETRY_MAX_DELAY_MS", &v)?;
        }
        if let Some(v) = lookup("TRIPWIRE_RETRY_MULTIPLIER") {
            self.retry.backoff_multiplier = parse_num("TRIPWIRE_RETRY_MULTIPLIER", &v)?;
        }
        if let Some(v) = lookup("TRIPWIRE_DISPATCH_DEDUP_WINDOW_MS") {
            self.dispatcher.dedup_window_ms = parse_num("TRIPWIRE_DISPATCH_DEDUP_WINDOW_MS", &v)?;
        }
        self.validate()
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch.min_size > self.batch.max_size {
            return Err(ConfigError::Invalid(format!(
                "batch.min_size ({}) exceeds batch.max_size ({})",
                self.batch.min_size, self.batch.max_size
            )));
        }
        if self.batch.max_size == 0 {
            return Err(ConfigError::Invalid("batch.max_size must be positive".into()));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "retry.backoff_multiplier must be at least 1.0".into(),
            ));
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::invalid(key, value)),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::invalid(key, value))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl ConfigError {
    fn invalid(key: &str, value: &str) -> Self {
        ConfigError::Invalid(format!("{}={}", key, value))
    }
}
