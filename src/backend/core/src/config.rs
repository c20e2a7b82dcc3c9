//! Configuration management.
//!
//! Values come from an optional file plus `RIPPLE__`-prefixed environment
//! variables, e.g. `RIPPLE__STORE__RING_CAPACITY=4096` or
//! `RIPPLE__AGGREGATOR__TIMEOUT=250ms`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, RippleError};
use crate::stream::{ProducerType, WaitStrategy, WaitStrategyKind};
use crate::telemetry::{LoggingConfig, MetricsConfig};

const ENV_PREFIX: &str = "RIPPLE";

/// Longest accepted aggregation timeout; claim deadlines are computed by
/// adding it to an `Instant`.
pub const MAX_AGGREGATION_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RippleConfig {
    /// Event store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Demux aggregator configuration
    #[serde(default)]
    pub aggregator: AggregatorConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store name, used for thread names and metric labels
    #[serde(default = "default_store_name")]
    pub name: String,

    /// Primary stream capacity (power of two)
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,

    /// Whether several threads publish concurrently
    #[serde(default)]
    pub producer_type: ProducerType,

    /// How idle consumers wait for new events
    #[serde(default)]
    pub wait_strategy: WaitStrategyKind,

    /// Upper bound of one consumer wait; also the timeout-check period
    #[serde(default = "default_wait_timeout", with = "humantime_serde")]
    pub wait_timeout: Duration,

    /// Maximum number of cached per-context streams
    #[serde(default = "default_context_capacity")]
    pub context_capacity: usize,

    /// Capacity of each per-context stream (power of two)
    #[serde(default = "default_context_stream_capacity")]
    pub context_stream_capacity: usize,

    /// Local history depth kept by history handlers
    #[serde(default = "default_history_length")]
    pub history_length: usize,

    /// How long `stop` waits for handlers to drain
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Envelopes a republishing handler may hold back while the ring is full
    #[serde(default = "default_republish_backlog")]
    pub republish_backlog: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: default_store_name(),
            ring_capacity: default_ring_capacity(),
            producer_type: ProducerType::default(),
            wait_strategy: WaitStrategyKind::default(),
            wait_timeout: default_wait_timeout(),
            context_capacity: default_context_capacity(),
            context_stream_capacity: default_context_stream_capacity(),
            history_length: default_history_length(),
            shutdown_timeout: default_shutdown_timeout(),
            republish_backlog: default_republish_backlog(),
        }
    }
}

impl StoreConfig {
    pub fn wait(&self) -> WaitStrategy {
        WaitStrategy::new(self.wait_strategy, self.wait_timeout)
    }

    pub fn validate(&self) -> Result<()> {
        if !is_power_of_two(self.ring_capacity) {
            return Err(RippleError::invalid_capacity("Ring", self.ring_capacity));
        }
        if !is_power_of_two(self.context_stream_capacity) {
            return Err(RippleError::invalid_capacity(
                "Context stream",
                self.context_stream_capacity,
            ));
        }
        if self.context_capacity == 0 {
            return Err(RippleError::configuration("context_capacity must be at least 1"));
        }
        if self.history_length == 0 {
            return Err(RippleError::configuration("history_length must be at least 1"));
        }
        if self.wait_timeout.is_zero() {
            return Err(RippleError::configuration("wait_timeout must be non-zero"));
        }
        if self.republish_backlog == 0 {
            return Err(RippleError::configuration("republish_backlog must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Number of aggregation workers, i.e. keys in flight at once
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Events per complete aggregate
    #[serde(default = "default_group_size")]
    pub group_size: usize,

    /// Time from claim after which a key is published as partial
    #[serde(default = "default_aggregation_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Number of recently claimed keys remembered for duplicate detection
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,

    /// Context written on published aggregates
    #[serde(default = "default_output_context")]
    pub output_context: String,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            group_size: default_group_size(),
            timeout: default_aggregation_timeout(),
            dedup_capacity: default_dedup_capacity(),
            output_context: default_output_context(),
        }
    }
}

impl AggregatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(RippleError::configuration("aggregator.workers must be at least 1"));
        }
        if self.group_size == 0 {
            return Err(RippleError::configuration("aggregator.group_size must be at least 1"));
        }
        if self.timeout.is_zero() {
            return Err(RippleError::configuration("aggregator.timeout must be non-zero"));
        }
        if self.timeout > MAX_AGGREGATION_TIMEOUT {
            return Err(RippleError::configuration(format!(
                "aggregator.timeout ({:?}) exceeds {:?}",
                self.timeout, MAX_AGGREGATION_TIMEOUT
            )));
        }
        if self.dedup_capacity < self.workers {
            return Err(RippleError::configuration(format!(
                "aggregator.dedup_capacity ({}) must be at least the worker count ({})",
                self.dedup_capacity, self.workers
            )));
        }
        Ok(())
    }
}

// Default value functions
fn default_store_name() -> String { "ripple".to_string() }
fn default_ring_capacity() -> usize { 1024 }
fn default_wait_timeout() -> Duration { Duration::from_millis(20) }
fn default_context_capacity() -> usize { 64 }
fn default_context_stream_capacity() -> usize { 256 }
fn default_history_length() -> usize { 16 }
fn default_shutdown_timeout() -> Duration { Duration::from_secs(2) }
fn default_republish_backlog() -> usize { 1024 }
fn default_workers() -> usize { 8 }
fn default_group_size() -> usize { 3 }
fn default_aggregation_timeout() -> Duration { Duration::from_millis(500) }
fn default_dedup_capacity() -> usize { 4096 }
fn default_output_context() -> String { "aggregate".to_string() }

fn is_power_of_two(n: usize) -> bool {
    n != 0 && n.is_power_of_two()
}

impl RippleConfig {
    /// Load configuration from the environment.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let cfg: RippleConfig = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let cfg: RippleConfig = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        self.store.validate()?;
        self.aggregator.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = RippleConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.store.ring_capacity, 1024);
        assert_eq!(config.store.wait(), WaitStrategy::blocking(Duration::from_millis(20)));
        assert_eq!(config.aggregator.workers, 8);
        assert_eq!(config.aggregator.timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut store = StoreConfig::default();
        store.ring_capacity = 1000;
        assert_eq!(store.validate().unwrap_err().code(), ErrorCode::InvalidCapacity);

        let mut aggregator = AggregatorConfig::default();
        aggregator.workers = 0;
        assert!(aggregator.validate().is_err());

        let mut aggregator = AggregatorConfig::default();
        aggregator.dedup_capacity = 2;
        assert!(aggregator.validate().unwrap_err().message().contains("dedup_capacity"));

        let mut store = StoreConfig::default();
        store.republish_backlog = 0;
        assert!(store.validate().is_err());
    }

    #[test]
    fn test_huge_timeout_rejected() {
        let mut aggregator = AggregatorConfig::default();
        aggregator.timeout = MAX_AGGREGATION_TIMEOUT;
        assert!(aggregator.validate().is_ok());

        aggregator.timeout = Duration::from_secs(u64::MAX);
        let err = aggregator.validate().unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidConfiguration);
        assert!(err.message().contains("aggregator.timeout"));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[store]
ring_capacity = 64
producer_type = "single"
wait_strategy = "yielding"
wait_timeout = "5ms"

[aggregator]
workers = 2
timeout = "150ms"
"#
        )
        .unwrap();

        let config = RippleConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.store.ring_capacity, 64);
        assert_eq!(config.store.producer_type, ProducerType::Single);
        assert_eq!(config.store.wait(), WaitStrategy::yielding(Duration::from_millis(5)));
        assert_eq!(config.aggregator.workers, 2);
        assert_eq!(config.aggregator.timeout, Duration::from_millis(150));
        assert_eq!(config.aggregator.group_size, 3);
    }

    #[test]
    fn test_from_file_rejects_invalid() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[store]\nring_capacity = 100").unwrap();

        let err = RippleConfig::from_file(file.path().to_str().unwrap()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidCapacity);
    }
}
