//! Telemetry: structured logging and metrics.
//!
//! This module provides the observability stack for Ripple:
//!
//! - **Logging**: `tracing` subscriber with JSON, pretty or compact output
//! - **Metrics**: counters and histograms for the store and the aggregator,
//!   optionally exported through a Prometheus recorder
//!
//! # Example
//!
//! ```rust,no_run
//! use ripple_core::telemetry::{init_telemetry, TelemetryConfig};
//!
//! let handle = init_telemetry(&TelemetryConfig::default()).expect("telemetry");
//! println!("{}", handle.metrics.render());
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use metrics::{init_metrics, AggregatorMetrics, MetricsConfig, MetricsRegistry, StoreMetrics};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Unified telemetry configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Initialize logging and metrics. Call once at startup.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<TelemetryHandle> {
    let metrics = init_metrics(&config.metrics)?;
    init_logging(&config.logging)?;
    Ok(TelemetryHandle { metrics })
}

/// Handle for the installed telemetry components.
#[derive(Debug)]
pub struct TelemetryHandle {
    pub metrics: MetricsRegistry,
}

impl TelemetryHandle {
    pub fn shutdown(self) {
        tracing::info!("Telemetry shutdown complete");
    }
}
