//! Metrics for the event store and the demux aggregator.
//!
//! Metrics are emitted through the `metrics` facade and cost next to nothing
//! when no recorder is installed. [`init_metrics`] installs a Prometheus
//! recorder whose output can be rendered on demand.
//!
//! # Example
//!
//! ```rust,no_run
//! use ripple_core::telemetry::metrics::{StoreMetrics, AggregatorMetrics};
//! use std::time::Duration;
//!
//! StoreMetrics::published();
//! AggregatorMetrics::finished("complete", Duration::from_millis(12));
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{Result, RippleError};

pub const EVENTS_PUBLISHED: &str = "ripple_events_published_total";
pub const HANDLER_ERRORS: &str = "ripple_handler_errors_total";
pub const CONTEXT_EVICTIONS: &str = "ripple_context_evictions_total";
pub const REPUBLISH_DROPPED: &str = "ripple_republish_dropped_total";
pub const ACTIVE_CONTEXTS: &str = "ripple_active_contexts";
pub const AGGREGATES: &str = "ripple_aggregates_total";
pub const AGGREGATE_DURATION: &str = "ripple_aggregate_duration_seconds";
pub const AGGREGATE_CLAIMS: &str = "ripple_aggregate_claims_total";
pub const FORCED_TIMEOUTS: &str = "ripple_forced_timeouts_total";
pub const DUPLICATES_DROPPED: &str = "ripple_duplicates_dropped_total";

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether to install the Prometheus recorder
    #[serde(default)]
    pub enabled: bool,

    /// Histogram buckets for aggregation durations (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Global labels to add to all metrics
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            duration_buckets: default_duration_buckets(),
            global_labels: HashMap::new(),
        }
    }
}

fn default_duration_buckets() -> Vec<f64> {
    vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
}

/// Handle to the installed recorder, if any.
pub struct MetricsRegistry {
    prometheus_handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("prometheus_handle", &self.prometheus_handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    pub fn disabled() -> Self {
        Self {
            prometheus_handle: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.prometheus_handle.is_some()
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

/// Install the Prometheus recorder if enabled.
///
/// # Errors
///
/// Returns an error if the buckets are invalid or a recorder is already
/// installed.
pub fn init_metrics(config: &MetricsConfig) -> Result<MetricsRegistry> {
    if !config.enabled {
        return Ok(MetricsRegistry::disabled());
    }

    let mut builder = PrometheusBuilder::new();
    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }
    builder = builder
        .set_buckets(&config.duration_buckets)
        .map_err(|e| RippleError::configuration(format!("Invalid histogram buckets: {}", e)))?;

    let handle = builder
        .install_recorder()
        .map_err(|e| RippleError::configuration(format!("Failed to install metrics recorder: {}", e)))?;

    register_metric_descriptions();
    tracing::info!(labels = config.global_labels.len(), "Metrics initialized");

    Ok(MetricsRegistry {
        prometheus_handle: Some(handle),
    })
}

fn register_metric_descriptions() {
    // Store metrics
    describe_counter!(EVENTS_PUBLISHED, "Total number of events published into primary streams");
    describe_counter!(HANDLER_ERRORS, "Total number of handler failures by handler");
    describe_counter!(CONTEXT_EVICTIONS, "Total number of context streams evicted from the cache");
    describe_counter!(REPUBLISH_DROPPED, "Total number of handler republishes dropped on a full backlog");
    describe_gauge!(ACTIVE_CONTEXTS, "Number of context streams currently cached");

    // Aggregator metrics
    describe_counter!(AGGREGATES, "Total number of aggregates published by outcome");
    describe_histogram!(AGGREGATE_DURATION, "Time from claim to aggregate publication in seconds");
    describe_counter!(AGGREGATE_CLAIMS, "Total number of keys claimed by aggregation workers");
    describe_counter!(FORCED_TIMEOUTS, "Total number of claims expired early to free a worker");
    describe_counter!(DUPLICATES_DROPPED, "Total number of events dropped for already aggregated keys");

    // Error metrics
    describe_counter!("ripple_errors_total", "Total number of errors by code");
}

/// Event store metrics.
pub struct StoreMetrics;

impl StoreMetrics {
    pub fn published() {
        counter!(EVENTS_PUBLISHED).increment(1);
    }

    pub fn handler_error(handler: &str) {
        counter!(HANDLER_ERRORS, "handler" => handler.to_string()).increment(1);
    }

    pub fn republish_dropped(handler: &str) {
        counter!(REPUBLISH_DROPPED, "handler" => handler.to_string()).increment(1);
    }

    pub fn context_evicted(store: &str) {
        counter!(CONTEXT_EVICTIONS, "store" => store.to_string()).increment(1);
    }

    pub fn active_contexts(store: &str, count: usize) {
        gauge!(ACTIVE_CONTEXTS, "store" => store.to_string()).set(count as f64);
    }
}

/// Demux aggregator metrics.
pub struct AggregatorMetrics;

impl AggregatorMetrics {
    pub fn claimed() {
        counter!(AGGREGATE_CLAIMS).increment(1);
    }

    /// Record a published aggregate and the time since its key was claimed.
    pub fn finished(outcome: &'static str, elapsed: Duration) {
        counter!(AGGREGATES, "outcome" => outcome).increment(1);
        histogram!(AGGREGATE_DURATION, "outcome" => outcome).record(elapsed.as_secs_f64());
    }

    pub fn forced_timeout() {
        counter!(FORCED_TIMEOUTS).increment(1);
    }

    pub fn duplicate_dropped() {
        counter!(DUPLICATES_DROPPED).increment(1);
    }
}
