//! Structured logging with JSON, pretty and compact formats.
//!
//! - JSON format for log shippers
//! - Pretty format for development
//! - Per-module log level configuration
//! - `RUST_LOG` overrides the configured level when set

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{Result, RippleError};

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Global log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format
    #[serde(default)]
    pub format: LogFormat,

    /// Per-module log levels
    #[serde(default)]
    pub module_levels: HashMap<String, String>,

    /// Whether to include file/line information
    #[serde(default)]
    pub include_location: bool,

    /// Whether to include thread names; processor threads are named after
    /// their handler
    #[serde(default = "default_include_thread")]
    pub include_thread: bool,

    /// Whether to include target (module path)
    #[serde(default = "default_include_target")]
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            module_levels: HashMap::new(),
            include_location: false,
            include_thread: default_include_thread(),
            include_target: default_include_target(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format for structured logging
    Json,
    /// Multi-line format for development
    Pretty,
    /// Single-line format
    #[default]
    Compact,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_include_thread() -> bool {
    true
}

fn default_include_target() -> bool {
    true
}

impl LoggingConfig {
    /// Build the level filter: `RUST_LOG` if set, else the configured level
    /// plus per-module directives.
    pub fn env_filter(&self) -> Result<EnvFilter> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }

        let mut filter = EnvFilter::try_new(&self.level).map_err(|e| {
            RippleError::configuration(format!("Invalid log level '{}': {}", self.level, e))
        })?;
        for (module, level) in &self.module_levels {
            let directive = format!("{}={}", module, level);
            filter = filter.add_directive(directive.parse().map_err(|e| {
                RippleError::configuration(format!("Invalid log directive '{}': {}", directive, e))
            })?);
        }
        Ok(filter)
    }
}

/// Install the global tracing subscriber.
///
/// # Errors
///
/// Returns an error if the level is invalid or a subscriber is already set.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = config.env_filter()?;

    let result = match config.format {
        LogFormat::Json => {
            let fmt_layer = fmt::layer()
                .json()
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_thread_names(config.include_thread)
                .with_target(config.include_target);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()
        }
        LogFormat::Pretty => {
            let fmt_layer = fmt::layer()
                .pretty()
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_thread_names(config.include_thread)
                .with_target(config.include_target);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()
        }
        LogFormat::Compact => {
            let fmt_layer = fmt::layer()
                .compact()
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_thread_names(config.include_thread)
                .with_target(config.include_target);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()
        }
    };

    result.map_err(|e| RippleError::configuration(format!("Failed to install logger: {}", e)))
}
