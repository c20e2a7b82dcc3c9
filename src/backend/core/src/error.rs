//! Error handling for Ripple Core.
//!
//! This module provides:
//! - A single error type carrying a machine-readable code and context
//! - Severity classification that drives the log level
//! - Metrics integration for error tracking
//!
//! # Usage
//!
//! ```rust,ignore
//! use ripple_core::error::{RippleError, Result};
//!
//! fn check(capacity: usize) -> Result<()> {
//!     if !capacity.is_power_of_two() {
//!         return Err(RippleError::invalid_capacity("ring", capacity));
//!     }
//!     Ok(())
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Ripple operations.
pub type Result<T> = std::result::Result<T, RippleError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Configuration Errors (1000-1099)
    InvalidConfiguration,
    InvalidCapacity,
    UnknownFilter,
    DuplicateFilter,
    DuplicateHandler,
    InvalidSelector,
    AlreadyStarted,

    // Stream Errors (2000-2099)
    StoreStopped,
    SecondaryStreamFull,

    // Handler Errors (3000-3099)
    HandlerFailed,

    // Internal Errors (9000-9099)
    ThreadSpawnFailed,
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::InvalidConfiguration => 1000,
            Self::InvalidCapacity => 1001,
            Self::UnknownFilter => 1002,
            Self::DuplicateFilter => 1003,
            Self::DuplicateHandler => 1004,
            Self::InvalidSelector => 1005,
            Self::AlreadyStarted => 1006,

            Self::StoreStopped => 2000,
            Self::SecondaryStreamFull => 2001,

            Self::HandlerFailed => 3000,

            Self::ThreadSpawnFailed => 9000,
            Self::InternalError => 9001,
        }
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "configuration",
            2000..=2099 => "stream",
            3000..=3099 => "handler",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }

    /// Configuration errors are raised at setup time and are never retried.
    pub const fn is_configuration(&self) -> bool {
        matches!(self.numeric_code(), 1000..=1099)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller mistakes (unknown filter, bad selector)
    Low,
    /// Operational issues (handler failures, store stopped)
    Medium,
    /// Setup errors that leave the store unusable
    High,
    /// Broken invariants
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::UnknownFilter | ErrorCode::InvalidSelector => Self::Low,

            ErrorCode::HandlerFailed | ErrorCode::StoreStopped => Self::Medium,

            ErrorCode::InvalidConfiguration
            | ErrorCode::InvalidCapacity
            | ErrorCode::DuplicateFilter
            | ErrorCode::DuplicateHandler
            | ErrorCode::AlreadyStarted
            | ErrorCode::ThreadSpawnFailed => Self::High,

            ErrorCode::SecondaryStreamFull | ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity ID (handler name, context key, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Suggested action for resolution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggested_action = Some(suggestion.into());
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Ripple Core.
#[derive(Error, Debug)]
pub struct RippleError {
    /// Machine-readable error code
    code: ErrorCode,

    /// Human-readable message
    message: Cow<'static, str>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for RippleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(ref source) = self.source {
            write!(f, " (caused by: {})", source)?;
        }
        Ok(())
    }
}

impl RippleError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and message.
    pub fn new(code: ErrorCode, message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            message: message.into(),
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::InvalidConfiguration, message)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    details = ?self.details,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    "Low severity error"
                );
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            "ripple_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conversions
// ═══════════════════════════════════════════════════════════════════════════════

impl From<config::ConfigError> for RippleError {
    fn from(error: config::ConfigError) -> Self {
        Self::new(
            ErrorCode::InvalidConfiguration,
            format!("Failed to load configuration: {}", error),
        )
        .with_source(error)
    }
}

impl From<std::io::Error> for RippleError {
    fn from(error: std::io::Error) -> Self {
        Self::new(ErrorCode::InternalError, format!("I/O error: {}", error)).with_source(error)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Convenience Constructors for Domain Errors
// ═══════════════════════════════════════════════════════════════════════════════

impl RippleError {
    /// A filter type was requested that the envelope layout does not carry.
    pub fn unknown_filter(type_name: &str) -> Self {
        Self::new(
            ErrorCode::UnknownFilter,
            format!("Filter type not configured: {}", type_name),
        )
        .with_details(
            ErrorDetails::new()
                .with_entity("filter", type_name)
                .with_suggestion("Add the filter with EventStoreBuilder::with_filter"),
        )
    }

    pub fn duplicate_filter(type_name: &str) -> Self {
        Self::new(
            ErrorCode::DuplicateFilter,
            format!("Filter type configured twice: {}", type_name),
        )
        .with_details(ErrorDetails::new().with_entity("filter", type_name))
    }

    pub fn duplicate_handler(name: &str) -> Self {
        Self::new(
            ErrorCode::DuplicateHandler,
            format!("Handler already registered: {}", name),
        )
        .with_details(ErrorDetails::new().with_entity("handler", name))
    }

    pub fn invalid_capacity(what: &str, capacity: usize) -> Self {
        Self::new(
            ErrorCode::InvalidCapacity,
            format!("{} capacity must be a non-zero power of two, got {}", what, capacity),
        )
        .with_context("capacity", capacity)
    }

    pub fn invalid_selector(selector: &str, reason: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::InvalidSelector,
            format!("Invalid timing selector '{}': {}", selector, reason),
        )
    }

    pub fn already_started() -> Self {
        Self::new(
            ErrorCode::AlreadyStarted,
            "Event store is already running; handlers must be registered before start",
        )
    }

    pub fn store_stopped() -> Self {
        Self::new(ErrorCode::StoreStopped, "Event store has been stopped")
    }

    pub fn secondary_stream_full(context: &str) -> Self {
        Self::new(
            ErrorCode::SecondaryStreamFull,
            format!("Secondary stream for context '{}' rejected a publish", context),
        )
        .with_details(
            ErrorDetails::new()
                .with_entity("context", context)
                .with_suggestion("Check the context stream capacity configuration"),
        )
    }

    pub fn handler_failed(handler: &str, reason: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::HandlerFailed,
            format!("Handler '{}' failed: {}", handler, reason),
        )
        .with_details(ErrorDetails::new().with_entity("handler", handler))
    }

    pub fn thread_spawn_failed(name: &str, error: std::io::Error) -> Self {
        Self::new(
            ErrorCode::ThreadSpawnFailed,
            format!("Failed to spawn processor thread '{}'", name),
        )
        .with_source(error)
    }
}
