#![allow(clippy::result_large_err)]
//! # Ripple Core
//!
//! In-process event distribution and aggregation.
//!
//! ## Architecture
//!
//! - **Envelope**: pooled carrier for one event, with typed filter slots and a shared payload
//! - **Stream**: fixed-capacity ring buffer with sequence-gated producers and consumers
//! - **Event Store**: primary stream, per-context history streams and a handler DAG
//! - **Demux Aggregator**: bounded worker pool correlating events by key
//! - **Telemetry**: structured logging and metrics

pub mod config;
pub mod demux;
pub mod envelope;
pub mod error;
pub mod store;
pub mod stream;
pub mod telemetry;

pub use error::{ErrorCode, ErrorDetails, ErrorSeverity, Result, RippleError};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{AggregatorConfig, RippleConfig, StoreConfig};
    pub use crate::demux::{is_aggregate, Aggregate, AggregateOutcome, AggregatorStats, DemuxAggregator};
    pub use crate::envelope::{
        ContextFilter, Envelope, EventType, EventTypeFilter, Filter, FilterLayout, FilterPredicate,
        Payload, TimingCtx, UpdateKind,
    };
    pub use crate::error::{ErrorCode, Result, RippleError};
    pub use crate::store::{EventStore, EventStoreBuilder, HandlerGroup, HistoryCallback, StoreStats};
    pub use crate::stream::{
        handler_fn, EventHandler, ProducerType, RingBuffer, SequenceProgress, WaitStrategy, WaitStrategyKind,
    };
}
