//! Demultiplexing aggregator.
//!
//! Correlates events sharing a key into fixed-size groups. A single
//! dispatcher stage claims a free worker for every new key; workers run as
//! a dependent stage, collect the events of their key and republish an
//! [`Aggregate`] into the primary stream once the group is complete or its
//! timeout expires.
//!
//! At most one worker owns a key at a time: events for a key held by a
//! worker never reach the dispatcher's claim step. Finished keys are
//! remembered in a bounded FIFO dedup cache, so their late events are
//! dropped too; aggregation is at most once per key as long as the key is
//! still in the cache.
//!
//! When every worker is busy the dispatcher parks until one finishes or
//! forces the oldest expired one to publish a partial result. This bounds
//! the number of keys in flight to the pool size.
//!
//! ```rust,no_run
//! use ripple_core::prelude::*;
//! use ripple_core::demux::{Aggregate, DemuxAggregator};
//!
//! let store = EventStore::builder().build()?;
//! let aggregator = DemuxAggregator::new(AggregatorConfig::default(), |env: &Envelope| {
//!     env.payload_as::<String>().cloned()
//! })?;
//! aggregator.register(&store)?;
//! store.register([handler_fn("sink", |env, _, _| {
//!     if let Some(aggregate) = env.payload_as::<Aggregate>() {
//!         println!("{} {:?}", aggregate.key, aggregate.outcome);
//!     }
//!     Ok(())
//! })])?;
//! store.start(true)?;
//! # Ok::<(), ripple_core::RippleError>(())
//! ```

mod dedup;
mod dispatcher;
mod worker;

use crossbeam::channel;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::AggregatorConfig;
use crate::envelope::Envelope;
use crate::error::{Result, RippleError};
use crate::store::{EventStore, HandlerGroup};
use crate::stream::EventHandler;
use dispatcher::Dispatcher;
use worker::AggregationWorker;

/// Extracts the aggregation key of an event. `None` means the event does
/// not take part in aggregation.
pub type KeyFn = Arc<dyn Fn(&Envelope) -> Option<String> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateOutcome {
    /// The group reached its configured size.
    Complete,
    /// The claim timed out first.
    Partial,
}

impl AggregateOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Partial => "partial",
        }
    }
}

impl fmt::Display for AggregateOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a published aggregate.
#[derive(Debug, Clone)]
pub struct Aggregate {
    pub id: Uuid,
    pub key: String,
    pub outcome: AggregateOutcome,
    /// Collected events in stream order.
    pub events: Vec<Envelope>,
    /// Primary sequence of the event that opened the claim.
    pub sequence: i64,
    /// Time from claim to publish.
    pub elapsed: Duration,
}

impl Aggregate {
    pub fn is_complete(&self) -> bool {
        self.outcome == AggregateOutcome::Complete
    }
}

/// Whether `envelope` carries an [`Aggregate`].
pub fn is_aggregate(envelope: &Envelope) -> bool {
    envelope.payload().is_some_and(|payload| payload.is::<Aggregate>())
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) claimed: AtomicU64,
    pub(crate) completed: AtomicU64,
    pub(crate) timed_out: AtomicU64,
    pub(crate) forced_timeouts: AtomicU64,
    pub(crate) dropped_duplicates: AtomicU64,
    pub(crate) in_flight: AtomicU64,
    pub(crate) abandoned: AtomicU64,
}

/// Snapshot of aggregator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AggregatorStats {
    pub claimed: u64,
    pub completed: u64,
    /// Partial aggregates, whether expired by the worker or forced.
    pub timed_out: u64,
    /// Claims the dispatcher had to expire to admit a new key.
    pub forced_timeouts: u64,
    pub dropped_duplicates: u64,
    pub in_flight: u64,
    /// Claims still collecting when the store stopped.
    pub abandoned: u64,
}

/// Dispatcher plus worker pool, registered on an [`EventStore`] as two
/// handler levels.
pub struct DemuxAggregator {
    config: AggregatorConfig,
    key_fn: KeyFn,
    counters: Arc<Counters>,
    registered: AtomicBool,
}

impl DemuxAggregator {
    /// # Errors
    ///
    /// Fails if `config` does not validate.
    pub fn new(
        config: AggregatorConfig,
        key_fn: impl Fn(&Envelope) -> Option<String> + Send + Sync + 'static,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            key_fn: Arc::new(key_fn),
            counters: Arc::new(Counters::default()),
            registered: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Register the dispatcher and, gated behind it, the workers.
    ///
    /// Returns the worker level so further handlers can be chained after
    /// it. An aggregator can be registered once.
    pub fn register(&self, store: &EventStore) -> Result<HandlerGroup> {
        if self.registered.swap(true, Ordering::AcqRel) {
            return Err(RippleError::duplicate_handler("demux-dispatcher"));
        }

        let (report_tx, report_rx) = channel::unbounded();
        let mut commands = Vec::with_capacity(self.config.workers);
        let mut workers: Vec<Arc<dyn EventHandler>> = Vec::with_capacity(self.config.workers);
        for index in 0..self.config.workers {
            let (command_tx, command_rx) = channel::unbounded();
            commands.push(command_tx);
            workers.push(Arc::new(AggregationWorker::new(
                index,
                self.config.clone(),
                self.key_fn.clone(),
                command_rx,
                report_tx.clone(),
                store.downgrade(),
                self.counters.clone(),
            )));
        }

        let dispatcher: Arc<dyn EventHandler> = Arc::new(Dispatcher::new(
            self.config.clone(),
            self.key_fn.clone(),
            commands,
            report_rx,
            self.counters.clone(),
        ));

        tracing::info!(
            store = %store.name(),
            workers = self.config.workers,
            group_size = self.config.group_size,
            timeout_ms = self.config.timeout.as_millis() as u64,
            "Registering demux aggregator"
        );
        let registered = store.register([dispatcher]).and_then(|group| group.then(workers));
        if registered.is_err() {
            self.registered.store(false, Ordering::Release);
        }
        registered
    }

    pub fn stats(&self) -> AggregatorStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        AggregatorStats {
            claimed: load(&self.counters.claimed),
            completed: load(&self.counters.completed),
            timed_out: load(&self.counters.timed_out),
            forced_timeouts: load(&self.counters.forced_timeouts),
            dropped_duplicates: load(&self.counters.dropped_duplicates),
            in_flight: load(&self.counters.in_flight),
            abandoned: load(&self.counters.abandoned),
        }
    }
}

impl fmt::Debug for DemuxAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DemuxAggregator")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{EventType, EventTypeFilter, Payload, UpdateKind};
    use crate::error::ErrorCode;
    use crate::stream::handler_fn;
    use crossbeam::channel::Receiver;

    fn key_of(env: &Envelope) -> Option<String> {
        env.payload_as::<(&'static str, u32)>().map(|(key, _)| key.to_string())
    }

    fn sink(store: &EventStore) -> Receiver<Aggregate> {
        let (tx, rx) = channel::unbounded();
        store
            .register([handler_fn("sink", move |env, _, _| {
                if let Some(aggregate) = env.payload_as::<Aggregate>() {
                    let _ = tx.send(aggregate.clone());
                }
                Ok(())
            })])
            .unwrap();
        rx
    }

    fn config(workers: usize, group_size: usize, timeout: Duration) -> AggregatorConfig {
        AggregatorConfig {
            workers,
            group_size,
            timeout,
            ..AggregatorConfig::default()
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = DemuxAggregator::new(config(0, 3, Duration::from_millis(10)), key_of).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidConfiguration);
    }

    #[test]
    fn test_register_twice_rejected() {
        let store = EventStore::builder().ring_capacity(16).build().unwrap();
        let aggregator = DemuxAggregator::new(config(2, 3, Duration::from_secs(1)), key_of).unwrap();
        let group = aggregator.register(&store).unwrap();
        assert_eq!(group.handler_names(), vec!["demux-worker-0", "demux-worker-1"]);

        let err = aggregator.register(&store).unwrap_err();
        assert_eq!(err.code(), ErrorCode::DuplicateHandler);
    }

    #[test]
    fn test_complete_group_published() {
        let store = EventStore::builder()
            .with_filter::<EventTypeFilter>()
            .ring_capacity(64)
            .build()
            .unwrap();
        let aggregator = DemuxAggregator::new(config(2, 3, Duration::from_secs(5)), key_of).unwrap();
        aggregator.register(&store).unwrap();
        let aggregates = sink(&store);
        store.start(true).unwrap();

        for value in 0..3u32 {
            store.publish(Payload::new(("a", value)), "sensors").unwrap();
        }
        // late duplicate
        store.publish(Payload::new(("a", 99u32)), "sensors").unwrap();

        let aggregate = aggregates.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(aggregate.key, "a");
        assert!(aggregate.is_complete());
        let values: Vec<u32> = aggregate
            .events
            .iter()
            .filter_map(|e| e.payload_as::<(&'static str, u32)>().map(|(_, v)| *v))
            .collect();
        assert_eq!(values, vec![0, 1, 2]);

        store.stop();
        let stats = aggregator.stats();
        assert_eq!(stats.claimed, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.dropped_duplicates, 3);
    }

    #[test]
    fn test_partial_on_timeout() {
        let store = EventStore::builder()
            .with_filter::<EventTypeFilter>()
            .ring_capacity(64)
            .build()
            .unwrap();
        let aggregator = DemuxAggregator::new(config(2, 3, Duration::from_millis(50)), key_of).unwrap();
        aggregator.register(&store).unwrap();

        let (tx, rx) = channel::unbounded();
        store
            .register([handler_fn("tags", move |env, _, _| {
                if is_aggregate(env) {
                    let _ = tx.send(*env.filter::<EventTypeFilter>().unwrap());
                }
                Ok(())
            })])
            .unwrap();
        store.start(true).unwrap();

        store.publish(Payload::new(("b", 1u32)), "sensors").unwrap();
        store.publish(Payload::new(("b", 2u32)), "sensors").unwrap();

        let tag = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(tag, EventTypeFilter::new(EventType::Aggregate, UpdateKind::Partial));
        store.stop();
        assert_eq!(aggregator.stats().timed_out, 1);
    }

    #[test]
    fn test_stop_abandons_unfinished_claims() {
        let store = EventStore::builder().ring_capacity(64).build().unwrap();
        let aggregator = DemuxAggregator::new(config(2, 3, Duration::from_secs(60)), key_of).unwrap();
        aggregator.register(&store).unwrap();
        store.start(true).unwrap();

        store.publish(Payload::new(("c", 1u32)), "sensors").unwrap();
        store.stop();

        let stats = aggregator.stats();
        assert_eq!(stats.claimed, 1);
        assert_eq!(stats.completed + stats.timed_out, 0);
        assert_eq!(stats.abandoned, 1);
    }
}
