//! Event store: primary stream, context streams and handler DAG.
//!
//! - **Publish**: producers write into the primary stream
//! - **Fan-out**: the first stage copies every event into the stream of its
//!   context, created lazily and kept in an LRU cache
//! - **Handlers**: registered groups consume the primary stream in
//!   dependency order, one thread per handler
//! - **Reaper**: optional last stage returning slots to the clear state
//! - **History**: newest-first lookups in a context stream
//!
//! # Example
//!
//! ```rust,no_run
//! use ripple_core::prelude::*;
//!
//! let store = EventStore::builder().ring_capacity(256).build()?;
//! store.register([handler_fn("printer", |env, seq, _| {
//!     println!("{} {}", seq, env.context());
//!     Ok(())
//! })])?;
//! store.start(true)?;
//! store.publish(Payload::new(42u32), "device-a")?;
//! let recent = store.get_history("device-a", i64::MAX, |_| true, 10);
//! store.stop();
//! # Ok::<(), ripple_core::RippleError>(())
//! ```

mod builder;
mod context;
mod handler;
mod history;

pub use builder::EventStoreBuilder;
pub use handler::HandlerGroup;
pub use history::HistoryCallback;

pub(crate) use handler::Republisher;

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::envelope::{ContextFilter, Envelope, FilterKey, FilterLayout, FilterPredicate, Payload};
use crate::error::{Result, RippleError};
use crate::stream::{
    BatchEventProcessor, EventHandler, ProcessorHandle, RingBuffer, Sequence, Task,
};
use crate::telemetry::StoreMetrics;
use context::{ContextCache, ContextFanOut};
use handler::Registry;
use history::HistoryHandler;

/// Derives the context of an envelope.
pub type MuxFn = Arc<dyn Fn(&Envelope) -> String + Send + Sync>;

/// Handle to an event store. Cheap to clone; all clones share one store.
///
/// The store stops when [`stop`](Self::stop) is called or the last handle
/// is dropped.
#[derive(Clone)]
pub struct EventStore {
    inner: Arc<StoreInner>,
}

/// Non-owning store handle for handlers that publish back into the store.
#[derive(Clone)]
pub struct WeakEventStore {
    inner: Weak<StoreInner>,
}

impl WeakEventStore {
    pub fn upgrade(&self) -> Option<EventStore> {
        self.inner.upgrade().map(|inner| EventStore { inner })
    }
}

struct StoreInner {
    id: Uuid,
    config: StoreConfig,
    layout: Arc<FilterLayout>,
    context_key: FilterKey<ContextFilter>,
    ring: Arc<RingBuffer>,
    contexts: Arc<ContextCache>,
    mux: MuxFn,
    registry: Mutex<Registry>,
    processors: Mutex<Vec<ProcessorHandle>>,
    history_handlers: AtomicUsize,
    handler_errors: Arc<AtomicU64>,
    republish_dropped: AtomicU64,
    published: AtomicU64,
    running: AtomicBool,
    stopped: AtomicBool,
}

/// Progress of one running stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageStats {
    pub name: String,
    pub sequence: i64,
}

/// Snapshot of store counters.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub id: Uuid,
    pub name: String,
    pub running: bool,
    pub published: u64,
    pub cursor: i64,
    pub ring_capacity: usize,
    pub remaining_capacity: usize,
    pub contexts: usize,
    pub context_evictions: u64,
    pub handler_errors: u64,
    /// Handler republishes dropped because their backlog was full.
    pub republish_dropped: u64,
    pub stages: Vec<StageStats>,
}

impl EventStore {
    pub fn builder() -> EventStoreBuilder {
        EventStoreBuilder::new()
    }

    pub(crate) fn create(config: StoreConfig, layout: Arc<FilterLayout>, mux: MuxFn) -> Result<Self> {
        let context_key = layout.key::<ContextFilter>()?;
        let wait = config.wait();
        let ring = Arc::new(RingBuffer::new(
            config.name.clone(),
            config.ring_capacity,
            config.producer_type,
            wait,
            layout.clone(),
        )?);
        let contexts = Arc::new(ContextCache::new(
            &config.name,
            config.context_capacity,
            config.context_stream_capacity,
            wait,
            layout.clone(),
        )?);

        let id = Uuid::new_v4();
        tracing::debug!(
            store = %config.name,
            id = %id,
            ring_capacity = config.ring_capacity,
            filters = ?layout.type_names(),
            "Event store created"
        );

        Ok(Self {
            inner: Arc::new(StoreInner {
                id,
                config,
                layout,
                context_key,
                ring,
                contexts,
                mux,
                registry: Mutex::new(Registry::default()),
                processors: Mutex::new(Vec::new()),
                history_handlers: AtomicUsize::new(0),
                handler_errors: Arc::new(AtomicU64::new(0)),
                republish_dropped: AtomicU64::new(0),
                published: AtomicU64::new(0),
                running: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        })
    }

    pub fn downgrade(&self) -> WeakEventStore {
        WeakEventStore {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn layout(&self) -> &Arc<FilterLayout> {
        &self.inner.layout
    }

    /// The context function used for fan-out.
    pub fn mux(&self) -> MuxFn {
        self.inner.mux.clone()
    }

    /// The primary stream.
    pub fn ring(&self) -> &Arc<RingBuffer> {
        &self.inner.ring
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub(crate) fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner.registry.lock()
    }

    /// A fresh envelope with this store's filter layout.
    pub fn new_envelope(&self) -> Envelope {
        Envelope::new(self.inner.layout.clone())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Registration
    // ─────────────────────────────────────────────────────────────────────────

    /// Register handlers that run in parallel directly after the fan-out
    /// stage.
    ///
    /// # Errors
    ///
    /// Fails if a handler is already registered or the store has started.
    pub fn register(&self, handlers: impl IntoIterator<Item = Arc<dyn EventHandler>>) -> Result<HandlerGroup> {
        let members = self.registry().add(handlers.into_iter().collect(), &[])?;
        Ok(HandlerGroup::new(self.clone(), Vec::new(), members))
    }

    /// Register one history handler per callback.
    ///
    /// Each handler keeps the last `history_length` envelopes matching
    /// `predicate` per context (context derived with `mux`), passes them to
    /// its callback and republishes whatever the callback returns.
    pub fn register_history(
        &self,
        predicate: FilterPredicate,
        mux: impl Fn(&Envelope) -> String + Send + Sync + 'static,
        callbacks: impl IntoIterator<Item = HistoryCallback>,
    ) -> Result<HandlerGroup> {
        let mux: MuxFn = Arc::new(mux);
        let contexts = NonZeroUsize::new(self.inner.config.context_capacity)
            .ok_or_else(|| RippleError::configuration("Context cache capacity must be at least 1"))?;

        let handlers: Vec<Arc<dyn EventHandler>> = callbacks
            .into_iter()
            .map(|callback| {
                let index = self.inner.history_handlers.fetch_add(1, Ordering::Relaxed);
                Arc::new(HistoryHandler::new(
                    format!("history-{}", index),
                    predicate.clone(),
                    mux.clone(),
                    callback,
                    self.downgrade(),
                    self.inner.config.history_length,
                    contexts,
                )) as Arc<dyn EventHandler>
            })
            .collect();
        self.register(handlers)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Publishing
    // ─────────────────────────────────────────────────────────────────────────

    fn context_writer<'a>(&'a self, payload: Payload, context: &'a str) -> impl FnOnce(&mut Envelope) + 'a {
        let key = self.inner.context_key;
        move |envelope| {
            if let Some(filter) = envelope.filter_by_mut(key) {
                filter.context.push_str(context);
            }
            envelope.set_payload(payload);
        }
    }

    /// Publish a payload under `context`. Blocks while the primary stream is
    /// full.
    pub fn publish(&self, payload: Payload, context: &str) -> Result<i64> {
        self.publish_with(self.context_writer(payload, context))
    }

    /// Publish a payload under `context`; `Ok(None)` if the stream is full.
    pub fn try_publish(&self, payload: Payload, context: &str) -> Result<Option<i64>> {
        self.try_publish_with(self.context_writer(payload, context))
    }

    /// Publish by populating a cleared envelope in place.
    pub fn publish_with(&self, writer: impl FnOnce(&mut Envelope)) -> Result<i64> {
        let sequence = self.inner.ring.publish(|envelope, _| writer(envelope))?;
        self.published();
        Ok(sequence)
    }

    pub fn try_publish_with(&self, writer: impl FnOnce(&mut Envelope)) -> Result<Option<i64>> {
        let sequence = self.inner.ring.try_publish(|envelope, _| writer(envelope))?;
        if sequence.is_some() {
            self.published();
        }
        Ok(sequence)
    }

    /// Publish a copy of `envelope` with fresh publish metadata and no
    /// recorded errors.
    pub fn publish_envelope(&self, envelope: &Envelope) -> Result<i64> {
        let sequence = self.inner.ring.publish(|slot, sequence| restamp(envelope, slot, sequence))?;
        self.published();
        Ok(sequence)
    }

    pub fn try_publish_envelope(&self, envelope: &Envelope) -> Result<Option<i64>> {
        let sequence = self
            .inner
            .ring
            .try_publish(|slot, sequence| restamp(envelope, slot, sequence))?;
        if sequence.is_some() {
            self.published();
        }
        Ok(sequence)
    }

    fn published(&self) {
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        StoreMetrics::published();
    }

    pub(crate) fn republish_dropped(&self, handler: &str) {
        self.inner.republish_dropped.fetch_add(1, Ordering::Relaxed);
        StoreMetrics::republish_dropped(handler);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // History
    // ─────────────────────────────────────────────────────────────────────────

    /// Up to `limit` envelopes of `context` matching `predicate`, newest
    /// first, all published at or before primary sequence `sequence`.
    ///
    /// Empty if the context was never seen or has been evicted.
    pub fn get_history(
        &self,
        context: &str,
        sequence: i64,
        predicate: impl Fn(&Envelope) -> bool,
        limit: usize,
    ) -> Vec<Envelope> {
        let mut history = Vec::new();
        if limit == 0 {
            return history;
        }
        if let Some(stream) = self.inner.contexts.get(context) {
            stream.scan_back(|_, envelope| {
                if envelope.parent_sequence() <= sequence && predicate(envelope) {
                    history.push(envelope.clone());
                }
                history.len() < limit
            });
        }
        history
    }

    /// Most recent envelope of `context` matching `predicate`.
    pub fn get_last(&self, context: &str, predicate: impl Fn(&Envelope) -> bool) -> Option<Envelope> {
        self.get_history(context, i64::MAX, predicate, 1).pop()
    }

    /// Cached contexts, most recently used first.
    pub fn contexts(&self) -> Vec<String> {
        self.inner.contexts.contexts()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Spawn the processor threads: the fan-out stage, every registered
    /// stage and, if requested, the reaper.
    ///
    /// Stages begin at the cursor current at start; events published
    /// before start reach the primary stream only.
    ///
    /// # Errors
    ///
    /// Fails if the store was already started or stopped, or a thread
    /// cannot be spawned.
    pub fn start(&self, with_reaper: bool) -> Result<()> {
        let inner = &self.inner;
        if inner.stopped.load(Ordering::Acquire) {
            return Err(RippleError::store_stopped());
        }
        let mut registry = inner.registry.lock();
        if registry.started {
            return Err(RippleError::already_started());
        }

        let ring = &inner.ring;
        let cursor = ring.cursor();
        let fan_out = Sequence::new(cursor);
        let stage_sequences: Vec<Sequence> =
            registry.stages.iter().map(|_| Sequence::new(cursor)).collect();
        let reaper = with_reaper.then(|| Sequence::new(cursor));

        let all: Vec<Sequence> = std::iter::once(fan_out.clone())
            .chain(stage_sequences.iter().cloned())
            .collect();
        match &reaper {
            Some(reaper) => ring.set_gating(vec![reaper.clone()]),
            None => ring.set_gating(all.clone()),
        }

        let mut processors = Vec::with_capacity(all.len() + 1);
        let fan_out_handler: Arc<dyn EventHandler> =
            Arc::new(ContextFanOut::new(inner.contexts.clone(), inner.mux.clone()));
        let mut planned = vec![(fan_out_handler, Vec::new(), fan_out.clone())];
        for (stage, sequence) in registry.stages.iter().zip(&stage_sequences) {
            let dependents = if stage.depends_on.is_empty() {
                vec![fan_out.clone()]
            } else {
                stage
                    .depends_on
                    .iter()
                    .map(|&i| stage_sequences[i].clone())
                    .collect()
            };
            planned.push((stage.handler.clone(), dependents, sequence.clone()));
        }

        for (handler, dependents, sequence) in planned {
            let thread_name = format!("{}-{}", inner.config.name, handler.name());
            let processor = BatchEventProcessor::new(
                ring.clone(),
                dependents,
                sequence,
                Task::Handler(handler),
                inner.handler_errors.clone(),
            );
            match processor.spawn(thread_name) {
                Ok(handle) => processors.push(handle),
                Err(error) => {
                    ring.set_gating(Vec::new());
                    return Err(abort_start(processors, error));
                }
            }
        }
        if let Some(reaper) = reaper {
            let processor = BatchEventProcessor::new(
                ring.clone(),
                all,
                reaper,
                Task::Reaper,
                inner.handler_errors.clone(),
            );
            match processor.spawn(format!("{}-reaper", inner.config.name)) {
                Ok(handle) => processors.push(handle),
                Err(error) => {
                    ring.set_gating(Vec::new());
                    return Err(abort_start(processors, error));
                }
            }
        }

        registry.started = true;
        inner.running.store(true, Ordering::Release);
        tracing::info!(
            store = %inner.config.name,
            stages = registry.stages.len(),
            threads = processors.len(),
            reaper = with_reaper,
            "Event store started"
        );
        *inner.processors.lock() = processors;
        Ok(())
    }

    /// Drain, stop and join every processor and shut down all streams.
    /// Idempotent.
    pub fn stop(&self) {
        self.inner.shutdown();
    }

    pub fn stats(&self) -> StoreStats {
        let inner = &self.inner;
        let stages = inner
            .processors
            .lock()
            .iter()
            .map(|p| StageStats {
                name: p.name().to_string(),
                sequence: p.sequence(),
            })
            .collect();
        StoreStats {
            id: inner.id,
            name: inner.config.name.clone(),
            running: self.is_running(),
            published: inner.published.load(Ordering::Relaxed),
            cursor: inner.ring.cursor(),
            ring_capacity: inner.ring.capacity(),
            remaining_capacity: inner.ring.remaining_capacity(),
            contexts: inner.contexts.len(),
            context_evictions: inner.contexts.evictions(),
            handler_errors: inner.handler_errors.load(Ordering::Relaxed),
            republish_dropped: inner.republish_dropped.load(Ordering::Relaxed),
            stages,
        }
    }
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore")
            .field("id", &self.inner.id)
            .field("name", &self.inner.config.name)
            .field("ring", &self.inner.ring)
            .finish()
    }
}

fn restamp(source: &Envelope, slot: &mut Envelope, sequence: i64) {
    source.copy_to(slot);
    slot.stamp(sequence);
    slot.clear_errors();
}

fn abort_start(mut processors: Vec<ProcessorHandle>, error: RippleError) -> RippleError {
    for processor in &processors {
        processor.halt();
    }
    for processor in &mut processors {
        processor.join();
    }
    error.log();
    error
}

impl StoreInner {
    fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut processors = std::mem::take(&mut *self.processors.lock());

        if !processors.is_empty() {
            let target = self.ring.cursor();
            let deadline = Instant::now() + self.config.shutdown_timeout;
            while processors.iter().any(|p| p.sequence() < target) && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(1));
            }
            let lagging: Vec<&str> = processors
                .iter()
                .filter(|p| p.sequence() < target)
                .map(ProcessorHandle::name)
                .collect();
            if !lagging.is_empty() {
                tracing::warn!(
                    store = %self.config.name,
                    target,
                    lagging = ?lagging,
                    "Handlers did not drain before shutdown timeout"
                );
            }
        }

        self.ring.halt();
        for processor in &processors {
            processor.halt();
        }
        for processor in &mut processors {
            processor.join();
        }
        self.ring.shutdown();
        self.contexts.shutdown_all();
        self.running.store(false, Ordering::Release);

        tracing::info!(
            store = %self.config.name,
            published = self.published.load(Ordering::Relaxed),
            handler_errors = self.handler_errors.load(Ordering::Relaxed),
            "Event store stopped"
        );
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}
