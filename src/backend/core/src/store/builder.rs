use std::sync::Arc;
use std::time::Duration;

use super::{EventStore, MuxFn};
use crate::config::StoreConfig;
use crate::envelope::{ContextFilter, Envelope, Filter, FilterLayout, FilterLayoutBuilder};
use crate::error::Result;
use crate::stream::{ProducerType, WaitStrategy};

/// Builder for [`EventStore`].
///
/// [`ContextFilter`] is always the first filter of the layout; further
/// filter types are added with [`with_filter`](Self::with_filter).
pub struct EventStoreBuilder {
    layout: FilterLayoutBuilder,
    config: StoreConfig,
    mux: Option<MuxFn>,
}

impl EventStoreBuilder {
    pub(crate) fn new() -> Self {
        Self {
            layout: FilterLayout::builder().with::<ContextFilter>(),
            config: StoreConfig::default(),
            mux: None,
        }
    }

    /// Add a filter slot to every envelope.
    pub fn with_filter<F: Filter>(mut self) -> Self {
        self.layout = self.layout.with::<F>();
        self
    }

    /// Take every store setting from `config`.
    pub fn from_config(mut self, config: &StoreConfig) -> Self {
        self.config = config.clone();
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn ring_capacity(mut self, capacity: usize) -> Self {
        self.config.ring_capacity = capacity;
        self
    }

    pub fn producer_type(mut self, producer_type: ProducerType) -> Self {
        self.config.producer_type = producer_type;
        self
    }

    pub fn wait_strategy(mut self, wait: WaitStrategy) -> Self {
        self.config.wait_strategy = wait.kind;
        self.config.wait_timeout = wait.timeout;
        self
    }

    /// Bound the number of cached contexts and the history each one keeps.
    pub fn context_cache(mut self, capacity: usize, stream_capacity: usize) -> Self {
        self.config.context_capacity = capacity;
        self.config.context_stream_capacity = stream_capacity;
        self
    }

    /// Depth of the local history kept by history handlers.
    pub fn history_length(mut self, length: usize) -> Self {
        self.config.history_length = length;
        self
    }

    /// Envelopes each republishing handler may queue while the ring is full.
    pub fn republish_backlog(mut self, backlog: usize) -> Self {
        self.config.republish_backlog = backlog;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Function deriving the context of an envelope for fan-out and
    /// history. Defaults to the [`ContextFilter`] value.
    pub fn mux(mut self, mux: impl Fn(&Envelope) -> String + Send + Sync + 'static) -> Self {
        self.mux = Some(Arc::new(mux));
        self
    }

    /// Validate the settings and allocate the primary stream.
    ///
    /// # Errors
    ///
    /// Fails on invalid capacities or a filter type configured twice.
    pub fn build(self) -> Result<EventStore> {
        self.config.validate()?;
        let layout = self.layout.build()?;
        let mux: MuxFn = match self.mux {
            Some(mux) => mux,
            None => Arc::new(|envelope: &Envelope| envelope.context().to_string()),
        };
        EventStore::create(self.config, layout, mux)
    }
}

impl Default for EventStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}
