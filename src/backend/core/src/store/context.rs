//! Per-context secondary streams.
//!
//! The first stage of every store copies each primary envelope into the
//! stream of its context. Context streams are created on first sight and
//! kept in an LRU cache; when the cache is full the least recently used
//! context is evicted and its stream shut down, so its history is gone.
//!
//! Context streams have no consumers and are never gated. They overwrite
//! their oldest entries and act as bounded history.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::MuxFn;
use crate::envelope::{Envelope, FilterLayout};
use crate::error::{Result, RippleError};
use crate::stream::{EventHandler, ProducerType, RingBuffer, WaitStrategy};
use crate::telemetry::StoreMetrics;

pub(crate) struct ContextCache {
    store_name: String,
    streams: Mutex<LruCache<String, Arc<RingBuffer>>>,
    stream_capacity: usize,
    wait: WaitStrategy,
    layout: Arc<FilterLayout>,
    evictions: AtomicU64,
}

impl ContextCache {
    pub(crate) fn new(
        store_name: &str,
        capacity: usize,
        stream_capacity: usize,
        wait: WaitStrategy,
        layout: Arc<FilterLayout>,
    ) -> Result<Self> {
        let capacity = NonZeroUsize::new(capacity)
            .ok_or_else(|| RippleError::configuration("Context cache capacity must be at least 1"))?;
        if !stream_capacity.is_power_of_two() {
            return Err(RippleError::invalid_capacity("Context stream", stream_capacity));
        }
        Ok(Self {
            store_name: store_name.to_string(),
            streams: Mutex::new(LruCache::new(capacity)),
            stream_capacity,
            wait,
            layout,
            evictions: AtomicU64::new(0),
        })
    }

    /// Look up a context stream, marking it most recently used.
    pub(crate) fn get(&self, context: &str) -> Option<Arc<RingBuffer>> {
        self.streams.lock().get(context).cloned()
    }

    pub(crate) fn get_or_create(&self, context: &str) -> Result<Arc<RingBuffer>> {
        let mut streams = self.streams.lock();
        if let Some(stream) = streams.get(context) {
            return Ok(stream.clone());
        }

        let stream = Arc::new(RingBuffer::new(
            format!("{}:{}", self.store_name, context),
            self.stream_capacity,
            ProducerType::Single,
            self.wait,
            self.layout.clone(),
        )?);

        if let Some((evicted, old)) = streams.push(context.to_string(), stream.clone()) {
            old.shutdown();
            self.evictions.fetch_add(1, Ordering::Relaxed);
            StoreMetrics::context_evicted(&self.store_name);
            tracing::debug!(store = %self.store_name, context = %evicted, "Evicted context stream");
        }
        StoreMetrics::active_contexts(&self.store_name, streams.len());
        tracing::debug!(store = %self.store_name, context = %context, "Created context stream");
        Ok(stream)
    }

    pub(crate) fn len(&self) -> usize {
        self.streams.lock().len()
    }

    pub(crate) fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Cached contexts, most recently used first.
    pub(crate) fn contexts(&self) -> Vec<String> {
        self.streams.lock().iter().map(|(k, _)| k.clone()).collect()
    }

    pub(crate) fn shutdown_all(&self) {
        let mut streams = self.streams.lock();
        while let Some((_, stream)) = streams.pop_lru() {
            stream.shutdown();
        }
        StoreMetrics::active_contexts(&self.store_name, 0);
    }
}

/// First stage of the store: copies each envelope into its context stream.
pub(crate) struct ContextFanOut {
    cache: Arc<ContextCache>,
    mux: MuxFn,
}

impl ContextFanOut {
    pub(crate) fn new(cache: Arc<ContextCache>, mux: MuxFn) -> Self {
        Self { cache, mux }
    }
}

impl EventHandler for ContextFanOut {
    fn name(&self) -> &str {
        "context-fan-out"
    }

    fn on_event(&self, event: &Envelope, _sequence: i64, _end_of_batch: bool) -> Result<()> {
        let context = (self.mux)(event);
        if context.is_empty() {
            return Ok(());
        }

        let stream = self.cache.get_or_create(&context)?;
        match stream.try_publish(|slot, _| event.copy_to(slot)) {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(RippleError::secondary_stream_full(&context)),
            // evicted between lookup and publish
            Err(_) if stream.is_halted() => Ok(()),
            Err(error) => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{ContextFilter, Payload};
    use std::time::Duration;

    fn cache(capacity: usize) -> ContextCache {
        ContextCache::new(
            "test",
            capacity,
            4,
            WaitStrategy::blocking(Duration::from_millis(5)),
            FilterLayout::builder().with::<ContextFilter>().build().unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_lru_eviction() {
        let cache = cache(2);
        let a = cache.get_or_create("a").unwrap();
        cache.get_or_create("b").unwrap();

        // touch a so that b is the eviction candidate
        assert!(cache.get("a").is_some());
        cache.get_or_create("c").unwrap();

        assert!(cache.get("b").is_none());
        assert!(!a.is_halted());
        assert_eq!(cache.evictions(), 1);
        assert_eq!(cache.contexts(), vec!["c".to_string(), "a".to_string()]);
    }

    #[test]
    fn test_evicted_stream_is_cleared() {
        let cache = cache(1);
        let a = cache.get_or_create("a").unwrap();
        let payload = Payload::new(1u8);
        a.publish(|env, _| env.set_payload(payload.clone())).unwrap();
        assert_eq!(payload.ref_count(), 2);

        cache.get_or_create("b").unwrap();
        assert!(a.is_halted());
        assert_eq!(payload.ref_count(), 1);
    }

    #[test]
    fn test_fan_out_copies_into_context_stream() {
        let cache = Arc::new(cache(4));
        let fan_out = ContextFanOut::new(cache.clone(), Arc::new(|e: &Envelope| e.context().to_string()));

        let mut env = Envelope::new(FilterLayout::builder().with::<ContextFilter>().build().unwrap());
        env.filter_mut::<ContextFilter>().unwrap().context = "dev".into();
        env.stamp(41);
        fan_out.on_event(&env, 41, true).unwrap();

        let stream = cache.get("dev").unwrap();
        let copy = stream.get(0).unwrap();
        assert_eq!(copy.parent_sequence(), 41);
        assert_eq!(copy.context(), "dev");

        // no context, no stream
        env.filter_mut::<ContextFilter>().unwrap().context.clear();
        fan_out.on_event(&env, 42, true).unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_shutdown_all() {
        let cache = cache(4);
        let a = cache.get_or_create("a").unwrap();
        cache.shutdown_all();
        assert!(a.is_halted());
        assert_eq!(cache.len(), 0);
    }
}
