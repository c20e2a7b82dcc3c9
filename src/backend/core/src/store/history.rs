//! History handlers: callbacks that see the recent matching events of a
//! context.

use lru::LruCache;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Arc;

use super::handler::Republisher;
use super::{EventStore, MuxFn, WeakEventStore};
use crate::envelope::{Envelope, FilterPredicate};
use crate::error::Result;
use crate::stream::EventHandler;

/// Callback of a history handler.
///
/// Receives the last matching envelopes of the event's context (newest
/// first, the current event at index 0), the store, the sequence and the
/// end-of-batch flag. A returned envelope is republished into the primary
/// stream.
pub type HistoryCallback =
    Arc<dyn Fn(&[Envelope], &EventStore, i64, bool) -> Result<Option<Envelope>> + Send + Sync>;

pub(crate) struct HistoryHandler {
    name: String,
    predicate: FilterPredicate,
    mux: MuxFn,
    callback: HistoryCallback,
    store: WeakEventStore,
    depth: usize,
    local: Mutex<LruCache<String, VecDeque<Envelope>>>,
    republisher: Republisher,
}

impl HistoryHandler {
    pub(crate) fn new(
        name: String,
        predicate: FilterPredicate,
        mux: MuxFn,
        callback: HistoryCallback,
        store: WeakEventStore,
        depth: usize,
        contexts: NonZeroUsize,
    ) -> Self {
        let republisher = Republisher::new(name.clone());
        Self {
            name,
            predicate,
            mux,
            callback,
            store,
            depth,
            local: Mutex::new(LruCache::new(contexts)),
            republisher,
        }
    }
}

impl EventHandler for HistoryHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_event(&self, event: &Envelope, sequence: i64, end_of_batch: bool) -> Result<()> {
        let Some(store) = self.store.upgrade() else {
            return Ok(());
        };
        self.republisher.flush(&store);

        if !self.predicate.test(event) {
            return Ok(());
        }
        let context = (self.mux)(event);

        let output = {
            let mut local = self.local.lock();
            if !local.contains(&context) {
                local.push(context.clone(), VecDeque::with_capacity(self.depth));
            }
            match local.get_mut(&context) {
                Some(history) => {
                    history.push_front(event.clone());
                    history.truncate(self.depth);
                    (self.callback)(history.make_contiguous(), &store, sequence, end_of_batch)?
                }
                None => None,
            }
        };

        if let Some(envelope) = output {
            self.republisher.submit(&store, envelope);
        }
        Ok(())
    }

    fn on_timeout(&self, _sequence: i64) -> Result<()> {
        if self.republisher.pending() > 0 {
            if let Some(store) = self.store.upgrade() {
                self.republisher.flush(&store);
            }
        }
        Ok(())
    }
}
