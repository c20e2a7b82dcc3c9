//! Handler registration and republishing from handler threads.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use super::EventStore;
use crate::envelope::Envelope;
use crate::error::{Result, RippleError};
use crate::stream::EventHandler;

/// One registered consumer and the stages it waits for.
pub(crate) struct Stage {
    pub(crate) handler: Arc<dyn EventHandler>,
    pub(crate) depends_on: Vec<usize>,
}

/// Handler DAG, in registration order. A stage only depends on earlier
/// stages.
#[derive(Default)]
pub(crate) struct Registry {
    pub(crate) stages: Vec<Stage>,
    pub(crate) started: bool,
}

fn same_handler(a: &Arc<dyn EventHandler>, b: &Arc<dyn EventHandler>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl Registry {
    /// Add `handlers` as siblings gated behind `depends_on`. Returns their
    /// stage indices.
    pub(crate) fn add(
        &mut self,
        handlers: Vec<Arc<dyn EventHandler>>,
        depends_on: &[usize],
    ) -> Result<Vec<usize>> {
        if self.started {
            return Err(RippleError::already_started());
        }
        if handlers.is_empty() {
            return Err(RippleError::configuration("A handler group needs at least one handler"));
        }
        for (i, handler) in handlers.iter().enumerate() {
            let registered = self.stages.iter().any(|s| same_handler(&s.handler, handler));
            let repeated = handlers[..i].iter().any(|h| same_handler(h, handler));
            if registered || repeated {
                return Err(RippleError::duplicate_handler(handler.name()));
            }
        }

        let first = self.stages.len();
        self.stages.extend(handlers.into_iter().map(|handler| Stage {
            handler,
            depends_on: depends_on.to_vec(),
        }));
        Ok((first..self.stages.len()).collect())
    }
}

/// Builder for parallel (`and`) and sequential (`then`) handler composition.
///
/// ```rust,no_run
/// # use ripple_core::prelude::*;
/// # fn demo(store: &EventStore, a: std::sync::Arc<dyn EventHandler>,
/// #         b: std::sync::Arc<dyn EventHandler>, c: std::sync::Arc<dyn EventHandler>) -> Result<()> {
/// // a and b run concurrently; c sees an event only after both are done with it
/// store.register([a])?.and([b])?.then([c])?;
/// # Ok(()) }
/// ```
#[derive(Clone)]
pub struct HandlerGroup {
    store: EventStore,
    depends_on: Vec<usize>,
    members: Vec<usize>,
}

impl HandlerGroup {
    pub(crate) fn new(store: EventStore, depends_on: Vec<usize>, members: Vec<usize>) -> Self {
        Self {
            store,
            depends_on,
            members,
        }
    }

    /// Add siblings at the current dependency level.
    pub fn and(mut self, handlers: impl IntoIterator<Item = Arc<dyn EventHandler>>) -> Result<Self> {
        let added = self
            .store
            .registry()
            .add(handlers.into_iter().collect(), &self.depends_on)?;
        self.members.extend(added);
        Ok(self)
    }

    /// Add a new level gated behind every handler of this group.
    pub fn then(self, handlers: impl IntoIterator<Item = Arc<dyn EventHandler>>) -> Result<Self> {
        let added = self
            .store
            .registry()
            .add(handlers.into_iter().collect(), &self.members)?;
        Ok(Self::new(self.store, self.members, added))
    }

    /// Names of the handlers at this group's level.
    pub fn handler_names(&self) -> Vec<String> {
        let registry = self.store.registry();
        self.members
            .iter()
            .map(|&i| registry.stages[i].handler.name().to_string())
            .collect()
    }
}

impl std::fmt::Debug for HandlerGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerGroup")
            .field("depends_on", &self.depends_on)
            .field("members", &self.members)
            .finish()
    }
}

/// Queue of envelopes a handler wants to publish into the stream it
/// consumes.
///
/// A handler that blocks on a full ring would wait for itself, so publishes
/// use `try_publish` and whatever does not fit is retried on the next event
/// or timeout. At most `republish_backlog` envelopes wait; further
/// submissions are dropped and counted in the store stats.
pub(crate) struct Republisher {
    owner: String,
    pending: Mutex<VecDeque<Envelope>>,
}

impl Republisher {
    pub(crate) fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn submit(&self, store: &EventStore, envelope: Envelope) {
        self.flush(store);
        {
            let mut pending = self.pending.lock();
            if pending.len() >= store.config().republish_backlog {
                tracing::warn!(
                    handler = %self.owner,
                    backlog = pending.len(),
                    sequence = envelope.parent_sequence(),
                    "Republish backlog full, dropping envelope"
                );
                store.republish_dropped(&self.owner);
                return;
            }
            pending.push_back(envelope);
        }
        self.flush(store);
    }

    /// Publish queued envelopes in order until the ring is full.
    pub(crate) fn flush(&self, store: &EventStore) {
        let mut pending = self.pending.lock();
        while let Some(envelope) = pending.front() {
            match store.try_publish_envelope(envelope) {
                Ok(Some(_)) => {
                    pending.pop_front();
                }
                Ok(None) => {
                    tracing::debug!(
                        handler = %self.owner,
                        pending = pending.len(),
                        "Ring full, deferring republish"
                    );
                    break;
                }
                Err(error) => {
                    tracing::warn!(
                        handler = %self.owner,
                        dropped = pending.len(),
                        error = %error,
                        "Dropping pending republishes"
                    );
                    pending.clear();
                }
            }
        }
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Payload;
    use crate::error::ErrorCode;
    use crate::stream::{handler_fn, Sequence};

    fn noop(name: &str) -> Arc<dyn EventHandler> {
        handler_fn(name, |_, _, _| Ok(()))
    }

    #[test]
    fn test_registry_levels() {
        let mut registry = Registry::default();
        let first = registry.add(vec![noop("a"), noop("b")], &[]).unwrap();
        let second = registry.add(vec![noop("c")], &first).unwrap();

        assert_eq!(first, vec![0, 1]);
        assert_eq!(second, vec![2]);
        assert_eq!(registry.stages[2].depends_on, vec![0, 1]);
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let mut registry = Registry::default();
        let handler = noop("a");
        registry.add(vec![handler.clone()], &[]).unwrap();

        let err = registry.add(vec![handler.clone()], &[0]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::DuplicateHandler);

        let other = noop("b");
        let err = registry.add(vec![other.clone(), other], &[]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::DuplicateHandler);
        assert_eq!(registry.stages.len(), 1);
    }

    #[test]
    fn test_registry_rejects_after_start() {
        let mut registry = Registry::default();
        registry.started = true;
        let err = registry.add(vec![noop("late")], &[]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::AlreadyStarted);
    }

    #[test]
    fn test_republish_backlog_bounded_on_full_ring() {
        let store = EventStore::builder()
            .ring_capacity(4)
            .republish_backlog(2)
            .build()
            .unwrap();
        let consumer = Sequence::default();
        store.ring().set_gating(vec![consumer.clone()]);
        for value in 0..4u32 {
            assert!(store.try_publish(Payload::new(value), "full").unwrap().is_some());
        }

        let republisher = Republisher::new("echo");
        for value in 10..13u32 {
            let mut envelope = store.new_envelope();
            envelope.set_payload(Payload::new(value));
            republisher.submit(&store, envelope);
        }
        assert_eq!(republisher.pending(), 2);
        assert_eq!(store.stats().republish_dropped, 1);
        assert_eq!(store.ring().cursor(), 3);

        consumer.set(1);
        republisher.flush(&store);
        assert_eq!(republisher.pending(), 0);
        assert_eq!(store.ring().cursor(), 5);
        let values: Vec<u32> = (4..=5)
            .filter_map(|seq| store.ring().get(seq))
            .filter_map(|env| env.payload_as::<u32>().copied())
            .collect();
        assert_eq!(values, vec![10, 11]);
    }
}
