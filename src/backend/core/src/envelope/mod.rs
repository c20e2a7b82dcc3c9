//! Pooled event envelopes.
//!
//! An [`Envelope`] carries one event through the store:
//!
//! - **arrival time**: set when the event is published
//! - **parent sequence**: primary-stream sequence of that publish
//! - **filters**: typed metadata slots resolved through a [`FilterLayout`]
//! - **payload**: reference-counted opaque domain object
//! - **errors**: failures recorded by handlers that did not abort
//!
//! Envelopes are allocated once per ring slot and reused: clearing returns
//! an envelope to the state of a freshly constructed one.

pub mod builtin;
pub mod filter;
pub mod payload;

pub use builtin::{ContextFilter, EventType, EventTypeFilter, TimingCtx, UpdateKind};
pub use filter::{DynFilter, Filter, FilterKey, FilterLayout, FilterLayoutBuilder, FilterPredicate};
pub use payload::Payload;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::error::{Result, RippleError};

/// Sequence value of an envelope that was never published.
pub const NO_SEQUENCE: i64 = -1;

/// A failure recorded on an envelope by a handler that chose to continue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandlerFailure {
    pub handler: String,
    pub message: String,
}

impl fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.handler, self.message)
    }
}

/// Carrier for one event's data and metadata.
pub struct Envelope {
    layout: Arc<FilterLayout>,
    arrival_time: Option<Instant>,
    published_at: Option<DateTime<Utc>>,
    parent_sequence: i64,
    filters: Vec<Box<dyn DynFilter>>,
    payload: Option<Payload>,
    errors: Vec<HandlerFailure>,
}

impl Envelope {
    /// Create a clear envelope with one default-constructed slot per filter type.
    pub fn new(layout: Arc<FilterLayout>) -> Self {
        let filters = layout.instantiate();
        Self {
            layout,
            arrival_time: None,
            published_at: None,
            parent_sequence: NO_SEQUENCE,
            filters,
            payload: None,
            errors: Vec::new(),
        }
    }

    /// Return to the clear state.
    ///
    /// The payload handle is taken out of the envelope before it is dropped,
    /// so it is released exactly once even if `clear` is called repeatedly.
    pub fn clear(&mut self) {
        self.arrival_time = None;
        self.published_at = None;
        self.parent_sequence = NO_SEQUENCE;
        for filter in &mut self.filters {
            filter.clear_dyn();
        }
        drop(self.payload.take());
        self.errors.clear();
    }

    /// Returns `true` if the envelope is in the clear state.
    pub fn is_clear(&self) -> bool {
        self.arrival_time.is_none()
            && self.parent_sequence == NO_SEQUENCE
            && self.payload.is_none()
            && self.errors.is_empty()
            && self
                .filters
                .iter()
                .zip(self.layout.instantiate())
                .all(|(f, fresh)| f.eq_dyn(fresh.as_ref()))
    }

    /// Copy filters and timestamps into `other`, retaining the payload.
    ///
    /// Slots are matched by position when both envelopes share a layout and
    /// by type otherwise; slots `other` does not carry are skipped.
    pub fn copy_to(&self, other: &mut Envelope) {
        other.arrival_time = self.arrival_time;
        other.published_at = self.published_at;
        other.parent_sequence = self.parent_sequence;
        if Arc::ptr_eq(&self.layout, &other.layout) {
            for (src, dst) in self.filters.iter().zip(other.filters.iter_mut()) {
                src.copy_to_dyn(dst.as_mut());
            }
        } else {
            for src in &self.filters {
                let type_id = src.as_any().type_id();
                if let Some(dst) = other
                    .filters
                    .iter_mut()
                    .find(|d| d.as_any().type_id() == type_id)
                {
                    src.copy_to_dyn(dst.as_mut());
                }
            }
        }
        other.payload = self.payload.clone();
        other.errors.clone_from(&self.errors);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Filters
    // ─────────────────────────────────────────────────────────────────────────

    pub fn layout(&self) -> &Arc<FilterLayout> {
        &self.layout
    }

    fn slot<F: Filter>(&self) -> Option<&F> {
        self.layout
            .position::<F>()
            .and_then(|i| self.filters[i].as_any().downcast_ref::<F>())
    }

    /// Borrow the `F` slot.
    pub fn filter<F: Filter>(&self) -> Result<&F> {
        self.slot::<F>()
            .ok_or_else(|| RippleError::unknown_filter(std::any::type_name::<F>()))
    }

    /// Mutably borrow the `F` slot.
    pub fn filter_mut<F: Filter>(&mut self) -> Result<&mut F> {
        match self.layout.position::<F>() {
            Some(i) => self.filters[i]
                .as_any_mut()
                .downcast_mut::<F>()
                .ok_or_else(|| RippleError::unknown_filter(std::any::type_name::<F>())),
            None => Err(RippleError::unknown_filter(std::any::type_name::<F>())),
        }
    }

    /// Borrow a slot through a pre-resolved key.
    ///
    /// `None` only if the key was resolved against a different layout.
    pub fn filter_by<F: Filter>(&self, key: FilterKey<F>) -> Option<&F> {
        self.filters
            .get(key.index)
            .and_then(|f| f.as_any().downcast_ref::<F>())
    }

    pub fn filter_by_mut<F: Filter>(&mut self, key: FilterKey<F>) -> Option<&mut F> {
        self.filters
            .get_mut(key.index)
            .and_then(|f| f.as_any_mut().downcast_mut::<F>())
    }

    /// Evaluate a predicate against the whole envelope.
    pub fn matches(&self, predicate: impl FnOnce(&Envelope) -> bool) -> bool {
        predicate(self)
    }

    /// Evaluate a predicate against the `F` slot.
    ///
    /// Returns `false` if `F` is not part of the layout.
    pub fn test<F: Filter>(&self, predicate: impl FnOnce(&F) -> bool) -> bool {
        self.slot::<F>().map_or(false, predicate)
    }

    pub fn test_key<F: Filter>(&self, key: FilterKey<F>, predicate: impl FnOnce(&F) -> bool) -> bool {
        self.filter_by(key).map_or(false, predicate)
    }

    /// Context key written by the store, empty if none.
    pub fn context(&self) -> &str {
        self.slot::<ContextFilter>()
            .map_or("", |f| f.context.as_str())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Payload
    // ─────────────────────────────────────────────────────────────────────────

    pub fn payload(&self) -> Option<&Payload> {
        self.payload.as_ref()
    }

    /// Borrow the payload as `T`.
    pub fn payload_as<T: Any>(&self) -> Option<&T> {
        self.payload.as_ref().and_then(|p| p.get::<T>())
    }

    pub fn set_payload(&mut self, payload: Payload) {
        self.payload = Some(payload);
    }

    /// Detach the payload without releasing it.
    pub fn take_payload(&mut self) -> Option<Payload> {
        self.payload.take()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Metadata
    // ─────────────────────────────────────────────────────────────────────────

    pub fn arrival_time(&self) -> Option<Instant> {
        self.arrival_time
    }

    pub fn published_at(&self) -> Option<DateTime<Utc>> {
        self.published_at
    }

    pub fn parent_sequence(&self) -> i64 {
        self.parent_sequence
    }

    /// Stamp publish metadata. Called by the stream writer.
    pub(crate) fn stamp(&mut self, parent_sequence: i64) {
        self.arrival_time = Some(Instant::now());
        self.published_at = Some(Utc::now());
        self.parent_sequence = parent_sequence;
    }

    pub fn errors(&self) -> &[HandlerFailure] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub(crate) fn clear_errors(&mut self) {
        self.errors.clear();
    }

    pub fn add_error(&mut self, handler: impl Into<String>, message: impl Into<String>) {
        self.errors.push(HandlerFailure {
            handler: handler.into(),
            message: message.into(),
        });
    }
}

impl Clone for Envelope {
    fn clone(&self) -> Self {
        Self {
            layout: self.layout.clone(),
            arrival_time: self.arrival_time,
            published_at: self.published_at,
            parent_sequence: self.parent_sequence,
            filters: self.filters.iter().map(|f| f.clone_box()).collect(),
            payload: self.payload.clone(),
            errors: self.errors.clone(),
        }
    }
}

/// Envelopes are equal when their metadata and filters are equal and they
/// share the same payload instance.
impl PartialEq for Envelope {
    fn eq(&self, other: &Self) -> bool {
        self.arrival_time == other.arrival_time
            && self.parent_sequence == other.parent_sequence
            && self.errors == other.errors
            && self.filters.len() == other.filters.len()
            && self
                .filters
                .iter()
                .zip(&other.filters)
                .all(|(a, b)| a.eq_dyn(b.as_ref()))
            && match (&self.payload, &other.payload) {
                (None, None) => true,
                (Some(a), Some(b)) => a.ptr_eq(b),
                _ => false,
            }
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Envelope");
        s.field("parent_sequence", &self.parent_sequence)
            .field("published_at", &self.published_at);
        for (i, filter) in self.filters.iter().enumerate() {
            s.field(self.layout.type_name_at(i), filter);
        }
        s.field("payload", &self.payload)
            .field("errors", &self.errors)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> Arc<FilterLayout> {
        FilterLayout::builder()
            .with::<ContextFilter>()
            .with::<EventTypeFilter>()
            .build()
            .unwrap()
    }

    fn populated(layout: &Arc<FilterLayout>) -> Envelope {
        let mut env = Envelope::new(layout.clone());
        env.stamp(12);
        env.filter_mut::<ContextFilter>().unwrap().context = "device-a".into();
        *env.filter_mut::<EventTypeFilter>().unwrap() =
            EventTypeFilter::new(EventType::Data, UpdateKind::Full);
        env.set_payload(Payload::new(String::from("reading")));
        env.add_error("validator", "failed");
        env
    }

    #[test]
    fn test_clear_matches_fresh_envelope() {
        let layout = layout();
        let mut env = populated(&layout);
        assert!(!env.is_clear());

        env.clear();
        assert!(env.is_clear());
        assert_eq!(env, Envelope::new(layout.clone()));

        // clearing twice is harmless
        env.clear();
        assert_eq!(env, Envelope::new(layout));
    }

    #[test]
    fn test_clear_releases_payload_once() {
        let layout = layout();
        let payload = Payload::new(5u32);
        let mut env = Envelope::new(layout);
        env.set_payload(payload.clone());
        assert_eq!(payload.ref_count(), 2);

        env.clear();
        env.clear();
        assert_eq!(payload.ref_count(), 1);
    }

    #[test]
    fn test_clone_independent_of_original() {
        let layout = layout();
        let mut original = populated(&layout);
        let copy = original.clone();

        original.clear();

        assert_eq!(copy.context(), "device-a");
        assert_eq!(copy.payload_as::<String>().map(String::as_str), Some("reading"));
        assert_eq!(copy.payload().unwrap().ref_count(), 1);
        assert_eq!(copy.parent_sequence(), 12);
    }

    #[test]
    fn test_copy_to_retains_payload() {
        let layout = layout();
        let source = populated(&layout);
        let mut target = Envelope::new(layout);
        source.copy_to(&mut target);

        assert_eq!(target, source);
        assert_eq!(source.payload().unwrap().ref_count(), 2);
    }

    #[test]
    fn test_copy_to_across_layouts() {
        let source = populated(&layout());
        let narrow = FilterLayout::builder().with::<ContextFilter>().build().unwrap();
        let mut target = Envelope::new(narrow);
        source.copy_to(&mut target);

        assert_eq!(target.context(), "device-a");
        assert!(target.filter::<EventTypeFilter>().is_err());
    }

    #[test]
    fn test_filter_lookup() {
        let layout = layout();
        let env = populated(&layout);

        assert!(env.test::<EventTypeFilter>(|f| f.event_type == EventType::Data));
        assert!(!env.test::<TimingCtx>(|_| true));
        assert!(env.filter::<TimingCtx>().is_err());

        let key = layout.key::<ContextFilter>().unwrap();
        assert!(env.test_key(key, |f| f.context == "device-a"));
        assert!(env.matches(|e| e.parent_sequence() == 12));
    }

    #[test]
    fn test_predicate_composition() {
        let layout = layout();
        let env = populated(&layout);

        let is_data = FilterPredicate::on_filter::<EventTypeFilter>(|f| f.event_type == EventType::Data);
        let is_b = FilterPredicate::on_filter::<ContextFilter>(|f| f.context == "device-b");
        let is_string = FilterPredicate::payload_is::<String>();

        assert!(is_data.clone().and(is_string.clone()).test(&env));
        assert!(!is_data.clone().and(is_b.clone()).test(&env));
        assert!(is_data.or(is_b.clone()).test(&env));
        assert!(is_b.negate().test(&env));
        assert!(FilterPredicate::always().test(&env));
    }
}
