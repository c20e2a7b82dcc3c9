//! Typed envelope metadata.
//!
//! Every envelope carries one slot per filter type declared when the store is
//! built. Slots are resolved through a [`FilterLayout`], a lookup table keyed
//! by [`TypeId`], so the stream never needs to know concrete filter types.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use super::Envelope;
use crate::error::{Result, RippleError};

/// Contract for a metadata type that can live in an envelope slot.
///
/// `Default` is the cleared state, so every filter is constructible with no
/// arguments.
pub trait Filter: Any + Clone + Default + PartialEq + fmt::Debug + Send + Sync {
    /// Reset to the cleared state.
    fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Object-safe view of a [`Filter`], implemented for every filter type.
pub trait DynFilter: Any + Send + Sync + fmt::Debug {
    fn clear_dyn(&mut self);

    /// Copy this value into `other`; a no-op when the types differ.
    fn copy_to_dyn(&self, other: &mut dyn DynFilter);

    fn clone_box(&self) -> Box<dyn DynFilter>;

    fn eq_dyn(&self, other: &dyn DynFilter) -> bool;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<F: Filter> DynFilter for F {
    fn clear_dyn(&mut self) {
        Filter::clear(self);
    }

    fn copy_to_dyn(&self, other: &mut dyn DynFilter) {
        if let Some(target) = other.as_any_mut().downcast_mut::<F>() {
            target.clone_from(self);
        }
    }

    fn clone_box(&self) -> Box<dyn DynFilter> {
        Box::new(self.clone())
    }

    fn eq_dyn(&self, other: &dyn DynFilter) -> bool {
        other
            .as_any()
            .downcast_ref::<F>()
            .map_or(false, |o| o == self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn instantiate<F: Filter>() -> Box<dyn DynFilter> {
    Box::new(F::default())
}

struct FilterSlot {
    type_id: TypeId,
    type_name: &'static str,
    factory: fn() -> Box<dyn DynFilter>,
}

/// Ordered set of filter types shared by every envelope of a store.
pub struct FilterLayout {
    slots: Vec<FilterSlot>,
    index: HashMap<TypeId, usize>,
}

impl FilterLayout {
    pub fn builder() -> FilterLayoutBuilder {
        FilterLayoutBuilder::default()
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot index of `F`, or `None` if it was not configured.
    pub fn position<F: Filter>(&self) -> Option<usize> {
        self.index.get(&TypeId::of::<F>()).copied()
    }

    /// Typed handle for `F`.
    ///
    /// Fails with `UnknownFilter` when `F` is not part of the layout; resolve
    /// keys during setup so lookups on the hot path cannot fail.
    pub fn key<F: Filter>(&self) -> Result<FilterKey<F>> {
        self.position::<F>()
            .map(|index| FilterKey {
                index,
                _marker: PhantomData,
            })
            .ok_or_else(|| RippleError::unknown_filter(std::any::type_name::<F>()))
    }

    /// Type names in slot order.
    pub fn type_names(&self) -> Vec<&'static str> {
        self.slots.iter().map(|s| s.type_name).collect()
    }

    pub(crate) fn instantiate(&self) -> Vec<Box<dyn DynFilter>> {
        self.slots.iter().map(|s| (s.factory)()).collect()
    }

    pub(crate) fn type_name_at(&self, index: usize) -> &'static str {
        self.slots.get(index).map_or("<none>", |s| s.type_name)
    }
}

impl fmt::Debug for FilterLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.type_names()).finish()
    }
}

/// Builder for [`FilterLayout`].
#[derive(Default)]
pub struct FilterLayoutBuilder {
    slots: Vec<FilterSlot>,
    duplicate: Option<&'static str>,
}

impl FilterLayoutBuilder {
    /// Append a filter slot.
    pub fn with<F: Filter>(mut self) -> Self {
        let type_id = TypeId::of::<F>();
        let type_name = std::any::type_name::<F>();
        if self.slots.iter().any(|s| s.type_id == type_id) {
            self.duplicate.get_or_insert(type_name);
        } else {
            self.slots.push(FilterSlot {
                type_id,
                type_name,
                factory: instantiate::<F>,
            });
        }
        self
    }

    /// Returns `true` if `F` already has a slot.
    pub fn contains<F: Filter>(&self) -> bool {
        let type_id = TypeId::of::<F>();
        self.slots.iter().any(|s| s.type_id == type_id)
    }

    pub fn build(self) -> Result<Arc<FilterLayout>> {
        if let Some(name) = self.duplicate {
            return Err(RippleError::duplicate_filter(name));
        }
        let index = self
            .slots
            .iter()
            .enumerate()
            .map(|(i, s)| (s.type_id, i))
            .collect();
        Ok(Arc::new(FilterLayout {
            slots: self.slots,
            index,
        }))
    }
}

/// Pre-resolved slot index for filter type `F`.
pub struct FilterKey<F> {
    pub(crate) index: usize,
    _marker: PhantomData<fn() -> F>,
}

impl<F> FilterKey<F> {
    pub fn index(&self) -> usize {
        self.index
    }
}

impl<F> Clone for FilterKey<F> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<F> Copy for FilterKey<F> {}

impl<F> fmt::Debug for FilterKey<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterKey")
            .field("type", &std::any::type_name::<F>())
            .field("index", &self.index)
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Predicates
// ═══════════════════════════════════════════════════════════════════════════════

/// Shareable predicate over envelopes.
///
/// Predicates compose with [`and`](Self::and), [`or`](Self::or) and
/// [`negate`](Self::negate) without the store knowing any filter semantics.
#[derive(Clone)]
pub struct FilterPredicate(Arc<dyn Fn(&Envelope) -> bool + Send + Sync>);

impl FilterPredicate {
    pub fn new(f: impl Fn(&Envelope) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Matches every envelope.
    pub fn always() -> Self {
        Self::new(|_| true)
    }

    /// Tests one filter slot; `false` if the envelope has no `F` slot.
    pub fn on_filter<F: Filter>(f: impl Fn(&F) -> bool + Send + Sync + 'static) -> Self {
        Self::new(move |env| env.test::<F>(&f))
    }

    /// Matches envelopes whose payload is a `T`.
    pub fn payload_is<T: Any>() -> Self {
        Self::new(|env| env.payload().map_or(false, |p| p.is::<T>()))
    }

    pub fn and(self, other: FilterPredicate) -> Self {
        Self::new(move |env| self.test(env) && other.test(env))
    }

    pub fn or(self, other: FilterPredicate) -> Self {
        Self::new(move |env| self.test(env) || other.test(env))
    }

    pub fn negate(self) -> Self {
        Self::new(move |env| !self.test(env))
    }

    pub fn test(&self, envelope: &Envelope) -> bool {
        (self.0)(envelope)
    }
}

impl fmt::Debug for FilterPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FilterPredicate")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Marker {
        value: u32,
    }

    impl Filter for Marker {}

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Other;

    impl Filter for Other {}

    #[test]
    fn test_layout_positions() {
        let layout = FilterLayout::builder()
            .with::<Marker>()
            .with::<Other>()
            .build()
            .unwrap();

        assert_eq!(layout.len(), 2);
        assert_eq!(layout.position::<Marker>(), Some(0));
        assert_eq!(layout.position::<Other>(), Some(1));
        assert_eq!(layout.key::<Other>().unwrap().index(), 1);
    }

    #[test]
    fn test_layout_rejects_duplicates() {
        let result = FilterLayout::builder()
            .with::<Marker>()
            .with::<Marker>()
            .build();

        let err = result.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::DuplicateFilter);
    }

    #[test]
    fn test_unknown_filter_key() {
        let layout = FilterLayout::builder().with::<Marker>().build().unwrap();
        let err = layout.key::<Other>().unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::UnknownFilter);
    }

    #[test]
    fn test_dyn_filter_copy_and_eq() {
        let source: Box<dyn DynFilter> = Box::new(Marker { value: 7 });
        let mut target: Box<dyn DynFilter> = Box::new(Marker::default());
        assert!(!source.eq_dyn(target.as_ref()));

        source.copy_to_dyn(target.as_mut());
        assert!(source.eq_dyn(target.as_ref()));

        target.clear_dyn();
        assert!(target.eq_dyn(&Marker::default()));
    }

    #[test]
    fn test_dyn_filter_copy_ignores_other_types() {
        let source: Box<dyn DynFilter> = Box::new(Marker { value: 1 });
        let mut target: Box<dyn DynFilter> = Box::new(Other);
        source.copy_to_dyn(target.as_mut());
        assert!(target.eq_dyn(&Other));
    }
}
