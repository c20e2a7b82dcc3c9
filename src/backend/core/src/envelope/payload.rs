//! Reference-counted opaque payloads.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Shared handle to an arbitrary immutable domain object.
///
/// Cloning retains the object (strong count + 1) and dropping releases it.
/// The store never inspects the value; handlers downcast to the concrete
/// type they expect.
#[derive(Clone)]
pub struct Payload {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl Payload {
    /// Wrap a value.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Arc::new(value),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Wrap a value that is already shared.
    pub fn from_arc<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        Self {
            value,
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Borrow the value as `T`.
    pub fn get<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Returns `true` if the value is a `T`.
    pub fn is<T: Any>(&self) -> bool {
        self.value.is::<T>()
    }

    /// Obtain a typed shared handle to the value.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.value.clone().downcast::<T>().ok()
    }

    /// Number of live handles to the underlying value.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.value)
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Returns `true` if both handles share the same value.
    pub fn ptr_eq(&self, other: &Payload) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("type", &self.type_name)
            .field("refs", &self.ref_count())
            .finish()
    }
}
