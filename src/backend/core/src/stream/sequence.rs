//! Sequence counters shared between producers and consumers.

use crossbeam::utils::CachePadded;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Initial value of every sequence: nothing published or consumed yet.
pub const INITIAL_SEQUENCE: i64 = -1;

/// A cache-padded atomic sequence number.
#[derive(Clone)]
pub struct Sequence(Arc<CachePadded<AtomicI64>>);

impl Sequence {
    pub fn new(initial: i64) -> Self {
        Self(Arc::new(CachePadded::new(AtomicI64::new(initial))))
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::Release);
    }

    /// Raise the sequence to `value`; never moves it backwards.
    pub fn advance_to(&self, value: i64) {
        self.0.fetch_max(value, Ordering::AcqRel);
    }

    pub(crate) fn fetch_increment(&self) -> i64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn compare_exchange(&self, current: i64, new: i64) -> bool {
        self.0
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for Sequence {
    fn default() -> Self {
        Self::new(INITIAL_SEQUENCE)
    }
}

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Sequence").field(&self.get()).finish()
    }
}

/// Smallest value among `sequences`, or `default` if there are none.
pub fn minimum(sequences: &[Sequence], default: i64) -> i64 {
    sequences.iter().map(Sequence::get).min().unwrap_or(default)
}
