use std::collections::{HashSet, VecDeque};

/// Bounded set of recently claimed keys with FIFO eviction.
///
/// A key evicted here can be claimed again, so the capacity has to exceed
/// the number of keys that may still see late events.
#[derive(Debug)]
pub(crate) struct DedupCache {
    capacity: usize,
    keys: HashSet<String>,
    order: VecDeque<String>,
}

impl DedupCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            keys: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    /// Remember `key`, evicting the oldest key when full. Returns `false` if
    /// the key was already present.
    pub(crate) fn insert(&mut self, key: String) -> bool {
        if self.keys.contains(&key) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }
        self.keys.insert(key.clone());
        self.order.push_back(key);
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }
}
