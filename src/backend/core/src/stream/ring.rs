//! Fixed-capacity ring of pre-allocated envelopes.

use crossbeam::utils::Backoff;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::sequence::{minimum, Sequence, INITIAL_SEQUENCE};
use super::wait::{Signal, WaitStrategy};
use crate::envelope::{Envelope, FilterLayout};
use crate::error::{Result, RippleError};

/// Whether one or several threads publish into a ring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProducerType {
    /// One publishing thread. Handlers that republish with
    /// [`RingBuffer::try_publish`] still count as extra producers.
    Single,
    /// Any number of publishing threads; publishes become visible in order
    #[default]
    Multi,
}

/// One ring position: the envelope and the sequence last written into it.
pub(crate) struct Slot {
    pub(crate) sequence: i64,
    pub(crate) envelope: Envelope,
}

/// Circular buffer with a monotonic cursor and consumer gating.
///
/// A producer may not claim sequence `n` until every gating sequence has
/// reached `n - capacity`, so slots are never overwritten before the slowest
/// consumer has passed them.
pub struct RingBuffer {
    name: String,
    slots: Box<[RwLock<Slot>]>,
    mask: i64,
    producer: ProducerType,
    claimed: Sequence,
    cursor: Sequence,
    gating: RwLock<Vec<Sequence>>,
    signal: Signal,
    halted: AtomicBool,
    /// Set once anything has claimed through `try_publish`.
    shared: AtomicBool,
}

impl RingBuffer {
    /// Create a ring with `capacity` clear envelopes.
    pub fn new(
        name: impl Into<String>,
        capacity: usize,
        producer: ProducerType,
        wait: WaitStrategy,
        layout: Arc<FilterLayout>,
    ) -> Result<Self> {
        let name = name.into();
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(RippleError::invalid_capacity(&name, capacity));
        }

        let slots = (0..capacity)
            .map(|_| {
                RwLock::new(Slot {
                    sequence: INITIAL_SEQUENCE,
                    envelope: Envelope::new(layout.clone()),
                })
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            name,
            slots,
            mask: capacity as i64 - 1,
            producer,
            claimed: Sequence::default(),
            cursor: Sequence::default(),
            gating: RwLock::new(Vec::new()),
            signal: Signal::new(wait),
            halted: AtomicBool::new(false),
            shared: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn producer_type(&self) -> ProducerType {
        self.producer
    }

    /// Highest published sequence.
    pub fn cursor(&self) -> i64 {
        self.cursor.get()
    }

    pub(crate) fn cursor_sequence(&self) -> &Sequence {
        &self.cursor
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Replace the sequences that gate producers.
    pub fn set_gating(&self, sequences: Vec<Sequence>) {
        *self.gating.write() = sequences;
        self.signal.notify_all();
    }

    /// Number of slots a producer can claim without waiting.
    pub fn remaining_capacity(&self) -> usize {
        let consumed = minimum(&self.gating.read(), self.claimed.get());
        let in_flight = self.claimed.get() - consumed;
        (self.capacity() as i64 - in_flight).max(0) as usize
    }

    fn index(&self, sequence: i64) -> usize {
        (sequence & self.mask) as usize
    }

    fn min_gating(&self, default: i64) -> i64 {
        minimum(&self.gating.read(), default)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Publishing
    // ─────────────────────────────────────────────────────────────────────────

    /// Claim the next sequence, populate its slot in place with `writer`, and
    /// make it visible to consumers.
    ///
    /// Blocks while the ring is full; fails only when the ring is halted.
    pub fn publish(&self, writer: impl FnOnce(&mut Envelope, i64)) -> Result<i64> {
        if self.is_halted() {
            return Err(RippleError::store_stopped());
        }
        let sequence = self.claimed.fetch_increment();
        self.wait_for_capacity(sequence)?;
        let in_order = self.producer == ProducerType::Multi || self.shared.load(Ordering::SeqCst);
        self.write_and_commit(sequence, in_order, writer);
        Ok(sequence)
    }

    /// Like [`publish`](Self::publish) but returns `Ok(None)` instead of
    /// blocking when the ring is full.
    ///
    /// Always commits in sequence order, so it is safe next to a
    /// [`Single`](ProducerType::Single) producer.
    pub fn try_publish(&self, writer: impl FnOnce(&mut Envelope, i64)) -> Result<Option<i64>> {
        // published before the claim so a single producer claiming after us
        // sees it and commits in order too
        if !self.shared.load(Ordering::Acquire) {
            self.shared.store(true, Ordering::SeqCst);
        }
        let sequence = loop {
            if self.is_halted() {
                return Err(RippleError::store_stopped());
            }
            let current = self.claimed.get();
            let next = current + 1;
            if next - self.capacity() as i64 > self.min_gating(next) {
                return Ok(None);
            }
            if self.claimed.compare_exchange(current, next) {
                break next;
            }
        };
        self.write_and_commit(sequence, true, writer);
        Ok(Some(sequence))
    }

    fn wait_for_capacity(&self, sequence: i64) -> Result<()> {
        let wrap_point = sequence - self.capacity() as i64;
        if wrap_point <= self.min_gating(sequence) {
            return Ok(());
        }
        tracing::trace!(ring = %self.name, sequence, "Producer waiting for consumers");
        loop {
            let ready = self.signal.wait(|| {
                self.is_halted() || wrap_point <= self.min_gating(sequence)
            });
            if self.is_halted() {
                return Err(RippleError::store_stopped());
            }
            if ready {
                return Ok(());
            }
        }
    }

    fn write_and_commit(&self, sequence: i64, in_order: bool, writer: impl FnOnce(&mut Envelope, i64)) {
        {
            let mut slot = self.slots[self.index(sequence)].write();
            slot.envelope.clear();
            slot.envelope.stamp(sequence);
            slot.sequence = sequence;
            writer(&mut slot.envelope, sequence);
        }

        if in_order {
            // publishes become visible strictly in sequence order
            let backoff = Backoff::new();
            while self.cursor.get() != sequence - 1 {
                if self.is_halted() {
                    return;
                }
                backoff.snooze();
            }
        }
        self.cursor.set(sequence);
        self.signal.notify_all();
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Consuming
    // ─────────────────────────────────────────────────────────────────────────

    pub(crate) fn read(&self, sequence: i64) -> RwLockReadGuard<'_, Slot> {
        self.slots[self.index(sequence)].read()
    }

    pub(crate) fn write(&self, sequence: i64) -> RwLockWriteGuard<'_, Slot> {
        self.slots[self.index(sequence)].write()
    }

    pub(crate) fn signal(&self) -> &Signal {
        &self.signal
    }

    /// Copy of the envelope at `sequence`, if it is still resident.
    pub fn get(&self, sequence: i64) -> Option<Envelope> {
        if sequence < 0 || sequence > self.cursor() {
            return None;
        }
        let slot = self.read(sequence);
        (slot.sequence == sequence).then(|| slot.envelope.clone())
    }

    /// Visit resident envelopes newest first until `visit` returns `false`.
    ///
    /// The scan stops at the first slot that has been overwritten since the
    /// scan started.
    pub fn scan_back(&self, mut visit: impl FnMut(i64, &Envelope) -> bool) {
        let cursor = self.cursor();
        let lowest = (cursor - self.capacity() as i64 + 1).max(0);
        for sequence in (lowest..=cursor).rev() {
            let slot = self.read(sequence);
            if slot.sequence != sequence || !visit(sequence, &slot.envelope) {
                break;
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Reject further publishes and wake every waiting thread.
    pub fn halt(&self) {
        self.halted.store(true, Ordering::Release);
        self.signal.notify_all();
    }

    /// Halt and return every slot to the clear state.
    pub fn shutdown(&self) {
        self.halt();
        for slot in self.slots.iter() {
            let mut slot = slot.write();
            slot.sequence = INITIAL_SEQUENCE;
            slot.envelope.clear();
        }
        tracing::debug!(ring = %self.name, "Ring buffer shut down");
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("name", &self.name)
            .field("capacity", &self.capacity())
            .field("cursor", &self.cursor())
            .field("producer", &self.producer)
            .field("halted", &self.is_halted())
            .finish()
    }
}
