//! Bounded multi-producer ring streams.
//!
//! This module provides the in-process transport under the event store:
//!
//! - **RingBuffer**: pre-allocated envelopes, monotonic cursor, producer gating
//! - **Sequence**: cache-padded progress counters
//! - **SequenceBarrier**: waits for the cursor and upstream stages
//! - **WaitStrategy**: blocking, yielding or busy-spin waits with a timeout
//! - **BatchEventProcessor**: one thread per handler, in-order batches

pub mod barrier;
pub mod processor;
pub mod ring;
pub mod sequence;
pub mod wait;

pub use barrier::{SequenceBarrier, WaitOutcome};
pub use processor::{handler_fn, EventHandler, FnHandler, ProcessorHandle, SequenceProgress};
pub use ring::{ProducerType, RingBuffer};
pub use sequence::{Sequence, INITIAL_SEQUENCE};
pub use wait::{WaitStrategy, WaitStrategyKind};

pub(crate) use processor::{BatchEventProcessor, Task};
