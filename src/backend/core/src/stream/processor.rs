//! Batch event processors: one thread per consumer.
//!
//! A processor waits on its [`SequenceBarrier`], hands every available
//! envelope to its [`EventHandler`] in sequence order, and then advances its
//! own [`Sequence`]. Downstream stages and producers gate on that sequence.
//!
//! Handler failures never stop the stream. A returned error or a panic is
//! logged, counted, and recorded on the envelope it happened on.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use super::barrier::{SequenceBarrier, WaitOutcome};
use super::ring::RingBuffer;
use super::sequence::Sequence;
use crate::envelope::Envelope;
use crate::error::{ErrorSeverity, Result, RippleError};
use crate::telemetry::StoreMetrics;

/// Consumer of a stream.
///
/// Handlers run on their own processor thread; `&self` methods are invoked
/// from that thread only, so interior state needs a lock only if it is shared
/// with other threads.
pub trait EventHandler: Send + Sync + 'static {
    /// Name used for thread names, logs and recorded failures.
    fn name(&self) -> &str {
        short_type_name(std::any::type_name::<Self>())
    }

    /// Process one envelope. `end_of_batch` is set on the last envelope that
    /// was available when the batch started.
    fn on_event(&self, event: &Envelope, sequence: i64, end_of_batch: bool) -> Result<()>;

    /// Called when no new envelope arrived within the wait-strategy timeout.
    /// `sequence` is the last sequence this handler completed.
    fn on_timeout(&self, _sequence: i64) -> Result<()> {
        Ok(())
    }

    /// Called on the processor thread before the first wait.
    fn on_start(&self, _progress: SequenceProgress) {}

    /// Called on the processor thread after the last event.
    fn on_shutdown(&self) {}
}

fn short_type_name(full: &'static str) -> &'static str {
    let base = full.split('<').next().unwrap_or(full);
    match base.rfind("::") {
        Some(i) => &full[i + 2..],
        None => full,
    }
}

/// Handler backed by a closure.
pub struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&Envelope, i64, bool) -> Result<()> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn on_event(&self, event: &Envelope, sequence: i64, end_of_batch: bool) -> Result<()> {
        (self.f)(event, sequence, end_of_batch)
    }
}

/// Wrap a closure as a shareable handler.
pub fn handler_fn<F>(name: impl Into<String>, f: F) -> Arc<dyn EventHandler>
where
    F: Fn(&Envelope, i64, bool) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(FnHandler {
        name: name.into(),
        f,
    })
}

/// A handler's view of its own processor sequence.
///
/// Lets a handler release envelopes before its batch completes, which
/// unblocks downstream stages that gate on it while the handler itself waits.
#[derive(Clone)]
pub struct SequenceProgress {
    sequence: Sequence,
    ring: Arc<RingBuffer>,
    alert: Arc<AtomicBool>,
}

impl SequenceProgress {
    pub(crate) fn new(sequence: Sequence, ring: Arc<RingBuffer>, alert: Arc<AtomicBool>) -> Self {
        Self {
            sequence,
            ring,
            alert,
        }
    }

    /// Last sequence released by this handler.
    pub fn current(&self) -> i64 {
        self.sequence.get()
    }

    /// Mark everything up to `sequence` as processed. Never moves backwards.
    pub fn release(&self, sequence: i64) {
        self.sequence.advance_to(sequence);
        self.ring.signal().notify_all();
    }

    /// Returns `true` once the processor has been asked to stop.
    pub fn is_halted(&self) -> bool {
        self.alert.load(Ordering::Acquire)
    }
}

pub(crate) enum Task {
    Handler(Arc<dyn EventHandler>),
    /// Returns processed slots to the clear state
    Reaper,
}

impl Task {
    fn name(&self) -> &str {
        match self {
            Task::Handler(handler) => handler.name(),
            Task::Reaper => "reaper",
        }
    }
}

pub(crate) struct BatchEventProcessor {
    ring: Arc<RingBuffer>,
    barrier: SequenceBarrier,
    sequence: Sequence,
    task: Task,
    failures: Arc<AtomicU64>,
}

impl BatchEventProcessor {
    pub(crate) fn new(
        ring: Arc<RingBuffer>,
        dependents: Vec<Sequence>,
        sequence: Sequence,
        task: Task,
        failures: Arc<AtomicU64>,
    ) -> Self {
        let barrier = SequenceBarrier::new(ring.clone(), dependents);
        Self {
            ring,
            barrier,
            sequence,
            task,
            failures,
        }
    }

    /// Start the processor on a named thread.
    pub(crate) fn spawn(self, thread_name: String) -> Result<ProcessorHandle> {
        let name = self.task.name().to_string();
        let sequence = self.sequence.clone();
        let alert = self.barrier.alert_flag();
        let ring = self.ring.clone();

        let thread = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || self.run())
            .map_err(|e| RippleError::thread_spawn_failed(&thread_name, e))?;

        Ok(ProcessorHandle {
            name,
            sequence,
            alert,
            ring,
            thread: Some(thread),
        })
    }

    fn run(self) {
        tracing::debug!(handler = %self.task.name(), ring = %self.ring.name(), "Processor started");

        if let Task::Handler(handler) = &self.task {
            handler.on_start(SequenceProgress::new(
                self.sequence.clone(),
                self.ring.clone(),
                self.barrier.alert_flag(),
            ));
        }

        let mut next = self.sequence.get() + 1;
        loop {
            match self.barrier.wait_for(next) {
                WaitOutcome::Available(available) => {
                    for sequence in next..=available {
                        self.process(sequence, sequence == available);
                    }
                    self.sequence.advance_to(available);
                    self.ring.signal().notify_all();
                    next = available + 1;
                }
                WaitOutcome::Timeout => {
                    if let Task::Handler(handler) = &self.task {
                        let last = self.sequence.get();
                        if let Err(error) = guarded(handler.name(), || handler.on_timeout(last)) {
                            self.failures.fetch_add(1, Ordering::Relaxed);
                            StoreMetrics::handler_error(handler.name());
                            tracing::warn!(handler = %handler.name(), error = %error, "Timeout callback failed");
                        }
                    }
                }
                WaitOutcome::Alerted => break,
            }
        }

        if let Task::Handler(handler) = &self.task {
            handler.on_shutdown();
        }
        tracing::debug!(
            handler = %self.task.name(),
            sequence = self.sequence.get(),
            "Processor stopped"
        );
    }

    fn process(&self, sequence: i64, end_of_batch: bool) {
        match &self.task {
            Task::Handler(handler) => {
                let result = {
                    let slot = self.ring.read(sequence);
                    guarded(handler.name(), || {
                        handler.on_event(&slot.envelope, sequence, end_of_batch)
                    })
                };
                if let Err(error) = result {
                    self.record_failure(handler.name(), sequence, &error);
                }
            }
            Task::Reaper => {
                let mut slot = self.ring.write(sequence);
                if slot.sequence == sequence {
                    slot.envelope.clear();
                }
            }
        }
    }

    fn record_failure(&self, handler: &str, sequence: i64, error: &RippleError) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        StoreMetrics::handler_error(handler);

        if error.severity() == ErrorSeverity::Critical {
            error.log();
        } else {
            tracing::warn!(handler = %handler, sequence, error = %error, "Event handler failed");
        }

        let mut slot = self.ring.write(sequence);
        if slot.sequence == sequence {
            slot.envelope.add_error(handler, error.message());
        }
    }
}

/// Run a handler callback, converting a panic into an error.
fn guarded(handler: &str, f: impl FnOnce() -> Result<()>) -> Result<()> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(panic) => Err(RippleError::handler_failed(handler, panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

/// Control handle of a running processor.
pub struct ProcessorHandle {
    name: String,
    sequence: Sequence,
    alert: Arc<AtomicBool>,
    ring: Arc<RingBuffer>,
    thread: Option<JoinHandle<()>>,
}

impl ProcessorHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sequence(&self) -> i64 {
        self.sequence.get()
    }

    pub(crate) fn sequence_handle(&self) -> &Sequence {
        &self.sequence
    }

    /// Ask the processor to exit after its current batch.
    pub fn halt(&self) {
        self.alert.store(true, Ordering::Release);
        self.ring.signal().notify_all();
    }

    /// Wait for the processor thread to exit. A processor cannot join
    /// itself; called from its own thread this only detaches it.
    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() == std::thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                tracing::error!(handler = %self.name, "Processor thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for ProcessorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorHandle")
            .field("name", &self.name)
            .field("sequence", &self.sequence())
            .finish()
    }
}
