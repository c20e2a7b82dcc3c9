use crossbeam::channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use super::{is_aggregate, Aggregate, AggregateOutcome, Counters, KeyFn};
use crate::config::AggregatorConfig;
use crate::envelope::{ContextFilter, Envelope, EventType, EventTypeFilter, Payload, UpdateKind};
use crate::error::Result;
use crate::store::{Republisher, WeakEventStore};
use crate::stream::EventHandler;
use crate::telemetry::AggregatorMetrics;

/// Dispatcher to worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    /// Collect events for `key` from `sequence` on.
    Assign {
        key: String,
        since: Instant,
        sequence: i64,
    },
    /// Publish whatever was collected for `key` now.
    Expire { key: String },
}

/// Worker to dispatcher, sent once the aggregate for `key` is out.
#[derive(Debug, Clone)]
pub(crate) struct Report {
    pub(crate) worker: usize,
    pub(crate) key: String,
    pub(crate) outcome: AggregateOutcome,
}

enum Claim {
    Idle,
    Collecting {
        key: String,
        since: Instant,
        sequence: i64,
        events: Vec<Envelope>,
    },
}

pub(crate) struct AggregationWorker {
    name: String,
    index: usize,
    config: AggregatorConfig,
    key_fn: KeyFn,
    inbox: Receiver<Command>,
    reports: Sender<Report>,
    store: WeakEventStore,
    claim: Mutex<Claim>,
    republisher: Republisher,
    counters: Arc<Counters>,
}

impl AggregationWorker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        index: usize,
        config: AggregatorConfig,
        key_fn: KeyFn,
        inbox: Receiver<Command>,
        reports: Sender<Report>,
        store: WeakEventStore,
        counters: Arc<Counters>,
    ) -> Self {
        let name = format!("demux-worker-{}", index);
        Self {
            republisher: Republisher::new(name.clone()),
            name,
            index,
            config,
            key_fn,
            inbox,
            reports,
            store,
            claim: Mutex::new(Claim::Idle),
            counters,
        }
    }

    fn deadline(&self, since: Instant) -> Instant {
        since + self.config.timeout
    }

    /// Apply pending dispatcher commands. Must run before looking at an
    /// event, since an assignment is sent before its sequence is released.
    fn drain_commands(&self, claim: &mut Claim) {
        while let Ok(command) = self.inbox.try_recv() {
            match command {
                Command::Assign { key, since, sequence } => {
                    if let Claim::Collecting { key: previous, .. } = claim {
                        tracing::warn!(worker = %self.name, previous = %previous, key = %key, "Assigned while busy");
                    }
                    *claim = Claim::Collecting {
                        key,
                        since,
                        sequence,
                        events: Vec::with_capacity(self.config.group_size),
                    };
                }
                Command::Expire { key } => {
                    let matches = matches!(&*claim, Claim::Collecting { key: current, .. } if *current == key);
                    if matches {
                        self.finish(claim, AggregateOutcome::Partial);
                    }
                }
            }
        }
    }

    /// Publish the collected events and report back. Leaves the worker idle.
    fn finish(&self, claim: &mut Claim, outcome: AggregateOutcome) {
        let Claim::Collecting {
            key,
            since,
            sequence,
            events,
        } = std::mem::replace(claim, Claim::Idle)
        else {
            return;
        };

        let elapsed = since.elapsed();
        let aggregate = Aggregate {
            id: Uuid::new_v4(),
            key: key.clone(),
            outcome,
            events,
            sequence,
            elapsed,
        };
        tracing::debug!(
            worker = %self.name,
            key = %key,
            outcome = %outcome,
            events = aggregate.events.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Aggregate finished"
        );

        match outcome {
            AggregateOutcome::Complete => self.counters.completed.fetch_add(1, Ordering::Relaxed),
            AggregateOutcome::Partial => self.counters.timed_out.fetch_add(1, Ordering::Relaxed),
        };
        AggregatorMetrics::finished(outcome.as_str(), elapsed);

        if let Some(store) = self.store.upgrade() {
            let envelope = self.to_envelope(store.new_envelope(), aggregate);
            self.republisher.submit(&store, envelope);
        }

        let report = Report {
            worker: self.index,
            key,
            outcome,
        };
        if self.reports.send(report).is_err() {
            tracing::debug!(worker = %self.name, "Dispatcher gone, report dropped");
        }
    }

    fn to_envelope(&self, mut envelope: Envelope, aggregate: Aggregate) -> Envelope {
        if let Ok(context) = envelope.filter_mut::<ContextFilter>() {
            context.context.push_str(&self.config.output_context);
        }
        if envelope.layout().position::<EventTypeFilter>().is_some() {
            let update = match aggregate.outcome {
                AggregateOutcome::Complete => UpdateKind::Full,
                AggregateOutcome::Partial => UpdateKind::Partial,
            };
            if let Ok(filter) = envelope.filter_mut::<EventTypeFilter>() {
                *filter = EventTypeFilter::new(EventType::Aggregate, update);
            }
        }
        envelope.set_payload(Payload::new(aggregate));
        envelope
    }

    /// Finish a claim whose deadline has passed by `now`.
    fn expire_if_due(&self, claim: &mut Claim, now: Instant) {
        let due = matches!(&*claim, Claim::Collecting { since, .. } if now > self.deadline(*since));
        if due {
            self.finish(claim, AggregateOutcome::Partial);
        }
    }
}

impl EventHandler for AggregationWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_event(&self, event: &Envelope, sequence: i64, _end_of_batch: bool) -> Result<()> {
        if let Some(store) = self.store.upgrade() {
            self.republisher.flush(&store);
        }

        let mut claim = self.claim.lock();
        self.drain_commands(&mut claim);
        if is_aggregate(event) {
            return Ok(());
        }

        // an event arriving after the deadline closes the claim without
        // joining it
        let arrival = event.arrival_time().unwrap_or_else(Instant::now);
        self.expire_if_due(&mut claim, arrival);

        let complete = match &mut *claim {
            Claim::Collecting {
                key,
                sequence: first,
                events,
                ..
            } if sequence >= *first => {
                if (self.key_fn)(event).as_deref() != Some(key.as_str()) {
                    return Ok(());
                }
                events.push(event.clone());
                events.len() >= self.config.group_size
            }
            _ => false,
        };
        if complete {
            self.finish(&mut claim, AggregateOutcome::Complete);
        }
        Ok(())
    }

    fn on_timeout(&self, _sequence: i64) -> Result<()> {
        if let Some(store) = self.store.upgrade() {
            self.republisher.flush(&store);
        }
        let mut claim = self.claim.lock();
        self.drain_commands(&mut claim);
        self.expire_if_due(&mut claim, Instant::now());
        Ok(())
    }

    fn on_shutdown(&self) {
        let mut claim = self.claim.lock();
        self.drain_commands(&mut claim);
        if let Claim::Collecting { key, events, since, .. } = &*claim {
            self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                worker = %self.name,
                key = %key,
                events = events.len(),
                elapsed_ms = since.elapsed().as_millis() as u64,
                "Abandoning unfinished aggregate on shutdown"
            );
        }
        *claim = Claim::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EventStore;
    use crossbeam::channel::unbounded;

    struct Harness {
        store: EventStore,
        worker: AggregationWorker,
        commands: Sender<Command>,
        reports: Receiver<Report>,
    }

    fn harness(group_size: usize) -> Harness {
        let store = EventStore::builder().ring_capacity(16).build().unwrap();
        let (command_tx, command_rx) = unbounded();
        let (report_tx, report_rx) = unbounded();
        let config = AggregatorConfig {
            workers: 1,
            group_size,
            ..AggregatorConfig::default()
        };
        let key_fn: KeyFn = Arc::new(|e: &Envelope| e.payload_as::<&'static str>().map(|s| s.to_string()));
        let worker = AggregationWorker::new(
            0,
            config,
            key_fn,
            command_rx,
            report_tx,
            store.downgrade(),
            Arc::new(Counters::default()),
        );
        Harness {
            store,
            worker,
            commands: command_tx,
            reports: report_rx,
        }
    }

    impl Harness {
        fn event(&self, key: &'static str, sequence: i64) -> Envelope {
            let mut env = self.store.new_envelope();
            env.set_payload(Payload::new(key));
            env.stamp(sequence);
            env
        }

        fn assign(&self, key: &str, sequence: i64) {
            self.commands
                .send(Command::Assign {
                    key: key.to_string(),
                    since: Instant::now(),
                    sequence,
                })
                .unwrap();
        }
    }

    #[test]
    fn test_complete_group_republished() {
        let h = harness(2);
        h.assign("a", 1);

        // before the claim sequence, other key, then the group
        h.worker.on_event(&h.event("a", 0), 0, false).unwrap();
        h.worker.on_event(&h.event("b", 1), 1, false).unwrap();
        h.worker.on_event(&h.event("a", 2), 2, false).unwrap();
        assert!(h.reports.try_recv().is_err());
        h.worker.on_event(&h.event("a", 3), 3, true).unwrap();

        let report = h.reports.try_recv().unwrap();
        assert_eq!(report.key, "a");
        assert_eq!(report.outcome, AggregateOutcome::Complete);

        let published = h.store.ring().get(0).unwrap();
        let aggregate = published.payload_as::<Aggregate>().unwrap();
        assert_eq!(aggregate.events.len(), 2);
        assert_eq!(aggregate.sequence, 1);
        assert_eq!(published.context(), "aggregate");
    }

    #[test]
    fn test_expire_publishes_partial() {
        let h = harness(3);
        h.assign("a", 0);
        h.worker.on_event(&h.event("a", 0), 0, true).unwrap();

        h.commands.send(Command::Expire { key: "other".into() }).unwrap();
        h.worker.on_timeout(0).unwrap();
        assert!(h.reports.try_recv().is_err());

        h.commands.send(Command::Expire { key: "a".into() }).unwrap();
        h.worker.on_timeout(0).unwrap();
        let report = h.reports.try_recv().unwrap();
        assert_eq!(report.outcome, AggregateOutcome::Partial);

        let published = h.store.ring().get(0).unwrap();
        let aggregate = published.payload_as::<Aggregate>().unwrap();
        assert!(!aggregate.is_complete());
        assert_eq!(aggregate.events.len(), 1);
    }

    #[test]
    fn test_shutdown_counts_abandoned_claim() {
        let h = harness(3);
        h.assign("a", 0);
        h.worker.on_event(&h.event("a", 0), 0, true).unwrap();

        h.worker.on_shutdown();
        assert_eq!(h.worker.counters.abandoned.load(Ordering::Relaxed), 1);
        assert!(h.reports.try_recv().is_err());

        // an idle worker has nothing to abandon
        h.worker.on_shutdown();
        assert_eq!(h.worker.counters.abandoned.load(Ordering::Relaxed), 1);
    }
}
