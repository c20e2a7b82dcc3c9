//! The dispatcher assigns aggregation keys to workers.
//!
//! It is the only owner of worker state. Workers learn about claims and
//! forced expiries through their command channel and report back when they
//! publish; the dispatcher frees a worker only on that report.

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::dedup::DedupCache;
use super::worker::{Command, Report};
use super::{is_aggregate, Counters, KeyFn};
use crate::config::AggregatorConfig;
use crate::envelope::Envelope;
use crate::error::{Result, RippleError};
use crate::stream::{EventHandler, SequenceProgress};
use crate::telemetry::AggregatorMetrics;

/// Poll interval while every busy worker has already been told to expire.
const EXPIRY_POLL: Duration = Duration::from_millis(5);
const MIN_PARK: Duration = Duration::from_micros(200);

#[derive(Debug, Clone, PartialEq, Eq)]
enum WorkerSlot {
    Free,
    Claimed {
        key: String,
        since: Instant,
        expiring: bool,
    },
}

struct DispatchState {
    slots: Vec<WorkerSlot>,
    dedup: DedupCache,
    progress: Option<SequenceProgress>,
}

impl DispatchState {
    fn free_worker(&self) -> Option<usize> {
        self.slots.iter().position(|s| *s == WorkerSlot::Free)
    }

    /// Worker currently holding `key`. A claimed key may already have been
    /// evicted from the dedup cache.
    fn owner(&self, key: &str) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| matches!(s, WorkerSlot::Claimed { key: k, .. } if k == key))
    }

    /// Oldest claim past its deadline that has not been told to expire.
    fn oldest_expired(&self, now: Instant, timeout: Duration) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| match slot {
                WorkerSlot::Claimed {
                    since,
                    expiring: false,
                    ..
                } if now.saturating_duration_since(*since) >= timeout => Some((i, *since)),
                _ => None,
            })
            .min_by_key(|&(_, since)| since)
            .map(|(i, _)| i)
    }

    /// Shortest time until a busy worker reaches its deadline.
    fn min_remaining(&self, now: Instant, timeout: Duration) -> Duration {
        self.slots
            .iter()
            .filter_map(|slot| match slot {
                WorkerSlot::Claimed {
                    since,
                    expiring: false,
                    ..
                } => Some((*since + timeout).saturating_duration_since(now)),
                _ => None,
            })
            .min()
            .unwrap_or(EXPIRY_POLL)
            .max(MIN_PARK)
    }
}

pub(crate) struct Dispatcher {
    config: AggregatorConfig,
    key_fn: KeyFn,
    commands: Vec<Sender<Command>>,
    reports: Receiver<Report>,
    state: Mutex<DispatchState>,
    counters: Arc<Counters>,
}

impl Dispatcher {
    pub(crate) fn new(
        config: AggregatorConfig,
        key_fn: KeyFn,
        commands: Vec<Sender<Command>>,
        reports: Receiver<Report>,
        counters: Arc<Counters>,
    ) -> Self {
        let state = DispatchState {
            slots: vec![WorkerSlot::Free; commands.len()],
            dedup: DedupCache::new(config.dedup_capacity),
            progress: None,
        };
        Self {
            config,
            key_fn,
            commands,
            reports,
            state: Mutex::new(state),
            counters,
        }
    }

    fn apply(&self, state: &mut DispatchState, report: Report) {
        match state.slots.get(report.worker) {
            Some(WorkerSlot::Claimed { key, .. }) if *key == report.key => {
                state.slots[report.worker] = WorkerSlot::Free;
                self.counters.in_flight.fetch_sub(1, Ordering::Relaxed);
                tracing::trace!(worker = report.worker, key = %report.key, outcome = %report.outcome, "Worker freed");
            }
            _ => {
                tracing::debug!(worker = report.worker, key = %report.key, "Ignoring stale worker report");
            }
        }
    }

    fn drain_reports(&self, state: &mut DispatchState) {
        while let Ok(report) = self.reports.try_recv() {
            self.apply(state, report);
        }
    }

    fn send(&self, worker: usize, command: Command) -> Result<()> {
        self.commands[worker]
            .send(command)
            .map_err(|_| RippleError::internal(format!("Aggregation worker {} is gone", worker)))
    }

    fn claim(&self, state: &mut DispatchState, worker: usize, key: String, sequence: i64) -> Result<()> {
        let since = Instant::now();
        debug_assert!(state.owner(&key).is_none());

        state.slots[worker] = WorkerSlot::Claimed {
            key: key.clone(),
            since,
            expiring: false,
        };
        state.dedup.insert(key.clone());
        self.counters.claimed.fetch_add(1, Ordering::Relaxed);
        self.counters.in_flight.fetch_add(1, Ordering::Relaxed);
        AggregatorMetrics::claimed();
        tracing::debug!(worker, key = %key, sequence, "Claimed aggregation key");

        // the worker must hold the claim before it can see this sequence
        self.send(worker, Command::Assign { key, since, sequence })?;
        if let Some(progress) = &state.progress {
            progress.release(sequence);
        }
        Ok(())
    }

    fn expire(&self, state: &mut DispatchState, worker: usize) -> Result<()> {
        if let WorkerSlot::Claimed { key, since, expiring } = &mut state.slots[worker] {
            *expiring = true;
            let key = key.clone();
            self.counters.forced_timeouts.fetch_add(1, Ordering::Relaxed);
            AggregatorMetrics::forced_timeout();
            tracing::debug!(
                worker,
                key = %key,
                elapsed_ms = since.elapsed().as_millis() as u64,
                "Forcing timeout to free a worker"
            );
            self.send(worker, Command::Expire { key })?;
        }
        Ok(())
    }
}

impl EventHandler for Dispatcher {
    fn name(&self) -> &str {
        "demux-dispatcher"
    }

    fn on_start(&self, progress: SequenceProgress) {
        self.state.lock().progress = Some(progress);
    }

    fn on_event(&self, event: &Envelope, sequence: i64, _end_of_batch: bool) -> Result<()> {
        if is_aggregate(event) {
            return Ok(());
        }
        let Some(key) = (self.key_fn)(event) else {
            return Ok(());
        };

        let mut state = self.state.lock();
        self.drain_reports(&mut state);

        if state.dedup.contains(&key) || state.owner(&key).is_some() {
            self.counters.dropped_duplicates.fetch_add(1, Ordering::Relaxed);
            AggregatorMetrics::duplicate_dropped();
            tracing::trace!(key = %key, sequence, "Dropping event for already claimed key");
            return Ok(());
        }

        loop {
            if let Some(worker) = state.free_worker() {
                return self.claim(&mut state, worker, key, sequence);
            }

            // every worker is busy: expire one past its deadline or park
            let now = Instant::now();
            if let Some(worker) = state.oldest_expired(now, self.config.timeout) {
                self.expire(&mut state, worker)?;
            }
            if let Some(progress) = &state.progress {
                if progress.is_halted() {
                    tracing::debug!(key = %key, sequence, "Store halted while waiting for a free worker");
                    return Ok(());
                }
                progress.release(sequence - 1);
            }

            let park = state.min_remaining(now, self.config.timeout);
            match self.reports.recv_timeout(park) {
                Ok(report) => self.apply(&mut state, report),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(RippleError::internal("Aggregation workers disconnected"));
                }
            }
            self.drain_reports(&mut state);
        }
    }

    fn on_timeout(&self, _sequence: i64) -> Result<()> {
        let mut state = self.state.lock();
        self.drain_reports(&mut state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::AggregateOutcome;
    use crate::envelope::{FilterLayout, Payload};
    use crate::stream::{ProducerType, RingBuffer, Sequence, WaitStrategy};
    use crossbeam::channel::unbounded;
    use std::sync::atomic::AtomicBool;

    struct Harness {
        dispatcher: Arc<Dispatcher>,
        inboxes: Vec<Receiver<Command>>,
        reports: Sender<Report>,
        counters: Arc<Counters>,
        layout: Arc<FilterLayout>,
    }

    fn harness(workers: usize, timeout: Duration) -> Harness {
        harness_with(AggregatorConfig {
            workers,
            timeout,
            ..AggregatorConfig::default()
        })
    }

    fn harness_with(config: AggregatorConfig) -> Harness {
        let workers = config.workers;
        let (senders, inboxes): (Vec<_>, Vec<_>) = (0..workers).map(|_| unbounded()).unzip();
        let (report_tx, report_rx) = unbounded();
        let counters = Arc::new(Counters::default());
        let key_fn: KeyFn = Arc::new(|e: &Envelope| e.payload_as::<&'static str>().map(|s| s.to_string()));
        let dispatcher = Arc::new(Dispatcher::new(config, key_fn, senders, report_rx, counters.clone()));

        let layout = FilterLayout::builder().build().unwrap();
        let ring = Arc::new(
            RingBuffer::new("dispatch", 8, ProducerType::Single, WaitStrategy::default(), layout.clone())
                .unwrap(),
        );
        dispatcher.on_start(SequenceProgress::new(
            Sequence::default(),
            ring,
            Arc::new(AtomicBool::new(false)),
        ));

        Harness {
            dispatcher,
            inboxes,
            reports: report_tx,
            counters,
            layout,
        }
    }

    impl Harness {
        fn event(&self, key: &'static str) -> Envelope {
            let mut env = Envelope::new(self.layout.clone());
            env.set_payload(Payload::new(key));
            env
        }

        fn report(&self, worker: usize, key: &str, outcome: AggregateOutcome) {
            self.reports
                .send(Report {
                    worker,
                    key: key.into(),
                    outcome,
                })
                .unwrap();
        }
    }

    #[test]
    fn test_claims_and_drops_duplicates() {
        let h = harness(2, Duration::from_secs(1));
        h.dispatcher.on_event(&h.event("k1"), 0, false).unwrap();
        h.dispatcher.on_event(&h.event("k1"), 1, false).unwrap();
        h.dispatcher.on_event(&h.event("k2"), 2, true).unwrap();

        match h.inboxes[0].try_recv().unwrap() {
            Command::Assign { key, sequence, .. } => {
                assert_eq!(key, "k1");
                assert_eq!(sequence, 0);
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert!(matches!(h.inboxes[1].try_recv().unwrap(), Command::Assign { key, .. } if key == "k2"));
        assert_eq!(h.counters.dropped_duplicates.load(Ordering::Relaxed), 1);
        assert_eq!(h.counters.in_flight.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_forces_oldest_expired_worker() {
        let h = harness(1, Duration::from_millis(20));
        h.dispatcher.on_event(&h.event("k1"), 0, true).unwrap();
        assert!(matches!(h.inboxes[0].try_recv().unwrap(), Command::Assign { .. }));

        let blocked = {
            let dispatcher = h.dispatcher.clone();
            let event = h.event("k2");
            std::thread::spawn(move || dispatcher.on_event(&event, 1, true))
        };

        // the busy worker is told to expire once its deadline passes
        let command = h.inboxes[0].recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(command, Command::Expire { ref key } if key == "k1"));

        h.reports
            .send(Report {
                worker: 0,
                key: "k1".into(),
                outcome: AggregateOutcome::Partial,
            })
            .unwrap();
        blocked.join().unwrap().unwrap();

        let command = h.inboxes[0].recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(command, Command::Assign { ref key, sequence: 1, .. } if key == "k2"));
        assert_eq!(h.counters.forced_timeouts.load(Ordering::Relaxed), 1);
        assert_eq!(h.counters.claimed.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_stale_report_ignored() {
        let h = harness(1, Duration::from_secs(1));
        h.dispatcher.on_event(&h.event("k1"), 0, true).unwrap();
        h.reports
            .send(Report {
                worker: 0,
                key: "other".into(),
                outcome: AggregateOutcome::Complete,
            })
            .unwrap();
        h.dispatcher.on_timeout(0).unwrap();
        assert_eq!(h.counters.in_flight.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_key_evicted_from_dedup_stays_owned() {
        let h = harness_with(AggregatorConfig {
            workers: 2,
            dedup_capacity: 2,
            timeout: Duration::from_secs(60),
            ..AggregatorConfig::default()
        });

        // k1 stays on worker 0 while k2 and k3 push it out of the dedup cache
        h.dispatcher.on_event(&h.event("k1"), 0, false).unwrap();
        h.dispatcher.on_event(&h.event("k2"), 1, false).unwrap();
        h.report(1, "k2", AggregateOutcome::Complete);
        h.dispatcher.on_event(&h.event("k3"), 2, false).unwrap();
        h.report(1, "k3", AggregateOutcome::Complete);
        h.dispatcher.on_event(&h.event("k1"), 3, true).unwrap();
        h.dispatcher.on_timeout(3).unwrap();

        let assigned: Vec<String> = h
            .inboxes
            .iter()
            .flat_map(|inbox| inbox.try_iter())
            .filter_map(|command| match command {
                Command::Assign { key, .. } => Some(key),
                Command::Expire { .. } => None,
            })
            .collect();
        assert_eq!(assigned, vec!["k1", "k2", "k3"]);
        assert_eq!(h.counters.claimed.load(Ordering::Relaxed), 3);
        assert_eq!(h.counters.dropped_duplicates.load(Ordering::Relaxed), 1);
        assert_eq!(h.counters.in_flight.load(Ordering::Relaxed), 1);
    }
}
