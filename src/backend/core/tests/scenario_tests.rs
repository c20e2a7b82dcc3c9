//! End-to-end scenarios for the event store and the demux aggregator.
//!
//! Tests cover:
//! - Complete groups for interleaved keys
//! - Partial aggregates when a device never reports
//! - Forced timeouts when there are more keys than workers
//! - One owner per key under concurrent producers
//! - Context cache eviction and history bounds

use crossbeam::channel::{self, Receiver};
use ripple_core::prelude::*;
use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Reading {
    device: &'static str,
    index: u32,
}

fn reading_key(env: &Envelope) -> Option<String> {
    env.payload_as::<Reading>().map(|r| r.index.to_string())
}

fn devices(aggregate: &Aggregate) -> Vec<String> {
    aggregate
        .events
        .iter()
        .filter_map(|e| e.payload_as::<Reading>())
        .map(|r| format!("{}{}", r.device, r.index))
        .collect()
}

fn aggregator_store(config: AggregatorConfig) -> (EventStore, DemuxAggregator, Receiver<Aggregate>) {
    aggregator_store_with(config, WaitStrategy::default())
}

fn aggregator_store_with(
    config: AggregatorConfig,
    wait: WaitStrategy,
) -> (EventStore, DemuxAggregator, Receiver<Aggregate>) {
    let store = EventStore::builder()
        .with_filter::<EventTypeFilter>()
        .name("scenario")
        .ring_capacity(256)
        .wait_strategy(wait)
        .build()
        .unwrap();
    let aggregator = DemuxAggregator::new(config, reading_key).unwrap();
    let (tx, rx) = channel::unbounded();
    aggregator
        .register(&store)
        .unwrap()
        .then([handler_fn("collector", move |env, _, _| {
            if let Some(aggregate) = env.payload_as::<Aggregate>() {
                let _ = tx.send(aggregate.clone());
            }
            Ok(())
        })])
        .unwrap();
    store.start(true).unwrap();
    (store, aggregator, rx)
}

fn publish_readings(store: &EventStore, readings: &[(&'static str, u32)]) {
    for &(device, index) in readings {
        store
            .publish(Payload::new(Reading { device, index }), device)
            .unwrap();
    }
}

fn collect(rx: &Receiver<Aggregate>, count: usize) -> BTreeMap<String, Aggregate> {
    let mut aggregates = BTreeMap::new();
    for _ in 0..count {
        let aggregate = rx.recv_timeout(Duration::from_secs(5)).expect("aggregate not published");
        let previous = aggregates.insert(aggregate.key.clone(), aggregate);
        assert!(previous.is_none(), "key aggregated twice");
    }
    aggregates
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}

// ============================================================================
// Aggregation Scenarios
// ============================================================================

#[test]
fn test_ordinary_groups_complete() {
    let config = AggregatorConfig {
        workers: 8,
        group_size: 3,
        timeout: Duration::from_secs(5),
        ..AggregatorConfig::default()
    };
    let (store, aggregator, rx) = aggregator_store(config);

    publish_readings(
        &store,
        &[("a", 1), ("b", 1), ("c", 1), ("a", 2), ("b", 2), ("c", 2), ("a", 3), ("b", 3), ("c", 3)],
    );

    let aggregates = collect(&rx, 3);
    for (key, aggregate) in &aggregates {
        assert!(aggregate.is_complete());
        assert_eq!(devices(aggregate), vec![format!("a{key}"), format!("b{key}"), format!("c{key}")]);
    }
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    store.stop();
    let stats = aggregator.stats();
    assert_eq!(stats.claimed, 3);
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.timed_out, 0);
    assert_eq!(stats.dropped_duplicates, 6);
}

#[test]
fn test_missing_device_times_out() {
    let config = AggregatorConfig {
        workers: 8,
        group_size: 3,
        timeout: Duration::from_millis(80),
        ..AggregatorConfig::default()
    };
    let (store, aggregator, rx) = aggregator_store(config);

    publish_readings(&store, &[("a", 1), ("b", 1), ("a", 2), ("b", 2), ("a", 3), ("b", 3)]);

    let aggregates = collect(&rx, 3);
    assert_eq!(aggregates.keys().cloned().collect::<Vec<_>>(), vec!["1", "2", "3"]);
    for (key, aggregate) in &aggregates {
        assert_eq!(aggregate.outcome, AggregateOutcome::Partial);
        assert_eq!(devices(aggregate), vec![format!("a{key}"), format!("b{key}")]);
    }

    store.stop();
    let stats = aggregator.stats();
    assert_eq!(stats.completed, 0);
    assert_eq!(stats.timed_out, 3);
}

#[test]
fn test_worker_starvation_never_drops_keys() {
    let config = AggregatorConfig {
        workers: 2,
        group_size: 3,
        timeout: Duration::from_millis(30),
        ..AggregatorConfig::default()
    };
    // workers only check their own deadline every 250ms, long after the
    // dispatcher has seen the claims expire
    let (store, aggregator, rx) =
        aggregator_store_with(config, WaitStrategy::blocking(Duration::from_millis(250)));

    let readings: Vec<(&'static str, u32)> = (1..=6).map(|i| ("a", i)).collect();
    publish_readings(&store, &readings);

    let aggregates = collect(&rx, 6);
    assert_eq!(aggregates.len(), 6);
    assert!(aggregates.values().all(|a| !a.is_complete() && a.events.len() == 1));

    store.stop();
    let stats = aggregator.stats();
    assert_eq!(stats.claimed, 6);
    assert_eq!(stats.timed_out, 6);
    assert!(stats.forced_timeouts >= 1, "no claim was forced: {:?}", stats);
    assert!(stats.forced_timeouts <= stats.timed_out);
}

#[test]
fn test_concurrent_producers_one_owner_per_key() {
    let config = AggregatorConfig {
        workers: 2,
        group_size: 4,
        timeout: Duration::from_millis(40),
        dedup_capacity: 2,
        ..AggregatorConfig::default()
    };
    let (store, aggregator, rx) = aggregator_store(config);

    std::thread::scope(|scope| {
        for device in ["p0", "p1", "p2"] {
            let store = &store;
            scope.spawn(move || {
                for i in 0..40u32 {
                    store
                        .publish(Payload::new(Reading { device, index: i % 6 }), device)
                        .unwrap();
                    std::thread::sleep(Duration::from_millis(1));
                }
            });
        }
    });

    let mut aggregates = Vec::new();
    while let Ok(aggregate) = rx.recv_timeout(Duration::from_millis(500)) {
        aggregates.push(aggregate);
    }
    assert!(!aggregates.is_empty());

    // a key held by two workers at once would hand the same event to both
    let mut seen = HashSet::new();
    for aggregate in &aggregates {
        assert!(!aggregate.events.is_empty());
        for event in &aggregate.events {
            assert_eq!(reading_key(event).as_deref(), Some(aggregate.key.as_str()));
            assert!(
                seen.insert(event.parent_sequence()),
                "event {} joined two aggregates",
                event.parent_sequence()
            );
        }
    }

    store.stop();
    let stats = aggregator.stats();
    assert_eq!(stats.claimed, aggregates.len() as u64);
    assert_eq!(stats.completed + stats.timed_out, stats.claimed);
    assert_eq!(stats.in_flight, 0);
}

#[test]
fn test_aggregates_tagged_and_routed() {
    let config = AggregatorConfig {
        workers: 2,
        group_size: 1,
        timeout: Duration::from_secs(5),
        output_context: "groups".into(),
        ..AggregatorConfig::default()
    };
    let (store, _aggregator, rx) = aggregator_store(config);
    publish_readings(&store, &[("a", 7)]);
    collect(&rx, 1);

    assert!(wait_until(Duration::from_secs(5), || store.get_last("groups", |_| true).is_some()));
    let envelope = store.get_last("groups", |_| true).unwrap();
    assert!(is_aggregate(&envelope));
    assert_eq!(
        *envelope.filter::<EventTypeFilter>().unwrap(),
        EventTypeFilter::new(EventType::Aggregate, UpdateKind::Full)
    );
    store.stop();
}

// ============================================================================
// Context Cache Scenarios
// ============================================================================

#[test]
fn test_lru_context_evicted() {
    let store = EventStore::builder()
        .ring_capacity(64)
        .context_cache(2, 16)
        .build()
        .unwrap();
    store.start(true).unwrap();

    for context in ["c0", "c1", "c2"] {
        store.publish(Payload::new(context.to_string()), context).unwrap();
        assert!(wait_until(Duration::from_secs(5), || store.get_last(context, |_| true).is_some()));
    }

    assert!(store.get_history("c0", i64::MAX, |_| true, 10).is_empty());
    assert_eq!(store.get_history("c1", i64::MAX, |_| true, 10).len(), 1);
    assert_eq!(store.get_history("c2", i64::MAX, |_| true, 10).len(), 1);
    assert_eq!(
        store.contexts().into_iter().collect::<HashSet<_>>(),
        HashSet::from(["c1".to_string(), "c2".to_string()])
    );
    store.stop();
}

#[test]
fn test_history_bounded_and_newest_first() {
    let store = EventStore::builder().ring_capacity(64).build().unwrap();
    store.start(true).unwrap();

    let mut sequences = Vec::new();
    for value in 0..10u32 {
        sequences.push(store.publish(Payload::new(value), "dev").unwrap());
    }
    let last = *sequences.last().unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        store
            .get_last("dev", |_| true)
            .is_some_and(|e| e.parent_sequence() == last)
    }));

    let bound = sequences[5];
    let history = store.get_history("dev", bound, |_| true, 3);
    assert_eq!(history.len(), 3);
    assert!(history.iter().all(|e| e.parent_sequence() <= bound));
    let values: Vec<u32> = history.iter().filter_map(|e| e.payload_as::<u32>().copied()).collect();
    assert_eq!(values, vec![5, 4, 3]);

    let even = store.get_history("dev", i64::MAX, |e| e.payload_as::<u32>().is_some_and(|v| v % 2 == 0), 100);
    assert_eq!(even.len(), 5);
    assert!(store.get_history("unknown", i64::MAX, |_| true, 10).is_empty());
    store.stop();
}
