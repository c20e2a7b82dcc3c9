//! Integration tests for handler registration and failure handling.

use crossbeam::channel;
use ripple_core::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Registration
// ============================================================================

#[test]
fn test_duplicate_handler_rejected() {
    let store = EventStore::builder().ring_capacity(16).build().unwrap();
    let handler = handler_fn("once", |_, _, _| Ok(()));

    store.register([handler.clone()]).unwrap();
    let err = store.register([handler]).unwrap_err();
    assert_eq!(err.code(), ErrorCode::DuplicateHandler);
}

#[test]
fn test_invalid_capacity_rejected() {
    let err = EventStore::builder().ring_capacity(100).build().unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidCapacity);
}

#[test]
fn test_unknown_filter_rejected() {
    let store = EventStore::builder().ring_capacity(16).build().unwrap();
    let envelope = store.new_envelope();
    let err = envelope.filter::<EventTypeFilter>().unwrap_err();
    assert_eq!(err.code(), ErrorCode::UnknownFilter);
    assert!(!envelope.test::<EventTypeFilter>(|_| true));
}

// ============================================================================
// Failure Handling
// ============================================================================

#[test]
fn test_handler_errors_recorded_without_aborting() {
    let store = EventStore::builder().ring_capacity(64).build().unwrap();
    let seen = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = channel::unbounded();

    let counter = seen.clone();
    store
        .register([
            handler_fn("picky", |env, _, _| match env.payload_as::<u32>() {
                Some(v) if v % 2 == 1 => Err(RippleError::internal("odd value")),
                _ => Ok(()),
            }),
            handler_fn("panicky", |env, _, _| {
                if env.payload_as::<u32>() == Some(&3) {
                    panic!("three");
                }
                Ok(())
            }),
        ])
        .unwrap()
        .then([handler_fn("audit", move |env, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send((env.payload_as::<u32>().copied(), env.errors().len()));
            Ok(())
        })])
        .unwrap();
    store.start(true).unwrap();

    for value in 0..4u32 {
        store.publish(Payload::new(value), "dev").unwrap();
    }

    let mut errors = Vec::new();
    for _ in 0..4 {
        errors.push(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }
    assert_eq!(errors, vec![(Some(0), 0), (Some(1), 1), (Some(2), 0), (Some(3), 2)]);
    assert_eq!(seen.load(Ordering::SeqCst), 4);

    store.stop();
    assert_eq!(store.stats().handler_errors, 3);
}
