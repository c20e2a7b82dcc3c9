//! Consumer-side coordination: wait for the cursor and upstream stages.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::ring::RingBuffer;
use super::sequence::Sequence;

/// Result of waiting on a [`SequenceBarrier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Everything up to and including this sequence may be processed
    Available(i64),
    /// The wait strategy timed out before the requested sequence was ready
    Timeout,
    /// The consumer has been asked to stop
    Alerted,
}

/// Gate for a consumer that must not overtake the published cursor or the
/// handlers it depends on.
pub struct SequenceBarrier {
    ring: Arc<RingBuffer>,
    dependents: Vec<Sequence>,
    alert: Arc<AtomicBool>,
}

impl SequenceBarrier {
    pub fn new(ring: Arc<RingBuffer>, dependents: Vec<Sequence>) -> Self {
        Self {
            ring,
            dependents,
            alert: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Highest sequence this consumer may process right now.
    pub fn available(&self) -> i64 {
        let cursor = self.ring.cursor();
        self.dependents
            .iter()
            .map(Sequence::get)
            .min()
            .map_or(cursor, |upstream| upstream.min(cursor))
    }

    pub fn is_alerted(&self) -> bool {
        self.alert.load(Ordering::Acquire)
    }

    pub fn alert(&self) {
        self.alert.store(true, Ordering::Release);
        self.ring.signal().notify_all();
    }

    pub(crate) fn alert_flag(&self) -> Arc<AtomicBool> {
        self.alert.clone()
    }

    /// Wait for `sequence` for at most one wait-strategy timeout.
    pub fn wait_for(&self, sequence: i64) -> WaitOutcome {
        if self.is_alerted() {
            return WaitOutcome::Alerted;
        }
        let available = self.available();
        if available >= sequence {
            return WaitOutcome::Available(available);
        }

        self.ring
            .signal()
            .wait(|| self.is_alerted() || self.available() >= sequence);

        if self.is_alerted() {
            return WaitOutcome::Alerted;
        }
        let available = self.available();
        if available >= sequence {
            WaitOutcome::Available(available)
        } else {
            WaitOutcome::Timeout
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::FilterLayout;
    use crate::stream::{ProducerType, WaitStrategy};
    use std::time::Duration;

    fn ring() -> Arc<RingBuffer> {
        Arc::new(
            RingBuffer::new(
                "barrier",
                8,
                ProducerType::Single,
                WaitStrategy::blocking(Duration::from_millis(5)),
                FilterLayout::builder().build().unwrap(),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_timeout_then_available() {
        let ring = ring();
        let barrier = SequenceBarrier::new(ring.clone(), vec![]);
        assert_eq!(barrier.wait_for(0), WaitOutcome::Timeout);

        ring.publish(|_, _| {}).unwrap();
        ring.publish(|_, _| {}).unwrap();
        assert_eq!(barrier.wait_for(0), WaitOutcome::Available(1));
    }

    #[test]
    fn test_dependents_limit_availability() {
        let ring = ring();
        let upstream = Sequence::default();
        let barrier = SequenceBarrier::new(ring.clone(), vec![upstream.clone()]);

        for _ in 0..3 {
            ring.publish(|_, _| {}).unwrap();
        }
        assert_eq!(barrier.wait_for(0), WaitOutcome::Timeout);

        upstream.set(1);
        assert_eq!(barrier.wait_for(0), WaitOutcome::Available(1));
    }

    #[test]
    fn test_alert() {
        let barrier = SequenceBarrier::new(ring(), vec![]);
        barrier.alert();
        assert_eq!(barrier.wait_for(0), WaitOutcome::Alerted);
    }
}
