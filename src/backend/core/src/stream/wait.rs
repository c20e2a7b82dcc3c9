//! Wait strategies for consumers and producers.
//!
//! Every strategy gives up after its timeout so that waiting threads can run
//! periodic checks (aggregation timeouts, shutdown) even when no new data
//! arrives.

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// How a thread waits for a sequence to become available.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitStrategyKind {
    /// Park on a condition variable; lowest CPU use
    #[default]
    Blocking,
    /// Spin briefly, then yield the thread
    Yielding,
    /// Spin continuously; lowest latency
    BusySpin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitStrategy {
    pub kind: WaitStrategyKind,
    pub timeout: Duration,
}

impl WaitStrategy {
    pub fn new(kind: WaitStrategyKind, timeout: Duration) -> Self {
        Self { kind, timeout }
    }

    pub fn blocking(timeout: Duration) -> Self {
        Self::new(WaitStrategyKind::Blocking, timeout)
    }

    pub fn yielding(timeout: Duration) -> Self {
        Self::new(WaitStrategyKind::Yielding, timeout)
    }

    pub fn busy_spin(timeout: Duration) -> Self {
        Self::new(WaitStrategyKind::BusySpin, timeout)
    }
}

impl Default for WaitStrategy {
    fn default() -> Self {
        Self::blocking(Duration::from_millis(20))
    }
}

const SPIN_TRIES: u32 = 100;

/// Wake-up channel shared by a ring buffer and everything waiting on it.
pub(crate) struct Signal {
    strategy: WaitStrategy,
    lock: Mutex<()>,
    condvar: Condvar,
}

impl Signal {
    pub(crate) fn new(strategy: WaitStrategy) -> Self {
        Self {
            strategy,
            lock: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    pub(crate) fn strategy(&self) -> WaitStrategy {
        self.strategy
    }

    /// Wake all blocked waiters. Only the blocking strategy parks threads.
    pub(crate) fn notify_all(&self) {
        if self.strategy.kind == WaitStrategyKind::Blocking {
            let _guard = self.lock.lock();
            self.condvar.notify_all();
        }
    }

    /// Wait until `ready` holds or `deadline` passes. Returns the last result
    /// of `ready`.
    ///
    /// With the blocking strategy `ready` is evaluated under the signal lock,
    /// so a state change followed by [`notify_all`](Self::notify_all) cannot
    /// be missed.
    pub(crate) fn wait_until(&self, deadline: Instant, mut ready: impl FnMut() -> bool) -> bool {
        match self.strategy.kind {
            WaitStrategyKind::Blocking => {
                let mut guard = self.lock.lock();
                loop {
                    if ready() {
                        return true;
                    }
                    if self.condvar.wait_until(&mut guard, deadline).timed_out() {
                        return ready();
                    }
                }
            }
            WaitStrategyKind::Yielding => {
                let mut spins = SPIN_TRIES;
                loop {
                    if ready() {
                        return true;
                    }
                    if Instant::now() >= deadline {
                        return false;
                    }
                    if spins > 0 {
                        spins -= 1;
                        std::hint::spin_loop();
                    } else {
                        std::thread::yield_now();
                    }
                }
            }
            WaitStrategyKind::BusySpin => loop {
                if ready() {
                    return true;
                }
                if Instant::now() >= deadline {
                    return false;
                }
                std::hint::spin_loop();
            },
        }
    }

    /// Wait for at most one strategy timeout.
    pub(crate) fn wait(&self, ready: impl FnMut() -> bool) -> bool {
        self.wait_until(Instant::now() + self.strategy.timeout, ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_wait_times_out() {
        for strategy in [
            WaitStrategy::blocking(Duration::from_millis(10)),
            WaitStrategy::yielding(Duration::from_millis(10)),
            WaitStrategy::busy_spin(Duration::from_millis(10)),
        ] {
            let signal = Signal::new(strategy);
            let start = Instant::now();
            assert!(!signal.wait(|| false));
            assert!(start.elapsed() >= Duration::from_millis(10));
        }
    }

    #[test]
    fn test_blocking_wakeup() {
        let signal = Arc::new(Signal::new(WaitStrategy::blocking(Duration::from_secs(5))));
        let flag = Arc::new(AtomicBool::new(false));

        let waker = {
            let signal = signal.clone();
            let flag = flag.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                flag.store(true, Ordering::Release);
                signal.notify_all();
            })
        };

        let start = Instant::now();
        assert!(signal.wait(|| flag.load(Ordering::Acquire)));
        assert!(start.elapsed() < Duration::from_secs(5));
        waker.join().unwrap();
    }
}
