//! The indexing throttle.
//!
//! When active, the throttle admits one indexing thread at a time through a
//! reentrant gate; when inactive, acquisition is free. Activation is
//! reference-counted by the engine: merge backpressure and indexing-buffer
//! pressure share the same gate.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

use crate::engine::config::Clock;

/// A gate that serializes indexing while throttling is active.
#[derive(Debug)]
pub struct IndexThrottle {
    gate: ReentrantMutex<()>,
    active: AtomicBool,
    /// Millisecond timestamp of the current activation, if any.
    start_of_throttle_millis: AtomicI64,
    accumulated_throttle_millis: AtomicI64,
    clock: Arc<dyn Clock>,
}

impl IndexThrottle {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        IndexThrottle {
            gate: ReentrantMutex::new(()),
            active: AtomicBool::new(false),
            start_of_throttle_millis: AtomicI64::new(0),
            accumulated_throttle_millis: AtomicI64::new(0),
            clock,
        }
    }

    /// Pass the gate. Blocks behind other indexing threads only while the
    /// throttle is active.
    pub fn acquire_throttle(&self) -> ThrottleGuard<'_> {
        if self.active.load(Ordering::Acquire) {
            ThrottleGuard {
                _guard: Some(self.gate.lock()),
            }
        } else {
            ThrottleGuard { _guard: None }
        }
    }

    /// Start throttling. Callers balance this with [`IndexThrottle::deactivate`].
    pub fn activate(&self) {
        if !self.active.swap(true, Ordering::AcqRel) {
            self.start_of_throttle_millis
                .store(self.clock.relative_time_millis(), Ordering::SeqCst);
        }
    }

    /// Stop throttling and fold the activation window into the counter.
    pub fn deactivate(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            let started = self.start_of_throttle_millis.load(Ordering::SeqCst);
            let elapsed = self.clock.relative_time_millis() - started;
            self.accumulated_throttle_millis
                .fetch_add(elapsed.max(0), Ordering::SeqCst);
        }
    }

    /// Whether the gate is currently active.
    pub fn is_throttled(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Total milliseconds spent throttled, including the current window.
    pub fn throttle_time_millis(&self) -> i64 {
        let mut total = self.accumulated_throttle_millis.load(Ordering::SeqCst);
        if self.active.load(Ordering::Acquire) {
            let started = self.start_of_throttle_millis.load(Ordering::SeqCst);
            total += (self.clock.relative_time_millis() - started).max(0);
        }
        total
    }
}

/// Scoped pass through the throttle gate.
#[derive(Debug)]
pub struct ThrottleGuard<'a> {
    _guard: Option<ReentrantMutexGuard<'a, ()>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::config::ManualClock;

    #[test]
    fn test_inactive_throttle_is_free() {
        let throttle = IndexThrottle::new(Arc::new(ManualClock::new()));
        assert!(!throttle.is_throttled());
        let _a = throttle.acquire_throttle();
        let _b = throttle.acquire_throttle();
        assert_eq!(throttle.throttle_time_millis(), 0);
    }

    #[test]
    fn test_throttle_time_accumulates_across_windows() {
        let clock = Arc::new(ManualClock::new());
        let throttle = IndexThrottle::new(clock.clone());

        throttle.activate();
        clock.advance_millis(25);
        assert_eq!(throttle.throttle_time_millis(), 25);
        throttle.deactivate();
        assert_eq!(throttle.throttle_time_millis(), 25);

        clock.advance_millis(100);
        throttle.activate();
        clock.advance_millis(5);
        throttle.deactivate();
        assert_eq!(throttle.throttle_time_millis(), 30);
    }

    #[test]
    fn test_active_gate_admits_one_thread_at_a_time() {
        let clock = Arc::new(ManualClock::new());
        let throttle = Arc::new(IndexThrottle::new(clock));
        throttle.activate();

        let guard = throttle.acquire_throttle();
        let contender = throttle.clone();
        let handle = std::thread::spawn(move || {
            // blocks until the first guard drops
            let _guard = contender.acquire_throttle();
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!handle.is_finished());
        drop(guard);
        handle.join().unwrap();
    }
}
