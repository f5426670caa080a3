//! High-water-mark counter, the accounting primitive under every tracker.

use crate::internal_prelude::*;

/// An atomic byte tally paired with its monotonic maximum.
///
/// The current value moves in both directions via [`add`](Self::add) and
/// the conditional [`try_add`](Self::try_add); the peak only ever rises.
///
/// A counter is usually owned by its tracker, but may be shared with a
/// runtime profile, which is why trackers hold it behind an `Arc`.
#[derive(Debug, Default)]
pub struct HighWaterCounter {
    /// Current value, in bytes
    current: AtomicI64,
    /// Highest value `current` has reached
    peak: AtomicI64,
}

impl HighWaterCounter {
    /// Make a new counter, starting at zero
    pub fn new() -> Self {
        HighWaterCounter::default()
    }

    /// Return the current value
    pub fn current(&self) -> i64 {
        self.current.load(Ordering::Relaxed)
    }

    /// Return the monotonic maximum
    ///
    /// A concurrent reader may transiently observe `current() > peak()`
    /// while another thread's peak-publish loop is still in flight.
    pub fn peak(&self) -> i64 {
        self.peak.load(Ordering::Relaxed)
    }

    /// Adjust the current value by `delta`, unconditionally
    ///
    /// Negative deltas lower the current value but never the peak.
    pub fn add(&self, delta: i64) {
        let new_value = self.current.fetch_add(delta, Ordering::AcqRel) + delta;
        self.update_peak(new_value);
    }

    /// Adjust the current value by `delta`, unless that would take it
    /// above `limit`
    ///
    /// Single-linearizable: on `true` the counter has advanced by exactly
    /// `delta`; on `false` it is untouched.
    pub fn try_add(&self, delta: i64, limit: i64) -> bool {
        let mut current = self.current.load(Ordering::Relaxed);
        loop {
            let candidate = current + delta;
            if candidate > limit {
                return false;
            }
            match self.current.compare_exchange_weak(
                current,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.update_peak(candidate);
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Store `value`, raising the peak if needed
    ///
    /// Only used for roots whose consumption is derived from an external
    /// metric; everything else goes through `add`/`try_add`.
    pub fn set(&self, value: i64) {
        self.current.store(value, Ordering::Relaxed);
        self.update_peak(value);
    }

    /// Publish `candidate` to the peak if it is a new maximum
    fn update_peak(&self, candidate: i64) {
        let mut peak = self.peak.load(Ordering::Relaxed);
        while candidate > peak {
            match self.peak.compare_exchange_weak(
                peak,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => peak = actual,
            }
        }
    }
}

assert_impl_all!(HighWaterCounter: Send, Sync);
