//! RAII guard binding logically-owned bytes to a tracker

use crate::internal_prelude::*;

/// A byte quantity charged to a tracker for as long as the guard lives
///
/// Useful for buffers with a single current holder (eg serialized
/// exchange payloads): the holder keeps the guard next to the buffer, the
/// accounting follows the buffer with [`transfer_to`](Self::transfer_to),
/// and dropping the guard releases the bytes — callers get the balanced
/// consume/release discipline without writing either call.
#[derive(Debug)]
pub struct TrackedBytes {
    /// How much was charged
    bytes: i64,
    /// Where it is currently charged
    tracker: Arc<MemTracker>,
}

impl TrackedBytes {
    /// Charge `bytes` to `tracker` unconditionally
    pub fn new(bytes: i64, tracker: &Arc<MemTracker>) -> Self {
        debug_assert!(bytes >= 0, "negative tracked quantity");
        tracker.consume(bytes);
        TrackedBytes {
            bytes,
            tracker: Arc::clone(tracker),
        }
    }

    /// Charge `bytes` to `tracker` if it fits under every limit in the
    /// chain
    ///
    /// On refusal nothing is charged and the limit-exceeded diagnostic is
    /// returned, with `details` describing what was being allocated.
    pub fn try_new(
        bytes: i64,
        tracker: &Arc<MemTracker>,
        details: &str,
    ) -> Result<Self, MemLimitExceeded> {
        debug_assert!(bytes >= 0, "negative tracked quantity");
        if !tracker.try_consume(bytes) {
            return Err(offender(tracker, bytes).mem_limit_exceeded(None, details, bytes));
        }
        Ok(TrackedBytes {
            bytes,
            tracker: Arc::clone(tracker),
        })
    }

    /// How much this guard has charged
    pub fn bytes(&self) -> i64 {
        self.bytes
    }

    /// The tracker currently charged
    pub fn tracker(&self) -> &Arc<MemTracker> {
        &self.tracker
    }

    /// Move the accounting to `other`
    ///
    /// No-op when `other` is the current tracker.  The move is
    /// unconditional, like `consume`: limits on the receiving chain are
    /// not checked.
    pub fn transfer_to(&mut self, other: &Arc<MemTracker>) {
        if Arc::ptr_eq(&self.tracker, other) {
            return;
        }
        self.tracker.release(self.bytes);
        other.consume(self.bytes);
        self.tracker = Arc::clone(other);
    }
}

impl Drop for TrackedBytes {
    fn drop(&mut self) {
        self.tracker.release(self.bytes);
    }
}

/// Pick the tracker to attribute a refused reservation to
///
/// A failed `try_consume` rolls everything back, so no limit is
/// *exceeded* afterwards; the culprit is the nearest chain member whose
/// spare capacity cannot fit the request.  Falls back to the requesting
/// tracker if the pressure has already moved (concurrent releases).
fn offender(tracker: &MemTracker, bytes: i64) -> &MemTracker {
    let mut candidate: &MemTracker = tracker;
    loop {
        if candidate.has_limit() && candidate.limit() - candidate.consumption() < bytes {
            return candidate;
        }
        match candidate.parent() {
            Some(parent) => candidate = &**parent,
            None => return tracker,
        }
    }
}
