//! Reclamation: callbacks invoked when a reservation would cross a limit
//!
//! A failing [`MemTracker::try_consume`] calls [`MemTracker::gc_memory`]
//! on the refusing tracker before giving up.  Reclaimers run
//! synchronously, in registration order, under a per-node lock; gc on one
//! tracker never blocks gc on another.

use super::*;

/// A subsystem that can give memory back when a tracker is over budget
///
/// Register with [`MemTracker::add_gc_callback`].  The tracker asks for at
/// least `bytes_to_free` bytes; freeing less (or nothing) is allowed, the
/// tracker simply rechecks afterwards.
///
/// # Requirements
///
/// Reclaimers run while the tracker's gc lock is held.  They must be
/// quick, must not block, and must not call back into trackers — except
/// to [`release`](MemTracker::release), which is how freed memory is
/// reported.  A reclaimer should hold a [`Weak`] reference to anything
/// that itself owns the tracker, to avoid a leak cycle.
///
/// Closures `Fn(i64)` implement this trait, `bytes_to_free` being the
/// argument.
pub trait MemoryReclaimer: Send + Sync {
    /// Try to free at least `bytes_to_free` bytes of memory
    fn reclaim(&self, bytes_to_free: i64);
}

impl<F> MemoryReclaimer for F
where
    F: Fn(i64) + Send + Sync,
{
    fn reclaim(&self, bytes_to_free: i64) {
        self(bytes_to_free);
    }
}

/// Reclaimers registered on one tracker
///
/// Guarded by the tracker's gc mutex, which also serializes gc runs.
#[derive(Default)]
pub(super) struct GcState {
    /// The reclaimers, in registration order
    ///
    /// Write-once-ish at setup; expensive reclaimers belong at the end.
    pub(super) callbacks: Vec<Box<dyn MemoryReclaimer>>,
}

impl MemTracker {
    /// Register a reclaimer, to be invoked when a reservation here would
    /// cross this tracker's limit
    ///
    /// Reclaimers are invoked in registration order, so expensive ones
    /// should be added last.
    pub fn add_gc_callback(&self, reclaimer: impl MemoryReclaimer + 'static) {
        lock_recover(&self.gc).callbacks.push(Box::new(reclaimer));
    }

    /// How many times this tracker's reclaimers have been run
    pub fn num_gcs(&self) -> u64 {
        self.num_gcs.load(Ordering::Relaxed)
    }

    /// Bytes freed by the most recent reclaimer run; −1 before any run
    pub fn bytes_freed_by_last_gc(&self) -> i64 {
        self.bytes_freed_by_last_gc.load(Ordering::Relaxed)
    }

    /// Try to reclaim down to `max_consumption`; true if still over after
    ///
    /// Serialized per node by the gc lock.  Consumption is re-read under
    /// the lock first: if a concurrent release already got us under, no
    /// reclaimer runs and the caller just retries.
    pub(super) fn gc_memory(&self, max_consumption: i64) -> bool {
        if max_consumption < 0 {
            // The request is larger than the whole limit; no amount of
            // reclamation can make it fit.
            return true;
        }
        let gc = lock_recover(&self.gc);

        let pre = self.consumption();
        if pre <= max_consumption {
            return false;
        }

        debug!(
            tracker = %self.label,
            consumption = pre,
            max_consumption,
            callbacks = gc.callbacks.len(),
            "invoking gc callbacks",
        );

        for callback in &gc.callbacks {
            let over = self.consumption() - max_consumption;
            if over <= 0 {
                break;
            }
            callback.reclaim(over);
        }

        let post = self.consumption();
        self.num_gcs.fetch_add(1, Ordering::Relaxed);
        self.bytes_freed_by_last_gc.store(pre - post, Ordering::Relaxed);

        debug!(
            tracker = %self.label,
            bytes_freed = pre - post,
            consumption = post,
            "gc callbacks done",
        );

        post > max_consumption
    }
}
