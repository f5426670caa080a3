//! External consumption sources for metric-driven root trackers.

use crate::internal_prelude::*;

/// An externally-updated byte gauge a root tracker can derive its
/// consumption from.
///
/// The canonical implementor is the allocator's internal byte counter:
/// the allocator may hold on to freed pages, so the process-wide figure it
/// reports is more truthful than the sum of what callers told us.
///
/// A tracker bound to a metric must have no parent (it is always the root
/// of any chain it appears in), and its `consume`/`release` calls only
/// refresh the counter from the gauge rather than applying a delta.
///
/// Implementations must be cheap: the gauge is read on every charge to the
/// bound tracker.
pub trait ConsumptionMetric: Send + Sync {
    /// Current reading of the gauge, in bytes
    fn value(&self) -> i64;
}

impl ConsumptionMetric for AtomicI64 {
    fn value(&self) -> i64 {
        self.load(Ordering::Relaxed)
    }
}
