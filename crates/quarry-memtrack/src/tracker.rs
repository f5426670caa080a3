//! Memory tracker node, core and low-level API
//!
//! # Example
//!
//! ```
//! use quarry_memtrack::MemTracker;
//!
//! let process = MemTracker::new_root(8 * 1024 * 1024, "process");
//! let query = MemTracker::with_parent(-1, "query-1", &process);
//!
//! assert!(query.try_consume(1024));
//! assert_eq!(process.consumption(), 1024);
//! query.release(1024);
//! assert_eq!(process.consumption(), 0);
//! ```
//
// For the charge-path invariants, see the doc comment for `struct
// MemTracker` (below); for the reclamation protocol, see `reclaim`.

#![forbid(unsafe_code)]
#![allow(clippy::assertions_on_constants)] // debug_assert!(false, ..) marks must-not-happen paths

use crate::internal_prelude::*;

mod reclaim;
mod usage;

#[cfg(test)]
pub(crate) mod test;

pub use reclaim::MemoryReclaimer;
pub use usage::{MemUsageEntry, UNLIMITED_DEPTH};

use reclaim::GcState;

/// Category of an accounting scope
///
/// Advisory; used for lookup and reporting only.  The accounting itself
/// does not care what a tracker is for.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Default)]
#[non_exhaustive]
pub enum TrackerKind {
    /// No particular category (the default)
    #[default]
    Unset,
    /// The process root
    Process,
    /// The pool all query trackers hang off
    QueryPool,
    /// One query
    Query,
    /// The load (ingest) root
    Load,
}

slotmap::new_key_type! {
    /// Slot of a child within its parent's child registry
    ///
    /// Saved by the child at registration so unregistering is O(1),
    /// whatever the number of siblings.
    struct ChildKey;
}

/// One memory accounting scope
///
/// A `MemTracker` tracks memory consumption; it carries an optional byte
/// limit and is arranged into a tree such that consumption tracked by a
/// tracker is also tracked by its ancestors.
///
/// The worker uses a five-level hierarchy: process, pool, query, fragment
/// instance, and per-operator trackers below that.
///
/// By default consumption is the tally of [`consume`](Self::consume) /
/// [`release`](Self::release) calls against this tracker and its
/// descendants.  Alternatively a [`ConsumptionMetric`] can be supplied,
/// and the gauge's reading is used instead: the allocator does not return
/// freed pages immediately, so for the process root the gauge is more
/// truthful than the computed total.
///
/// [`MemoryReclaimer`]s can be attached in order to free memory when a
/// limit is reached: a failing [`try_consume`](Self::try_consume) invokes
/// them, in registration order, and rechecks.  Expensive reclaimers
/// should therefore be registered last.  Reclaimers run under a per-node
/// lock; they must not block and must not call back into trackers except
/// to `release`.
///
/// This type is thread-safe.  Lifecycle (construction,
/// [`close`](Self::close), drop) must be serialized against concurrent
/// accounting on the same node; that is the caller's responsibility.
///
/// # Accounting invariants
///
/// For every tracker without a consumption metric, at quiescence:
/// consumption equals the sum of the direct children's consumption plus
/// bytes charged directly here, and is never negative (callers promise
/// balanced consume/release per scope).  The peak never decreases and is
/// never behind any value consumption has settled at.
#[derive(Educe)]
#[educe(Debug)]
pub struct MemTracker {
    /// Human-readable name, used in diagnostics and usage dumps
    label: String,

    /// Advisory category
    kind: TrackerKind,

    /// Byte cap; negative means no limit
    ///
    /// Atomic so `set_limit` can adjust a live tracker; chain membership
    /// is still fixed at construction (see [`set_limit`](Self::set_limit)).
    limit: AtomicI64,

    /// Parent scope
    ///
    /// Strong: a tracker keeps its whole ancestor chain alive, since every
    /// charge here is also applied up there.
    parent: Option<Arc<MemTracker>>,

    /// Consumption counter; possibly shared with a runtime profile
    consumption: Arc<HighWaterCounter>,

    /// If set, consumption is derived from this gauge rather than the
    /// tally; only permitted on trackers with no parent
    #[educe(Debug(ignore))]
    consumption_metric: Option<Arc<dyn ConsumptionMetric>>,

    /// Ancestors, nearest first, not including self
    ///
    /// Immutable after construction; this is what makes the charge paths
    /// lock-free.
    ancestors: Vec<Arc<MemTracker>>,

    /// The subsequence of `ancestors` that had a finite limit at
    /// construction
    limited_ancestors: Vec<Arc<MemTracker>>,

    /// Whether self had a finite limit at construction
    limited: bool,

    /// Child registry; weak, for reporting only
    ///
    /// Charging a parent does not touch its children, so this is not on
    /// any hot path.
    children: Mutex<SlotMap<ChildKey, Weak<MemTracker>>>,

    /// Our slot in the parent's `children`, while registered
    child_key: Mutex<Option<ChildKey>>,

    /// Reclaimers, and the lock serializing gc runs on this node
    #[educe(Debug(ignore))]
    gc: Mutex<GcState>,

    /// How many times the reclaimers have been invoked
    num_gcs: AtomicU64,

    /// Bytes freed by the last reclaimer run (−1 before any)
    bytes_freed_by_last_gc: AtomicI64,

    /// Unregister from the parent when dropped
    auto_unregister: bool,

    /// If false, this tracker (and its children) are left out of usage
    /// dumps while consumption is 0
    log_usage_if_zero: bool,

    /// Set by `close()`; accounting on a closed tracker is a caller bug
    closed: AtomicBool,
}

assert_impl_all!(MemTracker: Send, Sync);

/// Builder for a [`MemTracker`]
///
/// Obtained from [`MemTracker::builder`].  Defaults: no limit, empty
/// label, no parent, kind [`TrackerKind::Unset`], auto-unregister on,
/// included in usage dumps even when zero.
#[derive(Default)]
pub struct TrackerBuilder {
    /// Byte cap; negative means no limit
    limit: Option<i64>,
    /// Diagnostic label
    label: String,
    /// Advisory category
    kind: TrackerKind,
    /// Parent tracker
    parent: Option<Arc<MemTracker>>,
    /// Counter owned elsewhere (eg by a fragment's runtime profile)
    counter: Option<Arc<HighWaterCounter>>,
    /// External gauge to derive consumption from
    consumption_metric: Option<Arc<dyn ConsumptionMetric>>,
    /// Unregister from the parent on drop; default true
    auto_unregister: Option<bool>,
    /// Include in usage dumps when zero; default true
    log_usage_if_zero: Option<bool>,
}

impl MemTracker {
    /// Start building a [`MemTracker`]
    pub fn builder() -> TrackerBuilder {
        TrackerBuilder::default()
    }

    /// Make a root tracker
    ///
    /// `limit < 0` means no limit.
    pub fn new_root(limit: i64, label: impl Into<String>) -> Arc<Self> {
        let mut b = MemTracker::builder();
        b.limit(limit).label(label);
        b.build()
    }

    /// Make a tracker under `parent`
    ///
    /// `limit < 0` means no limit.
    pub fn with_parent(limit: i64, label: impl Into<String>, parent: &Arc<MemTracker>) -> Arc<Self> {
        let mut b = MemTracker::builder();
        b.limit(limit).label(label).parent(parent);
        b.build()
    }

    //---------- charge paths ----------

    /// Charge `bytes` to this tracker and every ancestor, unconditionally
    ///
    /// Limits are not checked; only [`try_consume`](Self::try_consume)
    /// enforces them.  `bytes == 0` is a no-op and `bytes < 0` is
    /// redirected to [`release`](Self::release).
    pub fn consume(&self, bytes: i64) {
        if bytes <= 0 {
            if bytes < 0 {
                self.release(-bytes);
            }
            return;
        }
        self.debug_assert_open();
        if self.consumption_metric.is_some() {
            self.refresh_from_metric();
            return;
        }
        for tracker in self.chain() {
            tracker.consumption.add(bytes);
            if tracker.consumption_metric.is_none() {
                debug_assert!(
                    tracker.consumption() >= 0,
                    "negative consumption on {:?}",
                    tracker.label,
                );
            }
        }
    }

    /// Release `bytes` from this tracker and every ancestor
    ///
    /// Symmetric to [`consume`](Self::consume).
    pub fn release(&self, bytes: i64) {
        if bytes <= 0 {
            if bytes < 0 {
                self.consume(-bytes);
            }
            return;
        }
        self.debug_assert_open();
        if self.consumption_metric.is_some() {
            self.refresh_from_metric();
            return;
        }
        for tracker in self.chain() {
            tracker.consumption.add(-bytes);
            // A metric-driven root may drift negative until it is synced
            // back to the gauge.  Anywhere else, negative consumption is
            // an unbalanced caller.
            if tracker.consumption_metric.is_none() {
                debug_assert!(
                    tracker.consumption() >= 0,
                    "negative consumption on {:?}",
                    tracker.label,
                );
            }
        }
    }

    /// Charge `bytes` against this tracker and every ancestor, if it fits
    /// under all their limits
    ///
    /// Either every counter in the chain advances by `bytes` without any
    /// finite limit being crossed, or nothing is changed and this returns
    /// false.  Reclaimers run between a failed attempt and the final
    /// decision, so a denial means reclamation was tried and was not
    /// enough.
    #[must_use]
    pub fn try_consume(&self, bytes: i64) -> bool {
        if bytes <= 0 {
            return true;
        }
        self.debug_assert_open();
        // Walk the chain top-down: if the tightest upstream limit
        // refuses, no descendant has been touched yet, and rollback only
        // has to revisit the trackers already credited.
        let mut credited = 0_usize;
        for tracker in self.chain().rev() {
            if let Some(metric) = &tracker.consumption_metric {
                tracker.consumption.set(metric.value());
            }
            let limit = tracker.limit();
            if limit < 0 {
                // No limit at this tracker.
                tracker.consumption.add(bytes);
            } else {
                // try_add can lose repeatedly: we take no lock, so
                // concurrent consumers race against the same counter.
                loop {
                    if tracker.consumption.try_add(bytes, limit) {
                        break;
                    }
                    trace!(
                        tracker = %tracker.label,
                        bytes,
                        consumption = tracker.consumption(),
                        limit,
                        "reservation failed, attempting gc",
                    );
                    if tracker.gc_memory(limit - bytes) {
                        // Still over after gc: refuse, and roll back the
                        // trackers we already credited.
                        for done in self.chain().rev().take(credited) {
                            done.consumption.add(-bytes);
                        }
                        return false;
                    }
                    trace!(
                        tracker = %tracker.label,
                        bytes,
                        consumption = tracker.consumption(),
                        limit,
                        "gc freed enough, retrying reservation",
                    );
                }
            }
            credited += 1;
        }
        true
    }

    /// Move accounting between trackers that share the ancestor
    /// `end_tracker`, whose own charge has already happened
    ///
    /// Charges `bytes` to this tracker and its ancestors up to but *not*
    /// including `end_tracker`.  Every tracker updated must be unlimited
    /// (a transfer must not manufacture a limit violation), and
    /// `end_tracker` must actually be in the chain; both are debug
    /// assertions, and release builds are undefined if they are violated.
    pub fn consume_local(&self, bytes: i64, end_tracker: &MemTracker) {
        debug_assert!(
            self.consumption_metric.is_none(),
            "must not be called on a metric-driven root",
        );
        for tracker in self.chain() {
            if ptr::eq(tracker, end_tracker) {
                return;
            }
            debug_assert!(
                !tracker.has_limit(),
                "local transfer through limited tracker {:?}",
                tracker.label,
            );
            tracker.consumption.add(bytes);
        }
        debug_assert!(
            false,
            "end_tracker {:?} is not an ancestor of {:?}",
            end_tracker.label, self.label,
        );
    }

    /// Reverse of [`consume_local`](Self::consume_local)
    pub fn release_local(&self, bytes: i64, end_tracker: &MemTracker) {
        self.consume_local(-bytes, end_tracker);
    }

    /// Re-read the external gauge into the consumption counter
    ///
    /// Only meaningful on a tracker constructed with a
    /// [`ConsumptionMetric`]; a no-op (and a debug assertion) otherwise.
    pub fn refresh_from_metric(&self) {
        debug_assert!(self.parent.is_none(), "metric-driven trackers are roots");
        let Some(metric) = &self.consumption_metric else {
            debug_assert!(false, "refresh_from_metric without a metric");
            return;
        };
        self.consumption.set(metric.value());
    }

    //---------- queries ----------

    /// Current consumption in bytes
    pub fn consumption(&self) -> i64 {
        self.consumption.current()
    }

    /// Highest consumption ever reached
    ///
    /// For a metric-driven root this is the highest value we have
    /// *recorded*, not necessarily the highest the gauge ever reached.
    pub fn peak_consumption(&self) -> i64 {
        self.consumption.peak()
    }

    /// The byte limit; negative means no limit
    pub fn limit(&self) -> i64 {
        self.limit.load(Ordering::Relaxed)
    }

    /// Adjust the byte limit
    ///
    /// This only changes the enforced value.  Membership of the limited
    /// chains is fixed when trackers are constructed, so flipping a
    /// tracker between limited and unlimited after construction is not
    /// supported.
    pub fn set_limit(&self, limit: i64) {
        self.limit.store(limit, Ordering::Relaxed);
    }

    /// Whether this tracker has a finite limit
    pub fn has_limit(&self) -> bool {
        self.limit() >= 0
    }

    /// Whether this tracker's own limit is currently exceeded
    pub fn limit_exceeded(&self) -> bool {
        let limit = self.limit();
        limit >= 0 && limit < self.consumption()
    }

    /// Whether any limit here or above is currently exceeded
    pub fn any_limit_exceeded(&self) -> bool {
        self.limited_chain().any(MemTracker::limit_exceeded)
    }

    /// The first tracker in the chain whose limit is exceeded, if any
    pub fn find_limit_exceeded_tracker(&self) -> Option<&MemTracker> {
        self.limited_chain().find(|t| t.limit_exceeded())
    }

    /// The most that could be consumed here without exceeding any limit
    /// in the chain
    ///
    /// `i64::MAX` if nothing in the chain is limited; negative if some
    /// limit is already exceeded.
    pub fn spare_capacity(&self) -> i64 {
        self.limited_chain()
            .map(|t| t.limit() - t.consumption())
            .min()
            .unwrap_or(i64::MAX)
    }

    /// The lowest limit in the chain, or −1 if nothing is limited
    pub fn lowest_limit(&self) -> i64 {
        self.limited_chain()
            .map(MemTracker::limit)
            .min()
            .unwrap_or(-1)
    }

    /// The diagnostic label
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The advisory category
    pub fn kind(&self) -> TrackerKind {
        self.kind
    }

    /// The parent tracker, if any
    pub fn parent(&self) -> Option<&Arc<MemTracker>> {
        self.parent.as_ref()
    }

    /// Whether consumption is derived from an external gauge
    pub fn has_consumption_metric(&self) -> bool {
        self.consumption_metric.is_some()
    }

    /// One-line summary of the tracker's internal state
    pub fn debug_string(&self) -> String {
        format!(
            "limit: {}; consumption: {}; label: {:?}; all trackers: {}; \
             limit trackers: {}; parent is none: {}",
            self.limit(),
            self.consumption(),
            self.label,
            self.ancestors.len() + 1,
            self.limited_ancestors.len() + usize::from(self.limited),
            self.parent.is_none(),
        )
    }

    //---------- lifecycle ----------

    /// Close this tracker
    ///
    /// Afterwards it is invalid to charge memory here.  Registered
    /// reclaimers are dropped, so subsystems captured by them can be torn
    /// down; a counter shared with a profile simply stops being updated
    /// through this tracker (the `Arc` keeps it valid either way).
    ///
    /// Idempotent: calling multiple times has no effect.  Callers must
    /// quiesce concurrent accounting first; operations racing `close` are
    /// undefined.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        lock_recover(&self.gc).callbacks.clear();
    }

    /// Remove this tracker from its parent's child registry
    ///
    /// Harmless to repeat; a tracker built with `auto_unregister` (the
    /// default) does this itself when dropped.
    pub fn unregister_from_parent(&self) {
        let Some(parent) = &self.parent else {
            debug_assert!(false, "unregister_from_parent on a root");
            return;
        };
        let key = lock_recover(&self.child_key).take();
        if let Some(key) = key {
            lock_recover(&parent.children).remove(key);
        }
    }

    //---------- internals ----------

    /// All trackers in the ancestor chain, self first, root last
    fn chain(&self) -> impl DoubleEndedIterator<Item = &MemTracker> + '_ {
        iter::once(self).chain(self.ancestors.iter().map(|t| &**t))
    }

    /// Chain members with a finite limit (at construction), self first
    fn limited_chain(&self) -> impl Iterator<Item = &MemTracker> + '_ {
        self.limited
            .then_some(self)
            .into_iter()
            .chain(self.limited_ancestors.iter().map(|t| &**t))
    }

    /// Catch accounting on a closed tracker, in debug builds
    fn debug_assert_open(&self) {
        debug_assert!(
            !self.closed.load(Ordering::Relaxed),
            "accounting on closed tracker {:?}",
            self.label,
        );
    }
}

impl Drop for MemTracker {
    fn drop(&mut self) {
        // Safe to touch the parent: our ancestors strictly outlive us.
        if self.auto_unregister && self.parent.is_some() {
            self.unregister_from_parent();
        }
    }
}

/// Take a mutex, recovering from poison
///
/// Nothing in this crate can leave guarded data inconsistent at a panic
/// (the critical sections are short and infallible, except reclaimers,
/// whose state is theirs), so a poisoned guard is still usable.
fn lock_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TrackerBuilder {
    /// Set the byte cap; negative means no limit
    pub fn limit(&mut self, limit: i64) -> &mut Self {
        self.limit = Some(limit);
        self
    }

    /// Set the diagnostic label
    pub fn label(&mut self, label: impl Into<String>) -> &mut Self {
        self.label = label.into();
        self
    }

    /// Set the advisory category
    pub fn kind(&mut self, kind: TrackerKind) -> &mut Self {
        self.kind = kind;
        self
    }

    /// Set the parent tracker
    pub fn parent(&mut self, parent: &Arc<MemTracker>) -> &mut Self {
        self.parent = Some(Arc::clone(parent));
        self
    }

    /// Use a consumption counter owned elsewhere
    ///
    /// For trackers whose counter belongs to a fragment's runtime
    /// profile.  The profile and the tracker share it; either side may be
    /// destroyed first.
    pub fn counter(&mut self, counter: &Arc<HighWaterCounter>) -> &mut Self {
        self.counter = Some(Arc::clone(counter));
        self
    }

    /// Derive consumption from an external gauge
    ///
    /// Only valid on a tracker with no parent.
    pub fn consumption_metric(&mut self, metric: Arc<dyn ConsumptionMetric>) -> &mut Self {
        self.consumption_metric = Some(metric);
        self
    }

    /// Whether to unregister from the parent on drop (default: true)
    pub fn auto_unregister(&mut self, auto_unregister: bool) -> &mut Self {
        self.auto_unregister = Some(auto_unregister);
        self
    }

    /// Whether usage dumps include this tracker while it is at zero
    /// (default: true)
    pub fn log_usage_if_zero(&mut self, log_usage_if_zero: bool) -> &mut Self {
        self.log_usage_if_zero = Some(log_usage_if_zero);
        self
    }

    /// Build the tracker and register it with its parent
    pub fn build(&self) -> Arc<MemTracker> {
        debug_assert!(
            self.consumption_metric.is_none() || self.parent.is_none(),
            "metric-driven trackers must be roots",
        );

        let limit = self.limit.unwrap_or(-1);

        // Chains are computed once, bottom-up from the parent's chains;
        // after this they are immutable and charge paths take no lock.
        let mut ancestors = Vec::new();
        if let Some(parent) = &self.parent {
            ancestors.reserve(parent.ancestors.len() + 1);
            ancestors.push(Arc::clone(parent));
            ancestors.extend(parent.ancestors.iter().cloned());
        }
        let limited_ancestors = ancestors
            .iter()
            .filter(|t| t.has_limit())
            .cloned()
            .collect();

        let tracker = Arc::new(MemTracker {
            label: self.label.clone(),
            kind: self.kind,
            limit: AtomicI64::new(limit),
            parent: self.parent.clone(),
            consumption: self
                .counter
                .clone()
                .unwrap_or_else(|| Arc::new(HighWaterCounter::new())),
            consumption_metric: self.consumption_metric.clone(),
            ancestors,
            limited_ancestors,
            limited: limit >= 0,
            children: Mutex::new(SlotMap::default()),
            child_key: Mutex::new(None),
            gc: Mutex::new(GcState::default()),
            num_gcs: AtomicU64::new(0),
            bytes_freed_by_last_gc: AtomicI64::new(-1),
            auto_unregister: self.auto_unregister.unwrap_or(true),
            log_usage_if_zero: self.log_usage_if_zero.unwrap_or(true),
            closed: AtomicBool::new(false),
        });

        if let Some(parent) = &tracker.parent {
            let key = lock_recover(&parent.children).insert(Arc::downgrade(&tracker));
            *lock_recover(&tracker.child_key) = Some(key);
        }

        tracker
    }
}
