//! Process-wide tracker roots
//!
//! The tracker tree's top levels are process-wide singletons: the process
//! root, the query pool root, and the load root.  Rather than hiding them
//! in statics, the worker builds a [`TrackerRegistry`] explicitly at
//! startup and hands out handles; teardown happens by dropping it at
//! shutdown, after the subsystems using the handles have been drained.

use crate::internal_prelude::*;

/// The well-known tracker roots of one worker process
///
/// Holds the process root (optionally driven by an allocator gauge), and
/// the `query-pool` and `load` roots beneath it.  The system-metrics
/// publisher reads [`consumption`](MemTracker::consumption) on these at
/// its own cadence.
#[derive(Debug)]
pub struct TrackerRegistry {
    /// The process root; everything else hangs off it
    process: Arc<MemTracker>,
    /// Parent of all per-query trackers
    query_pool: Arc<MemTracker>,
    /// Parent of all ingest trackers
    load: Arc<MemTracker>,
}

impl TrackerRegistry {
    /// Build the root trackers for this process
    ///
    /// When `process_metric` is supplied the process root derives its
    /// consumption from it (typically the allocator's byte counter);
    /// otherwise it tallies what descendants report.
    pub fn new(config: &Config, process_metric: Option<Arc<dyn ConsumptionMetric>>) -> Self {
        let process = {
            let mut b = MemTracker::builder();
            b.limit(config.process_limit.as_i64())
                .label("process")
                .kind(TrackerKind::Process);
            if let Some(metric) = process_metric {
                b.consumption_metric(metric);
            }
            b.build()
        };

        /// Build one of the mid-level roots under the process tracker
        fn sub_root(
            process: &Arc<MemTracker>,
            limit: Option<ByteQty>,
            label: &str,
            kind: TrackerKind,
        ) -> Arc<MemTracker> {
            let mut b = MemTracker::builder();
            b.limit(limit.map_or(-1, ByteQty::as_i64))
                .label(label)
                .kind(kind)
                .parent(process);
            b.build()
        }

        let query_pool = sub_root(
            &process,
            config.query_pool_limit,
            "query-pool",
            TrackerKind::QueryPool,
        );
        let load = sub_root(&process, config.load_limit, "load", TrackerKind::Load);

        TrackerRegistry {
            process,
            query_pool,
            load,
        }
    }

    /// The process root
    pub fn process(&self) -> &Arc<MemTracker> {
        &self.process
    }

    /// The query pool root
    pub fn query_pool(&self) -> &Arc<MemTracker> {
        &self.query_pool
    }

    /// The load root
    pub fn load(&self) -> &Arc<MemTracker> {
        &self.load
    }

    /// Resolve a singleton root by kind
    ///
    /// `None` for kinds that aren't process-wide singletons
    /// ([`Query`](TrackerKind::Query) trackers are per-query, and
    /// [`Unset`](TrackerKind::Unset) is not a lookup key).
    pub fn tracker_for(&self, kind: TrackerKind) -> Option<&Arc<MemTracker>> {
        match kind {
            TrackerKind::Process => Some(&self.process),
            TrackerKind::QueryPool => Some(&self.query_pool),
            TrackerKind::Load => Some(&self.load),
            TrackerKind::Unset | TrackerKind::Query => None,
        }
    }

    /// Make a tracker for one query, under the query pool root
    ///
    /// `limit < 0` means the query is bounded only by the pool and
    /// process limits.  The tracker unregisters itself when the query's
    /// scope drops it.
    pub fn new_query_tracker(&self, limit: i64, label: impl Into<String>) -> Arc<MemTracker> {
        let mut b = MemTracker::builder();
        b.limit(limit)
            .label(label)
            .kind(TrackerKind::Query)
            .parent(&self.query_pool);
        b.build()
    }
}
