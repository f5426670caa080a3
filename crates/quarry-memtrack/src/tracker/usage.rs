//! Usage reporting: rendered dumps, flattened snapshots, and the
//! limit-exceeded diagnostic
//!
//! Reporting walks the child registry, which is only ever a snapshot: a
//! dump taken while other threads charge memory shows each counter at
//! whatever instant its node was visited.  Nothing here is on a hot path.

use super::*;

/// Depth argument to [`MemTracker::log_usage`] meaning "the whole subtree"
///
/// Unlimited dumps are what you want for query trackers and error paths;
/// bounding the depth is for the process tracker, whose subtree can be
/// large.
pub const UNLIMITED_DEPTH: usize = usize::MAX;

/// One row of a flattened usage snapshot
///
/// Produced by [`MemTracker::list_mem_usage`]; carries the fields the
/// system-metrics publisher and the web UI want, without copying whole
/// trackers around.
#[derive(Debug, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub struct MemUsageEntry {
    /// The tracker's label
    pub label: String,
    /// The parent's label; empty for a root
    pub parent_label: String,
    /// Depth below the tracker the snapshot started at
    pub level: usize,
    /// Byte limit (negative: unlimited)
    pub limit: i64,
    /// Consumption when the row was taken
    pub cur_consumption: i64,
    /// Peak consumption when the row was taken
    pub peak_consumption: i64,
}

impl MemTracker {
    /// Render this tracker and up to `max_depth` levels of descendants
    ///
    /// `max_depth == 0` dumps only this tracker;
    /// [`UNLIMITED_DEPTH`] dumps the whole subtree.  Each level is
    /// indented two spaces below `prefix`.
    ///
    /// Subtrees built with `log_usage_if_zero(false)` are left out while
    /// their own consumption is zero and nothing below them would be
    /// shown either.
    pub fn log_usage(&self, max_depth: usize, prefix: &str) -> String {
        self.log_usage_inner(max_depth, prefix).unwrap_or_default()
    }

    /// `log_usage`, distinguishing "suppressed" from "empty"
    fn log_usage_inner(&self, max_depth: usize, prefix: &str) -> Option<String> {
        let consumption = self.consumption();

        let mut line = format!("{prefix}{}:", self.label);
        if self.has_limit() {
            line.push_str(&format!(" limit={}", ByteQty(self.limit())));
        }
        line.push_str(&format!(
            " consumption={} peak={}",
            ByteQty(consumption),
            ByteQty(self.peak_consumption()),
        ));

        let mut rendered_children = Vec::new();
        if max_depth > 0 {
            let child_prefix = format!("{prefix}  ");
            let children = lock_recover(&self.children);
            for child in children.values() {
                let Some(child) = child.upgrade() else { continue };
                if let Some(rendered) = child.log_usage_inner(max_depth - 1, &child_prefix) {
                    rendered_children.push(rendered);
                }
            }
        }

        if !self.log_usage_if_zero && consumption == 0 && rendered_children.is_empty() {
            return None;
        }

        let mut out = line;
        for rendered in rendered_children {
            out.push('\n');
            out.push_str(&rendered);
        }
        Some(out)
    }

    /// Flatten this tracker and its descendants into `out`
    ///
    /// Rows are appended depth-first, `self` first with `level ==
    /// cur_level`; descent stops once `cur_level` reaches `upper_level`.
    pub fn list_mem_usage(
        &self,
        out: &mut Vec<MemUsageEntry>,
        cur_level: usize,
        upper_level: usize,
    ) {
        out.push(MemUsageEntry {
            label: self.label.clone(),
            parent_label: self
                .parent
                .as_ref()
                .map(|p| p.label().to_owned())
                .unwrap_or_default(),
            level: cur_level,
            limit: self.limit(),
            cur_consumption: self.consumption(),
            peak_consumption: self.peak_consumption(),
        });

        if cur_level < upper_level {
            let children = lock_recover(&self.children);
            for child in children.values() {
                let Some(child) = child.upgrade() else { continue };
                child.list_mem_usage(out, cur_level + 1, upper_level);
            }
        }
    }

    /// Build the structured failure for a reservation this tracker
    /// refused
    ///
    /// Logs a warning, captures an unlimited-depth usage dump of this
    /// tracker's subtree, and returns the diagnostic for the caller to
    /// hand up the query stack.  If `failed_allocation` is positive it is
    /// recorded; zero means "size not known".
    pub fn mem_limit_exceeded(
        &self,
        context: Option<&str>,
        details: &str,
        failed_allocation: i64,
    ) -> MemLimitExceeded {
        let diagnostic = MemLimitExceeded {
            label: self.label.clone(),
            limit: self.limit(),
            consumption: self.consumption(),
            failed_allocation,
            context: context.unwrap_or_default().to_owned(),
            details: details.to_owned(),
            usage: self.log_usage(UNLIMITED_DEPTH, ""),
        };
        warn!(
            tracker = %self.label,
            consumption = diagnostic.consumption,
            limit = diagnostic.limit,
            failed_allocation,
            "memory limit exceeded: {}",
            details,
        );
        diagnostic
    }
}
