#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![doc = include_str!("../README.md")]

//! ## Key concepts
//!
//!  * **Tracker**:
//!    One accounting scope; a node in the hierarchy.
//!    Consumption charged to a tracker is also charged to every ancestor,
//!    so the process root always reflects the whole worker.
//!
//!  * **Consumption** and **peak**:
//!    Current bytes charged to a tracker (directly or via descendants),
//!    and the monotonic maximum that value has ever reached.
//!
//!  * **Limit**:
//!    An optional byte cap.  Limits are enforced only by
//!    [`MemTracker::try_consume`]; the unconditional
//!    [`consume`](MemTracker::consume)/[`release`](MemTracker::release)
//!    paths never check them.
//!
//!  * **Reservation**:
//!    A successful `try_consume`, binding the requested bytes against
//!    every finite ancestor limit.  On failure nothing is charged.
//!
//!  * **Reclamation**:
//!    When a reservation would cross a limit, the tracker invokes its
//!    registered [`MemoryReclaimer`]s (in registration order) to try to
//!    free memory, then retries.
//!
//!  * **External metric**:
//!    A root tracker may derive its consumption from an out-of-band gauge
//!    (typically the allocator's own byte counter) instead of the tally
//!    maintained by `consume`/`release`.  See [`ConsumptionMetric`].
//!
//! ## Ownership and `Arc` keeping-alive
//!
//!  * Trackers are handled as `Arc<MemTracker>`.  A child keeps its whole
//!    ancestor chain alive; a parent holds only `Weak` references to its
//!    children (used for reporting), so the tree contains no strong cycle.
//!
//!  * Dropping the last handle to a tracker removes it from its parent's
//!    child list (when built with `auto_unregister`, the default).
//!
//!  * Lifecycle operations (construction, [`close`](MemTracker::close),
//!    drop) must be serialized against concurrent accounting calls on the
//!    same node; everything else may be called freely from any thread.

#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cargo_common_metadata)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::implicit_clone)]
#![deny(clippy::large_stack_arrays)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![warn(clippy::trait_duplication_in_bounds)]
#![deny(clippy::unnecessary_wraps)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]
#![allow(clippy::let_unit_value)] // This can reasonably be done for explicitness
#![allow(clippy::uninlined_format_args)]

// Internal supporting modules
mod internal_prelude;

// Modules with public items
mod config;
mod counter;
mod error;
mod metric;
mod qty;
mod registry;
mod scoped;
pub mod tracker;

//---------- re-exports at the crate root ----------

pub use config::{Config, ConfigBuilder};
pub use counter::HighWaterCounter;
pub use error::{ConfigBuildError, MemLimitExceeded};
pub use metric::ConsumptionMetric;
pub use qty::{ByteQty, InvalidByteQty};
pub use registry::TrackerRegistry;
pub use scoped::TrackedBytes;
pub use tracker::{
    MemTracker, MemUsageEntry, MemoryReclaimer, TrackerBuilder, TrackerKind, UNLIMITED_DEPTH,
};
