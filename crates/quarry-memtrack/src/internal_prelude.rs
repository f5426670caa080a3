//! Internal prelude
//!
//! This file contains most of the imports we wish to use, throughout this
//! crate.
//!
//! Every module does `use crate::internal_prelude::*;`
//!
//! Exceptions:
//!
//!  * Names that are private to a module and its submodules
//!    are imported to the sub-modules via `use super::*`.
//!    (Thus, the sub-module inherits the prelude from its parent.)

#![allow(unused_imports)]

pub(crate) use std::{
    fmt::{self, Debug, Display, Write as _},
    iter, mem, ptr,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
};

pub(crate) use {
    educe::Educe,
    serde::{Deserialize, Serialize},
    slotmap::SlotMap,
    static_assertions::assert_impl_all,
    thiserror::Error,
    tracing::{debug, trace, warn},
};

pub(crate) use crate::{
    config::Config,
    counter::HighWaterCounter,
    error::{ConfigBuildError, MemLimitExceeded},
    metric::ConsumptionMetric,
    qty::ByteQty,
    tracker::{MemTracker, MemoryReclaimer, TrackerKind, UNLIMITED_DEPTH},
};
