//! Errors and structured diagnostics.

use crate::internal_prelude::*;

/// An error occurred while building a [`Config`](crate::Config) from a
/// [`ConfigBuilder`](crate::ConfigBuilder)
#[derive(Debug, Clone, Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ConfigBuildError {
    /// A mandatory field was not present
    #[error("field was not provided: {field}")]
    MissingField {
        /// The name of the missing field
        field: String,
    },

    /// A single field had an invalid value
    #[error("invalid value for {field}: {problem}")]
    Invalid {
        /// The name of the invalid field
        field: String,
        /// A description of the problem
        problem: String,
    },

    /// Multiple fields are inconsistent
    #[error("fields {} are inconsistent: {problem}", .fields.join(", "))]
    Inconsistent {
        /// The names of the inconsistent fields
        fields: Vec<String>,
        /// A description of the problem
        problem: String,
    },
}

/// Failure value produced when a reservation cannot fit under a limit
///
/// Built by [`MemTracker::mem_limit_exceeded`](crate::MemTracker::mem_limit_exceeded)
/// and returned by [`TrackedBytes::try_new`](crate::TrackedBytes::try_new).
/// Callers hand it up the query stack; the tracker itself never raises
/// control flow.
///
/// `Display` renders a one-line summary followed by the usage dump of the
/// offending tracker's subtree.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct MemLimitExceeded {
    /// Label of the tracker whose limit was hit
    pub label: String,
    /// The tracker's byte limit (negative: unlimited)
    pub limit: i64,
    /// The tracker's consumption when the diagnostic was built
    pub consumption: i64,
    /// Size of the failing allocation; 0 when not recorded
    pub failed_allocation: i64,
    /// Caller-supplied context, eg a query id (empty when not supplied)
    pub context: String,
    /// Caller-supplied description of what was being allocated
    pub details: String,
    /// Multi-line usage dump of the offending tracker's subtree
    pub usage: String,
}

impl Display for MemLimitExceeded {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "memory limit exceeded")?;
        if !self.context.is_empty() {
            write!(f, " ({})", self.context)?;
        }
        write!(f, ": {}", self.details)?;
        if self.failed_allocation > 0 {
            write!(
                f,
                " (failed allocation of {})",
                ByteQty(self.failed_allocation)
            )?;
        }
        write!(
            f,
            "; tracker {:?} limit {} consumption {}",
            self.label,
            ByteQty(self.limit),
            ByteQty(self.consumption),
        )?;
        if !self.usage.is_empty() {
            write!(f, "\n{}", self.usage)?;
        }
        Ok(())
    }
}

impl std::error::Error for MemLimitExceeded {}
