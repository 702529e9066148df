//! Error types for heap and cell-set operations.

use crate::config::ConfigError;
use crate::heap::HeapCell;

/// Errors reported by the heap and by cell sets.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GcError {
    /// Backing storage could not be grown.
    ///
    /// Raised when a block bitmap cannot be materialized, when the block or
    /// precise index space is exhausted, or when the system allocator refuses a
    /// reservation.
    #[error("allocation failure: {what} (requested {requested})")]
    AllocationFailure {
        /// What was being allocated.
        what: &'static str,
        /// Requested index or size.
        requested: usize,
    },

    /// The cell does not name an allocation of this subspace.
    #[error("cell {0:?} does not belong to this subspace")]
    ForeignCell(HeapCell),

    /// The heap configuration was rejected.
    #[error("invalid heap configuration: {0}")]
    Config(#[from] ConfigError),
}

impl GcError {
    /// Shorthand for an allocation failure.
    #[inline]
    pub(crate) fn allocation(what: &'static str, requested: usize) -> Self {
        GcError::AllocationFailure { what, requested }
    }

    /// True for the allocation-failure class.
    #[inline]
    pub fn is_allocation_failure(&self) -> bool {
        matches!(self, GcError::AllocationFailure { .. })
    }
}

/// Result alias for heap operations.
pub type GcResult<T> = Result<T, GcError>;
