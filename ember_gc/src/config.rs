//! Heap configuration parameters.
//!
//! Sizes here bound every index space the cell sets address, so they are fixed
//! when a subspace is created.

use crate::heap::MAX_CELL_INDEX;

/// Configuration for a heap subspace and the cell sets scoped to it.
///
/// # Example
///
/// ```ignore
/// use ember_gc::GcConfig;
///
/// // Small blocks, room for plenty of them
/// let config = GcConfig {
///     block_size: 4 * 1024,
///     max_blocks: 4096,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct GcConfig {
    // =========================================================================
    // Blocks
    // =========================================================================
    /// Size of one atom in bytes.
    ///
    /// Atoms are the addressing unit inside a block: a cell is named by the
    /// atom it starts at, and every per-cell bitmap has one bit per atom.
    ///
    /// Default: 16 bytes
    pub atom_size: usize,

    /// Size of each block in bytes. Must be a multiple of `atom_size`.
    ///
    /// Default: 16KB
    pub block_size: usize,

    /// Upper bound on the number of blocks a subspace may own.
    ///
    /// Cell sets reserve one bitmap slot per possible block up front so that
    /// installing a bitmap never has to resize the slot table.
    ///
    /// Default: 1024
    pub max_blocks: usize,

    // =========================================================================
    // Precise Allocations
    // =========================================================================
    /// Cell size at which allocations bypass blocks.
    ///
    /// Requests at or above this size get their own precise allocation.
    ///
    /// Default: 4KB
    pub precise_threshold: usize,

    /// Upper bound on simultaneously live precise allocations.
    ///
    /// Default: 4096
    pub max_precise_allocations: usize,

    // =========================================================================
    // Parallel Iteration
    // =========================================================================
    /// Number of worker threads used for parallel cell-set visits.
    ///
    /// Default: Number of CPUs minus 1, minimum 1
    pub marker_threads: usize,

    // =========================================================================
    // Debugging
    // =========================================================================
    /// Cross-check cell-set bitmaps against the allocator during sweeps.
    ///
    /// Default: false (enabled in debug builds)
    pub verify_sets: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            atom_size: 16,
            block_size: 16 * 1024,
            max_blocks: 1024,
            precise_threshold: 4 * 1024,
            max_precise_allocations: 4096,
            marker_threads: num_cpus().saturating_sub(1).max(1),
            verify_sets: cfg!(debug_assertions),
        }
    }
}

impl GcConfig {
    /// A small heap for embedding and tests.
    pub fn small() -> Self {
        Self {
            block_size: 4 * 1024,
            max_blocks: 64,
            precise_threshold: 1024,
            max_precise_allocations: 256,
            ..Default::default()
        }
    }

    /// Tiny blocks so tests can span many of them with few cells.
    pub fn for_testing() -> Self {
        Self {
            atom_size: 16,
            block_size: 1024,
            max_blocks: 32,
            precise_threshold: 512,
            max_precise_allocations: 64,
            marker_threads: 4,
            verify_sets: true,
        }
    }

    /// Number of atoms in one block.
    #[inline]
    pub fn atoms_per_block(&self) -> usize {
        self.block_size / self.atom_size
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.atom_size < 8 || !self.atom_size.is_power_of_two() {
            return Err(ConfigError::InvalidAtomSize);
        }
        if self.block_size < 1024 || self.block_size % self.atom_size != 0 {
            return Err(ConfigError::InvalidBlockSize);
        }
        if self.max_blocks == 0 {
            return Err(ConfigError::NoBlocks);
        }
        if self.max_blocks - 1 > MAX_CELL_INDEX
            || self.atoms_per_block() - 1 > MAX_CELL_INDEX
            || self.max_precise_allocations.saturating_sub(1) > MAX_CELL_INDEX
        {
            return Err(ConfigError::IndexSpaceExceeded);
        }
        if self.precise_threshold == 0 || self.precise_threshold > self.block_size {
            return Err(ConfigError::InvalidPreciseThreshold);
        }
        if self.marker_threads == 0 {
            return Err(ConfigError::NoMarkerThreads);
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Atom size must be a power of two, minimum 8.
    #[error("atom size must be a power of two, minimum 8")]
    InvalidAtomSize,
    /// Block size must be at least 1KB and a multiple of the atom size.
    #[error("block size must be at least 1KB and a multiple of the atom size")]
    InvalidBlockSize,
    /// At least one block must be allowed.
    #[error("max_blocks must be at least 1")]
    NoBlocks,
    /// Precise threshold must be non-zero and fit inside a block.
    #[error("precise threshold must be between 1 and the block size")]
    InvalidPreciseThreshold,
    /// Blocks, atoms or precise allocations beyond what a cell handle encodes.
    #[error("max_blocks, atoms per block and max_precise_allocations must fit 32-bit cell indices")]
    IndexSpaceExceeded,
    /// At least one marker thread is required.
    #[error("marker_threads must be at least 1")]
    NoMarkerThreads,
}

/// Get the number of available CPUs.
fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
