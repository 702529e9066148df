//! Subspaces: heap partitions of same-sized cells.
//!
//! A subspace owns a directory of marked blocks plus a precise allocation
//! space, and answers the questions a cell set needs from the allocator:
//! where a cell lives, whether it is marked or live, which blocks exist, and
//! which blocks have any marked cells at all.
//!
//! The subspace also keeps a registry of the cell sets scoped to it. Sweeping
//! and block removal notify every registered set before any freed slot can be
//! reused, which is what keeps stale membership bits from leaking onto new
//! cells.

use super::block::MarkedBlock;
use super::precise::{PreciseAllocationInfo, PreciseAllocationSpace};
use super::{CellLocation, HeapCell};
use crate::cell_set::CellSet;
use crate::config::GcConfig;
use crate::error::{GcError, GcResult};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Result of sweeping a subspace.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepResult {
    /// Block cells freed.
    pub cells_freed: usize,
    /// Precise allocations freed.
    pub precise_freed: usize,
    /// Bytes returned to the allocator.
    pub bytes_freed: usize,
}

/// A heap partition owning blocks and precise allocations.
pub struct Subspace {
    /// Diagnostic name.
    name: String,
    /// Configuration parameters.
    config: GcConfig,
    /// Requested cell size in bytes.
    cell_size: usize,
    /// Atoms per block cell.
    cell_atoms: usize,
    /// Block directory, indexed by block index. Removed blocks leave `None`.
    blocks: RwLock<Vec<Option<Arc<MarkedBlock>>>>,
    /// Block tried first by the allocation fast path.
    current_block: AtomicUsize,
    /// Standalone allocations.
    precise: PreciseAllocationSpace,
    /// Cell sets scoped to this subspace.
    cell_sets: Mutex<FxHashMap<u64, Weak<CellSet>>>,
    /// Next cell-set registration id.
    next_set_id: AtomicU64,
}

impl Subspace {
    /// Create a subspace for cells of `cell_size` bytes.
    ///
    /// Cells at or above the configured precise threshold are always allocated
    /// as precise allocations.
    pub fn new(name: impl Into<String>, cell_size: usize, config: GcConfig) -> GcResult<Arc<Self>> {
        config.validate()?;
        if cell_size == 0 {
            return Err(GcError::allocation("zero-sized cell", 0));
        }

        let cell_atoms = cell_size.div_ceil(config.atom_size);
        let precise = PreciseAllocationSpace::new(config.max_precise_allocations);

        Ok(Arc::new(Self {
            name: name.into(),
            cell_size,
            cell_atoms,
            blocks: RwLock::new(Vec::new()),
            current_block: AtomicUsize::new(0),
            precise,
            cell_sets: Mutex::new(FxHashMap::default()),
            next_set_id: AtomicU64::new(1),
            config,
        }))
    }

    /// Create a subspace with default configuration.
    pub fn with_defaults(name: impl Into<String>, cell_size: usize) -> GcResult<Arc<Self>> {
        Self::new(name, cell_size, GcConfig::default())
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate one cell.
    ///
    /// Fails with `AllocationFailure` when the block directory is full.
    pub fn allocate(&self) -> GcResult<HeapCell> {
        if self.is_precise_only() {
            return self.allocate_precise(self.cell_size);
        }

        let current = self.current_block.load(Ordering::Relaxed);
        {
            let blocks = self.blocks.read();
            if let Some(Some(block)) = blocks.get(current) {
                if let Some(atom) = block.allocate() {
                    return Ok(HeapCell::in_block(block.index(), atom));
                }
            }
        }

        self.allocate_slow()
    }

    /// Slow path: search the directory for space or add a block.
    fn allocate_slow(&self) -> GcResult<HeapCell> {
        let mut blocks = self.blocks.write();

        for block in blocks.iter().flatten() {
            if let Some(atom) = block.allocate() {
                self.current_block.store(block.index(), Ordering::Relaxed);
                return Ok(HeapCell::in_block(block.index(), atom));
            }
        }

        let index = match blocks.iter().position(Option::is_none) {
            Some(index) => index,
            None if blocks.len() < self.config.max_blocks => {
                blocks.push(None);
                blocks.len() - 1
            }
            None => return Err(GcError::allocation("block", blocks.len())),
        };

        let block = Arc::new(MarkedBlock::new(
            index,
            self.config.atoms_per_block(),
            self.cell_atoms,
        ));
        let atom = block
            .allocate()
            .ok_or_else(|| GcError::allocation("cell", self.cell_size))?;
        blocks[index] = Some(block);
        self.current_block.store(index, Ordering::Relaxed);

        log::debug!("subspace {}: added block {}", self.name, index);
        Ok(HeapCell::in_block(index, atom))
    }

    /// Allocate a standalone cell of `size` bytes.
    pub fn allocate_precise(&self, size: usize) -> GcResult<HeapCell> {
        self.precise
            .alloc(size)
            .map(HeapCell::precise)
            .ok_or_else(|| GcError::allocation("precise allocation", self.precise.capacity()))
    }

    /// True if every cell of this subspace is a precise allocation.
    #[inline]
    pub fn is_precise_only(&self) -> bool {
        self.cell_size >= self.config.precise_threshold
            || self.cell_atoms > self.config.atoms_per_block()
    }

    // =========================================================================
    // Cell Queries
    // =========================================================================

    /// Get a block by index.
    #[inline]
    pub fn block(&self, index: usize) -> Option<Arc<MarkedBlock>> {
        self.blocks.read().get(index).cloned().flatten()
    }

    /// Snapshot of all blocks in ascending index order.
    pub fn blocks(&self) -> Vec<Arc<MarkedBlock>> {
        self.blocks.read().iter().flatten().cloned().collect()
    }

    /// Check if a cell is currently allocated in this subspace.
    pub fn contains(&self, cell: HeapCell) -> bool {
        match cell.location() {
            CellLocation::Block {
                block_index,
                atom_number,
            } => self
                .with_block(block_index, |b| b.is_cell_start(atom_number) && b.is_allocated(atom_number))
                .unwrap_or(false),
            CellLocation::Precise(index) => self.precise.contains(index),
        }
    }

    /// Mark a cell. Returns true if it was newly marked.
    pub fn mark(&self, cell: HeapCell) -> bool {
        match cell.location() {
            CellLocation::Block {
                block_index,
                atom_number,
            } => self
                .with_block(block_index, |b| b.mark(atom_number))
                .unwrap_or(false),
            CellLocation::Precise(index) => self.precise.mark(index),
        }
    }

    /// Check if a cell is marked.
    pub fn is_marked(&self, cell: HeapCell) -> bool {
        match cell.location() {
            CellLocation::Block {
                block_index,
                atom_number,
            } => self
                .with_block(block_index, |b| b.is_marked(atom_number))
                .unwrap_or(false),
            CellLocation::Precise(index) => self.precise.is_marked(index),
        }
    }

    /// Check if a cell is live in the allocator's sense.
    pub fn is_live(&self, cell: HeapCell) -> bool {
        match cell.location() {
            CellLocation::Block {
                block_index,
                atom_number,
            } => self
                .with_block(block_index, |b| b.is_live(atom_number))
                .unwrap_or(false),
            CellLocation::Precise(index) => self.precise.contains(index),
        }
    }

    #[inline]
    fn with_block<R>(&self, index: usize, f: impl FnOnce(&MarkedBlock) -> R) -> Option<R> {
        let blocks = self.blocks.read();
        blocks.get(index).and_then(Option::as_ref).map(|b| f(b))
    }

    // =========================================================================
    // Enumeration
    // =========================================================================

    /// Enumerate precise allocations in ascending index order.
    pub fn for_each_precise_allocation<F>(&self, f: F)
    where
        F: FnMut(PreciseAllocationInfo),
    {
        self.precise.for_each(f);
    }

    /// Build a claim-once source over blocks that have marked cells and pass
    /// `filter`.
    pub fn parallel_marked_block_source<F>(&self, filter: F) -> ParallelBlockSource
    where
        F: Fn(usize) -> bool,
    {
        let blocks = self
            .blocks
            .read()
            .iter()
            .flatten()
            .filter(|b| b.has_marked_cells() && filter(b.index()))
            .cloned()
            .collect();
        ParallelBlockSource::new(blocks)
    }

    // =========================================================================
    // Collection
    // =========================================================================

    /// Clear every mark (start of a marking cycle).
    pub fn clear_marks(&self) {
        for block in self.blocks.read().iter().flatten() {
            block.clear_marks();
        }
        self.precise.clear_marks();
    }

    /// Free every unmarked cell.
    ///
    /// Registered cell sets drop the dead members of each block before that
    /// block is swept, and clear dead precise indices before the index is
    /// released. The mutator must be stopped.
    pub fn sweep(&self) -> SweepResult {
        let sets = self.live_cell_sets();
        let mut result = SweepResult::default();

        for block in self.blocks.read().iter().flatten() {
            for set in &sets {
                set.sweep_block(block);
            }
            result.cells_freed += block.sweep();
        }
        result.bytes_freed = result.cells_freed * self.cell_atoms * self.config.atom_size;

        let (bytes, objects) = self.precise.sweep(|index| {
            for set in &sets {
                set.clear_precise_cell(index);
            }
        });
        result.precise_freed = objects;
        result.bytes_freed = result.bytes_freed.saturating_add(bytes);

        if self.config.verify_sets {
            for set in &sets {
                let stale = set.count_stale_members();
                if stale > 0 {
                    log::error!(
                        "subspace {}: cell set {} kept {} dead members after sweep",
                        self.name,
                        set.name(),
                        stale
                    );
                }
                debug_assert_eq!(stale, 0, "cell set kept dead members after sweep");
            }
        }

        log::debug!(
            "subspace {}: swept {} cells, {} precise, {} bytes",
            self.name,
            result.cells_freed,
            result.precise_freed,
            result.bytes_freed
        );
        result
    }

    /// Return empty blocks to the allocator.
    ///
    /// Cell sets forget every member of a removed block before its index can be
    /// handed out again. No cell-set iteration may be in flight.
    pub fn remove_empty_blocks(&self) -> usize {
        let sets = self.live_cell_sets();
        let mut blocks = self.blocks.write();
        let mut removed = 0;

        for slot in blocks.iter_mut() {
            if matches!(slot, Some(block) if block.is_empty()) {
                if let Some(block) = slot.take() {
                    for set in &sets {
                        set.did_remove_block(block.index());
                    }
                    removed += 1;
                }
            }
        }
        while matches!(blocks.last(), Some(None)) {
            blocks.pop();
        }

        if removed > 0 {
            self.current_block.store(0, Ordering::Relaxed);
            log::debug!("subspace {}: removed {} empty blocks", self.name, removed);
        }
        removed
    }

    // =========================================================================
    // Cell Set Registry
    // =========================================================================

    /// Register a cell set for sweep notifications.
    pub(crate) fn register_cell_set(&self, set: Weak<CellSet>) -> u64 {
        let id = self.next_set_id.fetch_add(1, Ordering::Relaxed);
        self.cell_sets.lock().insert(id, set);
        id
    }

    /// Remove a cell set registration.
    pub(crate) fn unregister_cell_set(&self, id: u64) {
        self.cell_sets.lock().remove(&id);
    }

    /// Strong references to every registered set still alive.
    fn live_cell_sets(&self) -> Vec<Arc<CellSet>> {
        let mut sets = self.cell_sets.lock();
        sets.retain(|_, set| set.strong_count() > 0);
        sets.values().filter_map(Weak::upgrade).collect()
    }

    /// Number of registered cell sets.
    pub fn cell_set_count(&self) -> usize {
        self.live_cell_sets().len()
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Diagnostic name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the configuration.
    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Requested cell size.
    pub fn cell_size(&self) -> usize {
        self.cell_size
    }

    /// Atoms per block.
    #[inline]
    pub fn atoms_per_block(&self) -> usize {
        self.config.atoms_per_block()
    }

    /// Maximum number of blocks.
    #[inline]
    pub fn block_capacity(&self) -> usize {
        self.config.max_blocks
    }

    /// Number of blocks currently owned.
    pub fn block_count(&self) -> usize {
        self.blocks.read().iter().flatten().count()
    }

    /// The precise allocation space.
    pub fn precise(&self) -> &PreciseAllocationSpace {
        &self.precise
    }
}

impl std::fmt::Debug for Subspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subspace")
            .field("name", &self.name)
            .field("cell_size", &self.cell_size)
            .field("blocks", &self.block_count())
            .field("precise", &self.precise.count())
            .finish()
    }
}

// =============================================================================
// Parallel Block Source
// =============================================================================

/// A shared queue of blocks, each handed out exactly once.
///
/// Workers call `next_block` until it returns `None`; a single atomic cursor
/// decides which worker claims which block.
pub struct ParallelBlockSource {
    blocks: Vec<Arc<MarkedBlock>>,
    next: AtomicUsize,
}

impl ParallelBlockSource {
    /// Create a source over `blocks`.
    pub fn new(blocks: Vec<Arc<MarkedBlock>>) -> Self {
        Self {
            blocks,
            next: AtomicUsize::new(0),
        }
    }

    /// Claim the next unclaimed block.
    #[inline]
    pub fn next_block(&self) -> Option<&Arc<MarkedBlock>> {
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        self.blocks.get(index)
    }

    /// Total number of blocks in the source.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// True if the source was created empty.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subspace() -> Arc<Subspace> {
        Subspace::new("test", 16, GcConfig::for_testing()).unwrap()
    }

    #[test]
    fn test_huge_cells_are_precise() {
        let space = Subspace::new("huge", usize::MAX, GcConfig::for_testing()).unwrap();
        assert!(space.is_precise_only());

        let a = space.allocate().unwrap();
        let b = space.allocate().unwrap();
        assert!(a.is_precise() && b.is_precise());
        assert_eq!(space.block_count(), 0);

        let result = space.sweep();
        assert_eq!(result.precise_freed, 2);
        assert_eq!(result.bytes_freed, usize::MAX);
    }

    #[test]
    fn test_subspace_creation() {
        let space = subspace();
        assert_eq!(space.block_count(), 0);
        assert!(!space.is_precise_only());
        assert_eq!(space.atoms_per_block(), 64);
    }

    #[test]
    fn test_allocate_fills_blocks_in_order() {
        let space = subspace();
        let cells: Vec<HeapCell> = (0..70).map(|_| space.allocate().unwrap()).collect();

        assert_eq!(space.block_count(), 2);
        assert_eq!(
            cells[0].location(),
            CellLocation::Block {
                block_index: 0,
                atom_number: 0
            }
        );
        assert_eq!(
            cells[64].location(),
            CellLocation::Block {
                block_index: 1,
                atom_number: 0
            }
        );
        assert!(cells.iter().all(|c| space.contains(*c)));
    }

    #[test]
    fn test_block_directory_exhausted() {
        let config = GcConfig {
            max_blocks: 1,
            ..GcConfig::for_testing()
        };
        let space = Subspace::new("tiny", 256, config).unwrap();
        for _ in 0..4 {
            space.allocate().unwrap();
        }
        let err = space.allocate().unwrap_err();
        assert!(err.is_allocation_failure());
    }

    #[test]
    fn test_precise_only_subspace() {
        let space = Subspace::new("large", 600, GcConfig::for_testing()).unwrap();
        let cell = space.allocate().unwrap();
        assert!(cell.is_precise());
        assert!(space.is_live(cell));
    }

    #[test]
    fn test_mark_and_query() {
        let space = subspace();
        let a = space.allocate().unwrap();
        let b = space.allocate_precise(2048).unwrap();

        assert!(space.mark(a));
        assert!(space.mark(b));
        assert!(space.is_marked(a));
        assert!(space.is_marked(b));

        space.clear_marks();
        assert!(!space.is_marked(a));
        assert!(!space.is_marked(b));
    }

    #[test]
    fn test_unknown_cells_are_not_marked() {
        let space = subspace();
        let stray = HeapCell::in_block(7, 0);
        assert!(!space.mark(stray));
        assert!(!space.is_marked(stray));
        assert!(!space.is_live(stray));
        assert!(!space.contains(HeapCell::precise(3)));
    }

    #[test]
    fn test_sweep_frees_unmarked() {
        let space = subspace();
        let keep = space.allocate().unwrap();
        let dead = space.allocate().unwrap();
        let big = space.allocate_precise(1000).unwrap();
        space.mark(keep);

        let result = space.sweep();
        assert_eq!(result.cells_freed, 1);
        assert_eq!(result.precise_freed, 1);
        assert_eq!(result.bytes_freed, 16 + 1000);
        assert!(space.is_live(keep));
        assert!(!space.is_live(dead));
        assert!(!space.is_live(big));
    }

    #[test]
    fn test_remove_empty_blocks() {
        let space = subspace();
        for _ in 0..65 {
            space.allocate().unwrap();
        }
        assert_eq!(space.block_count(), 2);

        space.sweep();
        assert_eq!(space.remove_empty_blocks(), 2);
        assert_eq!(space.block_count(), 0);

        // Directory slots are reused from the bottom
        let cell = space.allocate().unwrap();
        assert_eq!(
            cell.location(),
            CellLocation::Block {
                block_index: 0,
                atom_number: 0
            }
        );
    }

    #[test]
    fn test_parallel_block_source_claims_once() {
        let space = subspace();
        let cells: Vec<HeapCell> = (0..200).map(|_| space.allocate().unwrap()).collect();
        space.mark(cells[0]);
        space.mark(cells[130]);

        let source = space.parallel_marked_block_source(|_| true);
        assert_eq!(source.len(), 2);
        assert_eq!(source.next_block().map(|b| b.index()), Some(0));
        assert_eq!(source.next_block().map(|b| b.index()), Some(2));
        assert!(source.next_block().is_none());
        assert!(source.next_block().is_none());
    }
}
