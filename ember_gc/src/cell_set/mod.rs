//! Concurrent cell-set membership tracking.
//!
//! A `CellSet` records a named subset of the cells of one subspace: for
//! example "objects with a pending finalizer" or "weak maps that need
//! constraint solving". Membership is one bit per cell and is independent of
//! marking; "member and marked" is computed at iteration time.
//!
//! # Layout
//!
//! ```text
//!   block_bits: [ptr | null | ptr | null | ... ]   one slot per possible block
//!                 │            │
//!                 ▼            ▼
//!          AtomicBitmap   AtomicBitmap            one bit per atom
//!
//!   precise_bits: AtomicBitmap                    one bit per precise index
//! ```
//!
//! Block bitmaps are materialized lazily on the first `add` into a block. The
//! adding thread builds a candidate off to the side and installs it with a
//! compare-and-swap; a thread that loses the race frees its candidate and uses
//! the winner's, so there is never more than one bitmap per block.
//!
//! # Concurrency
//!
//! - `add`/`remove`/`contains` are lock-free and may run concurrently with each
//!   other and with a marking collector, as long as no single cell is added and
//!   removed at the same time.
//! - Iteration requires the bitmap structure to be frozen: no `add` that could
//!   materialize a bitmap, and no `did_remove_block`/`clear`, may run
//!   concurrently. Bit contents may still change underneath.

mod parallel;

pub use parallel::ParallelMarkedCellTask;

use crate::error::{GcError, GcResult};
use crate::heap::{AtomicBitmap, CellLocation, HeapCell, MarkedBlock, Subspace};
use crate::stats::CellSetStats;

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

/// A set of cells of one subspace.
pub struct CellSet {
    /// Diagnostic name.
    name: String,
    /// The subspace whose cells this set tracks.
    subspace: Arc<Subspace>,
    /// Registration id in the subspace's cell-set registry.
    registration: u64,
    /// Lazily materialized per-block bitmaps, indexed by block index.
    block_bits: Box<[AtomicPtr<AtomicBitmap>]>,
    /// Block indices that have a materialized bitmap.
    blocks_with_bits: AtomicBitmap,
    /// Membership bits for precise allocations.
    precise_bits: AtomicBitmap,
    /// Activity counters.
    stats: CellSetStats,
}

impl CellSet {
    /// Create an empty set scoped to `subspace`.
    ///
    /// The set registers itself with the subspace so that sweeps drop dead
    /// members before their slots are reused.
    pub fn new(name: impl Into<String>, subspace: &Arc<Subspace>) -> GcResult<Arc<Self>> {
        let block_capacity = subspace.block_capacity();
        let precise_capacity = subspace.precise().capacity();

        let mut slots = Vec::new();
        slots
            .try_reserve_exact(block_capacity)
            .map_err(|_| GcError::allocation("cell set slot table", block_capacity))?;
        slots.extend((0..block_capacity).map(|_| AtomicPtr::new(ptr::null_mut())));

        let blocks_with_bits = AtomicBitmap::try_new(block_capacity)
            .map_err(|_| GcError::allocation("cell set block summary", block_capacity))?;
        let precise_bits = AtomicBitmap::try_new(precise_capacity)
            .map_err(|_| GcError::allocation("cell set precise bitmap", precise_capacity))?;

        let name = name.into();
        let set = Arc::new_cyclic(|weak| Self {
            registration: subspace.register_cell_set(weak.clone()),
            name,
            subspace: Arc::clone(subspace),
            block_bits: slots.into_boxed_slice(),
            blocks_with_bits,
            precise_bits,
            stats: CellSetStats::new(),
        });
        log::debug!("cell set {} created on subspace {}", set.name, subspace.name());
        Ok(set)
    }

    // =========================================================================
    // Membership
    // =========================================================================

    /// Insert a cell. Returns `Ok(true)` if it was not already a member.
    ///
    /// Fails with `AllocationFailure` if the block's bitmap had to be
    /// materialized and could not be; the insertion did not happen.
    #[inline]
    pub fn add(&self, cell: HeapCell) -> GcResult<bool> {
        let added = match cell.location() {
            CellLocation::Precise(index) => {
                if index >= self.precise_bits.len() {
                    return Err(GcError::allocation("precise membership bit", index));
                }
                !self.precise_bits.test_and_set(index)
            }
            CellLocation::Block {
                block_index,
                atom_number,
            } => {
                if atom_number >= self.subspace.atoms_per_block() {
                    return Err(GcError::ForeignCell(cell));
                }
                let bits = match self.bits_for(block_index) {
                    Some(bits) => bits,
                    None => self.add_slow(block_index)?,
                };
                !bits.test_and_set(atom_number)
            }
        };

        if added {
            self.stats.record_insertion();
        }
        Ok(added)
    }

    /// Materialize the bitmap for `block_index`.
    #[cold]
    fn add_slow(&self, block_index: usize) -> GcResult<&AtomicBitmap> {
        let slot = self
            .block_bits
            .get(block_index)
            .ok_or_else(|| GcError::allocation("block bitmap slot", block_index))?;

        let atoms = self.subspace.atoms_per_block();
        let candidate = AtomicBitmap::try_new(atoms)
            .map_err(|_| GcError::allocation("block bitmap", atoms))?;
        let candidate = Box::into_raw(Box::new(candidate));

        match slot.compare_exchange(ptr::null_mut(), candidate, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {
                self.blocks_with_bits.set(block_index);
                self.stats.record_materialized();
                log::debug!("cell set {}: materialized bitmap for block {}", self.name, block_index);
                // SAFETY: the slot now owns `candidate`; bitmaps are freed only
                // when the set is dropped.
                Ok(unsafe { &*candidate })
            }
            Err(winner) => {
                // SAFETY: `candidate` was never published.
                drop(unsafe { Box::from_raw(candidate) });
                self.stats.record_race_lost();
                log::trace!("cell set {}: lost bitmap race for block {}", self.name, block_index);
                // SAFETY: `winner` is installed and lives as long as `self`.
                Ok(unsafe { &*winner })
            }
        }
    }

    /// Remove a cell. Returns true if it was a member.
    ///
    /// Never materializes a bitmap: a block without one has no members.
    #[inline]
    pub fn remove(&self, cell: HeapCell) -> bool {
        let removed = match cell.location() {
            CellLocation::Precise(index) => {
                index < self.precise_bits.len() && self.precise_bits.test_and_clear(index)
            }
            CellLocation::Block {
                block_index,
                atom_number,
            } => match self.bits_for(block_index) {
                Some(bits) if atom_number < bits.len() => bits.test_and_clear(atom_number),
                _ => false,
            },
        };

        if removed {
            self.stats.record_removal();
        }
        removed
    }

    /// Check membership.
    #[inline]
    pub fn contains(&self, cell: HeapCell) -> bool {
        match cell.location() {
            CellLocation::Precise(index) => {
                index < self.precise_bits.len() && self.precise_bits.get(index)
            }
            CellLocation::Block {
                block_index,
                atom_number,
            } => match self.bits_for(block_index) {
                Some(bits) if atom_number < bits.len() => bits.get(atom_number),
                _ => false,
            },
        }
    }

    /// The materialized bitmap for a block, if any.
    #[inline]
    pub(crate) fn bits_for(&self, block_index: usize) -> Option<&AtomicBitmap> {
        let ptr = self.block_bits.get(block_index)?.load(Ordering::Acquire);
        // SAFETY: non-null slots point at bitmaps owned by this set until drop.
        unsafe { ptr.as_ref() }
    }

    /// Check whether a block has a materialized bitmap.
    #[inline]
    pub fn has_bits_for(&self, block_index: usize) -> bool {
        block_index < self.blocks_with_bits.len() && self.blocks_with_bits.get(block_index)
    }

    // =========================================================================
    // Iteration
    // =========================================================================

    /// Visit every member that is currently marked.
    ///
    /// Block members come first in ascending `(block, atom)` order, then precise
    /// members in the subspace's precise enumeration order. Blocks with no
    /// marked cells or no bitmap are skipped without being scanned.
    ///
    /// The bitmap structure must be frozen for the duration.
    pub fn for_each_marked_cell<F>(&self, mut f: F)
    where
        F: FnMut(HeapCell),
    {
        let mut visited = 0;

        for block in self.subspace.blocks() {
            let index = block.index();
            if !block.has_marked_cells() || !self.has_bits_for(index) {
                continue;
            }
            if let Some(bits) = self.bits_for(index) {
                block.for_each_marked_cell(|atom| {
                    if bits.get(atom) {
                        f(HeapCell::in_block(index, atom));
                        visited += 1;
                    }
                });
            }
        }

        self.subspace.for_each_precise_allocation(|info| {
            if info.marked && self.precise_bits.get(info.index) {
                f(HeapCell::precise(info.index));
                visited += 1;
            }
        });

        self.stats.record_visits(visited);
    }

    /// Build a shareable task that visits every marked member.
    ///
    /// Any number of workers may call `run` on the returned task. Each block is
    /// claimed by exactly one worker; exactly one worker visits precise members.
    /// The bitmap structure must stay frozen until every worker has returned.
    pub fn for_each_marked_cell_in_parallel<F>(self: &Arc<Self>, f: F) -> Arc<ParallelMarkedCellTask<F>> {
        self.stats.record_parallel_task();
        let source = self
            .subspace
            .parallel_marked_block_source(|index| self.has_bits_for(index));
        Arc::new(ParallelMarkedCellTask::new(Arc::clone(self), source, f))
    }

    /// Run a parallel visit on the configured number of marker threads.
    ///
    /// Each worker gets its own visitor from `make_visitor`; the visitors are
    /// returned once all workers are done.
    pub fn visit_marked_cells_parallel<V, M, F>(self: &Arc<Self>, make_visitor: M, f: F) -> Vec<V>
    where
        V: Send,
        M: Fn() -> V + Sync,
        F: Fn(&mut V, HeapCell) + Send + Sync,
    {
        let workers = self.subspace.config().marker_threads;
        let task = self.for_each_marked_cell_in_parallel(f);

        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    let task = Arc::clone(&task);
                    let make_visitor = &make_visitor;
                    scope.spawn(move || {
                        let mut visitor = make_visitor();
                        task.run(&mut visitor);
                        visitor
                    })
                })
                .collect();

            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(visitor) => visitor,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect()
        })
    }

    /// Visit every member the allocator considers live.
    ///
    /// Same traversal shape as `for_each_marked_cell`, filtered by liveness
    /// instead of marks. Used outside marking windows.
    pub fn for_each_live_cell<F>(&self, mut f: F)
    where
        F: FnMut(HeapCell),
    {
        let mut visited = 0;

        for block in self.subspace.blocks() {
            let index = block.index();
            if !self.has_bits_for(index) {
                continue;
            }
            if let Some(bits) = self.bits_for(index) {
                block.for_each_live_cell(|atom| {
                    if bits.get(atom) {
                        f(HeapCell::in_block(index, atom));
                        visited += 1;
                    }
                });
            }
        }

        self.subspace.for_each_precise_allocation(|info| {
            if self.precise_bits.get(info.index) {
                f(HeapCell::precise(info.index));
                visited += 1;
            }
        });

        self.stats.record_visits(visited);
    }

    // =========================================================================
    // Allocator Hooks
    // =========================================================================

    /// Clear the membership bit of a reclaimed precise allocation.
    #[inline]
    pub fn clear_precise_cell(&self, index: usize) {
        if index < self.precise_bits.len() {
            self.precise_bits.clear(index);
        }
    }

    /// Drop members of `block` that are not marked (called before the block is
    /// swept).
    pub fn sweep_block(&self, block: &MarkedBlock) {
        if let Some(bits) = self.bits_for(block.index()) {
            bits.filter(block.marks());
        }
    }

    /// Forget every member of a block that the allocator has returned.
    ///
    /// The bitmap itself is kept for whichever block takes this index next.
    pub fn did_remove_block(&self, block_index: usize) {
        if let Some(bits) = self.bits_for(block_index) {
            bits.clear_all();
        }
    }

    /// Remove every member.
    pub fn clear(&self) {
        self.blocks_with_bits.for_each_set_bit(|index| {
            if let Some(bits) = self.bits_for(index) {
                bits.clear_all();
            }
        });
        self.precise_bits.clear_all();
    }

    /// Count member bits that do not name an allocated cell.
    ///
    /// Always zero when the allocator honours the sweep protocol.
    pub fn count_stale_members(&self) -> usize {
        let mut stale = 0;

        self.blocks_with_bits.for_each_set_bit(|index| {
            let Some(bits) = self.bits_for(index) else {
                return;
            };
            match self.subspace.block(index) {
                Some(block) => bits.for_each_set_bit(|atom| {
                    if !block.is_allocated(atom) {
                        stale += 1;
                    }
                }),
                None => stale += bits.count(),
            }
        });

        self.precise_bits.for_each_set_bit(|index| {
            if !self.subspace.precise().contains(index) {
                stale += 1;
            }
        });

        stale
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Number of members.
    ///
    /// Not linearizable with concurrent mutation.
    pub fn len(&self) -> usize {
        let mut count = self.precise_bits.count();
        self.blocks_with_bits.for_each_set_bit(|index| {
            if let Some(bits) = self.bits_for(index) {
                count += bits.count();
            }
        });
        count
    }

    /// True if the set has no members.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of block bitmaps materialized so far.
    pub fn materialized_bitmaps(&self) -> usize {
        self.blocks_with_bits.count()
    }

    /// Diagnostic name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The subspace this set is scoped to.
    pub fn subspace(&self) -> &Arc<Subspace> {
        &self.subspace
    }

    /// Activity counters.
    pub fn stats(&self) -> &CellSetStats {
        &self.stats
    }

    /// Membership bits for precise allocations.
    #[inline]
    pub(crate) fn precise_bits(&self) -> &AtomicBitmap {
        &self.precise_bits
    }
}

impl Drop for CellSet {
    fn drop(&mut self) {
        self.subspace.unregister_cell_set(self.registration);
        for slot in self.block_bits.iter() {
            let ptr = slot.swap(ptr::null_mut(), Ordering::AcqRel);
            if !ptr.is_null() {
                // SAFETY: installed bitmaps are owned by the set and no other
                // reference can outlive `&mut self`.
                drop(unsafe { Box::from_raw(ptr) });
            }
        }
    }
}

impl std::fmt::Debug for CellSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellSet")
            .field("name", &self.name)
            .field("subspace", &self.subspace.name())
            .field("members", &self.len())
            .field("bitmaps", &self.materialized_bitmaps())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GcConfig;

    fn setup() -> (Arc<Subspace>, Arc<CellSet>) {
        let space = Subspace::new("objects", 16, GcConfig::for_testing()).unwrap();
        let set = CellSet::new("finalizable", &space).unwrap();
        (space, set)
    }

    #[test]
    fn test_add_contains_remove() {
        let (space, set) = setup();
        let cell = space.allocate().unwrap();

        assert!(!set.contains(cell));
        assert!(set.add(cell).unwrap());
        assert!(set.contains(cell));
        assert!(!set.add(cell).unwrap());

        assert!(set.remove(cell));
        assert!(!set.remove(cell));
        assert!(!set.contains(cell));
    }

    #[test]
    fn test_precise_membership() {
        let (space, set) = setup();
        let cell = space.allocate_precise(4096).unwrap();

        assert!(!set.contains(cell));
        assert!(set.add(cell).unwrap());
        assert!(set.contains(cell));
        assert!(!set.add(cell).unwrap());
        assert!(set.remove(cell));
        assert!(!set.contains(cell));
    }

    #[test]
    fn test_remove_does_not_materialize() {
        let (space, set) = setup();
        let cell = space.allocate().unwrap();

        assert!(!set.remove(cell));
        assert!(!set.contains(cell));
        assert_eq!(set.materialized_bitmaps(), 0);
    }

    #[test]
    fn test_one_bitmap_per_block() {
        let (space, set) = setup();
        let cells: Vec<HeapCell> = (0..10).map(|_| space.allocate().unwrap()).collect();
        for cell in &cells {
            set.add(*cell).unwrap();
        }
        assert_eq!(set.materialized_bitmaps(), 1);
        assert_eq!(set.stats().snapshot().bitmaps_materialized, 1);
        assert_eq!(set.len(), 10);
    }

    #[test]
    fn test_block_index_beyond_capacity_is_allocation_failure() {
        let (_space, set) = setup();
        let cell = HeapCell::in_block(10_000, 0);
        let err = set.add(cell).unwrap_err();
        assert!(err.is_allocation_failure());
        assert!(!set.contains(cell));
        assert!(!set.remove(cell));
    }

    #[test]
    fn test_foreign_atom_rejected() {
        let (_space, set) = setup();
        let cell = HeapCell::in_block(0, 5000);
        assert_eq!(set.add(cell), Err(GcError::ForeignCell(cell)));
    }

    #[test]
    fn test_marked_iteration_scenario() {
        let (space, set) = setup();
        let a = space.allocate().unwrap();
        let b = space.allocate().unwrap();

        assert!(set.add(a).unwrap());
        assert!(!set.add(a).unwrap());
        assert!(set.add(b).unwrap());
        space.mark(a);

        let mut visited = Vec::new();
        set.for_each_marked_cell(|cell| visited.push(cell));
        assert_eq!(visited, vec![a]);

        assert!(set.remove(a));
        assert!(!set.contains(a));
    }

    #[test]
    fn test_live_iteration_ignores_marks() {
        let (space, set) = setup();
        let a = space.allocate().unwrap();
        let b = space.allocate().unwrap();
        let p = space.allocate_precise(1000).unwrap();
        let _outsider = space.allocate().unwrap();
        for cell in [a, b, p] {
            set.add(cell).unwrap();
        }

        let mut visited = Vec::new();
        set.for_each_live_cell(|cell| visited.push(cell));
        assert_eq!(visited, vec![a, b, p]);
    }

    #[test]
    fn test_sweep_drops_dead_members() {
        let (space, set) = setup();
        let survivor = space.allocate().unwrap();
        let victim = space.allocate().unwrap();
        let big_victim = space.allocate_precise(2000).unwrap();
        for cell in [survivor, victim, big_victim] {
            set.add(cell).unwrap();
        }
        space.mark(survivor);

        space.sweep();
        assert!(set.contains(survivor));
        assert!(!set.contains(victim));
        assert!(!set.contains(big_victim));
        assert_eq!(set.count_stale_members(), 0);

        // The reused slot starts out as a non-member
        let reused = space.allocate().unwrap();
        assert!(!set.contains(reused));
    }

    #[test]
    fn test_did_remove_block_keeps_bitmap() {
        let (space, set) = setup();
        let cell = space.allocate().unwrap();
        set.add(cell).unwrap();

        space.sweep();
        assert_eq!(space.remove_empty_blocks(), 1);
        assert!(!set.contains(cell));
        assert_eq!(set.materialized_bitmaps(), 1);
    }

    #[test]
    fn test_clear() {
        let (space, set) = setup();
        for _ in 0..5 {
            set.add(space.allocate().unwrap()).unwrap();
        }
        set.add(space.allocate_precise(1000).unwrap()).unwrap();
        assert_eq!(set.len(), 6);

        set.clear();
        assert!(set.is_empty());
    }

    #[test]
    fn test_clear_precise_cell() {
        let (space, set) = setup();
        let cell = space.allocate_precise(1000).unwrap();
        set.add(cell).unwrap();

        let CellLocation::Precise(index) = cell.location() else {
            panic!("expected precise cell");
        };
        set.clear_precise_cell(index);
        assert!(!set.contains(cell));
        assert!(!set.precise_bits().get(index));
    }

    #[test]
    fn test_drop_unregisters() {
        let (space, set) = setup();
        assert_eq!(space.cell_set_count(), 1);
        drop(set);
        assert_eq!(space.cell_set_count(), 0);
    }
}
