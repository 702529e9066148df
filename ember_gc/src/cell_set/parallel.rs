//! Parallel marked-cell iteration.
//!
//! A task wraps a claim-once block source and a once flag for precise
//! members. Every worker that calls `run` drains blocks until the source is
//! empty; whichever worker gets to the precise phase first visits all precise
//! members and the others skip it. A cell is therefore visited exactly once
//! no matter how many workers join.

use super::CellSet;
use crate::heap::{HeapCell, ParallelBlockSource};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A shareable task visiting every marked member of a cell set.
pub struct ParallelMarkedCellTask<F> {
    set: Arc<CellSet>,
    source: ParallelBlockSource,
    precise_claimed: AtomicBool,
    visit: F,
}

impl<F> ParallelMarkedCellTask<F> {
    pub(super) fn new(set: Arc<CellSet>, source: ParallelBlockSource, visit: F) -> Self {
        Self {
            set,
            source,
            precise_claimed: AtomicBool::new(false),
            visit,
        }
    }

    /// Participate in the iteration with a worker-local `visitor`.
    ///
    /// Returns once there is nothing left for this worker to claim. Other
    /// workers may still be visiting cells they claimed earlier.
    pub fn run<V>(&self, visitor: &mut V)
    where
        F: Fn(&mut V, HeapCell),
    {
        let mut visited = 0;

        while let Some(block) = self.source.next_block() {
            let index = block.index();
            let Some(bits) = self.set.bits_for(index) else {
                continue;
            };
            block.for_each_marked_cell(|atom| {
                if bits.get(atom) {
                    (self.visit)(&mut *visitor, HeapCell::in_block(index, atom));
                    visited += 1;
                }
            });
        }

        if !self.precise_claimed.swap(true, Ordering::AcqRel) {
            let precise_bits = self.set.precise_bits();
            self.set.subspace().for_each_precise_allocation(|info| {
                if info.marked && precise_bits.get(info.index) {
                    (self.visit)(&mut *visitor, HeapCell::precise(info.index));
                    visited += 1;
                }
            });
        }

        self.set.stats().record_visits(visited);
        log::trace!(
            "cell set {}: parallel worker visited {} cells",
            self.set.name(),
            visited
        );
    }

    /// Number of blocks the task was built over.
    pub fn block_count(&self) -> usize {
        self.source.len()
    }

    /// The set being iterated.
    pub fn cell_set(&self) -> &Arc<CellSet> {
        &self.set
    }
}

impl<F> std::fmt::Debug for ParallelMarkedCellTask<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelMarkedCellTask")
            .field("set", &self.set.name())
            .field("blocks", &self.source.len())
            .field("precise_claimed", &self.precise_claimed.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::config::GcConfig;
    use crate::heap::{HeapCell, Subspace};
    use crate::CellSet;

    use std::collections::HashSet;

    #[test]
    fn test_single_worker_visits_everything() {
        let space = Subspace::new("objects", 16, GcConfig::for_testing()).unwrap();
        let set = CellSet::new("weak maps", &space).unwrap();

        let a = space.allocate().unwrap();
        let b = space.allocate_precise(1024).unwrap();
        let c = space.allocate().unwrap();
        for cell in [a, b, c] {
            set.add(cell).unwrap();
            space.mark(cell);
        }

        let task = set.for_each_marked_cell_in_parallel(|seen: &mut Vec<HeapCell>, cell: HeapCell| {
            seen.push(cell)
        });
        let mut seen = Vec::new();
        task.run(&mut seen);
        assert_eq!(seen, vec![a, c, b]);

        // A late worker finds nothing left to do
        let mut late = Vec::new();
        task.run(&mut late);
        assert!(late.is_empty());
    }

    #[test]
    fn test_workers_partition_cells() {
        let space = Subspace::new("objects", 16, GcConfig::for_testing()).unwrap();
        let set = CellSet::new("finalizable", &space).unwrap();

        let mut expected = HashSet::new();
        for i in 0..300 {
            let cell = space.allocate().unwrap();
            if i % 3 == 0 {
                set.add(cell).unwrap();
            }
            if i % 2 == 0 {
                space.mark(cell);
                if i % 3 == 0 {
                    expected.insert(cell);
                }
            }
        }
        for _ in 0..4 {
            let cell = space.allocate_precise(700).unwrap();
            set.add(cell).unwrap();
            space.mark(cell);
            expected.insert(cell);
        }

        let per_worker =
            set.visit_marked_cells_parallel(Vec::new, |seen: &mut Vec<HeapCell>, cell| seen.push(cell));
        assert_eq!(per_worker.len(), space.config().marker_threads);

        let mut union = HashSet::new();
        for cells in per_worker {
            for cell in cells {
                assert!(union.insert(cell), "{:?} visited twice", cell);
            }
        }
        assert_eq!(union, expected);
    }
}
