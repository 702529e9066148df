//! Marked blocks.
//!
//! A block is the unit of bulk GC bookkeeping: a fixed run of atoms carved into
//! equally sized cells. Each block keeps two per-atom bitmaps, one for cells
//! currently allocated and one for cells the collector has marked. Only the atom
//! a cell starts at ever has bits set.

use super::bitmap::AtomicBitmap;

use std::sync::atomic::{AtomicUsize, Ordering};

/// A block of same-sized cells with allocation and mark bits.
pub struct MarkedBlock {
    /// Index of this block in its subspace's directory.
    index: usize,
    /// Number of atoms in the block.
    atoms: usize,
    /// Atoms occupied by one cell.
    cell_atoms: usize,
    /// One bit per atom; set at the first atom of every allocated cell.
    allocated: AtomicBitmap,
    /// One bit per atom; set at the first atom of every marked cell.
    marks: AtomicBitmap,
    /// Next cell slot to try when allocating.
    cursor: AtomicUsize,
}

impl MarkedBlock {
    /// Create an empty block.
    pub fn new(index: usize, atoms: usize, cell_atoms: usize) -> Self {
        assert!(cell_atoms > 0 && cell_atoms <= atoms, "cell must fit in block");
        Self {
            index,
            atoms,
            cell_atoms,
            allocated: AtomicBitmap::new(atoms),
            marks: AtomicBitmap::new(atoms),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Index of this block in its subspace.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Number of atoms in the block.
    #[inline]
    pub fn atoms(&self) -> usize {
        self.atoms
    }

    /// Number of cell slots in the block.
    #[inline]
    pub fn cell_capacity(&self) -> usize {
        self.atoms / self.cell_atoms
    }

    /// Check whether `atom` is the first atom of a cell slot.
    #[inline]
    pub fn is_cell_start(&self, atom: usize) -> bool {
        atom % self.cell_atoms == 0 && atom / self.cell_atoms < self.cell_capacity()
    }

    /// Allocate one cell, returning its first atom.
    ///
    /// Lock-free: slots are claimed by setting their allocation bit, so
    /// concurrent allocators never hand out the same slot.
    pub fn allocate(&self) -> Option<usize> {
        let capacity = self.cell_capacity();
        let start = self.cursor.load(Ordering::Relaxed).min(capacity);

        for slot in (start..capacity).chain(0..start) {
            let atom = slot * self.cell_atoms;
            if !self.allocated.test_and_set(atom) {
                self.cursor.store(slot + 1, Ordering::Relaxed);
                return Some(atom);
            }
        }
        None
    }

    /// Check if the cell at `atom` is allocated.
    #[inline]
    pub fn is_allocated(&self, atom: usize) -> bool {
        atom < self.atoms && self.allocated.get(atom)
    }

    /// Check if the cell at `atom` is live.
    ///
    /// Between collections every allocated cell is live; the sweep is what
    /// turns unmarked cells back into free slots.
    #[inline]
    pub fn is_live(&self, atom: usize) -> bool {
        self.is_allocated(atom)
    }

    /// Mark the cell at `atom`. Returns true if it was newly marked.
    #[inline]
    pub fn mark(&self, atom: usize) -> bool {
        if !self.is_allocated(atom) {
            return false;
        }
        !self.marks.test_and_set(atom)
    }

    /// Check if the cell at `atom` is marked.
    #[inline]
    pub fn is_marked(&self, atom: usize) -> bool {
        atom < self.atoms && self.marks.get(atom)
    }

    /// True if any cell in this block is marked.
    ///
    /// This is the summary iteration uses to skip blocks with nothing to visit.
    #[inline]
    pub fn has_marked_cells(&self) -> bool {
        !self.marks.is_clear()
    }

    /// True if no cell is allocated.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.allocated.is_clear()
    }

    /// Number of allocated cells.
    #[inline]
    pub fn allocated_count(&self) -> usize {
        self.allocated.count()
    }

    /// The mark bitmap.
    #[inline]
    pub fn marks(&self) -> &AtomicBitmap {
        &self.marks
    }

    /// Clear all marks (before a marking cycle).
    pub fn clear_marks(&self) {
        self.marks.clear_all();
    }

    /// Visit the first atom of every marked cell, in ascending order.
    pub fn for_each_marked_cell<F>(&self, f: F)
    where
        F: FnMut(usize),
    {
        self.marks.for_each_set_bit(f);
    }

    /// Visit the first atom of every live cell, in ascending order.
    pub fn for_each_live_cell<F>(&self, f: F)
    where
        F: FnMut(usize),
    {
        self.allocated.for_each_set_bit(f);
    }

    /// Free every allocated cell that is not marked.
    ///
    /// Returns the number of cells freed. Callers that keep per-cell side tables
    /// must drop their entries for the dead cells before calling this, since the
    /// freed slots are immediately reusable.
    pub fn sweep(&self) -> usize {
        let mut freed = 0;
        self.allocated.for_each_set_bit(|atom| {
            if !self.marks.get(atom) && self.allocated.test_and_clear(atom) {
                freed += 1;
            }
        });
        self.cursor.store(0, Ordering::Relaxed);
        freed
    }
}

impl std::fmt::Debug for MarkedBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkedBlock")
            .field("index", &self.index)
            .field("cells", &self.allocated_count())
            .field("capacity", &self.cell_capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_creation() {
        let block = MarkedBlock::new(0, 64, 2);
        assert_eq!(block.cell_capacity(), 32);
        assert!(block.is_empty());
        assert!(!block.has_marked_cells());
    }

    #[test]
    fn test_block_allocation() {
        let block = MarkedBlock::new(0, 64, 2);

        let a = block.allocate().expect("First alloc failed");
        let b = block.allocate().expect("Second alloc failed");
        assert_ne!(a, b);
        assert!(block.is_cell_start(a));
        assert!(block.is_cell_start(b));
        assert!(block.is_allocated(a));
        assert_eq!(block.allocated_count(), 2);
    }

    #[test]
    fn test_block_full() {
        let block = MarkedBlock::new(0, 8, 4);
        assert!(block.allocate().is_some());
        assert!(block.allocate().is_some());
        assert!(block.allocate().is_none());
    }

    #[test]
    fn test_mark_only_allocated_cells() {
        let block = MarkedBlock::new(0, 16, 1);
        let atom = block.allocate().unwrap();

        assert!(block.mark(atom));
        assert!(!block.mark(atom));
        assert!(block.is_marked(atom));
        assert!(!block.mark(atom + 1));
        assert!(block.has_marked_cells());
    }

    #[test]
    fn test_sweep_frees_unmarked() {
        let block = MarkedBlock::new(0, 16, 1);
        let keep = block.allocate().unwrap();
        let drop1 = block.allocate().unwrap();
        let drop2 = block.allocate().unwrap();
        block.mark(keep);

        assert_eq!(block.sweep(), 2);
        assert!(block.is_live(keep));
        assert!(!block.is_live(drop1));
        assert!(!block.is_live(drop2));

        // Freed slots are reused
        let again = block.allocate().unwrap();
        assert!(again == drop1 || again == drop2);
    }

    #[test]
    fn test_iteration_order() {
        let block = MarkedBlock::new(0, 32, 1);
        let cells: Vec<usize> = (0..6).map(|_| block.allocate().unwrap()).collect();
        block.mark(cells[4]);
        block.mark(cells[1]);

        let mut marked = Vec::new();
        block.for_each_marked_cell(|atom| marked.push(atom));
        assert_eq!(marked, vec![cells[1], cells[4]]);

        let mut live = Vec::new();
        block.for_each_live_cell(|atom| live.push(atom));
        assert_eq!(live, cells);
    }

    #[test]
    fn test_concurrent_allocation_unique() {
        use std::collections::HashSet;
        use std::sync::Arc;
        use std::thread;

        let block = Arc::new(MarkedBlock::new(0, 256, 1));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let block = Arc::clone(&block);
                thread::spawn(move || (0..64).filter_map(|_| block.allocate()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for atom in handle.join().unwrap() {
                assert!(seen.insert(atom), "atom {} handed out twice", atom);
            }
        }
        assert_eq!(seen.len(), 256);
        assert!(block.allocate().is_none());
    }
}
