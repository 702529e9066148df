//! Heap memory management.
//!
//! A subspace owns two kinds of storage:
//! - Blocks: fixed-size regions subdivided into atoms, holding same-sized cells
//! - Precise allocations: standalone cells with their own lower-tier index space
//!
//! Cells are named by `HeapCell` handles whose location is a pure function of
//! the handle, so cell sets can index their bitmaps without asking the
//! allocator.

mod bitmap;
mod block;
mod precise;
mod subspace;

pub use bitmap::{AtomicBitmap, BITS_PER_WORD};
pub use block::MarkedBlock;
pub use precise::{PreciseAllocationInfo, PreciseAllocationSpace};
pub use subspace::{ParallelBlockSource, Subspace, SweepResult};

/// Tag bit distinguishing precise handles from block handles.
const PRECISE_TAG: u64 = 1 << 63;

/// Largest block index, atom number or precise index a `HeapCell` can name.
pub const MAX_CELL_INDEX: usize = u32::MAX as usize;

/// Where a cell lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CellLocation {
    /// Inside a block, starting at `atom_number`.
    Block {
        /// Index of the block in its subspace's directory.
        block_index: usize,
        /// Atom the cell starts at.
        atom_number: usize,
    },
    /// A standalone allocation in the lower-tier precise index space.
    Precise(usize),
}

/// Handle to one garbage-collected cell.
///
/// Handles are minted by the allocator and stay valid until the cell is swept.
/// The mapping to a `CellLocation` never changes for the life of the cell.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapCell(u64);

impl HeapCell {
    /// Handle for the cell starting at `atom_number` of block `block_index`.
    #[inline]
    pub const fn in_block(block_index: usize, atom_number: usize) -> Self {
        debug_assert!(block_index <= MAX_CELL_INDEX && atom_number <= MAX_CELL_INDEX);
        HeapCell(((block_index as u64) << 32) | atom_number as u64)
    }

    /// Handle for the precise allocation at lower-tier index `index`.
    #[inline]
    pub const fn precise(index: usize) -> Self {
        debug_assert!(index <= MAX_CELL_INDEX);
        HeapCell(PRECISE_TAG | index as u64)
    }

    /// Handle for a location.
    #[inline]
    pub const fn from_location(location: CellLocation) -> Self {
        match location {
            CellLocation::Block {
                block_index,
                atom_number,
            } => Self::in_block(block_index, atom_number),
            CellLocation::Precise(index) => Self::precise(index),
        }
    }

    /// Resolve the handle to its location.
    #[inline]
    pub const fn location(self) -> CellLocation {
        if self.0 & PRECISE_TAG != 0 {
            CellLocation::Precise((self.0 & u32::MAX as u64) as usize)
        } else {
            CellLocation::Block {
                block_index: (self.0 >> 32) as usize,
                atom_number: (self.0 & u32::MAX as u64) as usize,
            }
        }
    }

    /// True for precise allocations.
    #[inline]
    pub const fn is_precise(self) -> bool {
        self.0 & PRECISE_TAG != 0
    }

    /// Raw encoded bits.
    #[inline]
    pub const fn to_bits(self) -> u64 {
        self.0
    }
}

impl std::fmt::Debug for HeapCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.location() {
            CellLocation::Block {
                block_index,
                atom_number,
            } => write!(f, "HeapCell(block {}, atom {})", block_index, atom_number),
            CellLocation::Precise(index) => write!(f, "HeapCell(precise {})", index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_cell_location() {
        let cell = HeapCell::in_block(3, 40);
        assert!(!cell.is_precise());
        assert_eq!(
            cell.location(),
            CellLocation::Block {
                block_index: 3,
                atom_number: 40
            }
        );
    }

    #[test]
    fn test_precise_cell_location() {
        let cell = HeapCell::precise(9);
        assert!(cell.is_precise());
        assert_eq!(cell.location(), CellLocation::Precise(9));
    }

    #[test]
    fn test_location_round_trip_is_stable() {
        let location = CellLocation::Block {
            block_index: 0,
            atom_number: 0,
        };
        let cell = HeapCell::from_location(location);
        assert_eq!(cell.location(), location);
        assert_ne!(cell, HeapCell::precise(0));
    }

    #[test]
    fn test_debug_format() {
        assert_eq!(
            format!("{:?}", HeapCell::in_block(1, 2)),
            "HeapCell(block 1, atom 2)"
        );
        assert_eq!(format!("{:?}", HeapCell::precise(5)), "HeapCell(precise 5)");
    }
}
