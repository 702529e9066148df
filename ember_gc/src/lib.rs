//! Ember heap cell sets.
//!
//! Concurrent membership sets over the cells of one heap subspace, designed to
//! cooperate with a marking garbage collector.
//!
//! # Architecture
//!
//! - **Subspace**: a heap partition of same-sized cells. Small cells live in
//!   marked blocks, large ones in a precise allocation space with its own
//!   small index space.
//!
//! - **CellSet**: one membership bit per cell. Block bitmaps are materialized
//!   lazily and installed with a single compare-and-swap; precise members use
//!   one flat bitmap.
//!
//! - **Iteration**: "member and marked" is computed at iteration time, either
//!   sequentially or as a task any number of marker threads can share.
//!
//! # Usage
//!
//! ```
//! use ember_gc::{CellSet, GcConfig, Subspace};
//!
//! let space = Subspace::new("objects", 32, GcConfig::small()).unwrap();
//! let finalizable = CellSet::new("finalizable", &space).unwrap();
//!
//! let cell = space.allocate().unwrap();
//! assert!(finalizable.add(cell).unwrap());
//! space.mark(cell);
//!
//! let mut marked = Vec::new();
//! finalizable.for_each_marked_cell(|c| marked.push(c));
//! assert_eq!(marked, vec![cell]);
//! ```
//!
//! # Sweeping
//!
//! Cells are reclaimed by `Subspace::sweep`, which tells every registered set
//! to drop its dead members before any freed slot can be reused.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cell_set;
pub mod config;
pub mod error;
pub mod heap;

mod stats;

// Re-exports for convenient access
pub use cell_set::{CellSet, ParallelMarkedCellTask};
pub use config::{ConfigError, GcConfig};
pub use error::{GcError, GcResult};
pub use heap::{CellLocation, HeapCell, Subspace, SweepResult};
pub use stats::{CellSetStats, CellSetStatsSnapshot};
