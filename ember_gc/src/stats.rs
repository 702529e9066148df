//! Cell-set statistics.
//!
//! Counters are updated with relaxed atomics on the hot paths and read as a
//! point-in-time snapshot for monitoring and tests.

use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics about one cell set's activity.
#[derive(Debug)]
pub struct CellSetStats {
    // =========================================================================
    // Membership
    // =========================================================================
    /// Successful insertions (bit went from clear to set).
    pub insertions: AtomicU64,
    /// Successful removals (bit went from set to clear).
    pub removals: AtomicU64,

    // =========================================================================
    // Structure
    // =========================================================================
    /// Block bitmaps installed.
    pub bitmaps_materialized: AtomicU64,
    /// Candidate bitmaps discarded after losing an install race.
    pub materialization_races_lost: AtomicU64,

    // =========================================================================
    // Iteration
    // =========================================================================
    /// Cells handed to iteration callbacks.
    pub cells_visited: AtomicU64,
    /// Parallel tasks created.
    pub parallel_tasks: AtomicU64,
}

impl CellSetStats {
    /// Create new empty statistics.
    pub const fn new() -> Self {
        Self {
            insertions: AtomicU64::new(0),
            removals: AtomicU64::new(0),
            bitmaps_materialized: AtomicU64::new(0),
            materialization_races_lost: AtomicU64::new(0),
            cells_visited: AtomicU64::new(0),
            parallel_tasks: AtomicU64::new(0),
        }
    }

    /// Record an insertion.
    #[inline]
    pub fn record_insertion(&self) {
        self.insertions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a removal.
    #[inline]
    pub fn record_removal(&self) {
        self.removals.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a bitmap install.
    #[inline]
    pub fn record_materialized(&self) {
        self.bitmaps_materialized.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a lost install race.
    #[inline]
    pub fn record_race_lost(&self) {
        self.materialization_races_lost
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record visited cells.
    #[inline]
    pub fn record_visits(&self, count: usize) {
        self.cells_visited
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Record a parallel task.
    #[inline]
    pub fn record_parallel_task(&self) {
        self.parallel_tasks.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a point-in-time snapshot.
    pub fn snapshot(&self) -> CellSetStatsSnapshot {
        CellSetStatsSnapshot {
            insertions: self.insertions.load(Ordering::Relaxed),
            removals: self.removals.load(Ordering::Relaxed),
            bitmaps_materialized: self.bitmaps_materialized.load(Ordering::Relaxed),
            materialization_races_lost: self.materialization_races_lost.load(Ordering::Relaxed),
            cells_visited: self.cells_visited.load(Ordering::Relaxed),
            parallel_tasks: self.parallel_tasks.load(Ordering::Relaxed),
        }
    }

    /// Reset all statistics.
    pub fn reset(&self) {
        self.insertions.store(0, Ordering::Relaxed);
        self.removals.store(0, Ordering::Relaxed);
        self.bitmaps_materialized.store(0, Ordering::Relaxed);
        self.materialization_races_lost.store(0, Ordering::Relaxed);
        self.cells_visited.store(0, Ordering::Relaxed);
        self.parallel_tasks.store(0, Ordering::Relaxed);
    }
}

impl Default for CellSetStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Plain-value copy of `CellSetStats`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CellSetStatsSnapshot {
    /// Successful insertions.
    pub insertions: u64,
    /// Successful removals.
    pub removals: u64,
    /// Block bitmaps installed.
    pub bitmaps_materialized: u64,
    /// Lost install races.
    pub materialization_races_lost: u64,
    /// Cells handed to iteration callbacks.
    pub cells_visited: u64,
    /// Parallel tasks created.
    pub parallel_tasks: u64,
}

impl CellSetStatsSnapshot {
    /// Net membership change since the counters were reset.
    #[inline]
    pub fn net_members(&self) -> i64 {
        self.insertions as i64 - self.removals as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_recording() {
        let stats = CellSetStats::new();

        stats.record_insertion();
        stats.record_insertion();
        stats.record_removal();
        stats.record_visits(5);

        let snap = stats.snapshot();
        assert_eq!(snap.insertions, 2);
        assert_eq!(snap.removals, 1);
        assert_eq!(snap.cells_visited, 5);
        assert_eq!(snap.net_members(), 1);
    }

    #[test]
    fn test_stats_reset() {
        let stats = CellSetStats::new();
        stats.record_materialized();
        stats.record_race_lost();
        stats.record_parallel_task();
        stats.reset();
        assert_eq!(stats.snapshot(), CellSetStatsSnapshot::default());
    }
}
