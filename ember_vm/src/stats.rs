//! Call linkage statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for cached-call activity on one engine.
#[derive(Debug, Default)]
pub struct CallLinkStats {
    calls: AtomicU64,
    fast_path_calls: AtomicU64,
    general_path_calls: AtomicU64,
    relinks: AtomicU64,
    upgrades: AtomicU64,
    unlinks: AtomicU64,
    stale_rejections: AtomicU64,
    overflows: AtomicU64,
}

impl CallLinkStats {
    /// Create zeroed counters.
    pub const fn new() -> Self {
        Self {
            calls: AtomicU64::new(0),
            fast_path_calls: AtomicU64::new(0),
            general_path_calls: AtomicU64::new(0),
            relinks: AtomicU64::new(0),
            upgrades: AtomicU64::new(0),
            unlinks: AtomicU64::new(0),
            stale_rejections: AtomicU64::new(0),
            overflows: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn record_fast_path(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.fast_path_calls.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_general_path(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.general_path_calls.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_relink(&self) {
        self.relinks.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_notifications(&self, upgraded: usize, unlinked: usize) {
        self.upgrades.fetch_add(upgraded as u64, Ordering::Relaxed);
        self.unlinks.fetch_add(unlinked as u64, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_stale_rejection(&self) {
        self.stale_rejections.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_overflow(&self) {
        self.overflows.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a point-in-time snapshot.
    pub fn snapshot(&self) -> CallLinkStatsSnapshot {
        CallLinkStatsSnapshot {
            calls: self.calls.load(Ordering::Relaxed),
            fast_path_calls: self.fast_path_calls.load(Ordering::Relaxed),
            general_path_calls: self.general_path_calls.load(Ordering::Relaxed),
            relinks: self.relinks.load(Ordering::Relaxed),
            upgrades: self.upgrades.load(Ordering::Relaxed),
            unlinks: self.unlinks.load(Ordering::Relaxed),
            stale_rejections: self.stale_rejections.load(Ordering::Relaxed),
            overflows: self.overflows.load(Ordering::Relaxed),
        }
    }
}

/// Statistics for cached calls (for profiling and tuning).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CallLinkStatsSnapshot {
    /// Calls dispatched through a cached call.
    pub calls: u64,
    /// Calls that used an inline frame.
    pub fast_path_calls: u64,
    /// Calls that went through the argument buffer.
    pub general_path_calls: u64,
    /// Explicit relinks.
    pub relinks: u64,
    /// Caches moved onto a replacement code block.
    pub upgrades: u64,
    /// Caches invalidated by a replacement or reclamation.
    pub unlinks: u64,
    /// Calls rejected because the cache was unlinked.
    pub stale_rejections: u64,
    /// Calls rejected because the argument buffer overflowed.
    pub overflows: u64,
}

impl CallLinkStatsSnapshot {
    /// Fraction of calls that took the fast path (0.0 to 1.0).
    #[inline]
    pub fn fast_path_rate(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.fast_path_calls as f64 / self.calls as f64
        }
    }

    /// Fraction of invalidations that were upgrades (0.0 to 1.0).
    #[inline]
    pub fn upgrade_rate(&self) -> f64 {
        let invalidations = self.upgrades + self.unlinks;
        if invalidations == 0 {
            0.0
        } else {
            self.upgrades as f64 / invalidations as f64
        }
    }
}
