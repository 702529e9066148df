//! Precise allocation space.
//!
//! Cells too large to share a block, or allocated before a subspace commits to
//! blocks, live here as standalone allocations. Each one gets a small integer
//! index in the subspace's lower-tier index space; cell sets keep a flat bitmap
//! over that space.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Metadata for a precise allocation.
struct PreciseAllocation {
    /// Size of the allocation.
    size: usize,
    /// GC mark flag.
    marked: AtomicBool,
}

/// Snapshot of one precise allocation, handed to enumeration callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreciseAllocationInfo {
    /// Lower-tier index of the allocation.
    pub index: usize,
    /// Size in bytes.
    pub size: usize,
    /// Whether the collector has marked it.
    pub marked: bool,
}

/// Index-addressed space of standalone allocations.
pub struct PreciseAllocationSpace {
    /// Slots by lower-tier index; `None` marks a free index.
    slots: Mutex<Vec<Option<PreciseAllocation>>>,
    /// Maximum number of indices.
    capacity: usize,
    /// Total bytes allocated.
    allocated: AtomicUsize,
}

impl PreciseAllocationSpace {
    /// Create a new precise allocation space with room for `capacity` indices.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            capacity,
            allocated: AtomicUsize::new(0),
        }
    }

    /// Allocate a precise cell of `size` bytes, returning its index.
    ///
    /// The lowest free index is reused first. Returns `None` once every index is
    /// taken.
    pub fn alloc(&self, size: usize) -> Option<usize> {
        let mut slots = self.slots.lock();
        let index = match slots.iter().position(Option::is_none) {
            Some(index) => index,
            None if slots.len() < self.capacity => {
                slots.push(None);
                slots.len() - 1
            }
            None => return None,
        };

        slots[index] = Some(PreciseAllocation {
            size,
            marked: AtomicBool::new(false),
        });
        let _ = self
            .allocated
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bytes| Some(bytes.saturating_add(size)));
        Some(index)
    }

    /// Check if `index` names a live allocation.
    pub fn contains(&self, index: usize) -> bool {
        let slots = self.slots.lock();
        matches!(slots.get(index), Some(Some(_)))
    }

    /// Get the size of an allocation.
    pub fn size_of(&self, index: usize) -> Option<usize> {
        let slots = self.slots.lock();
        slots.get(index)?.as_ref().map(|a| a.size)
    }

    /// Mark an allocation as live. Returns true if newly marked.
    pub fn mark(&self, index: usize) -> bool {
        let slots = self.slots.lock();
        match slots.get(index) {
            Some(Some(allocation)) => !allocation.marked.swap(true, Ordering::AcqRel),
            _ => false,
        }
    }

    /// Check whether an allocation is marked.
    pub fn is_marked(&self, index: usize) -> bool {
        let slots = self.slots.lock();
        match slots.get(index) {
            Some(Some(allocation)) => allocation.marked.load(Ordering::Acquire),
            _ => false,
        }
    }

    /// Clear all marks (before GC).
    pub fn clear_marks(&self) {
        let slots = self.slots.lock();
        for allocation in slots.iter().flatten() {
            allocation.marked.store(false, Ordering::Release);
        }
    }

    /// Sweep unmarked allocations.
    ///
    /// `on_free` runs for each dead index while the space is still locked, so
    /// side tables are cleared before the index can be handed out again.
    /// Returns (bytes_freed, objects_freed).
    pub fn sweep<F>(&self, mut on_free: F) -> (usize, usize)
    where
        F: FnMut(usize),
    {
        let mut slots = self.slots.lock();
        let mut bytes_freed: usize = 0;
        let mut objects_freed = 0;

        for (index, slot) in slots.iter_mut().enumerate() {
            let dead = matches!(slot, Some(a) if !a.marked.load(Ordering::Acquire));
            if dead {
                on_free(index);
                if let Some(allocation) = slot.take() {
                    bytes_freed = bytes_freed.saturating_add(allocation.size);
                    objects_freed += 1;
                }
            }
        }

        while matches!(slots.last(), Some(None)) {
            slots.pop();
        }

        let _ = self
            .allocated
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bytes| Some(bytes.saturating_sub(bytes_freed)));
        (bytes_freed, objects_freed)
    }

    /// Get total bytes allocated.
    pub fn usage(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Get number of live precise allocations.
    pub fn count(&self) -> usize {
        self.slots.lock().iter().flatten().count()
    }

    /// Size of the lower-tier index space.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enumerate allocations in ascending index order.
    ///
    /// The callback runs on a snapshot taken under the lock, so it may call back
    /// into the space.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(PreciseAllocationInfo),
    {
        let snapshot: Vec<PreciseAllocationInfo> = {
            let slots = self.slots.lock();
            slots
                .iter()
                .enumerate()
                .filter_map(|(index, slot)| {
                    slot.as_ref().map(|a| PreciseAllocationInfo {
                        index,
                        size: a.size,
                        marked: a.marked.load(Ordering::Acquire),
                    })
                })
                .collect()
        };
        for info in snapshot {
            f(info);
        }
    }
}

impl Default for PreciseAllocationSpace {
    fn default() -> Self {
        Self::new(4096)
    }
}
