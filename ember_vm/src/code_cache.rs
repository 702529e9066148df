//! Code cache for storing and replacing compiled code blocks.
//!
//! The code cache provides:
//! - O(1) lookup of the current code block by executable
//! - Lazy baseline compilation on first use
//! - Replacement (tier-up, deoptimization) and removal (jettison)
//! - Per-block sets of incoming call links to notify on replacement

use crate::call_link::LinkHandle;
use crate::function::{ExecutableId, FunctionExecutable, NativeCode};

use dashmap::DashMap;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_CODE_BLOCK_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a code block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeBlockId(u64);

impl CodeBlockId {
    /// Raw id value.
    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Compilation tier of a code block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodeTier {
    /// First compilation; also the deoptimization target.
    Baseline,
    /// Speculatively optimized code.
    Optimized,
}

// =============================================================================
// Code Block
// =============================================================================

/// One compiled form of a function executable.
pub struct CodeBlock {
    id: CodeBlockId,
    executable: ExecutableId,
    tier: CodeTier,
    /// Frame slots the code expects, receiver included.
    num_parameters: usize,
    entry: NativeCode,
    jettisoned: AtomicBool,
    call_count: AtomicU64,
    /// Cached calls currently linked to this block.
    incoming: Mutex<FxHashSet<LinkHandle>>,
}

impl CodeBlock {
    /// Compile `executable` at `tier`.
    pub fn compile(executable: &FunctionExecutable, tier: CodeTier) -> Self {
        Self::with_entry(
            executable.id(),
            tier,
            executable.num_parameters(),
            Arc::clone(executable.code()),
        )
    }

    /// A code block running `entry`.
    pub fn with_entry(
        executable: ExecutableId,
        tier: CodeTier,
        num_parameters: usize,
        entry: NativeCode,
    ) -> Self {
        Self {
            id: CodeBlockId(NEXT_CODE_BLOCK_ID.fetch_add(1, Ordering::Relaxed)),
            executable,
            tier,
            num_parameters,
            entry,
            jettisoned: AtomicBool::new(false),
            call_count: AtomicU64::new(0),
            incoming: Mutex::new(FxHashSet::default()),
        }
    }

    /// Unique id.
    #[inline]
    pub fn id(&self) -> CodeBlockId {
        self.id
    }

    /// The executable this block was compiled from.
    #[inline]
    pub fn executable(&self) -> ExecutableId {
        self.executable
    }

    /// Compilation tier.
    #[inline]
    pub fn tier(&self) -> CodeTier {
        self.tier
    }

    /// Frame slots expected, receiver included.
    #[inline]
    pub fn num_parameters(&self) -> usize {
        self.num_parameters
    }

    /// Entry point.
    #[inline]
    pub fn entry(&self) -> &NativeCode {
        &self.entry
    }

    /// True once the block has been thrown away.
    #[inline]
    pub fn is_jettisoned(&self) -> bool {
        self.jettisoned.load(Ordering::Acquire)
    }

    pub(crate) fn mark_jettisoned(&self) {
        self.jettisoned.store(true, Ordering::Release);
    }

    /// Increment call count and return the new value.
    #[inline]
    pub fn record_call(&self) -> u64 {
        self.call_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Number of calls that ran this block.
    #[inline]
    pub fn call_count(&self) -> u64 {
        self.call_count.load(Ordering::Relaxed)
    }

    // =========================================================================
    // Incoming Links
    // =========================================================================

    /// Register an incoming cached call. Returns false if already linked.
    pub fn link_incoming(&self, handle: LinkHandle) -> bool {
        self.incoming.lock().insert(handle)
    }

    /// Remove an incoming cached call if it is still linked here.
    pub fn unlink_incoming(&self, handle: LinkHandle) -> bool {
        self.incoming.lock().remove(&handle)
    }

    /// Check whether a cached call is linked here.
    pub fn has_incoming(&self, handle: LinkHandle) -> bool {
        self.incoming.lock().contains(&handle)
    }

    /// Number of linked cached calls.
    pub fn incoming_count(&self) -> usize {
        self.incoming.lock().len()
    }

    /// Detach every incoming link, for notification.
    pub(crate) fn take_incoming(&self) -> Vec<LinkHandle> {
        let mut incoming = self.incoming.lock();
        let mut handles: Vec<LinkHandle> = incoming.drain().collect();
        handles.sort_unstable();
        handles
    }
}

impl fmt::Debug for CodeBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeBlock")
            .field("id", &self.id)
            .field("executable", &self.executable)
            .field("tier", &self.tier)
            .field("num_parameters", &self.num_parameters)
            .field("jettisoned", &self.is_jettisoned())
            .finish()
    }
}

// =============================================================================
// Code Cache
// =============================================================================

/// Current code block of every compiled executable.
///
/// Thread-safe via sharded locking.
#[derive(Debug, Default)]
pub struct CodeCache {
    /// Map from executable to its current code block.
    blocks: DashMap<ExecutableId, Arc<CodeBlock>>,
    /// Lookup hit counter.
    hits: AtomicU64,
    /// Lookup miss counter.
    misses: AtomicU64,
    /// Compilation counter.
    insertions: AtomicU64,
    /// Replacement counter.
    replacements: AtomicU64,
    /// Removal counter.
    removals: AtomicU64,
}

impl CodeCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the current code block of an executable.
    #[inline]
    pub fn lookup(&self, executable: ExecutableId) -> Option<Arc<CodeBlock>> {
        let result = self.blocks.get(&executable).map(|entry| Arc::clone(entry.value()));
        if result.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Current code block, compiling a baseline block on a miss.
    pub fn get_or_compile(&self, executable: &FunctionExecutable) -> Arc<CodeBlock> {
        if let Some(block) = self.lookup(executable.id()) {
            return block;
        }

        let entry = self.blocks.entry(executable.id()).or_insert_with(|| {
            self.insertions.fetch_add(1, Ordering::Relaxed);
            log::debug!("code cache: compiled baseline code for {}", executable.name());
            Arc::new(CodeBlock::compile(executable, CodeTier::Baseline))
        });
        Arc::clone(entry.value())
    }

    /// Check whether `block` is still the current code of its executable.
    ///
    /// Does not count as a lookup.
    pub fn is_current(&self, block: &CodeBlock) -> bool {
        self.blocks
            .get(&block.executable())
            .is_some_and(|entry| entry.value().id() == block.id())
    }

    /// Install `block` as the current code of its executable.
    ///
    /// Returns the block it replaced, if any. Callers notify the replaced
    /// block's incoming links.
    pub fn replace(&self, block: Arc<CodeBlock>) -> Option<Arc<CodeBlock>> {
        let old = self.blocks.insert(block.executable(), block);
        if old.is_some() {
            self.replacements.fetch_add(1, Ordering::Relaxed);
        } else {
            self.insertions.fetch_add(1, Ordering::Relaxed);
        }
        old
    }

    /// Remove the current code of an executable.
    pub fn remove(&self, executable: ExecutableId) -> Option<Arc<CodeBlock>> {
        let removed = self.blocks.remove(&executable).map(|(_, block)| block);
        if removed.is_some() {
            self.removals.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Get the number of entries in the cache.
    #[inline]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Check if the cache is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Get cache statistics.
    pub fn stats(&self) -> CodeCacheStats {
        CodeCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            insertions: self.insertions.load(Ordering::Relaxed),
            replacements: self.replacements.load(Ordering::Relaxed),
            removals: self.removals.load(Ordering::Relaxed),
        }
    }

    /// Snapshot of all current code blocks (for debugging/profiling).
    pub fn entries(&self) -> Vec<Arc<CodeBlock>> {
        self.blocks.iter().map(|entry| Arc::clone(entry.value())).collect()
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Statistics for the code cache.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CodeCacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of first-time installs.
    pub insertions: u64,
    /// Number of replacements.
    pub replacements: u64,
    /// Number of removals.
    pub removals: u64,
}

impl CodeCacheStats {
    /// Calculate hit rate.
    #[inline]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn executable(params: usize) -> Arc<FunctionExecutable> {
        FunctionExecutable::new("f", params, |_, _| Ok(Value::Undefined))
    }

    #[test]
    fn test_compile_baseline() {
        let exe = executable(2);
        let block = CodeBlock::compile(&exe, CodeTier::Baseline);
        assert_eq!(block.executable(), exe.id());
        assert_eq!(block.num_parameters(), 3);
        assert_eq!(block.tier(), CodeTier::Baseline);
        assert!(!block.is_jettisoned());
    }

    #[test]
    fn test_get_or_compile_caches() {
        let cache = CodeCache::new();
        let exe = executable(0);

        let first = cache.get_or_compile(&exe);
        let second = cache.get_or_compile(&exe);
        assert!(Arc::ptr_eq(&first, &second));

        let stats = cache.stats();
        assert_eq!(stats.insertions, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 0.5).abs() < 0.001);
    }

    #[test]
    fn test_replace_and_remove() {
        let cache = CodeCache::new();
        let exe = executable(1);
        let baseline = cache.get_or_compile(&exe);

        let optimized = Arc::new(CodeBlock::compile(&exe, CodeTier::Optimized));
        let old = cache.replace(Arc::clone(&optimized)).unwrap();
        assert!(Arc::ptr_eq(&old, &baseline));
        assert!(Arc::ptr_eq(&cache.lookup(exe.id()).unwrap(), &optimized));

        assert!(cache.remove(exe.id()).is_some());
        assert!(cache.lookup(exe.id()).is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.stats().replacements, 1);
        assert_eq!(cache.stats().removals, 1);
    }

    #[test]
    fn test_incoming_links() {
        let exe = executable(0);
        let block = CodeBlock::compile(&exe, CodeTier::Baseline);
        let a = LinkHandle::new(0, 0);
        let b = LinkHandle::new(1, 0);

        assert!(block.link_incoming(a));
        assert!(!block.link_incoming(a));
        assert!(block.link_incoming(b));
        assert_eq!(block.incoming_count(), 2);

        assert!(block.unlink_incoming(a));
        assert!(!block.unlink_incoming(a));

        assert_eq!(block.take_incoming(), vec![b]);
        assert_eq!(block.incoming_count(), 0);
    }

    #[test]
    fn test_call_count() {
        let block = CodeBlock::compile(&executable(0), CodeTier::Baseline);
        assert_eq!(block.record_call(), 1);
        assert_eq!(block.record_call(), 2);
        assert_eq!(block.call_count(), 2);
    }
}
