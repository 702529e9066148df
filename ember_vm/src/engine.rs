//! Execution engine services.
//!
//! The engine owns the code cache, the call link registry and the guards every
//! call passes through:
//!
//! - **Recursion guard**: nested calls are counted per engine; past
//!   `max_recursion_depth` a call fails with `StackOverflow`.
//! - **Entry guard**: while a `DisallowEntryScope` is alive (for example during
//!   a collection) no code may run, and attempts fail with `StackOverflow`.
//! - **Entry scopes**: long-lived users such as cached calls hold an
//!   `EntryScope` for their lifetime.
//!
//! Code replacement services (`tier_up`, `deoptimize`, `replace_code`,
//! `jettison`) install or remove code blocks and notify every cached call
//! linked to the block that went away.

use crate::cached_call::CachedCall;
use crate::call_link::{LinkHandle, LinkRegistry, SharedLinkage};
use crate::code_cache::{CodeBlock, CodeCache, CodeTier};
use crate::config::EngineConfig;
use crate::error::{VmError, VmResult};
use crate::frame::CallFrame;
use crate::function::{ExecutableId, Function, FunctionExecutable, FunctionKind};
use crate::stats::CallLinkStats;
use crate::value::Value;

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// An execution engine.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    code_cache: CodeCache,
    links: LinkRegistry,
    stats: CallLinkStats,
    /// Held from swapping a code block until its links are notified.
    replacement: Mutex<()>,
    /// Calls currently on the stack.
    depth: AtomicUsize,
    /// Live `DisallowEntryScope`s.
    disallow_entry_count: AtomicUsize,
    /// Live `EntryScope`s.
    entry_scopes: AtomicUsize,
}

impl Engine {
    /// Create an engine.
    pub fn new(config: EngineConfig) -> VmResult<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            config,
            code_cache: CodeCache::new(),
            links: LinkRegistry::new(),
            stats: CallLinkStats::new(),
            replacement: Mutex::new(()),
            depth: AtomicUsize::new(0),
            disallow_entry_count: AtomicUsize::new(0),
            entry_scopes: AtomicUsize::new(0),
        }))
    }

    /// Create an engine with default configuration.
    pub fn with_defaults() -> VmResult<Arc<Self>> {
        Self::new(EngineConfig::default())
    }

    // =========================================================================
    // Guards
    // =========================================================================

    /// Calls currently on the stack.
    #[inline]
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    /// True if one more call fits under the recursion limit.
    #[inline]
    pub fn is_safe_to_recurse(&self) -> bool {
        self.depth() < self.config.max_recursion_depth
    }

    /// True unless a `DisallowEntryScope` is alive.
    #[inline]
    pub fn is_entry_allowed(&self) -> bool {
        self.disallow_entry_count.load(Ordering::Acquire) == 0
    }

    /// Refuse to run code until the returned scope is dropped.
    pub fn disallow_entry(&self) -> DisallowEntryScope<'_> {
        self.disallow_entry_count.fetch_add(1, Ordering::AcqRel);
        DisallowEntryScope { engine: self }
    }

    /// Open an entry scope held until the returned guard is dropped.
    pub fn enter(self: &Arc<Self>) -> EntryScope {
        self.entry_scopes.fetch_add(1, Ordering::AcqRel);
        EntryScope {
            engine: Arc::clone(self),
        }
    }

    /// Number of live entry scopes.
    #[inline]
    pub fn entry_scope_count(&self) -> usize {
        self.entry_scopes.load(Ordering::Acquire)
    }

    /// Check both guards before a cached call resolves code.
    pub(crate) fn check_entry(&self) -> VmResult<()> {
        if !self.is_safe_to_recurse() {
            log::warn!("engine: recursion limit {} reached", self.config.max_recursion_depth);
            return Err(VmError::StackOverflow);
        }
        if !self.is_entry_allowed() {
            log::warn!("engine: entry attempted while disallowed");
            return Err(VmError::StackOverflow);
        }
        Ok(())
    }

    /// Account for one call on the stack.
    fn push_frame(&self) -> VmResult<DepthGuard<'_>> {
        if !self.is_entry_allowed() {
            log::warn!("engine: entry attempted while disallowed");
            return Err(VmError::StackOverflow);
        }
        let previous = self.depth.fetch_add(1, Ordering::AcqRel);
        let guard = DepthGuard { engine: self };
        if previous >= self.config.max_recursion_depth {
            log::warn!("engine: recursion limit {} reached", self.config.max_recursion_depth);
            return Err(VmError::StackOverflow);
        }
        Ok(guard)
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// Call `function` without any caching.
    ///
    /// This is the reference behaviour cached calls must match.
    pub fn call_function(&self, function: &Arc<Function>, this: Value, args: &[Value]) -> VmResult<Value> {
        if args.len() > self.config.max_arguments {
            return Err(VmError::allocation(args.len(), self.config.max_arguments));
        }
        let _frame = self.push_frame()?;

        match function.kind() {
            FunctionKind::Host(code) => code(self, &CallFrame::new(function, None, &this, args)),
            FunctionKind::Script(executable) => {
                let block = self.code_cache.get_or_compile(executable);
                block.record_call();
                (block.entry())(self, &CallFrame::new(function, Some(&block), &this, args))
            }
        }
    }

    /// Resolve the code block a cached call to `function` will run.
    pub fn prepare_for_cached_call(&self, function: &Function) -> VmResult<Arc<CodeBlock>> {
        match function.executable() {
            Some(executable) => Ok(self.code_cache.get_or_compile(executable)),
            None => Err(VmError::HostFunction(function.name().to_owned())),
        }
    }

    /// Run a cached call through its linked code block with its buffered
    /// arguments.
    pub fn execute_cached_call(&self, cached: &CachedCall) -> VmResult<Value> {
        let Some(block) = cached.linked_code_block() else {
            return Err(self.reject_stale(cached));
        };
        let _frame = self.push_frame()?;

        self.stats.record_general_path();
        block.record_call();
        let frame = cached.proto_frame().frame(&block, cached.arguments());
        (block.entry())(self, &frame)
    }

    /// Run a cached call with an inline frame over `args`.
    ///
    /// Returns `None` when the fast path does not apply: the frame is too
    /// large, the callee expects more parameters than passed, or the cache is
    /// unlinked. The caller then takes the general path.
    pub fn try_call_with_arguments(
        &self,
        cached: &CachedCall,
        this: &Value,
        args: &[Value],
    ) -> Option<VmResult<Value>> {
        let argument_count_including_this = args.len() + 1;
        if argument_count_including_this > self.config.fast_path_max_arguments {
            return None;
        }
        let block = cached.linked_code_block()?;
        if block.num_parameters() > argument_count_including_this {
            log::trace!(
                "engine: {} expects {} parameters, taking general path",
                cached.function().name(),
                block.num_parameters()
            );
            return None;
        }

        let _frame = match self.push_frame() {
            Ok(frame) => frame,
            Err(err) => return Some(Err(err)),
        };
        self.stats.record_fast_path();
        block.record_call();
        let frame = CallFrame::new(cached.function(), Some(&block), this, args);
        Some((block.entry())(self, &frame))
    }

    #[cold]
    fn reject_stale(&self, cached: &CachedCall) -> VmError {
        self.stats.record_stale_rejection();
        log::error!(
            "engine: cached call to {} invoked while unlinked",
            cached.function().name()
        );
        VmError::StaleLinkage
    }

    // =========================================================================
    // Cached Call Linkage
    // =========================================================================

    /// Resolve and register a new cached call to `function`.
    pub(crate) fn register_cached_call(&self, function: &Function) -> VmResult<(LinkHandle, SharedLinkage)> {
        let block = self.prepare_for_cached_call(function)?;
        let (handle, linkage) = self.links.register(&block);
        if let Err(err) = self.settle_link(function, handle, block) {
            self.links.deregister(handle);
            return Err(err);
        }
        Ok((handle, linkage))
    }

    /// Re-resolve an existing cached call.
    pub(crate) fn relink_cached_call(&self, function: &Function, handle: LinkHandle) -> VmResult<Arc<CodeBlock>> {
        let block = self.prepare_for_cached_call(function)?;
        if !self.links.relink(handle, &block) {
            return Err(VmError::StaleLinkage);
        }
        self.stats.record_relink();
        log::debug!("engine: relinked cached call to {} at {:?}", function.name(), block.id());
        self.settle_link(function, handle, block)
    }

    /// Follow replacements that raced with linking.
    ///
    /// A block replaced between resolution and registration never notifies
    /// the new link, so keep relinking until the linked block is current.
    fn settle_link(&self, function: &Function, handle: LinkHandle, mut block: Arc<CodeBlock>) -> VmResult<Arc<CodeBlock>> {
        while !self.code_cache.is_current(&block) {
            block = self.prepare_for_cached_call(function)?;
            self.links.relink(handle, &block);
        }
        Ok(block)
    }

    // =========================================================================
    // Code Replacement
    // =========================================================================

    /// Install `block` as the current code of its executable.
    ///
    /// Cached calls linked to the replaced block upgrade to `block` when it is
    /// compatible and unlink otherwise.
    pub fn replace_code(&self, block: CodeBlock) -> Arc<CodeBlock> {
        let new = Arc::new(block);
        let _replacing = self.replacement.lock();
        if let Some(old) = self.code_cache.replace(Arc::clone(&new)) {
            let outcome = self
                .links
                .notify_replaced(&old, Some(&new), self.config.upgrade_on_replace);
            self.stats.record_notifications(outcome.upgraded, outcome.unlinked);
            log::debug!(
                "engine: replaced {:?} with {:?} ({:?}); {} upgraded, {} unlinked",
                old.id(),
                new.id(),
                new.tier(),
                outcome.upgraded,
                outcome.unlinked
            );
        }
        new
    }

    /// Recompile `executable` as optimized code.
    pub fn tier_up(&self, executable: &FunctionExecutable) -> Arc<CodeBlock> {
        self.replace_code(CodeBlock::compile(executable, CodeTier::Optimized))
    }

    /// Fall back to baseline code for `executable`.
    pub fn deoptimize(&self, executable: &FunctionExecutable) -> Arc<CodeBlock> {
        self.replace_code(CodeBlock::compile(executable, CodeTier::Baseline))
    }

    /// Throw away the current code of an executable with no replacement.
    ///
    /// Every linked cached call unlinks. The next use recompiles.
    pub fn jettison(&self, executable: ExecutableId) -> Option<Arc<CodeBlock>> {
        let _replacing = self.replacement.lock();
        let old = self.code_cache.remove(executable)?;
        old.mark_jettisoned();
        let outcome = self.links.notify_replaced(&old, None, false);
        self.stats.record_notifications(outcome.upgraded, outcome.unlinked);
        log::debug!("engine: jettisoned {:?}; {} unlinked", old.id(), outcome.unlinked);
        Some(old)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Get the configuration.
    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The code cache.
    #[inline]
    pub fn code_cache(&self) -> &CodeCache {
        &self.code_cache
    }

    /// The call link registry.
    #[inline]
    pub fn links(&self) -> &LinkRegistry {
        &self.links
    }

    /// Cached-call statistics.
    #[inline]
    pub fn stats(&self) -> &CallLinkStats {
        &self.stats
    }
}

// =============================================================================
// Guards
// =============================================================================

/// One call's share of the recursion depth.
struct DepthGuard<'a> {
    engine: &'a Engine,
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.engine.depth.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Forbids running code while alive.
#[derive(Debug)]
pub struct DisallowEntryScope<'a> {
    engine: &'a Engine,
}

impl Drop for DisallowEntryScope<'_> {
    fn drop(&mut self) {
        self.engine.disallow_entry_count.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Keeps the engine entered while alive.
#[derive(Debug)]
pub struct EntryScope {
    engine: Arc<Engine>,
}

impl EntryScope {
    /// The entered engine.
    #[inline]
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }
}

impl Drop for EntryScope {
    fn drop(&mut self) {
        self.engine.entry_scopes.fetch_sub(1, Ordering::AcqRel);
    }
}
