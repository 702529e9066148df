//! Cached calls.
//!
//! A `CachedCall` resolves a function's code once and then invokes it many
//! times with a reusable frame, e.g. for the comparator of a sort or the
//! callback of a string replace.
//!
//! ```ignore
//! let mut call = CachedCall::new(&engine, &compare, 2)?;
//! for (a, b) in pairs {
//!     let ordering = call.call_with_arguments(Value::Undefined, &[a, b])?;
//!     // ...
//! }
//! ```
//!
//! # Invalidation
//!
//! The cache is registered with the engine's link registry against the code
//! block it resolved. When that block is replaced the cache either follows a
//! compatible replacement or becomes unlinked. An unlinked cache refuses to
//! call with `StaleLinkage` until `relink` succeeds; it never runs the code
//! that was replaced.

use crate::call_link::{LinkHandle, SharedLinkage};
use crate::code_cache::CodeBlock;
use crate::engine::{Engine, EntryScope};
use crate::error::{VmError, VmResult};
use crate::frame::ProtoCallFrame;
use crate::function::{Function, FunctionExecutable, Scope};
use crate::value::Value;

use smallvec::SmallVec;
use std::sync::Arc;

/// Arguments stored without a heap allocation.
pub const INLINE_ARGUMENTS: usize = 8;

// =============================================================================
// Argument Buffer
// =============================================================================

/// Argument storage with a capacity committed up front.
///
/// Appending past the committed capacity records an overflow instead of
/// growing.
#[derive(Debug, Clone)]
pub struct ArgumentBuffer {
    values: SmallVec<[Value; INLINE_ARGUMENTS]>,
    capacity: usize,
    overflowed: bool,
}

impl ArgumentBuffer {
    /// Commit room for `capacity` arguments, at most `limit`.
    pub fn with_capacity(capacity: usize, limit: usize) -> VmResult<Self> {
        if capacity > limit || capacity.checked_add(1).is_none() {
            return Err(VmError::allocation(capacity, limit));
        }
        let mut values = SmallVec::new();
        values
            .try_reserve_exact(capacity)
            .map_err(|_| VmError::allocation(capacity, limit))?;
        Ok(Self {
            values,
            capacity,
            overflowed: false,
        })
    }

    /// Append an argument, or record an overflow when full.
    #[inline]
    pub fn append(&mut self, value: Value) {
        if self.values.len() >= self.capacity {
            self.overflowed = true;
            return;
        }
        self.values.push(value);
    }

    /// Drop every argument and any overflow.
    #[inline]
    pub fn clear(&mut self) {
        self.values.clear();
        self.overflowed = false;
    }

    /// True if an append was refused since the last clear.
    #[inline]
    pub fn has_overflowed(&self) -> bool {
        self.overflowed
    }

    /// The buffered arguments.
    #[inline]
    pub fn as_slice(&self) -> &[Value] {
        &self.values
    }

    /// Number of buffered arguments.
    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if no argument is buffered.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Committed capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// True while arguments live inline.
    #[inline]
    pub fn is_inline(&self) -> bool {
        !self.values.spilled()
    }
}

// =============================================================================
// Cached Call
// =============================================================================

/// Reusable invocation state for one script function.
pub struct CachedCall {
    entry_scope: EntryScope,
    function: Arc<Function>,
    executable: Arc<FunctionExecutable>,
    proto_frame: ProtoCallFrame,
    arguments: ArgumentBuffer,
    linkage: SharedLinkage,
    handle: LinkHandle,
}

impl CachedCall {
    /// Prepare repeated calls to `function` with `argument_count` arguments.
    ///
    /// Fails with `HostFunction` for host functions, `StackOverflow` when the
    /// engine may not be entered, and `AllocationFailure` when the argument
    /// buffer cannot be committed.
    pub fn new(engine: &Arc<Engine>, function: &Arc<Function>, argument_count: usize) -> VmResult<Self> {
        let Some(executable) = function.executable() else {
            return Err(VmError::HostFunction(function.name().to_owned()));
        };
        engine.check_entry()?;

        let limit = engine.config().max_arguments;
        let arguments = ArgumentBuffer::with_capacity(argument_count, limit).map_err(|err| {
            log::warn!(
                "cached call to {}: cannot commit {} arguments (limit {})",
                function.name(),
                argument_count,
                limit
            );
            err
        })?;

        let entry_scope = engine.enter();
        let (handle, linkage) = engine.register_cached_call(function)?;
        log::debug!("cached call to {} linked as {:?}", function.name(), handle);

        Ok(Self {
            entry_scope,
            function: Arc::clone(function),
            executable: Arc::clone(executable),
            proto_frame: ProtoCallFrame::new(Arc::clone(function), argument_count),
            arguments,
            linkage,
            handle,
        })
    }

    // =========================================================================
    // Frame
    // =========================================================================

    /// Set the receiver for the next call.
    #[inline]
    pub fn set_this(&mut self, this: Value) {
        self.proto_frame.set_this(this);
    }

    /// Append an argument for the next call.
    #[inline]
    pub fn append_argument(&mut self, value: Value) {
        self.arguments.append(value);
    }

    /// Drop the buffered arguments.
    #[inline]
    pub fn clear_arguments(&mut self) {
        self.arguments.clear();
    }

    /// True if an argument was refused since the last clear.
    #[inline]
    pub fn has_overflowed_arguments(&self) -> bool {
        self.arguments.has_overflowed()
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// Call with the current receiver and buffered arguments.
    pub fn call(&self) -> VmResult<Value> {
        if self.arguments.has_overflowed() {
            return Err(self.overflow_error());
        }
        self.engine().execute_cached_call(self)
    }

    /// Call with `this` and `args`, bypassing the buffer when the frame is
    /// small enough.
    ///
    /// A frame that fits `fast_path_max_arguments` runs inline and is not
    /// checked against the capacity committed at construction. Larger frames
    /// go through the buffer and fail with `AllocationFailure` past that
    /// capacity, so a cache built for 0 arguments accepts 3 but not 4 under
    /// the default configuration.
    pub fn call_with_arguments(&mut self, this: Value, args: &[Value]) -> VmResult<Value> {
        if let Some(result) = self.engine().try_call_with_arguments(self, &this, args) {
            return result;
        }

        self.clear_arguments();
        self.set_this(this);
        for arg in args {
            self.append_argument(arg.clone());
        }
        if self.has_overflowed_arguments() {
            return Err(self.overflow_error());
        }
        self.call()
    }

    #[cold]
    fn overflow_error(&self) -> VmError {
        self.engine().stats().record_overflow();
        log::warn!(
            "cached call to {}: more than {} arguments",
            self.function.name(),
            self.arguments.capacity()
        );
        VmError::allocation(self.arguments.capacity() + 1, self.arguments.capacity())
    }

    // =========================================================================
    // Linkage
    // =========================================================================

    /// Re-resolve the function's current code.
    pub fn relink(&mut self) -> VmResult<()> {
        let engine = self.engine();
        engine.check_entry()?;
        engine.relink_cached_call(&self.function, self.handle)?;
        Ok(())
    }

    /// True while the cache may be called.
    #[inline]
    pub fn is_linked(&self) -> bool {
        self.linkage.lock().is_linked()
    }

    /// The code block calls currently run.
    #[inline]
    pub fn linked_code_block(&self) -> Option<Arc<CodeBlock>> {
        self.linkage.lock().code_block().cloned()
    }

    /// Parameters of the linked code, receiver included.
    #[inline]
    pub fn num_parameters(&self) -> usize {
        self.linkage.lock().num_parameters()
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// The function being called.
    #[inline]
    pub fn function(&self) -> &Arc<Function> {
        &self.function
    }

    /// The function's executable.
    #[inline]
    pub fn executable(&self) -> &Arc<FunctionExecutable> {
        &self.executable
    }

    /// The function's defining scope.
    #[inline]
    pub fn scope(&self) -> &Arc<Scope> {
        self.function.scope()
    }

    /// The receiver for the next call.
    #[inline]
    pub fn this(&self) -> &Value {
        self.proto_frame.this()
    }

    /// Buffered arguments.
    #[inline]
    pub fn arguments(&self) -> &[Value] {
        self.arguments.as_slice()
    }

    /// The reusable frame descriptor.
    #[inline]
    pub fn proto_frame(&self) -> &ProtoCallFrame {
        &self.proto_frame
    }

    /// Registry handle.
    #[inline]
    pub fn handle(&self) -> LinkHandle {
        self.handle
    }

    /// The engine calls run on.
    #[inline]
    pub fn engine(&self) -> &Arc<Engine> {
        self.entry_scope.engine()
    }
}

impl Drop for CachedCall {
    fn drop(&mut self) {
        self.engine().links().deregister(self.handle);
    }
}

impl std::fmt::Debug for CachedCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedCall")
            .field("function", &self.function.name())
            .field("handle", &self.handle)
            .field("linked", &self.is_linked())
            .field("arguments", &self.arguments.len())
            .finish()
    }
}
