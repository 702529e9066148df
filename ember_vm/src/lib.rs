//! Ember execution engine services and cached call linkage.
//!
//! # Architecture
//!
//! - **Engine**: owns the code cache and the call link registry, and guards
//!   every call against runaway recursion and forbidden reentry.
//! - **CodeCache**: the current `CodeBlock` of every executable. Blocks are
//!   compiled lazily and replaced by tier-up, deoptimization or jettison.
//! - **CachedCall**: resolves a function once and calls it many times with a
//!   reusable frame. Replacement of its code block upgrades or unlinks it, so
//!   it never runs replaced code.
//!
//! # Usage
//!
//! ```
//! use ember_vm::{CachedCall, Engine, EngineConfig, Function, FunctionExecutable, Scope, Value};
//!
//! let engine = Engine::new(EngineConfig::default()).unwrap();
//! let double = FunctionExecutable::new("double", 1, |_, frame| {
//!     Ok(Value::Int(frame.argument(0).as_int().unwrap_or(0) * 2))
//! });
//! let function = Function::new(&double, &Scope::global());
//!
//! let mut call = CachedCall::new(&engine, &function, 1).unwrap();
//! for i in 0..3 {
//!     let result = call.call_with_arguments(Value::Undefined, &[Value::Int(i)]).unwrap();
//!     assert_eq!(result, Value::Int(i * 2));
//! }
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

pub mod cached_call;
pub mod call_link;
pub mod code_cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod frame;
pub mod function;
pub mod value;

mod stats;

pub use cached_call::{ArgumentBuffer, CachedCall};
pub use call_link::{LinkHandle, LinkRegistry, Linkage};
pub use code_cache::{CodeBlock, CodeBlockId, CodeCache, CodeTier};
pub use config::{ConfigError, EngineConfig};
pub use engine::{DisallowEntryScope, Engine, EntryScope};
pub use error::{VmError, VmResult};
pub use frame::{CallFrame, ProtoCallFrame};
pub use function::{ExecutableId, Function, FunctionExecutable, FunctionKind, NativeCode, Scope};
pub use stats::{CallLinkStats, CallLinkStatsSnapshot};
pub use value::Value;
