//! Call frames.
//!
//! `CallFrame` is what a callee sees: its function, the code block running,
//! the receiver and the arguments. `ProtoCallFrame` is the reusable frame
//! descriptor a cached call keeps between invocations; the arguments
//! themselves live in the cached call's buffer.

use crate::code_cache::{CodeBlock, CodeBlockId};
use crate::function::Function;
use crate::value::Value;

use std::sync::Arc;

/// Maximum recursion depth before StackOverflow.
pub const MAX_RECURSION_DEPTH: usize = 1000;

// =============================================================================
// Call Frame
// =============================================================================

/// The frame of one running call.
///
/// Arguments beyond those passed read as `Undefined`.
#[derive(Debug, Clone, Copy)]
pub struct CallFrame<'a> {
    callee: &'a Arc<Function>,
    code_block: Option<&'a CodeBlock>,
    this: &'a Value,
    arguments: &'a [Value],
}

impl<'a> CallFrame<'a> {
    /// Build a frame.
    #[inline]
    pub fn new(
        callee: &'a Arc<Function>,
        code_block: Option<&'a CodeBlock>,
        this: &'a Value,
        arguments: &'a [Value],
    ) -> Self {
        Self {
            callee,
            code_block,
            this,
            arguments,
        }
    }

    /// The function being called.
    #[inline]
    pub fn callee(&self) -> &'a Arc<Function> {
        self.callee
    }

    /// The code block running, `None` for host functions.
    #[inline]
    pub fn code_block(&self) -> Option<&'a CodeBlock> {
        self.code_block
    }

    /// Id of the code block running.
    #[inline]
    pub fn code_block_id(&self) -> Option<CodeBlockId> {
        self.code_block.map(CodeBlock::id)
    }

    /// The receiver.
    #[inline]
    pub fn this(&self) -> &'a Value {
        self.this
    }

    /// Argument `index`, or `Undefined` if it was not passed.
    #[inline]
    pub fn argument(&self, index: usize) -> Value {
        self.arguments.get(index).cloned().unwrap_or_default()
    }

    /// Arguments actually passed.
    #[inline]
    pub fn arguments(&self) -> &'a [Value] {
        self.arguments
    }

    /// Number of arguments passed, excluding the receiver.
    #[inline]
    pub fn argument_count(&self) -> usize {
        self.arguments.len()
    }

    /// Number of arguments passed, including the receiver.
    #[inline]
    pub fn argument_count_including_this(&self) -> usize {
        self.arguments.len() + 1
    }
}

// =============================================================================
// Proto Call Frame
// =============================================================================

/// Reusable frame descriptor for repeated calls to one function.
#[derive(Debug, Clone)]
pub struct ProtoCallFrame {
    callee: Arc<Function>,
    this: Value,
    argument_count_including_this: usize,
}

impl ProtoCallFrame {
    /// Describe calls to `callee` with `argument_count` arguments.
    ///
    /// The receiver starts out `Undefined`.
    pub fn new(callee: Arc<Function>, argument_count: usize) -> Self {
        Self {
            callee,
            this: Value::Undefined,
            argument_count_including_this: argument_count + 1,
        }
    }

    /// The function being called.
    #[inline]
    pub fn callee(&self) -> &Arc<Function> {
        &self.callee
    }

    /// The receiver for the next call.
    #[inline]
    pub fn this(&self) -> &Value {
        &self.this
    }

    /// Replace the receiver.
    #[inline]
    pub fn set_this(&mut self, this: Value) {
        self.this = this;
    }

    /// Committed frame size, receiver included.
    #[inline]
    pub fn argument_count_including_this(&self) -> usize {
        self.argument_count_including_this
    }

    /// A frame over this descriptor and `arguments`.
    #[inline]
    pub fn frame<'a>(&'a self, code_block: &'a CodeBlock, arguments: &'a [Value]) -> CallFrame<'a> {
        CallFrame::new(&self.callee, Some(code_block), &self.this, arguments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::Function;

    #[test]
    fn test_argument_padding() {
        let callee = Function::host("f", |_, _| Ok(Value::Undefined));
        let this = Value::Int(1);
        let args = [Value::Int(2)];
        let frame = CallFrame::new(&callee, None, &this, &args);

        assert_eq!(frame.argument(0), Value::Int(2));
        assert_eq!(frame.argument(1), Value::Undefined);
        assert_eq!(frame.argument_count(), 1);
        assert_eq!(frame.argument_count_including_this(), 2);
        assert!(frame.code_block_id().is_none());
    }

    #[test]
    fn test_proto_frame_this() {
        let callee = Function::host("f", |_, _| Ok(Value::Undefined));
        let mut proto = ProtoCallFrame::new(callee, 3);
        assert!(proto.this().is_undefined());
        assert_eq!(proto.argument_count_including_this(), 4);

        proto.set_this(Value::from("receiver"));
        assert_eq!(proto.this().as_str(), Some("receiver"));
    }
}
