//! Engine error types.

use crate::config::ConfigError;
use crate::value::Value;

/// Errors surfaced by engine services and cached calls.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VmError {
    /// The recursion guard tripped, or the engine currently refuses entry.
    #[error("maximum call stack size exceeded")]
    StackOverflow,

    /// An argument buffer could not hold what was asked of it.
    #[error("out of memory: {requested} arguments requested, limit is {limit}")]
    AllocationFailure {
        /// Arguments requested, excluding the receiver.
        requested: usize,
        /// Arguments the buffer may hold.
        limit: usize,
    },

    /// A cached call was invoked while its linkage was invalid.
    #[error("cached call is unlinked; relink before calling")]
    StaleLinkage,

    /// Cached calls cannot target host functions.
    #[error("host function '{0}' cannot be used as a cached call target")]
    HostFunction(String),

    /// A language-level exception raised by the callee.
    #[error("uncaught exception: {0:?}")]
    Thrown(Value),

    /// The engine configuration was rejected.
    #[error("invalid engine configuration: {0}")]
    Config(#[from] ConfigError),
}

impl VmError {
    /// Shorthand for an argument allocation failure.
    #[inline]
    pub(crate) fn allocation(requested: usize, limit: usize) -> Self {
        VmError::AllocationFailure { requested, limit }
    }

    /// Create a thrown error carrying a string value.
    pub fn throw(message: impl AsRef<str>) -> Self {
        VmError::Thrown(Value::string(message.as_ref()))
    }

    /// True if a language-level value was thrown.
    #[inline]
    pub fn is_thrown(&self) -> bool {
        matches!(self, VmError::Thrown(_))
    }
}

/// Result alias for engine operations.
pub type VmResult<T> = Result<T, VmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(VmError::StackOverflow.to_string(), "maximum call stack size exceeded");
        assert_eq!(
            VmError::allocation(9, 5).to_string(),
            "out of memory: 9 arguments requested, limit is 5"
        );
    }

    #[test]
    fn test_throw_helper() {
        let err = VmError::throw("boom");
        assert!(err.is_thrown());
        assert_eq!(err, VmError::Thrown(Value::string("boom")));
    }
}
