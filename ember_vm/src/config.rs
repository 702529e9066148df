//! Engine configuration parameters.

/// Configuration for an execution engine.
///
/// # Example
///
/// ```ignore
/// use ember_vm::EngineConfig;
///
/// // Shallow stacks, always unlink on code replacement
/// let config = EngineConfig {
///     max_recursion_depth: 64,
///     upgrade_on_replace: false,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    // =========================================================================
    // Stack
    // =========================================================================
    /// Maximum nesting of engine calls before `StackOverflow`.
    ///
    /// Default: 1000
    pub max_recursion_depth: usize,

    // =========================================================================
    // Arguments
    // =========================================================================
    /// Largest argument count a call may commit, excluding the receiver.
    ///
    /// Default: 65535
    pub max_arguments: usize,

    /// Largest frame, receiver included, that cached calls may pass inline
    /// without going through their argument buffer.
    ///
    /// Default: 4
    pub fast_path_max_arguments: usize,

    // =========================================================================
    // Linkage
    // =========================================================================
    /// Let cached calls follow a compatible replacement code block instead of
    /// unlinking.
    ///
    /// Default: true
    pub upgrade_on_replace: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_recursion_depth: crate::frame::MAX_RECURSION_DEPTH,
            max_arguments: 65535,
            fast_path_max_arguments: 4,
            upgrade_on_replace: true,
        }
    }
}

impl EngineConfig {
    /// Shallow limits so tests can hit every guard cheaply.
    pub fn for_testing() -> Self {
        Self {
            max_recursion_depth: 32,
            max_arguments: 16,
            fast_path_max_arguments: 4,
            upgrade_on_replace: true,
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_recursion_depth == 0 {
            return Err(ConfigError::NoRecursion);
        }
        if self.max_arguments == 0 {
            return Err(ConfigError::NoArguments);
        }
        if self.fast_path_max_arguments == 0 {
            return Err(ConfigError::InvalidFastPath);
        }
        // The inline frame must never admit a call the argument limit refuses
        if self.fast_path_max_arguments > self.max_arguments.saturating_add(1) {
            return Err(ConfigError::FastPathTooWide {
                fast_path: self.fast_path_max_arguments,
                limit: self.max_arguments,
            });
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Recursion depth must allow at least one call.
    #[error("max_recursion_depth must be at least 1")]
    NoRecursion,
    /// At least one argument must be allowed.
    #[error("max_arguments must be at least 1")]
    NoArguments,
    /// The fast path must at least carry the receiver.
    #[error("fast_path_max_arguments must be at least 1")]
    InvalidFastPath,
    /// The fast path would carry more arguments than `max_arguments`.
    #[error("fast_path_max_arguments ({fast_path}) exceeds max_arguments ({limit}) plus the receiver")]
    FastPathTooWide {
        /// Configured inline frame size, receiver included.
        fast_path: usize,
        /// Configured argument limit, receiver excluded.
        limit: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
        assert!(EngineConfig::for_testing().validate().is_ok());
    }

    #[test]
    fn test_invalid_configs() {
        let config = EngineConfig {
            max_recursion_depth: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::NoRecursion));

        let config = EngineConfig {
            fast_path_max_arguments: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidFastPath));
    }

    #[test]
    fn test_fast_path_bounded_by_argument_limit() {
        let config = EngineConfig {
            max_arguments: 2,
            fast_path_max_arguments: 8,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::FastPathTooWide { fast_path: 8, limit: 2 })
        );

        // Receiver plus every allowed argument
        let config = EngineConfig {
            max_arguments: 2,
            fast_path_max_arguments: 3,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
