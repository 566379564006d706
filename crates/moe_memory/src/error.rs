//! Error types for the allocators

use thiserror::Error;

/// Allocator errors
///
/// Every variant carries the name of the operation that raised it, so the
/// rendered message reads like `<PoolAllocator::make> Out of memory`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MemoryError {
    /// The remaining capacity cannot satisfy the request
    #[error("<{operation}> Out of memory")]
    OutOfMemory { operation: &'static str },

    /// The pointer does not designate a live allocation of this allocator
    #[error("<{operation}> Invalid deallocation")]
    InvalidDeallocation { operation: &'static str },
}

impl MemoryError {
    /// Name of the operation that failed
    pub fn operation(&self) -> &'static str {
        match *self {
            MemoryError::OutOfMemory { operation } => operation,
            MemoryError::InvalidDeallocation { operation } => operation,
        }
    }

    /// Whether this is an out-of-memory failure
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, MemoryError::OutOfMemory { .. })
    }

    /// Whether this is an invalid-deallocation failure
    pub fn is_invalid_deallocation(&self) -> bool {
        matches!(self, MemoryError::InvalidDeallocation { .. })
    }
}

/// Result type for allocator operations
pub type Result<T> = core::result::Result<T, MemoryError>;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The TOML source could not be parsed
    #[error("Failed to parse memory configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of its accepted range
    #[error("Invalid memory configuration: {0}")]
    Invalid(String),
}
