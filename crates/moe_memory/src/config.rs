//! Allocator configuration and shared constants

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::free_list::PlacementPolicy;

/// Default capacity used when no size is given (slots for pools, bytes for arenas)
pub const DEFAULT_ARENA_SIZE: usize = 1024;

/// Largest alignment the byte arenas can honor
///
/// Arena buffers are aligned to this value, so offset alignment and address
/// alignment coincide for every supported request.
pub const MAX_ALIGN: usize = 128;

/// Message for [`MemoryError::OutOfMemory`](crate::MemoryError::OutOfMemory)
pub const OUT_OF_MEMORY: &str = "Out of memory";

/// Message for [`MemoryError::InvalidDeallocation`](crate::MemoryError::InvalidDeallocation)
pub const INVALID_DEALLOC: &str = "Invalid deallocation";

/// Smallest free-list arena able to hold a header byte and one payload byte
const MIN_FREE_LIST_SIZE: usize = 2;

/// Sizing for the allocators of one subsystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Number of slots in a pool
    pub pool_capacity: usize,

    /// Stack allocator capacity in bytes
    pub stack_size: usize,

    /// Free-list allocator capacity in bytes
    pub free_list_size: usize,

    /// Chunk selection for the free-list allocator
    pub placement: PlacementPolicy,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            pool_capacity: DEFAULT_ARENA_SIZE,
            stack_size: DEFAULT_ARENA_SIZE,
            free_list_size: DEFAULT_ARENA_SIZE,
            placement: PlacementPolicy::FirstFit,
        }
    }
}

impl MemoryConfig {
    /// Parse and validate a configuration from TOML
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.free_list_size < MIN_FREE_LIST_SIZE {
            return Err(ConfigError::Invalid(format!(
                "free_list_size must be at least {} bytes, got {}",
                MIN_FREE_LIST_SIZE, self.free_list_size
            )));
        }
        Ok(())
    }

    /// Set the pool slot count
    pub fn with_pool_capacity(mut self, slots: usize) -> Self {
        self.pool_capacity = slots;
        self
    }

    /// Set the stack size in bytes
    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    /// Set the free-list size in bytes
    pub fn with_free_list_size(mut self, bytes: usize) -> Self {
        self.free_list_size = bytes;
        self
    }

    /// Set the placement policy
    pub fn with_placement(mut self, placement: PlacementPolicy) -> Self {
        self.placement = placement;
        self
    }
}
