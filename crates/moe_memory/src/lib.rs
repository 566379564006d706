//! # moe_memory - Deterministic Allocators
//!
//! Fixed-capacity allocators with explicit object lifetimes:
//! - Pool: Fixed-size typed slots with O(1) make/destroy and LIFO reuse
//! - Stack: Bump allocation with destructor tracking and marker rollback
//! - FreeList: Variable-size carving with address-ordered coalescing
//!
//! None of the allocators grow, lock, or fall back to the global heap once
//! constructed. Pointers they return are non-owning views into the arena.

extern crate alloc;

mod buffer;

pub mod config;
pub mod error;
pub mod free_list;
pub mod pool;
pub mod stack;

use core::ptr::NonNull;

pub use config::{MemoryConfig, DEFAULT_ARENA_SIZE, MAX_ALIGN};
pub use error::{ConfigError, MemoryError, Result};
pub use free_list::{FreeChunk, FreeListAllocator, PlacementPolicy};
pub use pool::PoolAllocator;
pub use stack::{StackAllocator, StackMarker, StackScope};

/// Common byte-level interface of the arena allocators
pub trait RawAllocator {
    /// Allocate `size` bytes aligned to `align`
    fn allocate(&mut self, size: usize, align: usize) -> Result<NonNull<u8>>;

    /// Reclaim the whole arena
    fn reset(&mut self);

    /// Get the total capacity in bytes
    fn capacity(&self) -> usize;

    /// Get the bytes currently in use
    fn used(&self) -> usize;

    /// Get the bytes still available
    fn available(&self) -> usize {
        self.capacity() - self.used()
    }
}

/// Round `value` up to the next multiple of `multiple_of`
///
/// Works for any non-zero `multiple_of`, not only powers of two.
///
/// # Panics
/// Panics if `multiple_of` is zero or the result overflows `usize`.
#[inline]
pub const fn next_multiple(multiple_of: usize, value: usize) -> usize {
    match checked_next_multiple(multiple_of, value) {
        Some(multiple) => multiple,
        None => panic!("next_multiple overflowed"),
    }
}

/// Checked [`next_multiple`]; `None` for a zero divisor or on overflow
#[inline]
pub const fn checked_next_multiple(multiple_of: usize, value: usize) -> Option<usize> {
    if multiple_of == 0 {
        return None;
    }
    let Some(multiple) = value.checked_add(multiple_of - 1) else {
        return None;
    };
    Some(multiple - multiple % multiple_of)
}

/// Align a value up to the given power-of-two alignment
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Align a value down to the given power-of-two alignment
#[inline]
pub const fn align_down(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Check if a pointer is aligned
///
/// Nothing is aligned to zero.
#[inline]
pub fn is_aligned(ptr: *const u8, align: usize) -> bool {
    align != 0 && (ptr as usize) % align == 0
}

pub mod prelude {
    pub use crate::{FreeListAllocator, PoolAllocator, RawAllocator, StackAllocator, StackMarker};
    pub use crate::{MemoryConfig, MemoryError};
    pub use crate::{align_down, align_up, checked_next_multiple, is_aligned, next_multiple};
}
