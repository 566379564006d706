//! Stack allocator - bump allocation with ordered destruction

use core::marker::PhantomData;
use core::mem;
use core::ops::{Deref, DerefMut};
use core::ptr::{self, NonNull};

use alloc::vec::Vec;

use crate::buffer::ArenaBuffer;
use crate::config::{MemoryConfig, DEFAULT_ARENA_SIZE};
use crate::error::{MemoryError, Result};
use crate::{checked_next_multiple, RawAllocator};

/// Type-erased cleanup for one object living in the arena
struct DropRecord {
    /// Offset of the object from the arena base
    offset: usize,
    /// Size of the object in bytes
    len: usize,
    drop_fn: unsafe fn(NonNull<u8>),
}

unsafe fn drop_erased<T>(ptr: NonNull<u8>) {
    ptr::drop_in_place(ptr.cast::<T>().as_ptr());
}

/// Marker for stack position
///
/// Captures the bump pointer and the number of destructor records. Rolling
/// back to a marker destroys exactly the objects constructed after it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct StackMarker {
    position: usize,
    destructor_count: usize,
}

impl StackMarker {
    /// Bump pointer offset at the time the marker was taken
    pub fn position(&self) -> usize {
        self.position
    }

    /// Number of destructor records at the time the marker was taken
    pub fn destructor_count(&self) -> usize {
        self.destructor_count
    }
}

/// Stack allocator - bump allocation with markers and destructor tracking
///
/// Objects of any type can be constructed in the arena. For every object whose
/// type needs drop, a destructor record is pushed; rolling back to a marker
/// pops and runs those records in reverse construction order. Types without
/// drop glue cost no bookkeeping at all.
///
/// Constructed values may borrow, but only from data that outlives `'a`, the
/// lifetime of the allocator itself, since their destructors can run as late
/// as the allocator's own drop:
///
/// ```compile_fail
/// use moe_memory::StackAllocator;
///
/// struct Reader<'r>(&'r String);
///
/// impl Drop for Reader<'_> {
///     fn drop(&mut self) {
///         assert!(!self.0.is_empty());
///     }
/// }
///
/// let mut stack = StackAllocator::new(256);
/// {
///     let name = String::from("short-lived");
///     stack.make(Reader(&name)).unwrap();
/// }
/// drop(stack);
/// ```
pub struct StackAllocator<'a> {
    /// Backing memory
    buffer: ArenaBuffer,
    /// Current top of stack
    top: usize,
    /// Destructor records in construction order
    records: Vec<DropRecord>,
    /// Borrows held by constructed objects
    _borrows: PhantomData<&'a ()>,
}

impl<'a> StackAllocator<'a> {
    /// Create a new stack allocator
    pub fn new(capacity: usize) -> Self {
        log::debug!("Created stack allocator with {} bytes", capacity);

        Self {
            buffer: ArenaBuffer::new(capacity),
            top: 0,
            records: Vec::new(),
            _borrows: PhantomData,
        }
    }

    /// Create with capacity in KB
    pub fn with_capacity_kb(kb: usize) -> Self {
        Self::new(kb * 1024)
    }

    /// Create a stack sized by `config.stack_size`
    pub fn from_config(config: &MemoryConfig) -> Self {
        Self::new(config.stack_size)
    }

    /// Claim `size` bytes aligned to `align`, returning their offset
    ///
    /// Leaves the top untouched on failure.
    fn reserve(&mut self, size: usize, align: usize, operation: &'static str) -> Result<usize> {
        let oom = MemoryError::OutOfMemory { operation };
        let base = self.buffer.base_addr();

        let location = checked_next_multiple(align, base + self.top).ok_or(oom)? - base;
        let end = location.checked_add(size).ok_or(oom)?;
        if end > self.buffer.len() {
            return Err(oom);
        }

        self.top = end;
        Ok(location)
    }

    /// Record a destructor for the `T` at `offset` if `T` needs one
    #[inline]
    fn track<T>(&mut self, offset: usize) {
        if mem::needs_drop::<T>() {
            self.records.push(DropRecord {
                offset,
                len: mem::size_of::<T>(),
                drop_fn: drop_erased::<T>,
            });
        }
    }

    /// Allocate raw bytes
    ///
    /// An `align` of zero is treated as one. No destructor is recorded.
    pub fn alloc(&mut self, size: usize, align: usize) -> Result<NonNull<u8>> {
        let location = self.reserve(size, align.max(1), "StackAllocator::alloc")?;
        Ok(self.buffer.ptr_at(location))
    }

    /// Construct a single value
    pub fn make<T: 'a>(&mut self, value: T) -> Result<NonNull<T>> {
        let location = self.reserve(
            mem::size_of::<T>(),
            mem::align_of::<T>(),
            "StackAllocator::make",
        )?;
        let ptr = self.buffer.ptr_at(location).cast::<T>();

        // SAFETY: reserved, aligned and exclusively owned by this allocation
        unsafe { ptr.as_ptr().write(value) };
        self.track::<T>(location);
        Ok(ptr)
    }

    /// Construct `count` clones of `value` in a contiguous run
    pub fn make_n<T: Clone + 'a>(&mut self, count: usize, value: T) -> Result<NonNull<[T]>> {
        self.make_with(count, |_| value.clone())
    }

    /// Construct `count` values in a contiguous run, calling `init` with each index
    ///
    /// On success one destructor record per value is pushed, in index order.
    pub fn make_with<T, F>(&mut self, count: usize, mut init: F) -> Result<NonNull<[T]>>
    where
        T: 'a,
        F: FnMut(usize) -> T,
    {
        let oom = MemoryError::OutOfMemory {
            operation: "StackAllocator::make",
        };
        let size = mem::size_of::<T>().checked_mul(count).ok_or(oom)?;
        let location = self.reserve(size, mem::align_of::<T>(), "StackAllocator::make")?;
        let first = self.buffer.ptr_at(location).cast::<T>();

        if mem::needs_drop::<T>() {
            self.records.reserve(count);
        }
        for index in 0..count {
            // SAFETY: the reserved run holds `count` aligned values of T
            unsafe { first.as_ptr().add(index).write(init(index)) };
            self.track::<T>(location + index * mem::size_of::<T>());
        }

        Ok(NonNull::slice_from_raw_parts(first, count))
    }

    /// Get a marker for the current stack position
    pub fn marker(&self) -> StackMarker {
        StackMarker {
            position: self.top,
            destructor_count: self.records.len(),
        }
    }

    /// Roll back to `marker`, destroying every object constructed after it
    ///
    /// Destructors run in strict reverse construction order. A marker that lies
    /// beyond the current position was invalidated by an earlier rollback and
    /// is ignored. If a destructor panics, the remaining ones still run and the
    /// first panic propagates.
    pub fn destroy_to_marker(&mut self, marker: StackMarker) {
        if marker.position > self.top {
            log::warn!(
                "Ignoring stale stack marker at {} (current position {})",
                marker.position,
                self.top
            );
            return;
        }

        log::trace!(
            "Rolling stack back from {} to {}, {} destructors pending",
            self.top,
            marker.position,
            self.records.len().saturating_sub(marker.destructor_count)
        );

        self.top = marker.position;
        let mut unwind = Unwind {
            buffer: &self.buffer,
            records: &mut self.records,
            keep: marker.destructor_count,
            position: marker.position,
        };
        unwind.run();
    }

    /// Destroy every object and reset the bump pointer to the arena start
    pub fn destroy_all(&mut self) {
        self.destroy_to_marker(StackMarker::default());
    }

    /// Open a scope that rolls back to the current position when dropped
    pub fn scope(&mut self) -> StackScope<'_, 'a> {
        StackScope::new(self)
    }

    /// Get the current top position
    pub fn position(&self) -> usize {
        self.top
    }

    /// Get the number of pending destructor records
    pub fn destructor_count(&self) -> usize {
        self.records.len()
    }

    /// Get the total capacity
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Get the currently used bytes
    pub fn used(&self) -> usize {
        self.top
    }

    /// Get the available bytes
    pub fn available(&self) -> usize {
        self.buffer.len() - self.top
    }
}

/// Pops and runs destructor records down to a marker
///
/// Dropping the guard finishes the job, so a panicking destructor does not
/// strand the records beneath it.
struct Unwind<'a> {
    buffer: &'a ArenaBuffer,
    records: &'a mut Vec<DropRecord>,
    keep: usize,
    position: usize,
}

impl Unwind<'_> {
    /// Next record to destroy: above the kept count, or reaching past the position
    fn pop(&mut self) -> Option<DropRecord> {
        let last = self.records.last()?;
        if self.records.len() > self.keep || last.offset + last.len > self.position {
            self.records.pop()
        } else {
            None
        }
    }

    fn run(&mut self) {
        while let Some(record) = self.pop() {
            // SAFETY: the record describes a live object of the erased type,
            // and it was removed from the stack so it runs exactly once
            unsafe { (record.drop_fn)(self.buffer.ptr_at(record.offset)) };
        }
    }
}

impl Drop for Unwind<'_> {
    fn drop(&mut self) {
        self.run();
    }
}

impl RawAllocator for StackAllocator<'_> {
    fn allocate(&mut self, size: usize, align: usize) -> Result<NonNull<u8>> {
        self.alloc(size, align)
    }

    fn reset(&mut self) {
        self.destroy_all();
    }

    fn capacity(&self) -> usize {
        self.buffer.len()
    }

    fn used(&self) -> usize {
        self.top
    }
}

impl Default for StackAllocator<'_> {
    fn default() -> Self {
        Self::new(DEFAULT_ARENA_SIZE)
    }
}

impl Drop for StackAllocator<'_> {
    fn drop(&mut self) {
        if !self.records.is_empty() {
            log::debug!(
                "Dropping stack allocator with {} live objects",
                self.records.len()
            );
        }
        self.destroy_all();
    }
}

/// Scoped stack allocator guard
///
/// Takes a marker on creation and rolls back to it when dropped.
pub struct StackScope<'s, 'a> {
    stack: &'s mut StackAllocator<'a>,
    marker: StackMarker,
}

impl<'s, 'a> StackScope<'s, 'a> {
    /// Create a new scoped stack
    pub fn new(stack: &'s mut StackAllocator<'a>) -> Self {
        Self {
            marker: stack.marker(),
            stack,
        }
    }

    /// Marker this scope rolls back to
    pub fn marker(&self) -> StackMarker {
        self.marker
    }
}

impl<'a> Deref for StackScope<'_, 'a> {
    type Target = StackAllocator<'a>;

    fn deref(&self) -> &StackAllocator<'a> {
        self.stack
    }
}

impl<'a> DerefMut for StackScope<'_, 'a> {
    fn deref_mut(&mut self) -> &mut StackAllocator<'a> {
        self.stack
    }
}

impl Drop for StackScope<'_, '_> {
    fn drop(&mut self) {
        self.stack.destroy_to_marker(self.marker);
    }
}
