//! Free list allocator - variable-size carving with coalescing

use core::mem;
use core::ptr::{self, NonNull};

use alloc::collections::BTreeMap;
use serde::{Deserialize, Serialize};

use crate::buffer::ArenaBuffer;
use crate::config::{MemoryConfig, DEFAULT_ARENA_SIZE, MAX_ALIGN};
use crate::error::{MemoryError, Result};
use crate::{checked_next_multiple, RawAllocator};

/// A free byte range `[offset, offset + size)` of the arena
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FreeChunk {
    offset: usize,
    size: usize,
}

/// Placement of one allocation carved from a chunk
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Carve {
    /// Offset of the returned storage
    pub location: usize,
    /// Distance from the chunk's former start to `location`, stored in the
    /// byte just before `location`
    pub header: u8,
}

impl FreeChunk {
    pub const fn new(offset: usize, size: usize) -> Self {
        Self { offset, size }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// One past the last byte, saturating at `usize::MAX`
    pub fn end(&self) -> usize {
        self.offset.saturating_add(self.size)
    }

    /// One past the last byte, or `None` when the range runs off the address space
    fn checked_end(&self) -> Option<usize> {
        self.offset.checked_add(self.size)
    }

    /// Whether one range ends exactly where the other starts
    ///
    /// Overlapping ranges are not adjacent. A range running off the address
    /// space has no successor.
    pub fn is_adjacent(&self, other: &FreeChunk) -> bool {
        self.checked_end() == Some(other.offset) || other.checked_end() == Some(self.offset)
    }

    /// Whether the two ranges share at least one byte
    pub fn overlaps(&self, other: &FreeChunk) -> bool {
        self.starts_before_end(other) && other.starts_before_end(self)
    }

    fn starts_before_end(&self, other: &FreeChunk) -> bool {
        match other.checked_end() {
            Some(end) => self.offset < end,
            None => true,
        }
    }

    /// Single chunk spanning two adjacent chunks
    fn merge(self, other: FreeChunk) -> FreeChunk {
        debug_assert!(self.is_adjacent(&other));
        FreeChunk::new(self.offset.min(other.offset), self.size + other.size)
    }

    /// Carve `size` bytes aligned to `align` from the front of this chunk
    ///
    /// The storage starts past at least one header byte. On success the chunk
    /// shrinks to the bytes after the carved span; on failure it is untouched.
    /// Offsets are relative to a [`MAX_ALIGN`]-aligned base, so `align` must be
    /// a power of two no larger than that. Fails when the header distance would
    /// not fit in a byte.
    pub fn carve(&mut self, size: usize, align: usize) -> Option<Carve> {
        let location = checked_next_multiple(align, self.offset.checked_add(1)?)?;
        let end = location.checked_add(size)?;
        let consumed = end - self.offset;
        if consumed > self.size {
            return None;
        }
        let header = u8::try_from(location - self.offset).ok()?;

        self.offset = end;
        self.size -= consumed;
        Some(Carve { location, header })
    }
}

/// Placement policy for choosing free chunks
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementPolicy {
    /// Lowest-addressed chunk that fits
    #[default]
    FirstFit,
    /// Smallest chunk that fits
    BestFit,
    /// Largest chunk that fits
    WorstFit,
}

/// Free list allocator
///
/// Free space is a set of disjoint, address-ordered chunks in which no two
/// chunks touch. Allocation carves from the front of a chunk chosen by the
/// placement policy and writes a one-byte header just before the returned
/// storage. Deallocation reads that header back to recover the carved span,
/// reinserts it and merges it with every touching neighbour.
///
/// The allocator does not track live objects: anything not deallocated when
/// the allocator is reset or dropped is reclaimed without running destructors.
pub struct FreeListAllocator {
    /// Backing memory
    buffer: ArenaBuffer,
    /// Free chunks keyed by offset
    chunks: BTreeMap<usize, usize>,
    /// Sum of free chunk sizes
    free: usize,
    /// Placement policy
    policy: PlacementPolicy,
}

impl FreeListAllocator {
    /// Create a new free list allocator
    pub fn new(capacity: usize) -> Self {
        Self::with_policy(capacity, PlacementPolicy::FirstFit)
    }

    /// Create with a specific placement policy
    pub fn with_policy(capacity: usize, policy: PlacementPolicy) -> Self {
        log::debug!(
            "Created free list allocator with {} bytes ({:?})",
            capacity,
            policy
        );

        let mut chunks = BTreeMap::new();
        if capacity > 0 {
            chunks.insert(0, capacity);
        }

        Self {
            buffer: ArenaBuffer::new(capacity),
            chunks,
            free: capacity,
            policy,
        }
    }

    /// Create an allocator sized by `config.free_list_size` using `config.placement`
    pub fn from_config(config: &MemoryConfig) -> Self {
        Self::with_policy(config.free_list_size, config.placement)
    }

    /// Get the placement policy
    pub fn policy(&self) -> PlacementPolicy {
        self.policy
    }

    /// Free chunks in address order
    pub fn chunks(&self) -> impl Iterator<Item = FreeChunk> + '_ {
        self.chunks
            .iter()
            .map(|(&offset, &size)| FreeChunk::new(offset, size))
    }

    /// Find a suitable free chunk
    fn find_chunk(&self, size: usize, align: usize) -> Option<FreeChunk> {
        let mut fitting = self
            .chunks()
            .filter(|chunk| {
                let mut probe = *chunk;
                probe.carve(size, align).is_some()
            });

        match self.policy {
            PlacementPolicy::FirstFit => fitting.next(),
            PlacementPolicy::BestFit => fitting.min_by_key(|chunk| chunk.size),
            // first of the largest keeps the choice address-stable
            PlacementPolicy::WorstFit => fitting.fold(None, |worst: Option<FreeChunk>, chunk| {
                match worst {
                    Some(w) if w.size >= chunk.size => Some(w),
                    _ => Some(chunk),
                }
            }),
        }
    }

    /// Carve storage and write its header, returning the storage offset
    fn carve(&mut self, size: usize, align: usize, operation: &'static str) -> Result<usize> {
        let oom = MemoryError::OutOfMemory { operation };
        let mut chunk = self.find_chunk(size, align).ok_or(oom)?;
        let original = chunk;
        let carve = chunk.carve(size, align).ok_or(oom)?;

        self.chunks.remove(&original.offset);
        if chunk.size > 0 {
            self.chunks.insert(chunk.offset, chunk.size);
        }
        self.free -= original.size - chunk.size;
        self.buffer.write_byte(carve.location - 1, carve.header);

        Ok(carve.location)
    }

    /// Allocate raw bytes
    ///
    /// # Panics
    /// Panics if `align` is not a power of two or exceeds [`MAX_ALIGN`].
    pub fn allocate_bytes(&mut self, size: usize, align: usize) -> Result<NonNull<u8>> {
        assert!(
            align.is_power_of_two() && align <= MAX_ALIGN,
            "unsupported alignment {}",
            align
        );
        let location = self.carve(size, align, "FreeListAllocator::allocate")?;
        Ok(self.buffer.ptr_at(location))
    }

    /// Place a single value
    pub fn allocate<T>(&mut self, value: T) -> Result<NonNull<T>> {
        const { assert!(mem::align_of::<T>() <= MAX_ALIGN, "max alignment exceeded") };

        let location = self.carve(
            mem::size_of::<T>(),
            mem::align_of::<T>(),
            "FreeListAllocator::allocate",
        )?;
        let ptr = self.buffer.ptr_at(location).cast::<T>();

        // SAFETY: freshly carved, aligned and large enough for T
        unsafe { ptr.as_ptr().write(value) };
        Ok(ptr)
    }

    /// Construct `count` values in a contiguous run, calling `init` with each index
    pub fn allocate_with<T, F>(&mut self, count: usize, mut init: F) -> Result<NonNull<[T]>>
    where
        F: FnMut(usize) -> T,
    {
        const { assert!(mem::align_of::<T>() <= MAX_ALIGN, "max alignment exceeded") };

        let size = mem::size_of::<T>()
            .checked_mul(count)
            .ok_or(MemoryError::OutOfMemory {
                operation: "FreeListAllocator::allocate",
            })?;
        let location = self.carve(size, mem::align_of::<T>(), "FreeListAllocator::allocate")?;
        let first = self.buffer.ptr_at(location).cast::<T>();

        for index in 0..count {
            // SAFETY: the carved run holds `count` aligned values of T
            unsafe { first.as_ptr().add(index).write(init(index)) };
        }
        Ok(NonNull::slice_from_raw_parts(first, count))
    }

    /// Recover the carved span behind `ptr` from its header byte
    ///
    /// Rejects pointers outside the arena, corrupt headers, and spans that
    /// overlap free space (double frees).
    fn span_of(&self, ptr: *const u8, size: usize) -> Option<FreeChunk> {
        let offset = self.buffer.offset_of(ptr)?;
        if offset == 0 {
            return None;
        }

        let header = self.buffer.read_byte(offset - 1) as usize;
        if header == 0 || header > offset {
            return None;
        }

        let start = offset - header;
        let end = offset.checked_add(size)?;
        if end > self.buffer.len() {
            return None;
        }

        let span = FreeChunk::new(start, end - start);
        (!self.overlaps_free(&span)).then_some(span)
    }

    /// Whether `span` shares a byte with any free chunk
    fn overlaps_free(&self, span: &FreeChunk) -> bool {
        let before = self
            .chunks
            .range(..=span.offset)
            .next_back()
            .map(|(&offset, &size)| FreeChunk::new(offset, size));
        let after = self
            .chunks
            .range(span.offset..)
            .next()
            .map(|(&offset, &size)| FreeChunk::new(offset, size));

        before.is_some_and(|chunk| chunk.overlaps(span))
            || after.is_some_and(|chunk| chunk.overlaps(span))
    }

    /// A free chunk touching `chunk`, if any
    fn touching(&self, chunk: &FreeChunk) -> Option<FreeChunk> {
        let before = self
            .chunks
            .range(..chunk.offset)
            .next_back()
            .map(|(&offset, &size)| FreeChunk::new(offset, size))
            .filter(|before| before.is_adjacent(chunk));

        before.or_else(|| {
            self.chunks
                .get(&chunk.end())
                .map(|&size| FreeChunk::new(chunk.end(), size))
        })
    }

    /// Return a span to the free set, merging until no neighbour touches it
    fn release(&mut self, span: FreeChunk) {
        self.free += span.size;

        let mut chunk = span;
        while let Some(neighbor) = self.touching(&chunk) {
            self.chunks.remove(&neighbor.offset);
            log::trace!(
                "Coalescing free chunks {:?} and {:?}",
                chunk,
                neighbor
            );
            chunk = chunk.merge(neighbor);
        }
        self.chunks.insert(chunk.offset, chunk.size);
    }

    /// Free raw bytes
    ///
    /// # Safety
    /// `ptr` must come from [`allocate_bytes`](Self::allocate_bytes) on this
    /// allocator with the same `size` and must not have been freed since.
    pub unsafe fn deallocate_bytes(&mut self, ptr: NonNull<u8>, size: usize) -> Result<()> {
        let span = self.span_of(ptr.as_ptr(), size).ok_or(MemoryError::InvalidDeallocation {
            operation: "FreeListAllocator::deallocate",
        })?;
        self.release(span);
        Ok(())
    }

    /// Drop a single value and free its storage
    ///
    /// # Safety
    /// `ptr` must come from [`allocate`](Self::allocate) on this allocator and
    /// must not have been freed since.
    pub unsafe fn deallocate<T>(&mut self, ptr: NonNull<T>) -> Result<()> {
        self.deallocate_slice(NonNull::slice_from_raw_parts(ptr, 1))
    }

    /// Drop a run of values and free its storage
    ///
    /// # Safety
    /// `run` must come from [`allocate_with`](Self::allocate_with) on this
    /// allocator (or be a single value from [`allocate`](Self::allocate)) and
    /// must not have been freed since.
    pub unsafe fn deallocate_slice<T>(&mut self, run: NonNull<[T]>) -> Result<()> {
        let invalid = MemoryError::InvalidDeallocation {
            operation: "FreeListAllocator::deallocate",
        };
        let size = mem::size_of::<T>().checked_mul(run.len()).ok_or(invalid)?;
        let span = self.span_of(run.cast::<u8>().as_ptr(), size).ok_or(invalid)?;

        // span is back in the free set even if a destructor panics
        self.release(span);
        ptr::drop_in_place(run.as_ptr());
        Ok(())
    }

    /// Reclaim the whole arena without running destructors
    pub fn reset(&mut self) {
        self.chunks.clear();
        if self.buffer.len() > 0 {
            self.chunks.insert(0, self.buffer.len());
        }
        self.free = self.buffer.len();
    }

    /// Get the total capacity
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Get the bytes in use, headers and padding included
    pub fn used(&self) -> usize {
        self.buffer.len() - self.free
    }

    /// Get allocation statistics
    pub fn stats(&self) -> FreeListStats {
        FreeListStats {
            capacity: self.buffer.len(),
            used: self.used(),
            free: self.free,
            free_chunks: self.chunks.len(),
            largest_free_chunk: self.chunks.values().copied().max().unwrap_or(0),
        }
    }
}

impl RawAllocator for FreeListAllocator {
    fn allocate(&mut self, size: usize, align: usize) -> Result<NonNull<u8>> {
        self.allocate_bytes(size, align)
    }

    fn reset(&mut self) {
        FreeListAllocator::reset(self);
    }

    fn capacity(&self) -> usize {
        self.buffer.len()
    }

    fn used(&self) -> usize {
        FreeListAllocator::used(self)
    }
}

impl Default for FreeListAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_ARENA_SIZE)
    }
}

impl Drop for FreeListAllocator {
    fn drop(&mut self) {
        if self.free < self.buffer.len() {
            log::debug!(
                "Dropping free list allocator with {} bytes still allocated",
                self.used()
            );
        }
    }
}

/// Free list statistics
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreeListStats {
    pub capacity: usize,
    pub used: usize,
    pub free: usize,
    pub free_chunks: usize,
    pub largest_free_chunk: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::rc::Rc;
    use alloc::vec::Vec;
    use core::cell::Cell;

    fn offset_of<T: ?Sized>(alloc: &FreeListAllocator, ptr: NonNull<T>) -> usize {
        alloc.buffer.offset_of(ptr.cast::<u8>().as_ptr()).unwrap()
    }

    #[test]
    fn test_carve_shrinks_chunk() {
        let mut chunk = FreeChunk::new(0, 100);

        let carve = chunk.carve(40, 8).unwrap();
        assert_eq!(carve, Carve { location: 8, header: 8 });
        assert_eq!(chunk, FreeChunk::new(48, 52));

        assert_eq!(chunk.carve(70, 8), None);
        assert_eq!(chunk, FreeChunk::new(48, 52));
    }

    #[test]
    fn test_carve_header_is_at_least_one() {
        let mut chunk = FreeChunk::new(16, 32);
        let carve = chunk.carve(4, 1).unwrap();
        assert_eq!(carve.location, 17);
        assert_eq!(carve.header, 1);
        assert_eq!(chunk, FreeChunk::new(21, 27));
    }

    #[test]
    fn test_adjacency() {
        let a = FreeChunk::new(0, 10);
        let b = FreeChunk::new(10, 5);
        let c = FreeChunk::new(5, 10);
        let d = FreeChunk::new(16, 4);

        assert!(a.is_adjacent(&b));
        assert!(b.is_adjacent(&a));
        assert!(!a.is_adjacent(&c));
        assert!(a.overlaps(&c));
        assert!(!b.is_adjacent(&d));
    }

    #[test]
    fn test_adjacency_at_address_space_end() {
        let tail = FreeChunk::new(usize::MAX - 4, 8);
        let head = FreeChunk::new(0, 4);
        let last = FreeChunk::new(usize::MAX - 4, 4);

        assert!(!tail.is_adjacent(&head));
        assert!(!head.is_adjacent(&tail));
        assert!(tail.overlaps(&last));
        assert!(!tail.overlaps(&head));
        assert!(last.is_adjacent(&FreeChunk::new(usize::MAX, 0)));
        assert_eq!(tail.end(), usize::MAX);

        let mut chunk = tail;
        assert_eq!(chunk.carve(16, 1), None);
        assert_eq!(chunk, tail);
    }

    #[test]
    fn test_free_list_basic() {
        let mut alloc = FreeListAllocator::new(1024);

        let a = alloc.allocate(7u64).unwrap();
        let b = alloc.allocate([1u32; 4]).unwrap();

        assert_ne!(a.cast::<u8>(), b.cast::<u8>());
        unsafe {
            assert_eq!(*a.as_ptr(), 7);
            assert_eq!(*b.as_ptr(), [1; 4]);
        }
        assert_eq!(offset_of(&alloc, a), 8);
        assert_eq!(offset_of(&alloc, b), 20);

        unsafe {
            alloc.deallocate(a).unwrap();
            alloc.deallocate(b).unwrap();
        }
        assert_eq!(alloc.stats().free_chunks, 1);
        assert_eq!(alloc.used(), 0);
    }

    #[test]
    fn test_free_list_coalesce() {
        let mut alloc = FreeListAllocator::new(1024);

        let ptr1 = alloc.allocate_bytes(100, 8).unwrap();
        let ptr2 = alloc.allocate_bytes(100, 8).unwrap();
        let ptr3 = alloc.allocate_bytes(100, 8).unwrap();

        unsafe {
            alloc.deallocate_bytes(ptr1, 100).unwrap();
            alloc.deallocate_bytes(ptr3, 100).unwrap();
        }
        // ptr3 merged with the tail, ptr1 stays separate
        assert_eq!(alloc.stats().free_chunks, 2);

        unsafe {
            alloc.deallocate_bytes(ptr2, 100).unwrap();
        }
        let chunks: Vec<_> = alloc.chunks().collect();
        assert_eq!(chunks, vec![FreeChunk::new(0, 1024)]);
    }

    #[test]
    fn test_out_of_memory_leaves_chunks() {
        let mut alloc = FreeListAllocator::new(64);
        alloc.allocate([0u8; 30]).unwrap();
        let before: Vec<_> = alloc.chunks().collect();

        let err = alloc.allocate([0u8; 40]).unwrap_err();
        assert_eq!(err, MemoryError::OutOfMemory { operation: "FreeListAllocator::allocate" });
        assert_eq!(alloc.chunks().collect::<Vec<_>>(), before);
    }

    #[test]
    fn test_invalid_deallocation() {
        let mut alloc = FreeListAllocator::new(256);
        let ptr = alloc.allocate_bytes(16, 8).unwrap();
        let before: Vec<_> = alloc.chunks().collect();

        let mut outside = 0u8;
        let err = unsafe { alloc.deallocate_bytes(NonNull::from(&mut outside), 16) }.unwrap_err();
        assert!(err.is_invalid_deallocation());

        // size reaching past the arena
        assert!(unsafe { alloc.deallocate_bytes(ptr, 4096) }.is_err());
        assert_eq!(alloc.chunks().collect::<Vec<_>>(), before);

        unsafe { alloc.deallocate_bytes(ptr, 16).unwrap() };
        // double free overlaps free space
        assert!(unsafe { alloc.deallocate_bytes(ptr, 16) }.is_err());
        assert_eq!(alloc.used(), 0);
    }

    #[test]
    fn test_deallocate_runs_drop() {
        struct Counted(Rc<Cell<usize>>);

        impl Drop for Counted {
            fn drop(&mut self) {
                self.0.set(self.0.get() + 1);
            }
        }

        let drops = Rc::new(Cell::new(0));
        let mut alloc = FreeListAllocator::new(512);
        let run = alloc.allocate_with(3, |_| Counted(drops.clone())).unwrap();

        unsafe { alloc.deallocate_slice(run).unwrap() };
        assert_eq!(drops.get(), 3);
        assert_eq!(alloc.used(), 0);
    }

    #[test]
    fn test_panicking_drop_still_frees_span() {
        struct Bomb(#[allow(dead_code)] u64);

        impl Drop for Bomb {
            fn drop(&mut self) {
                panic!("bomb");
            }
        }

        let mut alloc = FreeListAllocator::new(256);
        let bomb = alloc.allocate(Bomb(9)).unwrap();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| unsafe {
            alloc.deallocate(bomb)
        }));
        assert!(result.is_err());
        assert_eq!(alloc.used(), 0);
        assert_eq!(alloc.chunks().collect::<Vec<_>>(), vec![FreeChunk::new(0, 256)]);
    }

    #[test]
    fn test_max_alignment() {
        #[repr(align(128))]
        struct Wide(u8);

        let mut alloc = FreeListAllocator::new(512);
        let ptr = alloc.allocate(Wide(3)).unwrap();
        assert!(crate::is_aligned(ptr.cast::<u8>().as_ptr(), 128));
        assert_eq!(offset_of(&alloc, ptr), 128);
        unsafe { assert_eq!((*ptr.as_ptr()).0, 3) };
    }

    #[test]
    #[should_panic(expected = "unsupported alignment")]
    fn test_raw_alignment_above_max_panics() {
        let mut alloc = FreeListAllocator::new(1024);
        let _ = alloc.allocate_bytes(8, 256);
    }

    #[test]
    fn test_zero_sized_allocation() {
        let mut alloc = FreeListAllocator::new(8);
        let ptr = alloc.allocate(()).unwrap();
        assert_eq!(alloc.used(), 1);
        unsafe { alloc.deallocate(ptr).unwrap() };
        assert_eq!(alloc.used(), 0);
    }

    fn fragmented(policy: PlacementPolicy) -> FreeListAllocator {
        let mut alloc = FreeListAllocator::with_policy(1024, policy);
        let a = alloc.allocate_bytes(199, 1).unwrap();
        alloc.allocate_bytes(9, 1).unwrap();
        let c = alloc.allocate_bytes(99, 1).unwrap();
        alloc.allocate_bytes(9, 1).unwrap();
        alloc.allocate_bytes(703, 1).unwrap();
        assert_eq!(alloc.stats().free_chunks, 0);

        unsafe {
            alloc.deallocate_bytes(a, 199).unwrap();
            alloc.deallocate_bytes(c, 99).unwrap();
        }
        assert_eq!(
            alloc.chunks().collect::<Vec<_>>(),
            vec![FreeChunk::new(0, 200), FreeChunk::new(210, 100)]
        );
        alloc
    }

    #[test]
    fn test_placement_policies() {
        let mut first = fragmented(PlacementPolicy::FirstFit);
        let ptr = first.allocate_bytes(49, 1).unwrap();
        assert_eq!(offset_of(&first, ptr), 1);

        let mut best = fragmented(PlacementPolicy::BestFit);
        let ptr = best.allocate_bytes(49, 1).unwrap();
        assert_eq!(offset_of(&best, ptr), 211);

        let mut worst = fragmented(PlacementPolicy::WorstFit);
        let ptr = worst.allocate_bytes(49, 1).unwrap();
        assert_eq!(offset_of(&worst, ptr), 1);
    }

    #[test]
    fn test_reset_and_stats() {
        let mut alloc = FreeListAllocator::new(256);
        alloc.allocate([0u64; 4]).unwrap();
        let stats = alloc.stats();
        assert_eq!(stats.capacity, 256);
        assert_eq!(stats.used, 40);
        assert_eq!(stats.largest_free_chunk, 216);

        alloc.reset();
        assert_eq!(alloc.used(), 0);
        assert_eq!(alloc.chunks().collect::<Vec<_>>(), vec![FreeChunk::new(0, 256)]);
    }
}
