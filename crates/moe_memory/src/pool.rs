//! Pool allocator - fixed-size typed slot allocation

use core::marker::PhantomData;
use core::mem;
use core::ptr::{self, NonNull};

use alloc::boxed::Box;

use crate::config::{MemoryConfig, DEFAULT_ARENA_SIZE};
use crate::error::{MemoryError, Result};

/// State of one pool slot
///
/// The tag is owned by the pool; slot bytes are never reinterpreted.
enum Slot<T> {
    /// Unoccupied, linking to the next free slot
    Free { next: Option<usize> },
    /// Holding a live value
    Occupied(T),
}

/// Pool allocator for values of one type
///
/// Capacity is fixed at construction. `make` and `destroy` are O(1): free
/// slots form a singly linked list threaded through the slot array, and the
/// most recently destroyed slot is the next one handed out.
///
/// Returned pointers stay valid until the value is destroyed, the pool is
/// cleared, or the pool is dropped. Moving the pool does not move the slots.
pub struct PoolAllocator<T> {
    /// Slot array, released from its `Box` so moves of the pool keep pointers valid
    slots: NonNull<[Slot<T>]>,
    /// Number of slots
    capacity: usize,
    /// Head of free list
    free_head: Option<usize>,
    /// Number of occupied slots
    occupied: usize,
    _owns: PhantomData<T>,
}

// Safety: the pool exclusively owns its slots; every mutation goes through &mut self
unsafe impl<T: Send> Send for PoolAllocator<T> {}

impl<T> PoolAllocator<T> {
    /// Create a pool with `capacity` slots
    ///
    /// The free list initially links slot 0 through `capacity - 1` in order.
    pub fn new(capacity: usize) -> Self {
        let slots: Box<[Slot<T>]> = (0..capacity)
            .map(|index| Slot::Free {
                next: (index + 1 < capacity).then_some(index + 1),
            })
            .collect();

        log::debug!(
            "Created pool allocator with {} slots of {} bytes",
            capacity,
            mem::size_of::<Slot<T>>()
        );

        Self {
            slots: NonNull::from(Box::leak(slots)),
            capacity,
            free_head: (capacity > 0).then_some(0),
            occupied: 0,
            _owns: PhantomData,
        }
    }

    /// Create a pool sized by `config.pool_capacity`
    pub fn from_config(config: &MemoryConfig) -> Self {
        Self::new(config.pool_capacity)
    }

    #[inline]
    fn slot_ptr(&self, index: usize) -> *mut Slot<T> {
        debug_assert!(index < self.capacity);
        // SAFETY: callers pass indices below capacity
        unsafe { self.slots.cast::<Slot<T>>().as_ptr().add(index) }
    }

    /// Place `value` in a free slot
    pub fn make(&mut self, value: T) -> Result<NonNull<T>> {
        self.make_with(|| value)
    }

    /// Construct a value in a free slot
    ///
    /// `init` is only called once a slot is known to be available.
    pub fn make_with<F>(&mut self, init: F) -> Result<NonNull<T>>
    where
        F: FnOnce() -> T,
    {
        let index = self.free_head.ok_or(MemoryError::OutOfMemory {
            operation: "PoolAllocator::make",
        })?;
        let value = init();

        // SAFETY: free-list indices are always below capacity
        let slot = unsafe { &mut *self.slot_ptr(index) };
        let Slot::Free { next } = *slot else {
            unreachable!("pool free list links occupied slot {}", index);
        };
        *slot = Slot::Occupied(value);

        self.free_head = next;
        self.occupied += 1;

        match slot {
            Slot::Occupied(value) => Ok(NonNull::from(value)),
            Slot::Free { .. } => unreachable!(),
        }
    }

    /// Destroy the value at `ptr` and return its slot to the free list
    ///
    /// Fails without touching any state unless `ptr` is exactly the address
    /// of a live value in this pool.
    pub fn destroy(&mut self, ptr: NonNull<T>) -> Result<()> {
        let index = self.index_of(ptr).ok_or(MemoryError::InvalidDeallocation {
            operation: "PoolAllocator::destroy",
        })?;

        // SAFETY: index_of only yields indices below capacity
        let slot = unsafe { &mut *self.slot_ptr(index) };
        let previous = mem::replace(slot, Slot::Free { next: self.free_head });
        self.free_head = Some(index);
        self.occupied -= 1;

        drop(previous);
        Ok(())
    }

    /// Index of the occupied slot whose value lives at `ptr`
    fn index_of(&self, ptr: NonNull<T>) -> Option<usize> {
        let base = self.slots.cast::<Slot<T>>().as_ptr() as usize;
        let offset = (ptr.as_ptr() as usize).checked_sub(base)?;
        let index = offset / mem::size_of::<Slot<T>>();
        if index >= self.capacity {
            return None;
        }

        // SAFETY: bounds checked above
        match unsafe { &*self.slot_ptr(index) } {
            Slot::Occupied(value) if ptr::eq(value, ptr.as_ptr()) => Some(index),
            _ => None,
        }
    }

    /// Whether `ptr` is a live value of this pool
    pub fn contains(&self, ptr: NonNull<T>) -> bool {
        self.index_of(ptr).is_some()
    }

    /// Borrow the live value at `ptr`
    pub fn get(&self, ptr: NonNull<T>) -> Option<&T> {
        let index = self.index_of(ptr)?;
        // SAFETY: index_of only yields indices below capacity
        match unsafe { &*self.slot_ptr(index) } {
            Slot::Occupied(value) => Some(value),
            Slot::Free { .. } => None,
        }
    }

    /// Mutably borrow the live value at `ptr`
    pub fn get_mut(&mut self, ptr: NonNull<T>) -> Option<&mut T> {
        let index = self.index_of(ptr)?;
        // SAFETY: index_of only yields indices below capacity
        match unsafe { &mut *self.slot_ptr(index) } {
            Slot::Occupied(value) => Some(value),
            Slot::Free { .. } => None,
        }
    }

    /// Drop every live value and restore the initial free list
    pub fn clear(&mut self) {
        let previous = mem::replace(self, Self::new(self.capacity));
        drop(previous);
    }

    /// Get the total number of slots
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get the number of live values
    pub fn len(&self) -> usize {
        self.occupied
    }

    /// Whether no value is live
    pub fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    /// Get the number of free slots
    pub fn available(&self) -> usize {
        self.capacity - self.occupied
    }

    /// Count the free list by walking it
    pub fn free_list_len(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.free_head;
        while let Some(index) = cursor {
            // SAFETY: free-list indices are always below capacity
            cursor = match unsafe { &*self.slot_ptr(index) } {
                Slot::Free { next } => *next,
                Slot::Occupied(_) => None,
            };
            count += 1;
        }
        count
    }

    /// Get statistics
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            slot_size: mem::size_of::<Slot<T>>(),
            total_slots: self.capacity,
            allocated_slots: self.occupied,
            free_slots: self.available(),
        }
    }
}

impl<T> Default for PoolAllocator<T> {
    fn default() -> Self {
        Self::new(DEFAULT_ARENA_SIZE)
    }
}

impl<T> Drop for PoolAllocator<T> {
    fn drop(&mut self) {
        if self.occupied > 0 {
            log::debug!("Dropping pool allocator with {} live values", self.occupied);
        }
        // SAFETY: `slots` came from `Box::leak` in `new` and is released once
        unsafe { drop(Box::from_raw(self.slots.as_ptr())) }
    }
}

/// Pool statistics
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStats {
    pub slot_size: usize,
    pub total_slots: usize,
    pub allocated_slots: usize,
    pub free_slots: usize,
}
