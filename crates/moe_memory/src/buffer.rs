//! Owned, max-aligned byte region backing the byte arenas

use core::ptr::NonNull;

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::config::MAX_ALIGN;

/// One `MAX_ALIGN`-sized, `MAX_ALIGN`-aligned unit of backing storage
#[repr(C, align(128))]
struct Block([u8; MAX_ALIGN]);

const _: () = assert!(core::mem::align_of::<Block>() == MAX_ALIGN);

/// Fixed-capacity byte buffer whose base address is aligned to [`MAX_ALIGN`]
///
/// The storage is held as a raw pointer released from its `Box`, so moving the
/// buffer never invalidates pointers previously derived from `base`.
pub(crate) struct ArenaBuffer {
    storage: NonNull<[Block]>,
    base: NonNull<u8>,
    len: usize,
}

impl ArenaBuffer {
    /// Allocate a zero-filled buffer of `len` bytes
    pub fn new(len: usize) -> Self {
        let blocks = len.div_ceil(MAX_ALIGN);
        let storage: Box<[Block]> = (0..blocks)
            .map(|_| Block([0; MAX_ALIGN]))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let storage = NonNull::from(Box::leak(storage));

        Self {
            storage,
            base: storage.cast::<u8>(),
            len,
        }
    }

    /// Usable length in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Address of the first byte
    #[inline]
    pub fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Pointer to the byte at `offset`
    ///
    /// `offset == len` is allowed and yields the one-past-the-end pointer.
    #[inline]
    pub fn ptr_at(&self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset <= self.len);
        // SAFETY: offset is within the allocation or one past its end
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) }
    }

    /// Offset of `ptr` from the base, if it points into `[0, len]`
    ///
    /// The one-past-the-end address is accepted since zero-sized values may
    /// live there.
    #[inline]
    pub fn offset_of(&self, ptr: *const u8) -> Option<usize> {
        let offset = (ptr as usize).checked_sub(self.base_addr())?;
        (offset <= self.len).then_some(offset)
    }

    /// Read the byte at `offset`
    #[inline]
    pub fn read_byte(&self, offset: usize) -> u8 {
        assert!(offset < self.len);
        // SAFETY: bounds checked above; the buffer is always initialized
        unsafe { self.ptr_at(offset).as_ptr().read() }
    }

    /// Write the byte at `offset`
    #[inline]
    pub fn write_byte(&mut self, offset: usize, value: u8) {
        assert!(offset < self.len);
        // SAFETY: bounds checked above
        unsafe { self.ptr_at(offset).as_ptr().write(value) }
    }
}

impl Drop for ArenaBuffer {
    fn drop(&mut self) {
        // SAFETY: `storage` came from `Box::leak` in `new` and is released once
        unsafe { drop(Box::from_raw(self.storage.as_ptr())) }
    }
}
