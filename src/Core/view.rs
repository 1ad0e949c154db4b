// Bounds-checked view over a raw, shared byte region.

use std::ptr::{self, NonNull};
use std::sync::atomic::Ordering::{AcqRel, Acquire, Release};
use std::sync::atomic::{AtomicI32, AtomicU8};

/// A copyable window onto memory owned by a [`StorageBackend`].
///
/// Every accessor checks `offset + size <= capacity` before touching memory,
/// so a miscomputed offset panics instead of scribbling over a neighbour.
/// The view does not own the memory; the owner of the backend must outlive
/// every view derived from it.
///
/// [`StorageBackend`]: crate::Core::Storage::StorageBackend
#[derive(Clone, Copy)]
pub struct BufferView {
    ptr: NonNull<u8>,
    capacity: usize,
}

// The view only hands out atomics, copies and caller-synchronised slices.
unsafe impl Send for BufferView {}
unsafe impl Sync for BufferView {}

impl BufferView {
    /// Wrap `capacity` bytes starting at `ptr`.
    ///
    /// # Safety
    /// `ptr` must be valid for reads and writes of `capacity` bytes, aligned
    /// to at least 8 bytes, for as long as the view (or any copy) is used.
    pub unsafe fn new(ptr: *mut u8, capacity: usize) -> Self {
        debug_assert!(!ptr.is_null() && ptr as usize % 8 == 0, "BufferView base must be non-null and 8-byte aligned");
        Self {
            ptr: NonNull::new_unchecked(ptr),
            capacity,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// A sub-view of `len` bytes starting at `offset`.
    pub fn slice_view(&self, offset: usize, len: usize) -> BufferView {
        self.check(offset, len);
        BufferView {
            ptr: unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(offset)) },
            capacity: len,
        }
    }

    #[inline]
    fn check(&self, offset: usize, size: usize) {
        let in_bounds = offset
            .checked_add(size)
            .map_or(false, |end| end <= self.capacity);
        assert!(
            in_bounds,
            "BufferView access out of bounds: offset {offset} + {size} > capacity {}",
            self.capacity
        );
    }

    #[inline]
    fn at(&self, offset: usize) -> *mut u8 {
        unsafe { self.ptr.as_ptr().add(offset) }
    }

    #[inline]
    fn atomic_i32(&self, offset: usize) -> &AtomicI32 {
        self.check(offset, 4);
        debug_assert!(offset % 4 == 0);
        unsafe { &*(self.at(offset) as *const AtomicI32) }
    }

    /// Acquire load; never observes a torn write.
    #[inline]
    pub fn get_i32_volatile(&self, offset: usize) -> i32 {
        self.atomic_i32(offset).load(Acquire)
    }

    /// Release store; every write made before it is visible to an acquiring reader.
    #[inline]
    pub fn put_i32_ordered(&self, offset: usize, value: i32) {
        self.atomic_i32(offset).store(value, Release)
    }

    #[inline]
    pub fn get_i32(&self, offset: usize) -> i32 {
        self.check(offset, 4);
        unsafe { ptr::read(self.at(offset) as *const i32) }
    }

    #[inline]
    pub fn put_i32(&self, offset: usize, value: i32) {
        self.check(offset, 4);
        unsafe { ptr::write(self.at(offset) as *mut i32, value) }
    }

    #[inline]
    pub fn get_u16(&self, offset: usize) -> u16 {
        self.check(offset, 2);
        unsafe { ptr::read(self.at(offset) as *const u16) }
    }

    #[inline]
    pub fn put_u16(&self, offset: usize, value: u16) {
        self.check(offset, 2);
        unsafe { ptr::write(self.at(offset) as *mut u16, value) }
    }

    #[inline]
    fn atomic_u8(&self, offset: usize) -> &AtomicU8 {
        self.check(offset, 1);
        unsafe { &*(self.at(offset) as *const AtomicU8) }
    }

    /// Flag bytes can be touched by consumers after commit, so they are always atomic.
    #[inline]
    pub fn get_u8_volatile(&self, offset: usize) -> u8 {
        self.atomic_u8(offset).load(Acquire)
    }

    #[inline]
    pub fn put_u8_ordered(&self, offset: usize, value: u8) {
        self.atomic_u8(offset).store(value, Release)
    }

    /// Atomically sets `bits`, returning the previous byte.
    #[inline]
    pub fn fetch_or_u8(&self, offset: usize, bits: u8) -> u8 {
        self.atomic_u8(offset).fetch_or(bits, AcqRel)
    }

    pub fn put_bytes(&self, offset: usize, src: &[u8]) {
        self.check(offset, src.len());
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), self.at(offset), src.len()) }
    }

    pub fn get_bytes(&self, offset: usize, dst: &mut [u8]) {
        self.check(offset, dst.len());
        unsafe { ptr::copy_nonoverlapping(self.at(offset), dst.as_mut_ptr(), dst.len()) }
    }

    /// Fill `len` bytes at `offset` with `value`.
    pub fn set_memory(&self, offset: usize, len: usize, value: u8) {
        self.check(offset, len);
        unsafe { ptr::write_bytes(self.at(offset), value, len) }
    }

    /// Borrow `len` bytes at `offset`.
    ///
    /// # Safety
    /// No other thread may write the non-atomic bytes of the range while the
    /// slice is alive. Committed frames satisfy this: after the length is
    /// published only the atomic flags byte changes.
    pub unsafe fn slice(&self, offset: usize, len: usize) -> &[u8] {
        self.check(offset, len);
        std::slice::from_raw_parts(self.at(offset), len)
    }

    /// Mutably borrow `len` bytes at `offset`.
    ///
    /// # Safety
    /// The caller must hold the only reference to the range, e.g. a reserved
    /// but not yet committed frame.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        self.check(offset, len);
        std::slice::from_raw_parts_mut(self.at(offset), len)
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }
}
