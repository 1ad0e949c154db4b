// Storage backends for the log buffer.
// Heap memory for in-process use, or a memory map over a caller-supplied file.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt::Debug;
use std::fs::File;
use std::io;
use std::ptr::NonNull;

use memmap2::MmapMut;

/// Alignment of every storage region. Matches a cache line pair so partition
/// starts never share a line with foreign data.
pub const STORAGE_ALIGNMENT: usize = 128;

/// A contiguous, writable byte region backing a log buffer.
pub trait StorageBackend: Send + Sync + Debug {
    /// Get a pointer to the start of the region.
    fn as_ptr(&self) -> *mut u8;

    /// Get the size of the region in bytes.
    fn size(&self) -> usize;

    /// Whether the region is backed by a real file rather than anonymous memory.
    fn is_file_backed(&self) -> bool;
}

/// Zeroed heap memory, aligned to [`STORAGE_ALIGNMENT`].
#[derive(Debug)]
pub struct HeapStorage {
    ptr: NonNull<u8>,
    layout: Layout,
}

unsafe impl Send for HeapStorage {}
unsafe impl Sync for HeapStorage {}

impl HeapStorage {
    pub fn allocate(size: usize) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "HeapStorage::allocate(): size must be greater than zero",
            ));
        }
        let layout = Layout::from_size_align(size, STORAGE_ALIGNMENT)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::OutOfMemory,
                format!("Failed to allocate {size} bytes of heap storage"),
            )
        })?;

        Ok(Self { ptr, layout })
    }
}

impl Drop for HeapStorage {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl StorageBackend for HeapStorage {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn size(&self) -> usize {
        self.layout.size()
    }

    fn is_file_backed(&self) -> bool {
        false
    }
}

/// A shared, writable memory map over a pre-sized file.
///
/// The file is never created, truncated or grown here; the caller hands in a
/// file that is already at least as large as the requested region. The region
/// is zeroed on mapping so stale bytes can never be mistaken for frames.
pub struct MappedFileStorage {
    _mmap: MmapMut,
    ptr: NonNull<u8>,
    size: usize,
    _file: File,
}

unsafe impl Send for MappedFileStorage {}
unsafe impl Sync for MappedFileStorage {}

impl Debug for MappedFileStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFileStorage")
            .field("ptr", &format_args!("{:p}", self.ptr))
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl MappedFileStorage {
    pub fn map(file: File, size: usize) -> io::Result<Self> {
        let file_size = file.metadata()?.len() as usize;
        if file_size < size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "Mapped file too small: expected at least {size} bytes, got {file_size}"
                ),
            ));
        }

        let mut mmap = unsafe { memmap2::MmapOptions::new().len(size).map_mut(&file)? };
        mmap.fill(0);
        let ptr = NonNull::new(mmap.as_mut_ptr()).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "Memory map returned a null pointer")
        })?;

        Ok(Self {
            _mmap: mmap,
            ptr,
            size,
            _file: file,
        })
    }
}

impl StorageBackend for MappedFileStorage {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn size(&self) -> usize {
        self.size
    }

    fn is_file_backed(&self) -> bool {
        true
    }
}
