use crate::Core::Storage::{HeapStorage, MappedFileStorage, StorageBackend};
use std::fs::File;
use std::io;

/// Where the bytes of a log buffer come from.
#[derive(Debug, Default)]
pub enum Allocation {
    /// Anonymous, zeroed heap memory.
    #[default]
    Heap,
    /// A shared memory map over a caller-supplied file that is already large enough.
    MappedFile(File),
}

/// Allocate `required_capacity` contiguous bytes from the requested backend.
///
/// Heap capacity is rounded up to a multiple of 128 bytes, the same stride the
/// region itself is aligned to. A mapped file is mapped at exactly
/// `required_capacity`, so a file presized to that length is enough.
pub fn allocate(
    required_capacity: usize,
    allocation: Allocation,
) -> io::Result<Box<dyn StorageBackend>> {
    if required_capacity == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "allocate(): required capacity must be greater than zero",
        ));
    }

    let storage: Box<dyn StorageBackend> = match allocation {
        Allocation::Heap => Box::new(HeapStorage::allocate((required_capacity + 127) & !127)?),
        Allocation::MappedFile(file) => Box::new(
            MappedFileStorage::map(file, required_capacity).map_err(|e| {
                io::Error::new(
                    e.kind(),
                    format!(
                        "Failed to map log buffer file:\n\
                    ├─ Required size: {required_capacity}\n\
                    ╰─ Error: {e}"
                    ),
                )
            })?,
        ),
    };

    tracing::debug!(
        size = storage.size(),
        file_backed = storage.is_file_backed(),
        "allocated log buffer storage"
    );
    Ok(storage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_allocation_rounds_up_to_stride() {
        let storage = allocate(1000, Allocation::Heap).unwrap();
        assert_eq!(storage.size(), 1024);
        assert!(!storage.is_file_backed());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let err = allocate(0, Allocation::Heap).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn mapped_allocation_requires_presized_file() {
        let file = tempfile::tempfile().unwrap();
        let err = allocate(4096, Allocation::MappedFile(file)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        let file = tempfile::tempfile().unwrap();
        file.set_len(4096).unwrap();
        let storage = allocate(4096, Allocation::MappedFile(file)).unwrap();
        assert!(storage.is_file_backed());
        assert_eq!(storage.size(), 4096);
    }

    #[test]
    fn mapped_allocation_is_not_rounded() {
        let file = tempfile::tempfile().unwrap();
        file.set_len(3000).unwrap();
        let storage = allocate(3000, Allocation::MappedFile(file)).unwrap();
        assert_eq!(storage.size(), 3000);
    }
}
