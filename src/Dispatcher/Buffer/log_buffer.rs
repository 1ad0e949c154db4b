// Fixed ring of partitions over one storage region.
//
// Logical partition ids grow without bound; the physical partition for id `n`
// is `n % partition_count`. Rotating from `n` to `n + 1` marks `n + 2` for
// cleaning, which is the partition that will become active next. The old
// generation it holds is only zeroed once every reader has left it.

use crossbeam_utils::CachePadded;
use std::fmt;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering::{AcqRel, Acquire};

use super::partition::Partition;
use crate::Core::view::BufferView;
use crate::Core::Storage::StorageBackend;

pub struct LogBuffer {
    partitions: Box<[Partition]>,
    partition_size: usize,
    active_partition_id: CachePadded<AtomicI32>,
    // Dropped last: every partition view points into it.
    storage: Box<dyn StorageBackend>,
}

impl LogBuffer {
    /// Split `storage` into `partition_count` partitions of `partition_size`.
    ///
    /// `storage` must hold at least `partition_count * partition_size` bytes
    /// and `partition_size` must be a multiple of the frame alignment.
    pub fn new(
        storage: Box<dyn StorageBackend>,
        partition_count: usize,
        partition_size: usize,
    ) -> Self {
        assert!(
            storage.size() >= partition_count * partition_size,
            "storage of {} bytes cannot hold {partition_count} partitions of {partition_size} bytes",
            storage.size()
        );
        // SAFETY: the backend owns `size()` writable bytes, aligned to
        // STORAGE_ALIGNMENT, and lives as long as `self`.
        let whole = unsafe { BufferView::new(storage.as_ptr(), storage.size()) };
        let partitions = (0..partition_count)
            .map(|i| Partition::new(i, whole.slice_view(i * partition_size, partition_size)))
            .collect();

        Self {
            partitions,
            partition_size,
            active_partition_id: CachePadded::new(AtomicI32::new(0)),
            storage,
        }
    }

    #[inline]
    pub fn partition_size(&self) -> usize {
        self.partition_size
    }

    #[inline]
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_file_backed(&self) -> bool {
        self.storage.is_file_backed()
    }

    /// Resolve a logical partition id to its physical partition.
    #[inline]
    pub fn partition(&self, id: i32) -> &Partition {
        &self.partitions[id as usize % self.partitions.len()]
    }

    #[inline]
    pub fn active_partition_id(&self) -> i32 {
        self.active_partition_id.load(Acquire)
    }

    /// Rotate production from `filled_id` to the next partition.
    ///
    /// Called only by the producer that wrote the terminal padding of
    /// `filled_id`. Returns false if the active partition had already moved.
    pub fn on_active_partition_filled(&self, filled_id: i32) -> bool {
        let next_id = filled_id + 1;
        // Marked before the rotation is published so the conductor sees it
        // no later than any producer sees the new active partition.
        let retired_id = next_id + 1 - self.partitions.len() as i32;
        self.partition(next_id + 1).mark_needs_cleaning(retired_id);
        let rotated = self
            .active_partition_id
            .compare_exchange(filled_id, next_id, AcqRel, Acquire)
            .is_ok();
        if rotated {
            tracing::debug!(
                filled = filled_id,
                active = next_id,
                "rotated active partition"
            );
        }
        rotated
    }

    /// Zero every marked partition whose old generation lies behind
    /// `slowest_partition_id`, the partition of the slowest reader. Returns
    /// how many were cleaned.
    pub fn clean_partitions(&self, slowest_partition_id: i32) -> usize {
        let mut cleaned = 0;
        for partition in self.partitions.iter() {
            if partition.can_clean(slowest_partition_id) {
                partition.clean();
                cleaned += 1;
                tracing::debug!(partition = partition.index(), "cleaned partition");
            } else if partition.needs_cleaning() {
                tracing::trace!(
                    partition = partition.index(),
                    slowest = slowest_partition_id,
                    "cleaning deferred, a reader is still behind"
                );
            }
        }
        cleaned
    }
}

impl fmt::Debug for LogBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogBuffer")
            .field("partition_count", &self.partition_count())
            .field("partition_size", &self.partition_size)
            .field("active_partition_id", &self.active_partition_id())
            .field("storage", &self.storage)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Core::alloc::{allocate, Allocation};
    use crate::Dispatcher::Buffer::partition::Reservation;

    fn log_buffer(partition_size: usize) -> LogBuffer {
        let storage = allocate(3 * partition_size, Allocation::Heap).unwrap();
        LogBuffer::new(storage, 3, partition_size)
    }

    #[test]
    fn logical_ids_wrap_onto_physical_partitions() {
        let log = log_buffer(1024);
        assert_eq!(log.partition(0).index(), 0);
        assert_eq!(log.partition(2).index(), 2);
        assert_eq!(log.partition(3).index(), 0);
        assert_eq!(log.partition(7).index(), 1);
    }

    #[test]
    fn partitions_do_not_overlap() {
        let log = log_buffer(1024);
        let first = log.partition(0).data().as_ptr() as usize;
        let second = log.partition(1).data().as_ptr() as usize;
        assert_eq!(second - first, 1024);
        assert_eq!(log.partition(1).size(), 1024);
    }

    #[test]
    fn rotation_marks_partition_after_next_for_cleaning() {
        let log = log_buffer(1024);
        assert_eq!(log.active_partition_id(), 0);

        assert!(log.on_active_partition_filled(0));
        assert_eq!(log.active_partition_id(), 1);
        assert!(log.partition(2).needs_cleaning());
        assert!(!log.partition(1).needs_cleaning());

        // a stale rotation does nothing
        assert!(!log.on_active_partition_filled(0));
        assert_eq!(log.active_partition_id(), 1);
    }

    #[test]
    fn cleaning_makes_a_filled_partition_reusable() {
        let log = log_buffer(1024);
        let p0 = log.partition(0);
        assert!(matches!(p0.reserve(1024), Reservation::PaddingAtEnd));
        log.on_active_partition_filled(0);
        log.on_active_partition_filled(1);
        assert!(p0.needs_cleaning());

        assert_eq!(log.clean_partitions(1), 2);
        assert_eq!(p0.tail_volatile(), 0);
        assert!(matches!(p0.reserve(16), Reservation::Reserved { frame_offset: 0, .. }));
        assert_eq!(log.clean_partitions(1), 0);
    }

    #[test]
    fn cleaning_waits_for_the_slowest_reader() {
        let log = log_buffer(1024);
        log.on_active_partition_filled(0);
        log.on_active_partition_filled(1);
        log.on_active_partition_filled(2);
        // rotating 2 -> 3 marks physical 1, which still holds generation 1
        assert!(log.partition(4).needs_cleaning());

        // a reader in 0 only releases the empty generation -1 (physical 2)
        assert_eq!(log.clean_partitions(0), 1);
        assert!(log.partition(3).needs_cleaning());
        // a reader in 1 releases generation 0 but not 1
        assert_eq!(log.clean_partitions(1), 1);
        assert!(!log.partition(3).needs_cleaning());
        assert!(log.partition(4).needs_cleaning());

        assert_eq!(log.clean_partitions(2), 1);
        assert!(!log.partition(4).needs_cleaning());
    }
}
