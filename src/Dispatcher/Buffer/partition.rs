use crossbeam_utils::CachePadded;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Release};
use std::sync::atomic::{AtomicI32, AtomicU8, AtomicUsize};

use super::frame::{self, HEADER_LENGTH};
use crate::Core::view::BufferView;

const STATUS_CLEAN: u8 = 0;
const STATUS_NEEDS_CLEANING: u8 = 1;

/// Outcome of a tail counter reservation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Reservation {
    /// `[frame_offset, new_tail)` now belongs to the caller.
    Reserved { frame_offset: usize, new_tail: usize },
    /// This reservation crossed the end first: it wrote the terminal padding
    /// frame and the caller must rotate the active partition.
    PaddingAtEnd,
    /// The partition was already filled by an earlier reservation.
    Exhausted,
}

/// One fixed-size region of the log.
///
/// The tail counter is bumped optimistically with `fetch_add` before the frame
/// is written, so reserved-but-uncommitted frames read as length 0. A
/// successful reservation always leaves room for one header, so the terminal
/// padding frame always fits.
pub struct Partition {
    index: usize,
    data: BufferView,
    tail: CachePadded<AtomicUsize>,
    status: AtomicU8,
    // Logical id of the generation waiting to be zeroed.
    retired_id: AtomicI32,
}

impl Partition {
    pub fn new(index: usize, data: BufferView) -> Self {
        Self {
            index,
            data,
            tail: CachePadded::new(AtomicUsize::new(0)),
            status: AtomicU8::new(STATUS_CLEAN),
            retired_id: AtomicI32::new(-1),
        }
    }

    /// Physical index in the ring.
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.data.capacity()
    }

    #[inline]
    pub fn data(&self) -> &BufferView {
        &self.data
    }

    #[inline]
    pub fn tail_volatile(&self) -> usize {
        self.tail.load(Acquire)
    }

    /// Reserve `aligned_length` bytes at the tail.
    pub fn reserve(&self, aligned_length: usize) -> Reservation {
        let frame_offset = self.tail.fetch_add(aligned_length, AcqRel);
        let new_tail = frame_offset + aligned_length;
        if new_tail <= self.size() - HEADER_LENGTH {
            Reservation::Reserved {
                frame_offset,
                new_tail,
            }
        } else {
            self.on_end_of_partition(frame_offset)
        }
    }

    fn on_end_of_partition(&self, frame_offset: usize) -> Reservation {
        // Only the first reservation to cross the end starts at or below
        // size - HEADER_LENGTH; every later one starts past its new tail.
        if frame_offset + HEADER_LENGTH > self.size() {
            return Reservation::Exhausted;
        }
        frame::write_padding(&self.data, frame_offset, self.size() - frame_offset);
        Reservation::PaddingAtEnd
    }

    /// Mark the generation `retired_id` held by this partition for cleaning.
    pub fn mark_needs_cleaning(&self, retired_id: i32) {
        self.retired_id.store(retired_id, Release);
        self.status.store(STATUS_NEEDS_CLEANING, Release);
    }

    pub fn needs_cleaning(&self) -> bool {
        self.status.load(Acquire) == STATUS_NEEDS_CLEANING
    }

    /// Whether this partition is marked and a reader in partition
    /// `slowest_partition_id` can no longer reach the generation it holds.
    pub fn can_clean(&self, slowest_partition_id: i32) -> bool {
        self.needs_cleaning() && self.retired_id.load(Acquire) < slowest_partition_id
    }

    /// Zero the whole partition and reset its tail for reuse.
    ///
    /// Only called once no reader or writer can reach this partition: it is
    /// filled (every reservation fails) and every subscriber is past it.
    pub fn clean(&self) {
        self.data.set_memory(0, self.size(), 0);
        self.tail.store(0, Release);
        self.status.store(STATUS_CLEAN, Release);
    }
}
