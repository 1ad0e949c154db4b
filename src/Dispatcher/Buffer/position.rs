// Positions pack (logical partition id, byte offset) into one ordered i64.

use crossbeam_utils::CachePadded;
use std::fmt;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Release};

pub const PARTITION_OFFSET_BITS: u32 = 32;
const PARTITION_OFFSET_MASK: i64 = (1 << PARTITION_OFFSET_BITS) - 1;

#[inline]
pub const fn position(partition_id: i32, partition_offset: usize) -> i64 {
    ((partition_id as i64) << PARTITION_OFFSET_BITS)
        | (partition_offset as i64 & PARTITION_OFFSET_MASK)
}

#[inline]
pub const fn partition_id(position: i64) -> i32 {
    (position >> PARTITION_OFFSET_BITS) as i32
}

#[inline]
pub const fn partition_offset(position: i64) -> usize {
    (position & PARTITION_OFFSET_MASK) as usize
}

/// Move `position` forward by `delta` bytes inside partitions of
/// `partition_size`, spilling into the next partition id on overflow.
#[inline]
pub fn advance(position_value: i64, delta: usize, partition_size: usize) -> i64 {
    let mut id = partition_id(position_value);
    let mut offset = partition_offset(position_value) + delta;
    if offset >= partition_size {
        id += 1;
        offset -= partition_size;
    }
    position(id, offset)
}

/// A shared position that readers can never observe going backwards once it
/// is only moved through [`AtomicPosition::propose_max_ordered`].
pub struct AtomicPosition {
    value: CachePadded<AtomicI64>,
}

impl AtomicPosition {
    pub fn new(initial: i64) -> Self {
        Self {
            value: CachePadded::new(AtomicI64::new(initial)),
        }
    }

    #[inline]
    pub fn get(&self) -> i64 {
        self.value.load(Acquire)
    }

    #[inline]
    pub fn set(&self, value: i64) {
        self.value.store(value, Release)
    }

    /// Store `value` only if it is larger than the current one.
    /// Returns whether the stored value changed.
    #[inline]
    pub fn propose_max_ordered(&self, value: i64) -> bool {
        self.value.fetch_max(value, AcqRel) < value
    }
}

impl fmt::Debug for AtomicPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self.get();
        write!(
            f,
            "AtomicPosition({value} = {}:{})",
            partition_id(value),
            partition_offset(value)
        )
    }
}
