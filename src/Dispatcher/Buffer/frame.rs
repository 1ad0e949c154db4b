// On-buffer layout of a single frame and the pure functions reading/writing it.
//
//  0               4       5       6               8               12
//  +---------------+-------+-------+---------------+---------------+---------
//  | length (i32)  |version| flags |  type (u16)   | stream id(i32)| payload
//  +---------------+-------+-------+---------------+---------------+---------
//
// `length` is the framed length (header + payload, unaligned). 0 means the
// slot is reserved but not yet committed; it is published last with a
// release store. Frames start on FRAME_ALIGNMENT boundaries and readers
// always advance by the aligned framed length.

use crate::Core::view::BufferView;

pub const FRAME_ALIGNMENT: usize = 8;

pub const LENGTH_OFFSET: usize = 0;
pub const VERSION_OFFSET: usize = 4;
pub const FLAGS_OFFSET: usize = 5;
pub const TYPE_OFFSET: usize = 6;
pub const STREAM_ID_OFFSET: usize = 8;
pub const HEADER_LENGTH: usize = STREAM_ID_OFFSET + 4;

pub const FRAME_VERSION: u8 = 0;

pub const TYPE_MESSAGE: u16 = 0;
pub const TYPE_PADDING: u16 = 1;

/// Set by a consumer on a committed fragment it failed to process.
pub const FLAG_FAILED: u8 = 0b0010_0000;
/// Last fragment of a claimed batch.
pub const FLAG_BATCH_END: u8 = 0b0100_0000;
/// First fragment of a claimed batch.
pub const FLAG_BATCH_BEGIN: u8 = 0b1000_0000;

#[inline]
pub const fn align(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Header plus payload, unaligned.
#[inline]
pub const fn framed_length(payload_length: usize) -> usize {
    payload_length + HEADER_LENGTH
}

/// Bytes a frame with this payload occupies in the partition.
#[inline]
pub const fn aligned_length(payload_length: usize) -> usize {
    align(framed_length(payload_length), FRAME_ALIGNMENT)
}

/// Bytes occupied by a frame whose header stores `framed` as its length.
#[inline]
pub const fn aligned_framed_length(framed: usize) -> usize {
    align(framed, FRAME_ALIGNMENT)
}

#[inline]
pub const fn message_offset(frame_offset: usize) -> usize {
    frame_offset + HEADER_LENGTH
}

#[inline]
pub fn is_flag_set(flags: u8, flag: u8) -> bool {
    flags & flag == flag
}

/// What a reader finds at a frame offset.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FrameStatus {
    /// Nothing committed here yet; stop reading.
    Pending,
    /// Skip `aligned_length` bytes.
    Padding { aligned_length: usize },
    /// A readable fragment.
    Message {
        payload_length: usize,
        aligned_length: usize,
    },
}

/// Write every header field except the length, which stays 0 until commit.
pub fn write_frame_header(
    buffer: &BufferView,
    frame_offset: usize,
    frame_type: u16,
    flags: u8,
    stream_id: i32,
) {
    buffer.put_u8_ordered(frame_offset + VERSION_OFFSET, FRAME_VERSION);
    buffer.put_u8_ordered(frame_offset + FLAGS_OFFSET, flags);
    buffer.put_u16(frame_offset + TYPE_OFFSET, frame_type);
    buffer.put_i32(frame_offset + STREAM_ID_OFFSET, stream_id);
}

/// Publish a frame: every byte written before this call becomes visible to
/// readers that observe the new length.
#[inline]
pub fn commit_length(buffer: &BufferView, frame_offset: usize, framed: usize) {
    buffer.put_i32_ordered(frame_offset + LENGTH_OFFSET, framed as i32);
}

/// Acquire-load the stored length.
#[inline]
pub fn read_length(buffer: &BufferView, frame_offset: usize) -> i32 {
    buffer.get_i32_volatile(frame_offset + LENGTH_OFFSET)
}

#[inline]
pub fn read_type(buffer: &BufferView, frame_offset: usize) -> u16 {
    buffer.get_u16(frame_offset + TYPE_OFFSET)
}

#[inline]
pub fn read_flags(buffer: &BufferView, frame_offset: usize) -> u8 {
    buffer.get_u8_volatile(frame_offset + FLAGS_OFFSET)
}

#[inline]
pub fn read_stream_id(buffer: &BufferView, frame_offset: usize) -> i32 {
    buffer.get_i32(frame_offset + STREAM_ID_OFFSET)
}

#[inline]
pub fn is_padding(buffer: &BufferView, frame_offset: usize) -> bool {
    read_type(buffer, frame_offset) == TYPE_PADDING
}

/// Atomically add `flag` to a committed frame.
#[inline]
pub fn set_flag(buffer: &BufferView, frame_offset: usize, flag: u8) {
    buffer.fetch_or_u8(frame_offset + FLAGS_OFFSET, flag);
}

/// Classify the frame at `frame_offset`.
pub fn frame_status(buffer: &BufferView, frame_offset: usize) -> FrameStatus {
    let length = read_length(buffer, frame_offset);
    if length <= 0 {
        return FrameStatus::Pending;
    }
    let framed = length as usize;
    let aligned_length = aligned_framed_length(framed);
    if is_padding(buffer, frame_offset) {
        FrameStatus::Padding { aligned_length }
    } else {
        FrameStatus::Message {
            payload_length: framed - HEADER_LENGTH,
            aligned_length,
        }
    }
}

/// Turn `[frame_offset, frame_offset + length)` into one committed padding frame.
pub fn write_padding(buffer: &BufferView, frame_offset: usize, length: usize) {
    debug_assert!(length >= HEADER_LENGTH);
    debug_assert!(length % FRAME_ALIGNMENT == 0);
    write_frame_header(buffer, frame_offset, TYPE_PADDING, 0, 0);
    commit_length(buffer, frame_offset, length);
}
