// Zero-copy write handles over reserved, not yet committed frames.
//
// A handle is finished exactly once: `commit` and `abort` consume it, and
// dropping an unfinished handle aborts it, so a reserved slot never stays
// at length 0 and wedges the readers behind it.

use std::fmt;
use std::marker::PhantomData;

use crate::error::DispatcherError;
use crate::Core::view::BufferView;
use crate::Dispatcher::Buffer::frame::{
    self, FLAG_BATCH_BEGIN, FLAG_BATCH_END, HEADER_LENGTH, TYPE_MESSAGE, TYPE_PADDING,
};
use crate::Dispatcher::Buffer::position::position;

/// A single claimed fragment.
pub struct ClaimedFragment<'a> {
    buffer: BufferView,
    frame_offset: usize,
    length: usize,
    position: i64,
    finished: bool,
    _dispatcher: PhantomData<&'a ()>,
}

impl<'a> ClaimedFragment<'a> {
    pub(crate) fn new(buffer: BufferView, frame_offset: usize, length: usize, position: i64) -> Self {
        Self {
            buffer,
            frame_offset,
            length,
            position,
            finished: false,
            _dispatcher: PhantomData,
        }
    }

    /// The payload region, `len()` bytes, writable in place.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        // SAFETY: the range was reserved by this claim's tail counter bump and
        // no reader looks at it until the length is published.
        unsafe {
            self.buffer
                .slice_mut(frame::message_offset(self.frame_offset), self.length)
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.length
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Position right after this fragment once committed.
    #[inline]
    pub fn position(&self) -> i64 {
        self.position
    }

    pub fn stream_id(&self) -> i32 {
        frame::read_stream_id(&self.buffer, self.frame_offset)
    }

    /// Publish the fragment to subscribers.
    pub fn commit(mut self) {
        frame::commit_length(&self.buffer, self.frame_offset, frame::framed_length(self.length));
        self.finished = true;
    }

    /// Turn the fragment into padding: readers skip it and the position
    /// still advances past it.
    pub fn abort(mut self) {
        self.abort_in_place();
    }

    fn abort_in_place(&mut self) {
        self.buffer.put_u16(self.frame_offset + frame::TYPE_OFFSET, TYPE_PADDING);
        frame::commit_length(&self.buffer, self.frame_offset, frame::framed_length(self.length));
        self.finished = true;
    }
}

impl Drop for ClaimedFragment<'_> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(position = self.position, "claimed fragment dropped unfinished, aborting");
            self.abort_in_place();
        }
    }
}

impl fmt::Debug for ClaimedFragment<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClaimedFragment")
            .field("frame_offset", &self.frame_offset)
            .field("length", &self.length)
            .field("position", &self.position)
            .finish()
    }
}

/// Several fragments in one contiguous reservation, published together.
///
/// Every fragment after the first is committed as soon as it is laid out,
/// but stays invisible because readers stop at the first fragment, whose
/// length is published last on [`commit`](Self::commit).
pub struct ClaimedFragmentBatch<'a> {
    buffer: BufferView,
    partition_id: i32,
    batch_offset: usize,
    reserved_length: usize,
    next_offset: usize,
    first_framed_length: Option<usize>,
    current: Option<(usize, usize)>,
    fragment_count: usize,
    finished: bool,
    _dispatcher: PhantomData<&'a ()>,
}

impl<'a> ClaimedFragmentBatch<'a> {
    pub(crate) fn new(
        buffer: BufferView,
        partition_id: i32,
        batch_offset: usize,
        reserved_length: usize,
    ) -> Self {
        Self {
            buffer,
            partition_id,
            batch_offset,
            reserved_length,
            next_offset: 0,
            first_framed_length: None,
            current: None,
            fragment_count: 0,
            finished: false,
            _dispatcher: PhantomData,
        }
    }

    /// Payload bytes still available for one more fragment.
    pub fn remaining(&self) -> usize {
        // keep room for the trailing padding header
        let available = self.reserved_length - HEADER_LENGTH - self.next_offset;
        (available & !(frame::FRAME_ALIGNMENT - 1)).saturating_sub(HEADER_LENGTH)
    }

    pub fn fragment_count(&self) -> usize {
        self.fragment_count
    }

    /// Lay out the next fragment of `length` payload bytes and return the
    /// position right after it. Write it through [`fragment_mut`](Self::fragment_mut).
    pub fn next_fragment(&mut self, length: usize, stream_id: i32) -> Result<i64, DispatcherError> {
        let aligned = frame::aligned_length(length);
        let available = self.reserved_length - HEADER_LENGTH - self.next_offset;
        if aligned > available {
            return Err(DispatcherError::BatchCapacityExceeded {
                required: aligned,
                remaining: available,
            });
        }

        let frame_offset = self.batch_offset + self.next_offset;
        let framed = frame::framed_length(length);
        frame::write_frame_header(&self.buffer, frame_offset, TYPE_MESSAGE, 0, stream_id);
        if self.first_framed_length.is_none() {
            self.first_framed_length = Some(framed);
        } else {
            frame::commit_length(&self.buffer, frame_offset, framed);
        }

        self.current = Some((frame_offset, length));
        self.fragment_count += 1;
        self.next_offset += aligned;
        Ok(position(self.partition_id, self.batch_offset + self.next_offset))
    }

    /// Payload of the fragment laid out by the last `next_fragment` call;
    /// empty before the first one.
    pub fn fragment_mut(&mut self) -> &mut [u8] {
        match self.current {
            // SAFETY: inside this batch's reservation, unpublished.
            Some((frame_offset, length)) => unsafe {
                self.buffer.slice_mut(frame::message_offset(frame_offset), length)
            },
            None => &mut [],
        }
    }

    /// Position right after the whole reservation.
    pub fn position(&self) -> i64 {
        position(self.partition_id, self.batch_offset + self.reserved_length)
    }

    /// Publish every fragment at once. A batch without fragments is aborted.
    pub fn commit(mut self) {
        let (first_framed, (last_offset, _)) = match (self.first_framed_length, self.current) {
            (Some(first), Some(current)) => (first, current),
            _ => {
                self.abort_in_place();
                return;
            }
        };

        frame::set_flag(&self.buffer, self.batch_offset, FLAG_BATCH_BEGIN);
        frame::set_flag(&self.buffer, last_offset, FLAG_BATCH_END);
        frame::write_padding(
            &self.buffer,
            self.batch_offset + self.next_offset,
            self.reserved_length - self.next_offset,
        );
        frame::commit_length(&self.buffer, self.batch_offset, first_framed);
        self.finished = true;
    }

    /// Turn the whole reservation into one padding frame.
    pub fn abort(mut self) {
        self.abort_in_place();
    }

    fn abort_in_place(&mut self) {
        frame::write_padding(&self.buffer, self.batch_offset, self.reserved_length);
        self.finished = true;
    }
}

impl Drop for ClaimedFragmentBatch<'_> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(
                fragments = self.fragment_count,
                "claimed batch dropped unfinished, aborting"
            );
            self.abort_in_place();
        }
    }
}

impl fmt::Debug for ClaimedFragmentBatch<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClaimedFragmentBatch")
            .field("partition_id", &self.partition_id)
            .field("batch_offset", &self.batch_offset)
            .field("reserved_length", &self.reserved_length)
            .field("fragment_count", &self.fragment_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Dispatcher::Buffer::appender::batch_reservation_length;
    use crate::Dispatcher::Buffer::frame::{frame_status, read_flags, FrameStatus};

    fn view(mem: &mut [u64]) -> BufferView {
        unsafe { BufferView::new(mem.as_mut_ptr() as *mut u8, mem.len() * 8) }
    }

    fn claimed(buffer: BufferView, length: usize) -> ClaimedFragment<'static> {
        frame::write_frame_header(&buffer, 0, TYPE_MESSAGE, 0, 4);
        ClaimedFragment::new(buffer, 0, length, position(0, frame::aligned_length(length)))
    }

    #[test]
    fn commit_publishes_written_payload() {
        let mut mem = vec![0u64; 16];
        let buffer = view(&mut mem);
        let mut claim = claimed(buffer, 3);
        assert_eq!(frame_status(&buffer, 0), FrameStatus::Pending);

        claim.buffer_mut().copy_from_slice(b"xyz");
        assert_eq!(claim.stream_id(), 4);
        claim.commit();

        assert_eq!(
            frame_status(&buffer, 0),
            FrameStatus::Message {
                payload_length: 3,
                aligned_length: 16
            }
        );
    }

    #[test]
    fn abort_and_drop_leave_skippable_padding() {
        let mut mem = vec![0u64; 16];
        let buffer = view(&mut mem);
        claimed(buffer, 20).abort();
        assert_eq!(
            frame_status(&buffer, 0),
            FrameStatus::Padding { aligned_length: 32 }
        );

        let mut mem = vec![0u64; 16];
        let buffer = view(&mut mem);
        drop(claimed(buffer, 20));
        assert!(frame::is_padding(&buffer, 0));
    }

    #[test]
    fn batch_is_published_by_first_length() {
        let reserved = batch_reservation_length(2, 10);
        let mut mem = vec![0u64; reserved / 8];
        let buffer = view(&mut mem);
        let mut batch = ClaimedFragmentBatch::new(buffer, 0, 0, reserved);
        assert_eq!(batch.remaining(), 36);

        assert_eq!(batch.next_fragment(4, 1).unwrap(), position(0, 16));
        assert_eq!(batch.remaining(), 20);
        batch.fragment_mut().copy_from_slice(b"abcd");
        assert_eq!(batch.next_fragment(6, 2).unwrap(), position(0, 40));
        batch.fragment_mut().copy_from_slice(b"efghij");
        assert_eq!(frame_status(&buffer, 0), FrameStatus::Pending);

        batch.commit();
        assert!(frame::is_flag_set(read_flags(&buffer, 0), FLAG_BATCH_BEGIN));
        assert!(frame::is_flag_set(read_flags(&buffer, 16), FLAG_BATCH_END));
        assert_eq!(
            frame_status(&buffer, 40),
            FrameStatus::Padding {
                aligned_length: reserved - 40
            }
        );
    }

    #[test]
    fn batch_rejects_fragments_beyond_reservation() {
        let reserved = batch_reservation_length(1, 8);
        let mut mem = vec![0u64; reserved / 8];
        let buffer = view(&mut mem);
        let mut batch = ClaimedFragmentBatch::new(buffer, 0, 0, reserved);
        batch.next_fragment(8, 0).unwrap();

        let err = batch.next_fragment(64, 0).unwrap_err();
        assert!(matches!(err, DispatcherError::BatchCapacityExceeded { required: 80, .. }));
        batch.abort();
        assert_eq!(
            frame_status(&buffer, 0),
            FrameStatus::Padding {
                aligned_length: reserved
            }
        );
    }

    #[test]
    fn empty_batch_commit_becomes_padding() {
        let reserved = batch_reservation_length(1, 0);
        let mut mem = vec![0u64; reserved / 8];
        let buffer = view(&mut mem);
        ClaimedFragmentBatch::new(buffer, 0, 0, reserved).commit();
        assert!(frame::is_padding(&buffer, 0));
    }
}
