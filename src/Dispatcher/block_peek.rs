use std::fmt;
use std::marker::PhantomData;

use super::handler::Fragment;
use super::subscription::SubscriptionState;
use crate::Core::view::BufferView;
use crate::Dispatcher::Buffer::frame::{self, FrameStatus, FLAG_FAILED};
use crate::Dispatcher::Buffer::position::position;

/// A contiguous run of committed fragments handed out by
/// [`Subscription::peek_block`](super::Subscription::peek_block).
///
/// The subscription position moves only when the block is marked. Dropping
/// an unmarked block leaves the position where it was, so the same block is
/// delivered again by the next peek.
pub struct BlockPeek<'a> {
    state: &'a SubscriptionState,
    buffer: BufferView,
    partition_id: i32,
    block_offset: usize,
    block_length: usize,
    stream_id: i32,
    // Borrows the subscription mutably: one outstanding block at a time.
    _subscription: PhantomData<&'a mut ()>,
}

impl<'a> BlockPeek<'a> {
    pub(crate) fn new(
        state: &'a SubscriptionState,
        buffer: BufferView,
        partition_id: i32,
        block_offset: usize,
        block_length: usize,
    ) -> Self {
        let stream_id = frame::read_stream_id(&buffer, block_offset);
        Self {
            state,
            buffer,
            partition_id,
            block_offset,
            block_length,
            stream_id,
            _subscription: PhantomData,
        }
    }

    /// Raw bytes of the block: frame headers, payloads and alignment.
    pub fn buffer(&self) -> &[u8] {
        // SAFETY: every frame in the range is committed and the subscription
        // has not moved past it, so nothing writes here except flag bits.
        unsafe { self.buffer.slice(self.block_offset, self.block_length) }
    }

    #[inline]
    pub fn block_length(&self) -> usize {
        self.block_length
    }

    /// Stream id of the first fragment in the block.
    #[inline]
    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    /// Position of the first byte of the block.
    pub fn start_position(&self) -> i64 {
        position(self.partition_id, self.block_offset)
    }

    /// Position the subscription moves to once the block is marked.
    pub fn end_position(&self) -> i64 {
        position(self.partition_id, self.block_offset + self.block_length)
    }

    /// Iterate the fragments in the block.
    pub fn fragments(&self) -> BlockFragments<'_> {
        BlockFragments {
            buffer: &self.buffer,
            partition_id: self.partition_id,
            offset: self.block_offset,
            end: self.block_offset + self.block_length,
        }
    }

    /// Consume the block: the subscription moves past it.
    pub fn mark_completed(self) {
        self.state.set_position(self.end_position());
    }

    /// Flag every fragment in the block failed, then consume it.
    pub fn mark_failed(self) {
        let mut offset = self.block_offset;
        let end = self.block_offset + self.block_length;
        while offset < end {
            frame::set_flag(&self.buffer, offset, FLAG_FAILED);
            let framed = frame::read_length(&self.buffer, offset) as usize;
            offset += frame::aligned_framed_length(framed);
        }
        tracing::debug!(
            subscription = self.state.name(),
            position = self.start_position(),
            length = self.block_length,
            "block marked failed"
        );
        self.mark_completed();
    }
}

impl fmt::Debug for BlockPeek<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockPeek")
            .field("subscription", &self.state.name())
            .field("start_position", &self.start_position())
            .field("block_length", &self.block_length)
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

/// Iterator over the fragments of a [`BlockPeek`].
pub struct BlockFragments<'a> {
    buffer: &'a BufferView,
    partition_id: i32,
    offset: usize,
    end: usize,
}

impl<'a> Iterator for BlockFragments<'a> {
    type Item = Fragment<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.end {
            return None;
        }
        let frame_offset = self.offset;
        match frame::frame_status(self.buffer, frame_offset) {
            FrameStatus::Message {
                payload_length,
                aligned_length,
            } => {
                self.offset += aligned_length;
                // SAFETY: committed frame inside the peeked block.
                let payload = unsafe {
                    self.buffer
                        .slice(frame::message_offset(frame_offset), payload_length)
                };
                Some(Fragment::new(
                    payload,
                    frame::read_stream_id(self.buffer, frame_offset),
                    frame::read_flags(self.buffer, frame_offset),
                    position(self.partition_id, self.offset),
                ))
            }
            // a block never contains padding or uncommitted frames
            FrameStatus::Padding { .. } | FrameStatus::Pending => None,
        }
    }
}
