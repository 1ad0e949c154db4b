// Consumer side: a subscription owns a position cursor into the log and
// reads forward from it up to a limit it derives from the dispatcher.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use super::block_peek::BlockPeek;
use super::dispatcher::DispatcherContext;
use super::handler::{Fragment, FragmentHandler, FragmentOutcome};
use crate::Core::view::BufferView;
use crate::Dispatcher::Buffer::frame::{self, FrameStatus, FLAG_BATCH_BEGIN, FLAG_BATCH_END, FLAG_FAILED};
use crate::Dispatcher::Buffer::position::{partition_id, partition_offset, position, AtomicPosition};

const STATE_OPEN: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubscriptionStatus {
    Open,
    /// Removed from the dispatcher; reads in flight may still finish.
    Closing,
    Closed,
}

/// The part of a subscription the dispatcher shares: identity and position.
pub struct SubscriptionState {
    id: usize,
    name: String,
    position: AtomicPosition,
    state: AtomicU8,
}

impl SubscriptionState {
    pub(crate) fn new(id: usize, name: String, initial_position: i64) -> Self {
        Self {
            id,
            name,
            position: AtomicPosition::new(initial_position),
            state: AtomicU8::new(STATE_OPEN),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn position(&self) -> i64 {
        self.position.get()
    }

    #[inline]
    pub(crate) fn set_position(&self, value: i64) {
        self.position.set(value);
    }

    pub fn status(&self) -> SubscriptionStatus {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => SubscriptionStatus::Open,
            STATE_CLOSING => SubscriptionStatus::Closing,
            _ => SubscriptionStatus::Closed,
        }
    }

    pub(crate) fn set_closing(&self) {
        let _ = self.state.compare_exchange(
            STATE_OPEN,
            STATE_CLOSING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub(crate) fn set_closed(&self) {
        self.state.store(STATE_CLOSED, Ordering::Release);
    }

    #[inline]
    fn is_open(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_OPEN
    }
}

impl fmt::Debug for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionState")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("position", &self.position)
            .field("status", &self.status())
            .finish()
    }
}

/// Where a subscription's readable range ends.
pub(crate) enum ReadLimit {
    /// Everything published so far.
    Publisher,
    /// Whatever the previous pipeline stage has consumed.
    Predecessor(Arc<SubscriptionState>),
}

/// A consumer handle. Single owner: every read takes `&mut self`.
pub struct Subscription {
    context: Arc<DispatcherContext>,
    state: Arc<SubscriptionState>,
    limit: ReadLimit,
}

impl Subscription {
    pub(crate) fn new(
        context: Arc<DispatcherContext>,
        state: Arc<SubscriptionState>,
        limit: ReadLimit,
    ) -> Self {
        Self {
            context,
            state,
            limit,
        }
    }

    pub fn id(&self) -> usize {
        self.state.id()
    }

    pub fn name(&self) -> &str {
        self.state.name()
    }

    /// Position of the next unread byte.
    pub fn position(&self) -> i64 {
        self.state.position()
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.state.status()
    }

    pub fn is_closed(&self) -> bool {
        !self.readable()
    }

    pub(crate) fn state(&self) -> &Arc<SubscriptionState> {
        &self.state
    }

    /// Highest position this subscription may read up to right now.
    pub fn limit(&self) -> i64 {
        match &self.limit {
            ReadLimit::Publisher => self.context.publisher_position(),
            ReadLimit::Predecessor(previous) => previous.position(),
        }
    }

    /// Whether there may be something to read.
    pub fn has_available(&self) -> bool {
        self.readable() && self.limit() > self.position()
    }

    #[inline]
    fn readable(&self) -> bool {
        self.state.is_open() && !self.context.is_closed()
    }

    /// Hand up to `max_fragments` fragments to `handler`, consuming each one
    /// whatever the handler returns. Returns the number of fragments read.
    ///
    /// A panicking handler does not stop the scan: the panic is logged, the
    /// fragment is flagged failed and reading continues after it.
    pub fn poll<H>(&mut self, handler: &mut H, max_fragments: usize) -> usize
    where
        H: FragmentHandler + ?Sized,
    {
        self.read_fragments(handler, max_fragments, false)
    }

    /// Like [`poll`](Self::poll), but a [`FragmentOutcome::Postpone`] stops
    /// the scan at that fragment, leaving it for the next call.
    pub fn peek_and_consume<H>(&mut self, handler: &mut H, max_fragments: usize) -> usize
    where
        H: FragmentHandler + ?Sized,
    {
        self.read_fragments(handler, max_fragments, true)
    }

    fn read_fragments<H>(&mut self, handler: &mut H, max_fragments: usize, honor_postpone: bool) -> usize
    where
        H: FragmentHandler + ?Sized,
    {
        if !self.readable() {
            return 0;
        }

        let log_buffer = self.context.log_buffer();
        let partition_size = log_buffer.partition_size();
        let limit = self.limit();
        let start = self.state.position();
        let mut current_id = partition_id(start);
        let mut offset = partition_offset(start);
        let mut fragments_read = 0;

        while fragments_read < max_fragments && position(current_id, offset) < limit {
            let buffer = log_buffer.partition(current_id).data();
            match frame::frame_status(buffer, offset) {
                FrameStatus::Pending => break,
                FrameStatus::Padding { aligned_length } => {
                    offset += aligned_length;
                    if offset >= partition_size {
                        current_id += 1;
                        offset = 0;
                    }
                }
                FrameStatus::Message {
                    payload_length,
                    aligned_length,
                } => {
                    let next_position = position(current_id, offset + aligned_length);
                    // SAFETY: committed frame ahead of our position; nothing
                    // rewrites it until every subscriber has passed it.
                    let payload = unsafe { buffer.slice(frame::message_offset(offset), payload_length) };
                    let fragment = Fragment::new(
                        payload,
                        frame::read_stream_id(buffer, offset),
                        frame::read_flags(buffer, offset),
                        next_position,
                    );

                    let outcome = match panic::catch_unwind(AssertUnwindSafe(|| handler.on_fragment(&fragment))) {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            tracing::error!(
                                subscription = self.state.name(),
                                position = next_position,
                                "fragment handler panicked, marking fragment failed"
                            );
                            FragmentOutcome::Failed
                        }
                    };

                    match outcome {
                        FragmentOutcome::Postpone if honor_postpone => break,
                        FragmentOutcome::Failed => frame::set_flag(buffer, offset, FLAG_FAILED),
                        FragmentOutcome::Consume | FragmentOutcome::Postpone => {}
                    }
                    offset += aligned_length;
                    fragments_read += 1;
                }
            }
        }

        let end = position(current_id, offset);
        if end != start {
            self.state.set_position(end);
        }
        fragments_read
    }

    /// Peek a block of contiguous committed fragments of at most
    /// `max_block_size` bytes.
    ///
    /// With `stream_aware` the block stops before the first fragment whose
    /// stream id differs from the first one. Batches are never split: a batch
    /// that does not fit ends the block before it, unless it is the first
    /// thing in the block, in which case it is returned alone. A single
    /// fragment larger than `max_block_size` is likewise returned alone.
    ///
    /// Padding at the current position is consumed as a side effect.
    pub fn peek_block(&mut self, max_block_size: usize, stream_aware: bool) -> Option<BlockPeek<'_>> {
        if !self.readable() {
            return None;
        }

        let log_buffer = self.context.log_buffer();
        let partition_size = log_buffer.partition_size();
        let limit = self.limit();
        let start = self.state.position();
        let mut current_id = partition_id(start);
        let mut offset = partition_offset(start);

        // skip padding in front of the block
        while position(current_id, offset) < limit {
            let buffer = log_buffer.partition(current_id).data();
            match frame::frame_status(buffer, offset) {
                FrameStatus::Padding { aligned_length } => {
                    offset += aligned_length;
                    if offset >= partition_size {
                        current_id += 1;
                        offset = 0;
                    }
                }
                _ => break,
            }
        }
        if position(current_id, offset) != start {
            self.state.set_position(position(current_id, offset));
        }

        let buffer = *log_buffer.partition(current_id).data();
        let block_offset = offset;
        let mut scan = offset;
        let mut first_stream_id = None;

        while position(current_id, scan) < limit {
            let aligned_length = match frame::frame_status(&buffer, scan) {
                FrameStatus::Message { aligned_length, .. } => aligned_length,
                FrameStatus::Pending | FrameStatus::Padding { .. } => break,
            };

            let stream_id = frame::read_stream_id(&buffer, scan);
            if stream_aware && first_stream_id.map_or(false, |first| first != stream_id) {
                break;
            }

            let flags = frame::read_flags(&buffer, scan);
            let unit_length = if frame::is_flag_set(flags, FLAG_BATCH_BEGIN) {
                match batch_length(&buffer, scan) {
                    Some(length) => length,
                    None => break,
                }
            } else {
                aligned_length
            };

            if position(current_id, scan + unit_length) > limit {
                break;
            }
            let block_length = scan - block_offset;
            if block_length > 0 && block_length + unit_length > max_block_size {
                break;
            }

            first_stream_id.get_or_insert(stream_id);
            scan += unit_length;
        }

        let block_length = scan - block_offset;
        if block_length == 0 {
            return None;
        }
        Some(BlockPeek::new(&self.state, buffer, current_id, block_offset, block_length))
    }
}

/// Bytes from a BATCH_BEGIN fragment through its BATCH_END fragment, or
/// `None` if the batch is not fully readable.
fn batch_length(buffer: &BufferView, batch_offset: usize) -> Option<usize> {
    let mut offset = batch_offset;
    loop {
        match frame::frame_status(buffer, offset) {
            FrameStatus::Message { aligned_length, .. } => {
                let flags = frame::read_flags(buffer, offset);
                offset += aligned_length;
                if frame::is_flag_set(flags, FLAG_BATCH_END) {
                    return Some(offset - batch_offset);
                }
            }
            FrameStatus::Pending | FrameStatus::Padding { .. } => return None,
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        crate::Debug::StructDebug::debug_subscription(self, f)
    }
}
