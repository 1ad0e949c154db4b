// Frame writes into space already reserved through a partition's tail.
//
// An appended frame gets its header and payload first and the length last.
// Claims stop before the length store and leave it to the claim handle.

use super::frame::{self, HEADER_LENGTH, TYPE_MESSAGE};
use crate::Core::view::BufferView;

/// Bytes a batch of `fragment_count` fragments with `batch_length` payload
/// bytes in total reserves. Each fragment may need a header plus alignment,
/// and one trailing header is left for the padding that fills the unused
/// remainder on commit.
#[inline]
pub const fn batch_reservation_length(fragment_count: usize, batch_length: usize) -> usize {
    frame::align(
        batch_length + fragment_count * (HEADER_LENGTH + frame::FRAME_ALIGNMENT) + HEADER_LENGTH,
        frame::FRAME_ALIGNMENT,
    )
}

/// Copy `payload` into the frame reserved at `frame_offset` and commit it.
pub fn write_frame(buffer: &BufferView, frame_offset: usize, payload: &[u8], stream_id: i32) {
    frame::write_frame_header(buffer, frame_offset, TYPE_MESSAGE, 0, stream_id);
    buffer.put_bytes(frame::message_offset(frame_offset), payload);
    frame::commit_length(buffer, frame_offset, frame::framed_length(payload.len()));
}

/// Write the header of a claimed frame. The frame stays invisible until the
/// claim handle commits or aborts it.
pub fn write_claim_header(buffer: &BufferView, frame_offset: usize, stream_id: i32) {
    frame::write_frame_header(buffer, frame_offset, TYPE_MESSAGE, 0, stream_id);
}
