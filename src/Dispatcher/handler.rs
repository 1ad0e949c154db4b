use crate::Dispatcher::Buffer::frame::{self, FLAG_BATCH_BEGIN, FLAG_BATCH_END, FLAG_FAILED};

/// What a handler decided about one fragment.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FragmentOutcome {
    /// Processed; move past it.
    Consume,
    /// Leave it for the next read. Only honoured by `peek_and_consume`;
    /// `poll` treats it as [`FragmentOutcome::Consume`].
    Postpone,
    /// Not processed. The fragment's failed flag is set in place and it is
    /// still consumed.
    Failed,
}

/// A committed fragment as seen by a subscriber.
#[derive(Clone, Copy, Debug)]
pub struct Fragment<'a> {
    payload: &'a [u8],
    stream_id: i32,
    flags: u8,
    position: i64,
}

impl<'a> Fragment<'a> {
    pub(crate) fn new(payload: &'a [u8], stream_id: i32, flags: u8, position: i64) -> Self {
        Self {
            payload,
            stream_id,
            flags,
            position,
        }
    }

    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    #[inline]
    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    /// Whether a consumer already marked this fragment failed.
    #[inline]
    pub fn is_failed(&self) -> bool {
        frame::is_flag_set(self.flags, FLAG_FAILED)
    }

    #[inline]
    pub fn is_batch_begin(&self) -> bool {
        frame::is_flag_set(self.flags, FLAG_BATCH_BEGIN)
    }

    #[inline]
    pub fn is_batch_end(&self) -> bool {
        frame::is_flag_set(self.flags, FLAG_BATCH_END)
    }

    /// Position right after this fragment: the value `offer` returned for it.
    #[inline]
    pub fn position(&self) -> i64 {
        self.position
    }
}

/// Callback invoked once per fragment by `poll` and `peek_and_consume`.
///
/// Any `FnMut(&Fragment<'_>) -> FragmentOutcome` is a handler.
pub trait FragmentHandler {
    fn on_fragment(&mut self, fragment: &Fragment<'_>) -> FragmentOutcome;
}

impl<F> FragmentHandler for F
where
    F: FnMut(&Fragment<'_>) -> FragmentOutcome,
{
    #[inline]
    fn on_fragment(&mut self, fragment: &Fragment<'_>) -> FragmentOutcome {
        self(fragment)
    }
}
