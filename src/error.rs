//! Errors returned by the dispatcher.
//!
//! Only caller misuse and lifecycle problems are errors. Backpressure and
//! partition rollover are ordinary outcomes of a publish and are reported
//! through [`Admission`](crate::Dispatcher::Admission) instead.

use std::io;
use thiserror::Error;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum DispatcherError {
    /// A message or claim does not fit in a single frame.
    #[error("frame of {framed_length} bytes exceeds max frame length {max_frame_length}")]
    FrameTooLarge {
        framed_length: usize,
        max_frame_length: usize,
    },

    /// Another open subscription already uses this name.
    #[error("subscription name '{0}' is already in use")]
    SubscriptionNameInUse(String),

    /// No open subscription has this name or id.
    #[error("no subscription named '{0}'")]
    UnknownSubscription(String),

    /// The subscription topology of a pipeline is fixed at construction.
    #[error("{operation} is not supported in pipeline mode")]
    UnsupportedInPipelineMode { operation: &'static str },

    /// A claimed batch has no room for another fragment of this length.
    #[error("batch has {remaining} bytes left, fragment needs {required}")]
    BatchCapacityExceeded { required: usize, remaining: usize },

    /// The dispatcher (or the command path to it) has been closed.
    #[error("dispatcher is closed")]
    Closed,

    /// The construction-time configuration is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The storage backend could not provide the buffer.
    #[error("storage allocation failed: {source}")]
    Storage {
        #[from]
        source: io::Error,
    },
}

impl DispatcherError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            DispatcherError::FrameTooLarge { .. } => "frame_too_large",
            DispatcherError::SubscriptionNameInUse(_) => "subscription_name_in_use",
            DispatcherError::UnknownSubscription(_) => "unknown_subscription",
            DispatcherError::UnsupportedInPipelineMode { .. } => "unsupported_in_pipeline_mode",
            DispatcherError::BatchCapacityExceeded { .. } => "batch_capacity_exceeded",
            DispatcherError::Closed => "closed",
            DispatcherError::InvalidConfig(_) => "invalid_config",
            DispatcherError::Storage { .. } => "storage",
        }
    }

    /// Caller misuse is never retried; everything else may succeed later.
    pub fn is_caller_misuse(&self) -> bool {
        matches!(
            self,
            DispatcherError::FrameTooLarge { .. }
                | DispatcherError::SubscriptionNameInUse(_)
                | DispatcherError::UnsupportedInPipelineMode { .. }
                | DispatcherError::BatchCapacityExceeded { .. }
        )
    }
}
