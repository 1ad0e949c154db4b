//! Construction-time configuration.
//!
//! Every field has a default, so a config can be deserialized from a partial
//! document (`serde(default)`), or built in code through
//! [`DispatcherBuilder`](crate::Dispatcher::DispatcherBuilder).

use serde::Deserialize;

use crate::error::DispatcherError;
use crate::Dispatcher::Buffer::frame::{align, FRAME_ALIGNMENT, HEADER_LENGTH};

/// Default total buffer size: three 1 MiB partitions.
pub const DEFAULT_BUFFER_SIZE: usize = 3 * 1024 * 1024;
/// Default and minimum number of partitions.
pub const DEFAULT_PARTITION_COUNT: usize = 3;
/// Max frame length is a sixteenth of a partition.
pub const MAX_FRAME_LENGTH_DIVISOR: usize = 16;
/// Default window is a quarter of a partition.
pub const WINDOW_LENGTH_DIVISOR: usize = 4;

/// How subscriptions share the log.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum DispatchMode {
    /// Every subscription reads every fragment; the limit follows the slowest reader.
    #[default]
    PubSub,
    /// A fixed chain of subscriptions; each stage reads what the previous one released.
    Pipeline,
}

/// Idle policy of the background conductor.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct IdleConfig {
    /// First park timeout after spinning and yielding, in microseconds.
    pub min_park_micros: u64,
    /// Upper bound of the doubling park timeout, in microseconds. This bounds
    /// how long a backpressured producer waits for a limit update.
    pub max_park_micros: u64,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            min_park_micros: 1,
            max_park_micros: 1_000,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct DispatcherConfig {
    pub name: String,
    /// Total bytes across all partitions.
    pub buffer_size: usize,
    pub partition_count: usize,
    pub mode: DispatchMode,
    /// Subscriptions created with the dispatcher. Required for pipeline mode,
    /// where they form the chain in this order.
    pub subscriptions: Vec<String>,
    /// Backpressure window in bytes; a quarter of a partition when unset.
    pub window_length: Option<usize>,
    pub idle: IdleConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            name: "dispatcher".to_string(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            partition_count: DEFAULT_PARTITION_COUNT,
            mode: DispatchMode::PubSub,
            subscriptions: Vec::new(),
            window_length: None,
            idle: IdleConfig::default(),
        }
    }
}

/// Sizes derived from a validated [`DispatcherConfig`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Layout {
    pub partition_count: usize,
    pub partition_size: usize,
    pub max_frame_length: usize,
    pub window_length: usize,
}

impl Layout {
    pub fn buffer_size(&self) -> usize {
        self.partition_count * self.partition_size
    }
}

impl DispatcherConfig {
    /// Validate the config and derive partition, frame and window sizes.
    pub fn layout(&self) -> Result<Layout, DispatcherError> {
        if self.partition_count < DEFAULT_PARTITION_COUNT {
            return Err(DispatcherError::InvalidConfig(format!(
                "partition_count must be at least {DEFAULT_PARTITION_COUNT}, got {}",
                self.partition_count
            )));
        }

        let partition_size = (self.buffer_size / self.partition_count) & !(FRAME_ALIGNMENT - 1);
        if partition_size > i32::MAX as usize {
            return Err(DispatcherError::InvalidConfig(format!(
                "partition size {partition_size} exceeds the 31-bit offset range"
            )));
        }

        let max_frame_length = partition_size / MAX_FRAME_LENGTH_DIVISOR;
        if max_frame_length < align(HEADER_LENGTH + 1, FRAME_ALIGNMENT) {
            return Err(DispatcherError::InvalidConfig(format!(
                "buffer_size {} is too small for {} partitions",
                self.buffer_size, self.partition_count
            )));
        }

        let window_length = self
            .window_length
            .unwrap_or(partition_size / WINDOW_LENGTH_DIVISOR);
        if window_length == 0 || window_length >= partition_size {
            return Err(DispatcherError::InvalidConfig(format!(
                "window_length must be within (0, {partition_size}), got {window_length}"
            )));
        }

        match self.mode {
            DispatchMode::Pipeline if self.subscriptions.is_empty() => {
                return Err(DispatcherError::InvalidConfig(
                    "pipeline mode requires at least one subscription".to_string(),
                ));
            }
            _ => {}
        }
        for (i, name) in self.subscriptions.iter().enumerate() {
            if self.subscriptions[..i].contains(name) {
                return Err(DispatcherError::SubscriptionNameInUse(name.clone()));
            }
        }

        Ok(Layout {
            partition_count: self.partition_count,
            partition_size,
            max_frame_length,
            window_length,
        })
    }
}
