use std::fs::File;

use super::Dispatcher;
use crate::config::{DispatchMode, DispatcherConfig, IdleConfig};
use crate::error::DispatcherError;
use crate::Core::alloc::{allocate, Allocation};

/// Builds a [`Dispatcher`] from a [`DispatcherConfig`] plus a storage choice.
#[derive(Debug, Default)]
pub struct DispatcherBuilder {
    config: DispatcherConfig,
    allocation: Allocation,
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: DispatcherConfig) -> Self {
        Self {
            config,
            allocation: Allocation::Heap,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Total bytes across all partitions.
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = size;
        self
    }

    pub fn with_partition_count(mut self, partition_count: usize) -> Self {
        self.config.partition_count = partition_count;
        self
    }

    pub fn with_mode(mut self, mode: DispatchMode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Subscriptions created with the dispatcher, in pipeline order.
    pub fn with_subscriptions<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.subscriptions = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_window_length(mut self, window_length: usize) -> Self {
        self.config.window_length = Some(window_length);
        self
    }

    pub fn with_idle(mut self, idle: IdleConfig) -> Self {
        self.config.idle = idle;
        self
    }

    /// Back the buffer with a memory map over `file`, which must already be
    /// at least `buffer_size` bytes long.
    pub fn with_mapped_file(mut self, file: File) -> Self {
        self.allocation = Allocation::MappedFile(file);
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Validate the configuration, allocate storage and start the conductor.
    pub fn build(self) -> Result<Dispatcher, DispatcherError> {
        let layout = self.config.layout()?;
        let storage = allocate(layout.buffer_size(), self.allocation)?;
        Dispatcher::start(
            self.config.name,
            self.config.mode,
            layout,
            storage,
            &self.config.subscriptions,
            &self.config.idle,
        )
    }
}
