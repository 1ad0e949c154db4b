use std::fmt;

use crate::Dispatcher::Buffer::position::{partition_id, partition_offset};
use crate::Dispatcher::{Dispatcher, Subscription};

/// Render a position as `value (partition:offset)`.
pub fn format_position(position: i64) -> String {
    format!("{position} ({}:{})", partition_id(position), partition_offset(position))
}

/// Debug function for Dispatcher
///
/// Shows:
/// - Name, mode and partition layout
/// - Active partition and storage kind
/// - Publisher position and limit
/// - Open subscription positions
pub fn debug_dispatcher(dispatcher: &Dispatcher, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let log_buffer = dispatcher.log_buffer();
    let layout = dispatcher.layout();
    f.debug_struct("Dispatcher")
        .field("name", &dispatcher.name())
        .field("mode", &dispatcher.mode())
        .field("partitions", &format_args!("{} x {}", layout.partition_count, layout.partition_size))
        .field("active_partition_id", &log_buffer.active_partition_id())
        .field("file_backed", &log_buffer.is_file_backed())
        .field("publisher_position", &format_position(dispatcher.publisher_position()))
        .field("publisher_limit", &format_position(dispatcher.publisher_limit()))
        .field("subscriptions", &dispatcher.subscription_positions())
        .field("conductor", &dispatcher.conductor_name())
        .field("closed", &dispatcher.is_closed())
        .finish()
}

/// Debug function for Subscription
///
/// Never reads the buffer, only the cursor and limit.
pub fn debug_subscription(subscription: &Subscription, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Subscription")
        .field("id", &subscription.id())
        .field("name", &subscription.name())
        .field("status", &subscription.status())
        .field("position", &format_position(subscription.position()))
        .field("limit", &format_position(subscription.limit()))
        .finish()
}
