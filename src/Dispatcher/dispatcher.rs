// Producer side of the dispatcher and the state it shares with subscriptions
// and the conductor.

use arc_swap::ArcSwap;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use super::claim::{ClaimedFragment, ClaimedFragmentBatch};
use super::conductor::{Command, Conductor};
use super::subscription::{ReadLimit, Subscription, SubscriptionState};
use crate::config::{DispatchMode, IdleConfig, Layout};
use crate::error::DispatcherError;
use crate::Core::agent::{AgentRunner, IdleStrategy, WakeSignal};
use crate::Core::Storage::StorageBackend;
use crate::Dispatcher::Buffer::appender;
use crate::Dispatcher::Buffer::frame;
use crate::Dispatcher::Buffer::log_buffer::LogBuffer;
use crate::Dispatcher::Buffer::partition::Reservation;
use crate::Dispatcher::Buffer::position::{advance, partition_id, position, AtomicPosition};

/// Result of an admitted-or-not publish.
///
/// Neither refusal is an error. `Backpressured` means the publisher limit
/// blocks the write until subscribers catch up; `PaddingAtEnd` means the
/// active partition just filled and the call can be retried immediately.
#[must_use]
#[derive(Debug, Eq, PartialEq)]
pub enum Admission<T> {
    Admitted(T),
    Backpressured,
    PaddingAtEnd,
}

impl<T> Admission<T> {
    /// Integer sentinel for a refused publish because of the publisher limit.
    pub const NOT_ENOUGH_SPACE: i64 = -1;
    /// Integer sentinel for a refused publish because of partition rollover.
    pub const PADDING_AT_END: i64 = -2;

    #[inline]
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted(_))
    }

    /// The negative sentinel for a refusal, `None` when admitted.
    pub fn sentinel(&self) -> Option<i64> {
        match self {
            Admission::Admitted(_) => None,
            Admission::Backpressured => Some(Self::NOT_ENOUGH_SPACE),
            Admission::PaddingAtEnd => Some(Self::PADDING_AT_END),
        }
    }

    pub fn admitted(self) -> Option<T> {
        match self {
            Admission::Admitted(value) => Some(value),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Admission<U> {
        match self {
            Admission::Admitted(value) => Admission::Admitted(f(value)),
            Admission::Backpressured => Admission::Backpressured,
            Admission::PaddingAtEnd => Admission::PaddingAtEnd,
        }
    }
}

impl Admission<i64> {
    /// The new publisher position, or the negative sentinel.
    pub fn position(&self) -> i64 {
        match self {
            Admission::Admitted(position) => *position,
            refused => refused.sentinel().unwrap_or(Self::NOT_ENOUGH_SPACE),
        }
    }
}

/// State shared by the dispatcher handle, its subscriptions and the conductor.
pub(crate) struct DispatcherContext {
    name: String,
    mode: DispatchMode,
    layout: Layout,
    log_buffer: LogBuffer,
    publisher_position: AtomicPosition,
    publisher_limit: AtomicPosition,
    subscriptions: ArcSwap<Vec<Arc<SubscriptionState>>>,
    next_subscription_id: AtomicUsize,
    closed: AtomicBool,
    // Serialises limit updates with cleaning and subscription set changes.
    limit_lock: Mutex<()>,
}

impl DispatcherContext {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub(crate) fn log_buffer(&self) -> &LogBuffer {
        &self.log_buffer
    }

    #[inline]
    pub(crate) fn publisher_position(&self) -> i64 {
        self.publisher_position.get()
    }

    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn subscriptions(&self) -> Arc<Vec<Arc<SubscriptionState>>> {
        self.subscriptions.load_full()
    }

    pub(crate) fn store_subscriptions(&self, subscriptions: Vec<Arc<SubscriptionState>>) {
        self.subscriptions.store(Arc::new(subscriptions));
    }

    pub(crate) fn next_subscription_id(&self) -> usize {
        self.next_subscription_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn limit_lock(&self) -> MutexGuard<'_, ()> {
        self.limit_lock.lock()
    }

    /// Recompute the publisher limit from subscriber progress.
    ///
    /// Positions are read first, then filled partitions are cleaned, and only
    /// then is the new limit published, so no producer is ever admitted into a
    /// partition that is still waiting to be zeroed. Returns the work done.
    pub(crate) fn update_publisher_limit(&self) -> usize {
        let _guard = self.limit_lock.lock();
        let subscriptions = self.subscriptions.load();
        let slowest = subscriptions
            .iter()
            .map(|s| s.position())
            .min()
            .unwrap_or_else(|| self.publisher_position.get());
        let base = match (self.mode, subscriptions.last()) {
            (DispatchMode::Pipeline, Some(last)) => last.position(),
            _ => slowest,
        };
        let proposed = advance(base, self.layout.window_length, self.layout.partition_size);

        let cleaned = self.log_buffer.clean_partitions(partition_id(slowest));
        let moved = self.publisher_limit.propose_max_ordered(proposed);
        if moved {
            tracing::trace!(dispatcher = %self.name, limit = proposed, "publisher limit moved");
        }
        cleaned + moved as usize
    }
}

/// A partitioned ring buffer with admission control.
///
/// Publishing (`offer`, `claim`, `claim_batch`) is synchronous and lock-free
/// and may be called from any number of threads through `&self`. Changes to
/// the subscription set go through the background conductor.
pub struct Dispatcher {
    context: Arc<DispatcherContext>,
    commands: mpsc::UnboundedSender<Command>,
    conductor: AgentRunner,
    initial_subscriptions: Mutex<HashMap<String, Subscription>>,
}

impl Dispatcher {
    pub(crate) fn start(
        name: String,
        mode: DispatchMode,
        layout: Layout,
        storage: Box<dyn StorageBackend>,
        initial_names: &[String],
        idle: &IdleConfig,
    ) -> Result<Self, DispatcherError> {
        let file_backed = storage.is_file_backed();
        let log_buffer = LogBuffer::new(storage, layout.partition_count, layout.partition_size);

        let states: Vec<Arc<SubscriptionState>> = initial_names
            .iter()
            .enumerate()
            .map(|(id, name)| Arc::new(SubscriptionState::new(id, name.clone(), 0)))
            .collect();

        let context = Arc::new(DispatcherContext {
            name,
            mode,
            layout,
            log_buffer,
            publisher_position: AtomicPosition::new(0),
            publisher_limit: AtomicPosition::new(0),
            subscriptions: ArcSwap::from_pointee(states.clone()),
            next_subscription_id: AtomicUsize::new(states.len()),
            closed: AtomicBool::new(false),
            limit_lock: Mutex::new(()),
        });
        context.update_publisher_limit();

        let mut initial_subscriptions = HashMap::with_capacity(states.len());
        for (stage, state) in states.iter().enumerate() {
            let limit = match mode {
                DispatchMode::Pipeline if stage > 0 => ReadLimit::Predecessor(states[stage - 1].clone()),
                _ => ReadLimit::Publisher,
            };
            initial_subscriptions.insert(
                state.name().to_string(),
                Subscription::new(context.clone(), state.clone(), limit),
            );
        }

        let (commands, receiver) = mpsc::unbounded_channel();
        let conductor = AgentRunner::start(
            Conductor::new(context.clone(), receiver),
            IdleStrategy::new(idle),
            Arc::new(WakeSignal::new()),
        )?;

        tracing::info!(
            dispatcher = %context.name,
            ?mode,
            partitions = layout.partition_count,
            partition_size = layout.partition_size,
            window = layout.window_length,
            file_backed,
            subscriptions = states.len(),
            "dispatcher started"
        );

        Ok(Self {
            context,
            commands,
            conductor,
            initial_subscriptions: Mutex::new(initial_subscriptions),
        })
    }

    pub fn name(&self) -> &str {
        &self.context.name
    }

    pub fn mode(&self) -> DispatchMode {
        self.context.mode
    }

    pub fn layout(&self) -> Layout {
        self.context.layout
    }

    pub fn max_frame_length(&self) -> usize {
        self.context.layout.max_frame_length
    }

    /// Highest position reserved by a publish so far.
    pub fn publisher_position(&self) -> i64 {
        self.context.publisher_position.get()
    }

    /// Highest position producers may currently write up to.
    pub fn publisher_limit(&self) -> i64 {
        self.context.publisher_limit.get()
    }

    pub fn is_closed(&self) -> bool {
        self.context.is_closed()
    }

    /// Logical id of the partition producers currently write to.
    pub fn active_partition_id(&self) -> i32 {
        self.context.log_buffer.active_partition_id()
    }

    /// Names and positions of the open subscriptions.
    pub fn subscription_positions(&self) -> Vec<(String, i64)> {
        self.context
            .subscriptions
            .load()
            .iter()
            .map(|s| (s.name().to_string(), s.position()))
            .collect()
    }

    /// Publish `message` on stream 0.
    pub fn offer(&self, message: &[u8]) -> Result<Admission<i64>, DispatcherError> {
        self.offer_with_stream(message, 0)
    }

    /// Copy `message` into the log. Returns the new publisher position.
    pub fn offer_with_stream(&self, message: &[u8], stream_id: i32) -> Result<Admission<i64>, DispatcherError> {
        self.check_publish(frame::aligned_length(message.len()))?;
        let log_buffer = &self.context.log_buffer;
        Ok(self
            .publish(frame::aligned_length(message.len()))
            .map(|(frame_offset, partition_id, new_tail)| {
                let buffer = log_buffer.partition(partition_id).data();
                appender::write_frame(buffer, frame_offset, message, stream_id);
                position(partition_id, new_tail)
            }))
    }

    /// Reserve `length` payload bytes to be written in place.
    ///
    /// The returned handle must be committed (or aborted) before subscribers
    /// can read past it.
    pub fn claim(&self, length: usize, stream_id: i32) -> Result<Admission<ClaimedFragment<'_>>, DispatcherError> {
        self.check_publish(frame::aligned_length(length))?;
        let log_buffer = &self.context.log_buffer;
        Ok(self
            .publish(frame::aligned_length(length))
            .map(|(frame_offset, partition_id, new_tail)| {
                let buffer = *log_buffer.partition(partition_id).data();
                appender::write_claim_header(&buffer, frame_offset, stream_id);
                ClaimedFragment::new(buffer, frame_offset, length, position(partition_id, new_tail))
            }))
    }

    /// Reserve one region for `fragment_count` fragments carrying
    /// `batch_length` payload bytes in total, published together on commit.
    pub fn claim_batch(
        &self,
        fragment_count: usize,
        batch_length: usize,
    ) -> Result<Admission<ClaimedFragmentBatch<'_>>, DispatcherError> {
        let reserved = appender::batch_reservation_length(fragment_count, batch_length);
        self.check_publish(reserved)?;
        let log_buffer = &self.context.log_buffer;
        Ok(self
            .publish(reserved)
            .map(|(frame_offset, partition_id, _)| {
                let buffer = *log_buffer.partition(partition_id).data();
                ClaimedFragmentBatch::new(buffer, partition_id, frame_offset, reserved)
            }))
    }

    fn check_publish(&self, aligned_length: usize) -> Result<(), DispatcherError> {
        if self.context.is_closed() {
            return Err(DispatcherError::Closed);
        }
        let max_frame_length = self.context.layout.max_frame_length;
        if aligned_length > max_frame_length {
            tracing::warn!(
                dispatcher = %self.context.name,
                framed_length = aligned_length,
                max_frame_length,
                "rejected oversized frame"
            );
            return Err(DispatcherError::FrameTooLarge {
                framed_length: aligned_length,
                max_frame_length,
            });
        }
        Ok(())
    }

    /// Admission check plus a reservation of `aligned_length` bytes on the
    /// active partition. Admitted values are `(frame_offset, partition_id,
    /// new_tail)`; the caller writes the frame.
    fn publish(&self, aligned_length: usize) -> Admission<(usize, i32, usize)> {
        self.publish_on(self.context.log_buffer.active_partition_id(), aligned_length)
    }

    fn publish_on(&self, partition_id: i32, aligned_length: usize) -> Admission<(usize, i32, usize)> {
        let log_buffer = &self.context.log_buffer;
        let partition = log_buffer.partition(partition_id);

        let tail_position = position(partition_id, partition.tail_volatile());
        if tail_position >= self.context.publisher_limit.get() {
            return Admission::Backpressured;
        }

        match partition.reserve(aligned_length) {
            Reservation::Reserved { frame_offset, new_tail } => {
                if self.is_recycled(partition_id) {
                    // The reservation may sit in a later generation of this
                    // physical partition: give it up as padding and retry.
                    frame::write_padding(partition.data(), frame_offset, new_tail - frame_offset);
                    tracing::debug!(
                        dispatcher = %self.context.name,
                        partition = partition_id,
                        active = log_buffer.active_partition_id(),
                        "dropped reservation in a recycled partition"
                    );
                    return Admission::PaddingAtEnd;
                }
                self.context
                    .publisher_position
                    .propose_max_ordered(position(partition_id, new_tail));
                Admission::Admitted((frame_offset, partition_id, new_tail))
            }
            Reservation::PaddingAtEnd => {
                log_buffer.on_active_partition_filled(partition_id);
                Admission::PaddingAtEnd
            }
            Reservation::Exhausted => Admission::PaddingAtEnd,
        }
    }

    /// Production has moved far enough past `partition_id` that its physical
    /// partition may already have been marked, cleaned and reset.
    fn is_recycled(&self, partition_id: i32) -> bool {
        let log_buffer = &self.context.log_buffer;
        log_buffer.active_partition_id() - partition_id >= log_buffer.partition_count() as i32 - 1
    }

    /// Recompute the publisher limit now instead of waiting for the conductor.
    pub fn update_publisher_limit(&self) {
        self.context.update_publisher_limit();
    }

    /// Hand out a subscription created with the dispatcher. Each one can be
    /// taken once.
    pub fn take_subscription(&self, name: &str) -> Result<Subscription, DispatcherError> {
        self.initial_subscriptions
            .lock()
            .remove(name)
            .ok_or_else(|| DispatcherError::UnknownSubscription(name.to_string()))
    }

    /// Open a subscription starting at the current publisher position.
    pub async fn open_subscription(&self, name: impl Into<String>) -> Result<Subscription, DispatcherError> {
        self.check_topology_change("open_subscription")?;
        let (reply, response) = oneshot::channel();
        self.submit(Command::Open {
            name: name.into(),
            reply,
        })?;
        response.await.map_err(|_| DispatcherError::Closed)?
    }

    /// Close a subscription. Closing one that is already closed is a no-op.
    pub async fn close_subscription(&self, subscription: &Subscription) -> Result<(), DispatcherError> {
        if subscription.is_closed() {
            return Ok(());
        }
        self.check_topology_change("close_subscription")?;
        let (reply, response) = oneshot::channel();
        self.submit(Command::Close {
            state: subscription.state().clone(),
            reply,
        })?;
        response.await.map_err(|_| DispatcherError::Closed)?
    }

    fn check_topology_change(&self, operation: &'static str) -> Result<(), DispatcherError> {
        if self.context.mode == DispatchMode::Pipeline {
            tracing::warn!(dispatcher = %self.context.name, operation, "subscription change rejected in pipeline mode");
            return Err(DispatcherError::UnsupportedInPipelineMode { operation });
        }
        if self.context.is_closed() {
            return Err(DispatcherError::Closed);
        }
        Ok(())
    }

    fn submit(&self, command: Command) -> Result<(), DispatcherError> {
        self.commands.send(command).map_err(|_| DispatcherError::Closed)?;
        self.conductor.wake();
        Ok(())
    }

    /// Stop accepting publishes, stop the conductor and close every
    /// subscription. The storage is released once the last subscription
    /// handle is dropped. Closing twice is a no-op.
    pub fn close(&self) {
        if self.context.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.conductor.close();

        let subscriptions = self.context.subscriptions.swap(Arc::new(Vec::new()));
        for state in subscriptions.iter() {
            state.set_closing();
            state.set_closed();
        }
        self.initial_subscriptions.lock().clear();

        tracing::info!(
            dispatcher = %self.context.name,
            subscriptions = subscriptions.len(),
            publisher_position = self.publisher_position(),
            "dispatcher closed"
        );
    }

    pub(crate) fn log_buffer(&self) -> &LogBuffer {
        &self.context.log_buffer
    }

    pub(crate) fn conductor_name(&self) -> &str {
        self.conductor.role_name()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        crate::Debug::StructDebug::debug_dispatcher(self, f)
    }
}
