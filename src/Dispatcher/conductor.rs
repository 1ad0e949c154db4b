// Background duty cycle of a dispatcher.
//
// The conductor is the only place the subscription set changes: open and
// close requests arrive over a channel and are applied one at a time by
// swapping in a new snapshot. Each cycle it also cleans filled partitions
// and moves the publisher limit.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use super::dispatcher::DispatcherContext;
use super::subscription::{ReadLimit, Subscription, SubscriptionState};
use crate::error::DispatcherError;
use crate::Core::agent::Agent;

pub(crate) enum Command {
    Open {
        name: String,
        reply: oneshot::Sender<Result<Subscription, DispatcherError>>,
    },
    Close {
        state: Arc<SubscriptionState>,
        reply: oneshot::Sender<Result<(), DispatcherError>>,
    },
}

pub(crate) struct Conductor {
    role_name: String,
    context: Arc<DispatcherContext>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl Conductor {
    pub(crate) fn new(context: Arc<DispatcherContext>, commands: mpsc::UnboundedReceiver<Command>) -> Self {
        Self {
            role_name: format!("{}-conductor", context.name()),
            context,
            commands,
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Open { name, reply } => {
                let result = self.open_subscription(name);
                // the caller may have stopped waiting; the subscription then
                // stays registered until the dispatcher closes
                let _ = reply.send(result);
            }
            Command::Close { state, reply } => {
                self.close_subscription(&state);
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn open_subscription(&mut self, name: String) -> Result<Subscription, DispatcherError> {
        if self.context.is_closed() {
            return Err(DispatcherError::Closed);
        }

        let _guard = self.context.limit_lock();
        let current = self.context.subscriptions();
        if current.iter().any(|s| s.name() == name) {
            tracing::warn!(dispatcher = self.context.name(), subscription = %name, "subscription name in use");
            return Err(DispatcherError::SubscriptionNameInUse(name));
        }

        let start = self.context.publisher_position();
        let state = Arc::new(SubscriptionState::new(self.context.next_subscription_id(), name, start));
        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(state.clone());
        self.context.store_subscriptions(next);

        tracing::info!(
            dispatcher = self.context.name(),
            subscription = state.name(),
            id = state.id(),
            position = start,
            "opened subscription"
        );
        Ok(Subscription::new(self.context.clone(), state, ReadLimit::Publisher))
    }

    fn close_subscription(&mut self, state: &Arc<SubscriptionState>) {
        let _guard = self.context.limit_lock();
        let current = self.context.subscriptions();
        if !current.iter().any(|s| Arc::ptr_eq(s, state)) {
            state.set_closed();
            return;
        }

        state.set_closing();
        let next = current
            .iter()
            .filter(|s| !Arc::ptr_eq(s, state))
            .cloned()
            .collect();
        self.context.store_subscriptions(next);
        state.set_closed();

        tracing::info!(
            dispatcher = self.context.name(),
            subscription = state.name(),
            id = state.id(),
            "closed subscription"
        );
    }
}

impl Agent for Conductor {
    fn role_name(&self) -> &str {
        &self.role_name
    }

    fn do_work(&mut self) -> usize {
        let mut work_count = 0;
        while let Ok(command) = self.commands.try_recv() {
            self.on_command(command);
            work_count += 1;
        }
        work_count + self.context.update_publisher_limit()
    }

    fn on_close(&mut self) {
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Open { reply, .. } => {
                    let _ = reply.send(Err(DispatcherError::Closed));
                }
                Command::Close { state, reply } => {
                    state.set_closed();
                    let _ = reply.send(Ok(()));
                }
            }
        }
    }
}
