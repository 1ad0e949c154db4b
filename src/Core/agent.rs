// Duty-cycle runner: a unit of work executed repeatedly on a dedicated thread,
// idling with spin -> yield -> timed park while there is nothing to do.

use crossbeam_utils::{Backoff, CachePadded};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::IdleConfig;
use crate::Core::futex::{futex_wait, futex_wake};

/// A unit of work the runner calls in a loop until it is closed.
pub trait Agent: Send + 'static {
    /// Thread name and log label.
    fn role_name(&self) -> &str;

    /// Perform one duty cycle; return the amount of work done (0 = idle).
    fn do_work(&mut self) -> usize;

    /// Called once on the agent thread after the last duty cycle.
    fn on_close(&mut self) {}
}

/// Wake-up word other threads bump to cut an idle park short.
#[derive(Debug, Default)]
pub struct WakeSignal {
    word: CachePadded<AtomicU32>,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn current(&self) -> u32 {
        self.word.load(Ordering::Acquire)
    }

    pub fn wake(&self) {
        self.word.fetch_add(1, Ordering::Release);
        futex_wake(&self.word);
    }

    fn wait(&self, seen: u32, timeout: Duration) {
        futex_wait(&self.word, seen, Some(timeout));
    }
}

/// Backoff used between idle duty cycles.
///
/// Spins and yields through a crossbeam [`Backoff`] first, then parks on the
/// wake signal with a timeout that doubles from `min_park` up to `max_park`.
/// Any cycle that reports work resets the strategy.
pub struct IdleStrategy {
    backoff: Backoff,
    min_park: Duration,
    max_park: Duration,
    park: Duration,
}

impl IdleStrategy {
    pub fn new(config: &IdleConfig) -> Self {
        let min_park = Duration::from_micros(config.min_park_micros.max(1));
        let max_park = Duration::from_micros(config.max_park_micros).max(min_park);
        Self {
            backoff: Backoff::new(),
            min_park,
            max_park,
            park: min_park,
        }
    }

    pub fn idle(&mut self, work_count: usize, signal: &WakeSignal, seen: u32) {
        if work_count > 0 {
            self.reset();
            return;
        }
        if !self.backoff.is_completed() {
            self.backoff.snooze();
            return;
        }
        signal.wait(seen, self.park);
        self.park = (self.park * 2).min(self.max_park);
    }

    pub fn reset(&mut self) {
        self.backoff.reset();
        self.park = self.min_park;
    }

    #[cfg(test)]
    fn current_park(&self) -> Duration {
        self.park
    }
}

/// Runs an [`Agent`] on its own thread until [`AgentRunner::close`].
pub struct AgentRunner {
    role_name: String,
    running: Arc<AtomicBool>,
    signal: Arc<WakeSignal>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AgentRunner {
    pub fn start<A: Agent>(
        mut agent: A,
        mut idle: IdleStrategy,
        signal: Arc<WakeSignal>,
    ) -> io::Result<Self> {
        let role_name = agent.role_name().to_string();
        let running = Arc::new(AtomicBool::new(true));

        let handle = {
            let running = running.clone();
            let signal = signal.clone();
            thread::Builder::new()
                .name(role_name.clone())
                .spawn(move || {
                    tracing::debug!(agent = agent.role_name(), "agent started");
                    while running.load(Ordering::Acquire) {
                        let seen = signal.current();
                        let work_count = agent.do_work();
                        idle.idle(work_count, &signal, seen);
                    }
                    agent.on_close();
                    tracing::debug!(agent = agent.role_name(), "agent stopped");
                })?
        };

        Ok(Self {
            role_name,
            running,
            signal,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn role_name(&self) -> &str {
        &self.role_name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Wake the agent if it is parked.
    pub fn wake(&self) {
        self.signal.wake();
    }

    /// Stop the duty cycle and join the thread. Closing twice is a no-op.
    pub fn close(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.signal.wake();

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!(agent = %self.role_name, "agent thread panicked");
            }
        }
    }
}

impl Drop for AgentRunner {
    fn drop(&mut self) {
        self.close();
    }
}
