//! Timer facility shared by the client and server lock managers.
//!
//! A [`Scheduler`] wraps a tokio runtime handle and runs delayed and periodic
//! callbacks as tokio tasks. Callbacks are synchronous: they run on a runtime
//! worker and must not block for long.

use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::debug;

/// Cancellable handle to a scheduled callback.
#[derive(Debug)]
pub struct TimerHandle {
    task: AbortHandle,
}

impl TimerHandle {
    /// Cancel the callback. A callback already running completes.
    pub fn cancel(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Injected timer service backed by a tokio runtime.
#[derive(Debug, Clone)]
pub struct Scheduler {
    handle: Handle,
}

impl Scheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Scheduler on the runtime of the calling task.
    ///
    /// Fails outside of a tokio runtime.
    pub fn current() -> crate::error::Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| crate::error::LockError::Internal(format!("No tokio runtime: {}", e)))
    }

    /// Run `f` once after `delay`.
    pub fn schedule_once<F>(&self, delay: Duration, f: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let task = self.handle.spawn(async move {
            sleep(delay).await;
            f();
        });
        TimerHandle {
            task: task.abort_handle(),
        }
    }

    /// Run `f` every `period`, first after one full period.
    pub fn schedule_periodic<F>(&self, period: Duration, f: F) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        let task = self.handle.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                f();
            }
        });
        debug!(period_ms = period.as_millis() as u64, "Periodic timer scheduled");
        TimerHandle {
            task: task.abort_handle(),
        }
    }
}
