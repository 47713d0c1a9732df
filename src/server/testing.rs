//! Fixtures shared by the server unit tests.

use super::helper::{LockHelper, LockResponse, LockResponseContext, LockSink, LockTimer, TimerCallback};
use crate::scheduler::Scheduler;
use crate::types::{ClientId, LockId, ThreadId};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};

pub const C1: ClientId = ClientId(1);
pub const C2: ClientId = ClientId(2);
pub const C3: ClientId = ClientId(3);
pub const T1: ThreadId = ThreadId(1);
pub const T2: ThreadId = ThreadId(2);
pub const T3: ThreadId = ThreadId(3);

/// Records timer expiries instead of acting on them.
#[derive(Default)]
pub struct FiredTimers {
    fired: Mutex<Vec<(LockId, ClientId, ThreadId, u64)>>,
}

impl FiredTimers {
    pub fn take(&self) -> Vec<(LockId, ClientId, ThreadId, u64)> {
        std::mem::take(&mut *self.fired.lock())
    }
}

impl TimerCallback for FiredTimers {
    fn timer_expired(&self, lock_id: LockId, client: ClientId, thread: ThreadId, timer_id: u64) {
        self.fired.lock().push((lock_id, client, thread, timer_id));
    }
}

/// A [`LockHelper`] whose responses and timer expiries the test inspects.
///
/// Must be built inside a tokio runtime.
pub struct Harness {
    pub helper: LockHelper,
    pub timers: Arc<FiredTimers>,
    rx: UnboundedReceiver<LockResponseContext>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_lease(None)
    }

    pub fn with_lease(lease: Option<Duration>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let timers = Arc::new(FiredTimers::default());
        let callback: Weak<dyn TimerCallback> = Arc::downgrade(&timers) as Weak<dyn TimerCallback>;
        let timer = LockTimer::new(Scheduler::current().unwrap(), callback);
        Self {
            helper: LockHelper::new(LockSink::new(tx), timer, lease),
            timers,
            rx,
        }
    }

    /// Drain every response sent so far.
    pub fn responses(&mut self) -> Vec<LockResponseContext> {
        let mut out = Vec::new();
        while let Ok(response) = self.rx.try_recv() {
            out.push(response);
        }
        out
    }

    /// Drain responses as (client, thread, response) triples.
    pub fn sent(&mut self) -> Vec<(ClientId, ThreadId, LockResponse)> {
        self.responses()
            .into_iter()
            .map(|r| (r.client_id, r.thread_id, r.response))
            .collect()
    }
}
