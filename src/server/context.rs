//! Entries of a server lock's context chain.

use crate::scheduler::TimerHandle;
use crate::types::{ClientId, ContextType, LockContext, LockContextState, LockId, ServerLockLevel, ThreadId};
use std::fmt;
use std::time::Duration;

#[derive(Debug)]
struct ContextTimer {
    id: u64,
    handle: TimerHandle,
}

/// One (client, thread) entry in a server lock's chain.
///
/// Try-pending and waiter entries may carry a timer; every other kind never
/// does.
pub struct ServerLockContext {
    pub client_id: ClientId,
    pub thread_id: ThreadId,
    pub state: LockContextState,
    pub timeout: Option<Duration>,
    timer: Option<ContextTimer>,
}

impl ServerLockContext {
    pub fn new(client_id: ClientId, thread_id: ThreadId, state: LockContextState) -> Self {
        Self {
            client_id,
            thread_id,
            state,
            timeout: None,
            timer: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn context_type(&self) -> ContextType {
        self.state.context_type()
    }

    pub fn level(&self) -> ServerLockLevel {
        self.state.lock_level()
    }

    /// Holder or greedy holder.
    pub fn is_holder(&self) -> bool {
        self.state.is_holder()
    }

    pub fn is_greedy_holder(&self) -> bool {
        self.context_type() == ContextType::GreedyHolder
    }

    /// Pending or try-pending.
    pub fn is_pending(&self) -> bool {
        self.state.is_pending()
    }

    pub fn is_try_pending(&self) -> bool {
        self.context_type() == ContextType::TryPending
    }

    pub fn is_waiter(&self) -> bool {
        self.context_type() == ContextType::Waiter
    }

    pub fn belongs_to(&self, client: ClientId, thread: ThreadId) -> bool {
        self.client_id == client && self.thread_id == thread
    }

    pub fn set_timer(&mut self, id: u64, handle: TimerHandle) {
        self.cancel_timer();
        self.timer = Some(ContextTimer { id, handle });
    }

    pub fn timer_id(&self) -> Option<u64> {
        self.timer.as_ref().map(|t| t.id)
    }

    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.handle.cancel();
        }
    }

    /// Turn this entry into a holder at its own level, dropping any timer.
    pub fn into_holder(mut self, greedy: bool) -> Self {
        self.cancel_timer();
        let level = self.level();
        self.state = if greedy {
            LockContextState::greedy_holder(level)
        } else {
            LockContextState::holder(level)
        };
        self.timeout = None;
        self
    }

    pub fn to_context(&self, lock_id: &LockId) -> LockContext {
        LockContext::new(lock_id.clone(), self.client_id, self.thread_id, self.state).with_timeout(self.timeout)
    }
}

impl From<&LockContext> for ServerLockContext {
    fn from(context: &LockContext) -> Self {
        ServerLockContext::new(context.client_id, context.thread_id, context.state).with_timeout(context.timeout)
    }
}

impl fmt::Debug for ServerLockContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerLockContext")
            .field("client_id", &self.client_id)
            .field("thread_id", &self.thread_id)
            .field("state", &self.state)
            .field("timeout", &self.timeout)
            .field("timer", &self.timer_id())
            .finish()
    }
}

impl fmt::Display for ServerLockContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} {:?}", self.client_id, self.thread_id, self.state)
    }
}
