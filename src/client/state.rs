//! Entries of a client lock's state chain and the thread parking primitive.
//!
//! A client lock keeps one ordered chain of [`LockStateNode`]s: active holds
//! first (most recent at the head), then queued acquires, then waiters.

use crate::types::{ClientId, LockContext, LockContextState, LockId, LockLevel, ServerLockLevel, ThreadId};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Outcome of an acquire attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAcquireResult {
    /// Acquired without excluding other acquirers.
    SharedSuccess,
    /// Acquired exclusively.
    Success,
    Failure,
    /// The request was handed to the server.
    UsedServer,
    Unknown,
}

impl LockAcquireResult {
    pub fn is_success(self) -> bool {
        matches!(self, LockAcquireResult::Success | LockAcquireResult::SharedSuccess)
    }

    pub fn is_failure(self) -> bool {
        self == LockAcquireResult::Failure
    }

    pub fn is_known(self) -> bool {
        self.is_success() || self.is_failure()
    }

    /// Anything but an exclusive success lets the next acquirer try too.
    pub fn is_shared(self) -> bool {
        self != LockAcquireResult::Success
    }

    fn granted(level: LockLevel) -> Self {
        if level.is_write() {
            LockAcquireResult::Success
        } else {
            LockAcquireResult::SharedSuccess
        }
    }
}

#[derive(Debug, Default)]
struct ParkState {
    permit: bool,
    interrupted: bool,
}

/// Single-permit parking slot for one blocked thread.
///
/// `unpark` before `park` is not lost. `park` may return without a permit
/// (interrupt, deadline), so callers always recheck their condition.
pub struct Parker {
    state: Mutex<ParkState>,
    cond: Condvar,
}

impl Parker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ParkState::default()),
            cond: Condvar::new(),
        })
    }

    pub fn park(&self) {
        let mut state = self.state.lock();
        while !state.permit && !state.interrupted {
            self.cond.wait(&mut state);
        }
        state.permit = false;
    }

    pub fn park_until(&self, deadline: Instant) {
        let mut state = self.state.lock();
        while !state.permit && !state.interrupted {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.permit = false;
    }

    pub fn unpark(&self) {
        let mut state = self.state.lock();
        state.permit = true;
        self.cond.notify_all();
    }

    pub fn interrupt(&self) {
        let mut state = self.state.lock();
        state.interrupted = true;
        self.cond.notify_all();
    }

    /// Clear and return the interrupt flag.
    pub fn take_interrupt(&self) -> bool {
        std::mem::take(&mut self.state.lock().interrupted)
    }
}

impl fmt::Debug for Parker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Parker")
            .field("permit", &state.permit)
            .field("interrupted", &state.interrupted)
            .finish()
    }
}

/// An active local hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockHold {
    pub owner: ThreadId,
    pub level: LockLevel,
}

impl LockHold {
    pub fn new(owner: ThreadId, level: LockLevel) -> Self {
        Self { owner, level }
    }

    fn allows_hold(&self, new: &LockHold) -> LockAcquireResult {
        if self.owner == new.owner {
            if self.level.is_write() {
                return LockAcquireResult::granted(new.level);
            }
            if new.level.is_read() {
                return LockAcquireResult::SharedSuccess;
            }
        } else if self.level.is_write() || new.level.is_write() {
            return LockAcquireResult::Failure;
        }
        LockAcquireResult::Unknown
    }

    fn to_context(&self, lock_id: &LockId, client_id: ClientId) -> LockContext {
        LockContext::new(
            lock_id.clone(),
            client_id,
            self.owner,
            LockContextState::holder(self.level.into()),
        )
    }
}

/// Whether a queued acquire may still contact the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delegation {
    Allowed,
    /// The server already knows about this request (or will be told by a
    /// recall commit).
    Delegated(&'static str),
}

/// A queued acquire attempt.
#[derive(Debug)]
pub struct PendingLockHold {
    pub owner: ThreadId,
    pub level: LockLevel,
    /// Set for try-locks: the caller's total wait budget.
    pub try_timeout: Option<Duration>,
    pub delegation: Delegation,
    pub awarded: bool,
    pub refused: bool,
    pub parker: Arc<Parker>,
}

impl PendingLockHold {
    pub fn new(owner: ThreadId, level: LockLevel, parker: Arc<Parker>) -> Self {
        Self {
            owner,
            level,
            try_timeout: None,
            delegation: Delegation::Allowed,
            awarded: false,
            refused: false,
            parker,
        }
    }

    pub fn new_try(owner: ThreadId, level: LockLevel, timeout: Duration, parker: Arc<Parker>) -> Self {
        Self {
            try_timeout: Some(timeout),
            ..Self::new(owner, level, parker)
        }
    }

    pub fn server_level(&self) -> ServerLockLevel {
        self.level.into()
    }

    pub fn can_delegate(&self) -> bool {
        self.delegation == Delegation::Allowed
    }

    pub fn delegated(&mut self, reason: &'static str) {
        self.delegation = Delegation::Delegated(reason);
    }

    /// A thread's own awarded request satisfies its compatible acquires.
    fn allows_hold(&self, new: &LockHold) -> LockAcquireResult {
        if self.owner == new.owner
            && self.awarded
            && (self.level.is_write() || new.level.is_read())
        {
            return LockAcquireResult::granted(new.level);
        }
        LockAcquireResult::Unknown
    }

    fn to_context(&self, lock_id: &LockId, client_id: ClientId) -> LockContext {
        let state = match self.try_timeout {
            Some(_) => LockContextState::try_pending(self.server_level()),
            None => LockContextState::pending(self.server_level()),
        };
        LockContext::new(lock_id.clone(), client_id, self.owner, state).with_timeout(self.try_timeout)
    }
}

/// A thread parked in `wait()`.
#[derive(Debug)]
pub struct LockWaiter {
    pub id: u64,
    pub owner: ThreadId,
    /// Holds to reacquire, in acquisition order. Popped from the end.
    pub reacquires: Vec<PendingLockHold>,
    pub timeout: Option<Duration>,
    pub parker: Arc<Parker>,
}

impl LockWaiter {
    fn to_context(&self, lock_id: &LockId, client_id: ClientId) -> LockContext {
        LockContext::new(lock_id.clone(), client_id, self.owner, LockContextState::Waiter)
            .with_timeout(self.timeout)
    }

    pub fn delegate_reacquires(&mut self, reason: &'static str) {
        for pending in &mut self.reacquires {
            pending.delegated(reason);
        }
    }
}

/// One entry of a client lock's state chain.
#[derive(Debug)]
pub enum LockStateNode {
    Hold(LockHold),
    Pending(PendingLockHold),
    Waiter(LockWaiter),
}

impl LockStateNode {
    pub fn owner(&self) -> ThreadId {
        match self {
            LockStateNode::Hold(hold) => hold.owner,
            LockStateNode::Pending(pending) => pending.owner,
            LockStateNode::Waiter(waiter) => waiter.owner,
        }
    }

    pub fn allows_hold(&self, new: &LockHold) -> LockAcquireResult {
        match self {
            LockStateNode::Hold(hold) => hold.allows_hold(new),
            LockStateNode::Pending(pending) => pending.allows_hold(new),
            LockStateNode::Waiter(_) => LockAcquireResult::Unknown,
        }
    }

    pub fn to_context(&self, lock_id: &LockId, client_id: ClientId) -> LockContext {
        match self {
            LockStateNode::Hold(hold) => hold.to_context(lock_id, client_id),
            LockStateNode::Pending(pending) => pending.to_context(lock_id, client_id),
            LockStateNode::Waiter(waiter) => waiter.to_context(lock_id, client_id),
        }
    }

    pub fn as_hold(&self) -> Option<&LockHold> {
        match self {
            LockStateNode::Hold(hold) => Some(hold),
            _ => None,
        }
    }

    pub fn as_pending(&self) -> Option<&PendingLockHold> {
        match self {
            LockStateNode::Pending(pending) => Some(pending),
            _ => None,
        }
    }

    pub fn as_pending_mut(&mut self) -> Option<&mut PendingLockHold> {
        match self {
            LockStateNode::Pending(pending) => Some(pending),
            _ => None,
        }
    }

    pub fn as_waiter(&self) -> Option<&LockWaiter> {
        match self {
            LockStateNode::Waiter(waiter) => Some(waiter),
            _ => None,
        }
    }

    pub fn is_hold(&self) -> bool {
        matches!(self, LockStateNode::Hold(_))
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, LockStateNode::Pending(_))
    }

    pub fn is_waiter(&self) -> bool {
        matches!(self, LockStateNode::Waiter(_))
    }

    /// Parker of the blocked thread behind this entry, if any.
    pub fn parker(&self) -> Option<&Arc<Parker>> {
        match self {
            LockStateNode::Hold(_) => None,
            LockStateNode::Pending(pending) => Some(&pending.parker),
            LockStateNode::Waiter(waiter) => Some(&waiter.parker),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T1: ThreadId = ThreadId(1);
    const T2: ThreadId = ThreadId(2);

    fn hold(owner: ThreadId, level: LockLevel) -> LockStateNode {
        LockStateNode::Hold(LockHold::new(owner, level))
    }

    #[test]
    fn test_same_thread_write_allows_everything() {
        let node = hold(T1, LockLevel::Write);
        assert_eq!(
            node.allows_hold(&LockHold::new(T1, LockLevel::Read)),
            LockAcquireResult::SharedSuccess
        );
        assert_eq!(
            node.allows_hold(&LockHold::new(T1, LockLevel::Write)),
            LockAcquireResult::Success
        );
    }

    #[test]
    fn test_same_thread_read() {
        let node = hold(T1, LockLevel::Read);
        assert_eq!(
            node.allows_hold(&LockHold::new(T1, LockLevel::Read)),
            LockAcquireResult::SharedSuccess
        );
        assert_eq!(
            node.allows_hold(&LockHold::new(T1, LockLevel::Write)),
            LockAcquireResult::Unknown
        );
    }

    #[test]
    fn test_other_thread_conflicts() {
        assert_eq!(
            hold(T1, LockLevel::Write).allows_hold(&LockHold::new(T2, LockLevel::Read)),
            LockAcquireResult::Failure
        );
        assert_eq!(
            hold(T1, LockLevel::Read).allows_hold(&LockHold::new(T2, LockLevel::Write)),
            LockAcquireResult::Failure
        );
        assert_eq!(
            hold(T1, LockLevel::Read).allows_hold(&LockHold::new(T2, LockLevel::Read)),
            LockAcquireResult::Unknown
        );
    }

    #[test]
    fn test_awarded_pending_allows_own_thread() {
        let mut pending = PendingLockHold::new(T1, LockLevel::Write, Parker::new());
        let node_unawarded = LockStateNode::Pending(PendingLockHold::new(T1, LockLevel::Write, Parker::new()));
        assert_eq!(
            node_unawarded.allows_hold(&LockHold::new(T1, LockLevel::Write)),
            LockAcquireResult::Unknown
        );
        pending.awarded = true;
        let node = LockStateNode::Pending(pending);
        assert_eq!(
            node.allows_hold(&LockHold::new(T1, LockLevel::Read)),
            LockAcquireResult::SharedSuccess
        );
        assert_eq!(
            node.allows_hold(&LockHold::new(T2, LockLevel::Read)),
            LockAcquireResult::Unknown
        );
    }

    #[test]
    fn test_pending_contexts() {
        let lock = LockId::named("L");
        let parker = Parker::new();
        let plain = LockStateNode::Pending(PendingLockHold::new(T1, LockLevel::SynchronousWrite, parker.clone()));
        assert_eq!(plain.to_context(&lock, ClientId(1)).state, LockContextState::PendingWrite);

        let try_node = LockStateNode::Pending(PendingLockHold::new_try(
            T1,
            LockLevel::Read,
            Duration::from_millis(5),
            parker,
        ));
        let ctx = try_node.to_context(&lock, ClientId(1));
        assert_eq!(ctx.state, LockContextState::TryPendingRead);
        assert_eq!(ctx.timeout, Some(Duration::from_millis(5)));
    }

    #[test]
    fn test_parker_permit_is_not_lost() {
        let parker = Parker::new();
        parker.unpark();
        parker.park();
        let start = Instant::now();
        parker.park_until(start + Duration::from_millis(20));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_parker_interrupt() {
        let parker = Parker::new();
        let remote = parker.clone();
        let handle = std::thread::spawn(move || {
            remote.park();
            remote.take_interrupt()
        });
        std::thread::sleep(Duration::from_millis(10));
        parker.interrupt();
        assert!(handle.join().unwrap());
        assert!(!parker.take_interrupt());
    }
}
