//! Per-lock client controller.
//!
//! A [`ClientLock`] decides whether a lock, unlock, wait or notify on one
//! [`LockId`] can be resolved from local state, or must be delegated to the
//! server through a [`RemoteLockManager`]. All state lives behind one mutex;
//! blocked threads park on a [`Parker`] owned by their chain entry and are
//! woken by whichever thread makes their request resolvable.
//!
//! Queuing is deliberately loose: any queued acquirer that is woken retries
//! from scratch, so a later request can succeed ahead of an earlier one that
//! is still blocked.

use super::greediness::ClientGreediness;
use super::remote::{ClientHandshakeMessage, FlushCallback, RemoteLockManager};
use super::state::{LockAcquireResult, LockHold, LockStateNode, LockWaiter, Parker, PendingLockHold};
use crate::chain::{Chain, Handle};
use crate::error::{LockError, Result};
use crate::types::{ClientId, LockContext, LockId, LockLevel, NotifyAction, ServerLockLevel, ThreadId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

static NEXT_WAITER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interruptible {
    Yes,
    No,
}

#[derive(Debug, Clone, Copy)]
enum Delegate {
    Lock,
    TryLock(Duration),
}

#[derive(Debug)]
struct LockState {
    greediness: ClientGreediness,
    chain: Chain<LockStateNode>,
    /// Reacquire entries queued for woken waiters, keyed by waiter id.
    reacquiring: HashMap<u64, Vec<Handle>>,
    /// Threads interrupted while in a non-interruptible acquire.
    deferred_interrupts: HashSet<ThreadId>,
    shutdown: bool,
}

/// Client-side state of one cluster lock.
#[derive(Debug)]
pub struct ClientLock {
    lock_id: LockId,
    state: Mutex<LockState>,
    pinned: AtomicBool,
    gc_cycle_count: AtomicU8,
}

impl ClientLock {
    pub fn new(lock_id: LockId) -> Self {
        Self {
            lock_id,
            state: Mutex::new(LockState {
                greediness: ClientGreediness::Free,
                chain: Chain::new(),
                reacquiring: HashMap::new(),
                deferred_interrupts: HashSet::new(),
                shutdown: false,
            }),
            pinned: AtomicBool::new(false),
            gc_cycle_count: AtomicU8::new(0),
        }
    }

    pub fn lock_id(&self) -> &LockId {
        &self.lock_id
    }

    /// Acquire `level` for `thread`, blocking until granted.
    ///
    /// Interrupts are ignored while blocked.
    pub fn lock(&self, remote: &dyn RemoteLockManager, thread: ThreadId, level: LockLevel) -> Result<()> {
        self.mark_used();
        if self.try_acquire_locally(thread, level)?.is_success() {
            return Ok(());
        }
        self.acquire_queued(remote, thread, level, Interruptible::No)
    }

    /// Like [`lock`](Self::lock), but fails with [`LockError::Interrupted`] if
    /// the thread is interrupted while blocked.
    pub fn lock_interruptibly(
        &self,
        remote: &dyn RemoteLockManager,
        thread: ThreadId,
        level: LockLevel,
    ) -> Result<()> {
        self.mark_used();
        if self.try_acquire_locally(thread, level)?.is_success() {
            return Ok(());
        }
        self.acquire_queued(remote, thread, level, Interruptible::Yes)
    }

    /// Acquire `level` only if it is available now.
    ///
    /// When local state cannot answer, this still costs one round trip to
    /// the server, and blocks for it.
    pub fn try_lock(&self, remote: &dyn RemoteLockManager, thread: ThreadId, level: LockLevel) -> Result<bool> {
        self.mark_used();
        let result = self.try_acquire_locally(thread, level)?;
        if result.is_known() {
            return Ok(result.is_success());
        }
        self.acquire_queued_timeout(remote, thread, level, Duration::ZERO, Interruptible::No)
    }

    /// Acquire `level`, giving up after `timeout`.
    pub fn try_lock_timeout(
        &self,
        remote: &dyn RemoteLockManager,
        thread: ThreadId,
        level: LockLevel,
        timeout: Duration,
    ) -> Result<bool> {
        self.mark_used();
        if self.try_acquire_locally(thread, level)?.is_success() {
            return Ok(true);
        }
        self.acquire_queued_timeout(remote, thread, level, timeout, Interruptible::Yes)
    }

    /// Release one hold of `level` by `thread`.
    pub fn unlock(&self, remote: &dyn RemoteLockManager, thread: ThreadId, level: LockLevel) -> Result<()> {
        self.mark_used();
        if level.is_concurrent() {
            return Ok(());
        }

        let handle = {
            let mut state = self.state.lock();
            let handle = state.find_hold(thread, level).ok_or_else(|| {
                LockError::IllegalMonitorState(format!(
                    "{} does not hold {} on {}",
                    thread, level, self.lock_id
                ))
            })?;
            if !level.is_sync_write() && !state.flush_on_unlock(handle) {
                state.release_hold(&self.lock_id, remote, handle)?;
                state.unpark_first_queued_acquire();
                return Ok(());
            }
            handle
        };

        if level.is_sync_write() {
            remote.wait_for_server_to_receive_txns(&self.lock_id);
        }
        remote.flush(&self.lock_id);

        let mut state = self.state.lock();
        state.release_hold(&self.lock_id, remote, handle)?;
        state.unpark_first_queued_acquire();
        Ok(())
    }

    /// Release every hold of `thread`, wait for a notify (or `timeout`), then
    /// reacquire the released holds.
    pub fn wait(&self, remote: &dyn RemoteLockManager, thread: ThreadId, timeout: Option<Duration>) -> Result<()> {
        self.mark_used();
        let flush = {
            let state = self.state.lock();
            if !state.is_locked_by(thread, |l| l.is_write()) {
                return Err(LockError::IllegalMonitorState(format!(
                    "{} waited on {} without holding a write lock",
                    thread, self.lock_id
                )));
            }
            state.greediness.flush_on_unlock() || state.is_locked_by(thread, |l| l.is_sync_write())
        };
        if flush {
            remote.flush(&self.lock_id);
        }

        let (waiter, waiter_id, parker) = {
            let mut state = self.state.lock();
            let pushed = state.release_all_and_push_waiter(&self.lock_id, remote, thread, timeout)?;
            state.unpark_first_queued_acquire();
            pushed
        };

        let outcome = self.park_waiter(remote, thread, waiter, &parker, timeout);
        if matches!(outcome, Err(LockError::NotRunning)) {
            self.state.lock().chain.remove(waiter);
            return outcome;
        }

        let reacquires = self.state.lock().claim_reacquires(waiter, waiter_id);
        let reacquired = self.acquire_all(remote, thread, reacquires, &parker);
        self.defer_interrupt(thread, &parker);
        reacquired?;
        outcome
    }

    /// Wake one or all local waiters.
    ///
    /// Returns `true` if the server must decide instead, because the client
    /// holds no greedy grant and waiters may exist on other clients.
    pub fn notify(&self, thread: ThreadId, action: NotifyAction) -> Result<bool> {
        let mut state = self.state.lock();
        if !state.is_locked_by(thread, |l| l.is_write()) {
            return Err(LockError::IllegalMonitorState(format!(
                "{} notified {} without holding a write lock",
                thread, self.lock_id
            )));
        }
        if state.greediness.is_free() {
            return Ok(true);
        }

        let mut cursor = state.chain.first();
        while let Some(handle) = cursor {
            cursor = state.chain.next(handle);
            if state.chain.get(handle).map_or(false, LockStateNode::is_waiter) {
                if let Some(parker) = state.move_waiter_to_pending(handle) {
                    parker.unpark();
                }
                if !action.is_all() {
                    break;
                }
            }
        }
        Ok(false)
    }

    /// The server notified `thread`, or timed out its wait.
    pub fn notified(&self, thread: ThreadId) {
        let mut state = self.state.lock();
        let waiter = state
            .chain
            .find(|n| n.as_waiter().map_or(false, |w| w.owner == thread));
        match waiter.and_then(|h| state.move_waiter_to_pending(h)) {
            Some(parker) => parker.unpark(),
            None => debug!(lock = %self.lock_id, %thread, "Notification for thread that is not waiting"),
        }
    }

    /// The server granted `level`, to the whole client if `thread` is
    /// [`ThreadId::VM_ID`], otherwise to that thread.
    pub fn award(&self, remote: &dyn RemoteLockManager, thread: ThreadId, level: ServerLockLevel) -> Result<()> {
        let mut state = self.state.lock();
        if thread.is_vm() {
            state.greediness = state.greediness.awarded(level)?;
            trace!(lock = %self.lock_id, greediness = %state.greediness, "Greedy award");
            state.unpark_first_queued_acquire();
            return Ok(());
        }

        match state.find_queued_acquire(thread, level) {
            Some(handle) => {
                if let Some(pending) = state.pending_mut(handle) {
                    pending.awarded = true;
                    pending.parker.unpark();
                }
            }
            None => {
                debug!(lock = %self.lock_id, %thread, %level, "Award for abandoned request, unlocking");
                remote.unlock(&self.lock_id, thread, level);
            }
        }
        Ok(())
    }

    /// The server refused a try-lock by `thread`.
    pub fn refuse(&self, thread: ThreadId, level: ServerLockLevel) {
        let mut state = self.state.lock();
        match state.find_queued_acquire(thread, level) {
            Some(handle) => {
                if let Some(pending) = state.pending_mut(handle) {
                    pending.refused = true;
                    pending.parker.unpark();
                }
            }
            None => debug!(lock = %self.lock_id, %thread, %level, "Refusal for unknown request"),
        }
    }

    /// The server wants the greedy grant back.
    ///
    /// Returns `true` if the grant is kept under a lease, in which case the
    /// caller must re-run the recall without a lease when it expires.
    pub fn recall(
        self: &Arc<Self>,
        remote: &Arc<dyn RemoteLockManager>,
        interest: ServerLockLevel,
        lease: Option<Duration>,
    ) -> Result<bool> {
        let mut state = self.state.lock();
        self.recall_locked(&mut state, remote, interest, lease)
    }

    /// Try to retire this lock. Returns `true` once it is garbage.
    ///
    /// An empty, unpinned lock becomes garbage on the second consecutive
    /// sweep that finds it idle. A lock still holding a greedy grant is
    /// recalled instead.
    pub fn try_mark_as_garbage(self: &Arc<Self>, remote: &Arc<dyn RemoteLockManager>) -> bool {
        let mut state = self.state.lock();
        if !self.is_pinned() && state.chain.is_empty() && self.gc_cycle_count.load(Ordering::Acquire) > 0 {
            state.greediness = state.greediness.mark_as_garbage();
            if state.greediness.is_garbage() {
                return true;
            }
            if let Err(e) = self.recall_locked(&mut state, remote, ServerLockLevel::Write, None) {
                warn!(lock = %self.lock_id, error = %e, "Recall of idle lock failed");
            }
        } else {
            let _ = self
                .gc_cycle_count
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_add(1));
        }
        false
    }

    /// Add this lock's state to a reconnect handshake.
    pub fn initialize_handshake(&self, client: ClientId, message: &mut dyn ClientHandshakeMessage) {
        let mut state = self.state.lock();
        for context in state.filtered_contexts(&self.lock_id, client, true) {
            message.add_lock_context(context);
        }
        state.delegate_queued("reported in handshake");
    }

    /// Full, unfiltered state of this lock.
    pub fn state_snapshot(&self, client: ClientId) -> Vec<LockContext> {
        let state = self.state.lock();
        let greedy = state.greediness.to_context(&self.lock_id, client);
        greedy
            .into_iter()
            .chain(state.chain.iter().map(|(_, n)| n.to_context(&self.lock_id, client)))
            .collect()
    }

    /// Interrupt `thread` if it is blocked on this lock.
    pub fn interrupt(&self, thread: ThreadId) -> bool {
        let state = self.state.lock();
        let mut interrupted = false;
        for (_, node) in state.chain.iter() {
            if node.owner() == thread {
                if let Some(parker) = node.parker() {
                    parker.interrupt();
                    interrupted = true;
                }
            }
        }
        interrupted
    }

    /// Clear and return an interrupt `thread` received while it could not
    /// be interrupted.
    pub fn take_deferred_interrupt(&self, thread: ThreadId) -> bool {
        self.state.lock().deferred_interrupts.remove(&thread)
    }

    /// Wake every blocked thread with [`LockError::NotRunning`].
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        for (_, node) in state.chain.iter() {
            if let Some(parker) = node.parker() {
                parker.unpark();
            }
        }
    }

    pub fn greediness(&self) -> ClientGreediness {
        self.state.lock().greediness
    }

    pub fn is_locked(&self, level: LockLevel) -> bool {
        let state = self.state.lock();
        let held = state.holds().any(|h| h.level == level);
        held
    }

    pub fn is_locked_by(&self, thread: ThreadId, level: LockLevel) -> bool {
        self.state.lock().is_locked_by(thread, |l| l == level)
    }

    pub fn hold_count(&self, level: LockLevel) -> usize {
        self.state.lock().holds().filter(|h| h.level == level).count()
    }

    /// Levels held by `thread`, most recent first.
    pub fn holds_of(&self, thread: ThreadId) -> Vec<LockLevel> {
        let state = self.state.lock();
        state.holds().filter(|h| h.owner == thread).map(|h| h.level).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending_count()
    }

    pub fn waiting_count(&self) -> usize {
        self.state.lock().chain.iter().filter(|(_, n)| n.is_waiter()).count()
    }

    pub fn pin(&self) {
        self.pinned.store(true, Ordering::Release);
    }

    pub fn unpin(&self) {
        self.pinned.store(false, Ordering::Release);
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned.load(Ordering::Acquire)
    }

    fn mark_used(&self) {
        self.gc_cycle_count.store(0, Ordering::Release);
    }

    fn try_acquire_locally(&self, thread: ThreadId, level: LockLevel) -> Result<LockAcquireResult> {
        if level.is_concurrent() {
            return Ok(LockAcquireResult::SharedSuccess);
        }
        self.state.lock().try_acquire_locally(thread, level, true)
    }

    fn acquire_queued(
        &self,
        remote: &dyn RemoteLockManager,
        thread: ThreadId,
        level: LockLevel,
        interruptible: Interruptible,
    ) -> Result<()> {
        let parker = Parker::new();
        let handle = self
            .state
            .lock()
            .push_pending(PendingLockHold::new(thread, level, parker.clone()));
        let result = self.acquire_queued_node(remote, thread, level, handle, &parker, interruptible, true);
        self.defer_interrupt(thread, &parker);
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn acquire_queued_node(
        &self,
        remote: &dyn RemoteLockManager,
        thread: ThreadId,
        level: LockLevel,
        handle: Handle,
        parker: &Parker,
        interruptible: Interruptible,
        check_upgrade: bool,
    ) -> Result<()> {
        loop {
            let result = match self.try_acquire(remote, thread, level, Delegate::Lock, handle, check_upgrade) {
                Ok(result) => result,
                Err(e) => {
                    self.abort_and_remove(remote, handle);
                    return Err(e);
                }
            };

            {
                let mut state = self.state.lock();
                if result.is_shared() {
                    state.unpark_next_queued_acquire(handle);
                }
                if result.is_success() {
                    state.chain.remove(handle);
                    return Ok(());
                }
            }

            parker.park();
            if let Err(e) = self.check_parked(thread, parker, interruptible) {
                self.abort_and_remove(remote, handle);
                return Err(e);
            }
        }
    }

    fn acquire_queued_timeout(
        &self,
        remote: &dyn RemoteLockManager,
        thread: ThreadId,
        level: LockLevel,
        timeout: Duration,
        interruptible: Interruptible,
    ) -> Result<bool> {
        let parker = Parker::new();
        let handle = self
            .state
            .lock()
            .push_pending(PendingLockHold::new_try(thread, level, timeout, parker.clone()));
        let result = self.try_acquire_until(remote, thread, level, timeout, handle, &parker, interruptible);
        self.defer_interrupt(thread, &parker);
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn try_acquire_until(
        &self,
        remote: &dyn RemoteLockManager,
        thread: ThreadId,
        level: LockLevel,
        timeout: Duration,
        handle: Handle,
        parker: &Parker,
        interruptible: Interruptible,
    ) -> Result<bool> {
        let mut remaining = timeout;
        loop {
            if self.state.lock().pending(handle).map_or(true, |p| p.refused) {
                break;
            }

            let result = match self.try_acquire(remote, thread, level, Delegate::TryLock(remaining), handle, true) {
                Ok(result) => result,
                Err(e) => {
                    self.abort_and_remove(remote, handle);
                    return Err(e);
                }
            };

            let can_delegate = {
                let mut state = self.state.lock();
                if result.is_shared() {
                    state.unpark_next_queued_acquire(handle);
                } else {
                    state.unpark_subsequent_try_locks(handle);
                }
                if result.is_success() {
                    state.chain.remove(handle);
                    return Ok(true);
                }
                state.pending(handle).map_or(false, |p| p.can_delegate())
            };

            if remaining.is_zero() && (result.is_failure() || can_delegate) {
                self.abort_and_remove(remote, handle);
                return Ok(false);
            }

            let started = Instant::now();
            if can_delegate {
                parker.park_until(started + remaining);
            } else {
                // The server enforces the timeout and will answer.
                parker.park();
            }
            if let Err(e) = self.check_parked(thread, parker, interruptible) {
                self.abort_and_remove(remote, handle);
                return Err(e);
            }
            remaining = remaining.saturating_sub(started.elapsed());
        }

        let mut state = self.state.lock();
        state.chain.remove(handle);
        let result = state.try_acquire_locally(thread, level, true)?;
        if result.is_shared() {
            state.unpark_first_queued_acquire();
        }
        Ok(result.is_success())
    }

    fn try_acquire(
        &self,
        remote: &dyn RemoteLockManager,
        thread: ThreadId,
        level: LockLevel,
        delegate: Delegate,
        handle: Handle,
        check_upgrade: bool,
    ) -> Result<LockAcquireResult> {
        let mut state = self.state.lock();
        let result = state.try_acquire_locally(thread, level, check_upgrade)?;
        if result.is_known() {
            return Ok(result);
        }
        if !state.pending(handle).map_or(false, |p| p.can_delegate()) {
            return Ok(result);
        }

        let server_level = ServerLockLevel::from(level);
        state.greediness = state.greediness.requested(server_level)?;
        if state.greediness.is_free() {
            match delegate {
                Delegate::Lock => remote.lock(&self.lock_id, thread, server_level),
                Delegate::TryLock(timeout) => remote.try_lock(&self.lock_id, thread, server_level, timeout),
            }
            state.mark_delegated(handle, "requested from server");
            return Ok(LockAcquireResult::UsedServer);
        }
        if !state.greediness.is_recalled() {
            state.mark_delegated(handle, "waiting for recall");
            return Ok(LockAcquireResult::UsedServer);
        }
        drop(state);

        // Recalled: flush, then commit the recall ourselves if nothing
        // prevents it.
        remote.flush(&self.lock_id);
        let mut state = self.state.lock();
        if state.greediness.is_recalled() && state.can_recall_now() {
            state.recall_commit(&self.lock_id, remote)?;
        }
        state.mark_delegated(handle, "waiting for recall");
        Ok(LockAcquireResult::UsedServer)
    }

    fn check_parked(&self, thread: ThreadId, parker: &Parker, interruptible: Interruptible) -> Result<()> {
        let mut state = self.state.lock();
        if state.shutdown {
            return Err(LockError::NotRunning);
        }
        if parker.take_interrupt() {
            if interruptible == Interruptible::Yes {
                return Err(LockError::Interrupted(self.lock_id.to_string()));
            }
            trace!(lock = %self.lock_id, %thread, "Interrupt deferred until the acquire completes");
            state.deferred_interrupts.insert(thread);
        }
        Ok(())
    }

    /// Keep an interrupt that reached `parker` after its last check.
    fn defer_interrupt(&self, thread: ThreadId, parker: &Parker) {
        if parker.take_interrupt() {
            self.state.lock().deferred_interrupts.insert(thread);
        }
    }

    /// Drop a queued acquire, giving back anything the server already granted.
    fn abort_and_remove(&self, remote: &dyn RemoteLockManager, handle: Handle) {
        let mut state = self.state.lock();
        if let Some(LockStateNode::Pending(pending)) = state.chain.remove(handle) {
            if pending.awarded {
                remote.unlock(&self.lock_id, pending.owner, pending.server_level());
            }
        }
        state.unpark_first_queued_acquire();
    }

    fn park_waiter(
        &self,
        remote: &dyn RemoteLockManager,
        thread: ThreadId,
        waiter: Handle,
        parker: &Parker,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            match deadline {
                Some(deadline) => parker.park_until(deadline),
                None => parker.park(),
            }

            let mut state = self.state.lock();
            if !state.chain.contains(waiter) {
                return Ok(());
            }
            if state.shutdown {
                return Err(LockError::NotRunning);
            }
            if parker.take_interrupt() {
                if state.greediness.is_free() {
                    remote.interrupt(&self.lock_id, thread);
                }
                state.move_waiter_to_pending(waiter);
                return Err(LockError::Interrupted(self.lock_id.to_string()));
            }
            if deadline.map_or(false, |d| Instant::now() >= d) {
                state.move_waiter_to_pending(waiter);
                return Ok(());
            }
        }
    }

    /// Reacquire the holds a waiter gave up, most recent first.
    fn acquire_all(
        &self,
        remote: &dyn RemoteLockManager,
        thread: ThreadId,
        handles: Vec<Handle>,
        parker: &Parker,
    ) -> Result<()> {
        let mut handles = handles.into_iter();
        while let Some(handle) = handles.next() {
            let level = match self.state.lock().pending(handle) {
                Some(pending) => pending.level,
                None => continue,
            };
            if let Err(e) = self.acquire_queued_node(remote, thread, level, handle, parker, Interruptible::No, false) {
                for rest in handles.by_ref() {
                    self.abort_and_remove(remote, rest);
                }
                if matches!(e, LockError::GarbageLock) {
                    error!(lock = %self.lock_id, %thread, "Lock collected while reacquiring after wait");
                    return Err(LockError::ProtocolViolation(format!(
                        "lock {} became garbage while {} was reacquiring it",
                        self.lock_id, thread
                    )));
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn recall_locked(
        self: &Arc<Self>,
        state: &mut LockState,
        remote: &Arc<dyn RemoteLockManager>,
        interest: ServerLockLevel,
        lease: Option<Duration>,
    ) -> Result<bool> {
        let previous = state.greediness;
        let has_pending = state.pending_count() > 0;
        state.greediness = previous.recalled(lease, has_pending);
        debug!(
            lock = %self.lock_id,
            %interest,
            from = %previous,
            to = %state.greediness,
            "Recall received"
        );

        if state.greediness.is_recalled() {
            self.do_recall(state, remote)?;
            return Ok(false);
        }
        Ok(state.greediness.is_greedy())
    }

    fn do_recall(self: &Arc<Self>, state: &mut LockState, remote: &Arc<dyn RemoteLockManager>) -> Result<()> {
        if !state.can_recall_now() {
            debug!(lock = %self.lock_id, "Recall deferred until local write holds are released");
            return Ok(());
        }

        let lock = Arc::downgrade(self);
        let callback_remote = Arc::clone(remote);
        let callback: FlushCallback = Box::new(move |_: &LockId| {
            if let Some(lock) = lock.upgrade() {
                lock.flushed_for_recall(callback_remote.as_ref());
            }
        });

        if remote.async_flush(&self.lock_id, callback) {
            state.recall_commit(&self.lock_id, remote.as_ref())
        } else {
            state.greediness = state.greediness.recall_in_progress()?;
            Ok(())
        }
    }

    fn flushed_for_recall(&self, remote: &dyn RemoteLockManager) {
        let mut state = self.state.lock();
        if !state.greediness.is_recall_in_progress() {
            return;
        }
        if let Err(e) = state.recall_commit(&self.lock_id, remote) {
            error!(lock = %self.lock_id, error = %e, "Recall commit after flush failed");
        }
    }
}

impl LockState {
    fn holds(&self) -> impl Iterator<Item = &LockHold> {
        self.chain.iter().filter_map(|(_, n)| n.as_hold())
    }

    fn is_locked_by<F>(&self, thread: ThreadId, pred: F) -> bool
    where
        F: Fn(LockLevel) -> bool,
    {
        self.holds().any(|h| h.owner == thread && pred(h.level))
    }

    fn find_hold(&self, thread: ThreadId, level: LockLevel) -> Option<Handle> {
        self.chain
            .find(|n| n.as_hold().map_or(false, |h| h.owner == thread && h.level == level))
    }

    fn pending(&self, handle: Handle) -> Option<&PendingLockHold> {
        self.chain.get(handle).and_then(LockStateNode::as_pending)
    }

    fn pending_mut(&mut self, handle: Handle) -> Option<&mut PendingLockHold> {
        self.chain.get_mut(handle).and_then(LockStateNode::as_pending_mut)
    }

    fn pending_count(&self) -> usize {
        self.chain.iter().filter(|(_, n)| n.is_pending()).count()
    }

    fn mark_delegated(&mut self, handle: Handle, reason: &'static str) {
        if let Some(pending) = self.pending_mut(handle) {
            pending.delegated(reason);
        }
    }

    /// A recall may complete only while no thread holds a write lock.
    fn can_recall_now(&self) -> bool {
        !self.holds().any(|h| h.level.is_write())
    }

    fn try_acquire_locally(
        &mut self,
        thread: ThreadId,
        level: LockLevel,
        check_upgrade: bool,
    ) -> Result<LockAcquireResult> {
        if level.is_concurrent() {
            return Ok(LockAcquireResult::SharedSuccess);
        }

        let hold = LockHold::new(thread, level);
        let known = self
            .chain
            .iter()
            .map(|(_, n)| n.allows_hold(&hold))
            .find(|r| r.is_known());

        if let Some(result) = known {
            if result.is_success() {
                self.chain.push_front(LockStateNode::Hold(hold));
            } else if check_upgrade {
                self.check_upgrade(thread, level)?;
            }
            return Ok(result);
        }

        if check_upgrade {
            self.check_upgrade(thread, level)?;
        }
        if self.greediness.can_award(level)? {
            self.chain.push_front(LockStateNode::Hold(hold));
            return Ok(if level.is_write() {
                LockAcquireResult::Success
            } else {
                LockAcquireResult::SharedSuccess
            });
        }
        Ok(LockAcquireResult::Unknown)
    }

    fn check_upgrade(&self, thread: ThreadId, level: LockLevel) -> Result<()> {
        if level.is_write() && self.is_locked_by(thread, |l| l == LockLevel::Read) {
            return Err(LockError::UpgradeNotSupported(format!(
                "{} requested {} while holding READ",
                thread, level
            )));
        }
        Ok(())
    }

    /// Queue an acquire behind other queued acquires, ahead of waiters.
    fn push_pending(&mut self, pending: PendingLockHold) -> Handle {
        match self.chain.find(LockStateNode::is_waiter) {
            Some(first_waiter) => self
                .chain
                .insert_before(first_waiter, LockStateNode::Pending(pending)),
            None => self.chain.push_back(LockStateNode::Pending(pending)),
        }
    }

    fn find_queued_acquire(&self, thread: ThreadId, level: ServerLockLevel) -> Option<Handle> {
        self.chain.find(|n| {
            n.as_pending().map_or(false, |p| {
                p.owner == thread && p.server_level() == level && !p.awarded && !p.refused
            })
        })
    }

    fn unpark_first_queued_acquire(&self) {
        if let Some((_, node)) = self.chain.iter().find(|(_, n)| n.is_pending()) {
            if let Some(parker) = node.parker() {
                parker.unpark();
            }
        }
    }

    fn unpark_next_queued_acquire(&self, after: Handle) {
        let mut cursor = self.chain.next(after);
        while let Some(handle) = cursor {
            if let Some(pending) = self.pending(handle) {
                pending.parker.unpark();
                return;
            }
            cursor = self.chain.next(handle);
        }
    }

    fn unpark_subsequent_try_locks(&self, after: Handle) {
        let mut cursor = self.chain.next(after);
        while let Some(handle) = cursor {
            if let Some(pending) = self.pending(handle) {
                if pending.try_timeout.is_some() {
                    pending.parker.unpark();
                }
            }
            cursor = self.chain.next(handle);
        }
    }

    fn flush_on_unlock(&self, handle: Handle) -> bool {
        if !self.greediness.flush_on_unlock() {
            return false;
        }
        let Some(hold) = self.chain.get(handle).and_then(LockStateNode::as_hold) else {
            return false;
        };
        for (other_handle, node) in self.chain.iter() {
            if other_handle == handle {
                continue;
            }
            if let Some(other) = node.as_hold() {
                if other.owner == hold.owner && (other.level.is_write() || hold.level.is_read()) {
                    return false;
                }
            }
        }
        true
    }

    fn release_hold(&mut self, lock_id: &LockId, remote: &dyn RemoteLockManager, handle: Handle) -> Result<()> {
        let hold = match self.chain.remove(handle) {
            Some(LockStateNode::Hold(hold)) => hold,
            _ => return Ok(()),
        };

        if self.greediness.is_free() {
            self.remote_unlock(lock_id, remote, &hold);
        } else if self.greediness.is_recalled() && self.can_recall_now() {
            self.recall_commit(lock_id, remote)?;
        }
        Ok(())
    }

    /// The server tracks one context per thread, so only the thread's last
    /// covering hold is unlocked remotely.
    fn remote_unlock(&self, lock_id: &LockId, remote: &dyn RemoteLockManager, hold: &LockHold) {
        for other in self.holds().filter(|h| h.owner == hold.owner) {
            if !hold.level.is_write() || other.level.is_write() {
                return;
            }
        }
        remote.unlock(lock_id, hold.owner, hold.level.into());
    }

    fn recall_commit(&mut self, lock_id: &LockId, remote: &dyn RemoteLockManager) -> Result<()> {
        if self.greediness.is_free() {
            return Ok(());
        }
        let contexts = self.filtered_contexts(lock_id, remote.client_id(), false);
        self.delegate_queued("attached to recall commit");
        debug!(lock = %lock_id, contexts = contexts.len(), greediness = %self.greediness, "Committing recall");
        remote.recall_commit(lock_id, contexts);
        self.greediness = self.greediness.recall_committed()?;
        Ok(())
    }

    /// Mark every queued acquire, including waiters' reacquires, as known
    /// to the server.
    fn delegate_queued(&mut self, reason: &'static str) {
        self.chain.for_each_mut(|node| match node {
            LockStateNode::Pending(pending) => pending.delegated(reason),
            LockStateNode::Waiter(waiter) => waiter.delegate_reacquires(reason),
            LockStateNode::Hold(_) => {}
        });
    }

    /// Per-thread collapsed view of this lock: one hold and one pending
    /// request per thread (write dominating read), plus every waiter.
    ///
    /// With `greedy`, a greedy grant stands in for everything else.
    fn filtered_contexts(&self, lock_id: &LockId, client: ClientId, greedy: bool) -> Vec<LockContext> {
        if greedy {
            if let Some(context) = self.greediness.to_context(lock_id, client) {
                return vec![context];
            }
        }

        let mut waiters = Vec::new();
        let mut holds: Vec<LockContext> = Vec::new();
        let mut pends: Vec<LockContext> = Vec::new();
        for (_, node) in self.chain.iter() {
            let context = node.to_context(lock_id, client);
            match node {
                LockStateNode::Hold(_) => merge_by_thread(&mut holds, context),
                LockStateNode::Pending(_) => merge_by_thread(&mut pends, context),
                LockStateNode::Waiter(_) => waiters.push(context),
            }
        }
        waiters.extend(holds);
        waiters.extend(pends);
        waiters
    }

    /// Release all holds of `thread` and queue it as a waiter.
    fn release_all_and_push_waiter(
        &mut self,
        lock_id: &LockId,
        remote: &dyn RemoteLockManager,
        thread: ThreadId,
        timeout: Option<Duration>,
    ) -> Result<(Handle, u64, Arc<Parker>)> {
        let mut released: Vec<LockHold> = self
            .chain
            .remove_where(|n| n.as_hold().map_or(false, |h| h.owner == thread))
            .into_iter()
            .filter_map(|n| n.as_hold().copied())
            .collect();
        // Chain order is most recent first; the stack is kept in acquisition order.
        released.reverse();

        let free = self.greediness.is_free();
        let parker = Parker::new();
        let reacquires = released
            .iter()
            .map(|hold| {
                let mut pending = PendingLockHold::new(thread, hold.level, parker.clone());
                if free {
                    pending.delegated("server requeues waiter");
                }
                pending
            })
            .collect();

        let id = NEXT_WAITER_ID.fetch_add(1, Ordering::Relaxed);
        let handle = self.chain.push_back(LockStateNode::Waiter(LockWaiter {
            id,
            owner: thread,
            reacquires,
            timeout,
            parker: parker.clone(),
        }));

        if free {
            remote.wait(lock_id, thread, timeout);
        } else if self.greediness.is_recalled() && self.can_recall_now() {
            self.recall_commit(lock_id, remote)?;
        }
        Ok((handle, id, parker))
    }

    /// Turn a waiter back into queued acquires. Returns the waiter's parker.
    fn move_waiter_to_pending(&mut self, handle: Handle) -> Option<Arc<Parker>> {
        let mut waiter = match self.chain.remove(handle) {
            Some(LockStateNode::Waiter(waiter)) => waiter,
            _ => return None,
        };
        let mut handles = Vec::with_capacity(waiter.reacquires.len());
        while let Some(pending) = waiter.reacquires.pop() {
            handles.push(self.push_pending(pending));
        }
        self.reacquiring.insert(waiter.id, handles);
        Some(waiter.parker)
    }

    fn claim_reacquires(&mut self, waiter: Handle, waiter_id: u64) -> Vec<Handle> {
        if self.chain.contains(waiter) {
            self.move_waiter_to_pending(waiter);
        }
        self.reacquiring.remove(&waiter_id).unwrap_or_default()
    }
}

fn merge_by_thread(contexts: &mut Vec<LockContext>, context: LockContext) {
    match contexts.iter_mut().find(|c| c.thread_id == context.thread_id) {
        Some(existing) => {
            if context.state.lock_level().is_write() && existing.state.lock_level().is_read() {
                *existing = context;
            }
        }
        None => contexts.push(context),
    }
}
