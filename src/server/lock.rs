//! Server-side state of one lock.
//!
//! A [`ServerLock`] keeps an ordered chain of [`ServerLockContext`]s:
//! holders first, then queued requests in arrival order, then waiters.
//! Every operation runs with the lock checked out of the
//! [`LockStore`](super::LockStore), so nothing here synchronizes.
//!
//! Which queued requests get awarded, and to whom, is decided by the lock's
//! [`LockPolicy`]: see [`greedy`](super::greedy) and
//! [`non_greedy`](super::non_greedy).

use super::context::ServerLockContext;
use super::greedy;
use super::helper::{LockHelper, LockResponse};
use super::non_greedy;
use crate::chain::{Chain, Handle};
use crate::config::LockPolicy;
use crate::error::{LockError, Result};
use crate::types::{
    ClientId, ContextType, LockContext, LockContextState, LockId, LockInfo, NotifyAction, ServerLockLevel, ThreadId,
};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Server view of one lock.
pub struct ServerLock {
    lock_id: LockId,
    policy: LockPolicy,
    pub(super) contexts: Chain<ServerLockContext>,
    /// Greedy holders with an outstanding recall.
    pub(super) recalled: HashSet<ClientId>,
}

impl ServerLock {
    pub fn new(lock_id: LockId, policy: LockPolicy) -> Self {
        Self {
            lock_id,
            policy,
            contexts: Chain::new(),
            recalled: HashSet::new(),
        }
    }

    pub fn lock_id(&self) -> &LockId {
        &self.lock_id
    }

    pub fn policy(&self) -> LockPolicy {
        self.policy
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn is_recalled(&self) -> bool {
        !self.recalled.is_empty()
    }

    /// The whole chain, in order.
    pub fn contexts(&self) -> Vec<LockContext> {
        self.contexts.iter().map(|(_, c)| c.to_context(&self.lock_id)).collect()
    }

    /// Queue a blocking request and award whatever can be awarded.
    pub fn lock(&mut self, client: ClientId, thread: ThreadId, level: ServerLockLevel, helper: &LockHelper) -> Result<()> {
        let pending = self.validate_request(client, thread, level)?;
        debug!(lock = %self.lock_id, %client, %thread, %level, pending, "Lock requested");
        let request = ServerLockContext::new(client, thread, LockContextState::pending(level));
        self.request_lock(request, helper);
        Ok(())
    }

    /// Queue a request that gives up after `timeout`.
    ///
    /// A zero timeout that cannot be awarded right away is refused without
    /// queueing anything.
    pub fn try_lock(
        &mut self,
        client: ClientId,
        thread: ThreadId,
        level: ServerLockLevel,
        timeout: Duration,
        helper: &LockHelper,
    ) -> Result<()> {
        self.validate_request(client, thread, level)?;
        if timeout.is_zero() && !self.can_award(level) {
            self.refuse_try_with_no_timeout(client, thread, level, helper);
            return Ok(());
        }

        let mut request =
            ServerLockContext::new(client, thread, LockContextState::try_pending(level)).with_timeout(Some(timeout));
        if !timeout.is_zero() {
            self.schedule_timer(&mut request, helper);
        }
        self.request_lock(request, helper);
        Ok(())
    }

    /// Send the requester this lock's holders, waiters and queue length.
    pub fn query(&self, client: ClientId, thread: ThreadId, helper: &LockHelper) {
        let info = LockInfo {
            contexts: self
                .contexts
                .iter()
                .filter(|(_, c)| c.is_holder() || c.is_waiter())
                .map(|(_, c)| c.to_context(&self.lock_id))
                .collect(),
            pending_count: self.pending_count(),
        };
        helper.sink.send(&self.lock_id, client, thread, LockResponse::Info(info));
    }

    /// Wake a waiting thread early. It queues for the lock again.
    pub fn interrupt(&mut self, client: ClientId, thread: ThreadId, helper: &LockHelper) {
        match self.remove_matching(client, thread, ServerLockContext::is_waiter) {
            Some(waiter) => {
                debug!(lock = %self.lock_id, %client, %thread, "Waiter interrupted");
                self.move_waiter_to_pending(waiter);
                self.process_pending(helper);
            }
            None => warn!(lock = %self.lock_id, %client, %thread, "Interrupt for thread that is not waiting"),
        }
    }

    /// Move one or all waiters back into the queue.
    ///
    /// Returns the waiters that were notified, so the caller can tell their
    /// clients. Nothing is awarded: the notifier still holds the lock.
    pub fn notify(
        &mut self,
        client: ClientId,
        thread: ThreadId,
        action: NotifyAction,
    ) -> Result<Vec<LockContext>> {
        self.validate_monitor_holder(client, thread, "notify")?;
        let waiters = self.remove_waiters(action);
        let notified = waiters.iter().map(|w| w.to_context(&self.lock_id)).collect();
        for waiter in waiters {
            self.move_waiter_to_pending(waiter);
        }
        trace!(lock = %self.lock_id, ?action, pending = self.pending_count(), "Notified");
        Ok(notified)
    }

    /// Turn the write holder of `thread` into a waiter.
    pub fn wait(
        &mut self,
        client: ClientId,
        thread: ThreadId,
        timeout: Option<Duration>,
        helper: &LockHelper,
    ) -> Result<()> {
        self.validate_monitor_holder(client, thread, "wait")?;
        self.remove_matching(client, thread, |c| c.is_holder() && !c.is_greedy_holder());

        let mut waiter = ServerLockContext::new(client, thread, LockContextState::Waiter).with_timeout(timeout);
        self.schedule_timer(&mut waiter, helper);
        self.add_waiter(waiter);
        self.process_pending(helper);
        Ok(())
    }

    /// Release the hold of `thread`, or the greedy grant of `client` when
    /// `thread` is [`ThreadId::VM_ID`].
    pub fn unlock(&mut self, client: ClientId, thread: ThreadId, helper: &LockHelper) {
        match self.remove_matching(client, thread, ServerLockContext::is_holder) {
            Some(holder) => {
                trace!(lock = %self.lock_id, holder = %holder, "Unlocked");
                if holder.is_greedy_holder() {
                    self.recalled.remove(&client);
                }
            }
            None => {
                debug!(lock = %self.lock_id, %client, %thread, "Unlock by non-holder ignored");
                return;
            }
        }
        if !self.is_empty() {
            self.process_pending(helper);
        }
    }

    /// Restore state a reconnecting client held before the disconnect.
    ///
    /// Holders are accepted without a response; they must still be
    /// compatible with what is already held.
    pub fn reestablish_state(&mut self, context: &LockContext, helper: &LockHelper) -> Result<()> {
        if self
            .contexts
            .find(|c| c.belongs_to(context.client_id, context.thread_id))
            .is_some()
        {
            return Err(LockError::ProtocolViolation(format!(
                "{}/{} reestablished twice on {}",
                context.client_id, context.thread_id, self.lock_id
            )));
        }

        match context.state.context_type() {
            ContextType::Holder | ContextType::GreedyHolder => {
                let level = context.state.lock_level();
                if !self.can_award(level) {
                    return Err(LockError::ProtocolViolation(format!(
                        "{} cannot be reestablished at {} on {}",
                        context.client_id, level, self.lock_id
                    )));
                }
                self.add_holder(ServerLockContext::from(context).with_timeout(None));
            }
            ContextType::Waiter => {
                let mut waiter = ServerLockContext::from(context);
                self.schedule_timer(&mut waiter, helper);
                self.add_waiter(waiter);
            }
            ContextType::Pending | ContextType::TryPending => {
                return Err(LockError::InvalidState(format!(
                    "queued request {:?} must be replayed, not reestablished",
                    context.state
                )))
            }
        }
        debug!(lock = %self.lock_id, client = %context.client_id, thread = %context.thread_id, state = ?context.state, "Reestablished");
        Ok(())
    }

    /// Absorb the per-thread state a recalled client was hiding behind its
    /// greedy grant.
    pub fn recall_commit(&mut self, client: ClientId, contexts: Vec<LockContext>, helper: &LockHelper) -> Result<()> {
        match self.policy {
            LockPolicy::Greedy => greedy::recall_commit(self, client, contexts, helper),
            LockPolicy::NonGreedy => Err(LockError::ProtocolViolation(format!(
                "{} committed a recall of non-greedy lock {}",
                client, self.lock_id
            ))),
        }
    }

    /// Drop everything `client` had here. Returns `true` if the lock is now
    /// empty.
    pub fn clear_state_for_node(&mut self, client: ClientId, helper: &LockHelper) -> bool {
        let removed = self.contexts.remove_where(|c| c.client_id == client);
        self.recalled.remove(&client);
        if !removed.is_empty() {
            info!(lock = %self.lock_id, %client, contexts = removed.len(), "Cleared state of departed client");
            for mut context in removed {
                context.cancel_timer();
            }
            self.process_pending(helper);
        }
        self.is_empty()
    }

    /// A try-lock or wait timer fired.
    ///
    /// An expired try-lock is refused. An expired wait is reported to the
    /// client and then requests the write lock again on the thread's behalf.
    pub fn timer_timeout(&mut self, client: ClientId, thread: ThreadId, timer_id: u64, helper: &LockHelper) {
        let Some(handle) = self
            .contexts
            .find(|c| c.belongs_to(client, thread) && c.timer_id() == Some(timer_id))
        else {
            trace!(lock = %self.lock_id, %client, %thread, timer_id, "Stale timer ignored");
            return;
        };
        let Some(context) = self.contexts.remove(handle) else {
            return;
        };

        if context.is_waiter() {
            debug!(lock = %self.lock_id, %client, %thread, "Wait timed out, requesting write lock");
            helper.sink.send(&self.lock_id, client, thread, LockResponse::WaitTimeout);
            if let Err(e) = self.lock(client, thread, ServerLockLevel::Write, helper) {
                error!(lock = %self.lock_id, %client, %thread, error = %e, "Relock after wait timeout failed");
            }
        } else if context.is_try_pending() {
            debug!(lock = %self.lock_id, %client, %thread, "Try-lock timed out");
            self.cannot_award(client, thread, context.level(), helper);
            self.process_pending(helper);
        }
    }

    // Policy dispatch.

    fn request_lock(&mut self, request: ServerLockContext, helper: &LockHelper) {
        match self.policy {
            LockPolicy::Greedy => greedy::request_lock(self, request, helper),
            LockPolicy::NonGreedy => {
                self.add(request);
                non_greedy::process_pending(self, helper);
            }
        }
    }

    pub(super) fn process_pending(&mut self, helper: &LockHelper) {
        match self.policy {
            LockPolicy::Greedy => greedy::process_pending(self, helper),
            LockPolicy::NonGreedy => non_greedy::process_pending(self, helper),
        }
    }

    fn refuse_try_with_no_timeout(&mut self, client: ClientId, thread: ThreadId, level: ServerLockLevel, helper: &LockHelper) {
        self.cannot_award(client, thread, level, helper);
        if self.policy == LockPolicy::Greedy {
            greedy::recall(self, level, helper);
        }
    }

    // Validation.

    /// Reject requests that conflict with what `thread` already has here.
    /// Returns the number of queued requests.
    fn validate_request(&self, client: ClientId, thread: ThreadId, level: ServerLockLevel) -> Result<usize> {
        let mut pending = 0;
        for (_, context) in self.contexts.iter() {
            if context.belongs_to(client, thread) {
                if context.is_holder() {
                    if level.is_write() && context.level().is_read() {
                        return Err(LockError::UpgradeNotSupported(format!(
                            "{}/{} holds {} for read",
                            client, thread, self.lock_id
                        )));
                    }
                    if context.level() == level {
                        return Err(LockError::ProtocolViolation(format!(
                            "{}/{} already holds {} at {}",
                            client, thread, self.lock_id, level
                        )));
                    }
                } else if context.is_waiter() {
                    return Err(LockError::ProtocolViolation(format!(
                        "{}/{} requested {} while waiting on it",
                        client, thread, self.lock_id
                    )));
                }
            }
            if context.is_pending() {
                pending += 1;
            }
        }
        Ok(pending)
    }

    /// Wait and notify need a write hold, held directly or through the
    /// client's greedy grant.
    fn validate_monitor_holder(&self, client: ClientId, thread: ThreadId, operation: &str) -> Result<()> {
        let handle = match self.contexts.find(|c| c.belongs_to(client, thread) && c.is_holder()) {
            None if self.policy == LockPolicy::Greedy => {
                self.contexts.find(|c| c.client_id == client && c.is_greedy_holder())
            }
            found => found,
        };
        let holder = handle.and_then(|h| self.contexts.get(h));
        match holder {
            Some(holder) if holder.level().is_write() => Ok(()),
            Some(holder) => Err(LockError::IllegalMonitorState(format!(
                "{} on {} by {}/{} holding {:?}",
                operation, self.lock_id, client, thread, holder.state
            ))),
            None => Err(LockError::IllegalMonitorState(format!(
                "{} on {} by {}/{} without holding it",
                operation, self.lock_id, client, thread
            ))),
        }
    }

    // Chain queries.

    /// Read is compatible with read holders; write needs no holders at all.
    pub(super) fn can_award(&self, level: ServerLockLevel) -> bool {
        match self.holder_level() {
            None => true,
            Some(held) => level.is_read() && held.is_read(),
        }
    }

    pub(super) fn holder_level(&self) -> Option<ServerLockLevel> {
        self.contexts
            .first()
            .and_then(|h| self.contexts.get(h))
            .filter(|c| c.is_holder())
            .map(ServerLockContext::level)
    }

    pub(super) fn has_waiters(&self) -> bool {
        self.contexts
            .last()
            .and_then(|h| self.contexts.get(h))
            .map_or(false, ServerLockContext::is_waiter)
    }

    /// Queued requests ahead of the first waiter.
    pub(super) fn queued(&self) -> impl Iterator<Item = &ServerLockContext> {
        self.contexts
            .iter()
            .map(|(_, c)| c)
            .skip_while(|c| c.is_holder())
            .take_while(|c| c.is_pending())
    }

    pub(super) fn pending_count(&self) -> usize {
        self.queued().count()
    }

    pub(super) fn has_pending_writes(&self) -> bool {
        self.queued().any(|c| c.level().is_write())
    }

    pub(super) fn greedy_holder(&self, client: ClientId) -> Option<&ServerLockContext> {
        self.contexts
            .iter()
            .map(|(_, c)| c)
            .find(|c| c.client_id == client && c.is_greedy_holder())
    }

    pub(super) fn greedy_holders(&self) -> impl Iterator<Item = &ServerLockContext> {
        self.contexts.iter().map(|(_, c)| c).filter(|c| c.is_greedy_holder())
    }

    // Chain edits.

    /// Take the first queued request off the chain if it can be awarded. A
    /// request that cannot blocks everything queued behind it.
    pub(super) fn next_request_if_can_award(&mut self) -> Option<ServerLockContext> {
        let (handle, level) = self
            .contexts
            .iter()
            .find(|(_, c)| !c.is_holder())
            .filter(|(_, c)| c.is_pending())
            .map(|(h, c)| (h, c.level()))?;
        if self.can_award(level) {
            self.contexts.remove(handle)
        } else {
            None
        }
    }

    /// Take every queued read request off the chain, in order.
    pub(super) fn remove_all_pending_reads(&mut self) -> Vec<ServerLockContext> {
        let handles: Vec<Handle> = self.queued_handles(|c| c.level().is_read());
        handles.into_iter().filter_map(|h| self.contexts.remove(h)).collect()
    }

    /// Take every queued request of `client` off the chain, cancelling
    /// their timers.
    pub(super) fn remove_pending_of(&mut self, client: ClientId) -> usize {
        let handles = self.queued_handles(|c| c.client_id == client);
        let removed = handles.len();
        for handle in handles {
            if let Some(mut context) = self.contexts.remove(handle) {
                context.cancel_timer();
            }
        }
        removed
    }

    fn queued_handles<F>(&self, mut pred: F) -> Vec<Handle>
    where
        F: FnMut(&ServerLockContext) -> bool,
    {
        self.contexts
            .iter()
            .skip_while(|(_, c)| c.is_holder())
            .take_while(|(_, c)| c.is_pending())
            .filter(|(_, c)| pred(c))
            .map(|(h, _)| h)
            .collect()
    }

    pub(super) fn remove_matching<F>(&mut self, client: ClientId, thread: ThreadId, pred: F) -> Option<ServerLockContext>
    where
        F: Fn(&ServerLockContext) -> bool,
    {
        let handle = self.contexts.find(|c| c.belongs_to(client, thread) && pred(c))?;
        let mut context = self.contexts.remove(handle)?;
        context.cancel_timer();
        Some(context)
    }

    fn remove_waiters(&mut self, action: NotifyAction) -> Vec<ServerLockContext> {
        let mut removed = Vec::new();
        let mut cursor = self.contexts.first();
        while let Some(handle) = cursor {
            cursor = self.contexts.next(handle);
            if self.contexts.get(handle).map_or(false, ServerLockContext::is_waiter) {
                if let Some(waiter) = self.contexts.remove(handle) {
                    removed.push(waiter);
                }
                if !action.is_all() {
                    break;
                }
            }
        }
        removed
    }

    fn move_waiter_to_pending(&mut self, mut waiter: ServerLockContext) {
        waiter.cancel_timer();
        let pending = ServerLockContext::new(waiter.client_id, waiter.thread_id, LockContextState::PendingWrite);
        self.add_pending(pending);
    }

    /// Queue a pending or try-pending request.
    pub(super) fn add(&mut self, request: ServerLockContext) {
        match request.context_type() {
            ContextType::TryPending => self.add_try_pending(request),
            _ => self.add_pending(request),
        }
    }

    pub(super) fn add_holder(&mut self, holder: ServerLockContext) {
        self.contexts.push_front(holder);
    }

    /// A repeated request from the same thread is dropped.
    pub(super) fn add_pending(&mut self, request: ServerLockContext) {
        if self
            .contexts
            .find(|c| c.belongs_to(request.client_id, request.thread_id))
            .is_some()
        {
            debug!(lock = %self.lock_id, request = %request, "Ignoring duplicate request");
            return;
        }
        self.insert_before_waiters(request);
    }

    /// Try-locks race with the client, so duplicates are tolerated.
    pub(super) fn add_try_pending(&mut self, request: ServerLockContext) {
        self.insert_before_waiters(request);
    }

    /// A waiter may arrive twice across a reconnect; the second is dropped.
    pub(super) fn add_waiter(&mut self, mut waiter: ServerLockContext) {
        if self
            .contexts
            .find(|c| c.belongs_to(waiter.client_id, waiter.thread_id))
            .is_some()
        {
            info!(lock = %self.lock_id, waiter = %waiter, "Ignoring duplicate waiter");
            waiter.cancel_timer();
            return;
        }
        self.contexts.push_back(waiter);
    }

    fn insert_before_waiters(&mut self, request: ServerLockContext) {
        match self.contexts.find(ServerLockContext::is_waiter) {
            Some(waiter) => {
                self.contexts.insert_before(waiter, request);
            }
            None => {
                self.contexts.push_back(request);
            }
        }
    }

    pub(super) fn schedule_timer(&self, context: &mut ServerLockContext, helper: &LockHelper) {
        if let Some(delay) = context.timeout {
            let (id, handle) = helper
                .timer
                .schedule(&self.lock_id, context.client_id, context.thread_id, delay);
            context.set_timer(id, handle);
        }
    }

    // Responses.

    /// Make `request` a holder of its own thread and tell the client.
    pub(super) fn award(&mut self, request: ServerLockContext, helper: &LockHelper) {
        let holder = request.into_holder(false);
        let (client, thread, level) = (holder.client_id, holder.thread_id, holder.level());
        self.add_holder(holder);
        helper.sink.send(&self.lock_id, client, thread, LockResponse::Award { level });
    }

    /// Grant the whole lock to `client`.
    pub(super) fn award_greedy(&mut self, client: ClientId, level: ServerLockLevel, helper: &LockHelper) {
        self.add_holder(ServerLockContext::new(
            client,
            ThreadId::VM_ID,
            LockContextState::greedy_holder(level),
        ));
        helper
            .sink
            .send(&self.lock_id, client, ThreadId::VM_ID, LockResponse::Award { level });
    }

    pub(super) fn cannot_award(&self, client: ClientId, thread: ThreadId, level: ServerLockLevel, helper: &LockHelper) {
        helper.sink.send(&self.lock_id, client, thread, LockResponse::Refuse { level });
    }
}

impl std::fmt::Debug for ServerLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerLock")
            .field("lock_id", &self.lock_id)
            .field("policy", &self.policy)
            .field("recalled", &self.recalled)
            .field("contexts", &self.contexts)
            .finish()
    }
}
