//! Client lock registry.
//!
//! [`ClientLockManager`] is the entry point application threads use. It owns
//! one [`ClientLock`] per [`LockId`], created on first use and collected by a
//! periodic sweep once idle. It gates every operation on its lifecycle
//! (running, paused for a reconnect, shut down) and filters server messages
//! by session.

use super::greediness::ClientGreediness;
use super::lock::ClientLock;
use super::remote::{ClientHandshakeMessage, RemoteLockManager};
use crate::config::ClientLockConfig;
use crate::error::{LockError, Result};
use crate::scheduler::{Scheduler, TimerHandle};
use crate::types::{
    ClientId, ContextType, LockContext, LockId, LockInfo, LockLevel, NotifyAction, ServerLockLevel, SessionId,
    ThreadId,
};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Lifecycle of a [`ClientLockManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    /// Handshake sent, waiting for the server to acknowledge it.
    Starting,
    Running,
    /// Disconnected from the server.
    Paused,
    Shutdown,
}

#[derive(Debug)]
struct Lifecycle {
    state: ManagerState,
    session: SessionId,
}

impl Lifecycle {
    fn accepts(&self, session: SessionId) -> bool {
        matches!(self.state, ManagerState::Running | ManagerState::Starting) && self.session == session
    }
}

/// A notify the server must deliver, because waiters may live on other
/// clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notify {
    pub lock_id: LockId,
    pub thread_id: ThreadId,
    pub action: NotifyAction,
}

#[derive(Debug)]
struct PendingQuery {
    lock: LockId,
    info: Option<LockInfo>,
}

/// Registry of client locks.
pub struct ClientLockManager {
    me: Weak<ClientLockManager>,
    remote: Arc<dyn RemoteLockManager>,
    scheduler: Scheduler,
    lifecycle: RwLock<Lifecycle>,
    gate: Mutex<()>,
    running: Condvar,
    shutdown: AtomicBool,
    locks: RwLock<HashMap<LockId, Arc<ClientLock>>>,
    queries: Mutex<HashMap<ThreadId, PendingQuery>>,
    query_answered: Condvar,
    lease_timers: Mutex<HashMap<LockId, TimerHandle>>,
    gc_timer: Mutex<Option<TimerHandle>>,
    /// Interrupts that arrived while the thread could not be interrupted.
    interrupted: Mutex<HashSet<ThreadId>>,
}

impl ClientLockManager {
    /// Create a running manager and start its lock GC sweep.
    pub fn new(config: ClientLockConfig, remote: Arc<dyn RemoteLockManager>, scheduler: Scheduler) -> Arc<Self> {
        let gc_interval = config.effective_gc_interval();
        let manager = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            remote,
            scheduler,
            lifecycle: RwLock::new(Lifecycle {
                state: ManagerState::Running,
                session: SessionId(0),
            }),
            gate: Mutex::new(()),
            running: Condvar::new(),
            shutdown: AtomicBool::new(false),
            locks: RwLock::new(HashMap::with_capacity(config.initial_capacity)),
            queries: Mutex::new(HashMap::new()),
            query_answered: Condvar::new(),
            lease_timers: Mutex::new(HashMap::new()),
            gc_timer: Mutex::new(None),
            interrupted: Mutex::new(HashSet::new()),
        });

        let weak = manager.me.clone();
        let timer = manager.scheduler.schedule_periodic(gc_interval, move || {
            if let Some(manager) = weak.upgrade() {
                manager.run_lock_gc();
            }
        });
        *manager.gc_timer.lock() = Some(timer);
        info!(
            client = %manager.remote.client_id(),
            gc_interval_ms = gc_interval.as_millis() as u64,
            "Client lock manager started"
        );
        manager
    }

    pub fn client_id(&self) -> ClientId {
        self.remote.client_id()
    }

    pub fn state(&self) -> ManagerState {
        self.lifecycle.read().state
    }

    pub fn session(&self) -> SessionId {
        self.lifecycle.read().session
    }

    // Application operations.

    pub fn lock(&self, lock: &LockId, thread: ThreadId, level: LockLevel) -> Result<()> {
        self.with_lock(lock, |l| {
            self.carry_interrupt(l, thread, l.lock(self.remote.as_ref(), thread, level))
        })
    }

    pub fn lock_interruptibly(&self, lock: &LockId, thread: ThreadId, level: LockLevel) -> Result<()> {
        self.check_interrupt(lock, thread)?;
        self.with_lock(lock, |l| {
            self.carry_interrupt(l, thread, l.lock_interruptibly(self.remote.as_ref(), thread, level))
        })
    }

    pub fn try_lock(&self, lock: &LockId, thread: ThreadId, level: LockLevel) -> Result<bool> {
        self.with_lock(lock, |l| {
            self.carry_interrupt(l, thread, l.try_lock(self.remote.as_ref(), thread, level))
        })
    }

    pub fn try_lock_timeout(
        &self,
        lock: &LockId,
        thread: ThreadId,
        level: LockLevel,
        timeout: Duration,
    ) -> Result<bool> {
        self.check_interrupt(lock, thread)?;
        self.with_lock(lock, |l| {
            let result = l.try_lock_timeout(self.remote.as_ref(), thread, level, timeout);
            self.carry_interrupt(l, thread, result)
        })
    }

    pub fn unlock(&self, lock: &LockId, thread: ThreadId, level: LockLevel) -> Result<()> {
        self.wait_until_running()?;
        self.existing(lock, thread)?.unlock(self.remote.as_ref(), thread, level)
    }

    /// Returns the notify to forward to the server, if one is needed.
    pub fn notify(&self, lock: &LockId, thread: ThreadId) -> Result<Option<Notify>> {
        self.notify_with(lock, thread, NotifyAction::One)
    }

    pub fn notify_all(&self, lock: &LockId, thread: ThreadId) -> Result<Option<Notify>> {
        self.notify_with(lock, thread, NotifyAction::All)
    }

    /// Fails with [`LockError::Interrupted`] without releasing anything if
    /// `thread` was interrupted during an earlier non-interruptible acquire.
    pub fn wait(&self, lock: &LockId, thread: ThreadId, timeout: Option<Duration>) -> Result<()> {
        self.wait_until_running()?;
        let client_lock = self.existing(lock, thread)?;
        self.check_interrupt(lock, thread)?;
        let result = client_lock.wait(self.remote.as_ref(), thread, timeout);
        self.carry_interrupt(&client_lock, thread, result)
    }

    /// Interrupt `thread` wherever it is blocked.
    ///
    /// A thread blocked where it cannot be interrupted keeps the interrupt;
    /// its next interruptible operation fails with it.
    pub fn interrupt(&self, thread: ThreadId) -> bool {
        let locks: Vec<_> = self.locks.read().values().cloned().collect();
        let mut interrupted = false;
        for lock in locks {
            interrupted |= lock.interrupt(thread);
        }
        interrupted
    }

    pub fn pin(&self, lock: &LockId) -> Result<()> {
        self.with_lock(lock, |l| {
            l.pin();
            if l.greediness().is_garbage() {
                return Err(LockError::GarbageLock);
            }
            Ok(())
        })
    }

    pub fn unpin(&self, lock: &LockId) {
        if let Some(lock) = self.client_lock(lock) {
            lock.unpin();
        }
    }

    // Local introspection.

    pub fn is_locked_by(&self, lock: &LockId, thread: ThreadId, level: LockLevel) -> bool {
        self.client_lock(lock)
            .map_or(false, |l| l.is_locked_by(thread, level))
    }

    pub fn local_hold_count(&self, lock: &LockId, level: LockLevel) -> usize {
        self.client_lock(lock).map_or(0, |l| l.hold_count(level))
    }

    pub fn holds_of(&self, lock: &LockId, thread: ThreadId) -> Vec<LockLevel> {
        self.client_lock(lock)
            .map(|l| l.holds_of(thread))
            .unwrap_or_default()
    }

    pub fn greediness(&self, lock: &LockId) -> Option<ClientGreediness> {
        self.client_lock(lock).map(|l| l.greediness())
    }

    pub fn client_lock(&self, lock: &LockId) -> Option<Arc<ClientLock>> {
        self.locks.read().get(lock).cloned()
    }

    pub fn lock_count(&self) -> usize {
        self.locks.read().len()
    }

    /// Unfiltered state of every registered lock.
    pub fn all_lock_contexts(&self) -> Vec<LockContext> {
        let client = self.client_id();
        let locks: Vec<_> = self.locks.read().values().cloned().collect();
        locks.iter().flat_map(|l| l.state_snapshot(client)).collect()
    }

    // Cluster-wide queries. Each costs one round trip unless answered locally.

    pub fn is_locked(&self, lock: &LockId, thread: ThreadId, level: LockLevel) -> Result<bool> {
        if self.client_lock(lock).map_or(false, |l| l.is_locked(level)) {
            return Ok(true);
        }
        let server_level = ServerLockLevel::from(level);
        let info = self.query(lock, thread)?;
        let held = info.holders().any(|c| c.state.lock_level() == server_level);
        Ok(held)
    }

    pub fn global_hold_count(&self, lock: &LockId, thread: ThreadId, level: LockLevel) -> Result<usize> {
        let server_level = ServerLockLevel::from(level);
        let info = self.query(lock, thread)?;
        let client = self.client_id();
        let mut count = 0;
        for holder in info.holders() {
            let greedy = holder.state.context_type() == ContextType::GreedyHolder;
            if greedy && holder.client_id == client {
                count += self.local_hold_count(lock, level);
            } else if holder.state.lock_level() == server_level {
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn global_pending_count(&self, lock: &LockId, thread: ThreadId) -> Result<usize> {
        let info = self.query(lock, thread)?;
        let local = if self.greedy_on_server(&info) {
            self.client_lock(lock).map_or(0, |l| l.pending_count())
        } else {
            0
        };
        Ok(info.pending_count + local)
    }

    pub fn global_waiting_count(&self, lock: &LockId, thread: ThreadId) -> Result<usize> {
        let info = self.query(lock, thread)?;
        let local = if self.greedy_on_server(&info) {
            self.client_lock(lock).map_or(0, |l| l.waiting_count())
        } else {
            0
        };
        Ok(info.waiter_count() + local)
    }

    // Server messages.

    pub fn award(&self, session: SessionId, lock: &LockId, thread: ThreadId, level: ServerLockLevel) {
        let lifecycle = self.lifecycle.read();
        if !self.accept(&lifecycle, session, lock, "award") {
            return;
        }

        if thread.is_vm() {
            self.award_greedy(lock, level);
            return;
        }
        let Some(client_lock) = self.client_lock(lock) else {
            debug!(%lock, %thread, %level, "Award for unknown lock, unlocking");
            self.remote.unlock(lock, thread, level);
            return;
        };
        match client_lock.award(self.remote.as_ref(), thread, level) {
            Ok(()) => {}
            Err(LockError::GarbageLock) => {
                debug!(%lock, %thread, %level, "Award for collected lock, unlocking");
                self.remote.unlock(lock, thread, level);
            }
            Err(e) => error!(%lock, %thread, %level, error = %e, "Award could not be applied"),
        }
    }

    pub fn recall(&self, session: SessionId, lock: &LockId, level: ServerLockLevel, lease: Option<Duration>) {
        let lifecycle = self.lifecycle.read();
        if !self.accept(&lifecycle, session, lock, "recall") {
            return;
        }
        self.apply_recall(lock, level, lease);
    }

    pub fn refuse(&self, session: SessionId, lock: &LockId, thread: ThreadId, level: ServerLockLevel) {
        let lifecycle = self.lifecycle.read();
        if !self.accept(&lifecycle, session, lock, "refuse") {
            return;
        }
        if let Some(client_lock) = self.client_lock(lock) {
            client_lock.refuse(thread, level);
        }
    }

    pub fn notified(&self, session: SessionId, lock: &LockId, thread: ThreadId) {
        let lifecycle = self.lifecycle.read();
        if !self.accept(&lifecycle, session, lock, "notified") {
            return;
        }
        if let Some(client_lock) = self.client_lock(lock) {
            client_lock.notified(thread);
        }
    }

    /// A timed server-side wait expired. Handled like a notification.
    pub fn wait_timed_out(&self, session: SessionId, lock: &LockId, thread: ThreadId) {
        let lifecycle = self.lifecycle.read();
        if !self.accept(&lifecycle, session, lock, "wait timeout") {
            return;
        }
        if let Some(client_lock) = self.client_lock(lock) {
            client_lock.notified(thread);
        }
    }

    pub fn info(&self, session: SessionId, lock: &LockId, thread: ThreadId, info: LockInfo) {
        let lifecycle = self.lifecycle.read();
        if !self.accept(&lifecycle, session, lock, "info") {
            return;
        }
        let mut queries = self.queries.lock();
        match queries.get_mut(&thread) {
            Some(query) if query.lock == *lock => {
                query.info = Some(info);
                self.query_answered.notify_all();
            }
            _ => debug!(%lock, %thread, "Unsolicited query response"),
        }
    }

    // Lifecycle.

    /// The connection to the server was lost.
    pub fn pause(&self) {
        let mut lifecycle = self.lifecycle.write();
        match lifecycle.state {
            ManagerState::Running | ManagerState::Starting => {
                lifecycle.state = ManagerState::Paused;
                info!(session = %lifecycle.session, "Client lock manager paused");
            }
            state => warn!(?state, "Pause ignored"),
        }
    }

    /// Report every lock's state for a reconnect and open a new session.
    ///
    /// Messages from the previous session are dropped from here on.
    pub fn initialize_handshake(&self, message: &mut dyn ClientHandshakeMessage) -> Result<SessionId> {
        let mut lifecycle = self.lifecycle.write();
        match lifecycle.state {
            ManagerState::Paused => {}
            ManagerState::Shutdown => return Err(LockError::NotRunning),
            state => {
                return Err(LockError::InvalidState(format!(
                    "handshake requires a paused manager, found {:?}",
                    state
                )))
            }
        }

        let client = self.client_id();
        let locks: Vec<_> = self.locks.read().values().cloned().collect();
        for lock in &locks {
            lock.initialize_handshake(client, message);
        }
        lifecycle.state = ManagerState::Starting;
        lifecycle.session = SessionId(lifecycle.session.0 + 1);
        info!(session = %lifecycle.session, locks = locks.len(), "Handshake initialized");
        Ok(lifecycle.session)
    }

    /// The server acknowledged the handshake.
    pub fn unpause(&self) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.write();
            match lifecycle.state {
                ManagerState::Starting => lifecycle.state = ManagerState::Running,
                ManagerState::Shutdown => return Err(LockError::NotRunning),
                state => {
                    return Err(LockError::InvalidState(format!(
                        "unpause requires a starting manager, found {:?}",
                        state
                    )))
                }
            }

            let queries = self.queries.lock();
            for (thread, query) in queries.iter().filter(|(_, q)| q.info.is_none()) {
                debug!(lock = %query.lock, %thread, "Resubmitting query");
                self.remote.query(&query.lock, *thread);
            }
            info!(session = %lifecycle.session, "Client lock manager running");
        }
        self.signal_transition();
        Ok(())
    }

    pub fn shutdown(&self) {
        {
            let mut lifecycle = self.lifecycle.write();
            if lifecycle.state == ManagerState::Shutdown {
                return;
            }
            lifecycle.state = ManagerState::Shutdown;
        }
        self.shutdown.store(true, Ordering::Release);

        if let Some(timer) = self.gc_timer.lock().take() {
            timer.cancel();
        }
        for (_, timer) in self.lease_timers.lock().drain() {
            timer.cancel();
        }
        let locks: Vec<_> = self.locks.read().values().cloned().collect();
        for lock in &locks {
            lock.shutdown();
        }
        self.remote.shutdown();

        {
            let _queries = self.queries.lock();
            self.query_answered.notify_all();
        }
        self.signal_transition();
        info!(locks = locks.len(), "Client lock manager shut down");
    }

    /// One GC sweep. Returns how many locks were collected.
    pub fn run_lock_gc(&self) -> usize {
        let lifecycle = self.lifecycle.read();
        if lifecycle.state != ManagerState::Running {
            return 0;
        }

        let candidates: Vec<_> = self
            .locks
            .read()
            .iter()
            .map(|(id, lock)| (id.clone(), Arc::clone(lock)))
            .collect();
        let mut collected = 0;
        for (id, lock) in candidates {
            if lock.try_mark_as_garbage(&self.remote) {
                self.discard(&id, &lock);
                collected += 1;
            }
        }

        if collected > 0 {
            info!(collected, remaining = self.lock_count(), "Collected idle locks");
        } else {
            debug!(remaining = self.lock_count(), "Lock GC sweep found nothing to collect");
        }
        collected
    }

    fn with_lock<T, F>(&self, lock: &LockId, op: F) -> Result<T>
    where
        F: Fn(&ClientLock) -> Result<T>,
    {
        self.wait_until_running()?;
        loop {
            let client_lock = self.get_or_create(lock);
            match op(client_lock.as_ref()) {
                Err(LockError::GarbageLock) => {
                    info!(%lock, "Retrying against a fresh lock after collection");
                    self.discard(lock, &client_lock);
                }
                other => return other,
            }
        }
    }

    /// Apply a whole-lock grant, replacing a lock that was collected.
    fn award_greedy(&self, lock: &LockId, level: ServerLockLevel) {
        loop {
            let client_lock = self.get_or_create(lock);
            match client_lock.award(self.remote.as_ref(), ThreadId::VM_ID, level) {
                Ok(()) => return,
                Err(LockError::GarbageLock) => {
                    info!(%lock, %level, "Greedy award for collected lock, applying to a fresh one");
                    self.discard(lock, &client_lock);
                }
                Err(e) => {
                    error!(%lock, %level, error = %e, "Greedy award could not be applied");
                    return;
                }
            }
        }
    }

    /// Move a deferred interrupt of `thread` off `lock`, passing `result` on.
    fn carry_interrupt<T>(&self, lock: &ClientLock, thread: ThreadId, result: Result<T>) -> Result<T> {
        if lock.take_deferred_interrupt(thread) {
            self.interrupted.lock().insert(thread);
        }
        result
    }

    fn check_interrupt(&self, lock: &LockId, thread: ThreadId) -> Result<()> {
        if self.interrupted.lock().remove(&thread) {
            debug!(%lock, %thread, "Raising interrupt deferred from an earlier acquire");
            return Err(LockError::Interrupted(lock.to_string()));
        }
        Ok(())
    }

    fn existing(&self, lock: &LockId, thread: ThreadId) -> Result<Arc<ClientLock>> {
        self.client_lock(lock).ok_or_else(|| {
            LockError::IllegalMonitorState(format!("{} holds nothing on {}", thread, lock))
        })
    }

    fn notify_with(&self, lock: &LockId, thread: ThreadId, action: NotifyAction) -> Result<Option<Notify>> {
        self.wait_until_running()?;
        let remote_needed = self.existing(lock, thread)?.notify(thread, action)?;
        Ok(remote_needed.then(|| Notify {
            lock_id: lock.clone(),
            thread_id: thread,
            action,
        }))
    }

    fn get_or_create(&self, lock: &LockId) -> Arc<ClientLock> {
        if let Some(existing) = self.locks.read().get(lock) {
            return Arc::clone(existing);
        }
        let mut locks = self.locks.write();
        Arc::clone(
            locks
                .entry(lock.clone())
                .or_insert_with(|| Arc::new(ClientLock::new(lock.clone()))),
        )
    }

    fn discard(&self, id: &LockId, lock: &Arc<ClientLock>) {
        let mut locks = self.locks.write();
        if locks.get(id).map_or(false, |current| Arc::ptr_eq(current, lock)) {
            locks.remove(id);
        }
    }

    fn accept(&self, lifecycle: &Lifecycle, session: SessionId, lock: &LockId, kind: &str) -> bool {
        if lifecycle.accepts(session) {
            return true;
        }
        warn!(
            %lock,
            %session,
            current = %lifecycle.session,
            state = ?lifecycle.state,
            message = kind,
            "Dropping server message"
        );
        false
    }

    fn greedy_on_server(&self, info: &LockInfo) -> bool {
        let client = self.client_id();
        info.holders()
            .any(|c| c.client_id == client && c.state.context_type() == ContextType::GreedyHolder)
    }

    fn apply_recall(&self, lock: &LockId, level: ServerLockLevel, lease: Option<Duration>) {
        let Some(client_lock) = self.client_lock(lock) else {
            debug!(%lock, "Recall for unknown lock");
            return;
        };
        match client_lock.recall(&self.remote, level, lease) {
            Ok(true) => {
                if let Some(lease) = lease {
                    self.schedule_lease_expiry(lock, level, lease);
                }
            }
            Ok(false) => {}
            Err(e) => error!(%lock, %level, error = %e, "Recall failed"),
        }
    }

    fn schedule_lease_expiry(&self, lock: &LockId, level: ServerLockLevel, lease: Duration) {
        let weak = self.me.clone();
        let id = lock.clone();
        let timer = self.scheduler.schedule_once(lease, move || {
            if let Some(manager) = weak.upgrade() {
                manager.lease_expired(&id, level);
            }
        });
        debug!(%lock, lease_ms = lease.as_millis() as u64, "Greedy lease scheduled");
        if let Some(previous) = self.lease_timers.lock().insert(lock.clone(), timer) {
            previous.cancel();
        }
    }

    fn lease_expired(&self, lock: &LockId, level: ServerLockLevel) {
        self.lease_timers.lock().remove(lock);
        let lifecycle = self.lifecycle.read();
        if !matches!(lifecycle.state, ManagerState::Running | ManagerState::Starting) {
            debug!(%lock, state = ?lifecycle.state, "Lease expiry ignored");
            return;
        }
        debug!(%lock, "Greedy lease expired");
        self.apply_recall(lock, level, None);
    }

    fn query(&self, lock: &LockId, thread: ThreadId) -> Result<LockInfo> {
        self.wait_until_running()?;
        let mut queries = self.queries.lock();
        queries.insert(
            thread,
            PendingQuery {
                lock: lock.clone(),
                info: None,
            },
        );
        self.remote.query(lock, thread);

        loop {
            if let Some(info) = queries.get_mut(&thread).and_then(|q| q.info.take()) {
                queries.remove(&thread);
                return Ok(info);
            }
            if self.shutdown.load(Ordering::Acquire) {
                queries.remove(&thread);
                return Err(LockError::NotRunning);
            }
            self.query_answered.wait(&mut queries);
        }
    }

    fn wait_until_running(&self) -> Result<()> {
        loop {
            match self.lifecycle.read().state {
                ManagerState::Running => return Ok(()),
                ManagerState::Shutdown => return Err(LockError::NotRunning),
                _ => {}
            }
            let mut gate = self.gate.lock();
            if matches!(
                self.lifecycle.read().state,
                ManagerState::Running | ManagerState::Shutdown
            ) {
                continue;
            }
            self.running.wait(&mut gate);
        }
    }

    fn signal_transition(&self) {
        let _gate = self.gate.lock();
        self.running.notify_all();
    }
}
