//! Server lock manager.
//!
//! [`LockManager`] receives lock requests from clients, checks the affected
//! lock out of the [`LockStore`] and applies the request to it. Responses
//! leave through the [`LockSink`] the manager was built with.
//!
//! Until [`LockManager::start`] is called the manager only collects state:
//! reconnecting clients reestablish their holds and waiters, and every
//! other request, timer expiries included, is queued. Starting replays the
//! queue in arrival order before anything else is served.

use super::helper::{ChannelManager, LockHelper, LockResponseContext, LockSink, LockTimer, TimerCallback};
use super::store::LockStore;
use crate::config::ServerLockConfig;
use crate::error::{LockError, Result};
use crate::scheduler::Scheduler;
use crate::types::{ClientId, ContextType, LockContext, LockId, NotifyAction, ServerLockLevel, ThreadId};
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

/// Lifecycle of a [`LockManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    /// Accepting reestablished state; requests are queued.
    Starting,
    Started,
    /// Requests are logged and ignored.
    Stopped,
}

#[derive(Debug)]
enum Request {
    Lock {
        lock_id: LockId,
        client: ClientId,
        thread: ThreadId,
        level: ServerLockLevel,
    },
    TryLock {
        lock_id: LockId,
        client: ClientId,
        thread: ThreadId,
        level: ServerLockLevel,
        timeout: Duration,
    },
    Unlock {
        lock_id: LockId,
        client: ClientId,
        thread: ThreadId,
    },
    Wait {
        lock_id: LockId,
        client: ClientId,
        thread: ThreadId,
        timeout: Option<Duration>,
    },
    Interrupt {
        lock_id: LockId,
        client: ClientId,
        thread: ThreadId,
    },
    Query {
        lock_id: LockId,
        client: ClientId,
        thread: ThreadId,
    },
    RecallCommit {
        lock_id: LockId,
        client: ClientId,
        contexts: Vec<LockContext>,
    },
    TimerExpired {
        lock_id: LockId,
        client: ClientId,
        thread: ThreadId,
        timer_id: u64,
    },
}

impl Request {
    fn client(&self) -> ClientId {
        match self {
            Request::Lock { client, .. }
            | Request::TryLock { client, .. }
            | Request::Unlock { client, .. }
            | Request::Wait { client, .. }
            | Request::Interrupt { client, .. }
            | Request::Query { client, .. }
            | Request::RecallCommit { client, .. }
            | Request::TimerExpired { client, .. } => *client,
        }
    }

    fn lock_id(&self) -> &LockId {
        match self {
            Request::Lock { lock_id, .. }
            | Request::TryLock { lock_id, .. }
            | Request::Unlock { lock_id, .. }
            | Request::Wait { lock_id, .. }
            | Request::Interrupt { lock_id, .. }
            | Request::Query { lock_id, .. }
            | Request::RecallCommit { lock_id, .. }
            | Request::TimerExpired { lock_id, .. } => lock_id,
        }
    }
}

/// Server side of the lock protocol.
pub struct LockManager {
    store: LockStore,
    helper: LockHelper,
    channels: Arc<dyn ChannelManager>,
    status: RwLock<ServerStatus>,
    queued: Mutex<Vec<Request>>,
}

impl LockManager {
    /// Create a manager in [`ServerStatus::Starting`].
    pub fn new(
        config: &ServerLockConfig,
        responses: UnboundedSender<LockResponseContext>,
        channels: Arc<dyn ChannelManager>,
        scheduler: Scheduler,
    ) -> Arc<Self> {
        let manager = Arc::new_cyclic(|me: &Weak<LockManager>| {
            let callback: Weak<dyn TimerCallback> = me.clone();
            Self {
                store: LockStore::new(config.segments, config.policy),
                helper: LockHelper::new(
                    LockSink::new(responses),
                    LockTimer::new(scheduler, callback),
                    config.greedy_lease,
                ),
                channels,
                status: RwLock::new(ServerStatus::Starting),
                queued: Mutex::new(Vec::new()),
            }
        });
        info!(
            segments = config.segments,
            policy = ?config.policy,
            lease = ?config.greedy_lease,
            "Lock manager created"
        );
        manager
    }

    pub fn status(&self) -> ServerStatus {
        *self.status.read()
    }

    /// Serve requests, replaying everything queued so far first.
    pub fn start(&self) {
        let mut status = self.status.write();
        if *status != ServerStatus::Starting {
            warn!(status = ?*status, "Lock manager start ignored");
            return;
        }
        *status = ServerStatus::Started;
        let queued = std::mem::take(&mut *self.queued.lock());
        info!(queued = queued.len(), locks = self.store.len(), "Lock manager started");
        for request in queued {
            if let Err(e) = self.dispatch(request) {
                error!(error = %e, "Queued lock request failed");
            }
        }
    }

    pub fn stop(&self) {
        *self.status.write() = ServerStatus::Stopped;
        self.queued.lock().clear();
        info!("Lock manager stopped");
    }

    pub fn lock(&self, lock_id: &LockId, client: ClientId, thread: ThreadId, level: ServerLockLevel) -> Result<()> {
        self.submit(Request::Lock {
            lock_id: lock_id.clone(),
            client,
            thread,
            level,
        })
    }

    pub fn try_lock(
        &self,
        lock_id: &LockId,
        client: ClientId,
        thread: ThreadId,
        level: ServerLockLevel,
        timeout: Duration,
    ) -> Result<()> {
        self.submit(Request::TryLock {
            lock_id: lock_id.clone(),
            client,
            thread,
            level,
            timeout,
        })
    }

    pub fn unlock(&self, lock_id: &LockId, client: ClientId, thread: ThreadId) -> Result<()> {
        self.submit(Request::Unlock {
            lock_id: lock_id.clone(),
            client,
            thread,
        })
    }

    pub fn wait(&self, lock_id: &LockId, client: ClientId, thread: ThreadId, timeout: Option<Duration>) -> Result<()> {
        self.submit(Request::Wait {
            lock_id: lock_id.clone(),
            client,
            thread,
            timeout,
        })
    }

    pub fn interrupt(&self, lock_id: &LockId, client: ClientId, thread: ThreadId) -> Result<()> {
        self.submit(Request::Interrupt {
            lock_id: lock_id.clone(),
            client,
            thread,
        })
    }

    pub fn query(&self, lock_id: &LockId, client: ClientId, thread: ThreadId) -> Result<()> {
        self.submit(Request::Query {
            lock_id: lock_id.clone(),
            client,
            thread,
        })
    }

    pub fn recall_commit(&self, lock_id: &LockId, client: ClientId, contexts: Vec<LockContext>) -> Result<()> {
        self.submit(Request::RecallCommit {
            lock_id: lock_id.clone(),
            client,
            contexts,
        })
    }

    /// Requeue waiters of `lock_id`. Returns the notified waiters so their
    /// clients can be told.
    pub fn notify(
        &self,
        lock_id: &LockId,
        client: ClientId,
        thread: ThreadId,
        action: NotifyAction,
    ) -> Result<Vec<LockContext>> {
        let status = self.status.read();
        match *status {
            ServerStatus::Started => {}
            ServerStatus::Starting => return Err(LockError::NotRunning),
            ServerStatus::Stopped => {
                warn!(lock = %lock_id, %client, "Notify after stop ignored");
                return Ok(Vec::new());
            }
        }
        if !self.is_active(client, lock_id) {
            return Ok(Vec::new());
        }
        match self.store.checkout_existing(lock_id) {
            Some(mut lock) => lock.notify(client, thread, action),
            None => Err(LockError::IllegalMonitorState(format!(
                "notify on {} by {}/{} without holding it",
                lock_id, client, thread
            ))),
        }
    }

    /// Rebuild the state a reconnecting client reports. Only allowed before
    /// [`start`](Self::start).
    ///
    /// Holders and waiters are restored directly; queued requests are
    /// replayed on start like any other request.
    pub fn reestablish_state(&self, client: ClientId, contexts: Vec<LockContext>) -> Result<()> {
        let status = self.status.read();
        if *status != ServerStatus::Starting {
            return Err(LockError::InvalidState(format!(
                "{} reestablishing state while {:?}",
                client, *status
            )));
        }

        debug!(%client, contexts = contexts.len(), "Reestablishing client state");
        for context in contexts {
            let (lock_id, thread, level) = (context.lock_id.clone(), context.thread_id, context.state.lock_level());
            match context.state.context_type() {
                ContextType::Pending => self.queued.lock().push(Request::Lock {
                    lock_id,
                    client,
                    thread,
                    level,
                }),
                ContextType::TryPending => self.queued.lock().push(Request::TryLock {
                    lock_id,
                    client,
                    thread,
                    level,
                    timeout: context.timeout.unwrap_or(Duration::ZERO),
                }),
                _ => self.store.checkout(&lock_id).reestablish_state(&context, &self.helper)?,
            }
        }
        Ok(())
    }

    /// Drop every context of a departed client.
    pub fn clear_all_locks_for(&self, client: ClientId) {
        info!(%client, "Clearing locks of departed client");
        self.store.for_each(|lock| {
            lock.clear_state_for_node(client, &self.helper);
        });
    }

    pub fn lock_count(&self) -> usize {
        self.store.len()
    }

    /// Ordered chain of `lock_id`.
    pub fn dump(&self, lock_id: &LockId) -> Vec<LockContext> {
        self.store
            .checkout_existing(lock_id)
            .map(|lock| lock.contexts())
            .unwrap_or_default()
    }

    /// Chains of every lock.
    pub fn dump_all(&self) -> Vec<(LockId, Vec<LockContext>)> {
        self.store.snapshot()
    }

    fn submit(&self, request: Request) -> Result<()> {
        let status = self.status.read();
        match *status {
            ServerStatus::Starting => {
                debug!(lock = %request.lock_id(), client = %request.client(), "Queueing request until start");
                self.queued.lock().push(request);
                Ok(())
            }
            ServerStatus::Started => self.dispatch(request),
            ServerStatus::Stopped => {
                warn!(lock = %request.lock_id(), client = %request.client(), "Request after stop ignored");
                Ok(())
            }
        }
    }

    fn dispatch(&self, request: Request) -> Result<()> {
        if !self.is_active(request.client(), request.lock_id()) {
            return Ok(());
        }
        let helper = &self.helper;
        match request {
            Request::Lock {
                lock_id,
                client,
                thread,
                level,
            } => self.store.checkout(&lock_id).lock(client, thread, level, helper),
            Request::TryLock {
                lock_id,
                client,
                thread,
                level,
                timeout,
            } => self
                .store
                .checkout(&lock_id)
                .try_lock(client, thread, level, timeout, helper),
            Request::Unlock {
                lock_id,
                client,
                thread,
            } => {
                match self.store.checkout_existing(&lock_id) {
                    Some(mut lock) => lock.unlock(client, thread, helper),
                    None => debug!(lock = %lock_id, %client, %thread, "Unlock of unknown lock ignored"),
                }
                Ok(())
            }
            Request::Wait {
                lock_id,
                client,
                thread,
                timeout,
            } => match self.store.checkout_existing(&lock_id) {
                Some(mut lock) => lock.wait(client, thread, timeout, helper),
                None => Err(LockError::IllegalMonitorState(format!(
                    "wait on {} by {}/{} without holding it",
                    lock_id, client, thread
                ))),
            },
            Request::Interrupt {
                lock_id,
                client,
                thread,
            } => {
                match self.store.checkout_existing(&lock_id) {
                    Some(mut lock) => lock.interrupt(client, thread, helper),
                    None => warn!(lock = %lock_id, %client, %thread, "Interrupt on unknown lock"),
                }
                Ok(())
            }
            Request::Query {
                lock_id,
                client,
                thread,
            } => {
                self.store.checkout(&lock_id).query(client, thread, helper);
                Ok(())
            }
            Request::RecallCommit {
                lock_id,
                client,
                contexts,
            } => match self.store.checkout_existing(&lock_id) {
                Some(mut lock) => lock.recall_commit(client, contexts, helper),
                None => Err(LockError::ProtocolViolation(format!(
                    "{} committed a recall of unknown lock {}",
                    client, lock_id
                ))),
            },
            Request::TimerExpired {
                lock_id,
                client,
                thread,
                timer_id,
            } => {
                if let Some(mut lock) = self.store.checkout_existing(&lock_id) {
                    lock.timer_timeout(client, thread, timer_id, helper);
                }
                Ok(())
            }
        }
    }

    fn is_active(&self, client: ClientId, lock_id: &LockId) -> bool {
        let active = self.channels.is_active(client);
        if !active {
            warn!(lock = %lock_id, %client, "Ignoring request from disconnected client");
        }
        active
    }
}

impl TimerCallback for LockManager {
    fn timer_expired(&self, lock_id: LockId, client: ClientId, thread: ThreadId, timer_id: u64) {
        let request = Request::TimerExpired {
            lock_id,
            client,
            thread,
            timer_id,
        };
        if let Err(e) = self.submit(request) {
            error!(error = %e, "Timer expiry failed");
        }
    }
}
