//! Collaborators injected into server locks.
//!
//! A [`ServerLock`](super::ServerLock) never performs I/O itself. Responses
//! go to a [`LockSink`], timeouts are scheduled through a [`LockTimer`], and
//! client liveness is answered by a [`ChannelManager`]. The three travel
//! together as a [`LockHelper`].

use crate::scheduler::{Scheduler, TimerHandle};
use crate::types::{ClientId, LockId, LockInfo, ServerLockLevel, ThreadId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{trace, warn};

/// What the server tells a client about one lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockResponse {
    Award { level: ServerLockLevel },
    /// Give the greedy grant back, optionally after `lease`.
    Recall {
        level: ServerLockLevel,
        lease: Option<Duration>,
    },
    WaitTimeout,
    Info(LockInfo),
    /// A try-lock could not be awarded.
    Refuse { level: ServerLockLevel },
}

/// A response addressed to one (client, thread).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockResponseContext {
    pub lock_id: LockId,
    pub client_id: ClientId,
    pub thread_id: ThreadId,
    pub response: LockResponse,
}

impl LockResponseContext {
    pub fn is_award(&self) -> bool {
        matches!(self.response, LockResponse::Award { .. })
    }

    pub fn is_recall(&self) -> bool {
        matches!(self.response, LockResponse::Recall { .. })
    }

    pub fn is_refuse(&self) -> bool {
        matches!(self.response, LockResponse::Refuse { .. })
    }

    pub fn is_wait_timeout(&self) -> bool {
        matches!(self.response, LockResponse::WaitTimeout)
    }
}

/// Outbound queue of lock responses.
#[derive(Debug, Clone)]
pub struct LockSink {
    tx: UnboundedSender<LockResponseContext>,
}

impl LockSink {
    pub fn new(tx: UnboundedSender<LockResponseContext>) -> Self {
        Self { tx }
    }

    pub fn send(&self, lock_id: &LockId, client_id: ClientId, thread_id: ThreadId, response: LockResponse) {
        trace!(lock = %lock_id, client = %client_id, thread = %thread_id, ?response, "Lock response");
        let context = LockResponseContext {
            lock_id: lock_id.clone(),
            client_id,
            thread_id,
            response,
        };
        if self.tx.send(context).is_err() {
            warn!(lock = %lock_id, client = %client_id, "Response sink closed, dropping response");
        }
    }
}

/// Receiver of expired try-lock and wait timers.
pub trait TimerCallback: Send + Sync {
    fn timer_expired(&self, lock_id: LockId, client: ClientId, thread: ThreadId, timer_id: u64);
}

/// Schedules context timers and routes their expiry to a [`TimerCallback`].
pub struct LockTimer {
    scheduler: Scheduler,
    callback: Weak<dyn TimerCallback>,
    next_id: AtomicU64,
}

impl LockTimer {
    pub fn new(scheduler: Scheduler, callback: Weak<dyn TimerCallback>) -> Self {
        Self {
            scheduler,
            callback,
            next_id: AtomicU64::new(1),
        }
    }

    /// Schedule expiry of the context of (`client`, `thread`). The returned
    /// id tells the expiry apart from a later timer of the same thread.
    pub fn schedule(&self, lock_id: &LockId, client: ClientId, thread: ThreadId, delay: Duration) -> (u64, TimerHandle) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let callback = self.callback.clone();
        let lock_id = lock_id.clone();
        let handle = self.scheduler.schedule_once(delay, move || {
            if let Some(callback) = callback.upgrade() {
                callback.timer_expired(lock_id, client, thread, id);
            }
        });
        (id, handle)
    }
}

/// Everything a server lock needs from the outside world.
pub struct LockHelper {
    pub sink: LockSink,
    pub timer: LockTimer,
    /// Lease attached to every greedy recall.
    pub lease: Option<Duration>,
}

impl LockHelper {
    pub fn new(sink: LockSink, timer: LockTimer, lease: Option<Duration>) -> Self {
        Self { sink, timer, lease }
    }
}

/// Read-only view of connected clients.
pub trait ChannelManager: Send + Sync {
    fn is_active(&self, client: ClientId) -> bool;

    /// Remote address of `client`, for diagnostics.
    fn channel_address(&self, client: ClientId) -> Option<String>;
}

/// In-memory [`ChannelManager`] maintained by whoever owns the connections.
#[derive(Debug, Default)]
pub struct ConnectedClients {
    clients: RwLock<HashMap<ClientId, String>>,
}

impl ConnectedClients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, client: ClientId, address: impl Into<String>) {
        self.clients.write().insert(client, address.into());
    }

    pub fn disconnect(&self, client: ClientId) {
        self.clients.write().remove(&client);
    }
}

impl ChannelManager for ConnectedClients {
    fn is_active(&self, client: ClientId) -> bool {
        self.clients.read().contains_key(&client)
    }

    fn channel_address(&self, client: ClientId) -> Option<String> {
        self.clients.read().get(&client).cloned()
    }
}
