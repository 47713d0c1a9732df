//! Collaborator interfaces of the client lock engine.

use crate::types::{ClientId, LockContext, LockId, ServerLockLevel, ThreadId};
use std::time::Duration;

/// Invoked once every transaction under a lock has reached the server.
pub type FlushCallback = Box<dyn FnOnce(&LockId) + Send + 'static>;

/// Outbound half of the lock protocol.
///
/// Every method except [`flush`](RemoteLockManager::flush) and
/// [`wait_for_server_to_receive_txns`](RemoteLockManager::wait_for_server_to_receive_txns)
/// is called with the client lock's internal mutex held. Those methods must
/// only enqueue a message: they may not block, and may not call back into the
/// client lock manager on the calling thread.
pub trait RemoteLockManager: Send + Sync {
    fn client_id(&self) -> ClientId;

    fn lock(&self, lock: &LockId, thread: ThreadId, level: ServerLockLevel);

    /// `timeout` of zero asks for an immediate answer.
    fn try_lock(&self, lock: &LockId, thread: ThreadId, level: ServerLockLevel, timeout: Duration);

    fn unlock(&self, lock: &LockId, thread: ThreadId, level: ServerLockLevel);

    /// `timeout` of `None` waits until notified.
    fn wait(&self, lock: &LockId, thread: ThreadId, timeout: Option<Duration>);

    fn interrupt(&self, lock: &LockId, thread: ThreadId);

    fn recall_commit(&self, lock: &LockId, contexts: Vec<LockContext>);

    fn query(&self, lock: &LockId, thread: ThreadId);

    /// Block until every transaction under `lock` has been flushed.
    fn flush(&self, lock: &LockId);

    /// Returns `true` if nothing is in flight, in which case `callback` is
    /// dropped unused. Otherwise `callback` runs later on another thread.
    fn async_flush(&self, lock: &LockId, callback: FlushCallback) -> bool;

    /// Block until the server has received every transaction under `lock`.
    fn wait_for_server_to_receive_txns(&self, lock: &LockId);

    fn shutdown(&self) {}
}

/// Sink for the lock state a client reports when it reconnects.
pub trait ClientHandshakeMessage {
    fn add_lock_context(&mut self, context: LockContext);
}

/// Plain in-memory handshake payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeMessage {
    pub contexts: Vec<LockContext>,
}

impl ClientHandshakeMessage for HandshakeMessage {
    fn add_lock_context(&mut self, context: LockContext) {
        self.contexts.push(context);
    }
}
