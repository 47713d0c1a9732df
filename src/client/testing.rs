//! Recording remote used by the client unit tests.

use super::lock::ClientLock;
use super::remote::{FlushCallback, RemoteLockManager};
use crate::types::{ClientId, LockContext, LockContextState, LockId, ServerLockLevel, ThreadId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    Lock(ThreadId, ServerLockLevel),
    TryLock(ThreadId, ServerLockLevel, Duration),
    Unlock(ThreadId, ServerLockLevel),
    Wait(ThreadId, Option<Duration>),
    Interrupt(ThreadId),
    RecallCommit(Vec<LockContext>),
    Query(ThreadId),
    Flush,
    AsyncFlush,
    WaitForTxns,
}

type Responder = Arc<dyn Fn(&LockId, RemoteCall) + Send + Sync>;

/// Records every outbound call and optionally answers them from another
/// thread, the way a server would.
pub struct RecordingRemote {
    client: ClientId,
    calls: Mutex<Vec<(LockId, RemoteCall)>>,
    responder: Mutex<Option<Responder>>,
    hold_flushes: AtomicBool,
    held: Mutex<Vec<(LockId, FlushCallback)>>,
}

impl RecordingRemote {
    pub fn new(client: ClientId) -> Arc<Self> {
        Arc::new(Self {
            client,
            calls: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
            hold_flushes: AtomicBool::new(false),
            held: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().iter().map(|(_, c)| c.clone()).collect()
    }

    pub fn calls_for(&self, lock: &LockId) -> Vec<RemoteCall> {
        self.calls
            .lock()
            .iter()
            .filter(|(l, _)| l == lock)
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    pub fn on_call<F>(&self, f: F)
    where
        F: Fn(&LockId, RemoteCall) + Send + Sync + 'static,
    {
        *self.responder.lock() = Some(Arc::new(f));
    }

    /// Make `async_flush` report in-flight transactions.
    pub fn hold_flushes(&self, hold: bool) {
        self.hold_flushes.store(hold, Ordering::SeqCst);
    }

    pub fn complete_flushes(&self) {
        let held: Vec<_> = self.held.lock().drain(..).collect();
        for (lock, callback) in held {
            callback(&lock);
        }
    }

    fn record(&self, lock: &LockId, call: RemoteCall) {
        self.calls.lock().push((lock.clone(), call.clone()));
        let responder = self.responder.lock().clone();
        if let Some(respond) = responder {
            let lock = lock.clone();
            thread::spawn(move || respond(&lock, call));
        }
    }
}

impl RemoteLockManager for RecordingRemote {
    fn client_id(&self) -> ClientId {
        self.client
    }

    fn lock(&self, lock: &LockId, thread: ThreadId, level: ServerLockLevel) {
        self.record(lock, RemoteCall::Lock(thread, level));
    }

    fn try_lock(&self, lock: &LockId, thread: ThreadId, level: ServerLockLevel, timeout: Duration) {
        self.record(lock, RemoteCall::TryLock(thread, level, timeout));
    }

    fn unlock(&self, lock: &LockId, thread: ThreadId, level: ServerLockLevel) {
        self.record(lock, RemoteCall::Unlock(thread, level));
    }

    fn wait(&self, lock: &LockId, thread: ThreadId, timeout: Option<Duration>) {
        self.record(lock, RemoteCall::Wait(thread, timeout));
    }

    fn interrupt(&self, lock: &LockId, thread: ThreadId) {
        self.record(lock, RemoteCall::Interrupt(thread));
    }

    fn recall_commit(&self, lock: &LockId, contexts: Vec<LockContext>) {
        self.record(lock, RemoteCall::RecallCommit(contexts));
    }

    fn query(&self, lock: &LockId, thread: ThreadId) {
        self.record(lock, RemoteCall::Query(thread));
    }

    fn flush(&self, lock: &LockId) {
        self.record(lock, RemoteCall::Flush);
    }

    fn async_flush(&self, lock: &LockId, callback: FlushCallback) -> bool {
        self.record(lock, RemoteCall::AsyncFlush);
        if self.hold_flushes.load(Ordering::SeqCst) {
            self.held.lock().push((lock.clone(), callback));
            false
        } else {
            true
        }
    }

    fn wait_for_server_to_receive_txns(&self, lock: &LockId) {
        self.record(lock, RemoteCall::WaitForTxns);
    }
}

/// Answer every lock request with a per-thread award, including the pending
/// requests carried by a recall commit.
pub fn per_thread_awards(remote: &Arc<RecordingRemote>, lock: &Arc<ClientLock>) {
    let (weak_lock, weak_remote) = (Arc::downgrade(lock), Arc::downgrade(remote));
    remote.on_call(move |_, call| {
        let (Some(lock), Some(remote)) = (weak_lock.upgrade(), weak_remote.upgrade()) else {
            return;
        };
        match call {
            RemoteCall::Lock(thread, level) | RemoteCall::TryLock(thread, level, _) => {
                lock.award(remote.as_ref(), thread, level).unwrap();
            }
            RemoteCall::RecallCommit(contexts) => {
                for context in contexts {
                    match context.state {
                        LockContextState::PendingRead | LockContextState::TryPendingRead => {
                            lock.award(remote.as_ref(), context.thread_id, ServerLockLevel::Read).unwrap()
                        }
                        LockContextState::PendingWrite | LockContextState::TryPendingWrite => {
                            lock.award(remote.as_ref(), context.thread_id, ServerLockLevel::Write).unwrap()
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    });
}

/// Answer every lock request with a greedy award at the requested level.
pub fn greedy_awards(remote: &Arc<RecordingRemote>, lock: &Arc<ClientLock>) {
    let (weak_lock, weak_remote) = (Arc::downgrade(lock), Arc::downgrade(remote));
    remote.on_call(move |_, call| {
        let (Some(lock), Some(remote)) = (weak_lock.upgrade(), weak_remote.upgrade()) else {
            return;
        };
        if let RemoteCall::Lock(_, level) | RemoteCall::TryLock(_, level, _) = call {
            lock.award(remote.as_ref(), ThreadId::VM_ID, level).unwrap();
        }
    });
}
