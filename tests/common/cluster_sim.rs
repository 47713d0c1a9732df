// Loopback cluster for integration tests
// Wires client lock managers straight to an in-process server lock manager

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use strata_dlm::client::{ClientLockManager, FlushCallback, HandshakeMessage, Notify, RemoteLockManager};
use strata_dlm::config::{ClientLockConfig, LockPolicy, ServerLockConfig};
use strata_dlm::scheduler::Scheduler;
use strata_dlm::server::{ConnectedClients, LockManager, LockResponse, LockResponseContext};
use strata_dlm::{ClientId, LockContext, LockId, ServerLockLevel, SessionId, ThreadId};
use tokio::runtime::Runtime;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{error, warn};

type Clients = Arc<RwLock<HashMap<ClientId, Arc<ClientLockManager>>>>;
type ServerSlot = Arc<RwLock<Arc<LockManager>>>;
/// Session each client had with one server, stamped on that server's
/// responses.
type Sessions = Arc<RwLock<HashMap<ClientId, SessionId>>>;

/// Remote that calls the current server directly.
///
/// Every call only enqueues responses on the server's sink, so it is safe
/// to make with a client lock's mutex held.
pub struct LoopbackRemote {
    client: ClientId,
    server: ServerSlot,
}

impl LoopbackRemote {
    fn server(&self) -> Arc<LockManager> {
        Arc::clone(&self.server.read())
    }

    fn report(&self, op: &str, result: strata_dlm::Result<()>) {
        if let Err(e) = result {
            error!(client = %self.client, op, error = %e, "Loopback call failed");
        }
    }
}

impl RemoteLockManager for LoopbackRemote {
    fn client_id(&self) -> ClientId {
        self.client
    }

    fn lock(&self, lock: &LockId, thread: ThreadId, level: ServerLockLevel) {
        self.report("lock", self.server().lock(lock, self.client, thread, level));
    }

    fn try_lock(&self, lock: &LockId, thread: ThreadId, level: ServerLockLevel, timeout: Duration) {
        self.report(
            "try_lock",
            self.server().try_lock(lock, self.client, thread, level, timeout),
        );
    }

    fn unlock(&self, lock: &LockId, thread: ThreadId, _level: ServerLockLevel) {
        self.report("unlock", self.server().unlock(lock, self.client, thread));
    }

    fn wait(&self, lock: &LockId, thread: ThreadId, timeout: Option<Duration>) {
        self.report("wait", self.server().wait(lock, self.client, thread, timeout));
    }

    fn interrupt(&self, lock: &LockId, thread: ThreadId) {
        self.report("interrupt", self.server().interrupt(lock, self.client, thread));
    }

    fn recall_commit(&self, lock: &LockId, contexts: Vec<LockContext>) {
        self.report(
            "recall_commit",
            self.server().recall_commit(lock, self.client, contexts),
        );
    }

    fn query(&self, lock: &LockId, thread: ThreadId) {
        self.report("query", self.server().query(lock, self.client, thread));
    }

    fn flush(&self, _lock: &LockId) {}

    fn async_flush(&self, _lock: &LockId, _callback: FlushCallback) -> bool {
        true
    }

    fn wait_for_server_to_receive_txns(&self, _lock: &LockId) {}
}

/// One server and any number of clients, connected in process.
pub struct LoopbackCluster {
    pub runtime: Runtime,
    config: ServerLockConfig,
    channels: Arc<ConnectedClients>,
    server: ServerSlot,
    sessions: RwLock<Sessions>,
    clients: Clients,
}

impl LoopbackCluster {
    /// A started cluster using `policy`.
    pub fn new(policy: LockPolicy) -> Self {
        let runtime = Runtime::new().expect("Failed to create runtime");
        let config = ServerLockConfig {
            segments: 8,
            policy,
            ..ServerLockConfig::default()
        };
        let channels = Arc::new(ConnectedClients::new());
        let clients: Clients = Arc::new(RwLock::new(HashMap::new()));
        let (server, sessions) = Self::spawn_server(&runtime, &config, &channels, &clients);
        server.start();
        Self {
            runtime,
            config,
            channels,
            server: Arc::new(RwLock::new(server)),
            sessions: RwLock::new(sessions),
            clients,
        }
    }

    pub fn server(&self) -> Arc<LockManager> {
        Arc::clone(&self.server.read())
    }

    /// Connect a new client.
    pub fn client(&self, id: u64) -> Arc<ClientLockManager> {
        let client = ClientId(id);
        let remote = Arc::new(LoopbackRemote {
            client,
            server: Arc::clone(&self.server),
        });
        let manager = ClientLockManager::new(
            ClientLockConfig::default(),
            remote,
            Scheduler::new(self.runtime.handle().clone()),
        );
        self.channels.connect(client, format!("loopback:{}", id));
        self.sessions.read().write().insert(client, manager.session());
        self.clients.write().insert(client, Arc::clone(&manager));
        manager
    }

    /// Replace the server with a fresh one that has not started yet.
    ///
    /// Clients are paused; reconnect them with [`reconnect`](Self::reconnect)
    /// and then start the new server. The old server keeps delivering under
    /// the sessions clients had with it.
    pub fn restart_server(&self) -> Arc<LockManager> {
        for client in self.clients.read().values() {
            client.pause();
        }
        let (server, sessions) = Self::spawn_server(&self.runtime, &self.config, &self.channels, &self.clients);
        *self.sessions.write() = sessions;
        let old = std::mem::replace(&mut *self.server.write(), Arc::clone(&server));
        old.stop();
        server
    }

    /// Replay a paused client's state into the (not yet started) server.
    pub fn reconnect(&self, client: &ClientLockManager) -> strata_dlm::Result<Vec<LockContext>> {
        let mut message = HandshakeMessage::default();
        let session = client.initialize_handshake(&mut message)?;
        self.sessions.read().write().insert(client.client_id(), session);
        self.server()
            .reestablish_state(client.client_id(), message.contexts.clone())?;
        Ok(message.contexts)
    }

    /// Deliver a notify the client could not resolve locally.
    ///
    /// Notified waiters hear about it before any award that follows.
    pub fn forward_notify(&self, from: &ClientLockManager, notify: Option<Notify>) -> strata_dlm::Result<usize> {
        let Some(notify) = notify else {
            return Ok(0);
        };
        let notified = self.server().notify(
            &notify.lock_id,
            from.client_id(),
            notify.thread_id,
            notify.action,
        )?;
        let clients = self.clients.read();
        for waiter in &notified {
            match clients.get(&waiter.client_id) {
                Some(client) => client.notified(client.session(), &waiter.lock_id, waiter.thread_id),
                None => warn!(client = %waiter.client_id, "Notified waiter on unknown client"),
            }
        }
        Ok(notified.len())
    }

    fn spawn_server(
        runtime: &Runtime,
        config: &ServerLockConfig,
        channels: &Arc<ConnectedClients>,
        clients: &Clients,
    ) -> (Arc<LockManager>, Sessions) {
        let (tx, rx) = mpsc::unbounded_channel();
        let server = LockManager::new(
            config,
            tx,
            channels.clone(),
            Scheduler::new(runtime.handle().clone()),
        );
        let sessions: Sessions = Arc::new(RwLock::new(HashMap::new()));
        let (clients, route_sessions) = (Arc::clone(clients), Arc::clone(&sessions));
        thread::spawn(move || route(rx, clients, route_sessions));
        (server, sessions)
    }
}

/// Deliver server responses to clients until the server is dropped.
fn route(mut rx: UnboundedReceiver<LockResponseContext>, clients: Clients, sessions: Sessions) {
    while let Some(message) = rx.blocking_recv() {
        let client = clients.read().get(&message.client_id).cloned();
        let session = sessions.read().get(&message.client_id).copied();
        let (Some(client), Some(session)) = (client, session) else {
            warn!(client = %message.client_id, "Response for client unknown to this server");
            continue;
        };
        let (lock, thread) = (&message.lock_id, message.thread_id);
        match message.response {
            LockResponse::Award { level } => client.award(session, lock, thread, level),
            LockResponse::Recall { level, lease } => client.recall(session, lock, level, lease),
            LockResponse::Refuse { level } => client.refuse(session, lock, thread, level),
            LockResponse::WaitTimeout => client.wait_timed_out(session, lock, thread),
            LockResponse::Info(info) => client.info(session, lock, thread, info),
        }
    }
}
