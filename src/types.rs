//! Core type definitions shared by the client and server lock engines.
//!
//! # Key Types
//!
//! - [`LockId`]: cluster-wide identity of a mutex
//! - [`ThreadId`]: a logical thread within a client, with the [`ThreadId::VM_ID`]
//!   sentinel standing for a client-wide (greedy) holder
//! - [`ClientId`] / [`SessionId`]: a cluster member and its connection epoch
//! - [`LockLevel`] / [`ServerLockLevel`]: client-visible and server-visible levels
//! - [`LockContext`]: the unit of state exchanged between clients and the
//!   server (recall commits, handshakes, query responses)
//!
//! # Examples
//!
//! ```rust
//! use strata_dlm::types::{LockContextState, LockLevel, ServerLockLevel};
//!
//! assert_eq!(ServerLockLevel::from(LockLevel::SynchronousWrite), ServerLockLevel::Write);
//!
//! let state = LockContextState::pending(ServerLockLevel::Read);
//! assert_eq!(state, LockContextState::PendingRead);
//! assert_eq!(state.lock_level(), ServerLockLevel::Read);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Identity of a cluster-wide mutex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockId {
    /// Lock named by an arbitrary string.
    Named(String),
    /// Lock derived from a numeric key.
    Long(u64),
    /// Monitor of a shared object.
    Object(u64),
    /// Monitor of a field within a shared object.
    Field { object: u64, field: String },
}

impl LockId {
    pub fn named(name: impl Into<String>) -> Self {
        LockId::Named(name.into())
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockId::Named(name) => write!(f, "named:{}", name),
            LockId::Long(id) => write!(f, "long:{}", id),
            LockId::Object(id) => write!(f, "object:{}", id),
            LockId::Field { object, field } => write!(f, "field:{}.{}", object, field),
        }
    }
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_THREAD_ID: ThreadId = ThreadId(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed));
}

/// A logical thread within a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadId(pub u64);

impl ThreadId {
    /// Sentinel for the client-wide greedy holder.
    pub const VM_ID: ThreadId = ThreadId(u64::MAX);

    /// Identity of the calling OS thread, assigned on first use.
    pub fn current() -> Self {
        CURRENT_THREAD_ID.with(|id| *id)
    }

    pub fn is_vm(&self) -> bool {
        *self == Self::VM_ID
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_vm() {
            write!(f, "thread:vm")
        } else {
            write!(f, "thread:{}", self.0)
        }
    }
}

/// A cluster member connected to the lock server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client:{}", self.0)
    }
}

/// Connection epoch of a client. Bumped on every reconnect handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session:{}", self.0)
    }
}

/// Lock level as requested by application code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockLevel {
    Read,
    Write,
    /// Write that blocks on unlock until the server has received every
    /// transaction made under the hold.
    SynchronousWrite,
    /// Untracked level. Always succeeds locally.
    Concurrent,
}

impl LockLevel {
    pub fn is_read(&self) -> bool {
        matches!(self, LockLevel::Read)
    }

    pub fn is_write(&self) -> bool {
        matches!(self, LockLevel::Write | LockLevel::SynchronousWrite)
    }

    pub fn is_sync_write(&self) -> bool {
        matches!(self, LockLevel::SynchronousWrite)
    }

    pub fn is_concurrent(&self) -> bool {
        matches!(self, LockLevel::Concurrent)
    }
}

impl fmt::Display for LockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockLevel::Read => "READ",
            LockLevel::Write => "WRITE",
            LockLevel::SynchronousWrite => "SYNCHRONOUS_WRITE",
            LockLevel::Concurrent => "CONCURRENT",
        };
        f.write_str(name)
    }
}

/// Lock level as seen by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerLockLevel {
    Read,
    Write,
}

impl ServerLockLevel {
    pub fn is_read(&self) -> bool {
        matches!(self, ServerLockLevel::Read)
    }

    pub fn is_write(&self) -> bool {
        matches!(self, ServerLockLevel::Write)
    }
}

impl From<LockLevel> for ServerLockLevel {
    /// Concurrent never reaches the server; it maps to read for completeness.
    fn from(level: LockLevel) -> Self {
        if level.is_write() {
            ServerLockLevel::Write
        } else {
            ServerLockLevel::Read
        }
    }
}

impl From<ServerLockLevel> for LockLevel {
    fn from(level: ServerLockLevel) -> Self {
        match level {
            ServerLockLevel::Read => LockLevel::Read,
            ServerLockLevel::Write => LockLevel::Write,
        }
    }
}

impl fmt::Display for ServerLockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerLockLevel::Read => f.write_str("READ"),
            ServerLockLevel::Write => f.write_str("WRITE"),
        }
    }
}

/// Coarse kind of a lock context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextType {
    GreedyHolder,
    Holder,
    Pending,
    TryPending,
    Waiter,
}

/// State of a lock context, combining its kind and level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockContextState {
    GreedyHolderRead,
    GreedyHolderWrite,
    HolderRead,
    HolderWrite,
    PendingRead,
    PendingWrite,
    TryPendingRead,
    TryPendingWrite,
    Waiter,
}

impl LockContextState {
    pub fn greedy_holder(level: ServerLockLevel) -> Self {
        match level {
            ServerLockLevel::Read => LockContextState::GreedyHolderRead,
            ServerLockLevel::Write => LockContextState::GreedyHolderWrite,
        }
    }

    pub fn holder(level: ServerLockLevel) -> Self {
        match level {
            ServerLockLevel::Read => LockContextState::HolderRead,
            ServerLockLevel::Write => LockContextState::HolderWrite,
        }
    }

    pub fn pending(level: ServerLockLevel) -> Self {
        match level {
            ServerLockLevel::Read => LockContextState::PendingRead,
            ServerLockLevel::Write => LockContextState::PendingWrite,
        }
    }

    pub fn try_pending(level: ServerLockLevel) -> Self {
        match level {
            ServerLockLevel::Read => LockContextState::TryPendingRead,
            ServerLockLevel::Write => LockContextState::TryPendingWrite,
        }
    }

    pub fn context_type(&self) -> ContextType {
        match self {
            LockContextState::GreedyHolderRead | LockContextState::GreedyHolderWrite => {
                ContextType::GreedyHolder
            }
            LockContextState::HolderRead | LockContextState::HolderWrite => ContextType::Holder,
            LockContextState::PendingRead | LockContextState::PendingWrite => ContextType::Pending,
            LockContextState::TryPendingRead | LockContextState::TryPendingWrite => {
                ContextType::TryPending
            }
            LockContextState::Waiter => ContextType::Waiter,
        }
    }

    /// Waiters always reacquire at write level.
    pub fn lock_level(&self) -> ServerLockLevel {
        match self {
            LockContextState::GreedyHolderRead
            | LockContextState::HolderRead
            | LockContextState::PendingRead
            | LockContextState::TryPendingRead => ServerLockLevel::Read,
            _ => ServerLockLevel::Write,
        }
    }

    pub fn is_holder(&self) -> bool {
        matches!(
            self.context_type(),
            ContextType::Holder | ContextType::GreedyHolder
        )
    }

    pub fn is_pending(&self) -> bool {
        matches!(
            self.context_type(),
            ContextType::Pending | ContextType::TryPending
        )
    }
}

/// One entry of lock state exchanged between a client and the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockContext {
    pub lock_id: LockId,
    pub client_id: ClientId,
    pub thread_id: ThreadId,
    pub state: LockContextState,
    /// Try-lock budget or wait timeout; `None` waits forever.
    pub timeout: Option<Duration>,
}

impl LockContext {
    pub fn new(
        lock_id: LockId,
        client_id: ClientId,
        thread_id: ThreadId,
        state: LockContextState,
    ) -> Self {
        Self {
            lock_id,
            client_id,
            thread_id,
            state,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Whether a notify wakes one waiter or all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyAction {
    One,
    All,
}

impl NotifyAction {
    pub fn is_all(&self) -> bool {
        matches!(self, NotifyAction::All)
    }
}

/// The server's view of one lock, answering a query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Holders, greedy holders and waiters, in chain order.
    pub contexts: Vec<LockContext>,
    /// Queued requests, try-locks included.
    pub pending_count: usize,
}

impl LockInfo {
    pub fn holders(&self) -> impl Iterator<Item = &LockContext> {
        self.contexts.iter().filter(|c| c.state.is_holder())
    }

    pub fn waiter_count(&self) -> usize {
        self.contexts
            .iter()
            .filter(|c| c.state.context_type() == ContextType::Waiter)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_mapping() {
        assert_eq!(ServerLockLevel::from(LockLevel::Read), ServerLockLevel::Read);
        assert_eq!(ServerLockLevel::from(LockLevel::Write), ServerLockLevel::Write);
        assert_eq!(
            ServerLockLevel::from(LockLevel::SynchronousWrite),
            ServerLockLevel::Write
        );
        assert!(LockLevel::SynchronousWrite.is_write());
        assert!(!LockLevel::Concurrent.is_read());
        assert!(!LockLevel::Concurrent.is_write());
    }

    #[test]
    fn test_context_state_classification() {
        assert_eq!(
            LockContextState::GreedyHolderWrite.context_type(),
            ContextType::GreedyHolder
        );
        assert!(LockContextState::HolderRead.is_holder());
        assert!(LockContextState::TryPendingWrite.is_pending());
        assert!(!LockContextState::Waiter.is_pending());
        assert_eq!(LockContextState::Waiter.lock_level(), ServerLockLevel::Write);
        assert_eq!(
            LockContextState::try_pending(ServerLockLevel::Read),
            LockContextState::TryPendingRead
        );
    }

    #[test]
    fn test_current_thread_ids_are_distinct() {
        let here = ThreadId::current();
        assert_eq!(here, ThreadId::current());
        let there = std::thread::spawn(ThreadId::current).join().unwrap();
        assert_ne!(here, there);
        assert!(!here.is_vm());
    }

    #[test]
    fn test_lock_id_display() {
        assert_eq!(LockId::named("L").to_string(), "named:L");
        let field = LockId::Field {
            object: 7,
            field: "count".into(),
        };
        assert_eq!(field.to_string(), "field:7.count");
    }
}
