//! Client side of the lock protocol.
//!
//! Application threads talk to a [`ClientLockManager`]. Each lock they touch
//! gets a [`ClientLock`], which answers from local state whenever the client
//! holds a greedy grant and otherwise delegates to the server through a
//! [`RemoteLockManager`].

pub mod greediness;
pub mod lock;
pub mod manager;
pub mod remote;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

pub use greediness::ClientGreediness;
pub use lock::ClientLock;
pub use manager::{ClientLockManager, ManagerState, Notify};
pub use remote::{ClientHandshakeMessage, FlushCallback, HandshakeMessage, RemoteLockManager};
pub use state::{LockAcquireResult, Parker};
