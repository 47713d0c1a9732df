//! Server side of the lock protocol.
//!
//! The [`LockManager`] owns a [`LockStore`] of [`ServerLock`]s. Each lock
//! keeps an ordered chain of [`ServerLockContext`]s (holders, then queued
//! requests, then waiters) and awards according to its [`LockPolicy`]:
//!
//! - greedy: whole locks are granted to clients and recalled under
//!   contention;
//! - non-greedy: every request is awarded to the thread that made it.
//!
//! Responses to clients go out through a [`LockSink`].
//!
//! [`LockPolicy`]: crate::config::LockPolicy

pub mod context;
mod greedy;
pub mod helper;
pub mod lock;
pub mod manager;
mod non_greedy;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use context::ServerLockContext;
pub use helper::{
    ChannelManager, ConnectedClients, LockHelper, LockResponse, LockResponseContext, LockSink, LockTimer,
    TimerCallback,
};
pub use lock::ServerLock;
pub use manager::{LockManager, ServerStatus};
pub use store::{CheckedOutLock, LockStore};
