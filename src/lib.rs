//! Strata DLM - a distributed lock manager with client-side lock caching.
//!
//! Application threads on many clients share named locks held by a central
//! server. To keep uncontended locking cheap, the server can grant a whole
//! lock to a client ("greedy" grant); the client then serves its own
//! threads locally until another client asks for the lock and the server
//! recalls the grant.
//!
//! # Features
//!
//! - **Read/write locks**: shared reads, exclusive writes, local
//!   synchronous-write and concurrent levels on the client.
//! - **Greedy leasing**: whole-lock grants with recall under contention.
//! - **Monitors**: wait/notify on a held write lock, with timeouts and
//!   interrupts.
//! - **Try-locks**: immediate or timed, refused by the server on expiry.
//! - **Reconnect**: clients pause, resend their state in a handshake and
//!   resume; the server rebuilds locks before serving new requests.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Client: ClientLockManager → ClientLock → lock state chain  │
//! │          ClientGreediness (FREE / GREEDY / RECALLED ...)    │
//! ├──────────────── RemoteLockManager ↓   ↑ LockResponse ───────┤
//! │  Server: LockManager → LockStore segments → ServerLock      │
//! │          context chain, greedy / non-greedy award policy    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The transport between the two halves is not part of this crate: the
//! client talks through a [`client::RemoteLockManager`] and the server
//! emits [`server::LockResponseContext`]s on a channel.

pub mod chain;
pub mod client;
pub mod config;
pub mod error;
pub mod observability;
pub mod scheduler;
pub mod server;
pub mod types;

// Re-exports
pub use error::{LockError, Result};
pub use types::*;
