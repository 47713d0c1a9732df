//! Error types for the Strata lock manager.
//!
//! This module provides a unified error type [`LockError`] for client and
//! server lock operations, along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Garbage lock**: the per-lock state object was reclaimed by the client
//!   GC. Expected and recoverable: the client registry discards the object and
//!   retries against a fresh one, so application code never observes it.
//! - **Caller bugs**: illegal monitor state and unsupported lock upgrades.
//! - **Protocol violations**: client and server views of a lock disagree.
//! - **Lifecycle**: interruption, or the manager is not running.
//! - **Configuration**: invalid settings or unreadable configuration files.
//!
//! # Example
//!
//! ```rust
//! use strata_dlm::error::{LockError, Result};
//!
//! fn check(held: bool) -> Result<()> {
//!     if !held {
//!         return Err(LockError::IllegalMonitorState("lock not held".into()));
//!     }
//!     Ok(())
//! }
//!
//! let err = check(false).unwrap_err();
//! assert!(!err.is_retryable());
//! assert!(err.is_fatal());
//! ```

use std::io;
use thiserror::Error;

/// Main error type for lock operations.
#[derive(Error, Debug)]
pub enum LockError {
    // Recoverable
    #[error("Lock state has been garbage collected")]
    GarbageLock,

    // Caller errors
    #[error("Illegal monitor state: {0}")]
    IllegalMonitorState(String),

    #[error("Lock upgrade not supported: {0}")]
    UpgradeNotSupported(String),

    // Internal desynchronization
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    // Lifecycle
    #[error("Interrupted while blocked on {0}")]
    Interrupted(String),

    #[error("Lock manager is not running")]
    NotRunning,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // Generic errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LockError {
    /// Check if the operation should be retried against a fresh lock object.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LockError::GarbageLock)
    }

    /// Errors that indicate a caller bug or a client/server desync.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LockError::IllegalMonitorState(_)
                | LockError::UpgradeNotSupported(_)
                | LockError::ProtocolViolation(_)
                | LockError::Internal(_)
        )
    }
}

impl From<serde_json::Error> for LockError {
    fn from(e: serde_json::Error) -> Self {
        LockError::Serialization(e.to_string())
    }
}

/// Result type for lock operations.
pub type Result<T> = std::result::Result<T, LockError>;
