//! Greediness state machine of a client lock.
//!
//! Tracks whether the client holds a client-wide (greedy) grant from the
//! server, is being asked to give one back, or runs every request past the
//! server. Every transition is a pure function of the current state and the
//! event. Transitions out of [`ClientGreediness::Garbage`] fail with
//! [`LockError::GarbageLock`], except the ones that are harmless no-ops.

use crate::error::{LockError, Result};
use crate::types::{ClientId, LockContext, LockContextState, LockId, ServerLockLevel, ThreadId};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientGreediness {
    /// Collected by the GC. Terminal.
    Garbage,
    /// No greedy grant; every request is delegated to the server.
    Free,
    GreedyRead,
    GreedyWrite,
    RecalledRead,
    RecalledWrite,
    ReadRecallInProgress,
    WriteRecallInProgress,
}

impl ClientGreediness {
    /// Whether a local request at `level` can be granted without the server.
    pub fn can_award(self, level: crate::types::LockLevel) -> Result<bool> {
        match self {
            ClientGreediness::Garbage => Err(LockError::GarbageLock),
            ClientGreediness::GreedyRead => Ok(level.is_read()),
            ClientGreediness::GreedyWrite => Ok(true),
            ClientGreediness::Free
            | ClientGreediness::RecalledRead
            | ClientGreediness::RecalledWrite
            | ClientGreediness::ReadRecallInProgress
            | ClientGreediness::WriteRecallInProgress => Ok(false),
        }
    }

    /// Whether unlocks must flush transactions before the server sees them.
    pub fn flush_on_unlock(self) -> bool {
        match self {
            ClientGreediness::GreedyRead | ClientGreediness::GreedyWrite => false,
            ClientGreediness::Garbage => false,
            ClientGreediness::Free
            | ClientGreediness::RecalledRead
            | ClientGreediness::RecalledWrite
            | ClientGreediness::ReadRecallInProgress
            | ClientGreediness::WriteRecallInProgress => true,
        }
    }

    pub fn is_free(self) -> bool {
        self == ClientGreediness::Free
    }

    pub fn is_greedy(self) -> bool {
        matches!(
            self,
            ClientGreediness::GreedyRead | ClientGreediness::GreedyWrite
        )
    }

    pub fn is_recalled(self) -> bool {
        matches!(
            self,
            ClientGreediness::RecalledRead | ClientGreediness::RecalledWrite
        )
    }

    pub fn is_recall_in_progress(self) -> bool {
        matches!(
            self,
            ClientGreediness::ReadRecallInProgress | ClientGreediness::WriteRecallInProgress
        )
    }

    pub fn is_garbage(self) -> bool {
        self == ClientGreediness::Garbage
    }

    /// A local request at `level` could not be satisfied locally.
    pub fn requested(self, level: ServerLockLevel) -> Result<Self> {
        match self {
            ClientGreediness::Garbage => Err(LockError::GarbageLock),
            ClientGreediness::GreedyRead if level.is_write() => Ok(ClientGreediness::RecalledRead),
            other => Ok(other),
        }
    }

    /// The server granted the client a greedy lock.
    pub fn awarded(self, level: ServerLockLevel) -> Result<Self> {
        match (self, level) {
            (ClientGreediness::Garbage, _) => Err(LockError::GarbageLock),
            (ClientGreediness::Free, ServerLockLevel::Read) => Ok(ClientGreediness::GreedyRead),
            (ClientGreediness::Free, ServerLockLevel::Write) => Ok(ClientGreediness::GreedyWrite),
            (ClientGreediness::GreedyRead, ServerLockLevel::Read) => Ok(self),
            (ClientGreediness::GreedyWrite, _) => Ok(self),
            (state, level) => Err(LockError::ProtocolViolation(format!(
                "greedy {} award received in state {}",
                level, state
            ))),
        }
    }

    /// The server asked for the greedy grant back.
    ///
    /// A greedy write survives a leased recall while local acquires are
    /// still queued on it.
    pub fn recalled(self, lease: Option<Duration>, has_pending: bool) -> Self {
        match self {
            ClientGreediness::GreedyRead => ClientGreediness::RecalledRead,
            ClientGreediness::GreedyWrite => {
                if lease.map_or(false, |l| !l.is_zero()) && has_pending {
                    ClientGreediness::GreedyWrite
                } else {
                    ClientGreediness::RecalledWrite
                }
            }
            other => other,
        }
    }

    /// The recall is waiting on an asynchronous flush.
    pub fn recall_in_progress(self) -> Result<Self> {
        match self {
            ClientGreediness::Garbage => Err(LockError::GarbageLock),
            ClientGreediness::RecalledRead => Ok(ClientGreediness::ReadRecallInProgress),
            ClientGreediness::RecalledWrite => Ok(ClientGreediness::WriteRecallInProgress),
            ClientGreediness::ReadRecallInProgress | ClientGreediness::WriteRecallInProgress => {
                Ok(self)
            }
            state => Err(LockError::ProtocolViolation(format!(
                "recall in progress from state {}",
                state
            ))),
        }
    }

    /// The recall commit has been sent to the server.
    pub fn recall_committed(self) -> Result<Self> {
        match self {
            ClientGreediness::Garbage => Ok(self),
            ClientGreediness::Free => Ok(self),
            ClientGreediness::RecalledRead
            | ClientGreediness::RecalledWrite
            | ClientGreediness::ReadRecallInProgress
            | ClientGreediness::WriteRecallInProgress => Ok(ClientGreediness::Free),
            state => Err(LockError::ProtocolViolation(format!(
                "recall committed from state {}",
                state
            ))),
        }
    }

    /// Only a free lock can be collected.
    pub fn mark_as_garbage(self) -> Self {
        match self {
            ClientGreediness::Free => ClientGreediness::Garbage,
            other => other,
        }
    }

    /// Greedy holder context for handshakes, if the client holds a grant.
    pub fn to_context(self, lock_id: &LockId, client_id: ClientId) -> Option<LockContext> {
        let level = match self {
            ClientGreediness::GreedyRead
            | ClientGreediness::RecalledRead
            | ClientGreediness::ReadRecallInProgress => ServerLockLevel::Read,
            ClientGreediness::GreedyWrite
            | ClientGreediness::RecalledWrite
            | ClientGreediness::WriteRecallInProgress => ServerLockLevel::Write,
            ClientGreediness::Free | ClientGreediness::Garbage => return None,
        };
        Some(LockContext::new(
            lock_id.clone(),
            client_id,
            ThreadId::VM_ID,
            LockContextState::greedy_holder(level),
        ))
    }
}

impl fmt::Display for ClientGreediness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientGreediness::Garbage => "GARBAGE",
            ClientGreediness::Free => "FREE",
            ClientGreediness::GreedyRead => "GREEDY_READ",
            ClientGreediness::GreedyWrite => "GREEDY_WRITE",
            ClientGreediness::RecalledRead => "RECALLED_READ",
            ClientGreediness::RecalledWrite => "RECALLED_WRITE",
            ClientGreediness::ReadRecallInProgress => "READ_RECALL_IN_PROGRESS",
            ClientGreediness::WriteRecallInProgress => "WRITE_RECALL_IN_PROGRESS",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LockLevel;
    use ClientGreediness::*;

    const ALL: [ClientGreediness; 8] = [
        Garbage,
        Free,
        GreedyRead,
        GreedyWrite,
        RecalledRead,
        RecalledWrite,
        ReadRecallInProgress,
        WriteRecallInProgress,
    ];

    const LEASE: Option<Duration> = Some(Duration::from_millis(100));

    #[test]
    fn test_awarded() {
        assert_eq!(Free.awarded(ServerLockLevel::Read).unwrap(), GreedyRead);
        assert_eq!(Free.awarded(ServerLockLevel::Write).unwrap(), GreedyWrite);
        assert_eq!(GreedyWrite.awarded(ServerLockLevel::Read).unwrap(), GreedyWrite);
        assert!(matches!(
            RecalledWrite.awarded(ServerLockLevel::Write),
            Err(LockError::ProtocolViolation(_))
        ));
        assert!(matches!(
            Garbage.awarded(ServerLockLevel::Read),
            Err(LockError::GarbageLock)
        ));
    }

    #[test]
    fn test_requested() {
        assert_eq!(GreedyRead.requested(ServerLockLevel::Write).unwrap(), RecalledRead);
        assert_eq!(GreedyRead.requested(ServerLockLevel::Read).unwrap(), GreedyRead);
        assert_eq!(GreedyWrite.requested(ServerLockLevel::Write).unwrap(), GreedyWrite);
        assert_eq!(GreedyWrite.requested(ServerLockLevel::Read).unwrap(), GreedyWrite);
        assert_eq!(Free.requested(ServerLockLevel::Write).unwrap(), Free);
        assert_eq!(
            WriteRecallInProgress.requested(ServerLockLevel::Read).unwrap(),
            WriteRecallInProgress
        );
        assert!(Garbage.requested(ServerLockLevel::Read).is_err());
    }

    #[test]
    fn test_recalled() {
        assert_eq!(GreedyRead.recalled(LEASE, true), RecalledRead);
        assert_eq!(GreedyRead.recalled(None, false), RecalledRead);
        assert_eq!(GreedyWrite.recalled(LEASE, true), GreedyWrite);
        assert_eq!(GreedyWrite.recalled(LEASE, false), RecalledWrite);
        assert_eq!(GreedyWrite.recalled(None, true), RecalledWrite);
        assert_eq!(GreedyWrite.recalled(Some(Duration::ZERO), true), RecalledWrite);
        assert_eq!(Free.recalled(None, false), Free);
        assert_eq!(RecalledWrite.recalled(None, false), RecalledWrite);
        assert_eq!(ReadRecallInProgress.recalled(None, true), ReadRecallInProgress);
        assert_eq!(Garbage.recalled(LEASE, true), Garbage);
    }

    #[test]
    fn test_recall_in_progress_and_commit() {
        assert_eq!(RecalledRead.recall_in_progress().unwrap(), ReadRecallInProgress);
        assert_eq!(RecalledWrite.recall_in_progress().unwrap(), WriteRecallInProgress);
        assert!(GreedyWrite.recall_in_progress().is_err());
        assert!(matches!(
            Garbage.recall_in_progress(),
            Err(LockError::GarbageLock)
        ));

        for state in [RecalledRead, RecalledWrite, ReadRecallInProgress, WriteRecallInProgress] {
            assert_eq!(state.recall_committed().unwrap(), Free);
        }
        assert_eq!(Free.recall_committed().unwrap(), Free);
        assert_eq!(Garbage.recall_committed().unwrap(), Garbage);
        assert!(GreedyRead.recall_committed().is_err());
    }

    #[test]
    fn test_mark_as_garbage_only_from_free() {
        for state in ALL {
            let expected = if state == Free || state == Garbage {
                Garbage
            } else {
                state
            };
            assert_eq!(state.mark_as_garbage(), expected, "from {}", state);
        }
    }

    #[test]
    fn test_can_award() {
        assert!(!Free.can_award(LockLevel::Read).unwrap());
        assert!(GreedyRead.can_award(LockLevel::Read).unwrap());
        assert!(!GreedyRead.can_award(LockLevel::Write).unwrap());
        assert!(GreedyWrite.can_award(LockLevel::Write).unwrap());
        assert!(GreedyWrite.can_award(LockLevel::SynchronousWrite).unwrap());
        for state in [RecalledRead, RecalledWrite, ReadRecallInProgress, WriteRecallInProgress] {
            assert!(!state.can_award(LockLevel::Read).unwrap());
        }
        assert!(matches!(
            Garbage.can_award(LockLevel::Read),
            Err(LockError::GarbageLock)
        ));
    }

    #[test]
    fn test_flush_on_unlock() {
        assert!(Free.flush_on_unlock());
        assert!(!GreedyRead.flush_on_unlock());
        assert!(!GreedyWrite.flush_on_unlock());
        assert!(RecalledRead.flush_on_unlock());
        assert!(WriteRecallInProgress.flush_on_unlock());
    }

    #[test]
    fn test_to_context() {
        let lock = LockId::named("L");
        let ctx = RecalledWrite.to_context(&lock, ClientId(3)).unwrap();
        assert_eq!(ctx.thread_id, ThreadId::VM_ID);
        assert_eq!(ctx.state, LockContextState::GreedyHolderWrite);
        assert!(Free.to_context(&lock, ClientId(3)).is_none());
        assert!(Garbage.to_context(&lock, ClientId(3)).is_none());
    }
}
