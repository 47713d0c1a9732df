//! Segmented map of server locks.
//!
//! Locks are spread over a fixed number of segments, each behind its own
//! mutex. Checking a lock out holds its segment's mutex until the returned
//! guard is dropped; all mutation of a [`ServerLock`] happens through such a
//! guard. Empty locks are dropped from the store on checkin.

use super::lock::ServerLock;
use crate::config::LockPolicy;
use crate::types::{LockContext, LockId};
use parking_lot::{Mutex, MutexGuard};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::ops::{Deref, DerefMut};

type Segment = HashMap<LockId, ServerLock>;

pub struct LockStore {
    segments: Vec<Mutex<Segment>>,
    policy: LockPolicy,
}

impl LockStore {
    /// `segments` is raised to one if zero.
    pub fn new(segments: usize, policy: LockPolicy) -> Self {
        Self {
            segments: (0..segments.max(1)).map(|_| Mutex::new(HashMap::new())).collect(),
            policy,
        }
    }

    /// Check out `lock_id`, creating it if absent.
    pub fn checkout(&self, lock_id: &LockId) -> CheckedOutLock<'_> {
        let mut segment = self.segment(lock_id).lock();
        let lock = segment
            .remove(lock_id)
            .unwrap_or_else(|| ServerLock::new(lock_id.clone(), self.policy));
        CheckedOutLock { segment, lock }
    }

    /// Check out `lock_id` only if the server knows it.
    pub fn checkout_existing(&self, lock_id: &LockId) -> Option<CheckedOutLock<'_>> {
        let mut segment = self.segment(lock_id).lock();
        let lock = segment.remove(lock_id)?;
        Some(CheckedOutLock { segment, lock })
    }

    /// Apply `f` to every lock, one segment at a time. Locks left empty are
    /// dropped.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&mut ServerLock),
    {
        for segment in &self.segments {
            let mut segment = segment.lock();
            for lock in segment.values_mut() {
                f(lock);
            }
            segment.retain(|_, lock| !lock.is_empty());
        }
    }

    pub fn len(&self) -> usize {
        self.segments.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Chains of every lock, for diagnostics.
    pub fn snapshot(&self) -> Vec<(LockId, Vec<LockContext>)> {
        let mut all: Vec<_> = self
            .segments
            .iter()
            .flat_map(|s| {
                s.lock()
                    .iter()
                    .map(|(id, lock)| (id.clone(), lock.contexts()))
                    .collect::<Vec<_>>()
            })
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    fn segment(&self, lock_id: &LockId) -> &Mutex<Segment> {
        let mut hasher = DefaultHasher::new();
        lock_id.hash(&mut hasher);
        let index = (hasher.finish() % self.segments.len() as u64) as usize;
        &self.segments[index]
    }
}

/// A lock checked out of the [`LockStore`]. Dropping it checks the lock
/// back in.
pub struct CheckedOutLock<'a> {
    segment: MutexGuard<'a, Segment>,
    lock: ServerLock,
}

impl Deref for CheckedOutLock<'_> {
    type Target = ServerLock;

    fn deref(&self) -> &ServerLock {
        &self.lock
    }
}

impl DerefMut for CheckedOutLock<'_> {
    fn deref_mut(&mut self) -> &mut ServerLock {
        &mut self.lock
    }
}

impl Drop for CheckedOutLock<'_> {
    fn drop(&mut self) {
        if self.lock.is_empty() {
            return;
        }
        let placeholder = ServerLock::new(self.lock.lock_id().clone(), self.lock.policy());
        let lock = std::mem::replace(&mut self.lock, placeholder);
        self.segment.insert(lock.lock_id().clone(), lock);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::testing::{Harness, C1, C2, T1};
    use crate::types::ServerLockLevel;

    #[tokio::test]
    async fn test_checkin_keeps_only_non_empty_locks() {
        let h = Harness::new();
        let store = LockStore::new(4, LockPolicy::NonGreedy);
        let lock = LockId::named("A");

        {
            let checked_out = store.checkout(&lock);
            assert!(checked_out.is_empty());
        }
        assert!(store.is_empty());
        assert!(store.checkout_existing(&lock).is_none());

        store
            .checkout(&lock)
            .lock(C1, T1, ServerLockLevel::Write, &h.helper)
            .unwrap();
        assert_eq!(store.len(), 1);

        store.checkout_existing(&lock).unwrap().unlock(C1, T1, &h.helper);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_for_each_drops_emptied_locks() {
        let h = Harness::new();
        let store = LockStore::new(2, LockPolicy::NonGreedy);
        for (i, client) in [C1, C2, C1].into_iter().enumerate() {
            store
                .checkout(&LockId::Long(i as u64))
                .lock(client, T1, ServerLockLevel::Read, &h.helper)
                .unwrap();
        }
        assert_eq!(store.len(), 3);

        store.for_each(|lock| {
            lock.clear_state_for_node(C1, &h.helper);
        });
        let remaining: Vec<_> = store.snapshot().into_iter().map(|(id, _)| id).collect();
        assert_eq!(remaining, vec![LockId::Long(1)]);
    }

    #[test]
    fn test_zero_segments_still_works() {
        let store = LockStore::new(0, LockPolicy::Greedy);
        assert!(store.checkout_existing(&LockId::named("x")).is_none());
        assert_eq!(store.len(), 0);
    }
}
