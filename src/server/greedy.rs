//! Award policy that hands whole locks to clients.
//!
//! A greedy grant (awarded to [`ThreadId::VM_ID`]) lets a client serve its
//! own threads without asking again. The server takes a grant back with a
//! recall as soon as another client queues behind it, and while any recall
//! is outstanding nothing new is awarded: requests queue until the recalled
//! client commits.
//!
//! Waiters force per-thread awards. A client serving a wait/notify pair
//! locally would strand waiters the server is tracking.

use super::context::ServerLockContext;
use super::helper::{LockHelper, LockResponse};
use super::lock::ServerLock;
use crate::error::{LockError, Result};
use crate::types::{ClientId, ContextType, LockContext, ServerLockLevel, ThreadId};
use tracing::{debug, warn};

/// Queue `request` unless the client's greedy grant already covers it.
pub(super) fn request_lock(lock: &mut ServerLock, mut request: ServerLockContext, helper: &LockHelper) {
    if holds_greedily(lock, request.client_id, request.level()) {
        debug!(
            lock = %lock.lock_id(),
            client = %request.client_id,
            thread = %request.thread_id,
            "Request covered by greedy grant"
        );
        request.cancel_timer();
        return;
    }
    lock.add(request);
    process_pending(lock, helper);
}

pub(super) fn process_pending(lock: &mut ServerLock, helper: &LockHelper) {
    if lock.is_recalled() {
        return;
    }
    if let Some(request) = lock.next_request_if_can_award() {
        if request.level().is_write() {
            award_write(lock, request, helper);
        } else {
            award_reads(lock, request, helper);
        }
    }
    recall_if_contended(lock, helper);
}

/// Ask every greedy holder without an outstanding recall to give its grant
/// back.
pub(super) fn recall(lock: &mut ServerLock, level: ServerLockLevel, helper: &LockHelper) {
    let targets: Vec<ClientId> = lock
        .greedy_holders()
        .map(|c| c.client_id)
        .filter(|client| !lock.recalled.contains(client))
        .collect();
    for client in targets {
        debug!(lock = %lock.lock_id(), %client, %level, lease = ?helper.lease, "Recalling greedy grant");
        helper.sink.send(
            lock.lock_id(),
            client,
            ThreadId::VM_ID,
            LockResponse::Recall {
                level,
                lease: helper.lease,
            },
        );
        lock.recalled.insert(client);
    }
}

/// Replace `client`'s greedy grant with the per-thread state it reported.
///
/// A greedy holder in `contexts` keeps a (possibly downgraded) grant.
pub(super) fn recall_commit(
    lock: &mut ServerLock,
    client: ClientId,
    contexts: Vec<LockContext>,
    helper: &LockHelper,
) -> Result<()> {
    if lock.greedy_holder(client).is_none() {
        return Err(LockError::ProtocolViolation(format!(
            "{} committed a recall of {} without holding a greedy grant",
            client,
            lock.lock_id()
        )));
    }

    for mut stale in lock.contexts.remove_where(|c| c.client_id == client) {
        stale.cancel_timer();
    }
    lock.recalled.remove(&client);
    debug!(lock = %lock.lock_id(), %client, contexts = contexts.len(), "Recall committed");

    for context in &contexts {
        if context.client_id != client {
            warn!(
                lock = %lock.lock_id(),
                %client,
                other = %context.client_id,
                "Recall commit carried another client's context"
            );
            continue;
        }
        let mut entry = ServerLockContext::from(context);
        match context.state.context_type() {
            ContextType::GreedyHolder | ContextType::Holder => lock.add_holder(entry.with_timeout(None)),
            ContextType::Pending => lock.add_pending(entry.with_timeout(None)),
            ContextType::TryPending => {
                lock.schedule_timer(&mut entry, helper);
                lock.add_try_pending(entry);
            }
            ContextType::Waiter => {
                lock.schedule_timer(&mut entry, helper);
                lock.add_waiter(entry);
            }
        }
    }

    process_pending(lock, helper);
    Ok(())
}

fn holds_greedily(lock: &ServerLock, client: ClientId, level: ServerLockLevel) -> bool {
    lock.greedy_holder(client)
        .map_or(false, |grant| grant.level().is_write() || level.is_read())
}

fn award_write(lock: &mut ServerLock, mut request: ServerLockContext, helper: &LockHelper) {
    if lock.has_waiters() {
        lock.award(request, helper);
        return;
    }

    request.cancel_timer();
    let client = request.client_id;
    // The client resolves its other queued requests under the grant.
    let absorbed = lock.remove_pending_of(client);
    debug!(lock = %lock.lock_id(), %client, absorbed, "Greedy write award");
    lock.award_greedy(client, ServerLockLevel::Write, helper);
}

/// One greedy read grant per requesting client, covering all of that
/// client's queued reads.
fn award_reads(lock: &mut ServerLock, first: ServerLockContext, helper: &LockHelper) {
    let mut clients: Vec<ClientId> = Vec::new();
    let mut requests = vec![first];
    requests.extend(lock.remove_all_pending_reads());
    for mut request in requests {
        request.cancel_timer();
        if !clients.contains(&request.client_id) {
            clients.push(request.client_id);
        }
    }

    for client in clients {
        if lock.greedy_holder(client).is_none() {
            lock.award_greedy(client, ServerLockLevel::Read, helper);
        }
    }
}

/// Anything still queued behind a greedy grant has to wait for a recall.
fn recall_if_contended(lock: &mut ServerLock, helper: &LockHelper) {
    if lock.pending_count() == 0 || lock.greedy_holders().next().is_none() {
        return;
    }
    let level = if lock.has_pending_writes() {
        ServerLockLevel::Write
    } else {
        ServerLockLevel::Read
    };
    recall(lock, level, helper);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LockPolicy;
    use crate::server::testing::{Harness, C1, C2, C3, T1, T2, T3};
    use crate::types::{LockContextState, LockId, NotifyAction};
    use std::time::Duration;

    const R: ServerLockLevel = ServerLockLevel::Read;
    const W: ServerLockLevel = ServerLockLevel::Write;
    const VM: ThreadId = ThreadId::VM_ID;

    fn greedy() -> ServerLock {
        ServerLock::new(LockId::named("L"), LockPolicy::Greedy)
    }

    fn recall_of(level: ServerLockLevel) -> LockResponse {
        LockResponse::Recall { level, lease: None }
    }

    fn ctx(client: ClientId, thread: ThreadId, state: LockContextState) -> LockContext {
        LockContext::new(LockId::named("L"), client, thread, state)
    }

    #[tokio::test]
    async fn test_uncontended_write_is_awarded_greedily() {
        let mut h = Harness::new();
        let mut lock = greedy();

        lock.lock(C1, T1, W, &h.helper).unwrap();
        assert_eq!(h.sent(), vec![(C1, VM, LockResponse::Award { level: W })]);

        // Further requests from the same client are covered by the grant.
        lock.lock(C1, T2, R, &h.helper).unwrap();
        assert!(h.sent().is_empty());
        assert_eq!(lock.contexts().len(), 1);

        lock.unlock(C1, VM, &h.helper);
        assert!(lock.is_empty());
    }

    #[tokio::test]
    async fn test_contention_recalls_greedy_writer() {
        let mut h = Harness::new();
        let mut lock = greedy();

        lock.lock(C1, T1, W, &h.helper).unwrap();
        h.sent();
        lock.lock(C2, T2, W, &h.helper).unwrap();
        assert_eq!(h.sent(), vec![(C1, VM, recall_of(W))]);
        assert!(lock.is_recalled());

        // A second request while the recall is out only queues.
        lock.lock(C3, T3, R, &h.helper).unwrap();
        assert!(h.sent().is_empty());
        assert_eq!(lock.pending_count(), 2);

        lock.recall_commit(C1, Vec::new(), &h.helper).unwrap();
        assert_eq!(h.sent(), vec![(C2, VM, LockResponse::Award { level: W }), (C2, VM, recall_of(R))]);
    }

    #[tokio::test]
    async fn test_reads_are_recalled_for_a_queued_write() {
        let mut h = Harness::new();
        let mut lock = greedy();

        lock.lock(C1, T1, R, &h.helper).unwrap();
        lock.lock(C2, T1, R, &h.helper).unwrap();
        assert_eq!(
            h.sent(),
            vec![
                (C1, VM, LockResponse::Award { level: R }),
                (C2, VM, LockResponse::Award { level: R }),
            ]
        );

        lock.lock(C3, T1, W, &h.helper).unwrap();
        // Holders sit at the head of the chain, most recent first.
        assert_eq!(h.sent(), vec![(C2, VM, recall_of(W)), (C1, VM, recall_of(W))]);

        lock.recall_commit(C1, Vec::new(), &h.helper).unwrap();
        assert!(h.sent().is_empty());
        lock.recall_commit(C2, Vec::new(), &h.helper).unwrap();
        assert_eq!(h.sent(), vec![(C3, VM, LockResponse::Award { level: W })]);
    }

    #[tokio::test]
    async fn test_recall_commit_reinserts_per_thread_state() {
        let mut h = Harness::new();
        let mut lock = greedy();

        lock.lock(C1, T1, W, &h.helper).unwrap();
        lock.lock(C2, T1, W, &h.helper).unwrap();
        h.sent();

        let snapshot = vec![
            ctx(C1, T1, LockContextState::HolderWrite),
            ctx(C1, T2, LockContextState::PendingRead),
        ];
        lock.recall_commit(C1, snapshot, &h.helper).unwrap();
        assert!(h.sent().is_empty());
        assert!(!lock.is_recalled());

        let states: Vec<_> = lock.contexts().into_iter().map(|c| (c.client_id, c.thread_id, c.state)).collect();
        assert_eq!(
            states,
            vec![
                (C1, T1, LockContextState::HolderWrite),
                (C2, T1, LockContextState::PendingWrite),
                (C1, T2, LockContextState::PendingRead),
            ]
        );

        // Per-thread holds now behave like a non-greedy lock.
        lock.unlock(C1, T1, &h.helper);
        assert_eq!(h.sent(), vec![(C2, VM, LockResponse::Award { level: W }), (C2, VM, recall_of(R))]);
    }

    #[tokio::test]
    async fn test_recall_commit_can_keep_a_read_grant() {
        let mut h = Harness::new();
        let mut lock = greedy();

        lock.lock(C1, T1, W, &h.helper).unwrap();
        lock.lock(C2, T1, R, &h.helper).unwrap();
        assert_eq!(h.sent().last(), Some(&(C1, VM, recall_of(R))));

        lock.recall_commit(C1, vec![ctx(C1, VM, LockContextState::GreedyHolderRead)], &h.helper)
            .unwrap();
        assert_eq!(h.sent(), vec![(C2, VM, LockResponse::Award { level: R })]);
        assert_eq!(lock.greedy_holders().count(), 2);
    }

    #[tokio::test]
    async fn test_recall_commit_without_grant_is_a_violation() {
        let h = Harness::new();
        let mut lock = greedy();
        lock.lock(C1, T1, W, &h.helper).unwrap();
        let err = lock.recall_commit(C2, Vec::new(), &h.helper).unwrap_err();
        assert!(matches!(err, LockError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn test_waiters_force_per_thread_award() {
        let mut h = Harness::new();
        let mut lock = greedy();
        let id = LockId::named("L");

        lock.reestablish_state(&LockContext::new(id, C1, T1, LockContextState::Waiter), &h.helper)
            .unwrap();
        lock.lock(C2, T2, W, &h.helper).unwrap();
        assert_eq!(h.sent(), vec![(C2, T2, LockResponse::Award { level: W })]);

        let notified = lock.notify(C2, T2, NotifyAction::One).unwrap();
        assert_eq!(notified.len(), 1);
        lock.unlock(C2, T2, &h.helper);
        // No waiters left, so the re-queued waiter gets a greedy grant.
        assert_eq!(h.sent(), vec![(C1, VM, LockResponse::Award { level: W })]);
    }

    #[tokio::test]
    async fn test_notify_through_greedy_grant() {
        let h = Harness::new();
        let mut lock = greedy();
        lock.lock(C1, T1, W, &h.helper).unwrap();
        assert!(lock.notify(C1, T3, NotifyAction::All).unwrap().is_empty());
        assert!(matches!(
            lock.notify(C2, T3, NotifyAction::All),
            Err(LockError::IllegalMonitorState(_))
        ));
    }

    #[tokio::test]
    async fn test_zero_timeout_refusal_recalls() {
        let mut h = Harness::new();
        let mut lock = greedy();

        lock.lock(C1, T1, W, &h.helper).unwrap();
        h.sent();
        lock.try_lock(C2, T2, W, Duration::ZERO, &h.helper).unwrap();
        assert_eq!(
            h.sent(),
            vec![(C2, T2, LockResponse::Refuse { level: W }), (C1, VM, recall_of(W))]
        );
        assert_eq!(lock.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_recall_carries_configured_lease() {
        let lease = Some(Duration::from_millis(250));
        let mut h = Harness::with_lease(lease);
        let mut lock = greedy();

        lock.lock(C1, T1, W, &h.helper).unwrap();
        lock.lock(C2, T1, W, &h.helper).unwrap();
        assert_eq!(
            h.sent().last(),
            Some(&(C1, VM, LockResponse::Recall { level: W, lease }))
        );
    }

    #[tokio::test]
    async fn test_departed_greedy_holder_releases_lock() {
        let mut h = Harness::new();
        let mut lock = greedy();

        lock.lock(C1, T1, W, &h.helper).unwrap();
        lock.lock(C2, T1, W, &h.helper).unwrap();
        h.sent();

        assert!(!lock.clear_state_for_node(C1, &h.helper));
        assert!(!lock.is_recalled());
        assert_eq!(h.sent(), vec![(C2, VM, LockResponse::Award { level: W })]);
    }
}
