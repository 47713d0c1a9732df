//! Award policy that grants every request to the thread that made it.
//!
//! One pass awards either the single write at the head of the queue, or the
//! read at the head together with every other queued read.

use super::helper::LockHelper;
use super::lock::ServerLock;

pub(super) fn process_pending(lock: &mut ServerLock, helper: &LockHelper) {
    let Some(request) = lock.next_request_if_can_award() else {
        return;
    };
    if request.level().is_write() {
        lock.award(request, helper);
        return;
    }

    lock.award(request, helper);
    for read in lock.remove_all_pending_reads() {
        lock.award(read, helper);
    }
}
