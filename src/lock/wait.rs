//! # Waiting, Timeouts and Cancellation
//!
//! A transaction whose request was enqueued waiting suspends itself in
//! [`LockSys::wait_for`]: it takes the wait latch, re-checks its waiting
//! flag, and blocks on its own condition variable. Grant and cancel paths
//! flip the flag and signal under that same latch, so wakeups cannot be
//! lost. The global latch is *not* held while suspended.
//!
//! Cancellation - from a timeout, a kill, or deadlock resolution - routes
//! through [`cancel_waiting_and_release_low`], which dequeues the waiting
//! lock (granting whoever becomes eligible) and releases the owner from
//! its wait. The `cancel` flag on the transaction makes the path visible
//! to concurrent cancellers, keeping it reentrancy-safe.

use std::time::Instant;

use super::arena::LockRef;
use super::{queue, table, LockStatus, LockSys};
use crate::trx::Trx;

use super::LockWorld;

/// Cancel one waiting lock and release the waiting transaction. The
/// caller holds both latches.
pub(crate) fn cancel_waiting_and_release_low(
    world: &mut LockWorld,
    sys: &LockSys,
    lock: LockRef,
) {
    let trx_id = world.arena[lock].trx;
    let handle = world.trx(trx_id).handle.clone();
    handle.set_cancel(true);

    if world.arena[lock].is_table() {
        if !world.trx(trx_id).autoinc_locks.is_empty() {
            table::release_autoinc_locks(world, sys, trx_id);
        }
        table::table_dequeue(world, sys, lock);
    } else {
        queue::rec_dequeue_from_page(world, sys, lock);
    }

    // The dequeue path cleared the wait flag and pointer; wake the owner.
    queue::lock_wait_end(&handle);
    handle.set_cancel(false);
}

impl LockSys {
    /// Cancel the transaction's waiting lock request, if any, and wake
    /// the transaction. Used by kill and timeout paths.
    pub fn cancel_waiting_and_release(&self, trx: &Trx) {
        if trx.cancel_in_progress() {
            // Another thread is already cancelling this wait.
            return;
        }
        let (mut world, _wg) = self.latch_both();
        let world = &mut *world;
        let Some(w) = world.trxs.get(&trx.id()).and_then(|t| t.wait_lock) else {
            return;
        };
        cancel_waiting_and_release_low(world, self, w);
    }

    /// Resolve the transaction's wait state: reports `Deadlock` if it was
    /// chosen as a victim, `Success` if the lock was granted in the
    /// meantime, and otherwise cancels the still-pending wait and reports
    /// `Wait`.
    pub fn trx_handle_wait(&self, trx: &Trx) -> LockStatus {
        let (mut world, _wg) = self.latch_both();
        let world = &mut *world;
        if trx.was_chosen_as_deadlock_victim() {
            trx.set_victim(false);
            return LockStatus::Deadlock;
        }
        let Some(w) = world.trxs.get(&trx.id()).and_then(|t| t.wait_lock) else {
            return LockStatus::Success;
        };
        cancel_waiting_and_release_low(world, self, w);
        LockStatus::Wait
    }

    /// Suspend the calling thread until the transaction's pending lock
    /// request is granted, cancelled, or times out. Returns what the
    /// request came to:
    ///
    /// - `Success` - the lock was granted,
    /// - `Deadlock` - the transaction was rolled back as a victim,
    /// - `WaitTimeout` - the wait budget ran out and the request was
    ///   withdrawn.
    pub fn wait_for(&self, trx: &Trx) -> LockStatus {
        let deadline = trx.lock_wait_timeout().map(|d| Instant::now() + d);
        {
            let mut wg = self.wait_latch();
            while trx.is_waiting() {
                match deadline {
                    Some(at) => {
                        if trx.cond.wait_until(&mut wg, at).timed_out() {
                            break;
                        }
                    }
                    None => trx.cond.wait(&mut wg),
                }
            }
        }

        if trx.was_chosen_as_deadlock_victim() {
            trx.set_victim(false);
            return LockStatus::Deadlock;
        }
        if !trx.is_waiting() {
            return LockStatus::Success;
        }

        // Timed out with the wait still pending: withdraw the request.
        match self.trx_handle_wait(trx) {
            LockStatus::Deadlock => LockStatus::Deadlock,
            LockStatus::Success => LockStatus::Success,
            _ => LockStatus::WaitTimeout,
        }
    }
}
