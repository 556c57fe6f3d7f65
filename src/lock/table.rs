//! # Table Locks
//!
//! Each table carries a lock queue (oldest first) with the same FIFO
//! grant discipline as record queues. Record locks require a covering
//! intention lock here first: `S` rows need table `IS` or stronger, `X`
//! rows need table `IX` or stronger.
//!
//! Since intentions are mutually compatible, the common case is a queue
//! of IS/IX locks nobody ever conflicts with. The per-table counter of
//! S/X locks makes that case free: when it is zero, an intention request
//! skips the queue scan entirely.
//!
//! ## AUTO-INC
//!
//! The auto-increment token is a table lock released at end of statement
//! rather than end of transaction. Granted AUTO-INC locks are recorded
//! per transaction in acquisition order and released in reverse, and the
//! table keeps one cached lock object that the uncontended grant reuses
//! instead of allocating.

use std::sync::Arc;

use super::arena::LockRef;
use super::compat;
use super::mode::{type_flags, LockMode, TypeMode};
use super::object::Lock;
use super::queue::{lock_grant, reset_lock_and_trx_wait, trx_list_remove};
use super::{deadlock, LockStats, LockStatus, LockSys, LockWorld, TrxLocks};
use crate::trx::Trx;
use crate::types::{TableId, TrxId};

/// Does `trx` hold a granted table lock at least as strong as `mode`?
pub(crate) fn table_has(
    world: &LockWorld,
    trx_id: TrxId,
    table: TableId,
    mode: LockMode,
) -> bool {
    let Some(t) = world.trxs.get(&trx_id) else {
        return false;
    };
    t.table_locks.iter().flatten().any(|r| {
        let l = &world.arena[*r];
        l.table() == table && !l.is_waiting() && l.mode().stronger_or_eq(mode)
    })
}

/// Newest lock of another transaction that is incompatible with a `mode`
/// request on `table`. With `include_waiting`, waiting locks block too
/// (the enqueue path); without, only granted locks count (the re-grant
/// path).
pub(crate) fn table_other_has_incompatible(
    world: &LockWorld,
    trx_id: TrxId,
    include_waiting: bool,
    table: TableId,
    mode: LockMode,
) -> Option<LockRef> {
    let Some(tq) = world.tables.get(&table) else {
        return None;
    };
    // Intention requests cannot conflict while no S/X lock exists.
    if matches!(
        mode,
        LockMode::IntentionShared | LockMode::IntentionExclusive
    ) && tq.n_lock_x_or_s == 0
    {
        return None;
    }
    tq.queue.iter().rev().copied().find(|r| {
        let l = &world.arena[*r];
        l.trx != trx_id
            && !l.mode().compatible(mode)
            && (include_waiting || !l.is_waiting())
    })
}

/// Create a table lock and append it to the table's queue. No conflict
/// or deadlock checking.
pub(crate) fn table_create(
    world: &mut LockWorld,
    sys: &LockSys,
    type_mode: TypeMode,
    table: TableId,
    trx: &Arc<Trx>,
    c_lock: Option<LockRef>,
) -> LockRef {
    world.ensure_trx(trx);
    let mode = type_mode.mode();

    {
        let tq = world.table(table);
        match mode {
            LockMode::AutoInc => tq.n_waiting_or_granted_autoinc += 1,
            LockMode::Shared | LockMode::Exclusive => tq.n_lock_x_or_s += 1,
            _ => {}
        }
    }

    let granted_autoinc = mode == LockMode::AutoInc && !type_mode.is_waiting();

    // The uncontended AUTO-INC grant reuses the table's cached object.
    let cached = if granted_autoinc {
        world.table(table).autoinc_cached.take()
    } else {
        None
    };
    let r = match cached {
        Some(c) => {
            world.arena[c] = Lock::new_table(trx.id(), type_mode, table);
            c
        }
        None => world.arena.alloc(Lock::new_table(trx.id(), type_mode, table)),
    };

    if granted_autoinc {
        let tq = world.table(table);
        debug_assert!(tq.autoinc_trx.is_none());
        tq.autoinc_trx = Some(trx.id());
        world.trx_mut(trx.id()).autoinc_locks.push(Some(r));
    }

    // A priority transaction slots in right behind the lock it conflicts
    // with instead of at the tail.
    let mut inserted = false;
    if let Some(c) = c_lock {
        if sys.policy.is_priority(trx) {
            let tq = world.table(table);
            if let Some(pos) = tq.queue.iter().position(|x| *x == c) {
                tq.queue.insert(pos + 1, r);
                inserted = true;
            }
        }
    }
    if !inserted {
        world.table(table).queue.push(r);
    }

    let t = world.trx_mut(trx.id());
    t.locks.push(r);
    t.table_locks.push(Some(r));
    if type_mode.is_waiting() {
        t.wait_lock = Some(r);
        t.handle.set_waiting(true);
    } else {
        // Mirror the grant so the owner can probe it without the global
        // latch; waiting locks enter the mirror through lock_grant.
        trx.table_grant_add(table, mode);
    }

    LockStats::inc(&sys.stats.table_locks_created);
    r
}

/// Pop the tail of the AUTO-INC vector along with any holes behind it.
fn pop_autoinc(t: &mut TrxLocks) {
    t.autoinc_locks.pop();
    while matches!(t.autoinc_locks.last(), Some(None)) {
        t.autoinc_locks.pop();
    }
}

/// Remove one granted AUTO-INC lock from its owner's vector. Out-of-order
/// removal (a table dropped mid-statement) leaves a hole.
fn remove_autoinc_lock(t: &mut TrxLocks, r: LockRef) {
    match t.autoinc_locks.last() {
        Some(Some(last)) if *last == r => pop_autoinc(t),
        _ => {
            let slot = t
                .autoinc_locks
                .iter_mut()
                .rev()
                .find(|s| **s == Some(r))
                .expect("AUTO-INC lock missing from its owner's vector");
            *slot = None;
        }
    }
}

/// Remove a table lock from the queue and all per-transaction vectors.
/// Does NOT grant waiters.
pub(crate) fn table_remove_low(world: &mut LockWorld, sys: &LockSys, r: LockRef) {
    let (table, trx_id, mode, was_waiting) = {
        let l = &world.arena[r];
        debug_assert!(l.is_table());
        (l.table(), l.trx, l.mode(), l.is_waiting())
    };

    if was_waiting {
        reset_lock_and_trx_wait(world, r);
    }

    match mode {
        LockMode::AutoInc => {
            let held = world.tables.get(&table).and_then(|tq| tq.autoinc_trx) == Some(trx_id);
            // The granted lock is registered as holder; a waiting one is not.
            debug_assert_eq!(held, !was_waiting);
            if held {
                world.table(table).autoinc_trx = None;
                remove_autoinc_lock(world.trx_mut(trx_id), r);
            }
            let tq = world.table(table);
            debug_assert!(tq.n_waiting_or_granted_autoinc > 0);
            tq.n_waiting_or_granted_autoinc -= 1;
        }
        LockMode::Shared | LockMode::Exclusive => {
            let tq = world.table(table);
            debug_assert!(tq.n_lock_x_or_s > 0);
            tq.n_lock_x_or_s -= 1;
        }
        _ => {}
    }

    if !was_waiting {
        world.trx(trx_id).handle.table_grant_remove(table, mode);
    }

    trx_list_remove(world, trx_id, r);
    let t = world.trx_mut(trx_id);
    if let Some(slot) = t.table_locks.iter_mut().find(|s| **s == Some(r)) {
        *slot = None;
    }
    let tq = world.table(table);
    let pos = tq
        .queue
        .iter()
        .position(|x| *x == r)
        .expect("table lock missing from its table's queue");
    tq.queue.remove(pos);

    // Cache the granted AUTO-INC object on the table for reuse.
    let cache = mode == LockMode::AutoInc && !was_waiting && tq.autoinc_cached.is_none();
    if cache {
        tq.autoinc_cached = Some(r);
    } else {
        world.arena.free(r);
    }
    LockStats::inc(&sys.stats.table_locks_removed);
}

/// Does a waiting table lock still have a blocker ahead in the queue?
pub(crate) fn table_has_to_wait_in_queue(
    world: &LockWorld,
    sys: &LockSys,
    wait_r: LockRef,
) -> bool {
    let wait_lock = &world.arena[wait_r];
    debug_assert!(wait_lock.is_table() && wait_lock.is_waiting());
    let table = wait_lock.table();
    let tq = &world.tables[&table];

    if matches!(
        wait_lock.mode(),
        LockMode::IntentionShared | LockMode::IntentionExclusive
    ) && tq.n_lock_x_or_s == 0
    {
        return false;
    }

    for r in &tq.queue {
        if *r == wait_r {
            return false;
        }
        if compat::has_to_wait(world, &*sys.policy, wait_lock, &world.arena[*r]) {
            return true;
        }
    }
    debug_assert!(false, "waiting table lock not found in its queue");
    false
}

/// Remove a table lock, waiting or granted, and grant now-eligible
/// waiters that were queued behind it.
pub(crate) fn table_dequeue(world: &mut LockWorld, sys: &LockSys, in_r: LockRef) {
    let (table, mode) = {
        let l = &world.arena[in_r];
        debug_assert!(l.is_table());
        (l.table(), l.mode())
    };
    let pos = world.tables[&table]
        .queue
        .iter()
        .position(|x| *x == in_r)
        .expect("dequeuing a table lock not in its queue");

    table_remove_low(world, sys, in_r);

    let tq = &world.tables[&table];
    if matches!(
        mode,
        LockMode::IntentionShared | LockMode::IntentionExclusive
    ) && tq.n_lock_x_or_s == 0
    {
        return;
    }

    let behind: Vec<LockRef> = tq.queue[pos..].to_vec();
    for r in behind {
        if world.arena[r].is_waiting() && !table_has_to_wait_in_queue(world, sys, r) {
            lock_grant(world, sys, r);
        }
    }
}

/// Enqueue a waiting table lock and run deadlock detection.
fn table_enqueue_waiting(
    world: &mut LockWorld,
    sys: &LockSys,
    mode: LockMode,
    table: TableId,
    trx: &Arc<Trx>,
    c_lock: Option<LockRef>,
) -> LockStatus {
    if trx.lock_wait_timeout() == Some(std::time::Duration::ZERO) {
        return LockStatus::WaitTimeout;
    }

    let r = table_create(
        world,
        sys,
        TypeMode::new(mode).with(type_flags::WAIT),
        table,
        trx,
        c_lock,
    );
    LockStats::inc(&sys.stats.table_lock_waits);

    match deadlock::check_and_resolve(world, sys, r, trx) {
        Some(victim) if victim == trx.id() => {
            table_remove_low(world, sys, r);
            LockStatus::Deadlock
        }
        _ => {
            if world.trx(trx.id()).wait_lock.is_none() {
                // Deadlock resolution chose another victim and our lock
                // was granted in the process.
                return LockStatus::Success;
            }
            trx.set_victim(false);
            log::debug!("trx {} waits for table {table} in mode {mode}", trx.id());
            LockStatus::Wait
        }
    }
}

/// Release every granted AUTO-INC lock of the transaction, newest first.
pub(crate) fn release_autoinc_locks(world: &mut LockWorld, sys: &LockSys, trx_id: TrxId) {
    loop {
        let Some(last) = world
            .trxs
            .get(&trx_id)
            .and_then(|t| t.autoinc_locks.last().copied())
        else {
            break;
        };
        let r = last.expect("AUTO-INC vector ends with a hole");
        table_dequeue(world, sys, r);
    }
}

impl LockSys {
    /// Lock a table in the given mode. Returns immediately with
    /// [`LockStatus::Success`] if the transaction already holds an equal
    /// or stronger lock.
    pub fn lock_table(&self, table: TableId, mode: LockMode, trx: &Arc<Trx>) -> LockStatus {
        // Only this transaction adds to its own set of granted table
        // locks, so the re-lock probe needs no lock-system latch.
        if trx.holds_table_lock(table, mode) {
            return LockStatus::Success;
        }

        let (mut world, _wg) = self.latch_both();
        let world = &mut *world;
        world.ensure_trx(trx);

        match table_other_has_incompatible(world, trx.id(), true, table, mode) {
            Some(c) => table_enqueue_waiting(world, self, mode, table, trx, Some(c)),
            None => {
                table_create(world, self, TypeMode::new(mode), table, trx, None);
                LockStatus::Success
            }
        }
    }

    /// Release a granted table X lock early (rollback of an insert into
    /// an empty table).
    pub fn table_x_unlock(&self, table: TableId, trx: &Trx) {
        let (mut world, _wg) = self.latch_both();
        let world = &mut *world;
        let Some(t) = world.trxs.get(&trx.id()) else {
            debug_assert!(false, "table_x_unlock without any locks");
            return;
        };
        let x = TypeMode::new(LockMode::Exclusive);
        let found = t.table_locks.iter().flatten().copied().find(|r| {
            let l = &world.arena[*r];
            l.table() == table && l.type_mode == x
        });
        match found {
            Some(r) => table_dequeue(world, self, r),
            None => debug_assert!(false, "table_x_unlock: lock not found"),
        }
    }

    /// Release the transaction's AUTO-INC locks at the end of a
    /// statement, in reverse acquisition order.
    pub fn unlock_table_autoinc(&self, trx: &Trx) {
        debug_assert!(!trx.is_waiting());
        let (mut world, _wg) = self.latch_both();
        let world = &mut *world;
        if world
            .trxs
            .get(&trx.id())
            .is_some_and(|t| !t.autoinc_locks.is_empty())
        {
            release_autoinc_locks(world, self, trx.id());
        }
    }

    /// Does `trx` hold a granted table lock at least as strong as `mode`?
    pub fn table_lock_held(&self, trx: &Trx, table: TableId, mode: LockMode) -> bool {
        let world = self.latch();
        table_has(&world, trx.id(), table, mode)
    }
}
