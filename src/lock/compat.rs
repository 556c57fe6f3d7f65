//! # Conflict Rules
//!
//! Whether a lock request must wait for an existing lock. The mode
//! lattice answers the easy cases; the interesting rules are about gaps:
//!
//! - Gap locks never wait for other gap locks, whoever holds them.
//!   Phantom protection only needs the gap to be *covered*, not owned
//!   exclusively, so concurrent gap S and gap X coexist.
//! - A record-only request ignores gap locks, and a gap-only request
//!   ignores record-only locks; they cover disjoint things.
//! - Nothing ever waits for an insert-intention lock. Insert intentions
//!   exist to be blocked *by* gap locks, not to block others; letting
//!   them block would manufacture deadlocks between inserters.
//! - When a replication layer has already fixed the commit order between
//!   two transactions, gap conflicts between them are skipped: the gap
//!   lock's only job (serialization order) is already done.

use super::mode::TypeMode;
use super::object::Lock;
use super::prdt::prdt_has_to_wait;
use super::{LockWorld, PriorityPolicy};
use crate::trx::Trx;

/// Does a record lock request `(trx, type_mode)` have to wait for the
/// existing record lock `lock2` on the same record?
///
/// `on_supremum` marks requests against the page supremum, which are gap
/// requests by construction whatever their flags say.
pub(crate) fn rec_has_to_wait(
    world: &LockWorld,
    policy: &dyn PriorityPolicy,
    trx: &Trx,
    type_mode: TypeMode,
    lock2: &Lock,
    on_supremum: bool,
) -> bool {
    debug_assert!(!lock2.is_table());

    if trx.id() == lock2.trx || type_mode.mode().compatible(lock2.mode()) {
        return false;
    }

    if (on_supremum || type_mode.is_gap()) && !type_mode.is_insert_intention() {
        // Gap requests without insert intention never wait: conflicting
        // gap coverage is allowed.
        return false;
    }

    if !type_mode.is_insert_intention() && lock2.type_mode.is_gap() {
        // Record-only and next-key requests do not wait for pure gap locks.
        return false;
    }

    if type_mode.is_gap() && lock2.type_mode.is_record_not_gap() {
        return false;
    }

    if lock2.type_mode.is_insert_intention() {
        return false;
    }

    if (type_mode.is_gap() || lock2.type_mode.is_gap())
        && !policy.needs_gap_wait(trx, &world.trx(lock2.trx).handle)
    {
        // The upper layer already ordered these two transactions; the gap
        // conflict cannot change the outcome, only cost a wait.
        return false;
    }

    true
}

/// Does the lock `lock1` (typically a waiting request) have to wait for
/// `lock2`? For record locks, both must cover the same record.
pub(crate) fn has_to_wait(
    world: &LockWorld,
    policy: &dyn PriorityPolicy,
    lock1: &Lock,
    lock2: &Lock,
) -> bool {
    let trx1 = &world.trx(lock1.trx).handle;

    if lock1.trx == lock2.trx || lock1.mode().compatible(lock2.mode()) {
        return false;
    }

    if lock1.is_table() {
        return true;
    }

    debug_assert!(!lock2.is_table());

    if lock1.type_mode.is_predicate() || lock1.type_mode.is_prdt_page() {
        let prdt = lock1.prdt().expect("predicate lock without a rectangle");
        return prdt_has_to_wait(trx1, lock1.type_mode, prdt, lock2);
    }

    rec_has_to_wait(
        world,
        policy,
        trx1,
        lock1.type_mode,
        lock2,
        lock1.bit(crate::types::HEAP_NO_SUPREMUM),
    )
}

/// Strength check used when a transaction probes its own granted locks:
/// does a granted lock with `held` coverage make a request with `want`
/// coverage redundant on this record?
pub(crate) fn covers(held: TypeMode, want: TypeMode, on_supremum: bool) -> bool {
    use super::mode::type_flags::{GAP, REC_NOT_GAP};
    if held.is_waiting() || held.is_insert_intention() {
        return false;
    }
    let gap_ok = held.0 & (GAP | REC_NOT_GAP) == 0
        || on_supremum
        || held.0 & want.0 & (GAP | REC_NOT_GAP) != 0;
    gap_ok && held.mode().stronger_or_eq(want.mode())
}
