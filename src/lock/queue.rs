//! # Record Lock Queues
//!
//! The lock chain of a page doubles as the wait queue for every record on
//! it: locks appear in enqueue order, and a waiting lock is granted when
//! no lock ahead of it in the chain still conflicts on its record.
//!
//! ## Enqueue
//!
//! A granted request can usually piggyback on an existing lock object of
//! the same transaction with the same `type_mode` on the same page by
//! setting one more bitmap bit. Two situations force a fresh object:
//!
//! - the request itself waits (a waiter must sit at its queue position),
//! - some waiting lock already covers the record (bit-setting on an
//!   earlier object would jump the queue).
//!
//! ## Grant
//!
//! Releasing coverage of a record re-scans the whole page chain and
//! grants every waiter that no longer conflicts with anything ahead of
//! it. The scan deliberately does not stop at the first still-blocked
//! exclusive waiter: a shared waiter queued behind it may be compatible
//! with everything ahead and gets granted too.

use std::sync::Arc;

use smallvec::SmallVec;

use super::arena::LockRef;
use super::compat;
use super::mode::{type_flags, LockMode, TypeMode};
use super::object::Lock;
use super::prdt::Mbr;
use super::{deadlock, table, LockStats, LockStatus, LockSys, LockWorld};
use crate::trx::Trx;
use crate::types::{Block, HeapNo, Index, PageId, HEAP_NO_INFIMUM, HEAP_NO_SUPREMUM};

/// Locks in the record hash covering `(page, heap_no)`, in queue order.
pub(crate) fn rec_locks_on(
    world: &LockWorld,
    page: PageId,
    heap_no: HeapNo,
) -> SmallVec<[LockRef; 8]> {
    world
        .rec_hash
        .chain(&world.arena, page)
        .into_iter()
        .filter(|r| world.arena[*r].bit(heap_no))
        .collect()
}

/// Clear the wait state of a lock: drop the owner's `wait_lock` pointer
/// and the `WAIT` flag. Does not signal; does not touch the bitmap.
pub(crate) fn reset_lock_and_trx_wait(world: &mut LockWorld, r: LockRef) {
    let lock = &mut world.arena[r];
    debug_assert!(lock.is_waiting());
    lock.type_mode = lock.type_mode.without(type_flags::WAIT);
    let trx_id = lock.trx;
    let t = world.trx_mut(trx_id);
    debug_assert!(t.wait_lock.is_none() || t.wait_lock == Some(r));
    t.wait_lock = None;
    t.handle.set_waiting(false);
}

/// Wake the owner of a formerly waiting lock. The caller holds the wait
/// latch; the waiter re-checks its flags under the same latch, so the
/// wakeup cannot be lost.
pub(crate) fn lock_wait_end(trx: &Trx) {
    trx.set_waiting(false);
    trx.cond.notify_one();
}

/// Grant a waiting lock and release its owner from the wait.
pub(crate) fn lock_grant(world: &mut LockWorld, _sys: &LockSys, r: LockRef) {
    reset_lock_and_trx_wait(world, r);

    let (trx_id, table_grant) = {
        let lock = &world.arena[r];
        let grant = lock.is_table().then(|| (lock.table(), lock.mode()));
        (lock.trx, grant)
    };
    if let Some((table_id, mode)) = table_grant {
        if mode == LockMode::AutoInc {
            let tq = world.table(table_id);
            debug_assert!(tq.autoinc_trx.is_none());
            tq.autoinc_trx = Some(trx_id);
            world.trx_mut(trx_id).autoinc_locks.push(Some(r));
        }
        world.trx(trx_id).handle.table_grant_add(table_id, mode);
    }

    log::trace!("lock wait for trx {trx_id} ends");

    // When deadlock resolution grants us on behalf of another victim, the
    // owner may not have suspended yet; signalling is then a no-op.
    let handle = world.trx(trx_id).handle.clone();
    lock_wait_end(&handle);
}

/// Create a record (or predicate) lock and insert it into its page chain.
/// No conflict or deadlock checking here.
pub(crate) fn rec_create(
    world: &mut LockWorld,
    sys: &LockSys,
    mut type_mode: TypeMode,
    block: Block,
    heap_no: HeapNo,
    index: Index,
    trx: &Arc<Trx>,
    c_lock: Option<LockRef>,
    prdt: Option<Mbr>,
) -> LockRef {
    // All locks on the supremum are gap locks by construction.
    if heap_no == HEAP_NO_SUPREMUM {
        debug_assert!(!type_mode.is_record_not_gap());
        type_mode = type_mode.without(type_flags::GAP | type_flags::REC_NOT_GAP);
    }

    world.ensure_trx(trx);

    let lock = if type_mode.is_predicate() || type_mode.is_prdt_page() {
        debug_assert_eq!(heap_no, HEAP_NO_INFIMUM);
        Lock::new_prdt(
            trx.id(),
            type_mode,
            block.page,
            index,
            prdt.expect("predicate lock needs a rectangle"),
        )
    } else {
        Lock::new_rec(trx.id(), type_mode, block.page, block.n_heap, heap_no, index)
    };
    let r = world.arena.alloc(lock);

    // A priority transaction enqueues ahead of priority waiters that the
    // replication layer orders after it; everyone else appends.
    let mut anchor = None;
    if let Some(c) = c_lock {
        if sys.policy.is_priority(trx) {
            let chain = world.hash(type_mode).chain(&world.arena, block.page);
            if let Some(cpos) = chain.iter().position(|x| *x == c) {
                anchor = chain[cpos + 1..].iter().copied().find(|x| {
                    let holder = &world.trx(world.arena[*x].trx).handle;
                    !(sys.policy.is_priority(holder) && sys.policy.order_before(holder, trx))
                });
            }
        }
    }
    match anchor {
        Some(before) => world.hash_mut(type_mode).insert_before(block.page, r, before),
        None => world.hash_mut(type_mode).insert(block.page, r),
    }

    if type_mode.is_waiting() {
        // A page move may repoint an existing wait from the donated
        // object to the one created here.
        let t = world.trx_mut(trx.id());
        t.wait_lock = Some(r);
        t.handle.set_waiting(true);
    }
    world.trx_mut(trx.id()).locks.push(r);

    LockStats::inc(&sys.stats.rec_locks_created);
    r
}

/// Add a record lock request to the queue, reusing a suitable existing
/// object of the same transaction when allowed. Does NOT check for
/// conflicts or deadlocks.
pub(crate) fn rec_add_to_queue(
    world: &mut LockWorld,
    sys: &LockSys,
    mut type_mode: TypeMode,
    block: Block,
    heap_no: HeapNo,
    index: Index,
    trx: &Arc<Trx>,
) -> LockRef {
    debug_assert!(matches!(
        type_mode.mode(),
        LockMode::Shared | LockMode::Exclusive
    ));

    if heap_no == HEAP_NO_SUPREMUM {
        debug_assert!(!type_mode.is_record_not_gap());
        type_mode = type_mode.without(type_flags::GAP | type_flags::REC_NOT_GAP);
    }

    let chain = world.hash(type_mode).chain(&world.arena, block.page);

    // Bit-setting on an existing object would insert ahead of a waiter.
    let waiter_covers = chain.iter().any(|r| {
        let l = &world.arena[*r];
        l.is_waiting() && l.bit(heap_no)
    });

    if !waiter_covers && !chain.is_empty() && !type_mode.is_waiting() {
        let similar = chain.iter().copied().find(|r| {
            let l = &world.arena[*r];
            l.trx == trx.id() && l.type_mode == type_mode && l.n_bits() > heap_no
        });
        if let Some(r) = similar {
            world.arena[r].set_bit(heap_no);
            return r;
        }
    }

    rec_create(world, sys, type_mode, block, heap_no, index, trx, None, None)
}

/// A granted lock of `trx` on `(page, heap_no)` at least as strong as
/// `precise_mode`, if one exists.
pub(crate) fn rec_has_expl(
    world: &LockWorld,
    precise_mode: TypeMode,
    page: PageId,
    heap_no: HeapNo,
    trx: crate::types::TrxId,
) -> Option<LockRef> {
    debug_assert!(matches!(
        precise_mode.mode(),
        LockMode::Shared | LockMode::Exclusive
    ));
    debug_assert!(!precise_mode.is_insert_intention());

    let on_supremum = heap_no == HEAP_NO_SUPREMUM;
    rec_locks_on(world, page, heap_no).into_iter().find(|r| {
        let l = &world.arena[*r];
        l.trx == trx && compat::covers(l.type_mode, precise_mode, on_supremum)
    })
}

/// First lock of another transaction that forces `(trx, mode)` to wait on
/// `(page, heap_no)`.
pub(crate) fn rec_other_has_conflicting(
    world: &LockWorld,
    sys: &LockSys,
    mode: TypeMode,
    block: Block,
    heap_no: HeapNo,
    trx: &Trx,
) -> Option<LockRef> {
    let on_supremum = heap_no == HEAP_NO_SUPREMUM;
    rec_locks_on(world, block.page, heap_no)
        .into_iter()
        .find(|r| {
            compat::rec_has_to_wait(world, &*sys.policy, trx, mode, &world.arena[*r], on_supremum)
        })
}

/// Enqueue a waiting record lock and run deadlock detection.
pub(crate) fn rec_enqueue_waiting(
    world: &mut LockWorld,
    sys: &LockSys,
    type_mode: TypeMode,
    block: Block,
    heap_no: HeapNo,
    index: Index,
    trx: &Arc<Trx>,
    prdt: Option<Mbr>,
    c_lock: Option<LockRef>,
) -> LockStatus {
    if trx.lock_wait_timeout() == Some(std::time::Duration::ZERO) {
        return LockStatus::WaitTimeout;
    }

    let r = rec_create(
        world,
        sys,
        type_mode.with(type_flags::WAIT),
        block,
        heap_no,
        index,
        trx,
        c_lock,
        prdt,
    );
    LockStats::inc(&sys.stats.rec_lock_waits);

    match deadlock::check_and_resolve(world, sys, r, trx) {
        Some(victim) if victim == trx.id() => {
            // The joining transaction is the victim: withdraw the request
            // but leave the (now empty) object in the queue; release will
            // collect it.
            reset_lock_and_trx_wait(world, r);
            world.arena[r].reset_bit(heap_no);
            LockStatus::Deadlock
        }
        _ => {
            if world.trx(trx.id()).wait_lock.is_none() {
                // Another victim was rolled back and our lock was granted
                // in the process.
                return LockStatus::LockedRec;
            }
            trx.set_victim(false);
            log::debug!(
                "trx {} waits for {:?} on page ({}, {}) heap {heap_no}",
                trx.id(),
                type_mode,
                block.page.space,
                block.page.page_no,
            );
            LockStatus::Wait
        }
    }
}

/// The lock ahead of `wait_r` in its queue that still forces it to wait,
/// if any.
pub(crate) fn rec_has_to_wait_in_queue(
    world: &LockWorld,
    sys: &LockSys,
    wait_r: LockRef,
) -> Option<LockRef> {
    let wait_lock = &world.arena[wait_r];
    debug_assert!(wait_lock.is_waiting());
    let heap_no = wait_lock
        .find_set_bit()
        .expect("waiting record lock with empty bitmap");
    let page = wait_lock.page();

    for r in world.hash(wait_lock.type_mode).chain(&world.arena, page) {
        if r == wait_r {
            return None;
        }
        let l = &world.arena[r];
        if l.bit(heap_no) && compat::has_to_wait(world, &*sys.policy, wait_lock, l) {
            return Some(r);
        }
    }
    debug_assert!(false, "waiting lock not found in its own queue");
    None
}

/// Grant every waiting lock on the page that no longer conflicts with
/// anything ahead of it.
pub(crate) fn grant_waiters_on_page(
    world: &mut LockWorld,
    sys: &LockSys,
    hash_mode: TypeMode,
    page: PageId,
) {
    let chain = world.hash(hash_mode).chain(&world.arena, page);
    for r in chain {
        if !world.arena[r].is_waiting() {
            continue;
        }
        if rec_has_to_wait_in_queue(world, sys, r).is_none() {
            lock_grant(world, sys, r);
        }
    }
}

/// Cancel one waiting record lock and release its owner. Does not grant
/// waiters behind it.
pub(crate) fn rec_cancel(world: &mut LockWorld, _sys: &LockSys, r: LockRef) {
    debug_assert!(!world.arena[r].is_table());
    let heap_no = world.arena[r]
        .find_set_bit()
        .expect("cancelling a lock with no bit set");
    world.arena[r].reset_bit(heap_no);
    reset_lock_and_trx_wait(world, r);
    let handle = world.trx(world.arena[r].trx).handle.clone();
    lock_wait_end(&handle);
}

/// Remove a record lock, waiting or granted, from its queue and grant
/// newly eligible waiters.
pub(crate) fn rec_dequeue_from_page(world: &mut LockWorld, sys: &LockSys, in_r: LockRef) {
    let (page, tm, trx_id) = {
        let lock = &world.arena[in_r];
        debug_assert!(!lock.is_table());
        (lock.page(), lock.type_mode, lock.trx)
    };

    if world.arena[in_r].is_waiting() {
        reset_lock_and_trx_wait(world, in_r);
    }

    world.hash_mut(tm).remove(page, in_r);
    trx_list_remove(world, trx_id, in_r);
    world.arena.free(in_r);
    LockStats::inc(&sys.stats.rec_locks_removed);

    grant_waiters_on_page(world, sys, tm, page);
}

/// Remove a record lock without granting anyone. Used on page discard,
/// where the bitmaps have already been migrated or reset.
pub(crate) fn rec_discard(world: &mut LockWorld, sys: &LockSys, in_r: LockRef) {
    let (page, tm, trx_id) = {
        let lock = &world.arena[in_r];
        debug_assert!(!lock.is_table());
        (lock.page(), lock.type_mode, lock.trx)
    };
    if world.arena[in_r].is_waiting() {
        reset_lock_and_trx_wait(world, in_r);
    }
    world.hash_mut(tm).remove(page, in_r);
    trx_list_remove(world, trx_id, in_r);
    world.arena.free(in_r);
    LockStats::inc(&sys.stats.rec_locks_removed);
}

/// Free every lock object on a discarded page, in all three hash tables.
pub(crate) fn rec_free_all_from_discard_page(world: &mut LockWorld, sys: &LockSys, page: PageId) {
    for tm in [
        TypeMode::new(LockMode::Shared),
        TypeMode::new(LockMode::Shared).with(type_flags::PREDICATE),
        TypeMode::new(LockMode::Shared).with(type_flags::PRDT_PAGE),
    ] {
        let chain = world.hash(tm).chain(&world.arena, page);
        for r in chain {
            rec_discard(world, sys, r);
        }
    }
}

/// Reset the lock bits of one record in one hash table, cancelling
/// waiters on it.
pub(crate) fn rec_reset_and_release_wait_low(
    world: &mut LockWorld,
    sys: &LockSys,
    hash_mode: TypeMode,
    page: PageId,
    heap_no: HeapNo,
) {
    let chain = world.hash(hash_mode).chain(&world.arena, page);
    for r in chain {
        if !world.arena[r].bit(heap_no) {
            continue;
        }
        if world.arena[r].is_waiting() {
            rec_cancel(world, sys, r);
        } else {
            world.arena[r].reset_bit(heap_no);
        }
    }
}

/// Reset the lock bits of one record in the record hash and the predicate
/// anchors of the page, cancelling waiters.
pub(crate) fn rec_reset_and_release_wait(
    world: &mut LockWorld,
    sys: &LockSys,
    page: PageId,
    heap_no: HeapNo,
) {
    rec_reset_and_release_wait_low(world, sys, TypeMode::new(LockMode::Shared), page, heap_no);
    rec_reset_and_release_wait_low(
        world,
        sys,
        TypeMode::new(LockMode::Shared).with(type_flags::PREDICATE),
        page,
        HEAP_NO_INFIMUM,
    );
    rec_reset_and_release_wait_low(
        world,
        sys,
        TypeMode::new(LockMode::Shared).with(type_flags::PRDT_PAGE),
        page,
        HEAP_NO_INFIMUM,
    );
}

/// Remove a lock from its owner's lock list.
pub(crate) fn trx_list_remove(world: &mut LockWorld, trx_id: crate::types::TrxId, r: LockRef) {
    let t = world.trx_mut(trx_id);
    let pos = t
        .locks
        .iter()
        .rposition(|x| *x == r)
        .expect("lock missing from its owner's lock list");
    t.locks.remove(pos);
}

impl LockSys {
    /// Does `trx` hold a granted record lock covering `(page, heap_no)`
    /// at least as strongly as `(mode, gap_mode)`? Diagnostic.
    pub fn trx_holds_rec_lock(
        &self,
        trx: &Trx,
        page: PageId,
        heap_no: HeapNo,
        mode: LockMode,
        gap_mode: super::mode::GapMode,
    ) -> bool {
        let world = self.latch();
        rec_has_expl(
            &world,
            TypeMode::new(mode).with(gap_mode.bits()),
            page,
            heap_no,
            trx.id(),
        )
        .is_some()
    }

    /// Release one granted record lock of `trx` mid-transaction and grant
    /// any waiter that becomes eligible. Logs an error if no matching
    /// granted lock exists.
    pub fn rec_unlock(&self, trx: &Trx, block: Block, heap_no: HeapNo, mode: LockMode) {
        let (mut world, _wg) = self.latch_both();
        let world = &mut *world;
        debug_assert!(!trx.is_waiting());

        let covering = rec_locks_on(world, block.page, heap_no);
        let Some(r) = covering.iter().copied().find(|r| {
            let l = &world.arena[*r];
            l.trx == trx.id() && l.mode() == mode
        }) else {
            log::error!(
                "unlock row: trx {} holds no {mode} lock on page ({}, {}) heap {heap_no}",
                trx.id(),
                block.page.space,
                block.page.page_no,
            );
            return;
        };

        debug_assert!(!world.arena[r].is_waiting());
        world.arena[r].reset_bit(heap_no);

        for w in covering {
            if w == r || !world.arena[w].is_waiting() {
                continue;
            }
            if rec_has_to_wait_in_queue(world, self, w).is_none() {
                lock_grant(world, self, w);
            }
        }
    }

    /// Release all locks of a committing or rolling-back transaction, in
    /// reverse acquisition order, granting queued waiters as coverage
    /// disappears. Both latches are yielded every ~1000 locks so that a
    /// large transaction does not monopolize the lock system.
    pub fn release(&self, trx: &Trx) {
        let mut count = 0usize;
        'relatch: loop {
            let (mut world, _wg) = self.latch_both();
            let world = &mut *world;
            if !world.trxs.contains_key(&trx.id()) {
                return;
            }
            loop {
                let Some(r) = world.trx(trx.id()).locks.last().copied() else {
                    let t = world
                        .trxs
                        .remove(&trx.id())
                        .expect("release lost its transaction entry");
                    debug_assert!(t.wait_lock.is_none());
                    debug_assert!(t.autoinc_locks.iter().all(Option::is_none));
                    debug_assert!(t.table_locks.iter().all(Option::is_none));
                    return;
                };
                if world.arena[r].is_table() {
                    table::table_dequeue(world, self, r);
                } else {
                    rec_dequeue_from_page(world, self, r);
                }
                count += 1;
                if count % 1000 == 0 {
                    // Yield both latches so other operations can progress
                    // while a large transaction commits.
                    continue 'relatch;
                }
            }
        }
    }
}
