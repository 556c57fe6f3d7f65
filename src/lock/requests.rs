//! # Acquisition Façade
//!
//! Entry points the row and b-tree code calls before reading, modifying
//! or inserting records. These wrap the queue machinery with the two
//! higher-level concerns:
//!
//! - **Implicit locks.** A freshly written row carries its writer's
//!   transaction id instead of a lock object. Before anyone can wait on
//!   that row, the implicit lock is converted into an explicit granted
//!   `X | REC_NOT_GAP` lock *on behalf of the writer* - never the caller -
//!   so the caller's wait request has a concrete object ahead of it in
//!   the queue. Clustered index records expose the writer's id directly;
//!   secondary index records need the MVCC probe.
//!
//! - **The intention protocol.** Record `S` locks require table `IS` or
//!   stronger, record `X` locks require table `IX` or stronger. Callers
//!   take the table lock first; debug builds assert it.

use std::sync::Arc;

use super::mode::{type_flags, GapMode, LockMode, TypeMode};
use super::prdt::{prdt_has_to_wait, Mbr};
use super::{queue, table, LockStatus, LockSys, LockWorld};
use crate::trx::{ImplicitLockProbe, Trx};
use crate::types::{Block, HeapNo, Index, TrxId, HEAP_NO_INFIMUM, HEAP_NO_SUPREMUM};

/// Low-level record lock request. Does not look at implicit locks.
fn rec_lock_low(
    world: &mut LockWorld,
    sys: &LockSys,
    implicit: bool,
    mode: TypeMode,
    block: Block,
    heap_no: HeapNo,
    index: Index,
    trx: &Arc<Trx>,
) -> LockStatus {
    debug_assert!(matches!(
        mode.mode(),
        LockMode::Shared | LockMode::Exclusive
    ));
    debug_assert!(!(mode.is_gap() && mode.is_record_not_gap()));
    world.ensure_trx(trx);

    debug_assert!(
        mode.mode() != LockMode::Shared
            || table::table_has(world, trx.id(), index.table, LockMode::IntentionShared),
        "record S lock without a table IS lock",
    );
    debug_assert!(
        mode.mode() != LockMode::Exclusive
            || mode.is_insert_intention()
            || table::table_has(world, trx.id(), index.table, LockMode::IntentionExclusive),
        "record X lock without a table IX lock",
    );

    if table::table_has(world, trx.id(), index.table, mode.mode()) {
        // A strong enough table lock already covers every record.
        return LockStatus::Success;
    }

    let chain = world.rec_hash.chain(&world.arena, block.page);
    if chain.is_empty() {
        // No lock on the whole page: take the fast path.
        if !implicit {
            queue::rec_create(world, sys, mode, block, heap_no, index, trx, None, None);
        }
        return LockStatus::LockedRec;
    }

    // Single-object fast path: the page's only lock is ours with the
    // exact same type_mode and a wide enough bitmap.
    if chain.len() == 1 {
        let only = chain[0];
        let l = &world.arena[only];
        if l.trx == trx.id() && l.type_mode == mode && l.n_bits() > heap_no {
            if !implicit && !l.bit(heap_no) {
                world.arena[only].set_bit(heap_no);
                return LockStatus::LockedRec;
            }
            return LockStatus::Success;
        }
    }

    if queue::rec_has_expl(world, mode, block.page, heap_no, trx.id()).is_some() {
        // Already covered at equal or stronger mode.
        return LockStatus::Success;
    }

    match queue::rec_other_has_conflicting(world, sys, mode, block, heap_no, trx) {
        Some(c) => {
            queue::rec_enqueue_waiting(world, sys, mode, block, heap_no, index, trx, None, Some(c))
        }
        None => {
            if !implicit {
                queue::rec_add_to_queue(world, sys, mode, block, heap_no, index, trx);
                LockStatus::LockedRec
            } else {
                LockStatus::Success
            }
        }
    }
}

/// Synthesize a granted `X | REC_NOT_GAP` lock for the holder of an
/// implicit lock, unless it already has one.
fn convert_impl_to_expl_for_trx(
    world: &mut LockWorld,
    sys: &LockSys,
    block: Block,
    heap_no: HeapNo,
    index: Index,
    holder: &Arc<Trx>,
) {
    world.ensure_trx(holder);
    let precise = TypeMode::new(LockMode::Exclusive).with(type_flags::REC_NOT_GAP);
    if queue::rec_has_expl(world, precise, block.page, heap_no, holder.id()).is_none() {
        queue::rec_add_to_queue(world, sys, precise, block, heap_no, index, holder);
    }
}

impl LockSys {
    /// Lock a record in the given mode; enqueue a waiting request on
    /// conflict. With `implicit`, no lock object is installed when none
    /// is needed (the caller relies on the row's stored transaction id).
    pub fn lock_rec(
        &self,
        implicit: bool,
        mode: LockMode,
        gap_mode: GapMode,
        block: Block,
        heap_no: HeapNo,
        index: Index,
        trx: &Arc<Trx>,
    ) -> LockStatus {
        let (mut world, _wg) = self.latch_both();
        rec_lock_low(
            &mut world,
            self,
            implicit,
            TypeMode::new(mode).with(gap_mode.bits()),
            block,
            heap_no,
            index,
            trx,
        )
    }

    /// Read check on a clustered index record. `rec_trx_id` is the
    /// transaction id stored in the record (0 if the row is known to
    /// carry no implicit lock).
    pub fn clust_rec_read_check_and_lock(
        &self,
        block: Block,
        heap_no: HeapNo,
        rec_trx_id: TrxId,
        index: Index,
        mode: LockMode,
        gap_mode: GapMode,
        trx: &Arc<Trx>,
    ) -> LockStatus {
        debug_assert!(index.clustered);
        debug_assert!(matches!(mode, LockMode::Shared | LockMode::Exclusive));

        if heap_no != HEAP_NO_SUPREMUM
            && self.convert_impl_to_expl_clust(block, heap_no, rec_trx_id, index, trx)
        {
            // The caller itself holds the implicit exclusive lock.
            return LockStatus::Success;
        }

        let (mut world, _wg) = self.latch_both();
        rec_lock_low(
            &mut world,
            self,
            false,
            TypeMode::new(mode).with(gap_mode.bits()),
            block,
            heap_no,
            index,
            trx,
        )
    }

    /// Read check on a secondary index record. Implicit-lock detection
    /// goes through the clustered index via the MVCC probe, gated by the
    /// page's max trx id.
    #[allow(clippy::too_many_arguments)]
    pub fn sec_rec_read_check_and_lock(
        &self,
        block: Block,
        heap_no: HeapNo,
        page_max_trx_id: TrxId,
        probe: &dyn ImplicitLockProbe,
        index: Index,
        mode: LockMode,
        gap_mode: GapMode,
        trx: &Arc<Trx>,
    ) -> LockStatus {
        debug_assert!(!index.clustered);

        if heap_no != HEAP_NO_SUPREMUM
            && page_max_trx_id >= self.registry.get_min_trx_id()
            && self.convert_impl_to_expl_sec(block, heap_no, probe, index, trx)
        {
            return LockStatus::Success;
        }

        let (mut world, _wg) = self.latch_both();
        rec_lock_low(
            &mut world,
            self,
            false,
            TypeMode::new(mode).with(gap_mode.bits()),
            block,
            heap_no,
            index,
            trx,
        )
    }

    /// Modify check on a clustered index record: always `X | REC_NOT_GAP`.
    pub fn clust_rec_modify_check_and_lock(
        &self,
        block: Block,
        heap_no: HeapNo,
        rec_trx_id: TrxId,
        index: Index,
        trx: &Arc<Trx>,
    ) -> LockStatus {
        debug_assert!(index.clustered);

        if self.convert_impl_to_expl_clust(block, heap_no, rec_trx_id, index, trx) {
            return LockStatus::Success;
        }

        let (mut world, _wg) = self.latch_both();
        let status = rec_lock_low(
            &mut world,
            self,
            true,
            TypeMode::new(LockMode::Exclusive).with(type_flags::REC_NOT_GAP),
            block,
            heap_no,
            index,
            trx,
        );
        if status == LockStatus::LockedRec {
            LockStatus::Success
        } else {
            status
        }
    }

    /// Modify check on a secondary index record. No implicit-lock probe:
    /// the clustered record was modified first, so no other active
    /// transaction can hold an implicit lock here.
    pub fn sec_rec_modify_check_and_lock(
        &self,
        block: Block,
        heap_no: HeapNo,
        index: Index,
        trx: &Arc<Trx>,
    ) -> LockStatus {
        debug_assert!(!index.clustered);
        let (mut world, _wg) = self.latch_both();
        let status = rec_lock_low(
            &mut world,
            self,
            true,
            TypeMode::new(LockMode::Exclusive).with(type_flags::REC_NOT_GAP),
            block,
            heap_no,
            index,
            trx,
        );
        if status == LockStatus::LockedRec {
            LockStatus::Success
        } else {
            status
        }
    }

    /// Insert check: the inserting transaction needs the gap before the
    /// successor record to be free of conflicting gap coverage.
    /// `inherit` reports whether the inserted record should inherit gap
    /// locks from the successor afterwards.
    pub fn rec_insert_check_and_lock(
        &self,
        block: Block,
        next_heap_no: HeapNo,
        index: Index,
        trx: &Arc<Trx>,
        inherit: &mut bool,
    ) -> LockStatus {
        let (mut world, _wg) = self.latch_both();
        let world = &mut *world;
        world.ensure_trx(trx);
        debug_assert!(
            table::table_has(world, trx.id(), index.table, LockMode::IntentionExclusive),
            "insert without a table IX lock",
        );

        if queue::rec_locks_on(world, block.page, next_heap_no).is_empty() {
            // Nothing covers the successor: the common case.
            *inherit = false;
            return LockStatus::Success;
        }

        if index.spatial {
            // Spatial indexes protect ranges with predicate locks, not
            // gap locks.
            return LockStatus::Success;
        }

        *inherit = true;

        let tm = TypeMode::new(LockMode::Exclusive)
            .with(type_flags::GAP | type_flags::INSERT_INTENTION);
        match queue::rec_other_has_conflicting(world, self, tm, block, next_heap_no, trx) {
            Some(c) => {
                let status = queue::rec_enqueue_waiting(
                    world,
                    self,
                    tm,
                    block,
                    next_heap_no,
                    index,
                    trx,
                    None,
                    Some(c),
                );
                if status == LockStatus::LockedRec {
                    LockStatus::Success
                } else {
                    status
                }
            }
            None => LockStatus::Success,
        }
    }

    /// Predicate lock on a spatial index page.
    pub fn prdt_lock(
        &self,
        block: Block,
        index: Index,
        mode: LockMode,
        mbr: Mbr,
        trx: &Arc<Trx>,
    ) -> LockStatus {
        debug_assert!(index.spatial);
        debug_assert!(matches!(mode, LockMode::Shared | LockMode::Exclusive));
        let (mut world, _wg) = self.latch_both();
        let world = &mut *world;
        world.ensure_trx(trx);

        let tm = TypeMode::new(mode).with(type_flags::PREDICATE);
        let chain = world.prdt_hash.chain(&world.arena, block.page);
        if chain.is_empty() {
            queue::rec_create(
                world,
                self,
                tm,
                block,
                HEAP_NO_INFIMUM,
                index,
                trx,
                None,
                Some(mbr),
            );
            return LockStatus::LockedRec;
        }

        let own = chain.iter().any(|r| {
            let l = &world.arena[*r];
            l.trx == trx.id()
                && !l.is_waiting()
                && l.mode().stronger_or_eq(mode)
                && l.prdt() == Some(&mbr)
        });
        if own {
            return LockStatus::Success;
        }

        let conflict = chain
            .iter()
            .copied()
            .find(|r| prdt_has_to_wait(trx, tm, &mbr, &world.arena[*r]));
        match conflict {
            Some(c) => queue::rec_enqueue_waiting(
                world,
                self,
                tm,
                block,
                HEAP_NO_INFIMUM,
                index,
                trx,
                Some(mbr),
                Some(c),
            ),
            None => {
                queue::rec_create(
                    world,
                    self,
                    tm,
                    block,
                    HEAP_NO_INFIMUM,
                    index,
                    trx,
                    None,
                    Some(mbr),
                );
                LockStatus::LockedRec
            }
        }
    }

    /// Clustered-index implicit-to-explicit conversion. Returns whether
    /// the *caller* holds the implicit lock (in which case no explicit
    /// lock is needed at all).
    fn convert_impl_to_expl_clust(
        &self,
        block: Block,
        heap_no: HeapNo,
        rec_trx_id: TrxId,
        index: Index,
        trx: &Trx,
    ) -> bool {
        if rec_trx_id == 0 {
            return false;
        }
        if rec_trx_id == trx.id() {
            return true;
        }
        if rec_trx_id >= self.registry.get_max_trx_id() {
            // A trx id from the future: the page is corrupted. Avoid
            // inventing a lock for it.
            log::error!(
                "transaction id {rec_trx_id} on page ({}, {}) is in the future",
                block.page.space,
                block.page.page_no,
            );
            return false;
        }
        if let Some(holder) = self.registry.find(rec_trx_id) {
            let (mut world, _wg) = self.latch_both();
            convert_impl_to_expl_for_trx(&mut world, self, block, heap_no, index, &holder);
        }
        false
    }

    /// Secondary-index implicit-to-explicit conversion via the MVCC
    /// probe. The probe runs without any lock-system latch.
    fn convert_impl_to_expl_sec(
        &self,
        block: Block,
        heap_no: HeapNo,
        probe: &dyn ImplicitLockProbe,
        index: Index,
        trx: &Trx,
    ) -> bool {
        let Some(locker) = probe.implicit_x_locker(trx, block.page, heap_no) else {
            return false;
        };
        if locker == trx.id() {
            return true;
        }
        if let Some(holder) = self.registry.find(locker) {
            let (mut world, _wg) = self.latch_both();
            convert_impl_to_expl_for_trx(&mut world, self, block, heap_no, index, &holder);
        }
        false
    }
}
