//! # Page Events
//!
//! The b-tree layer moves records between pages (split, merge, reorganize,
//! discard) and creates or deletes them in place. Each such event calls a
//! hook here so that lock coverage follows the records.
//!
//! The one invariant every hook preserves: for each transaction that held
//! coverage on a donor record, equivalent record and/or gap coverage
//! exists afterwards on the heir record or destination page - except
//! coverage the event explicitly releases (supremum resets on merge, the
//! read-committed inheritance exception).
//!
//! The caller supplies heap-number geometry (successor records, old/new
//! pairs for moved record ranges) because only the page layer can read
//! it; the lock system never touches page frames.
//!
//! ## Gap inheritance
//!
//! Deleting a record merges its gap into the predecessor gap of its
//! successor. Every lock held on the deleted record - including waiting
//! requests - is re-created as a *granted* gap lock on the successor, so
//! phantom protection survives the delete. Insert-intention locks are
//! never inherited: they are one-shot declarations, not protection. At
//! READ COMMITTED and below, locks taken by plain row modifications are
//! not inherited either (no phantom protection is promised there), but
//! locks taken for duplicate-key checking still are.

use smallvec::SmallVec;

use super::mode::{type_flags, LockMode, TypeMode};
use super::object::Lock;
use super::queue::{
    rec_add_to_queue, rec_free_all_from_discard_page, rec_locks_on, rec_reset_and_release_wait,
    rec_reset_and_release_wait_low,
};
use super::table::table_has;
use super::{LockSys, LockWorld};
use crate::trx::IsolationLevel;
use crate::types::{Block, HeapNo, PageId, HEAP_NO_INFIMUM, HEAP_NO_SUPREMUM};

/// One record's move during a spatial reshuffle.
#[derive(Debug, Clone, Copy)]
pub struct RecMove {
    pub old_heap_no: HeapNo,
    pub new_heap_no: HeapNo,
    /// Set by the lock system when any lock followed this record.
    pub moved: bool,
}

impl RecMove {
    pub fn new(old_heap_no: HeapNo, new_heap_no: HeapNo) -> Self {
        Self {
            old_heap_no,
            new_heap_no,
            moved: false,
        }
    }
}

const REC_HASH: TypeMode = TypeMode(LockMode::Shared as u32);

/// Make the heir record inherit the locks on the donor record as granted
/// gap locks. Does not reset the donor's bits.
fn rec_inherit_to_gap(
    world: &mut LockWorld,
    sys: &LockSys,
    heir_block: Block,
    donor_page: PageId,
    heir_heap_no: HeapNo,
    heap_no: HeapNo,
) {
    for r in rec_locks_on(world, donor_page, heap_no) {
        let (type_mode, index, trx_id) = {
            let l = &world.arena[r];
            (l.type_mode, l.index(), l.trx)
        };
        if type_mode.is_insert_intention() {
            continue;
        }
        let holder = world.trx(trx_id).handle.clone();
        // At READ COMMITTED and below, locks taken by UPDATE/DELETE are
        // not inherited; duplicate-check locks (S, or X in duplicate
        // mode) still are.
        let modification_mode = if holder.duplicates() {
            LockMode::Shared
        } else {
            LockMode::Exclusive
        };
        if holder.isolation() <= IsolationLevel::ReadCommitted
            && type_mode.mode() == modification_mode
        {
            continue;
        }
        rec_add_to_queue(
            world,
            sys,
            TypeMode::new(type_mode.mode()).with(type_flags::GAP),
            heir_block,
            heir_heap_no,
            index,
            &holder,
        );
    }
}

/// Like [`rec_inherit_to_gap`], but for the insert path: only gap
/// coverage is inherited, and holders of a table X lock are skipped
/// (their coverage is already total).
fn rec_inherit_to_gap_if_gap_lock(
    world: &mut LockWorld,
    sys: &LockSys,
    block: Block,
    heir_heap_no: HeapNo,
    heap_no: HeapNo,
) {
    for r in rec_locks_on(world, block.page, heap_no) {
        let (type_mode, index, trx_id) = {
            let l = &world.arena[r];
            (l.type_mode, l.index(), l.trx)
        };
        if type_mode.is_insert_intention() {
            continue;
        }
        if heap_no != HEAP_NO_SUPREMUM && type_mode.is_record_not_gap() {
            continue;
        }
        if table_has(world, trx_id, index.table, LockMode::Exclusive) {
            continue;
        }
        let holder = world.trx(trx_id).handle.clone();
        rec_add_to_queue(
            world,
            sys,
            TypeMode::new(type_mode.mode()).with(type_flags::GAP),
            block,
            heir_heap_no,
            index,
            &holder,
        );
    }
}

/// Move the locks covering one record to another record, resetting the
/// donor's bits. A donated waiting lock moves with its wait status: the
/// old object's `WAIT` is cleared and the re-enqueued object takes over
/// the owner's wait pointer.
fn rec_move_low(
    world: &mut LockWorld,
    sys: &LockSys,
    hash_mode: TypeMode,
    receiver: Block,
    donor_page: PageId,
    receiver_heap_no: HeapNo,
    donor_heap_no: HeapNo,
) {
    let donors: SmallVec<[_; 8]> = world
        .hash(hash_mode)
        .chain(&world.arena, donor_page)
        .into_iter()
        .filter(|r| world.arena[*r].bit(donor_heap_no))
        .collect();

    for r in donors {
        let (type_mode, index, trx_id) = {
            let l = &mut world.arena[r];
            l.reset_bit(donor_heap_no);
            let tm = l.type_mode;
            if tm.is_waiting() {
                l.type_mode = tm.without(type_flags::WAIT);
            }
            (tm, l.index(), l.trx)
        };
        // Bit first, lock second: this also works when donor == receiver.
        let holder = world.trx(trx_id).handle.clone();
        rec_add_to_queue(
            world,
            sys,
            type_mode,
            receiver,
            receiver_heap_no,
            index,
            &holder,
        );
    }
}

fn rec_move(
    world: &mut LockWorld,
    sys: &LockSys,
    receiver: Block,
    donor_page: PageId,
    receiver_heap_no: HeapNo,
    donor_heap_no: HeapNo,
) {
    debug_assert!(
        rec_locks_on(world, receiver.page, receiver_heap_no).is_empty()
            || (receiver.page == donor_page && receiver_heap_no == donor_heap_no),
    );
    rec_move_low(
        world,
        sys,
        REC_HASH,
        receiver,
        donor_page,
        receiver_heap_no,
        donor_heap_no,
    );
}

impl LockSys {
    /// A record was inserted: it inherits the gap coverage of its
    /// successor, gap-only.
    pub fn update_insert(&self, block: Block, heap_no: HeapNo, next_heap_no: HeapNo) {
        let (mut world, _wg) = self.latch_both();
        rec_inherit_to_gap_if_gap_lock(&mut world, self, block, heap_no, next_heap_no);
    }

    /// A record is being deleted: its successor inherits its locks as
    /// gap locks, then the deleted record's bits are reset and waiters on
    /// it released.
    pub fn update_delete(&self, block: Block, heap_no: HeapNo, next_heap_no: HeapNo) {
        let (mut world, _wg) = self.latch_both();
        let world = &mut *world;
        rec_inherit_to_gap(world, self, block, block.page, next_heap_no, heap_no);
        rec_reset_and_release_wait(world, self, block.page, heap_no);
    }

    /// Page split to the right: supremum locks of the left page move to
    /// the right page's supremum, and the left supremum inherits gap
    /// coverage from the first record of the right page.
    pub fn update_split_right(&self, right: Block, left: Block, right_first_heap_no: HeapNo) {
        let (mut world, _wg) = self.latch_both();
        let world = &mut *world;
        rec_move(
            world,
            self,
            right,
            left.page,
            HEAP_NO_SUPREMUM,
            HEAP_NO_SUPREMUM,
        );
        rec_inherit_to_gap(
            world,
            self,
            left,
            right.page,
            HEAP_NO_SUPREMUM,
            right_first_heap_no,
        );
    }

    /// Page split to the left: the left page's supremum inherits gap
    /// coverage from the first record of the right page.
    pub fn update_split_left(&self, right: Block, left: Block, right_first_heap_no: HeapNo) {
        let (mut world, _wg) = self.latch_both();
        rec_inherit_to_gap(
            &mut world,
            self,
            left,
            right.page,
            HEAP_NO_SUPREMUM,
            right_first_heap_no,
        );
    }

    /// Merge into the right page: the original successor of the right
    /// page's infimum inherits the left supremum's locks, the left
    /// supremum is reset, and the discarded left page is emptied.
    pub fn update_merge_right(&self, right: Block, orig_succ_heap_no: HeapNo, left: Block) {
        let (mut world, _wg) = self.latch_both();
        let world = &mut *world;
        rec_inherit_to_gap(
            world,
            self,
            right,
            left.page,
            orig_succ_heap_no,
            HEAP_NO_SUPREMUM,
        );
        rec_reset_and_release_wait_low(world, self, REC_HASH, left.page, HEAP_NO_SUPREMUM);
        debug_assert!(!world.prdt_page_hash.any_on_page(&world.arena, left.page));
        rec_free_all_from_discard_page(world, self, left.page);
    }

    /// Merge into the left page. `first_moved_heap_no` is the heap number
    /// (on the left page) of the first record moved over from the right
    /// page, or `None` when nothing was moved.
    pub fn update_merge_left(
        &self,
        left: Block,
        first_moved_heap_no: Option<HeapNo>,
        right: Block,
    ) {
        let (mut world, _wg) = self.latch_both();
        let world = &mut *world;
        if let Some(heap_no) = first_moved_heap_no {
            // The moved records' predecessor gap was the left supremum.
            rec_inherit_to_gap(world, self, left, left.page, heap_no, HEAP_NO_SUPREMUM);
            rec_reset_and_release_wait_low(world, self, REC_HASH, left.page, HEAP_NO_SUPREMUM);
        }
        rec_move(
            world,
            self,
            left,
            right.page,
            HEAP_NO_SUPREMUM,
            HEAP_NO_SUPREMUM,
        );
        debug_assert!(!world.prdt_page_hash.any_on_page(&world.arena, right.page));
        rec_free_all_from_discard_page(world, self, right.page);
    }

    /// Combined split and merge: used when a page is split and the parts
    /// are merged with neighbors in one b-tree operation.
    pub fn update_split_and_merge(
        &self,
        left: Block,
        first_moved_heap_no: HeapNo,
        right: Block,
        right_first_heap_no: HeapNo,
    ) {
        let (mut world, _wg) = self.latch_both();
        let world = &mut *world;
        rec_inherit_to_gap(
            world,
            self,
            left,
            left.page,
            first_moved_heap_no,
            HEAP_NO_SUPREMUM,
        );
        rec_reset_and_release_wait(world, self, left.page, HEAP_NO_SUPREMUM);
        rec_inherit_to_gap(
            world,
            self,
            left,
            right.page,
            HEAP_NO_SUPREMUM,
            right_first_heap_no,
        );
    }

    /// The root page was copied into a new child during a root raise;
    /// its supremum locks follow.
    pub fn update_root_raise(&self, block: Block, root: PageId) {
        let (mut world, _wg) = self.latch_both();
        rec_move(
            &mut world,
            self,
            block,
            root,
            HEAP_NO_SUPREMUM,
            HEAP_NO_SUPREMUM,
        );
    }

    /// A page was copied whole to a new page and discarded: supremum
    /// locks move, everything else on the old page is freed.
    pub fn update_copy_and_discard(&self, new_block: Block, page: PageId) {
        let (mut world, _wg) = self.latch_both();
        let world = &mut *world;
        rec_move(
            world,
            self,
            new_block,
            page,
            HEAP_NO_SUPREMUM,
            HEAP_NO_SUPREMUM,
        );
        rec_free_all_from_discard_page(world, self, page);
    }

    /// A page is being discarded: every record's locks are inherited by
    /// the heir record as gap locks, then released. `heap_nos` lists the
    /// page's records (pseudo-records included) in any order.
    pub fn update_discard(
        &self,
        heir_block: Block,
        heir_heap_no: HeapNo,
        page: PageId,
        heap_nos: &[HeapNo],
    ) {
        let (mut world, _wg) = self.latch_both();
        let world = &mut *world;
        if world.rec_hash.any_on_page(&world.arena, page) {
            for &heap_no in heap_nos {
                rec_inherit_to_gap(world, self, heir_block, page, heir_heap_no, heap_no);
                rec_reset_and_release_wait_low(world, self, REC_HASH, page, heap_no);
            }
        }
        rec_free_all_from_discard_page(world, self, page);
    }

    /// Reset the heir record's locks and replace them with gap locks
    /// inherited from the donor record.
    pub fn rec_reset_and_inherit_gap_locks(
        &self,
        heir_block: Block,
        donor_page: PageId,
        heir_heap_no: HeapNo,
        heap_no: HeapNo,
    ) {
        let (mut world, _wg) = self.latch_both();
        let world = &mut *world;
        rec_reset_and_release_wait(world, self, heir_block.page, heir_heap_no);
        rec_inherit_to_gap(world, self, heir_block, donor_page, heir_heap_no, heap_no);
    }

    /// Stash one record's locks on the page infimum while the record is
    /// moved by a size-changing update.
    pub fn rec_store_on_page_infimum(&self, block: Block, heap_no: HeapNo) {
        let (mut world, _wg) = self.latch_both();
        rec_move(
            &mut world,
            self,
            block,
            block.page,
            HEAP_NO_INFIMUM,
            heap_no,
        );
    }

    /// Restore locks stashed on `donor_page`'s infimum onto the record's
    /// new position.
    pub fn rec_restore_from_page_infimum(
        &self,
        block: Block,
        heap_no: HeapNo,
        donor_page: PageId,
    ) {
        let (mut world, _wg) = self.latch_both();
        rec_move(
            &mut world,
            self,
            block,
            donor_page,
            heap_no,
            HEAP_NO_INFIMUM,
        );
    }

    /// A range of records moved to another page (list end or start).
    /// `moves` pairs each moved record's old heap number with its new one.
    pub fn move_rec_list_end(&self, new_block: Block, block: Block, moves: &[(HeapNo, HeapNo)]) {
        self.move_rec_list(new_block, block, moves);
    }

    /// Same as [`LockSys::move_rec_list_end`] for a range moved from the
    /// start of the page; the split is the caller's business, the lock
    /// motion is identical.
    pub fn move_rec_list_start(&self, new_block: Block, block: Block, moves: &[(HeapNo, HeapNo)]) {
        self.move_rec_list(new_block, block, moves);
    }

    fn move_rec_list(&self, new_block: Block, block: Block, moves: &[(HeapNo, HeapNo)]) {
        let (mut world, _wg) = self.latch_both();
        let world = &mut *world;
        let chain = world.rec_hash.chain(&world.arena, block.page);
        for r in chain {
            let type_mode = world.arena[r].type_mode;
            for &(old_heap_no, new_heap_no) in moves {
                let donated = {
                    let l = &mut world.arena[r];
                    l.reset_bit(old_heap_no)
                };
                if !donated {
                    continue;
                }
                if world.arena[r].is_waiting() {
                    let l = &mut world.arena[r];
                    l.type_mode = l.type_mode.without(type_flags::WAIT);
                }
                let (index, trx_id) = {
                    let l = &world.arena[r];
                    (l.index(), l.trx)
                };
                let holder = world.trx(trx_id).handle.clone();
                rec_add_to_queue(
                    world,
                    self,
                    type_mode,
                    new_block,
                    new_heap_no,
                    index,
                    &holder,
                );
            }
        }
    }

    /// Spatial variant of the record-list move: marks each entry whose
    /// record actually carried locks.
    pub fn rtr_move_rec_list(&self, new_block: Block, block: Block, moves: &mut [RecMove]) {
        if moves.is_empty() {
            return;
        }
        let (mut world, _wg) = self.latch_both();
        let world = &mut *world;
        let chain = world.rec_hash.chain(&world.arena, block.page);
        for r in chain {
            let type_mode = world.arena[r].type_mode;
            for m in moves.iter_mut() {
                let donated = {
                    let l = &mut world.arena[r];
                    l.reset_bit(m.old_heap_no)
                };
                if !donated {
                    continue;
                }
                if world.arena[r].is_waiting() {
                    let l = &mut world.arena[r];
                    l.type_mode = l.type_mode.without(type_flags::WAIT);
                }
                let (index, trx_id) = {
                    let l = &world.arena[r];
                    (l.index(), l.trx)
                };
                let holder = world.trx(trx_id).handle.clone();
                rec_add_to_queue(
                    world,
                    self,
                    type_mode,
                    new_block,
                    m.new_heap_no,
                    index,
                    &holder,
                );
                m.moved = true;
            }
        }
    }

    /// A page was reorganized in place: heap numbers changed but records
    /// did not. `pairs` maps each record's old heap number to its new
    /// one, pseudo-records included.
    pub fn move_reorganize_page(&self, block: Block, pairs: &[(HeapNo, HeapNo)]) {
        let (mut world, _wg) = self.latch_both();
        let world = &mut *world;
        let chain = world.rec_hash.chain(&world.arena, block.page);
        if chain.is_empty() {
            return;
        }

        // Snapshot every lock on the page, then blank the originals. The
        // originals stay in the chain as reusable empty objects; waiting
        // wait pointers are repointed by the re-enqueue below.
        let mut old_locks: Vec<Lock> = Vec::with_capacity(chain.len());
        for r in chain {
            let copy = world.arena[r].clone();
            old_locks.push(copy);
            let l = &mut world.arena[r];
            l.bitmap_reset();
            if l.is_waiting() {
                l.type_mode = l.type_mode.without(type_flags::WAIT);
            }
        }

        // Granted before waiting, so object reuse keeps queue order.
        old_locks.sort_by_key(Lock::is_waiting);

        for mut old in old_locks {
            let holder = world.trx(old.trx).handle.clone();
            for &(old_heap_no, new_heap_no) in pairs {
                if !old.reset_bit(old_heap_no) {
                    continue;
                }
                rec_add_to_queue(
                    world,
                    self,
                    old.type_mode,
                    block,
                    new_heap_no,
                    old.index(),
                    &holder,
                );
            }
            debug_assert_eq!(old.find_set_bit(), None, "heap pair list missed a record");
        }
    }
}
