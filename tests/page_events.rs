//! # Page Event Scenarios
//!
//! Lock coverage must follow records through inserts, deletes, page
//! splits and merges, in-place reorganization, the infimum stash used by
//! size-changing updates, and page discard. The common yardstick: a
//! transaction's effective coverage of a row (record and/or gap) is the
//! same before and after the event, waiting flags aside.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rowlock::{
    Block, GapMode, Index, IsolationLevel, LockMode, LockStatus, LockSys, PageId, Trx, TrxRegistry,
};

struct Harness {
    registry: Arc<TrxRegistry>,
    locks: Arc<LockSys>,
}

impl Harness {
    fn new() -> Self {
        let registry = Arc::new(TrxRegistry::new());
        let locks = Arc::new(LockSys::new(128, Arc::clone(&registry)).unwrap());
        Self { registry, locks }
    }

    fn begin(&self, iso: IsolationLevel, index: Index) -> Arc<Trx> {
        let trx = self.registry.begin(iso);
        assert_eq!(
            self.locks
                .lock_table(index.table, LockMode::IntentionShared, &trx),
            LockStatus::Success
        );
        assert_eq!(
            self.locks
                .lock_table(index.table, LockMode::IntentionExclusive, &trx),
            LockStatus::Success
        );
        trx
    }
}

fn index() -> Index {
    Index::clustered(1, 1)
}

const SUP: u32 = 1;

#[test]
fn split_right_moves_record_locks_and_covers_both_supremums() {
    let h = Harness::new();
    let index = index();
    // Page P holds heaps {inf=0, sup=1, 2, 3, 4}; the split moves heaps
    // 3 and 4 to P' where they become heaps 2 and 3.
    let p = Block::new(PageId::new(0, 10), 5);
    let p_new = Block::new(PageId::new(0, 11), 4);

    let t1 = h.begin(IsolationLevel::RepeatableRead, index);
    assert_eq!(
        h.locks
            .lock_rec(false, LockMode::Exclusive, GapMode::RecNotGap, p, 3, index, &t1),
        LockStatus::LockedRec
    );
    assert_eq!(
        h.locks
            .lock_rec(false, LockMode::Shared, GapMode::Gap, p, SUP, index, &t1),
        LockStatus::LockedRec
    );

    h.locks.move_rec_list_end(p_new, p, &[(3, 2), (4, 3)]);
    h.locks.update_split_right(p_new, p, 2);
    h.locks.validate();

    // The X record lock followed its record to (P', 2).
    assert!(h
        .locks
        .trx_holds_rec_lock(&t1, p_new.page, 2, LockMode::Exclusive, GapMode::RecNotGap));
    assert!(!h
        .locks
        .trx_holds_rec_lock(&t1, p.page, 3, LockMode::Exclusive, GapMode::RecNotGap));

    // Gap coverage survives on both supremums.
    assert!(h
        .locks
        .trx_holds_rec_lock(&t1, p_new.page, SUP, LockMode::Shared, GapMode::Gap));
    assert!(h
        .locks
        .trx_holds_rec_lock(&t1, p.page, SUP, LockMode::Shared, GapMode::Gap));

    // Another transaction inserting into P's tail gap must still wait.
    let t2 = h.begin(IsolationLevel::RepeatableRead, index);
    let mut inherit = false;
    assert_eq!(
        h.locks
            .rec_insert_check_and_lock(p, SUP, index, &t2, &mut inherit),
        LockStatus::Wait
    );

    h.locks.release(&t2);
    h.locks.release(&t1);
    assert_eq!(h.locks.n_locks(), 0);
}

#[test]
fn insert_then_delete_round_trip_preserves_gap_coverage() {
    let h = Harness::new();
    let index = index();
    let b = Block::new(PageId::new(0, 20), 8);

    // t1 holds a next-key lock on heap 3: record 3 plus the gap below it.
    let t1 = h.begin(IsolationLevel::RepeatableRead, index);
    assert_eq!(
        h.locks
            .lock_rec(false, LockMode::Shared, GapMode::Ordinary, b, 3, index, &t1),
        LockStatus::LockedRec
    );

    let gap_blocked = |h: &Harness| {
        let t = h.begin(IsolationLevel::RepeatableRead, index);
        let mut inherit = false;
        let status = h.locks.rec_insert_check_and_lock(b, 3, index, &t, &mut inherit);
        if status == LockStatus::Wait {
            h.locks.cancel_waiting_and_release(&t);
        }
        h.locks.release(&t);
        status == LockStatus::Wait
    };
    assert!(gap_blocked(&h));

    // A row appears at heap 5 (between the gap bounds), then vanishes.
    h.locks.update_insert(b, 5, 3);
    assert!(h
        .locks
        .trx_holds_rec_lock(&t1, b.page, 5, LockMode::Shared, GapMode::Gap));
    h.locks.update_delete(b, 5, 3);
    h.locks.validate();

    // The gap below heap 3 is covered exactly as before.
    assert!(gap_blocked(&h));
    assert!(!h
        .locks
        .trx_holds_rec_lock(&t1, b.page, 5, LockMode::Shared, GapMode::Gap));

    h.locks.release(&t1);
}

#[test]
fn read_committed_update_locks_are_not_inherited() {
    let h = Harness::new();
    let index = index();
    let b = Block::new(PageId::new(0, 21), 8);

    // An UPDATE-style X lock at READ COMMITTED.
    let t1 = h.begin(IsolationLevel::ReadCommitted, index);
    assert_eq!(
        h.locks
            .lock_rec(false, LockMode::Exclusive, GapMode::RecNotGap, b, 4, index, &t1),
        LockStatus::LockedRec
    );

    // Deleting the row: at READ COMMITTED the X lock is not inherited as
    // a gap lock on the successor.
    h.locks.update_delete(b, 4, 5);
    assert!(!h
        .locks
        .trx_holds_rec_lock(&t1, b.page, 5, LockMode::Exclusive, GapMode::Gap));

    // The same dance at REPEATABLE READ does inherit.
    let t2 = h.begin(IsolationLevel::RepeatableRead, index);
    assert_eq!(
        h.locks
            .lock_rec(false, LockMode::Exclusive, GapMode::RecNotGap, b, 6, index, &t2),
        LockStatus::LockedRec
    );
    h.locks.update_delete(b, 6, 7);
    assert!(h
        .locks
        .trx_holds_rec_lock(&t2, b.page, 7, LockMode::Exclusive, GapMode::Gap));

    h.locks.release(&t1);
    h.locks.release(&t2);
}

#[test]
fn delete_wakes_waiters_on_the_deleted_row() {
    let h = Harness::new();
    let index = index();
    let b = Block::new(PageId::new(0, 22), 8);

    let t1 = h.begin(IsolationLevel::RepeatableRead, index);
    let t2 = h.begin(IsolationLevel::RepeatableRead, index);

    assert_eq!(
        h.locks
            .lock_rec(false, LockMode::Exclusive, GapMode::RecNotGap, b, 3, index, &t1),
        LockStatus::LockedRec
    );
    assert_eq!(
        h.locks
            .lock_rec(false, LockMode::Shared, GapMode::RecNotGap, b, 3, index, &t2),
        LockStatus::Wait
    );

    let locks = Arc::clone(&h.locks);
    let t2c = Arc::clone(&t2);
    let waiter = thread::spawn(move || locks.wait_for(&t2c));
    thread::sleep(Duration::from_millis(20));

    // t1 deletes the row it had locked; the waiter is released.
    h.locks.update_delete(b, 3, 4);
    assert_eq!(waiter.join().unwrap(), LockStatus::Success);

    h.locks.release(&t1);
    h.locks.release(&t2);
}

#[test]
fn reorganize_remaps_heap_numbers_and_keeps_the_queue() {
    let h = Harness::new();
    let index = index();
    let b = Block::new(PageId::new(0, 23), 8);

    let t1 = h.begin(IsolationLevel::RepeatableRead, index);
    let t2 = h.begin(IsolationLevel::RepeatableRead, index);

    assert_eq!(
        h.locks
            .lock_rec(false, LockMode::Exclusive, GapMode::RecNotGap, b, 5, index, &t1),
        LockStatus::LockedRec
    );
    assert_eq!(
        h.locks
            .lock_rec(false, LockMode::Shared, GapMode::RecNotGap, b, 5, index, &t2),
        LockStatus::Wait
    );

    // Compaction renumbers the heap: record 5 becomes record 2.
    h.locks
        .move_reorganize_page(b, &[(0, 0), (1, 1), (5, 2), (6, 3)]);
    h.locks.validate();

    assert!(h
        .locks
        .trx_holds_rec_lock(&t1, b.page, 2, LockMode::Exclusive, GapMode::RecNotGap));
    assert!(!h
        .locks
        .trx_holds_rec_lock(&t1, b.page, 5, LockMode::Exclusive, GapMode::RecNotGap));
    // The waiter still waits, now on the new heap number.
    assert!(t2.is_waiting());

    let locks = Arc::clone(&h.locks);
    let t2c = Arc::clone(&t2);
    let waiter = thread::spawn(move || locks.wait_for(&t2c));
    thread::sleep(Duration::from_millis(10));
    h.locks.release(&t1);
    assert_eq!(waiter.join().unwrap(), LockStatus::Success);
    assert!(h
        .locks
        .trx_holds_rec_lock(&t2, b.page, 2, LockMode::Shared, GapMode::RecNotGap));

    h.locks.release(&t2);
}

#[test]
fn infimum_stash_round_trip_moves_coverage() {
    let h = Harness::new();
    let index = index();
    let b = Block::new(PageId::new(0, 24), 8);

    let t1 = h.begin(IsolationLevel::RepeatableRead, index);
    assert_eq!(
        h.locks
            .lock_rec(false, LockMode::Exclusive, GapMode::RecNotGap, b, 3, index, &t1),
        LockStatus::LockedRec
    );

    // The record is moved by a size-changing update: stash its locks on
    // the infimum, then restore at the new position.
    h.locks.rec_store_on_page_infimum(b, 3);
    assert!(!h
        .locks
        .trx_holds_rec_lock(&t1, b.page, 3, LockMode::Exclusive, GapMode::RecNotGap));
    h.locks.rec_restore_from_page_infimum(b, 6, b.page);
    h.locks.validate();

    assert!(h
        .locks
        .trx_holds_rec_lock(&t1, b.page, 6, LockMode::Exclusive, GapMode::RecNotGap));

    h.locks.release(&t1);
}

#[test]
fn merge_right_inherits_and_frees_the_discarded_page() {
    let h = Harness::new();
    let index = index();
    let left = Block::new(PageId::new(0, 25), 8);
    let right = Block::new(PageId::new(0, 26), 8);

    let t1 = h.begin(IsolationLevel::RepeatableRead, index);
    // Gap coverage of the left page's tail gap.
    assert_eq!(
        h.locks
            .lock_rec(false, LockMode::Shared, GapMode::Gap, left, SUP, index, &t1),
        LockStatus::LockedRec
    );

    // Left page merges into the right one; heap 2 was the right page's
    // first record before the merge.
    h.locks.update_merge_right(right, 2, left);
    h.locks.validate();

    assert!(h
        .locks
        .trx_holds_rec_lock(&t1, right.page, 2, LockMode::Shared, GapMode::Gap));
    // Nothing is left on the discarded page.
    assert!(!h
        .locks
        .trx_holds_rec_lock(&t1, left.page, SUP, LockMode::Shared, GapMode::Gap));

    h.locks.release(&t1);
    assert_eq!(h.locks.n_locks(), 0);
}

#[test]
fn discard_inherits_every_record_to_the_heir() {
    let h = Harness::new();
    let index = index();
    let doomed = Block::new(PageId::new(0, 27), 8);
    let heir = Block::new(PageId::new(0, 28), 8);

    let t1 = h.begin(IsolationLevel::RepeatableRead, index);
    for heap in [2, 3, 4] {
        assert_eq!(
            h.locks
                .lock_rec(false, LockMode::Shared, GapMode::Ordinary, doomed, heap, index, &t1),
            LockStatus::LockedRec
        );
    }

    h.locks.update_discard(heir, 5, doomed.page, &[0, 1, 2, 3, 4]);
    h.locks.validate();

    assert!(h
        .locks
        .trx_holds_rec_lock(&t1, heir.page, 5, LockMode::Shared, GapMode::Gap));
    for heap in [2, 3, 4] {
        assert!(!h
            .locks
            .trx_holds_rec_lock(&t1, doomed.page, heap, LockMode::Shared, GapMode::Ordinary));
    }

    h.locks.release(&t1);
    assert_eq!(h.locks.n_locks(), 0);
}

#[test]
fn split_left_and_merge_left_keep_tail_gap_coverage() {
    let h = Harness::new();
    let index = index();
    let left = Block::new(PageId::new(0, 29), 8);
    let right = Block::new(PageId::new(0, 30), 8);

    let t1 = h.begin(IsolationLevel::RepeatableRead, index);
    // Next-key coverage of the right page's first record.
    assert_eq!(
        h.locks
            .lock_rec(false, LockMode::Shared, GapMode::Ordinary, right, 2, index, &t1),
        LockStatus::LockedRec
    );

    // Split to the left: the left supremum now bounds that same gap.
    h.locks.update_split_left(right, left, 2);
    assert!(h
        .locks
        .trx_holds_rec_lock(&t1, left.page, SUP, LockMode::Shared, GapMode::Gap));

    // Merge the right page back into the left; record 2 moved over and
    // became heap 4 on the left page.
    h.locks.move_rec_list_end(left, right, &[(2, 4)]);
    h.locks.update_merge_left(left, Some(4), right);
    h.locks.validate();

    assert!(h
        .locks
        .trx_holds_rec_lock(&t1, left.page, 4, LockMode::Shared, GapMode::Ordinary));
    assert!(h
        .locks
        .trx_holds_rec_lock(&t1, left.page, 4, LockMode::Shared, GapMode::Gap));

    h.locks.release(&t1);
    assert_eq!(h.locks.n_locks(), 0);
}

#[test]
fn waiting_lock_moves_with_its_record_and_stays_waiting() {
    let h = Harness::new();
    let index = index();
    let b = Block::new(PageId::new(0, 31), 8);
    let b_new = Block::new(PageId::new(0, 32), 8);

    let t1 = h.begin(IsolationLevel::RepeatableRead, index);
    let t2 = h.begin(IsolationLevel::RepeatableRead, index);

    assert_eq!(
        h.locks
            .lock_rec(false, LockMode::Exclusive, GapMode::RecNotGap, b, 3, index, &t1),
        LockStatus::LockedRec
    );
    assert_eq!(
        h.locks
            .lock_rec(false, LockMode::Shared, GapMode::RecNotGap, b, 3, index, &t2),
        LockStatus::Wait
    );

    // The record moves to another page; both the granted lock and the
    // waiting request follow it.
    h.locks.move_rec_list_end(b_new, b, &[(3, 2)]);
    h.locks.validate();

    assert!(h
        .locks
        .trx_holds_rec_lock(&t1, b_new.page, 2, LockMode::Exclusive, GapMode::RecNotGap));
    assert!(t2.is_waiting());

    let locks = Arc::clone(&h.locks);
    let t2c = Arc::clone(&t2);
    let waiter = thread::spawn(move || locks.wait_for(&t2c));
    thread::sleep(Duration::from_millis(10));
    h.locks.release(&t1);
    assert_eq!(waiter.join().unwrap(), LockStatus::Success);
    assert!(h
        .locks
        .trx_holds_rec_lock(&t2, b_new.page, 2, LockMode::Shared, GapMode::RecNotGap));

    h.locks.release(&t2);
}
