//! # Record Locking Scenarios
//!
//! End-to-end scenarios for the record-lock queues: conflict and FIFO
//! grant ordering, gap semantics, insert intentions, implicit-lock
//! conversion, idempotent re-locking, timeouts, and the release law.
//!
//! Waiters run on real threads suspended in `wait_for`; the test body
//! drives grants by releasing locks and then checks the observed wakeup
//! order.

use std::sync::atomic::{AtomicU32, Ordering};
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
        let locks = Arc::new(LockSys::new(256, Arc::clone(&registry)).unwrap());
        Self { registry, locks }
    }

    fn begin(&self) -> Arc<Trx> {
        self.registry.begin(IsolationLevel::RepeatableRead)
    }

    /// Begin a transaction that already holds IS + IX on the table.
    fn begin_with_intents(&self, index: Index) -> Arc<Trx> {
        let trx = self.begin();
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

    fn finish(&self, trx: &Arc<Trx>) {
        self.locks.release(trx);
        self.registry.finish(trx);
    }
}

fn index() -> Index {
    Index::clustered(1, 1)
}

fn block(page_no: u32) -> Block {
    Block::new(PageId::new(0, page_no), 8)
}

#[test]
fn s_x_conflict_grants_fifo() {
    let h = Harness::new();
    let index = index();
    let b = block(5);

    let t1 = h.begin_with_intents(index);
    let t2 = h.begin_with_intents(index);
    let t3 = h.begin_with_intents(index);

    assert_eq!(
        h.locks
            .lock_rec(false, LockMode::Shared, GapMode::RecNotGap, b, 3, index, &t1),
        LockStatus::LockedRec
    );
    assert_eq!(
        h.locks
            .lock_rec(false, LockMode::Exclusive, GapMode::RecNotGap, b, 3, index, &t2),
        LockStatus::Wait
    );
    // The S request behind the X waiter must queue too.
    assert_eq!(
        h.locks
            .lock_rec(false, LockMode::Shared, GapMode::RecNotGap, b, 3, index, &t3),
        LockStatus::Wait
    );
    h.locks.validate();

    let spawn_waiter = |trx: Arc<Trx>| {
        let locks = Arc::clone(&h.locks);
        thread::spawn(move || assert_eq!(locks.wait_for(&trx), LockStatus::Success))
    };
    let w2 = spawn_waiter(Arc::clone(&t2));

    thread::sleep(Duration::from_millis(20));
    h.locks.release(&t1);
    w2.join().unwrap();

    // t2 got the X first; t3 is still blocked behind it.
    assert!(!t2.is_waiting());
    assert!(t3.is_waiting());

    let w3 = spawn_waiter(Arc::clone(&t3));
    thread::sleep(Duration::from_millis(20));
    assert!(t3.is_waiting());
    h.locks.release(&t2);
    w3.join().unwrap();
    assert!(!t3.is_waiting());

    h.locks.validate();
    h.finish(&t3);
    assert_eq!(h.locks.n_locks(), 0);
}

#[test]
fn gap_lock_blocks_insert_intention() {
    let h = Harness::new();
    let index = index();
    let b = block(1);

    let t1 = h.begin_with_intents(index);
    let t2 = h.begin_with_intents(index);

    // Next-key S lock on heap 5.
    assert_eq!(
        h.locks
            .lock_rec(false, LockMode::Shared, GapMode::Ordinary, b, 5, index, &t1),
        LockStatus::LockedRec
    );

    // Inserting into the gap before heap 5 must wait.
    let mut inherit = false;
    assert_eq!(
        h.locks.rec_insert_check_and_lock(b, 5, index, &t2, &mut inherit),
        LockStatus::Wait
    );
    assert!(inherit);
    h.locks.validate();

    let locks = Arc::clone(&h.locks);
    let t2c = Arc::clone(&t2);
    let waiter = thread::spawn(move || locks.wait_for(&t2c));
    thread::sleep(Duration::from_millis(20));
    h.locks.release(&t1);
    assert_eq!(waiter.join().unwrap(), LockStatus::Success);

    h.finish(&t2);
}

#[test]
fn pure_gap_locks_do_not_conflict() {
    let h = Harness::new();
    let index = index();
    let b = block(1);

    let t1 = h.begin_with_intents(index);
    let t2 = h.begin_with_intents(index);

    assert_eq!(
        h.locks
            .lock_rec(false, LockMode::Shared, GapMode::Gap, b, 5, index, &t1),
        LockStatus::LockedRec
    );
    // Conflicting modes on the same gap are fine: gaps never block gaps.
    assert_eq!(
        h.locks
            .lock_rec(false, LockMode::Exclusive, GapMode::Gap, b, 5, index, &t2),
        LockStatus::LockedRec
    );
    h.locks.validate();

    h.finish(&t1);
    h.finish(&t2);
}

#[test]
fn record_request_ignores_gap_lock_and_vice_versa() {
    let h = Harness::new();
    let index = index();
    let b = block(2);

    let t1 = h.begin_with_intents(index);
    let t2 = h.begin_with_intents(index);

    assert_eq!(
        h.locks
            .lock_rec(false, LockMode::Exclusive, GapMode::Gap, b, 4, index, &t1),
        LockStatus::LockedRec
    );
    // Record-only request does not see the pure gap lock.
    assert_eq!(
        h.locks
            .lock_rec(false, LockMode::Exclusive, GapMode::RecNotGap, b, 4, index, &t2),
        LockStatus::LockedRec
    );
    h.locks.validate();

    h.finish(&t1);
    h.finish(&t2);
}

#[test]
fn supremum_requests_are_gap_requests() {
    let h = Harness::new();
    let index = index();
    let b = block(3);

    let t1 = h.begin_with_intents(index);
    let t2 = h.begin_with_intents(index);

    assert_eq!(
        h.locks
            .lock_rec(false, LockMode::Exclusive, GapMode::Ordinary, b, 1, index, &t1),
        LockStatus::LockedRec
    );
    // On the supremum everything is a gap lock, and gaps don't conflict.
    assert_eq!(
        h.locks
            .lock_rec(false, LockMode::Shared, GapMode::Ordinary, b, 1, index, &t2),
        LockStatus::LockedRec
    );

    h.finish(&t1);
    h.finish(&t2);
}

#[test]
fn relock_at_equal_or_weaker_mode_is_noop() {
    let h = Harness::new();
    let index = index();
    let b = block(4);

    let t1 = h.begin_with_intents(index);
    assert_eq!(
        h.locks
            .lock_rec(false, LockMode::Exclusive, GapMode::RecNotGap, b, 2, index, &t1),
        LockStatus::LockedRec
    );
    let before = h.locks.n_locks();

    assert_eq!(
        h.locks
            .lock_rec(false, LockMode::Exclusive, GapMode::RecNotGap, b, 2, index, &t1),
        LockStatus::Success
    );
    assert_eq!(
        h.locks
            .lock_rec(false, LockMode::Shared, GapMode::RecNotGap, b, 2, index, &t1),
        LockStatus::Success
    );
    assert_eq!(h.locks.n_locks(), before);

    h.finish(&t1);
}

#[test]
fn implicit_lock_converts_to_explicit_for_holder() {
    let h = Harness::new();
    let index = index();
    let b = block(6);

    // t1 inserted the row at heap 2; the record carries t1's id and no
    // explicit lock exists.
    let t1 = h.begin_with_intents(index);
    let t2 = h.begin_with_intents(index);
    assert_eq!(h.locks.n_locks(), 0);

    // t2 runs SELECT ... FOR UPDATE over the row.
    assert_eq!(
        h.locks.clust_rec_read_check_and_lock(
            b,
            2,
            t1.id(),
            index,
            LockMode::Exclusive,
            GapMode::RecNotGap,
            &t2,
        ),
        LockStatus::Wait
    );

    // The conversion synthesized a granted X lock owned by t1.
    assert!(h
        .locks
        .trx_holds_rec_lock(&t1, b.page, 2, LockMode::Exclusive, GapMode::RecNotGap));
    h.locks.validate();

    let locks = Arc::clone(&h.locks);
    let t2c = Arc::clone(&t2);
    let waiter = thread::spawn(move || locks.wait_for(&t2c));
    thread::sleep(Duration::from_millis(20));
    h.locks.release(&t1);
    assert_eq!(waiter.join().unwrap(), LockStatus::Success);
    assert!(h
        .locks
        .trx_holds_rec_lock(&t2, b.page, 2, LockMode::Exclusive, GapMode::RecNotGap));

    h.finish(&t2);
}

#[test]
fn reader_holding_the_implicit_lock_needs_nothing() {
    let h = Harness::new();
    let index = index();
    let b = block(6);

    let t1 = h.begin_with_intents(index);
    assert_eq!(
        h.locks.clust_rec_read_check_and_lock(
            b,
            2,
            t1.id(),
            index,
            LockMode::Exclusive,
            GapMode::RecNotGap,
            &t1,
        ),
        LockStatus::Success
    );
    assert_eq!(h.locks.n_locks(), 0);
    h.finish(&t1);
}

#[test]
fn zero_wait_budget_fails_fast() {
    let h = Harness::new();
    let index = index();
    let b = block(7);

    let t1 = h.begin_with_intents(index);
    let t2 = h.begin_with_intents(index);
    t2.set_lock_wait_timeout(Some(Duration::ZERO));

    assert_eq!(
        h.locks
            .lock_rec(false, LockMode::Exclusive, GapMode::RecNotGap, b, 2, index, &t1),
        LockStatus::LockedRec
    );
    assert_eq!(
        h.locks
            .lock_rec(false, LockMode::Shared, GapMode::RecNotGap, b, 2, index, &t2),
        LockStatus::WaitTimeout
    );
    assert!(!t2.is_waiting());

    h.finish(&t1);
    h.finish(&t2);
}

#[test]
fn bounded_wait_times_out_and_withdraws() {
    let h = Harness::new();
    let index = index();
    let b = block(7);

    let t1 = h.begin_with_intents(index);
    let t2 = h.begin_with_intents(index);
    t2.set_lock_wait_timeout(Some(Duration::from_millis(30)));

    assert_eq!(
        h.locks
            .lock_rec(false, LockMode::Exclusive, GapMode::RecNotGap, b, 2, index, &t1),
        LockStatus::LockedRec
    );
    assert_eq!(
        h.locks
            .lock_rec(false, LockMode::Shared, GapMode::RecNotGap, b, 2, index, &t2),
        LockStatus::Wait
    );
    assert_eq!(h.locks.wait_for(&t2), LockStatus::WaitTimeout);
    assert!(!t2.is_waiting());
    h.locks.validate();

    // The withdrawn request must not block a later compatible one.
    let t3 = h.begin_with_intents(index);
    assert_eq!(
        h.locks
            .lock_rec(false, LockMode::Exclusive, GapMode::RecNotGap, b, 3, index, &t3),
        LockStatus::LockedRec
    );

    h.finish(&t1);
    h.finish(&t2);
    h.finish(&t3);
}

#[test]
fn rec_unlock_grants_next_waiter() {
    let h = Harness::new();
    let index = index();
    let b = block(8);

    let t1 = h.begin_with_intents(index);
    let t2 = h.begin_with_intents(index);

    assert_eq!(
        h.locks
            .lock_rec(false, LockMode::Exclusive, GapMode::RecNotGap, b, 2, index, &t1),
        LockStatus::LockedRec
    );
    assert_eq!(
        h.locks
            .lock_rec(false, LockMode::Shared, GapMode::RecNotGap, b, 2, index, &t2),
        LockStatus::Wait
    );

    let locks = Arc::clone(&h.locks);
    let t2c = Arc::clone(&t2);
    let waiter = thread::spawn(move || locks.wait_for(&t2c));
    thread::sleep(Duration::from_millis(20));

    // Early unlock of a single record, mid-transaction.
    h.locks.rec_unlock(&t1, b, 2, LockMode::Exclusive);
    assert_eq!(waiter.join().unwrap(), LockStatus::Success);

    h.finish(&t1);
    h.finish(&t2);
}

#[test]
fn release_leaves_no_trace_and_wakes_everyone() {
    let h = Harness::new();
    let index = index();

    let t1 = h.begin_with_intents(index);
    for page in 10..20 {
        for heap in 2..6 {
            assert_eq!(
                h.locks.lock_rec(
                    false,
                    LockMode::Exclusive,
                    GapMode::RecNotGap,
                    block(page),
                    heap,
                    index,
                    &t1,
                ),
                LockStatus::LockedRec
            );
        }
    }

    let t2 = h.begin_with_intents(index);
    assert_eq!(
        h.locks.lock_rec(
            false,
            LockMode::Shared,
            GapMode::RecNotGap,
            block(15),
            3,
            index,
            &t2,
        ),
        LockStatus::Wait
    );

    let locks = Arc::clone(&h.locks);
    let t2c = Arc::clone(&t2);
    let waiter = thread::spawn(move || locks.wait_for(&t2c));
    thread::sleep(Duration::from_millis(10));

    h.locks.release(&t1);
    assert_eq!(waiter.join().unwrap(), LockStatus::Success);
    h.locks.validate();

    h.finish(&t2);
    assert_eq!(h.locks.n_locks(), 0);
}

#[test]
fn contended_record_serializes_across_threads() {
    let h = Harness::new();
    let index = index();
    let b = block(30);
    let counter = Arc::new(AtomicU32::new(0));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let registry = Arc::clone(&h.registry);
        let locks = Arc::clone(&h.locks);
        let counter = Arc::clone(&counter);
        handles.push(thread::spawn(move || {
            for _ in 0..20 {
                let trx = registry.begin(IsolationLevel::RepeatableRead);
                assert_eq!(
                    locks.lock_table(index.table, LockMode::IntentionExclusive, &trx),
                    LockStatus::Success
                );
                let status =
                    locks.lock_rec(false, LockMode::Exclusive, GapMode::RecNotGap, b, 2, index, &trx);
                let status = match status {
                    LockStatus::Wait => locks.wait_for(&trx),
                    s => s,
                };
                assert!(matches!(status, LockStatus::LockedRec | LockStatus::Success));
                // Exclusive section: no two holders at once.
                let in_section = counter.fetch_add(1, Ordering::SeqCst);
                assert_eq!(in_section, 0);
                counter.fetch_sub(1, Ordering::SeqCst);
                locks.release(&trx);
                registry.finish(&trx);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(h.locks.n_locks(), 0);
}

#[test]
fn print_info_dumps_every_transaction() {
    let h = Harness::new();
    let index = index();
    let b = block(40);

    let t1 = h.begin_with_intents(index);
    assert_eq!(
        h.locks
            .lock_rec(false, LockMode::Shared, GapMode::Ordinary, b, 2, index, &t1),
        LockStatus::LockedRec
    );

    let mut out = Vec::new();
    h.locks.print_info_all_transactions(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains(&format!("TRANSACTION {}", t1.id())));
    assert!(text.contains("RECORD LOCK"));
    assert!(text.contains("TABLE LOCK"));

    h.finish(&t1);
}
