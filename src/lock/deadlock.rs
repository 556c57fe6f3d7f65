//! # Deadlock Detection
//!
//! A depth-first search over the waits-for graph, run at enqueue time by
//! the transaction that just queued a waiting lock. Edges go from a
//! waiting lock to each conflicting lock ahead of it in the same queue;
//! following the owner's own wait lock descends one level.
//!
//! The search is iterative with an explicit bounded stack: 200 frames and
//! one million visited edges. Blowing either bound declares the search
//! "too deep" and sacrifices the joining transaction outright - a cheap,
//! predictable way out of pathological graphs, at the cost of sometimes
//! rolling back a transaction that was not on any cycle. (A priority
//! policy does not override this; the joining transaction is the victim
//! even if it is a priority one.)
//!
//! Subtrees already exhausted in this invocation are skipped through a
//! per-transaction mark stamped from a monotonic counter, so the search
//! visits each transaction's queue neighborhood once.
//!
//! Record queues are traversed oldest to newest; table queues newest to
//! oldest, starting just ahead of the waiting lock.

use super::arena::LockRef;
use super::compat;
use super::{wait, LockStats, LockSys, LockWorld};
use crate::trx::Trx;
use crate::types::{HeapNo, TrxId};

const MAX_STACK: usize = 200;
const MAX_COST: u64 = 1_000_000;

#[derive(Clone, Copy)]
struct Frame {
    lock: LockRef,
    wait_lock: LockRef,
    heap_no: Option<HeapNo>,
}

struct Checker<'a> {
    sys: &'a LockSys,
    start: TrxId,
    wait_lock: LockRef,
    mark_start: u64,
    cost: u64,
    too_deep: bool,
    stack: Vec<Frame>,
}

/// Check whether the freshly enqueued `lock` of `trx` closes a cycle.
/// Resolves every deadlock found by rolling back a victim; returns the
/// victim's id if one was chosen, which is `trx` itself when the joining
/// transaction loses (or the search was too deep).
pub(crate) fn check_and_resolve(
    world: &mut LockWorld,
    sys: &LockSys,
    lock: LockRef,
    trx: &Trx,
) -> Option<TrxId> {
    if !sys.deadlock_detect() {
        return None;
    }

    loop {
        let mut checker = Checker {
            sys,
            start: trx.id(),
            wait_lock: lock,
            mark_start: world.mark_counter,
            cost: 0,
            too_deep: false,
            stack: Vec::with_capacity(MAX_STACK + 1),
        };
        let victim = checker.search(world);

        if checker.too_deep {
            log::warn!(
                "deadlock search too deep; rolling back joining trx {}",
                trx.id()
            );
            LockStats::inc(&sys.stats.deadlocks);
            return Some(trx.id());
        }

        match victim {
            Some(v) if v != trx.id() => {
                log::debug!("deadlock found; rolling back victim trx {v}");
                LockStats::inc(&sys.stats.deadlocks);
                rollback_victim(world, sys, v);
                // The rollback may have granted our lock, or another
                // cycle may remain; search again.
            }
            Some(v) => {
                debug_assert_eq!(v, trx.id());
                LockStats::inc(&sys.stats.deadlocks);
                return Some(v);
            }
            None => return None,
        }
    }
}

fn rollback_victim(world: &mut LockWorld, sys: &LockSys, victim: TrxId) {
    let handle = world.trx(victim).handle.clone();
    handle.set_victim(true);
    sys.policy.force_rollback(&handle);
    let wait_lock = world
        .trx(victim)
        .wait_lock
        .expect("deadlock victim has no wait lock");
    wait::cancel_waiting_and_release_low(world, sys, wait_lock);
}

impl<'a> Checker<'a> {
    fn is_too_deep(&self) -> bool {
        self.stack.len() > MAX_STACK || self.cost > MAX_COST
    }

    fn is_visited(&self, world: &LockWorld, r: LockRef) -> bool {
        world.trx(world.arena[r].trx).deadlock_mark > self.mark_start
    }

    /// First candidate edge for the current wait lock: the head of the
    /// record's queue, or the entry just ahead of a table wait lock.
    fn first_lock(&self, world: &LockWorld) -> (Option<LockRef>, Option<HeapNo>) {
        let wl = &world.arena[self.wait_lock];
        if wl.is_table() {
            let queue = &world.tables[&wl.table()].queue;
            let pos = queue
                .iter()
                .position(|r| *r == self.wait_lock)
                .expect("wait lock missing from its table queue");
            let prev = if pos == 0 { None } else { Some(queue[pos - 1]) };
            (prev, None)
        } else {
            let heap_no = wl.find_set_bit().expect("wait lock with empty bitmap");
            let first = world
                .hash(wl.type_mode)
                .chain(&world.arena, wl.page())
                .into_iter()
                .find(|r| world.arena[*r].bit(heap_no));
            (first, Some(heap_no))
        }
    }

    /// Next edge after `lock`, skipping transactions whose subtree was
    /// already exhausted in this invocation.
    fn next_lock(
        &self,
        world: &LockWorld,
        mut lock: LockRef,
        heap_no: Option<HeapNo>,
    ) -> Option<LockRef> {
        loop {
            let next = match heap_no {
                Some(h) => {
                    let wl = &world.arena[self.wait_lock];
                    let chain = world.hash(wl.type_mode).chain(&world.arena, wl.page());
                    let pos = chain.iter().position(|r| *r == lock)?;
                    chain[pos + 1..]
                        .iter()
                        .copied()
                        .find(|r| world.arena[*r].bit(h))
                }
                None => {
                    let queue = &world.tables[&world.arena[lock].table()].queue;
                    let pos = queue.iter().position(|r| *r == lock)?;
                    if pos == 0 {
                        None
                    } else {
                        Some(queue[pos - 1])
                    }
                }
            };
            match next {
                None => return None,
                Some(n) if !self.is_visited(world, n) => return Some(n),
                Some(n) => lock = n,
            }
        }
    }

    /// The iterative waits-for search. Returns the victim when a cycle
    /// back to the joining transaction is found.
    fn search(&mut self, world: &mut LockWorld) -> Option<TrxId> {
        let (mut lock, mut heap_no) = self.first_lock(world);
        if let Some(l) = lock {
            if self.is_visited(world, l) {
                lock = self.next_lock(world, l, heap_no);
            }
        }

        loop {
            while lock.is_none() {
                let Some(frame) = self.stack.pop() else {
                    return None;
                };
                self.wait_lock = frame.wait_lock;
                heap_no = frame.heap_no;
                lock = self.next_lock(world, frame.lock, heap_no);
            }
            let l = lock.expect("loop above refilled the cursor");

            if l == self.wait_lock {
                // Reached our own request: everything ahead has been
                // examined, so the owner's subtree is exhausted.
                world.mark_counter += 1;
                let mark = world.mark_counter;
                let owner = world.arena[l].trx;
                world.trx_mut(owner).deadlock_mark = mark;
                lock = None;
                continue;
            }

            let blocked = {
                let wl = &world.arena[self.wait_lock];
                compat::has_to_wait(world, &*self.sys.policy, wl, &world.arena[l])
            };
            if !blocked {
                lock = self.next_lock(world, l, heap_no);
                continue;
            }

            let trx2 = world.arena[l].trx;
            if trx2 == self.start {
                self.notify(world, l);
                return Some(self.select_victim(world));
            }

            if self.is_too_deep() {
                self.too_deep = true;
                return Some(self.start);
            }

            let t2 = world.trx(trx2);
            let descend = t2.wait_lock.filter(|_| t2.handle.is_waiting());
            if let Some(w2) = descend {
                self.cost += 1;
                // Hard backstop for the stack itself; the bound only
                // trips once MAX_STACK frames have been exceeded.
                if self.stack.len() > MAX_STACK {
                    self.too_deep = true;
                    return Some(self.start);
                }
                self.stack.push(Frame {
                    lock: l,
                    wait_lock: self.wait_lock,
                    heap_no,
                });
                self.wait_lock = w2;
                let (first, h) = self.first_lock(world);
                heap_no = h;
                lock = first;
                if let Some(f) = lock {
                    if self.is_visited(world, f) {
                        lock = self.next_lock(world, f, heap_no);
                    }
                }
            } else {
                lock = self.next_lock(world, l, heap_no);
            }
        }
    }

    /// Choose between the joining transaction and the owner of the
    /// current wait lock. The lighter transaction loses; weight is locks
    /// held plus rows modified, and having written to a non-transactional
    /// table outweighs everything (such changes cannot be rolled back).
    /// A priority transaction is spared when any alternative exists.
    fn select_victim(&self, world: &LockWorld) -> TrxId {
        let start = self.start;
        let other = world.arena[self.wait_lock].trx;
        debug_assert!(other != start);
        debug_assert!(world.trx(start).wait_lock.is_some());

        let start_handle = &world.trx(start).handle;
        let other_handle = &world.trx(other).handle;

        if weight_ge(world, other, start) {
            // The joining transaction is lighter.
            if self.sys.policy.is_priority(start_handle) {
                return other;
            }
            start
        } else {
            if self.sys.policy.is_priority(other_handle) {
                return start;
            }
            other
        }
    }

    fn notify(&self, world: &LockWorld, l: LockRef) {
        let waiter = world.arena[self.wait_lock].trx;
        let holder = world.arena[l].trx;
        log::debug!(
            "deadlock cycle: trx {waiter} waiting for {:?} held by trx {holder}",
            world.arena[self.wait_lock].type_mode,
        );
    }
}

/// Is transaction `a` at least as heavy as `b`?
fn weight_ge(world: &LockWorld, a: TrxId, b: TrxId) -> bool {
    let a_nontrans = world.trx(a).handle.edited_nontransactional();
    let b_nontrans = world.trx(b).handle.edited_nontransactional();
    if a_nontrans != b_nontrans {
        return a_nontrans;
    }
    weight(world, a) >= weight(world, b)
}

fn weight(world: &LockWorld, id: TrxId) -> u64 {
    let t = world.trx(id);
    t.locks.len() as u64 + t.handle.undo_records()
}
