//! # The Lock System
//!
//! Central arbiter for row and table locks under two-phase locking.
//! Transactions request locks before touching data, wait in per-record
//! FIFO queues on conflict, and release everything at commit or rollback.
//! A bounded depth-first search over the waits-for graph detects
//! deadlocks and rolls back a victim.
//!
//! ## Structure
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                  LockSys                       │
//! │  world: Mutex<LockWorld>   (global latch)      │
//! │  wait_latch: Mutex<()>     (signalling latch)  │
//! │  stats, policy, registry                       │
//! ├───────────────────────────────────────────────┤
//! │                  LockWorld                     │
//! │  arena      - every lock object, slot arena    │
//! │  rec_hash   - record locks keyed by page       │
//! │  prdt_hash  - predicate locks keyed by page    │
//! │  prdt_page_hash - page predicate locks         │
//! │  tables     - per-table queues + autoinc state │
//! │  trxs       - per-transaction lock bookkeeping │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! ## Latching
//!
//! The **global latch** (`world`) guards every structure above: hash
//! chains, bitmaps, mode bits, per-table queues, per-transaction lists,
//! and the deadlock detector's shared mark counter. The **wait latch**
//! guards the wait/victim flags and condition-variable signalling of all
//! transactions; it is acquired *inside* the global latch whenever an
//! operation may grant or cancel a wait. A suspended waiter holds only
//! the wait latch (its condition variable releases it while blocked), so
//! lock traffic keeps flowing during waits.
//!
//! Each transaction additionally carries its own small latch around the
//! mirror of its granted table-lock modes (see [`crate::trx`]). The
//! mirror lets `lock_table` detect an already-held equal-or-stronger
//! table lock without touching the global latch at all.
//!
//! Lock order: `world`, then `wait_latch`, then a transaction's own
//! latch; never any other order.
//!
//! ## Module map
//!
//! - [`mode`]: mode lattice and the packed `type_mode` word
//! - [`object`] / [`arena`]: lock objects and their slot arena
//! - [`hash`]: the three page-keyed hash tables
//! - `compat`: the has-to-wait rules
//! - `queue`: record-lock enqueue / grant / dequeue
//! - `page_events`: gap inheritance and page split/merge/reorganize hooks
//! - `table`: table locks and the AUTO-INC protocol
//! - `deadlock`: waits-for search and victim selection
//! - [`prdt`]: spatial predicate locks
//! - `requests`: the read/modify/insert acquisition façade
//! - `wait`: suspension, timeout and cancellation

pub mod arena;
pub(crate) mod compat;
pub mod hash;
pub mod mode;
pub mod object;
pub mod page_events;
pub mod prdt;
pub(crate) mod queue;
pub(crate) mod requests;
pub(crate) mod table;
pub(crate) mod wait;

mod deadlock;

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{bail, Result};
use hashbrown::HashMap;
use parking_lot::{Mutex, MutexGuard};

use crate::trx::{Trx, TrxRegistry};
use crate::types::{TableId, TrxId};

use arena::{LockArena, LockRef};
use hash::PageHash;
use mode::TypeMode;
use object::LockData;

/// Outcome of a lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    /// No lock was needed, or the transaction already held coverage.
    Success,
    /// A record lock was installed immediately.
    LockedRec,
    /// A waiting lock was enqueued; the caller must suspend via
    /// [`LockSys::wait_for`].
    Wait,
    /// The request would block and the transaction's wait budget is zero,
    /// or the wait timed out.
    WaitTimeout,
    /// The caller was chosen as deadlock victim and must roll back.
    Deadlock,
}

/// Cluster-replication priority hooks.
///
/// A priority ("brute force") transaction originates from the replication
/// layer and must not lose conflicts to local transactions. The default
/// implementation knows no priority transactions; every hook degrades to
/// plain FIFO behavior.
pub trait PriorityPolicy: Send + Sync {
    /// Whether the transaction is a priority transaction.
    fn is_priority(&self, _trx: &Trx) -> bool {
        false
    }

    /// Whether `a` is ordered before `b` among priority transactions.
    fn order_before(&self, _a: &Trx, _b: &Trx) -> bool {
        false
    }

    /// Whether a gap-lock conflict between the two transactions must be
    /// honored. The replication layer may have already fixed the commit
    /// order, in which case the gap wait is unnecessary.
    fn needs_gap_wait(&self, _requester: &Trx, _holder: &Trx) -> bool {
        true
    }

    /// Notification that `victim` is being rolled back on behalf of a
    /// priority transaction.
    fn force_rollback(&self, _victim: &Trx) {}
}

/// The default policy: no priority transactions.
pub struct FifoPolicy;

impl PriorityPolicy for FifoPolicy {}

/// Increment-only counters for the external monitoring sink.
#[derive(Debug, Default)]
pub struct LockStats {
    pub rec_locks_created: AtomicU64,
    pub rec_locks_removed: AtomicU64,
    pub rec_lock_waits: AtomicU64,
    pub table_locks_created: AtomicU64,
    pub table_locks_removed: AtomicU64,
    pub table_lock_waits: AtomicU64,
    pub deadlocks: AtomicU64,
}

impl LockStats {
    #[inline]
    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Per-transaction bookkeeping inside the latched world.
pub(crate) struct TrxLocks {
    pub handle: Arc<Trx>,
    /// Every lock of the transaction in acquisition order; released LIFO.
    pub locks: Vec<LockRef>,
    /// The one lock this transaction is waiting for, if any.
    pub wait_lock: Option<LockRef>,
    /// Deadlock-search visit stamp.
    pub deadlock_mark: u64,
    /// Table locks in acquisition order; entries are cleared in place so
    /// positions stay stable while the vector is iterated elsewhere.
    pub table_locks: Vec<Option<LockRef>>,
    /// Granted AUTO-INC locks in acquisition order, released in reverse.
    /// Holes appear when a table is dropped mid-statement.
    pub autoinc_locks: Vec<Option<LockRef>>,
}

impl TrxLocks {
    fn new(handle: Arc<Trx>) -> Self {
        Self {
            handle,
            locks: Vec::new(),
            wait_lock: None,
            deadlock_mark: 0,
            table_locks: Vec::new(),
            autoinc_locks: Vec::new(),
        }
    }
}

/// Per-table lock queue and AUTO-INC state.
#[derive(Default)]
pub(crate) struct TableQueue {
    /// Table locks oldest-first; doubles as the wait queue.
    pub queue: Vec<LockRef>,
    /// Granted or waiting S/X table locks; gates the intention fast path.
    pub n_lock_x_or_s: u32,
    pub n_waiting_or_granted_autoinc: u32,
    /// Holder of the granted AUTO-INC lock, if any.
    pub autoinc_trx: Option<TrxId>,
    /// Idle reusable AUTO-INC lock object for the non-waiting grant.
    pub autoinc_cached: Option<LockRef>,
}

/// Everything the global latch protects.
pub(crate) struct LockWorld {
    pub arena: LockArena,
    pub rec_hash: PageHash,
    pub prdt_hash: PageHash,
    pub prdt_page_hash: PageHash,
    pub tables: HashMap<TableId, TableQueue>,
    pub trxs: HashMap<TrxId, TrxLocks>,
    /// Deadlock-search mark counter; monotonic for the process lifetime.
    pub mark_counter: u64,
}

impl LockWorld {
    fn new(n_cells: usize) -> Self {
        Self {
            arena: LockArena::new(),
            rec_hash: PageHash::new(n_cells),
            prdt_hash: PageHash::new(n_cells),
            prdt_page_hash: PageHash::new(n_cells),
            tables: HashMap::new(),
            trxs: HashMap::new(),
            mark_counter: 0,
        }
    }

    /// The hash table a lock of this `type_mode` lives in.
    pub fn hash(&self, tm: TypeMode) -> &PageHash {
        if tm.is_predicate() {
            &self.prdt_hash
        } else if tm.is_prdt_page() {
            &self.prdt_page_hash
        } else {
            &self.rec_hash
        }
    }

    pub fn hash_mut(&mut self, tm: TypeMode) -> &mut PageHash {
        if tm.is_predicate() {
            &mut self.prdt_hash
        } else if tm.is_prdt_page() {
            &mut self.prdt_page_hash
        } else {
            &mut self.rec_hash
        }
    }

    /// Register the transaction in the world if it is not yet known.
    pub fn ensure_trx(&mut self, handle: &Arc<Trx>) -> &mut TrxLocks {
        self.trxs
            .entry(handle.id())
            .or_insert_with(|| TrxLocks::new(Arc::clone(handle)))
    }

    pub fn trx(&self, id: TrxId) -> &TrxLocks {
        self.trxs.get(&id).expect("transaction not registered")
    }

    pub fn trx_mut(&mut self, id: TrxId) -> &mut TrxLocks {
        self.trxs.get_mut(&id).expect("transaction not registered")
    }

    pub fn table(&mut self, table: TableId) -> &mut TableQueue {
        self.tables.entry(table).or_default()
    }
}

/// The lock system. One instance per process; see the module docs for the
/// latching rules.
pub struct LockSys {
    world: Mutex<LockWorld>,
    wait_latch: Mutex<()>,
    pub stats: LockStats,
    pub(crate) policy: Arc<dyn PriorityPolicy>,
    pub(crate) registry: Arc<TrxRegistry>,
    deadlock_detect: AtomicBool,
}

impl LockSys {
    /// Create the lock system with `n_cells` hash cells per table.
    pub fn new(n_cells: usize, registry: Arc<TrxRegistry>) -> Result<Self> {
        Self::with_policy(n_cells, registry, Arc::new(FifoPolicy))
    }

    pub fn with_policy(
        n_cells: usize,
        registry: Arc<TrxRegistry>,
        policy: Arc<dyn PriorityPolicy>,
    ) -> Result<Self> {
        if n_cells == 0 {
            bail!("lock hash needs at least one cell");
        }
        Ok(Self {
            world: Mutex::new(LockWorld::new(n_cells)),
            wait_latch: Mutex::new(()),
            stats: LockStats::default(),
            policy,
            registry,
            deadlock_detect: AtomicBool::new(true),
        })
    }

    /// Enable or disable deadlock detection. With detection off, cycles
    /// resolve through lock-wait timeouts only.
    pub fn set_deadlock_detection(&self, on: bool) {
        self.deadlock_detect.store(on, Ordering::Relaxed);
    }

    pub(crate) fn deadlock_detect(&self) -> bool {
        self.deadlock_detect.load(Ordering::Relaxed)
    }

    /// Re-hash all three lock tables to `n_cells` cells, online.
    pub fn resize(&self, n_cells: usize) -> Result<()> {
        if n_cells == 0 {
            bail!("lock hash needs at least one cell");
        }
        let mut world = self.world.lock();
        let world = &mut *world;
        world.rec_hash.resize(&world.arena, n_cells);
        world.prdt_hash.resize(&world.arena, n_cells);
        world.prdt_page_hash.resize(&world.arena, n_cells);
        Ok(())
    }

    /// Take the global latch alone. For read-only paths.
    pub(crate) fn latch(&self) -> MutexGuard<'_, LockWorld> {
        self.world.lock()
    }

    /// Take both latches in the canonical order. Required by every path
    /// that may grant or cancel a wait.
    pub(crate) fn latch_both(&self) -> (MutexGuard<'_, LockWorld>, MutexGuard<'_, ()>) {
        let world = self.world.lock();
        let wg = self.wait_latch.lock();
        (world, wg)
    }

    pub(crate) fn wait_latch(&self) -> MutexGuard<'_, ()> {
        self.wait_latch.lock()
    }

    /// Number of live lock objects. Idle cached AUTO-INC objects are not
    /// locks and do not count. Diagnostic.
    pub fn n_locks(&self) -> usize {
        let world = self.latch();
        let cached = world
            .tables
            .values()
            .filter(|t| t.autoinc_cached.is_some())
            .count();
        world.arena.len() - cached
    }

    /// Write a human-readable summary of every registered transaction and
    /// its locks. The format is for eyes, not parsers.
    pub fn print_info_all_transactions(&self, out: &mut dyn Write) -> Result<()> {
        let world = self.latch();
        let mut ids: Vec<TrxId> = world.trxs.keys().copied().collect();
        ids.sort_unstable();
        writeln!(out, "LOCK SYSTEM: {} lock object(s)", world.arena.len())?;
        for id in ids {
            let trx = world.trx(id);
            writeln!(
                out,
                "TRANSACTION {id}, {} lock(s){}",
                trx.locks.len(),
                if trx.wait_lock.is_some() {
                    ", LOCK WAIT"
                } else {
                    ""
                },
            )?;
            for &r in &trx.locks {
                let lock = &world.arena[r];
                match &lock.data {
                    LockData::Rec { page, index, .. } => {
                        writeln!(
                            out,
                            "  RECORD LOCK page ({}, {}) index {} heap {:?} {:?}",
                            page.space,
                            page.page_no,
                            index.id,
                            lock.set_bits(),
                            lock.type_mode,
                        )?;
                    }
                    LockData::Table { table } => {
                        writeln!(out, "  TABLE LOCK table {table} {:?}", lock.type_mode)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Check the structural invariants of the lock table. Panics on
    /// violation; meant for tests and debug builds.
    pub fn validate(&self) {
        let world = self.latch();
        // Granted locks on the same record are pairwise compatible unless
        // they share an owner, and every waiting lock has a blocker ahead.
        for hash in [&world.rec_hash, &world.prdt_hash, &world.prdt_page_hash] {
            for r in hash.iter_all() {
                let lock = &world.arena[r];
                let page = lock.page();
                if lock.is_waiting() {
                    let heap_no = lock
                        .find_set_bit()
                        .expect("waiting record lock with empty bitmap");
                    let chain = hash.chain(&world.arena, page);
                    let ahead = chain
                        .iter()
                        .take_while(|x| **x != r)
                        .any(|x| {
                            let other = &world.arena[*x];
                            other.bit(heap_no)
                                && compat::has_to_wait(&world, &*self.policy, lock, other)
                        });
                    assert!(ahead, "waiting lock with nothing to wait for: {r:?}");
                    assert_eq!(
                        world.trx(lock.trx).wait_lock,
                        Some(r),
                        "waiting lock not registered as its owner's wait lock",
                    );
                } else {
                    for heap_no in lock.set_bits() {
                        if heap_no == crate::types::HEAP_NO_SUPREMUM {
                            // Supremum locks are gap locks by construction
                            // and may conflict freely.
                            continue;
                        }
                        let chain = hash.chain(&world.arena, page);
                        for x in chain {
                            if x == r {
                                continue;
                            }
                            let other = &world.arena[x];
                            if other.is_waiting() || !other.bit(heap_no) {
                                continue;
                            }
                            assert!(
                                other.trx == lock.trx
                                    || other.mode().compatible(lock.mode())
                                    || lock.type_mode.is_gap()
                                    || other.type_mode.is_gap()
                                    || lock.type_mode.is_insert_intention()
                                    || other.type_mode.is_insert_intention(),
                                "incompatible granted locks share record ({r:?}, {x:?})",
                            );
                        }
                    }
                }
            }
        }
        // wait_lock back-pointers refer to live waiting locks.
        for (id, trx) in &world.trxs {
            if let Some(w) = trx.wait_lock {
                let lock = &world.arena[w];
                assert!(lock.is_waiting(), "wait_lock of {id} is not waiting");
                assert_eq!(lock.trx, *id, "wait_lock of {id} owned by {}", lock.trx);
            }
        }
    }
}
