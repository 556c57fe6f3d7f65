//! # Transactions and the Transaction Registry
//!
//! The lock system arbitrates between transactions but does not own their
//! lifecycle; this module provides the minimal transaction object and the
//! process-wide registry the lock system consults.
//!
//! ## What lives where
//!
//! A [`Trx`] carries only state that must be reachable without the global
//! lock-table latch: identity, isolation level, the wait/victim/cancel
//! flags, the per-transaction condition variable, the weight inputs for
//! deadlock victim selection, and a small mirror of the granted
//! table-lock modes. Everything structural (which locks the transaction
//! holds, which lock it waits for) lives inside the lock system's latched
//! world, keyed by [`TrxId`].
//!
//! The table-grant mirror exists for one hot path: a transaction
//! re-locking a table it already holds. Only the owning thread requests
//! table locks for a transaction, and only granted entries are mirrored,
//! so the owner can probe the mirror under the transaction's own latch
//! without touching the global one. The mirror is updated by the lock
//! system while it holds both of its latches; the per-transaction latch
//! is always innermost (global latch, then wait latch, then this one).
//!
//! ## Wait handshake
//!
//! A transaction that enqueued a waiting lock suspends on its own
//! condition variable under the lock system's wait latch. The granting or
//! cancelling side flips `waiting` to false (and possibly sets the victim
//! flag) under that same latch before signalling, so the waiter can never
//! miss a wakeup.
//!
//! ## Registry
//!
//! [`TrxRegistry`] assigns ids from a global atomic counter and tracks the
//! active set. `find` hands out a clone of the `Arc`, which is exactly the
//! reference-count guarantee implicit-lock conversion needs: the holder
//! cannot disappear while the caller still works with it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;

use crate::lock::mode::LockMode;
use crate::types::{TableId, TrxId};

/// Sentinel in `lock_wait_timeout_us` meaning "wait forever".
const WAIT_FOREVER: u64 = u64::MAX;

/// Transaction isolation level. Only the ordering relative to
/// `ReadCommitted` matters to the lock system: at `ReadCommitted` and
/// below, gap locks taken by row modifications are not inherited across
/// deletes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// One transaction as seen by the lock system.
pub struct Trx {
    id: TrxId,
    isolation: IsolationLevel,
    /// Duplicate-handling mode (REPLACE / INSERT ... ON DUPLICATE KEY).
    /// Affects which lock mode counts as "row modification" for the
    /// read-committed gap-inheritance exception.
    duplicates: AtomicBool,
    /// Lock wait budget in microseconds; `WAIT_FOREVER` = unbounded.
    lock_wait_timeout_us: AtomicU64,

    /// True while a waiting lock of this transaction is enqueued.
    /// Mutated under the lock system's wait latch.
    waiting: AtomicBool,
    /// Set when deadlock resolution rolled this transaction back.
    victim: AtomicBool,
    /// Set while a cancellation of this transaction's wait is in
    /// progress; makes the cancel path reentrancy-safe.
    cancel: AtomicBool,
    /// Signalled under the wait latch when `waiting` flips to false.
    pub(crate) cond: Condvar,

    /// Rows modified so far; one of the two victim-weight inputs.
    undo_records: AtomicU64,
    /// Whether the transaction wrote to a non-transactional table.
    /// Such transactions cannot be rolled back and outweigh all others.
    edited_nontrans: AtomicBool,

    /// Granted table-lock modes, mirrored from the lock world. Guarded
    /// by the per-transaction latch, which is taken innermost (after the
    /// lock system's latches) or alone.
    table_grants: Mutex<SmallVec<[(TableId, LockMode); 4]>>,
}

impl Trx {
    fn new(id: TrxId, isolation: IsolationLevel) -> Self {
        Self {
            id,
            isolation,
            duplicates: AtomicBool::new(false),
            lock_wait_timeout_us: AtomicU64::new(WAIT_FOREVER),
            waiting: AtomicBool::new(false),
            victim: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
            cond: Condvar::new(),
            undo_records: AtomicU64::new(0),
            edited_nontrans: AtomicBool::new(false),
            table_grants: Mutex::new(SmallVec::new()),
        }
    }

    #[inline(always)]
    pub fn id(&self) -> TrxId {
        self.id
    }

    #[inline(always)]
    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn set_duplicates(&self, on: bool) {
        self.duplicates.store(on, Ordering::Relaxed);
    }

    pub(crate) fn duplicates(&self) -> bool {
        self.duplicates.load(Ordering::Relaxed)
    }

    /// Set the lock wait budget. `None` waits forever; `Some(0)` makes any
    /// blocking lock request fail immediately with `WaitTimeout`.
    pub fn set_lock_wait_timeout(&self, timeout: Option<Duration>) {
        let us = match timeout {
            None => WAIT_FOREVER,
            Some(d) => d.as_micros().min((WAIT_FOREVER - 1) as u128) as u64,
        };
        self.lock_wait_timeout_us.store(us, Ordering::Relaxed);
    }

    pub(crate) fn lock_wait_timeout(&self) -> Option<Duration> {
        match self.lock_wait_timeout_us.load(Ordering::Relaxed) {
            WAIT_FOREVER => None,
            us => Some(Duration::from_micros(us)),
        }
    }

    /// Record that this transaction modified a row.
    pub fn register_row_edit(&self) {
        self.undo_records.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_edited_nontransactional(&self) {
        self.edited_nontrans.store(true, Ordering::Relaxed);
    }

    pub(crate) fn undo_records(&self) -> u64 {
        self.undo_records.load(Ordering::Relaxed)
    }

    pub(crate) fn edited_nontransactional(&self) -> bool {
        self.edited_nontrans.load(Ordering::Relaxed)
    }

    pub fn is_waiting(&self) -> bool {
        self.waiting.load(Ordering::Acquire)
    }

    pub(crate) fn set_waiting(&self, on: bool) {
        self.waiting.store(on, Ordering::Release);
    }

    pub fn was_chosen_as_deadlock_victim(&self) -> bool {
        self.victim.load(Ordering::Acquire)
    }

    pub(crate) fn set_victim(&self, on: bool) {
        self.victim.store(on, Ordering::Release);
    }

    pub(crate) fn cancel_in_progress(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    pub(crate) fn set_cancel(&self, on: bool) {
        self.cancel.store(on, Ordering::Release);
    }

    /// Does this transaction hold a granted table lock at least as
    /// strong as `mode`? Safe to call without the lock system's latches:
    /// only this transaction adds to its own set of granted table locks.
    pub fn holds_table_lock(&self, table: TableId, mode: LockMode) -> bool {
        self.table_grants
            .lock()
            .iter()
            .any(|(t, m)| *t == table && m.stronger_or_eq(mode))
    }

    pub(crate) fn table_grant_add(&self, table: TableId, mode: LockMode) {
        self.table_grants.lock().push((table, mode));
    }

    pub(crate) fn table_grant_remove(&self, table: TableId, mode: LockMode) {
        let mut grants = self.table_grants.lock();
        let pos = grants.iter().rposition(|e| *e == (table, mode));
        debug_assert!(pos.is_some(), "table grant missing from its mirror");
        if let Some(pos) = pos {
            grants.remove(pos);
        }
    }
}

impl std::fmt::Debug for Trx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trx")
            .field("id", &self.id)
            .field("isolation", &self.isolation)
            .field("waiting", &self.is_waiting())
            .field("victim", &self.was_chosen_as_deadlock_victim())
            .finish()
    }
}

/// Process-wide registry of active transactions.
pub struct TrxRegistry {
    next_id: AtomicU64,
    active: Mutex<HashMap<TrxId, Arc<Trx>>>,
}

impl Default for TrxRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TrxRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Start a new transaction at the given isolation level.
    pub fn begin(&self, isolation: IsolationLevel) -> Arc<Trx> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let trx = Arc::new(Trx::new(id, isolation));
        self.active.lock().insert(id, Arc::clone(&trx));
        trx
    }

    /// Look up an active transaction. The returned `Arc` keeps the
    /// transaction object alive for as long as the caller needs it.
    pub fn find(&self, id: TrxId) -> Option<Arc<Trx>> {
        self.active.lock().get(&id).cloned()
    }

    /// Deregister a finished (committed or rolled-back) transaction.
    /// The caller must have released its locks first.
    pub fn finish(&self, trx: &Trx) {
        self.active.lock().remove(&trx.id());
    }

    /// The smallest id among active transactions, or the next id to be
    /// assigned if none are active. Rows whose stored trx id is below
    /// this bound cannot carry an implicit lock.
    pub fn get_min_trx_id(&self) -> TrxId {
        let next = self.next_id.load(Ordering::SeqCst);
        self.active
            .lock()
            .keys()
            .copied()
            .min()
            .unwrap_or(next)
    }

    /// One past the largest id assigned so far.
    pub fn get_max_trx_id(&self) -> TrxId {
        self.next_id.load(Ordering::SeqCst)
    }
}

/// MVCC-side probe for implicit locks on secondary index records.
///
/// Secondary index records do not store a transaction id; finding the
/// implicit X-locker requires chasing the clustered index record and its
/// version chain, which is the version store's business. May return a
/// false positive (a transaction that turns out to be committed); the
/// lock system re-checks against the registry.
pub trait ImplicitLockProbe {
    fn implicit_x_locker(
        &self,
        caller: &Trx,
        page: crate::types::PageId,
        heap_no: crate::types::HeapNo,
    ) -> Option<TrxId>;
}
