//! # rowlock - Transactional Lock Manager
//!
//! rowlock is the row- and table-lock arbiter of an embedded row-store
//! engine: transactions lock logical rows (index page + heap slot), index
//! gaps and whole tables under two-phase locking, wait in FIFO queues on
//! conflict, and a bounded waits-for search breaks deadlocks by rolling
//! back a victim. The lock table is pure in-memory process state, rebuilt
//! on restart.
//!
//! ## Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use rowlock::{GapMode, Index, IsolationLevel, LockMode, LockStatus, LockSys, TrxRegistry};
//! use rowlock::{Block, PageId};
//!
//! let registry = Arc::new(TrxRegistry::new());
//! let locks = LockSys::new(1024, Arc::clone(&registry)).unwrap();
//!
//! let trx = registry.begin(IsolationLevel::RepeatableRead);
//! let index = Index::clustered(1, 1);
//! let block = Block::new(PageId::new(0, 4), 8);
//!
//! locks.lock_table(index.table, LockMode::IntentionShared, &trx);
//! let status = locks.clust_rec_read_check_and_lock(
//!     block, 2, 0, index, LockMode::Shared, GapMode::Ordinary, &trx,
//! );
//! assert_eq!(status, LockStatus::LockedRec);
//!
//! locks.release(&trx);
//! registry.finish(&trx);
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │   Acquisition façade (read/modify/insert)    │
//! ├──────────────┬──────────────────────────────┤
//! │ Table locks  │  Record queues + page events  │
//! ├──────────────┴──────────────────────────────┤
//! │  Compatibility engine (modes, gaps, prdt)    │
//! ├─────────────────────────────────────────────┤
//! │  Lock objects: slot arena + page-id hashes   │
//! ├─────────────────────────────────────────────┤
//! │  Deadlock detector (bounded waits-for DFS)   │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! One global latch covers the whole lock table; a second latch covers
//! wait signalling. Suspended waiters hold neither, so the lock system
//! stays live while transactions sleep.
//!
//! ## Module Overview
//!
//! - [`lock`]: the lock system itself
//! - [`trx`]: transaction handles and the registry
//! - [`sync`]: the single-word reader/updater/writer latch
//! - [`types`]: page, table, index and heap-number identifiers

pub mod lock;
pub mod sync;
pub mod trx;
pub mod types;

pub use lock::mode::{GapMode, LockMode};
pub use lock::page_events::RecMove;
pub use lock::prdt::Mbr;
pub use lock::{FifoPolicy, LockStats, LockStatus, LockSys, PriorityPolicy};
pub use sync::RwLatch;
pub use trx::{ImplicitLockProbe, IsolationLevel, Trx, TrxRegistry};
pub use types::{Block, HeapNo, Index, IndexId, PageId, TableId, TrxId};
