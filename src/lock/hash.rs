//! # Page-Keyed Lock Hash Tables
//!
//! Record locks are reachable from their page through an open hash table:
//! `fold(page_id)` picks a cell, and each cell holds the chain of locks
//! whose pages folded there, in insertion order. Insertion order is what
//! makes the chain double as the FIFO wait queue for every record on the
//! page, so the chain must never be reordered except through the explicit
//! queue operations.
//!
//! Three tables exist side by side: ordinary record locks, predicate
//! locks, and predicate page locks. A lock's `type_mode` decides which
//! table it lives in.
//!
//! The cell count is fixed at creation but can be changed online through
//! [`PageHash::resize`], which re-folds every chain under the global
//! latch while preserving relative order within each cell.

use smallvec::SmallVec;

use super::arena::{LockArena, LockRef};
use crate::types::PageId;

/// One open hash table keyed by page id.
pub struct PageHash {
    n_cells: usize,
    cells: Vec<Vec<LockRef>>,
}

impl PageHash {
    pub fn new(n_cells: usize) -> Self {
        debug_assert!(n_cells > 0);
        Self {
            n_cells,
            cells: (0..n_cells).map(|_| Vec::new()).collect(),
        }
    }

    pub fn n_cells(&self) -> usize {
        self.n_cells
    }

    #[inline(always)]
    fn cell_of(&self, page: PageId) -> usize {
        (page.fold() % self.n_cells as u64) as usize
    }

    /// Append a lock to the end of its page's chain.
    pub fn insert(&mut self, page: PageId, r: LockRef) {
        let cell = self.cell_of(page);
        self.cells[cell].push(r);
    }

    /// Insert a lock just before `before` in the chain. Used by the
    /// priority-transaction enqueue path; `before` must be present.
    pub fn insert_before(&mut self, page: PageId, r: LockRef, before: LockRef) {
        let cell = self.cell_of(page);
        let chain = &mut self.cells[cell];
        let pos = chain
            .iter()
            .position(|x| *x == before)
            .expect("insert_before anchor not in chain");
        chain.insert(pos, r);
    }

    /// Remove a lock from its page's chain.
    pub fn remove(&mut self, page: PageId, r: LockRef) {
        let cell = self.cell_of(page);
        let chain = &mut self.cells[cell];
        let pos = chain
            .iter()
            .position(|x| *x == r)
            .expect("removing a lock that is not in its hash chain");
        chain.remove(pos);
    }

    /// The page's lock chain in queue order. Locks of other pages that
    /// happen to share the cell are filtered out.
    pub fn chain(&self, arena: &LockArena, page: PageId) -> SmallVec<[LockRef; 16]> {
        let cell = self.cell_of(page);
        self.cells[cell]
            .iter()
            .copied()
            .filter(|r| arena[*r].page() == page)
            .collect()
    }

    /// Whether any lock exists on the page.
    pub fn any_on_page(&self, arena: &LockArena, page: PageId) -> bool {
        let cell = self.cell_of(page);
        self.cells[cell].iter().any(|r| arena[*r].page() == page)
    }

    /// Rebuild the table with a new cell count, re-folding every chain.
    /// Relative order of locks that end up in the same cell is preserved.
    pub fn resize(&mut self, arena: &LockArena, n_cells: usize) {
        debug_assert!(n_cells > 0);
        let old = std::mem::take(&mut self.cells);
        self.n_cells = n_cells;
        self.cells = (0..n_cells).map(|_| Vec::new()).collect();
        for chain in old {
            for r in chain {
                let page = arena[r].page();
                let cell = self.cell_of(page);
                self.cells[cell].push(r);
            }
        }
    }

    /// Every lock in the table, cell by cell.
    pub fn iter_all(&self) -> impl Iterator<Item = LockRef> + '_ {
        self.cells.iter().flat_map(|c| c.iter().copied())
    }
}
