//! # Predicate Locks
//!
//! Spatial indexes cannot use gap locks: there is no total order of
//! records, so "the gap before a record" is meaningless. Instead a range
//! is locked by its minimum bounding rectangle, anchored on the page
//! infimum, and two predicate locks conflict only when their rectangles
//! intersect (and the modes do).
//!
//! Page-level predicate locks (`PRDT_PAGE`) pin a whole page during
//! splits; they have no rectangle of their own.

use super::mode::TypeMode;
use super::object::Lock;
use crate::trx::Trx;

/// Minimum bounding rectangle of a spatial predicate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mbr {
    pub xmin: f64,
    pub xmax: f64,
    pub ymin: f64,
    pub ymax: f64,
}

impl Mbr {
    pub fn new(xmin: f64, xmax: f64, ymin: f64, ymax: f64) -> Self {
        debug_assert!(xmin <= xmax && ymin <= ymax);
        Self {
            xmin,
            xmax,
            ymin,
            ymax,
        }
    }

    /// Closed-interval intersection test.
    pub fn intersects(&self, other: &Mbr) -> bool {
        self.xmin <= other.xmax
            && other.xmin <= self.xmax
            && self.ymin <= other.ymax
            && other.ymin <= self.ymax
    }
}

/// Does a predicate lock request have to wait for `lock2`?
///
/// Same shape as the record-lock rule, with rectangle intersection in
/// place of the gap rules: insert-intention requests never block each
/// other, nothing waits for an insert-intention lock, and disjoint
/// rectangles never conflict.
pub(crate) fn prdt_has_to_wait(
    trx: &Trx,
    type_mode: TypeMode,
    prdt: &Mbr,
    lock2: &Lock,
) -> bool {
    debug_assert!(!lock2.is_table());

    if trx.id() == lock2.trx || type_mode.mode().compatible(lock2.mode()) {
        return false;
    }

    if lock2.type_mode.is_insert_intention() {
        return false;
    }

    if type_mode.is_prdt_page() || lock2.type_mode.is_prdt_page() {
        // Page predicate locks conflict on the page as a whole.
        return true;
    }

    match lock2.prdt() {
        Some(other) => prdt.intersects(other),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::mode::{type_flags, LockMode, TypeMode};
    use crate::trx::{IsolationLevel, TrxRegistry};
    use crate::types::{Index, PageId};

    fn mbr(x0: f64, x1: f64) -> Mbr {
        Mbr::new(x0, x1, 0.0, 1.0)
    }

    #[test]
    fn disjoint_rectangles_do_not_conflict() {
        let reg = TrxRegistry::new();
        let t1 = reg.begin(IsolationLevel::RepeatableRead);
        let t2 = reg.begin(IsolationLevel::RepeatableRead);
        let held = Lock::new_prdt(
            t2.id(),
            TypeMode::new(LockMode::Shared).with(type_flags::PREDICATE),
            PageId::new(0, 1),
            Index::spatial(9, 3),
            mbr(0.0, 1.0),
        );
        let req = TypeMode::new(LockMode::Exclusive).with(type_flags::PREDICATE);
        assert!(!prdt_has_to_wait(&t1, req, &mbr(2.0, 3.0), &held));
        assert!(prdt_has_to_wait(&t1, req, &mbr(0.5, 2.5), &held));
    }

    #[test]
    fn same_trx_never_waits() {
        let reg = TrxRegistry::new();
        let t1 = reg.begin(IsolationLevel::RepeatableRead);
        let held = Lock::new_prdt(
            t1.id(),
            TypeMode::new(LockMode::Exclusive).with(type_flags::PREDICATE),
            PageId::new(0, 1),
            Index::spatial(9, 3),
            mbr(0.0, 1.0),
        );
        let req = TypeMode::new(LockMode::Exclusive).with(type_flags::PREDICATE);
        assert!(!prdt_has_to_wait(&t1, req, &mbr(0.0, 1.0), &held));
    }

    #[test]
    fn nothing_waits_for_insert_intention() {
        let reg = TrxRegistry::new();
        let t1 = reg.begin(IsolationLevel::RepeatableRead);
        let t2 = reg.begin(IsolationLevel::RepeatableRead);
        let held = Lock::new_prdt(
            t2.id(),
            TypeMode::new(LockMode::Exclusive)
                .with(type_flags::PREDICATE | type_flags::INSERT_INTENTION),
            PageId::new(0, 1),
            Index::spatial(9, 3),
            mbr(0.0, 1.0),
        );
        let req = TypeMode::new(LockMode::Shared).with(type_flags::PREDICATE);
        assert!(!prdt_has_to_wait(&t1, req, &mbr(0.0, 1.0), &held));
    }
}
