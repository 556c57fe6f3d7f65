//! # Single-Word Reader/Updater/Writer Latch
//!
//! All state is encoded in one `AtomicU32`:
//!
//! ```text
//! Bit 31: WRITER          - exclusive lock held
//! Bit 30: WRITER_WAITING  - a would-be writer has announced itself
//! Bit 29: UPDATER         - update lock held (coexists with readers)
//! Bits 0-28: shared reader count
//! ```
//!
//! Valid held states are: exactly `WRITER` (plus possibly
//! `WRITER_WAITING`), `UPDATER` with any number of readers, or a plain
//! reader count. `WRITER` never coexists with `UPDATER` or with a nonzero
//! reader count.
//!
//! The latch itself never blocks: every acquisition is a try-operation,
//! and a waiting writer drives [`RwLatch::write_lock_poll`] from its own
//! backoff loop. Release paths report whether a waiting writer may now be
//! able to proceed so callers know when to re-poll.

use std::sync::atomic::{AtomicU32, Ordering};

const UNLOCKED: u32 = 0;
const WRITER: u32 = 1 << 31;
const WRITER_WAITING: u32 = 1 << 30;
const WRITER_PENDING: u32 = WRITER | WRITER_WAITING;
const UPDATER: u32 = 1 << 29;

/// Simple read-update-write latch based on a single atomic word.
#[derive(Debug)]
pub struct RwLatch {
    lock: AtomicU32,
}

impl Default for RwLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl RwLatch {
    pub const fn new() -> Self {
        Self {
            lock: AtomicU32::new(UNLOCKED),
        }
    }

    /// Announce the start of an exclusive-lock wait.
    ///
    /// Returns the lock word as it was before the flag was set.
    pub fn write_lock_wait_start(&self) -> u32 {
        self.lock.fetch_or(WRITER_WAITING, Ordering::Relaxed)
    }

    /// One attempt to convert `WRITER_WAITING` into `WRITER`.
    ///
    /// `l` carries the expected word in and the observed word out, so a
    /// caller's retry loop can inspect why the attempt failed.
    pub fn write_lock_wait_try(&self, l: &mut u32) -> bool {
        match self
            .lock
            .compare_exchange(*l, WRITER, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => true,
            Err(seen) => {
                *l = seen;
                false
            }
        }
    }

    /// One round of waiting for an exclusive lock: try to take over from
    /// the `WRITER_WAITING` state, re-asserting the flag if some other
    /// writer consumed it out of turn.
    pub fn write_lock_poll(&self) -> bool {
        let mut l = WRITER_WAITING;
        if self.write_lock_wait_try(&mut l) {
            return true;
        }
        if l & WRITER_WAITING == 0 {
            // Another thread's write_lock() cleared the flag; put it back.
            self.write_lock_wait_start();
        }
        false
    }

    #[inline]
    fn read_trylock_low(&self, prioritize_updater: bool) -> bool {
        let mut l = UNLOCKED;
        loop {
            match self
                .lock
                .compare_exchange(l, l + 1, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(seen) => {
                    l = seen;
                    debug_assert!(l & WRITER == 0 || l & !WRITER_PENDING == 0);
                    debug_assert!(l & !(WRITER_PENDING | UPDATER) < UPDATER);
                    let blocked = if prioritize_updater {
                        l & WRITER != 0 || l & (WRITER_WAITING | UPDATER) == WRITER_WAITING
                    } else {
                        l & WRITER_PENDING != 0
                    };
                    if blocked {
                        return false;
                    }
                }
            }
        }
    }

    /// Try to acquire a shared lock.
    pub fn read_trylock(&self) -> bool {
        self.read_trylock_low(false)
    }

    /// Try to acquire a shared lock, ignoring `WRITER_WAITING` as long as
    /// an updater holds the latch. The updater will need the readers to
    /// drain before it can upgrade, so starving them behind a pending
    /// writer could deadlock the upgrade path.
    pub fn read_trylock_prioritize_updater(&self) -> bool {
        self.read_trylock_low(true)
    }

    /// Try to acquire an update lock.
    pub fn update_trylock(&self) -> bool {
        let mut l = UNLOCKED;
        loop {
            match self
                .lock
                .compare_exchange(l, l | UPDATER, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(seen) => {
                    l = seen;
                    debug_assert!(l & WRITER == 0 || l & !WRITER_PENDING == 0);
                    debug_assert!(l & !(WRITER_PENDING | UPDATER) < UPDATER);
                    if l & (WRITER_PENDING | UPDATER) != 0 {
                        return false;
                    }
                }
            }
        }
    }

    /// Try to upgrade a held update lock to an exclusive lock. Fails while
    /// readers remain; tolerates a concurrent `WRITER_WAITING` flag.
    pub fn upgrade_trylock(&self) -> bool {
        let mut l = UPDATER;
        loop {
            match self.lock.compare_exchange(
                l,
                l ^ (WRITER | UPDATER),
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    debug_assert!(l & !WRITER_WAITING == UPDATER);
                    return true;
                }
                Err(seen) => {
                    l = seen;
                    debug_assert!(l & (WRITER | UPDATER) == UPDATER);
                    if l & !(WRITER_WAITING | UPDATER) != 0 {
                        return false;
                    }
                }
            }
        }
    }

    /// Try to acquire an exclusive lock. Succeeds only from the fully
    /// unlocked state.
    pub fn write_trylock(&self) -> bool {
        self.lock
            .compare_exchange(UNLOCKED, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Release a shared lock.
    ///
    /// Returns whether this was the last holder apart from a possibly
    /// pending writer, i.e. whether waiting writers should be woken.
    pub fn read_unlock(&self) -> bool {
        let l = self.lock.fetch_sub(1, Ordering::Release);
        debug_assert!(l & !(WRITER_PENDING | UPDATER) != 0); // at least one reader
        debug_assert!(l & WRITER == 0); // no writer may coexist with readers
        l & !WRITER_PENDING == 1
    }

    /// Release an update lock.
    pub fn update_unlock(&self) {
        let l = self.lock.fetch_and(!UPDATER, Ordering::Release);
        debug_assert!(l & (WRITER | UPDATER) == UPDATER);
        let _ = l;
    }

    /// Release an exclusive lock.
    pub fn write_unlock(&self) {
        let l = self.lock.fetch_and(!WRITER, Ordering::Release);
        debug_assert!(l & (WRITER | UPDATER) == WRITER);
        let _ = l;
    }

    /// Whether an exclusive lock is held by some thread.
    pub fn is_write_locked(&self) -> bool {
        self.lock.load(Ordering::Relaxed) & WRITER != 0
    }

    /// Whether an update lock is held by some thread.
    pub fn is_update_locked(&self) -> bool {
        self.lock.load(Ordering::Relaxed) & UPDATER != 0
    }

    /// Whether a shared lock is held by some thread.
    pub fn is_read_locked(&self) -> bool {
        let l = self.lock.load(Ordering::Relaxed);
        l & !WRITER_PENDING != 0 && l & WRITER == 0
    }

    /// Whether any lock is held or waited for.
    pub fn is_locked_or_waiting(&self) -> bool {
        self.lock.load(Ordering::Relaxed) != 0
    }

    /// Whether any lock is held.
    pub fn is_locked(&self) -> bool {
        self.lock.load(Ordering::Relaxed) & !WRITER_WAITING != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn shared_locks_stack() {
        let l = RwLatch::new();
        assert!(l.read_trylock());
        assert!(l.read_trylock());
        assert!(l.is_read_locked());
        assert!(!l.write_trylock());
        assert!(!l.read_unlock());
        assert!(l.read_unlock());
        assert!(!l.is_locked());
    }

    #[test]
    fn writer_excludes_everyone() {
        let l = RwLatch::new();
        assert!(l.write_trylock());
        assert!(l.is_write_locked());
        assert!(!l.read_trylock());
        assert!(!l.update_trylock());
        assert!(!l.write_trylock());
        l.write_unlock();
        assert!(l.read_trylock());
        assert!(l.read_unlock());
    }

    #[test]
    fn updater_coexists_with_readers() {
        let l = RwLatch::new();
        assert!(l.update_trylock());
        assert!(l.read_trylock());
        assert!(!l.update_trylock());
        assert!(!l.write_trylock());
        // Upgrade must wait for the reader to drain.
        assert!(!l.upgrade_trylock());
        assert!(!l.read_unlock()); // updater still holds the latch
        assert!(l.upgrade_trylock());
        assert!(l.is_write_locked());
        assert!(!l.is_update_locked());
        l.write_unlock();
    }

    #[test]
    fn pending_writer_blocks_new_readers() {
        let l = RwLatch::new();
        assert!(l.read_trylock());
        l.write_lock_wait_start();
        assert!(!l.read_trylock());
        // With an updater present the prioritized variant still admits
        // readers past WRITER_WAITING; without one it does not.
        assert!(!l.read_trylock_prioritize_updater());
        assert!(l.read_unlock());
        assert!(l.write_lock_poll());
        l.write_unlock();
    }

    #[test]
    fn prioritize_updater_admits_reader_under_updater() {
        let l = RwLatch::new();
        assert!(l.update_trylock());
        l.write_lock_wait_start();
        assert!(!l.read_trylock());
        assert!(l.read_trylock_prioritize_updater());
        assert!(!l.read_unlock()); // updater still holds the latch
        l.update_unlock();
    }

    #[test]
    fn waiting_flag_reasserted_when_cleared_out_of_turn() {
        let l = RwLatch::new();
        l.write_lock_wait_start();
        // A barging writer takes the whole word, clearing WRITER_WAITING.
        l.lock.store(WRITER, Ordering::Relaxed);
        assert!(!l.write_lock_poll());
        assert!(l.lock.load(Ordering::Relaxed) & WRITER_WAITING != 0);
        l.lock.store(WRITER_WAITING, Ordering::Relaxed);
        assert!(l.write_lock_poll());
        l.write_unlock();
    }

    #[test]
    fn concurrent_readers_and_writer_never_overlap() {
        let l = Arc::new(RwLatch::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let l = Arc::clone(&l);
            handles.push(thread::spawn(move || {
                for _ in 0..10_000 {
                    if l.read_trylock() {
                        assert!(!l.is_write_locked());
                        l.read_unlock();
                    }
                }
            }));
        }
        for _ in 0..2 {
            let l = Arc::clone(&l);
            handles.push(thread::spawn(move || {
                for _ in 0..10_000 {
                    if l.write_trylock() {
                        assert!(l.is_write_locked());
                        l.write_unlock();
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(!l.is_locked_or_waiting());
    }
}
