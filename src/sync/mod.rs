//! # Low-Level Synchronization Primitives
//!
//! The one primitive that lives here is [`RwLatch`], a reader/updater/writer
//! lock whose whole state fits in a single 32-bit atomic word. It backs
//! short critical sections where a full OS mutex would be overkill and
//! where the *update* intermediate mode (concurrent with readers, exclusive
//! against other updaters and writers) is needed.

mod rw_latch;

pub use rw_latch::RwLatch;
