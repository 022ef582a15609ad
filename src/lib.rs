//! Petek: spinlock and pool substrates for concurrent containers
//!
//! Petek provides the low-level building blocks used by the sharded hash
//! map in `petek-map`: a counting reader/writer spinlock whose single
//! 32-bit word supports three acquisition disciplines, scoped guards with
//! in-place read/write conversion, and a pair of slab-style object pools —
//! a fixed-capacity bitmap pool and a paged pool with a lock-free,
//! ABA-guarded free-page list.
//!
//! # Key Properties
//!
//! - **No hidden blocking**: every wait is a spin with a yield hint; there
//!   is no OS mutex, no async runtime, no I/O.
//! - **Stable value addresses**: pools construct values in place and never
//!   move them; pages are freed only wholesale on clear/drop.
//! - **Reader priority by default**: readers keep their count while
//!   waiting, writers back out; an explicit write-priority discipline is
//!   available where writer progress matters more.
//!
//! # Example
//!
//! ```rust
//! use petek::{CountingSpinlock, PagingPool};
//!
//! let lock = CountingSpinlock::new();
//! {
//!     let _read = lock.shared_read();
//!     // ... shared section ...
//! }
//!
//! let pool = PagingPool::new(8);
//! let ptr = pool.reserve(42u64).unwrap();
//! assert_eq!(unsafe { *ptr }, 42);
//! unsafe { pool.release(ptr) };
//! ```

#![warn(missing_docs)]

pub mod atomic;
pub mod fixed_pool;
pub mod guard;
pub mod paging_pool;
pub mod spinlock;
pub mod utils;

pub use atomic::{FreeListHead, HeadSnapshot, INVALID_PAGE, MAX_PAGES, TAIL_PAGE};
pub use fixed_pool::FixedSlotPool;
pub use guard::{
    ReadGuard, SharedReadGuard, SharedWriteGuard, WriteGuard, WritePriorityReadGuard,
    WritePriorityWriteGuard,
};
pub use paging_pool::PagingPool;
pub use spinlock::CountingSpinlock;
pub use utils::CacheAligned;
