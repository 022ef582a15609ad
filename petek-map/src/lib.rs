//! Concurrent sharded hash map over the petek substrates.
//!
//! # Architecture
//!
//! - **Shards**: the map splits into a power-of-two number of independent
//!   sub-maps, each with its own bucket table and its own reader/writer
//!   spinlock. The low bits of the 64-bit key hash pick the shard.
//! - **Buckets**: each bucket heads an intrusive singly linked list of
//!   nodes; inserts go to the head so readers can race past them safely.
//! - **Pooled nodes**: all shards share one paging pool, so node
//!   addresses are stable for the life of the entry and iteration walks
//!   the pool instead of the tables.
//! - **Rekey**: entries can be re-indexed under a new key without
//!   reallocating; a sentinel on the node's bucket backpointer keeps
//!   concurrent erasers from destroying the node mid-move.
//!
//! # Operating disciplines
//!
//! Every operation exists twice: the concurrent form takes `&self` and
//! locks the shard it touches; the `_unsync` form takes `&mut self` as
//! proof of external mutual exclusion and skips the locks.
//!
//! # Example
//!
//! ```rust
//! use petek_map::ShardedMap;
//!
//! let map = ShardedMap::new();
//! for i in 0..100u64 {
//!     map.insert(i, i * 2);
//! }
//! assert_eq!(map.len(), 100);
//! assert_eq!(map.get(&40), Some(80));
//! map.update(&40, |v| *v += 1);
//! assert_eq!(map.get(&40), Some(81));
//! ```

#![warn(missing_docs)]

mod list;
mod shard;
mod map;

pub use map::{Iter, ShardedMap, DEFAULT_PAGE_SLOTS, DEFAULT_SHARDS};
