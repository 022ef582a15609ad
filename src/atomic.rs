//! Packed atomic head of the pool's free-page list.
//!
//! The head of the lock-free free-page list is not a pointer: it is a
//! single 64-bit word carrying the head page index, the index of the page
//! after it, and a rolling counter:
//!
//! ```text
//! bits  0..28   head page index
//! bits 28..56   next page index (the page after head)
//! bits 56..64   rolling ABA counter
//! ```
//!
//! The 8-bit counter makes head reuse detectable across up to 256
//! consecutive pushes, which is sufficient for the 28-bit page space and
//! the bounded number of producers this list serves. Page indices use
//! three reserved values near the top of the 28-bit range; a valid index
//! is always strictly below [`MAX_PAGES`].

use core::sync::atomic::{AtomicU64, Ordering};

/// Number of bits in a page index.
pub const PAGE_INDEX_BITS: u32 = 28;
const PAGE_INDEX_MASK: u64 = (1 << PAGE_INDEX_BITS) - 1;
const NEXT_SHIFT: u32 = PAGE_INDEX_BITS;
const COUNTER_SHIFT: u32 = 2 * PAGE_INDEX_BITS;

/// A page that is not on the free list.
pub const INVALID_PAGE: u32 = 0x0FFF_FFFF;
/// End-of-list sentinel.
pub const TAIL_PAGE: u32 = 0x0FFF_FFFE;
/// Transient marker for a page that is being pushed right now.
pub const SWAPPING_PAGE: u32 = 0x0FFF_FFFD;
/// Exclusive upper bound on valid page indices.
pub const MAX_PAGES: u32 = SWAPPING_PAGE;

/// Decoded value of the free-list head word.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct HeadSnapshot {
    /// Index of the first free page, or [`TAIL_PAGE`] when empty.
    pub head: u32,
    /// Index of the page after `head`, or [`TAIL_PAGE`].
    pub next: u32,
    /// Rolling ABA counter.
    pub counter: u8,
}

impl HeadSnapshot {
    /// Builds a snapshot from its fields.
    pub fn new(head: u32, next: u32, counter: u8) -> Self {
        debug_assert!(head as u64 <= PAGE_INDEX_MASK);
        debug_assert!(next as u64 <= PAGE_INDEX_MASK);
        Self { head, next, counter }
    }

    /// True when the list is empty.
    pub fn is_empty(&self) -> bool {
        self.head == TAIL_PAGE
    }

    fn pack(self) -> u64 {
        (u64::from(self.counter) << COUNTER_SHIFT)
            | (u64::from(self.next) << NEXT_SHIFT)
            | u64::from(self.head)
    }

    fn unpack(word: u64) -> Self {
        Self {
            head: (word & PAGE_INDEX_MASK) as u32,
            next: ((word >> NEXT_SHIFT) & PAGE_INDEX_MASK) as u32,
            counter: (word >> COUNTER_SHIFT) as u8,
        }
    }
}

/// The free-list head word.
pub struct FreeListHead {
    word: AtomicU64,
}

impl FreeListHead {
    const EMPTY: u64 =
        ((TAIL_PAGE as u64) << NEXT_SHIFT) | TAIL_PAGE as u64;

    /// Creates an empty-list head.
    pub const fn new() -> Self {
        Self {
            word: AtomicU64::new(Self::EMPTY),
        }
    }

    /// Loads and decodes the head word.
    pub fn load(&self, order: Ordering) -> HeadSnapshot {
        HeadSnapshot::unpack(self.word.load(order))
    }

    /// Replaces `current` with `new` if the word has not moved.
    ///
    /// On failure the freshly observed snapshot is returned, mirroring
    /// `AtomicU64::compare_exchange`.
    pub fn compare_exchange(
        &self,
        current: HeadSnapshot,
        new: HeadSnapshot,
        success: Ordering,
        failure: Ordering,
    ) -> Result<(), HeadSnapshot> {
        self.word
            .compare_exchange(current.pack(), new.pack(), success, failure)
            .map(|_| ())
            .map_err(HeadSnapshot::unpack)
    }

    /// Resets the word to the empty-list value. Quiescent use only.
    pub fn reset(&self) {
        self.word.store(Self::EMPTY, Ordering::Relaxed);
    }
}

impl Default for FreeListHead {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for FreeListHead {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.load(Ordering::Relaxed).fmt(f)
    }
}
