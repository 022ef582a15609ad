//! Counting reader/writer spinlock.
//!
//! A single 32-bit word encodes the whole lock state. Three acquisition
//! disciplines share that word; a given lock must only be exercised under
//! one discipline per call-site convention:
//!
//! - **Standard**: bit 31 is the single-writer flag, bits 0..=30 count
//!   readers. Readers keep their increment while waiting, so readers never
//!   starve each other; contended writers back their flag out and retry.
//! - **Shared** (multi-reader/writer): low 16 bits count readers, high 16
//!   bits count writers. Writers queue by count and admit themselves only
//!   when the word reads exactly one writer and zero readers.
//! - **Write-priority**: the shared encoding, but a reader that observes a
//!   writer undoes its increment before waiting, starving readers in favor
//!   of writer forward progress.
//!
//! Every wait loop spins with [`Backoff`] (spin then yield) and carries a
//! very large retry budget as a watchdog. Exhausting the budget is a
//! debug-mode diagnostic, never a failure: the primitives guarantee
//! progress when used correctly, so the watchdog only ever fires on a
//! protocol violation elsewhere.

use core::sync::atomic::{AtomicU32, Ordering};

use crossbeam_utils::Backoff;

use crate::guard::{
    ReadGuard, SharedReadGuard, SharedWriteGuard, WriteGuard, WritePriorityReadGuard,
    WritePriorityWriteGuard,
};

/// Single-writer flag of the standard discipline.
const WRITER_BIT: u32 = 0x8000_0000;
/// Reader count of the standard discipline.
const READER_MASK: u32 = !WRITER_BIT;

/// One writer in the shared and write-priority disciplines.
const SHARED_WRITE_UNIT: u32 = 0x0001_0000;
/// Writer half of the shared encodings.
const SHARED_WRITE_MASK: u32 = 0xFFFF_0000;
/// Reader half of the shared encodings.
const SHARED_READ_MASK: u32 = 0x0000_FFFF;

/// Watchdog budget for wait loops. Large enough that it only expires when
/// some other thread has violated the locking protocol.
const WATCHDOG_BUDGET: u64 = u32::MAX as u64;

/// A counting reader/writer spinlock in one 32-bit word.
///
/// The lock itself is plain data; pair it with the scoped guards from
/// [`crate::guard`] for release-on-drop semantics.
#[derive(Default)]
pub struct CountingSpinlock {
    state: AtomicU32,
}

impl CountingSpinlock {
    /// Creates an unlocked lock.
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
        }
    }

    /// Raw snapshot of the state word. Test and diagnostic use only.
    pub fn raw_state(&self) -> u32 {
        self.state.load(Ordering::Relaxed)
    }

    /// Spins until `ready` approves the state word.
    fn wait_until(&self, ready: impl Fn(u32) -> bool, site: &str) {
        let backoff = Backoff::new();
        let mut budget = WATCHDOG_BUDGET;
        while !ready(self.state.load(Ordering::Acquire)) {
            backoff.snooze();
            budget -= 1;
            if budget == 0 {
                debug_assert!(false, "CountingSpinlock::{site}: watchdog budget exhausted");
                budget = WATCHDOG_BUDGET;
            }
        }
    }

    // ------------------------------------------------------------------
    // Standard discipline
    // ------------------------------------------------------------------

    /// Acquires read access under the standard discipline.
    ///
    /// The reader count is bumped unconditionally; if a writer holds the
    /// word, the reader parks with its increment already reflected so a
    /// stream of later readers cannot starve it.
    pub fn acquire_read(&self) {
        let prev = self.state.fetch_add(1, Ordering::Acquire);
        if prev & WRITER_BIT != 0 {
            self.wait_until(|s| s & WRITER_BIT == 0, "acquire_read");
        }
    }

    /// Releases read access under the standard discipline.
    pub fn release_read(&self) {
        let prev = self.state.fetch_sub(1, Ordering::Release);
        debug_assert!(prev & READER_MASK != 0, "release_read without a reader");
    }

    /// Acquires exclusive write access under the standard discipline.
    pub fn acquire_write(&self) {
        let backoff = Backoff::new();
        let mut budget = WATCHDOG_BUDGET;
        loop {
            let prev = self.state.fetch_or(WRITER_BIT, Ordering::Acquire);
            if prev == 0 {
                return;
            }
            if prev & WRITER_BIT == 0 {
                // We flipped the flag but readers are still inside. Parked
                // readers keep their increments, so holding the flag here
                // would deadlock against them: back out and wait clean.
                self.state.fetch_and(READER_MASK, Ordering::Release);
            }
            self.wait_until(|s| s == 0, "acquire_write");
            backoff.spin();
            budget -= 1;
            if budget == 0 {
                debug_assert!(false, "CountingSpinlock::acquire_write: watchdog budget exhausted");
                budget = WATCHDOG_BUDGET;
            }
        }
    }

    /// Releases write access under the standard discipline.
    pub fn release_write(&self) {
        let prev = self.state.fetch_and(READER_MASK, Ordering::Release);
        debug_assert!(prev & WRITER_BIT != 0, "release_write without the writer flag");
    }

    /// Converts a held read lock into a write lock, in place.
    ///
    /// The fast path swaps the encodings atomically when this thread is
    /// the sole reader. Otherwise the read side is surrendered and the
    /// write side acquired cleanly; the caller must assume the lock was
    /// briefly released.
    pub fn convert_read_to_write(&self) {
        if self
            .state
            .compare_exchange(1, WRITER_BIT, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        self.release_read();
        self.acquire_write();
    }

    /// Converts a held write lock into a read lock, in place.
    pub fn convert_write_to_read(&self) {
        self.state.fetch_add(1, Ordering::Acquire);
        let prev = self.state.fetch_and(READER_MASK, Ordering::Release);
        debug_assert!(prev & WRITER_BIT != 0, "convert_write_to_read without the writer flag");
    }

    // ------------------------------------------------------------------
    // Shared (multi-reader/writer) discipline
    // ------------------------------------------------------------------

    /// Acquires read access under the shared discipline. The increment is
    /// kept while waiting for the writer half to drain.
    pub fn acquire_shared_read(&self) {
        let prev = self.state.fetch_add(1, Ordering::Acquire);
        if prev & SHARED_WRITE_MASK != 0 {
            self.wait_until(|s| s & SHARED_WRITE_MASK == 0, "acquire_shared_read");
        }
    }

    /// Releases read access under the shared discipline.
    pub fn release_shared_read(&self) {
        let prev = self.state.fetch_sub(1, Ordering::Release);
        debug_assert!(prev & SHARED_READ_MASK != 0, "release_shared_read without a reader");
    }

    /// Acquires exclusive write access under the shared discipline.
    ///
    /// Success requires the post-increment word to read exactly one
    /// writer and zero readers; anything else undoes the claim and waits
    /// for the word to clear before retrying.
    pub fn acquire_shared_write(&self) {
        let backoff = Backoff::new();
        let mut budget = WATCHDOG_BUDGET;
        loop {
            let next = self
                .state
                .fetch_add(SHARED_WRITE_UNIT, Ordering::Acquire)
                .wrapping_add(SHARED_WRITE_UNIT);
            if next == SHARED_WRITE_UNIT {
                return;
            }
            self.state.fetch_sub(SHARED_WRITE_UNIT, Ordering::Release);
            self.wait_until(|s| s == 0, "acquire_shared_write");
            backoff.spin();
            budget -= 1;
            if budget == 0 {
                debug_assert!(
                    false,
                    "CountingSpinlock::acquire_shared_write: watchdog budget exhausted"
                );
                budget = WATCHDOG_BUDGET;
            }
        }
    }

    /// Releases write access under the shared discipline.
    pub fn release_shared_write(&self) {
        let prev = self.state.fetch_sub(SHARED_WRITE_UNIT, Ordering::Release);
        debug_assert!(prev & SHARED_WRITE_MASK != 0, "release_shared_write without a writer");
    }

    /// Converts a held shared read lock into a shared write lock.
    ///
    /// Optimistically claims the writer half and drops the reader half;
    /// if any other reader or writer is present the claim is undone and
    /// the write side is acquired cleanly (the lock is briefly free).
    pub fn convert_shared_read_to_write(&self) {
        self.state.fetch_add(SHARED_WRITE_UNIT, Ordering::Acquire);
        let next = self.state.fetch_sub(1, Ordering::AcqRel).wrapping_sub(1);
        if next == SHARED_WRITE_UNIT {
            return;
        }
        self.state.fetch_sub(SHARED_WRITE_UNIT, Ordering::Release);
        self.acquire_shared_write();
    }

    /// Converts a held shared write lock into a shared read lock.
    pub fn convert_shared_write_to_read(&self) {
        self.state.fetch_add(1, Ordering::Acquire);
        let next = self
            .state
            .fetch_sub(SHARED_WRITE_UNIT, Ordering::AcqRel)
            .wrapping_sub(SHARED_WRITE_UNIT);
        if next & SHARED_WRITE_MASK != 0 {
            // Another writer while we held the write side violates the
            // discipline; wait it out rather than run under it.
            debug_assert!(false, "convert_shared_write_to_read: foreign writer present");
            self.wait_until(|s| s & SHARED_WRITE_MASK == 0, "convert_shared_write_to_read");
        }
    }

    // ------------------------------------------------------------------
    // Write-priority discipline
    // ------------------------------------------------------------------

    /// Acquires read access under the write-priority discipline. A reader
    /// that observes a writer undoes its increment before parking, so
    /// writers drain ahead of any reader backlog.
    pub fn acquire_write_priority_read(&self) {
        let backoff = Backoff::new();
        let mut budget = WATCHDOG_BUDGET;
        loop {
            let prev = self.state.fetch_add(1, Ordering::Acquire);
            if prev & SHARED_WRITE_MASK == 0 {
                return;
            }
            self.state.fetch_sub(1, Ordering::Release);
            self.wait_until(|s| s & SHARED_WRITE_MASK == 0, "acquire_write_priority_read");
            backoff.spin();
            budget -= 1;
            if budget == 0 {
                debug_assert!(
                    false,
                    "CountingSpinlock::acquire_write_priority_read: watchdog budget exhausted"
                );
                budget = WATCHDOG_BUDGET;
            }
        }
    }

    /// Releases read access under the write-priority discipline.
    pub fn release_write_priority_read(&self) {
        let prev = self.state.fetch_sub(1, Ordering::Release);
        debug_assert!(
            prev & SHARED_READ_MASK != 0,
            "release_write_priority_read without a reader"
        );
    }

    /// Acquires exclusive write access under the write-priority
    /// discipline. The first writer to claim the writer half keeps it and
    /// waits for readers to back out; later writers undo and queue.
    pub fn acquire_write_priority_write(&self) {
        let backoff = Backoff::new();
        let mut budget = WATCHDOG_BUDGET;
        loop {
            let next = self
                .state
                .fetch_add(SHARED_WRITE_UNIT, Ordering::Acquire)
                .wrapping_add(SHARED_WRITE_UNIT);
            if next == SHARED_WRITE_UNIT {
                return;
            }
            if next & SHARED_WRITE_MASK > SHARED_WRITE_UNIT {
                // Another writer is ahead of us; undo and wait our turn.
                self.state.fetch_sub(SHARED_WRITE_UNIT, Ordering::Release);
                self.wait_until(|s| s & SHARED_WRITE_MASK == 0, "acquire_write_priority_write");
            } else {
                // We are the sole writer; readers back out under this
                // discipline, so the reader half is guaranteed to drain.
                self.wait_until(|s| s & SHARED_READ_MASK == 0, "acquire_write_priority_write");
                return;
            }
            backoff.spin();
            budget -= 1;
            if budget == 0 {
                debug_assert!(
                    false,
                    "CountingSpinlock::acquire_write_priority_write: watchdog budget exhausted"
                );
                budget = WATCHDOG_BUDGET;
            }
        }
    }

    /// Releases write access under the write-priority discipline.
    pub fn release_write_priority_write(&self) {
        let prev = self.state.fetch_sub(SHARED_WRITE_UNIT, Ordering::Release);
        debug_assert!(
            prev & SHARED_WRITE_MASK != 0,
            "release_write_priority_write without a writer"
        );
    }

    /// Converts a held write-priority read lock into a write lock.
    pub fn convert_write_priority_read_to_write(&self) {
        let next = self
            .state
            .fetch_add(SHARED_WRITE_UNIT, Ordering::Acquire)
            .wrapping_add(SHARED_WRITE_UNIT);
        if next & SHARED_WRITE_MASK == SHARED_WRITE_UNIT {
            // Writer half is ours; drop our read claim and wait for the
            // remaining readers to back out.
            self.state.fetch_sub(1, Ordering::Release);
            self.wait_until(|s| s & SHARED_READ_MASK == 0, "convert_write_priority_read_to_write");
        } else {
            // Lost the writer race: undo both claims and queue normally.
            self.state.fetch_sub(SHARED_WRITE_UNIT, Ordering::Release);
            self.state.fetch_sub(1, Ordering::Release);
            self.acquire_write_priority_write();
        }
    }

    /// Converts a held write-priority write lock into a read lock.
    pub fn convert_write_priority_write_to_read(&self) {
        self.state.fetch_add(1, Ordering::Acquire);
        let next = self
            .state
            .fetch_sub(SHARED_WRITE_UNIT, Ordering::AcqRel)
            .wrapping_sub(SHARED_WRITE_UNIT);
        if next & SHARED_WRITE_MASK != 0 {
            // A writer slipped in; surrender the read claim and reacquire
            // through the normal reader path so it keeps its priority.
            self.state.fetch_sub(1, Ordering::Release);
            self.acquire_write_priority_read();
        }
    }

    // ------------------------------------------------------------------
    // Guard constructors
    // ------------------------------------------------------------------

    /// Scoped read lock, standard discipline.
    pub fn read(&self) -> ReadGuard<'_> {
        ReadGuard::new(self)
    }

    /// Scoped write lock, standard discipline.
    pub fn write(&self) -> WriteGuard<'_> {
        WriteGuard::new(self)
    }

    /// Scoped read lock, shared discipline.
    pub fn shared_read(&self) -> SharedReadGuard<'_> {
        SharedReadGuard::new(self)
    }

    /// Scoped write lock, shared discipline.
    pub fn shared_write(&self) -> SharedWriteGuard<'_> {
        SharedWriteGuard::new(self)
    }

    /// Scoped read lock, write-priority discipline.
    pub fn write_priority_read(&self) -> WritePriorityReadGuard<'_> {
        WritePriorityReadGuard::new(self)
    }

    /// Scoped write lock, write-priority discipline.
    pub fn write_priority_write(&self) -> WritePriorityWriteGuard<'_> {
        WritePriorityWriteGuard::new(self)
    }
}

impl core::fmt::Debug for CountingSpinlock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CountingSpinlock")
            .field("state", &format_args!("{:#010x}", self.raw_state()))
            .finish()
    }
}
