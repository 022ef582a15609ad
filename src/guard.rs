//! Scoped RAII guards for [`CountingSpinlock`].
//!
//! One guard type exists per (discipline, direction) pair. A guard holds a
//! reference to its lock and releases it on drop. Transfers between the
//! read and write directions of the same discipline go through
//! `upgrade`/`downgrade`, which perform the lock's in-place conversion and
//! disarm the source guard; same-type hand-off is an ordinary Rust move.
//!
//! Upgrading is not atomic when other holders are present: the conversion
//! may briefly release the lock before reacquiring the target direction
//! (see [`CountingSpinlock::convert_read_to_write`]), so state observed
//! before an upgrade must be revalidated after it.

use core::mem;

use crate::spinlock::CountingSpinlock;

macro_rules! scoped_guard {
    ($(#[$doc:meta])* $name:ident, $acquire:ident, $release:ident) => {
        $(#[$doc])*
        #[must_use = "the lock is released as soon as the guard is dropped"]
        pub struct $name<'a> {
            lock: &'a CountingSpinlock,
        }

        impl<'a> $name<'a> {
            /// Acquires the lock and wraps it in a scoped guard.
            pub fn new(lock: &'a CountingSpinlock) -> Self {
                lock.$acquire();
                Self { lock }
            }

            /// Wraps a lock that is already held in the matching
            /// direction, without acquiring it again.
            ///
            /// # Safety
            ///
            /// The caller must hold `lock` in this guard's direction and
            /// discipline, and must not release it by any path other than
            /// dropping the returned guard.
            pub unsafe fn adopt(lock: &'a CountingSpinlock) -> Self {
                Self { lock }
            }

            fn disarm(self) -> &'a CountingSpinlock {
                let lock = self.lock;
                mem::forget(self);
                lock
            }
        }

        impl Drop for $name<'_> {
            fn drop(&mut self) {
                self.lock.$release();
            }
        }
    };
}

scoped_guard!(
    /// Read lock, standard discipline.
    ReadGuard,
    acquire_read,
    release_read
);
scoped_guard!(
    /// Write lock, standard discipline.
    WriteGuard,
    acquire_write,
    release_write
);
scoped_guard!(
    /// Read lock, shared (multi-reader/writer) discipline.
    SharedReadGuard,
    acquire_shared_read,
    release_shared_read
);
scoped_guard!(
    /// Write lock, shared (multi-reader/writer) discipline.
    SharedWriteGuard,
    acquire_shared_write,
    release_shared_write
);
scoped_guard!(
    /// Read lock, write-priority discipline.
    WritePriorityReadGuard,
    acquire_write_priority_read,
    release_write_priority_read
);
scoped_guard!(
    /// Write lock, write-priority discipline.
    WritePriorityWriteGuard,
    acquire_write_priority_write,
    release_write_priority_write
);

impl<'a> ReadGuard<'a> {
    /// Converts this read lock into a write lock on the same word.
    pub fn upgrade(self) -> WriteGuard<'a> {
        let lock = self.disarm();
        lock.convert_read_to_write();
        // SAFETY: the conversion left the lock held for writing.
        unsafe { WriteGuard::adopt(lock) }
    }
}

impl<'a> WriteGuard<'a> {
    /// Converts this write lock into a read lock on the same word.
    pub fn downgrade(self) -> ReadGuard<'a> {
        let lock = self.disarm();
        lock.convert_write_to_read();
        // SAFETY: the conversion left the lock held for reading.
        unsafe { ReadGuard::adopt(lock) }
    }
}

impl<'a> SharedReadGuard<'a> {
    /// Converts this shared read lock into a shared write lock.
    pub fn upgrade(self) -> SharedWriteGuard<'a> {
        let lock = self.disarm();
        lock.convert_shared_read_to_write();
        // SAFETY: the conversion left the lock held for writing.
        unsafe { SharedWriteGuard::adopt(lock) }
    }
}

impl<'a> SharedWriteGuard<'a> {
    /// Converts this shared write lock into a shared read lock.
    pub fn downgrade(self) -> SharedReadGuard<'a> {
        let lock = self.disarm();
        lock.convert_shared_write_to_read();
        // SAFETY: the conversion left the lock held for reading.
        unsafe { SharedReadGuard::adopt(lock) }
    }
}

impl<'a> WritePriorityReadGuard<'a> {
    /// Converts this write-priority read lock into a write lock.
    pub fn upgrade(self) -> WritePriorityWriteGuard<'a> {
        let lock = self.disarm();
        lock.convert_write_priority_read_to_write();
        // SAFETY: the conversion left the lock held for writing.
        unsafe { WritePriorityWriteGuard::adopt(lock) }
    }
}

impl<'a> WritePriorityWriteGuard<'a> {
    /// Converts this write-priority write lock into a read lock.
    pub fn downgrade(self) -> WritePriorityReadGuard<'a> {
        let lock = self.disarm();
        lock.convert_write_priority_write_to_read();
        // SAFETY: the conversion left the lock held for reading.
        unsafe { WritePriorityReadGuard::adopt(lock) }
    }
}
