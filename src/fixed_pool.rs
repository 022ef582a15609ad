//! Fixed-capacity slot pool with bitmap allocation.
//!
//! Storage is a flat array of raw slots plus one allocation bit per slot.
//! Reserving probes the bitmap from a rotating hint and claims a slot with
//! an atomic fetch-or; releasing drops the value in place and clears the
//! bit. The pool never moves a value once constructed, so pointers handed
//! out by [`FixedSlotPool::reserve`] stay valid until the matching
//! [`FixedSlotPool::release`].
//!
//! Capacity is rounded up to a power of two at construction.

use core::cell::UnsafeCell;
use core::mem::{self, MaybeUninit};
use core::ptr;
use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use crate::utils::{round_up_pow2, CacheAligned};

/// A pool of up to `capacity` inline slots for values of type `T`.
pub struct FixedSlotPool<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    bitmap: Box<[AtomicU8]>,
    live: CacheAligned<AtomicU32>,
    /// Rotating probe start; purely a hint, raced on without harm.
    probe_hint: AtomicU32,
}

// SAFETY: slots are distributed across threads by the bitmap claim; a slot
// is touched only by the thread that owns its set bit.
unsafe impl<T: Send> Send for FixedSlotPool<T> {}
unsafe impl<T: Send> Sync for FixedSlotPool<T> {}

impl<T> FixedSlotPool<T> {
    /// Creates a pool holding `capacity` slots (rounded up to a power of
    /// two).
    pub fn new(capacity: usize) -> Self {
        assert!(mem::size_of::<T>() != 0, "FixedSlotPool does not support zero-sized types");
        let capacity = round_up_pow2(capacity);
        assert!(capacity <= u32::MAX as usize, "FixedSlotPool capacity overflows u32");

        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();
        let bitmap = (0..capacity.div_ceil(8)).map(|_| AtomicU8::new(0)).collect();

        Self {
            slots,
            bitmap,
            live: CacheAligned::new(AtomicU32::new(0)),
            probe_hint: AtomicU32::new(0),
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Number of live values.
    pub fn len(&self) -> u32 {
        self.live.load(Ordering::Relaxed)
    }

    /// True when no slot is allocated.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when every slot is allocated.
    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// True when at least one slot is free.
    pub fn has_free_space(&self) -> bool {
        !self.is_full()
    }

    /// Whether the bit for `index` is currently set.
    pub fn is_allocated(&self, index: u32) -> bool {
        if index >= self.capacity() {
            return false;
        }
        let byte = self.bitmap[(index / 8) as usize].load(Ordering::Acquire);
        byte & (1 << (index % 8)) != 0
    }

    /// Atomically sets the bit for `index`. Returns false when another
    /// thread got there first.
    fn try_claim(&self, index: u32) -> bool {
        let mask = 1u8 << (index % 8);
        let prev = self.bitmap[(index / 8) as usize].fetch_or(mask, Ordering::Acquire);
        prev & mask == 0
    }

    /// Atomically clears the bit for `index`. Returns false when the bit
    /// was already clear.
    fn try_unclaim(&self, index: u32) -> bool {
        let mask = 1u8 << (index % 8);
        let prev = self.bitmap[(index / 8) as usize].fetch_and(!mask, Ordering::Release);
        prev & mask != 0
    }

    /// Recovers the slot index behind `ptr`, verifying that it lies
    /// inside this pool's storage and on a slot boundary.
    pub fn index_of(&self, ptr: *const T) -> Option<u32> {
        let base = self.slots.as_ptr() as usize;
        let addr = ptr as usize;
        let offset = addr.wrapping_sub(base);
        let size = mem::size_of::<UnsafeCell<MaybeUninit<T>>>();
        if addr < base || offset >= size * self.slots.len() || offset % size != 0 {
            return None;
        }
        Some((offset / size) as u32)
    }

    /// Pointer to the live value in `index`, if any.
    pub fn get(&self, index: u32) -> Option<*mut T> {
        if self.is_allocated(index) {
            Some(self.slot_ptr(index))
        } else {
            None
        }
    }

    fn slot_ptr(&self, index: u32) -> *mut T {
        self.slots[index as usize].get() as *mut T
    }

    /// Moves `value` into the first free slot found from the rotating
    /// hint. On a full pool the value is handed back.
    pub fn reserve(&self, value: T) -> Result<*mut T, T> {
        let capacity = self.capacity();
        let mut index = self.probe_hint.load(Ordering::Relaxed);
        for _ in 0..capacity {
            if index >= capacity {
                index = 0;
            }
            if self.live.load(Ordering::Relaxed) >= capacity {
                break;
            }
            if !self.is_allocated(index) && self.try_claim(index) {
                self.probe_hint.store(index + 1, Ordering::Relaxed);
                let slot = self.slot_ptr(index);
                // SAFETY: the claimed bit gives us exclusive ownership of
                // the slot, and the previous occupant (if any) was dropped
                // before its bit was cleared.
                unsafe { slot.write(value) };
                self.live.fetch_add(1, Ordering::Relaxed);
                return Ok(slot);
            }
            index += 1;
        }
        Err(value)
    }

    /// Drops the value behind `ptr` and frees its slot.
    ///
    /// Returns false when `ptr` does not belong to this pool or the slot
    /// is not allocated; the latter is a double release and raises a
    /// diagnostic in debug builds.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`FixedSlotPool::reserve`] on this
    /// pool and must not be used again after this call. No other thread
    /// may be accessing the value.
    pub unsafe fn release(&self, ptr: *const T) -> bool {
        let Some(index) = self.index_of(ptr) else {
            return false;
        };
        if !self.is_allocated(index) {
            debug_assert!(false, "FixedSlotPool::release: slot {index} is not allocated");
            return false;
        }
        // SAFETY: per contract the caller owns the value and nobody else
        // touches the slot until the bit below is cleared.
        unsafe { ptr::drop_in_place(ptr as *mut T) };
        let released = self.try_unclaim(index);
        debug_assert!(released, "FixedSlotPool::release: double free of slot {index}");
        if released {
            self.live.fetch_sub(1, Ordering::Relaxed);
        }
        released
    }

    /// Drops every live value and clears the bitmap.
    pub fn clear(&mut self) {
        for index in 0..self.capacity() {
            if self.is_allocated(index) {
                // SAFETY: `&mut self` means no slot is shared; the bit
                // says the slot holds a live value.
                unsafe { ptr::drop_in_place(self.slot_ptr(index)) };
            }
        }
        for byte in self.bitmap.iter() {
            byte.store(0, Ordering::Relaxed);
        }
        self.live.store(0, Ordering::Relaxed);
        self.probe_hint.store(0, Ordering::Relaxed);
    }

    /// Iterates over pointers to the live values.
    ///
    /// The iterator is not stable under mutation; only use it while the
    /// pool is quiescent.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter { pool: self, index: 0 }
    }
}

impl<T> Drop for FixedSlotPool<T> {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Iterator over the live slots of a [`FixedSlotPool`].
pub struct Iter<'a, T> {
    pool: &'a FixedSlotPool<T>,
    index: u32,
}

impl<T> Iterator for Iter<'_, T> {
    type Item = *mut T;

    fn next(&mut self) -> Option<Self::Item> {
        while self.index < self.pool.capacity() {
            let index = self.index;
            self.index += 1;
            if self.pool.is_allocated(index) {
                return Some(self.pool.slot_ptr(index));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn reserve_until_full_then_release() {
        let pool = FixedSlotPool::new(8);
        assert_eq!(pool.capacity(), 8);

        let mut ptrs = vec![];
        for i in 0..8u64 {
            ptrs.push(pool.reserve(i).unwrap());
        }
        assert!(pool.is_full());
        assert_eq!(pool.reserve(99).unwrap_err(), 99);

        for (i, ptr) in ptrs.iter().enumerate() {
            assert_eq!(unsafe { **ptr }, i as u64);
        }

        assert!(unsafe { pool.release(ptrs[3]) });
        assert_eq!(pool.len(), 7);
        assert!(pool.has_free_space());

        // The freed slot is reusable.
        let ptr = pool.reserve(42u64).unwrap();
        assert_eq!(unsafe { *ptr }, 42);
        assert!(pool.is_full());
    }

    #[test]
    fn capacity_rounds_up() {
        let pool = FixedSlotPool::<u64>::new(5);
        assert_eq!(pool.capacity(), 8);
    }

    #[test]
    fn index_of_rejects_foreign_pointers() {
        let pool = FixedSlotPool::<u64>::new(4);
        let outside = 7u64;
        assert_eq!(pool.index_of(&outside), None);

        let inside = pool.reserve(1).unwrap();
        let index = pool.index_of(inside).unwrap();
        assert!(pool.is_allocated(index));
        assert_eq!(pool.get(index), Some(inside));
        assert_eq!(pool.get(index + 1), None);
        assert_eq!(pool.get(999), None);

        // Misaligned interior pointer.
        let misaligned = (inside as usize + 1) as *const u64;
        assert_eq!(pool.index_of(misaligned), None);
    }

    #[test]
    fn iter_visits_each_live_slot_once() {
        let pool = FixedSlotPool::new(8);
        for i in 0..5u64 {
            pool.reserve(i).unwrap();
        }
        let mut seen: Vec<u64> = pool.iter().map(|p| unsafe { *p }).collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn clear_drops_live_values() {
        let witness = Rc::new(());
        let mut pool = FixedSlotPool::new(4);
        for _ in 0..3 {
            pool.reserve(witness.clone()).unwrap();
        }
        assert_eq!(Rc::strong_count(&witness), 4);
        pool.clear();
        assert_eq!(Rc::strong_count(&witness), 1);
        assert!(pool.is_empty());
    }

    #[test]
    fn drop_releases_live_values() {
        let witness = Rc::new(());
        {
            let pool = FixedSlotPool::new(4);
            pool.reserve(witness.clone()).unwrap();
            pool.reserve(witness.clone()).unwrap();
            assert_eq!(Rc::strong_count(&witness), 3);
        }
        assert_eq!(Rc::strong_count(&witness), 1);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn concurrent_reserve_release_balances() {
        use std::sync::Arc;
        use std::thread;

        let pool = Arc::new(FixedSlotPool::new(64));
        let mut handles = vec![];
        for t in 0..8u64 {
            let pool = pool.clone();
            handles.push(thread::spawn(move || {
                for i in 0..2_000 {
                    if let Ok(ptr) = pool.reserve(t * 10_000 + i) {
                        assert_eq!(unsafe { *ptr }, t * 10_000 + i);
                        assert!(unsafe { pool.release(ptr) });
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(pool.is_empty());
    }
}
