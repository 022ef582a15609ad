//! Paged object pool with a lock-free free-page list.
//!
//! The pool grows by pages; each page is a [`FixedSlotPool`] of entries
//! plus its own index and an intrusive link into the free-page list. The
//! page vector only ever grows and is guarded by a spinlock in the shared
//! discipline: any number of readers index it concurrently while growth
//! briefly upgrades to the write side. Pages that still have a free slot
//! are kept on a lock-free singly linked list whose head is the packed
//! word from [`crate::atomic`].
//!
//! Pages are never freed individually; [`PagingPool::clear`] and drop
//! return them all at once, so a pointer obtained from
//! [`PagingPool::reserve`] dangles only after the value it names has been
//! released *and* its slot reused — never because the page went away.

use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use std::cell::UnsafeCell;

use crossbeam_utils::Backoff;

use crate::atomic::{FreeListHead, HeadSnapshot, INVALID_PAGE, MAX_PAGES, SWAPPING_PAGE, TAIL_PAGE};
use crate::fixed_pool::{self, FixedSlotPool};
use crate::spinlock::CountingSpinlock;
use crate::utils::{round_up_pow2, CacheAligned};

/// Initial capacity of the page vector.
const INITIAL_PAGE_CAPACITY: usize = 4;

/// A pool entry: the caller's value plus the index of the owning page,
/// which [`PagingPool::release`] uses to find the page in O(1).
///
/// `data` comes first and the layout is fixed, so a `*mut T` handed out by
/// the pool round-trips to the entry by a plain cast.
#[repr(C)]
struct PageEntry<T> {
    data: T,
    page_index: u32,
}

struct Page<T> {
    slots: FixedSlotPool<PageEntry<T>>,
    index: u32,
    /// Index of the next page on the free list; [`INVALID_PAGE`] while
    /// off-list, [`SWAPPING_PAGE`] while a push is in flight.
    next_free: AtomicU32,
}

impl<T> Page<T> {
    fn new(page_size: usize) -> Self {
        Self {
            slots: FixedSlotPool::new(page_size),
            index: 0,
            next_free: AtomicU32::new(INVALID_PAGE),
        }
    }
}

/// A grow-only pool of pages sharing one free-page list.
pub struct PagingPool<T> {
    /// Page pointer vector. Slot stores are atomic so the single grower
    /// and many readers never alias; the vector itself is only resized
    /// under the write side of `page_lock`.
    pages: UnsafeCell<Vec<AtomicPtr<Page<T>>>>,
    num_pages: AtomicU32,
    page_lock: CountingSpinlock,
    free_head: CacheAligned<FreeListHead>,
    live: CacheAligned<AtomicU32>,
    page_size: usize,
}

// SAFETY: all shared mutation goes through atomics or the page lock; `T`
// moves between threads through reserve/release.
unsafe impl<T: Send> Send for PagingPool<T> {}
unsafe impl<T: Send> Sync for PagingPool<T> {}

impl<T> PagingPool<T> {
    /// Creates an empty pool whose pages hold `page_size` slots each
    /// (rounded up to a power of two). No page is allocated up front.
    pub fn new(page_size: usize) -> Self {
        Self {
            pages: UnsafeCell::new(Vec::new()),
            num_pages: AtomicU32::new(0),
            page_lock: CountingSpinlock::new(),
            free_head: CacheAligned::new(FreeListHead::new()),
            live: CacheAligned::new(AtomicU32::new(0)),
            page_size: round_up_pow2(page_size),
        }
    }

    /// Slots per page.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of live values.
    pub fn len(&self) -> u32 {
        self.live.load(Ordering::Relaxed)
    }

    /// True when no value is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of allocated pages.
    pub fn num_pages(&self) -> u32 {
        self.num_pages.load(Ordering::Acquire)
    }

    /// Total slot capacity across all pages.
    pub fn capacity(&self) -> usize {
        self.num_pages() as usize * self.page_size
    }

    /// Reads the page pointer at `index`. Must run under `page_lock`.
    ///
    /// # Safety
    ///
    /// `index` must be below `num_pages` and the caller must hold the
    /// page lock (either side).
    unsafe fn page_at(&self, index: u32) -> *mut Page<T> {
        // SAFETY: the held lock keeps the vector storage in place.
        let pages = unsafe { &*self.pages.get() };
        pages[index as usize].load(Ordering::Acquire)
    }

    /// Pushes `page` onto the free list unless it is already queued.
    fn push_free_page(&self, page: *mut Page<T>) {
        // SAFETY: pages are only deallocated under `&mut self`.
        let page_ref = unsafe { &*page };

        // Double-push prevention: only the thread that moves the link out
        // of INVALID gets to enqueue this page.
        if page_ref
            .next_free
            .compare_exchange(INVALID_PAGE, SWAPPING_PAGE, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let backoff = Backoff::new();
        loop {
            let current = self.free_head.load(Ordering::Acquire);
            let num_pages = self.num_pages();
            debug_assert!(
                page_ref.index < num_pages
                    && (current.head < num_pages || current.head == TAIL_PAGE),
                "PagingPool::push_free_page: corrupt free-list head"
            );
            let new = HeadSnapshot::new(
                page_ref.index,
                current.head,
                current.counter.wrapping_add(1),
            );
            // Publish our link before the head can point at us.
            page_ref.next_free.store(current.head, Ordering::Release);
            if self
                .free_head
                .compare_exchange(current, new, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            backoff.spin();
        }
    }

    /// Pops a page that has (or recently had) a free slot. Returns `None`
    /// when the list is empty.
    fn pop_free_page(&self) -> Option<*mut Page<T>> {
        let backoff = Backoff::new();
        loop {
            let current = self.free_head.load(Ordering::Acquire);
            if current.is_empty() {
                return None;
            }
            let num_pages = self.num_pages();
            if current.head >= num_pages {
                debug_assert!(false, "PagingPool::pop_free_page: corrupt free-list head");
                return None;
            }

            // The new head is the page after the current one; its own next
            // link becomes the new next field. A link still reading
            // INVALID/SWAPPING means a push on that page is mid-flight.
            let next_of_next = if current.next < num_pages {
                let _guard = self.page_lock.shared_read();
                // SAFETY: bounds checked above, lock held.
                let next_page = unsafe { self.page_at(current.next) };
                unsafe { (*next_page).next_free.load(Ordering::Acquire) }
            } else {
                TAIL_PAGE
            };
            if next_of_next == INVALID_PAGE || next_of_next == SWAPPING_PAGE {
                backoff.snooze();
                continue;
            }

            let new = HeadSnapshot::new(current.next, next_of_next, current.counter.wrapping_add(1));
            if self
                .free_head
                .compare_exchange(current, new, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                let _guard = self.page_lock.shared_read();
                // SAFETY: bounds checked above, lock held.
                let page = unsafe { self.page_at(current.head) };
                unsafe { (*page).next_free.store(INVALID_PAGE, Ordering::Release) };
                return Some(page);
            }
            backoff.spin();
        }
    }

    /// Allocates one page, registers it in the page vector, and seeds it
    /// onto the free list. Returns `None` once the 28-bit page space is
    /// exhausted.
    fn allocate_page(&self) -> Option<*mut Page<T>> {
        let page = Box::into_raw(Box::new(Page::new(self.page_size)));

        {
            let guard = self.page_lock.shared_read();
            let index = self.num_pages.fetch_add(1, Ordering::AcqRel);
            if index >= MAX_PAGES {
                self.num_pages.fetch_sub(1, Ordering::AcqRel);
                drop(guard);
                // SAFETY: the page was never published.
                drop(unsafe { Box::from_raw(page) });
                return None;
            }
            // SAFETY: the page is not yet published anywhere.
            unsafe { (*page).index = index };

            // SAFETY: read lock held; growth is excluded.
            let len = unsafe { (*self.pages.get()).len() };
            if (index as usize) < len {
                // SAFETY: in-bounds slot, lock held; the slot store is
                // atomic so concurrent readers never alias.
                let pages = unsafe { &*self.pages.get() };
                pages[index as usize].store(page, Ordering::Release);
            } else {
                let write = guard.upgrade();
                // SAFETY: write lock held; no readers are inside.
                let pages = unsafe { &mut *self.pages.get() };
                if index as usize >= pages.len() {
                    let mut new_cap = if pages.is_empty() {
                        INITIAL_PAGE_CAPACITY
                    } else {
                        pages.len() * 2
                    };
                    if new_cap <= index as usize {
                        new_cap = (index as usize + 1) * 2;
                    }
                    pages.resize_with(new_cap, || AtomicPtr::new(ptr::null_mut()));
                }
                pages[index as usize].store(page, Ordering::Release);
                drop(write);
            }
        }

        self.push_free_page(page);
        Some(page)
    }

    /// Pre-allocates enough pages to hold `count` values without further
    /// page allocation.
    pub fn preallocate(&self, count: usize) {
        let pages_needed = count.div_ceil(self.page_size);
        for _ in 0..pages_needed {
            if self.allocate_page().is_none() {
                break;
            }
        }
    }

    /// Moves `value` into a free slot and returns a pointer to it.
    ///
    /// Pages are taken from the free list and returned to it when they
    /// still have space; a new page is allocated when the list runs dry.
    /// `None` only when the page index space is exhausted.
    pub fn reserve(&self, value: T) -> Option<*mut T> {
        let mut value = value;
        loop {
            let Some(page) = self.pop_free_page() else {
                self.allocate_page()?;
                continue;
            };
            // SAFETY: pages are only deallocated under `&mut self`.
            let page_ref = unsafe { &*page };
            let entry = PageEntry {
                data: value,
                page_index: page_ref.index,
            };
            match page_ref.slots.reserve(entry) {
                Ok(entry_ptr) => {
                    self.live.fetch_add(1, Ordering::Relaxed);
                    if page_ref.slots.has_free_space() {
                        self.push_free_page(page);
                    }
                    // `data` is the first field of the #[repr(C)] entry.
                    return Some(entry_ptr as *mut T);
                }
                Err(entry) => {
                    // The page filled up under us; try another.
                    value = entry.data;
                }
            }
        }
    }

    /// Drops the value behind `ptr` and frees its slot, putting the
    /// owning page back on the free list.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`PagingPool::reserve`] on this
    /// pool, must not have been released already, and no other thread may
    /// be accessing the value.
    pub unsafe fn release(&self, ptr: *const T) -> bool {
        if ptr.is_null() {
            return false;
        }
        let entry = ptr as *const PageEntry<T>;
        // SAFETY: per contract `ptr` names a live entry.
        let page_index = unsafe { (*entry).page_index };
        if page_index >= self.num_pages() {
            debug_assert!(false, "PagingPool::release: entry names page {page_index} out of range");
            return false;
        }
        let page = {
            let _guard = self.page_lock.shared_read();
            // SAFETY: bounds checked above, lock held.
            unsafe { self.page_at(page_index) }
        };
        // SAFETY: forwarded caller contract.
        let released = unsafe { (*page).slots.release(entry) };
        if released {
            self.live.fetch_sub(1, Ordering::Relaxed);
        }
        // The page has at least one free slot now; push_free_page de-dupes
        // if it is already queued.
        self.push_free_page(page);
        released
    }

    /// Drops every live value and returns every page to the allocator.
    pub fn clear(&mut self) {
        let num_pages = self.num_pages();
        let pages = self.pages.get_mut();
        for slot in pages.iter().take(num_pages as usize) {
            let page = slot.load(Ordering::Relaxed);
            if !page.is_null() {
                // SAFETY: `&mut self`; the page was created by Box::new in
                // allocate_page and is dropped exactly once here.
                drop(unsafe { Box::from_raw(page) });
            }
        }
        pages.clear();
        self.num_pages.store(0, Ordering::Release);
        self.free_head.reset();
        self.live.store(0, Ordering::Relaxed);
    }

    /// Iterates over pointers to every live value, page by page.
    ///
    /// Not stable under mutation; only use while the pool is quiescent.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            pool: self,
            page: 0,
            inner: None,
        }
    }
}

impl<T> Drop for PagingPool<T> {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Iterator over the live values of a [`PagingPool`].
pub struct Iter<'a, T> {
    pool: &'a PagingPool<T>,
    page: u32,
    inner: Option<fixed_pool::Iter<'a, PageEntry<T>>>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = *mut T;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(inner) = self.inner.as_mut() {
                if let Some(entry) = inner.next() {
                    return Some(entry as *mut T);
                }
                self.inner = None;
            }
            if self.page >= self.pool.num_pages() {
                return None;
            }
            let page = {
                let _guard = self.pool.page_lock.shared_read();
                // SAFETY: bounds checked, lock held.
                unsafe { self.pool.page_at(self.page) }
            };
            self.page += 1;
            // SAFETY: iteration requires a quiescent pool and pages are
            // only freed under `&mut`, so the page outlives `'a`.
            let slots: &'a FixedSlotPool<PageEntry<T>> = unsafe { &(*page).slots };
            self.inner = Some(slots.iter());
        }
    }
}
