//! Map nodes and the intrusive per-bucket linked list.
//!
//! Nodes live in the shared pool; the list only links and unlinks them,
//! it never allocates. Every operation comes in two flavors: a locked
//! variant that uses the list's own spinlock (standard discipline, so
//! concurrent head-inserts run under the read side while erasers take the
//! write side), and an `_unsync` variant for callers that already hold
//! the surrounding shard lock.

use core::borrow::Borrow;
use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use crossbeam_utils::Backoff;
use petek::CountingSpinlock;

/// Bucket backpointer value for a node that is not linked anywhere.
const INVALID_BUCKET: u32 = u32::MAX;
/// Bucket backpointer value for a node that is mid-rekey: the node is
/// logically out of the index and must not be destroyed.
const REASSIGNING_BUCKET: u32 = u32::MAX - 1;

/// Decoded state of a node's bucket backpointer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum BucketRef {
    /// Linked into the bucket with this index.
    Index(u32),
    /// Unlinked (freshly reserved or about to be adopted elsewhere).
    Invalid,
    /// Mid-rekey; erasers must leave the node alive.
    Reassigning,
}

/// A node's bucket backpointer: a bucket index or one of the two
/// sentinels, CAS-able as a unit.
pub(crate) struct BucketSlot(AtomicU32);

impl BucketSlot {
    fn new() -> Self {
        Self(AtomicU32::new(INVALID_BUCKET))
    }

    pub(crate) fn load(&self, order: Ordering) -> BucketRef {
        match self.0.load(order) {
            INVALID_BUCKET => BucketRef::Invalid,
            REASSIGNING_BUCKET => BucketRef::Reassigning,
            index => BucketRef::Index(index),
        }
    }

    pub(crate) fn store_index(&self, index: u32) {
        debug_assert!(index < REASSIGNING_BUCKET);
        self.0.store(index, Ordering::Release);
    }

    pub(crate) fn mark_invalid(&self) {
        self.0.store(INVALID_BUCKET, Ordering::Release);
    }

    pub(crate) fn mark_reassigning(&self) {
        self.0.store(REASSIGNING_BUCKET, Ordering::Release);
    }

    /// Claims the node for a rekey: transitions `expected` (a real index)
    /// to the reassigning sentinel.
    pub(crate) fn try_begin_reassign(&self, expected: u32) -> bool {
        self.0
            .compare_exchange(expected, REASSIGNING_BUCKET, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// A key/value entry plus its intrusive link and bucket backpointer.
///
/// The key and value sit in `UnsafeCell`s because rekey rewrites the key
/// and `update` rewrites the value in place; both only happen while the
/// node is unlinked or its shard lock is held for writing.
pub(crate) struct Node<K, V> {
    key: UnsafeCell<K>,
    value: UnsafeCell<V>,
    next: AtomicPtr<Node<K, V>>,
    pub(crate) bucket: BucketSlot,
}

impl<K, V> Node<K, V> {
    pub(crate) fn new(key: K, value: V) -> Self {
        Self {
            key: UnsafeCell::new(key),
            value: UnsafeCell::new(value),
            next: AtomicPtr::new(ptr::null_mut()),
            bucket: BucketSlot::new(),
        }
    }

    /// # Safety
    ///
    /// No thread may be rewriting the key (rekey holds the shard write
    /// lock or the node unlinked while it does so).
    pub(crate) unsafe fn key(&self) -> &K {
        // SAFETY: per contract.
        unsafe { &*self.key.get() }
    }

    /// # Safety
    ///
    /// No thread may be rewriting the value.
    pub(crate) unsafe fn value(&self) -> &V {
        // SAFETY: per contract.
        unsafe { &*self.value.get() }
    }

    /// # Safety
    ///
    /// Caller must hold the shard write lock; no other reference to the
    /// value may be live.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn value_mut(&self) -> &mut V {
        // SAFETY: per contract.
        unsafe { &mut *self.value.get() }
    }

    /// Swaps in a new key, returning the old one.
    ///
    /// # Safety
    ///
    /// Caller must hold the shard write lock or the node must be
    /// unlinked; no reference to the key may be live.
    pub(crate) unsafe fn replace_key(&self, key: K) -> K {
        // SAFETY: per contract.
        unsafe { core::mem::replace(&mut *self.key.get(), key) }
    }

    pub(crate) fn next(&self, order: Ordering) -> *mut Node<K, V> {
        self.next.load(order)
    }
}

/// Head of one bucket's intrusive singly linked list.
pub(crate) struct BucketList<K, V> {
    head: AtomicPtr<Node<K, V>>,
    lock: CountingSpinlock,
}

impl<K, V> BucketList<K, V> {
    pub(crate) fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            lock: CountingSpinlock::new(),
        }
    }

    pub(crate) fn head(&self) -> *mut Node<K, V> {
        self.head.load(Ordering::Acquire)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head().is_null()
    }

    /// Inserts `node` at the head.
    ///
    /// Runs under the list's read lock: readers can walk past a freshly
    /// published head safely, and the write lock is reserved for
    /// operations that unlink.
    pub(crate) fn insert(&self, node: *mut Node<K, V>) {
        debug_assert!(!node.is_null());
        let _guard = self.lock.read();
        let backoff = Backoff::new();
        loop {
            let head = self.head.load(Ordering::Acquire);
            // SAFETY: `node` is not yet published; we own its link.
            unsafe { (*node).next.store(head, Ordering::Relaxed) };
            if self
                .head
                .compare_exchange(head, node, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            backoff.spin();
        }
    }

    /// Head insert without locking.
    ///
    /// # Safety
    ///
    /// The caller must hold the surrounding shard lock for writing (or
    /// otherwise exclude every other accessor of this list).
    pub(crate) unsafe fn insert_unsync(&self, node: *mut Node<K, V>) {
        debug_assert!(!node.is_null());
        let head = self.head.load(Ordering::Relaxed);
        // SAFETY: exclusion per contract.
        unsafe { (*node).next.store(head, Ordering::Relaxed) };
        self.head.store(node, Ordering::Release);
    }
}

impl<K: Eq, V> BucketList<K, V> {
    /// Walks the list and returns the first (most recently inserted) node
    /// whose key equals `key`.
    ///
    /// # Safety
    ///
    /// The caller must hold the surrounding shard lock (either side) or
    /// this list's lock; see [`BucketList::find`] for the locked variant.
    pub(crate) unsafe fn find_unsync<Q>(&self, key: &Q) -> *mut Node<K, V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let mut current = self.head.load(Ordering::Acquire);
        while !current.is_null() {
            // SAFETY: nodes stay allocated while linked; exclusion of key
            // rewrites per contract.
            let node = unsafe { &*current };
            if unsafe { node.key() }.borrow() == key {
                return current;
            }
            current = node.next(Ordering::Acquire);
        }
        ptr::null_mut()
    }

    /// Locked variant of [`BucketList::find_unsync`].
    pub(crate) fn find<Q>(&self, key: &Q) -> *mut Node<K, V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let _guard = self.lock.read();
        // SAFETY: the list read lock excludes unlinking.
        unsafe { self.find_unsync(key) }
    }

    /// Returns the last (oldest) node whose key equals `key`.
    ///
    /// # Safety
    ///
    /// Same contract as [`BucketList::find_unsync`].
    pub(crate) unsafe fn find_last_unsync<Q>(&self, key: &Q) -> *mut Node<K, V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let mut last_match = ptr::null_mut();
        let mut current = self.head.load(Ordering::Acquire);
        while !current.is_null() {
            // SAFETY: as in find_unsync.
            let node = unsafe { &*current };
            if unsafe { node.key() }.borrow() == key {
                last_match = current;
            }
            current = node.next(Ordering::Acquire);
        }
        last_match
    }

    /// Locked variant of [`BucketList::find_last_unsync`].
    pub(crate) fn find_last<Q>(&self, key: &Q) -> *mut Node<K, V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let _guard = self.lock.read();
        // SAFETY: the list read lock excludes unlinking.
        unsafe { self.find_last_unsync(key) }
    }

    /// Unlinks and returns the first node whose key equals `key`, or null.
    ///
    /// # Safety
    ///
    /// The caller must hold the surrounding shard lock for writing.
    pub(crate) unsafe fn erase_unsync<Q>(&self, key: &Q) -> *mut Node<K, V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let mut current = self.head.load(Ordering::Acquire);
        let mut prev: *mut Node<K, V> = ptr::null_mut();
        while !current.is_null() {
            // SAFETY: exclusion per contract.
            let node = unsafe { &*current };
            if unsafe { node.key() }.borrow() == key {
                let next = node.next(Ordering::Acquire);
                if prev.is_null() {
                    self.head.store(next, Ordering::Release);
                } else {
                    // SAFETY: prev is a live node of this list.
                    unsafe { (*prev).next.store(next, Ordering::Release) };
                }
                node.next.store(ptr::null_mut(), Ordering::Relaxed);
                return current;
            }
            prev = current;
            current = node.next(Ordering::Acquire);
        }
        ptr::null_mut()
    }

    /// Locked variant of [`BucketList::erase_unsync`].
    pub(crate) fn erase<Q>(&self, key: &Q) -> *mut Node<K, V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let _guard = self.lock.write();
        // SAFETY: the list write lock is exclusive.
        unsafe { self.erase_unsync(key) }
    }

    /// Unlinks the given node, matching by address. Returns whether the
    /// node was found in this list.
    ///
    /// # Safety
    ///
    /// The caller must hold the surrounding shard lock for writing.
    pub(crate) unsafe fn erase_node_unsync(&self, target: *const Node<K, V>) -> bool {
        let mut current = self.head.load(Ordering::Acquire);
        let mut prev: *mut Node<K, V> = ptr::null_mut();
        while !current.is_null() {
            if ptr::eq(current, target) {
                // SAFETY: current is live and linked here.
                let next = unsafe { (*current).next(Ordering::Acquire) };
                if prev.is_null() {
                    self.head.store(next, Ordering::Release);
                } else {
                    // SAFETY: prev is a live node of this list.
                    unsafe { (*prev).next.store(next, Ordering::Release) };
                }
                unsafe { (*current).next.store(ptr::null_mut(), Ordering::Relaxed) };
                return true;
            }
            prev = current;
            // SAFETY: current is live while linked.
            current = unsafe { (*current).next(Ordering::Acquire) };
        }
        false
    }

    /// Locked variant of [`BucketList::erase_node_unsync`].
    pub(crate) fn erase_node(&self, target: *const Node<K, V>) -> bool {
        let _guard = self.lock.write();
        // SAFETY: the list write lock is exclusive.
        unsafe { self.erase_node_unsync(target) }
    }

    /// Concurrent insert-if-absent: inserts at the head, then checks for
    /// an older duplicate. Inserts all go to the head, so the *last*
    /// matching node is the canonical entry for a key; if one other than
    /// `node` exists, `node` is unlinked again and `false` returned.
    pub(crate) fn insert_unique(&self, node: *mut Node<K, V>) -> bool {
        self.insert(node);
        // SAFETY: node was just linked; its key is stable.
        let key = unsafe { (*node).key() };
        let last = self.find_last(key);
        if !ptr::eq(last, node) {
            let removed = self.erase_node(node);
            debug_assert!(removed, "insert_unique: failed to unlink the duplicate we inserted");
            return false;
        }
        true
    }

    /// Insert-if-absent without locking.
    ///
    /// # Safety
    ///
    /// The caller must hold the surrounding shard lock for writing.
    pub(crate) unsafe fn insert_unique_unsync(&self, node: *mut Node<K, V>) -> bool {
        // SAFETY: exclusion per contract; node is unpublished.
        let existing = unsafe { self.find_unsync((*node).key()) };
        if !existing.is_null() {
            return false;
        }
        unsafe { self.insert_unsync(node) };
        true
    }
}

impl<K, V> BucketList<K, V> {
    /// Forgets every node without touching them. The nodes remain owned
    /// by the pool.
    ///
    /// # Safety
    ///
    /// The caller must exclude every other accessor of this list.
    pub(crate) unsafe fn reset_unsync(&self) {
        self.head.store(ptr::null_mut(), Ordering::Relaxed);
    }
}
