//! One shard (sub-map) of the sharded hash map.
//!
//! A shard owns a power-of-two bucket table and a spinlock in the shared
//! discipline: finds run under the read side, every structural mutation
//! under the write side. The node storage itself belongs to the map's
//! shared pool; the shard only links nodes into buckets and stamps their
//! bucket backpointers.
//!
//! All `_unsync` methods are the lockless siblings: identical semantics,
//! no locking, caller provides mutual exclusion.

use core::borrow::Borrow;
use core::cell::UnsafeCell;
use core::hash::{BuildHasher, Hash};
use core::sync::atomic::{AtomicU32, Ordering};

use petek::{CountingSpinlock, PagingPool};

use crate::list::{BucketList, BucketRef, Node};

pub(crate) type NodePool<K, V> = PagingPool<Node<K, V>>;

/// Buckets are kept at most 7/8 full.
fn fill_capacity(num_buckets: usize) -> u32 {
    (num_buckets * 7 / 8) as u32
}

struct Table<K, V> {
    buckets: Box<[BucketList<K, V>]>,
    fill_capacity: u32,
}

impl<K, V> Table<K, V> {
    fn index(&self, hash: u64) -> usize {
        // Power-of-two bucket count; callers check for the empty table.
        hash as usize & (self.buckets.len() - 1)
    }
}

pub(crate) struct Shard<K, V> {
    lock: CountingSpinlock,
    count: AtomicU32,
    table: UnsafeCell<Table<K, V>>,
}

// SAFETY: the table cell is only touched under the shard lock (or the
// exclusion the `_unsync` callers provide); nodes travel between threads
// through the pool.
unsafe impl<K: Send, V: Send> Send for Shard<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for Shard<K, V> {}

impl<K, V> Shard<K, V> {
    pub(crate) fn new() -> Self {
        Self {
            lock: CountingSpinlock::new(),
            count: AtomicU32::new(0),
            table: UnsafeCell::new(Table {
                buckets: Box::new([]),
                fill_capacity: 0,
            }),
        }
    }

    pub(crate) fn len(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }

    /// # Safety
    ///
    /// The caller must hold the shard lock (either side) or otherwise
    /// exclude resizes.
    unsafe fn table(&self) -> &Table<K, V> {
        // SAFETY: per contract.
        unsafe { &*self.table.get() }
    }

    /// # Safety
    ///
    /// The caller must hold the shard write lock or exclude every other
    /// accessor.
    #[allow(clippy::mut_from_ref)]
    unsafe fn table_mut(&self) -> &mut Table<K, V> {
        // SAFETY: per contract.
        unsafe { &mut *self.table.get() }
    }
}

impl<K: Hash + Eq, V> Shard<K, V> {
    /// Replaces the bucket table with one of `new_num_buckets` (a power
    /// of two) and relinks every node by the rehash of its current key.
    ///
    /// # Safety
    ///
    /// Caller must hold the shard write lock or exclude every accessor.
    unsafe fn resize<S: BuildHasher>(&self, new_num_buckets: usize, hasher: &S) {
        debug_assert!(new_num_buckets.is_power_of_two());
        // SAFETY: exclusion per contract.
        let table = unsafe { self.table_mut() };
        let new_buckets: Box<[BucketList<K, V>]> =
            (0..new_num_buckets).map(|_| BucketList::new()).collect();
        let old_buckets = core::mem::replace(&mut table.buckets, new_buckets);
        table.fill_capacity = fill_capacity(new_num_buckets);

        for bucket in old_buckets.iter() {
            let mut current = bucket.head();
            while !current.is_null() {
                // SAFETY: we hold every node of this shard exclusively.
                let next = unsafe { (*current).next(Ordering::Relaxed) };
                let hash = hasher.hash_one(unsafe { (*current).key() });
                let index = table.index(hash);
                unsafe { (*current).bucket.store_index(index as u32) };
                unsafe { table.buckets[index].insert_unsync(current) };
                current = next;
            }
        }
    }

    /// Lockless insert. Returns false when the key is already present or
    /// the pool is out of pages.
    ///
    /// # Safety
    ///
    /// Caller must hold the shard write lock or exclude every accessor.
    pub(crate) unsafe fn insert_unsync<S: BuildHasher>(
        &self,
        pool: &NodePool<K, V>,
        hash: u64,
        key: K,
        value: V,
        hasher: &S,
    ) -> bool {
        let live = self.count.load(Ordering::Relaxed);
        // SAFETY: exclusion per contract.
        let table = unsafe { self.table() };
        if live + 1 > table.fill_capacity {
            let target = (((live + 1) as usize) * 2).next_power_of_two();
            // SAFETY: exclusion per contract.
            unsafe { self.resize(target, hasher) };
        }
        let table = unsafe { self.table() };
        let index = table.index(hash);
        let bucket = &table.buckets[index];
        // SAFETY: exclusion per contract.
        if !unsafe { bucket.find_unsync(&key) }.is_null() {
            return false;
        }
        let Some(node) = pool.reserve(Node::new(key, value)) else {
            return false;
        };
        // SAFETY: the node is fresh and unpublished.
        unsafe { (*node).bucket.store_index(index as u32) };
        unsafe { bucket.insert_unsync(node) };
        self.count.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Concurrent insert: the lockless body under the shard write lock.
    pub(crate) fn insert<S: BuildHasher>(
        &self,
        pool: &NodePool<K, V>,
        hash: u64,
        key: K,
        value: V,
        hasher: &S,
    ) -> bool {
        let _guard = self.lock.shared_write();
        // SAFETY: write lock held.
        unsafe { self.insert_unsync(pool, hash, key, value, hasher) }
    }

    /// Adopts an already-allocated node (cross-shard rekey). The node's
    /// key must already be rewritten for this shard's hash.
    ///
    /// # Safety
    ///
    /// Caller must hold the shard write lock or exclude every accessor,
    /// and `node` must be live, unlinked, and keyed to `hash`.
    pub(crate) unsafe fn adopt_node_unsync<S: BuildHasher>(
        &self,
        node: *mut Node<K, V>,
        hash: u64,
        hasher: &S,
    ) -> bool {
        let live = self.count.load(Ordering::Relaxed);
        // SAFETY: exclusion per contract.
        let table = unsafe { self.table() };
        if live + 1 > table.fill_capacity {
            let target = (((live + 1) as usize) * 2).next_power_of_two();
            unsafe { self.resize(target, hasher) };
        }
        let table = unsafe { self.table() };
        let index = table.index(hash);
        let bucket = &table.buckets[index];
        // SAFETY: node is unlinked, its key is stable.
        if !unsafe { bucket.find_unsync((*node).key()) }.is_null() {
            return false;
        }
        unsafe { (*node).bucket.store_index(index as u32) };
        unsafe { bucket.insert_unsync(node) };
        self.count.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Locked variant of [`Shard::adopt_node_unsync`].
    pub(crate) fn adopt_node<S: BuildHasher>(
        &self,
        node: *mut Node<K, V>,
        hash: u64,
        hasher: &S,
    ) -> bool {
        let _guard = self.lock.shared_write();
        // SAFETY: write lock held.
        unsafe { self.adopt_node_unsync(node, hash, hasher) }
    }

    /// Lockless find.
    ///
    /// # Safety
    ///
    /// Caller must hold the shard lock (either side) or exclude writers.
    pub(crate) unsafe fn find_unsync<Q>(&self, hash: u64, key: &Q) -> *mut Node<K, V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        // SAFETY: exclusion per contract.
        let table = unsafe { self.table() };
        if table.buckets.is_empty() {
            return core::ptr::null_mut();
        }
        let index = table.index(hash);
        // SAFETY: exclusion per contract.
        unsafe { table.buckets[index].find_unsync(key) }
    }

    /// Runs `f` on the value for `key` under the shard read lock.
    pub(crate) fn read<Q, R>(&self, hash: u64, key: &Q, f: impl FnOnce(&V) -> R) -> Option<R>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let _guard = self.lock.shared_read();
        // SAFETY: read lock held.
        let node = unsafe { self.find_unsync(hash, key) };
        if node.is_null() {
            return None;
        }
        // SAFETY: value rewrites require the write lock, which our read
        // guard excludes.
        Some(f(unsafe { (*node).value() }))
    }

    /// Runs `f` on the value for `key` under the shard write lock.
    pub(crate) fn update<Q, R>(&self, hash: u64, key: &Q, f: impl FnOnce(&mut V) -> R) -> Option<R>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let _guard = self.lock.shared_write();
        // SAFETY: write lock held.
        let node = unsafe { self.find_unsync(hash, key) };
        if node.is_null() {
            return None;
        }
        // SAFETY: the write lock is exclusive.
        Some(f(unsafe { (*node).value_mut() }))
    }

    pub(crate) fn contains<Q>(&self, hash: u64, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        !self.find_ptr(hash, key).is_null()
    }

    /// Concurrent find that hands back the raw node pointer. The read
    /// lock is released on return, so the pointer is advisory and must
    /// not be dereferenced: a racing erase may release the node at any
    /// moment. Presence checks only; anything stronger goes through
    /// [`Shard::take_for_reassign`].
    pub(crate) fn find_ptr<Q>(&self, hash: u64, key: &Q) -> *mut Node<K, V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let _guard = self.lock.shared_read();
        // SAFETY: read lock held.
        unsafe { self.find_unsync(hash, key) }
    }

    /// Lockless erase. Releases the node to the pool unless it is marked
    /// reassigning.
    ///
    /// # Safety
    ///
    /// Caller must hold the shard write lock or exclude every accessor.
    pub(crate) unsafe fn remove_unsync<Q>(
        &self,
        pool: &NodePool<K, V>,
        hash: u64,
        key: &Q,
    ) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        // SAFETY: exclusion per contract.
        let table = unsafe { self.table() };
        if table.buckets.is_empty() {
            return false;
        }
        let index = table.index(hash);
        // SAFETY: exclusion per contract.
        let node = unsafe { table.buckets[index].erase_unsync(key) };
        if node.is_null() {
            return false;
        }
        if unsafe { (*node).bucket.load(Ordering::Acquire) } != BucketRef::Reassigning {
            // SAFETY: the node is unlinked and ours to destroy.
            unsafe { pool.release(node) };
        }
        self.count.fetch_sub(1, Ordering::Relaxed);
        true
    }

    /// Concurrent erase.
    pub(crate) fn remove<Q>(&self, pool: &NodePool<K, V>, hash: u64, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let _guard = self.lock.shared_write();
        // SAFETY: write lock held.
        unsafe { self.remove_unsync(pool, hash, key) }
    }

    /// Same-shard rekey: find, claim, unlink, rewrite, and relink in one
    /// critical section under the shard write lock, so no eraser or
    /// resize can observe the node half-claimed. Fails when `old_key` is
    /// absent, `new_key` is already present, or another rekey owns the
    /// node.
    pub(crate) fn rekey(&self, old_hash: u64, new_hash: u64, old_key: &K, new_key: K) -> bool {
        let _guard = self.lock.shared_write();
        // SAFETY: write lock held.
        let node_ptr = unsafe { self.find_unsync(old_hash, old_key) };
        if node_ptr.is_null() {
            return false;
        }
        // SAFETY: the node is linked, hence live, and the write lock
        // keeps it that way.
        let node = unsafe { &*node_ptr };
        let table = unsafe { self.table() };
        let new_index = table.index(new_hash);

        // SAFETY: write lock held.
        if !unsafe { table.buckets[new_index].find_unsync(&new_key) }.is_null() {
            return false;
        }

        let old_index = match node.bucket.load(Ordering::Acquire) {
            BucketRef::Index(index) => index,
            // A linked node under the write lock always carries an index.
            BucketRef::Reassigning | BucketRef::Invalid => return false,
        };
        debug_assert!((old_index as usize) < table.buckets.len());

        if old_index as usize == new_index {
            // SAFETY: write lock held; nobody reads the key.
            unsafe { node.replace_key(new_key) };
            return true;
        }

        // The sentinel cannot be observed while the write lock is held,
        // but the backpointer protocol stays uniform: claim, move,
        // restore.
        if !node.bucket.try_begin_reassign(old_index) {
            return false;
        }
        // SAFETY: write lock held.
        let removed = unsafe { table.buckets[old_index as usize].erase_node_unsync(node_ptr) };
        if !removed {
            debug_assert!(false, "rekey: node missing from its stamped bucket");
            node.bucket.store_index(old_index);
            return false;
        }
        // SAFETY: the node is unlinked and the write lock is held.
        unsafe { node.replace_key(new_key) };
        node.bucket.store_index(new_index as u32);
        unsafe { table.buckets[new_index].insert_unsync(node_ptr) };
        true
    }

    /// Lockless body of [`Shard::take_for_reassign`].
    ///
    /// # Safety
    ///
    /// Caller must hold the shard write lock or exclude every accessor.
    pub(crate) unsafe fn take_for_reassign_unsync<Q>(&self, hash: u64, key: &Q) -> *mut Node<K, V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        // SAFETY: exclusion per contract.
        let node_ptr = unsafe { self.find_unsync(hash, key) };
        if node_ptr.is_null() {
            return core::ptr::null_mut();
        }
        // SAFETY: the node is linked, hence live.
        let node = unsafe { &*node_ptr };
        let old_index = match node.bucket.load(Ordering::Acquire) {
            BucketRef::Index(index) => index,
            // A linked node under the lock always carries an index.
            BucketRef::Reassigning | BucketRef::Invalid => return core::ptr::null_mut(),
        };
        if !node.bucket.try_begin_reassign(old_index) {
            return core::ptr::null_mut();
        }
        // SAFETY: exclusion per contract.
        let table = unsafe { self.table() };
        debug_assert!((old_index as usize) < table.buckets.len());
        let removed = unsafe { table.buckets[old_index as usize].erase_node_unsync(node_ptr) };
        if !removed {
            debug_assert!(false, "take_for_reassign: node missing from its stamped bucket");
            node.bucket.store_index(old_index);
            return core::ptr::null_mut();
        }
        self.count.fetch_sub(1, Ordering::Relaxed);
        node_ptr
    }

    /// Claims the node for `key` with the reassigning sentinel and
    /// unlinks it without releasing its pool slot, all in one critical
    /// section under the shard write lock — a concurrent erase can never
    /// observe the node between the claim and the unlink. Returns null
    /// when the key is absent or another rekey owns the node. The caller
    /// owns the returned node and must adopt it elsewhere or release it.
    pub(crate) fn take_for_reassign<Q>(&self, hash: u64, key: &Q) -> *mut Node<K, V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let _guard = self.lock.shared_write();
        // SAFETY: write lock held.
        unsafe { self.take_for_reassign_unsync(hash, key) }
    }

    /// Lockless sibling of [`Shard::rekey`].
    ///
    /// # Safety
    ///
    /// Caller must exclude every other accessor.
    pub(crate) unsafe fn rekey_unsync(
        &self,
        old_hash: u64,
        new_hash: u64,
        old_key: &K,
        new_key: K,
    ) -> bool {
        // SAFETY: exclusion per contract.
        let node_ptr = unsafe { self.find_unsync(old_hash, old_key) };
        if node_ptr.is_null() {
            return false;
        }
        let table = unsafe { self.table() };
        let new_index = table.index(new_hash);
        if !unsafe { table.buckets[new_index].find_unsync(&new_key) }.is_null() {
            return false;
        }
        let node = unsafe { &*node_ptr };
        let old_index = match node.bucket.load(Ordering::Relaxed) {
            BucketRef::Index(index) => index,
            BucketRef::Reassigning | BucketRef::Invalid => return false,
        };
        if old_index as usize == new_index {
            unsafe { node.replace_key(new_key) };
            return true;
        }
        node.bucket.mark_reassigning();
        let removed = unsafe { table.buckets[old_index as usize].erase_node_unsync(node_ptr) };
        unsafe { node.replace_key(new_key) };
        if !removed {
            debug_assert!(false, "rekey_unsync: node vanished from its bucket");
            return false;
        }
        node.bucket.store_index(new_index as u32);
        unsafe { table.buckets[new_index].insert_unsync(node_ptr) };
        true
    }

    /// Drops every link and resets the count. Node destruction is the
    /// pool's job (the map clears it right after).
    ///
    /// # Safety
    ///
    /// Caller must exclude every other accessor.
    pub(crate) unsafe fn clear_unsync(&self) {
        // SAFETY: exclusion per contract.
        let table = unsafe { self.table() };
        for bucket in table.buckets.iter() {
            unsafe { bucket.reset_unsync() };
        }
        self.count.store(0, Ordering::Relaxed);
    }

    /// Pre-sizes the bucket table; never shrinks.
    ///
    /// # Safety
    ///
    /// Caller must exclude every other accessor.
    pub(crate) unsafe fn reserve_buckets_unsync<S: BuildHasher>(
        &self,
        num_buckets: usize,
        hasher: &S,
    ) {
        let num_buckets = num_buckets.next_power_of_two();
        // SAFETY: exclusion per contract.
        if num_buckets > unsafe { self.table() }.buckets.len() {
            unsafe { self.resize(num_buckets, hasher) };
        }
    }
}
