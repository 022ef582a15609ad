//! The sharded map: routing, cross-shard rekey, iteration.

use core::borrow::Borrow;
use core::hash::{BuildHasher, Hash};
use core::sync::atomic::{AtomicU32, Ordering};

use foldhash::fast::FixedState;
use petek::{paging_pool, CacheAligned};

use crate::list::Node;
use crate::shard::{NodePool, Shard};

/// Default number of shards.
pub const DEFAULT_SHARDS: usize = 4;
/// Default slots per pool page.
pub const DEFAULT_PAGE_SLOTS: usize = 8;

/// A concurrent, sharded, open-hashing key/value map.
///
/// Keys are hashed to 64 bits by the pluggable [`BuildHasher`] `S`
/// (default: `foldhash`'s fixed-seed state, so the key → shard mapping is
/// a pure function of the key). The low bits of the hash pick one of the
/// power-of-two shards; each shard masks the same hash against its own
/// bucket count. Nodes for every shard come from one shared paging pool,
/// so iteration walks live entries without consulting the bucket tables.
///
/// Every concurrent operation takes `&self` and locks only the one shard
/// it touches. The `_unsync` siblings take `&mut self` as proof of
/// external mutual exclusion and skip the shard locks entirely.
///
/// # Example
///
/// ```rust
/// use petek_map::ShardedMap;
///
/// let map = ShardedMap::new();
/// assert!(map.insert(1u64, 10u64));
/// assert!(!map.insert(1, 11)); // duplicate keys are rejected
/// assert_eq!(map.get(&1), Some(10));
/// assert!(map.rekey(&1, 2));
/// assert_eq!(map.get(&1), None);
/// assert_eq!(map.get(&2), Some(10));
/// assert!(map.remove(&2));
/// assert!(map.is_empty());
/// ```
pub struct ShardedMap<K, V, S = FixedState> {
    pool: NodePool<K, V>,
    shards: Box<[Shard<K, V>]>,
    shard_mask: u64,
    total: CacheAligned<AtomicU32>,
    hash_builder: S,
}

// SAFETY: shards and pool synchronize internally; the raw node pointers
// they exchange stay inside this module.
unsafe impl<K: Send, V: Send, S: Send> Send for ShardedMap<K, V, S> {}
unsafe impl<K: Send + Sync, V: Send + Sync, S: Sync> Sync for ShardedMap<K, V, S> {}

impl<K: Hash + Eq, V> ShardedMap<K, V, FixedState> {
    /// Creates a map with the default shard count, page size, and hasher.
    pub fn new() -> Self {
        Self::with_hasher(FixedState::default())
    }

    /// Creates a map with explicit shard and page sizing (both rounded up
    /// to powers of two) and the default hasher.
    pub fn with_shards_and_page_size(shards: usize, page_slots: usize) -> Self {
        Self::with_config(shards, page_slots, FixedState::default())
    }
}

impl<K: Hash + Eq, V> Default for ShardedMap<K, V, FixedState> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash + Eq, V, S: BuildHasher> ShardedMap<K, V, S> {
    /// Creates a map with the default sizing and a custom hasher.
    pub fn with_hasher(hash_builder: S) -> Self {
        Self::with_config(DEFAULT_SHARDS, DEFAULT_PAGE_SLOTS, hash_builder)
    }

    /// Creates a map with explicit shard count, page size, and hasher.
    /// Shard and page counts are rounded up to powers of two.
    pub fn with_config(shards: usize, page_slots: usize, hash_builder: S) -> Self {
        let shards = shards.max(1).next_power_of_two();
        Self {
            pool: NodePool::new(page_slots),
            shards: (0..shards).map(|_| Shard::new()).collect(),
            shard_mask: (shards - 1) as u64,
            total: CacheAligned::new(AtomicU32::new(0)),
            hash_builder,
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.total.load(Ordering::Relaxed) as usize
    }

    /// True when the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of shards.
    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    /// Live entries held by the shared pool. Always equals [`len`] at
    /// quiescence; exposed for leak checks.
    ///
    /// [`len`]: ShardedMap::len
    pub fn pool_len(&self) -> usize {
        self.pool.len() as usize
    }

    fn hash_of<Q>(&self, key: &Q) -> u64
    where
        Q: Hash + ?Sized,
    {
        self.hash_builder.hash_one(key)
    }

    fn shard_for(&self, hash: u64) -> &Shard<K, V> {
        // SAFETY: the mask keeps the index below the shard count.
        unsafe { self.shards.get_unchecked((hash & self.shard_mask) as usize) }
    }

    /// Inserts `key` → `value`. Returns true when a new entry was
    /// created; false when the key is already present (the stored value
    /// is left untouched) or the pool is exhausted.
    pub fn insert(&self, key: K, value: V) -> bool {
        let hash = self.hash_of(&key);
        let inserted = self
            .shard_for(hash)
            .insert(&self.pool, hash, key, value, &self.hash_builder);
        if inserted {
            self.total.fetch_add(1, Ordering::Relaxed);
        }
        inserted
    }

    /// Lockless sibling of [`ShardedMap::insert`].
    pub fn insert_unsync(&mut self, key: K, value: V) -> bool {
        let hash = self.hash_of(&key);
        // SAFETY: `&mut self` excludes every other accessor.
        let inserted = unsafe {
            self.shard_for(hash)
                .insert_unsync(&self.pool, hash, key, value, &self.hash_builder)
        };
        if inserted {
            self.total.fetch_add(1, Ordering::Relaxed);
        }
        inserted
    }

    /// Runs `f` on the value stored for `key` under the shard read lock
    /// and returns its result. The reference is valid only inside `f`.
    pub fn read<Q, R>(&self, key: &Q, f: impl FnOnce(&V) -> R) -> Option<R>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash_of(key);
        self.shard_for(hash).read(hash, key, f)
    }

    /// Lockless sibling of [`ShardedMap::read`].
    pub fn read_unsync<Q, R>(&mut self, key: &Q, f: impl FnOnce(&V) -> R) -> Option<R>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash_of(key);
        // SAFETY: `&mut self` excludes every other accessor.
        let node = unsafe { self.shard_for(hash).find_unsync(hash, key) };
        if node.is_null() {
            return None;
        }
        // SAFETY: exclusive access via `&mut self`.
        Some(f(unsafe { (*node).value() }))
    }

    /// Returns a copy of the value stored for `key`.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        self.read(key, V::clone)
    }

    /// Lockless sibling of [`ShardedMap::get`].
    pub fn get_unsync<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        self.read_unsync(key, V::clone)
    }

    /// Runs `f` on the value stored for `key` under the shard write lock.
    pub fn update<Q, R>(&self, key: &Q, f: impl FnOnce(&mut V) -> R) -> Option<R>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash_of(key);
        self.shard_for(hash).update(hash, key, f)
    }

    /// Lockless sibling of [`ShardedMap::update`].
    pub fn update_unsync<Q, R>(&mut self, key: &Q, f: impl FnOnce(&mut V) -> R) -> Option<R>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash_of(key);
        // SAFETY: `&mut self` excludes every other accessor.
        let node = unsafe { self.shard_for(hash).find_unsync(hash, key) };
        if node.is_null() {
            return None;
        }
        // SAFETY: exclusive access via `&mut self`.
        Some(f(unsafe { (*node).value_mut() }))
    }

    /// True when `key` is present.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash_of(key);
        self.shard_for(hash).contains(hash, key)
    }

    /// Removes the entry for `key`. Returns true when it was present.
    pub fn remove<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash_of(key);
        let removed = self.shard_for(hash).remove(&self.pool, hash, key);
        if removed {
            self.total.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Lockless sibling of [`ShardedMap::remove`].
    pub fn remove_unsync<Q>(&mut self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash_of(key);
        // SAFETY: `&mut self` excludes every other accessor.
        let removed = unsafe { self.shard_for(hash).remove_unsync(&self.pool, hash, key) };
        if removed {
            self.total.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Re-indexes the entry stored under `old_key` as `new_key`,
    /// preserving the value and its pool slot. Returns true iff `old_key`
    /// was present and `new_key` was not.
    ///
    /// When the two keys hash to different shards the node is claimed
    /// and unlinked under the old shard's write lock, then adopted by
    /// the new shard; concurrent readers may transiently observe the
    /// entry absent from both shards during the move window. If a racing
    /// insert takes `new_key` inside that window the move is undone and
    /// the entry stays under `old_key` (unless `old_key` was also taken
    /// meanwhile, in which case the entry is dropped and `false`
    /// returned with the slot released).
    pub fn rekey(&self, old_key: &K, new_key: K) -> bool {
        let old_hash = self.hash_of(old_key);
        let new_hash = self.hash_of(&new_key);
        let old_sid = (old_hash & self.shard_mask) as usize;
        let new_sid = (new_hash & self.shard_mask) as usize;

        if old_sid == new_sid {
            return self.shards[old_sid].rekey(old_hash, new_hash, old_key, new_key);
        }

        let old_shard = &self.shards[old_sid];
        let new_shard = &self.shards[new_sid];
        if new_shard.contains(new_hash, &new_key) {
            return false;
        }

        // Claim and unlink in one critical section under the old shard's
        // write lock. A pointer obtained outside that lock is advisory
        // only — a racing erase could release the slot under us — so the
        // node may not be touched until the claim succeeds.
        let node = old_shard.take_for_reassign(old_hash, old_key);
        if node.is_null() {
            return false;
        }
        // SAFETY: the node is unlinked and claimed; this thread owns it.
        let displaced_key = unsafe { (*node).replace_key(new_key) };
        unsafe { (*node).bucket.mark_invalid() };
        if new_shard.adopt_node(node, new_hash, &self.hash_builder) {
            return true;
        }

        // A racing insert took the new key between the pre-check and the
        // adoption. Put the entry back under its old key; if the old key
        // was also re-taken in the window, the entry cannot be kept and
        // its slot is released.
        // SAFETY: still unlinked and ours.
        unsafe {
            let _ = (*node).replace_key(displaced_key);
            (*node).bucket.mark_invalid();
        }
        if !old_shard.adopt_node(node, old_hash, &self.hash_builder) {
            // SAFETY: unlinked; the release drops the value.
            unsafe { self.pool.release(node) };
            self.total.fetch_sub(1, Ordering::Relaxed);
        }
        false
    }

    /// Lockless sibling of [`ShardedMap::rekey`].
    pub fn rekey_unsync(&mut self, old_key: &K, new_key: K) -> bool {
        let old_hash = self.hash_of(old_key);
        let new_hash = self.hash_of(&new_key);
        let old_sid = (old_hash & self.shard_mask) as usize;
        let new_sid = (new_hash & self.shard_mask) as usize;

        // SAFETY (throughout): `&mut self` excludes every other accessor.
        if old_sid == new_sid {
            return unsafe { self.shards[old_sid].rekey_unsync(old_hash, new_hash, old_key, new_key) };
        }

        let old_shard = &self.shards[old_sid];
        let new_shard = &self.shards[new_sid];
        if unsafe { !new_shard.find_unsync(new_hash, &new_key).is_null() } {
            return false;
        }

        unsafe {
            let node = old_shard.take_for_reassign_unsync(old_hash, old_key);
            if node.is_null() {
                return false;
            }
            let _ = (*node).replace_key(new_key);
            (*node).bucket.mark_invalid();
            let adopted = new_shard.adopt_node_unsync(node, new_hash, &self.hash_builder);
            // With exclusive access the pre-check is authoritative.
            debug_assert!(adopted, "rekey_unsync: adoption failed after the duplicate check");
            if !adopted {
                self.pool.release(node);
                self.total.fetch_sub(1, Ordering::Relaxed);
                return false;
            }
        }
        true
    }

    /// Removes every entry and returns every pool page. Quiescent only.
    pub fn clear(&mut self) {
        for shard in self.shards.iter() {
            // SAFETY: `&mut self` excludes every other accessor.
            unsafe { shard.clear_unsync() };
        }
        self.pool.clear();
        self.total.store(0, Ordering::Relaxed);
    }

    /// Pre-sizes every shard's bucket table and the pool so that
    /// `entries` entries fit without further resizing. Quiescent only.
    pub fn reserve(&mut self, entries: usize) {
        // Head-room for the 7/8 fill bound before splitting per shard.
        let padded = entries * 8 / 7 + 1;
        let per_shard = padded.div_ceil(self.shards.len());
        for shard in self.shards.iter() {
            // SAFETY: `&mut self` excludes every other accessor.
            unsafe { shard.reserve_buckets_unsync(per_shard, &self.hash_builder) };
        }
        self.pool.preallocate(entries);
    }

    /// Iterates over every live entry exactly once, in unspecified order.
    /// Walks the pool rather than the bucket tables, so the order is
    /// unrelated to hashing. Quiescent only, enforced by `&mut self`.
    pub fn iter(&mut self) -> Iter<'_, K, V> {
        Iter {
            inner: self.pool.iter(),
        }
    }

    /// Calls `f` once per live entry. Quiescent only.
    pub fn for_each(&mut self, mut f: impl FnMut(&K, &V)) {
        for (key, value) in self.iter() {
            f(key, value);
        }
    }

    /// Per-shard entry counts; their sum equals [`ShardedMap::len`] at
    /// quiescence. Exposed for balance diagnostics.
    pub fn shard_lens(&self) -> Vec<usize> {
        self.shards.iter().map(|s| s.len() as usize).collect()
    }
}

/// Iterator over the live entries of a [`ShardedMap`].
pub struct Iter<'a, K, V> {
    inner: paging_pool::Iter<'a, Node<K, V>>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|node| {
            // SAFETY: the map is quiescent (iter takes `&mut`), so the
            // node is live and nobody rewrites its key or value.
            unsafe { ((*node).key(), (*node).value()) }
        })
    }
}
