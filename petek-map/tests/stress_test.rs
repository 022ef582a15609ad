use petek_map::ShardedMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

#[test]
#[cfg_attr(miri, ignore)]
fn parallel_inserts_partitioned_by_key() {
    const THREADS: u64 = 16;
    const KEYS: u64 = 10_000;

    let map = Arc::new(ShardedMap::new());
    let mut handles = vec![];
    for t in 0..THREADS {
        let map = map.clone();
        handles.push(thread::spawn(move || {
            for k in 0..KEYS {
                if k % THREADS == t {
                    assert!(map.insert(k, k * 2));
                }
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(map.len(), KEYS as usize);
    assert_eq!(map.pool_len(), KEYS as usize);
    for k in 0..KEYS {
        assert_eq!(map.get(&k), Some(k * 2));
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn read_heavy_mixed_workload() {
    const THREADS: usize = 16;
    const OPS_PER_THREAD: usize = 100_000;
    const PRELOAD: u64 = 10_000;

    let map = Arc::new(ShardedMap::new());
    for k in 0..PRELOAD {
        map.insert(k, k);
    }

    let mut handles = vec![];
    for t in 0..THREADS {
        let map = map.clone();
        handles.push(thread::spawn(move || {
            let mut inserted = 0usize;
            for i in 0..OPS_PER_THREAD {
                let k = ((t * OPS_PER_THREAD + i) as u64 * 2_654_435_761) % (PRELOAD * 2);
                if i % 10 == 0 {
                    // 10% writes; keys above PRELOAD are new.
                    if map.insert(k, k) {
                        inserted += 1;
                    }
                } else if let Some(v) = map.get(&k) {
                    assert_eq!(v, k);
                }
            }
            inserted
        }));
    }

    let mut total_new = 0;
    for h in handles {
        total_new += h.join().unwrap();
    }

    assert!(map.len() >= PRELOAD as usize);
    assert!(map.len() <= PRELOAD as usize + total_new);
    assert_eq!(map.pool_len(), map.len());
}

#[test]
#[cfg_attr(miri, ignore)]
fn contended_inserts_on_a_small_keyspace() {
    const THREADS: usize = 16;
    const KEYSPACE: u64 = 100;

    let map = Arc::new(ShardedMap::new());
    let mut handles = vec![];
    for t in 0..THREADS {
        let map = map.clone();
        handles.push(thread::spawn(move || {
            let mut won: Vec<u64> = vec![];
            for i in 0..2_000u64 {
                let k = (i + t as u64 * 7) % KEYSPACE;
                if map.insert(k, k * 10) {
                    won.push(k);
                }
            }
            won
        }));
    }

    let mut all_won: Vec<u64> = vec![];
    for h in handles {
        all_won.extend(h.join().unwrap());
    }

    // Every key was won at most once across all threads.
    let unique: HashSet<u64> = all_won.iter().copied().collect();
    assert_eq!(unique.len(), all_won.len());

    assert!(map.len() <= KEYSPACE as usize);
    assert_eq!(map.len(), all_won.len());
    for k in all_won {
        assert_eq!(map.get(&k), Some(k * 10));
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn insert_remove_churn_stays_consistent() {
    const THREADS: u64 = 8;
    const PER_THREAD: u64 = 10_000;

    let map = Arc::new(ShardedMap::new());
    let mut handles = vec![];
    for t in 0..THREADS {
        let map = map.clone();
        handles.push(thread::spawn(move || {
            let base = t * PER_THREAD;
            for i in 0..PER_THREAD {
                let k = base + i;
                assert!(map.insert(k, k));
                if i % 2 == 0 {
                    assert!(map.remove(&k));
                }
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    // Each thread kept its odd offsets.
    assert_eq!(map.len(), (THREADS * PER_THREAD / 2) as usize);
    assert_eq!(map.pool_len(), map.len());
    let shard_total: usize = map.shard_lens().iter().sum();
    assert_eq!(shard_total, map.len());

    for t in 0..THREADS {
        for i in 0..PER_THREAD {
            let k = t * PER_THREAD + i;
            assert_eq!(map.get(&k).is_some(), i % 2 == 1, "key {k}");
        }
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn contended_mixed_ops_on_overlapping_keys() {
    // Unlike the partitioned workloads above, every thread works the
    // same narrow keyspace, so removes and rekeys race each other (and
    // themselves) on identical keys. Outcomes are nondeterministic; the
    // structural invariants must hold regardless.
    const THREADS: usize = 8;
    const OPS: usize = 20_000;
    const KEYSPACE: u64 = 64;

    let map = Arc::new(ShardedMap::new());
    let mut handles = vec![];
    for t in 0..THREADS {
        let map = map.clone();
        handles.push(thread::spawn(move || {
            for i in 0..OPS {
                let k = ((t * OPS + i) as u64).wrapping_mul(2_654_435_761) % KEYSPACE;
                match (t + i) % 4 {
                    0 => {
                        map.insert(k, k);
                    }
                    1 => {
                        map.remove(&k);
                    }
                    2 => {
                        map.rekey(&k, (k + 11) % KEYSPACE);
                    }
                    _ => {
                        if let Some(v) = map.get(&k) {
                            assert!(v < KEYSPACE);
                        }
                    }
                }
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    // No slot may leak or double-free, whatever interleavings occurred.
    assert!(map.len() <= KEYSPACE as usize);
    assert_eq!(map.pool_len(), map.len(), "pool slots out of sync with live entries");
    let shard_total: usize = map.shard_lens().iter().sum();
    assert_eq!(shard_total, map.len());

    // Every surviving entry is intact and findable under its key.
    let Ok(mut map) = Arc::try_unwrap(map) else {
        panic!("threads still hold the map")
    };
    let entries: Vec<(u64, u64)> = map.iter().map(|(k, v)| (*k, *v)).collect();
    assert_eq!(entries.len(), map.len());
    for (k, v) in entries {
        assert_eq!(map.get(&k), Some(v));
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn remove_races_rekey_on_the_same_key() {
    // The tightest version of the erase-versus-rekey race: two threads
    // fight over one entry that bounces between two keys. A lost race
    // must never destroy the node a rekey is moving or strand its slot.
    const ROUNDS: usize = 30_000;

    let map = Arc::new(ShardedMap::new());
    let mover = {
        let map = map.clone();
        thread::spawn(move || {
            for i in 0..ROUNDS as u64 {
                map.insert(1u64, i);
                map.rekey(&1, 2);
                map.remove(&2);
            }
        })
    };
    let eraser = {
        let map = map.clone();
        thread::spawn(move || {
            for _ in 0..ROUNDS {
                map.remove(&1);
                map.rekey(&2, 1);
                map.remove(&2);
            }
        })
    };
    mover.join().unwrap();
    eraser.join().unwrap();

    // Only keys 1 and 2 ever existed; after clearing both, every pool
    // slot must be back.
    map.remove(&1);
    map.remove(&2);
    assert_eq!(map.len(), 0, "an entry survived under neither key");
    assert_eq!(map.pool_len(), 0, "a node leaked its pool slot");
}

#[test]
#[cfg_attr(miri, ignore)]
fn mixed_insert_remove_rekey_find_workload() {
    const THREADS: u64 = 8;
    const PER_THREAD: u64 = 5_000;

    let map = Arc::new(ShardedMap::new());
    let mut handles = vec![];
    for t in 0..THREADS {
        let map = map.clone();
        handles.push(thread::spawn(move || {
            // Each thread works a private range so every op's outcome is
            // deterministic even under full concurrency.
            let base = t * PER_THREAD * 10;
            for i in 0..PER_THREAD {
                let k = base + i;
                assert!(map.insert(k, k));
                match i % 4 {
                    0 => {
                        assert!(map.remove(&k));
                    }
                    1 => {
                        assert!(map.rekey(&k, k + PER_THREAD));
                        assert_eq!(map.get(&(k + PER_THREAD)), Some(k));
                    }
                    _ => {
                        assert_eq!(map.get(&k), Some(k));
                    }
                }
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    // Per thread: 1/4 removed, 3/4 still live (rekeyed or in place).
    let expected = (THREADS * (PER_THREAD - PER_THREAD / 4)) as usize;
    assert_eq!(map.len(), expected);
    assert_eq!(map.pool_len(), expected);
}
