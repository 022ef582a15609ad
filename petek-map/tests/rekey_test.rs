use petek_map::ShardedMap;
use std::sync::Arc;
use std::thread;

#[test]
fn rekey_moves_the_value_to_the_new_key() {
    let map = ShardedMap::new();
    map.insert(1u64, 111u64);

    assert!(map.rekey(&1, 2));
    assert_eq!(map.get(&1), None);
    assert_eq!(map.get(&2), Some(111));
    assert_eq!(map.len(), 1);
    assert_eq!(map.pool_len(), 1);
}

#[test]
fn rekey_of_a_missing_key_fails() {
    let map = ShardedMap::<u64, u64>::new();
    map.insert(1, 1);
    assert!(!map.rekey(&9, 10));
    assert_eq!(map.len(), 1);
}

#[test]
fn rekey_onto_an_existing_key_fails_and_changes_nothing() {
    let map = ShardedMap::new();
    // Enough pairs that both the same-shard and cross-shard paths are
    // exercised whatever the hash layout.
    for i in 0..64u64 {
        map.insert(i, i);
        map.insert(i + 1_000, i + 1_000);
    }

    for i in 0..64u64 {
        assert!(!map.rekey(&i, i + 1_000));
        assert_eq!(map.get(&i), Some(i));
        assert_eq!(map.get(&(i + 1_000)), Some(i + 1_000));
    }
    assert_eq!(map.len(), 128);
    assert_eq!(map.pool_len(), 128);
}

#[test]
fn rekey_every_entry_far_away() {
    const OFFSET: u64 = 10_000_000;

    let map = ShardedMap::new();
    for i in 1..=1024u64 {
        assert!(map.insert(i, i * 2));
    }

    for i in 1..=1024u64 {
        assert!(map.rekey(&i, i + OFFSET));
    }

    assert_eq!(map.len(), 1024);
    assert_eq!(map.pool_len(), 1024);
    for i in 1..=1024u64 {
        assert_eq!(map.get(&i), None);
        assert_eq!(map.get(&(i + OFFSET)), Some(i * 2));
    }
}

#[test]
fn rekey_chain_keeps_one_entry_alive() {
    let map = ShardedMap::new();
    map.insert(0u64, 7u64);
    for i in 0..100u64 {
        assert!(map.rekey(&i, i + 1));
    }
    assert_eq!(map.len(), 1);
    assert_eq!(map.pool_len(), 1);
    assert_eq!(map.get(&100), Some(7));
}

#[test]
fn rekey_then_erase_under_the_new_key() {
    let map = ShardedMap::new();
    map.insert(3u64, 30u64);
    assert!(map.rekey(&3, 4));
    assert!(!map.remove(&3));
    assert!(map.remove(&4));
    assert_eq!(map.len(), 0);
    assert_eq!(map.pool_len(), 0);
}

#[test]
fn rekey_unsync_mirrors_the_concurrent_form() {
    let mut map = ShardedMap::new();
    for i in 0..256u64 {
        map.insert_unsync(i, i);
    }
    for i in 0..256u64 {
        assert!(map.rekey_unsync(&i, i + 10_000));
    }
    assert!(!map.rekey_unsync(&0, 1));

    assert_eq!(map.len(), 256);
    assert_eq!(map.pool_len(), 256);
    for i in 0..256u64 {
        assert_eq!(map.get_unsync(&i), None);
        assert_eq!(map.get_unsync(&(i + 10_000)), Some(i));
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn concurrent_rekeys_on_disjoint_ranges() {
    const THREADS: u64 = 8;
    const PER_THREAD: u64 = 1_000;

    let map = Arc::new(ShardedMap::new());
    for i in 0..THREADS * PER_THREAD {
        map.insert(i, i);
    }

    let mut handles = vec![];
    for t in 0..THREADS {
        let map = map.clone();
        handles.push(thread::spawn(move || {
            for i in (t * PER_THREAD)..((t + 1) * PER_THREAD) {
                assert!(map.rekey(&i, i + 1_000_000));
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(map.len(), (THREADS * PER_THREAD) as usize);
    assert_eq!(map.pool_len(), map.len());
    for i in 0..THREADS * PER_THREAD {
        assert_eq!(map.get(&i), None);
        assert_eq!(map.get(&(i + 1_000_000)), Some(i));
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn rekeys_race_with_readers_without_losing_entries() {
    const KEYS: u64 = 512;

    let map = Arc::new(ShardedMap::new());
    for i in 0..KEYS {
        map.insert(i, i);
    }

    let movers: Vec<_> = (0..2)
        .map(|m| {
            let map = map.clone();
            thread::spawn(move || {
                // Each mover owns half the keyspace, bouncing keys out and
                // back so readers always race against moves in flight.
                let base = m * (KEYS / 2);
                for round in 0..50 {
                    for i in base..base + KEYS / 2 {
                        if round % 2 == 0 {
                            map.rekey(&i, i + 10_000);
                        } else {
                            map.rekey(&(i + 10_000), i);
                        }
                    }
                }
            })
        })
        .collect();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let map = map.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    for i in 0..KEYS {
                        // A key is either at its home or its offset spot;
                        // the value must never change.
                        if let Some(v) = map.get(&i) {
                            assert_eq!(v, i);
                        } else if let Some(v) = map.get(&(i + 10_000)) {
                            assert_eq!(v, i);
                        }
                    }
                }
            })
        })
        .collect();

    for h in movers {
        h.join().unwrap();
    }
    for h in readers {
        h.join().unwrap();
    }

    // All moves have settled; every entry is at exactly one of its two
    // possible keys with its value intact.
    assert_eq!(map.len(), KEYS as usize);
    assert_eq!(map.pool_len(), KEYS as usize);
    for i in 0..KEYS {
        let home = map.get(&i);
        let away = map.get(&(i + 10_000));
        assert!(home.is_some() != away.is_some(), "key {i} lost or duplicated");
        assert_eq!(home.or(away), Some(i));
    }
}
