use petek_map::ShardedMap;

#[test]
fn insert_find_erase_basics() {
    let map = ShardedMap::new();
    for (key, value) in [(1u64, 2u64), (2, 4), (3, 6), (4, 8)] {
        assert!(map.insert(key, value));
    }
    assert_eq!(map.len(), 4);
    assert_eq!(map.get(&3), Some(6));
    assert!(map.remove(&2));
    assert_eq!(map.len(), 3);
    assert_eq!(map.get(&2), None);
}

#[test]
fn duplicate_insert_is_rejected_and_keeps_the_old_value() {
    let map = ShardedMap::new();
    assert!(map.insert(5u64, 50u64));
    assert!(!map.insert(5, 99));
    assert_eq!(map.get(&5), Some(50));
    assert_eq!(map.len(), 1);
}

#[test]
fn erase_is_idempotent() {
    let map = ShardedMap::new();
    map.insert(1u64, 1u64);
    assert!(map.remove(&1));
    let len_after = map.len();
    assert!(!map.remove(&1));
    assert_eq!(map.len(), len_after);
}

#[test]
fn insert_erase_round_trip_leaks_nothing() {
    let map = ShardedMap::new();
    for i in 0..1_000u64 {
        assert!(map.insert(i, i));
    }
    assert_eq!(map.len(), 1_000);
    assert_eq!(map.pool_len(), 1_000);
    for i in 0..1_000u64 {
        assert!(map.remove(&i));
    }
    assert_eq!(map.len(), 0);
    assert_eq!(map.pool_len(), 0);
}

#[test]
fn read_and_update_run_on_the_stored_value() {
    let map = ShardedMap::new();
    map.insert("alpha".to_string(), vec![1u32, 2, 3]);

    let sum = map.read("alpha", |v| v.iter().sum::<u32>());
    assert_eq!(sum, Some(6));

    assert_eq!(map.update("alpha", |v| v.push(4)), Some(()));
    assert_eq!(map.read("alpha", |v| v.len()), Some(4));

    assert_eq!(map.read("beta", |v| v.len()), None);
    assert_eq!(map.update("beta", |v| v.clear()), None);
}

#[test]
fn contains_key_with_borrowed_queries() {
    let map = ShardedMap::new();
    map.insert("key".to_string(), 1u64);
    assert!(map.contains_key("key"));
    assert!(!map.contains_key("other"));
}

#[test]
fn len_tracks_shard_counts() {
    let map = ShardedMap::new();
    for i in 0..500u64 {
        map.insert(i, i);
    }
    map.remove(&10);
    map.remove(&11);
    let total: usize = map.shard_lens().iter().sum();
    assert_eq!(total, map.len());
    assert_eq!(map.len(), 498);
}

#[test]
fn clear_empties_map_and_pool() {
    let mut map = ShardedMap::new();
    for i in 0..100u64 {
        map.insert(i, i);
    }
    map.clear();
    assert!(map.is_empty());
    assert_eq!(map.pool_len(), 0);
    assert_eq!(map.get(&42), None);

    // The map is fully usable after a clear.
    assert!(map.insert(42, 1));
    assert_eq!(map.get(&42), Some(1));
}

#[test]
fn reserve_presizes_for_the_requested_population() {
    let mut map = ShardedMap::new();
    map.reserve(10_000);
    for i in 0..10_000u64 {
        assert!(map.insert(i, i * 2));
    }
    assert_eq!(map.len(), 10_000);
    for i in (0..10_000u64).step_by(97) {
        assert_eq!(map.get(&i), Some(i * 2));
    }
}

#[test]
fn iterator_yields_each_entry_exactly_once() {
    let mut map = ShardedMap::new();
    for key in [7u64, 42, 99] {
        map.insert(key, key + 1);
    }

    let mut seen: Vec<(u64, u64)> = map.iter().map(|(k, v)| (*k, *v)).collect();
    seen.sort_unstable();
    assert_eq!(seen, vec![(7, 8), (42, 43), (99, 100)]);
}

#[test]
fn for_each_visits_every_live_entry() {
    let mut map = ShardedMap::new();
    for i in 0..64u64 {
        map.insert(i, i * 3);
    }
    map.remove(&7);

    let mut count = 0;
    let mut sum = 0;
    map.for_each(|k, v| {
        count += 1;
        sum += *v;
        assert_eq!(*v, *k * 3);
    });
    assert_eq!(count, 63);
    assert_eq!(sum, (0..64u64).map(|i| i * 3).sum::<u64>() - 21);
}

#[test]
fn unsync_siblings_behave_like_the_locked_forms() {
    let mut map = ShardedMap::new();
    assert!(map.insert_unsync(1u64, 10u64));
    assert!(!map.insert_unsync(1, 11));
    assert_eq!(map.get_unsync(&1), Some(10));
    assert_eq!(map.read_unsync(&1, |v| *v + 1), Some(11));
    assert_eq!(map.update_unsync(&1, |v| *v = 20), Some(()));
    assert_eq!(map.get_unsync(&1), Some(20));
    assert!(map.remove_unsync(&1));
    assert!(!map.remove_unsync(&1));
    assert!(map.is_empty());
}

#[test]
fn small_shard_and_page_configurations_work() {
    let map = ShardedMap::with_shards_and_page_size(1, 1);
    for i in 0..200u64 {
        assert!(map.insert(i, i));
    }
    assert_eq!(map.len(), 200);
    for i in 0..200u64 {
        assert_eq!(map.get(&i), Some(i));
    }

    let map = ShardedMap::with_shards_and_page_size(64, 256);
    for i in 0..200u64 {
        assert!(map.insert(i, i));
    }
    assert_eq!(map.len(), 200);
}

#[test]
fn values_are_dropped_exactly_once() {
    use std::sync::Arc;

    let witness = Arc::new(());
    let mut map = ShardedMap::new();
    for i in 0..50u64 {
        map.insert(i, witness.clone());
    }
    assert_eq!(Arc::strong_count(&witness), 51);

    for i in 0..25u64 {
        map.remove(&i);
    }
    assert_eq!(Arc::strong_count(&witness), 26);

    map.clear();
    assert_eq!(Arc::strong_count(&witness), 1);
}

#[test]
fn drop_releases_every_value() {
    use std::sync::Arc;

    let witness = Arc::new(());
    {
        let map = ShardedMap::new();
        for i in 0..50u64 {
            map.insert(i, witness.clone());
        }
        assert_eq!(Arc::strong_count(&witness), 51);
    }
    assert_eq!(Arc::strong_count(&witness), 1);
}
