//! End-to-end scenarios over the public API
//!
//! Counts are scaled down from production sizes; the identities checked are
//! the same at any scale.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use redsorted::codec::{self, CodecType};
use redsorted::ops::{SetCondition, SparseBitmaps, Strings};
use redsorted::storage::key::DataType;
use redsorted::{BigSortedMap, MapConfig, StorageError};
use std::collections::BTreeMap;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn string_prefix() -> Vec<u8> {
    vec![DataType::String.tag()]
}

fn user_key(i: u64) -> Vec<u8> {
    format!("user:{:08}", i).into_bytes()
}

#[test]
fn test_increments_sum_to_total() {
    init_logging();
    const LOADED: u64 = 20_000;
    const INCREMENTS: u64 = 50_000;

    let map = BigSortedMap::new(MapConfig::default()).unwrap();
    for i in 0..LOADED {
        assert!(Strings::set(&map, &user_key(i), &[0u8; 8], 0, SetCondition::Always).unwrap());
    }

    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..INCREMENTS {
        let i = rng.gen_range(0..LOADED);
        Strings::incr(&map, &user_key(i)).unwrap().unwrap();
    }

    let mut sum = 0i64;
    let mut count = 0;
    for entry in map.prefix_scanner(&string_prefix()) {
        let entry = entry.unwrap();
        sum += i64::from_be_bytes(entry.value.as_slice().try_into().unwrap());
        count += 1;
    }
    assert_eq!(count, LOADED);
    assert_eq!(sum, INCREMENTS as i64);
    map.verify_partition().unwrap();
}

#[test]
fn test_appends_sum_of_sizes() {
    init_logging();
    const LOADED: u64 = 10_000;
    const APPENDS: u64 = 30_000;

    let map = BigSortedMap::new(MapConfig::default()).unwrap();
    for i in 0..LOADED {
        Strings::set(&map, &user_key(i), &[0u8; 8], 0, SetCondition::Always).unwrap();
    }

    let mut rng = StdRng::seed_from_u64(11);
    for _ in 0..APPENDS {
        let i = rng.gen_range(0..LOADED);
        Strings::append(&map, &user_key(i), &[1u8; 8]).unwrap().unwrap();
    }

    let total: u64 = map
        .prefix_scanner(&string_prefix())
        .map(|entry| entry.unwrap().value.len() as u64)
        .sum();
    assert_eq!(total, (APPENDS + LOADED) * 8);
    map.verify_partition().unwrap();
}

#[test]
fn test_setbit_far_offsets() {
    let map = BigSortedMap::new(MapConfig::default()).unwrap();
    SparseBitmaps::set_bit(&map, b"key", 0, true).unwrap();
    assert!(SparseBitmaps::get_bit(&map, b"key", 0).unwrap());
    assert!(!SparseBitmaps::get_bit(&map, b"key", 1_000_000).unwrap());
}

#[test]
fn test_oversized_record_is_rejected_and_invisible() {
    let config = MapConfig::default();
    let map = BigSortedMap::new(config.clone()).unwrap();
    map.put(b"a", b"small", 0).unwrap();

    let huge = vec![7u8; config.max_block_size];
    assert!(matches!(
        map.put(b"huge", &huge, 0),
        Err(StorageError::RecordTooLarge { .. })
    ));
    assert_eq!(map.get(b"huge").unwrap(), None);

    let keys: Vec<Vec<u8>> = map.scanner(None, None, None).map(|e| e.unwrap().key).collect();
    assert_eq!(keys, vec![b"a".to_vec()]);
}

#[test]
fn test_random_inserts_stay_ordered_and_partitioned() {
    init_logging();
    let map = BigSortedMap::new(MapConfig::for_testing()).unwrap();
    let mut model = BTreeMap::new();
    let mut rng = StdRng::seed_from_u64(42);

    for _ in 0..5_000 {
        let len = rng.gen_range(1..24);
        let key: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        let value: Vec<u8> = (0..rng.gen_range(0..40)).map(|_| rng.gen()).collect();
        map.put(&key, &value, 0).unwrap();
        model.insert(key, value);
    }
    for key in model.keys().take(1_000).cloned().collect::<Vec<_>>() {
        assert!(map.delete(&key).unwrap());
        model.remove(&key);
    }

    let scanned: Vec<(Vec<u8>, Vec<u8>)> = map
        .scanner(None, None, None)
        .map(|e| {
            let e = e.unwrap();
            (e.key, e.value)
        })
        .collect();
    let expected: Vec<(Vec<u8>, Vec<u8>)> = model.into_iter().collect();
    assert_eq!(scanned, expected);

    let bounds = map.block_boundaries();
    assert!(bounds.len() > 1);
    assert!(bounds.windows(2).all(|w| w[0] < w[1]));
    map.verify_partition().unwrap();
}

#[test]
fn test_every_codec_round_trips_sealed_blocks() {
    init_logging();
    for codec_type in [
        CodecType::None,
        CodecType::Lz4,
        CodecType::Lz4Hc,
        CodecType::Zstd,
        CodecType::Snappy,
    ] {
        let map = BigSortedMap::new(MapConfig::for_testing()).unwrap();
        map.swap_codec(codec::create(codec_type, 3, 0, None));
        for i in 0..2_000u64 {
            map.put(&user_key(i), format!("value-{}-{}", i, i % 13).as_bytes(), 0).unwrap();
        }
        map.seal_all().unwrap();
        map.trim_caches();

        for i in 0..2_000u64 {
            assert_eq!(
                map.get(&user_key(i)).unwrap(),
                Some(format!("value-{}-{}", i, i % 13).into_bytes()),
                "codec {}",
                codec_type
            );
        }
        // writes into sealed blocks go through a decompressed copy
        map.put(&user_key(5), b"changed", 0).unwrap();
        assert_eq!(map.get(&user_key(5)).unwrap(), Some(b"changed".to_vec()));
        assert_eq!(map.scanner(None, None, None).count(), 2_000);
    }
}

#[test]
fn test_concurrent_appends_are_never_half_visible() {
    init_logging();
    const KEYS: u64 = 64;
    const WRITERS: u64 = 4;
    const APPENDS_PER_WRITER: u64 = 2_000;

    let map = BigSortedMap::new(MapConfig::for_testing()).unwrap();
    for i in 0..KEYS {
        Strings::set(&map, &user_key(i), &[0u8; 8], 0, SetCondition::Always).unwrap();
    }

    std::thread::scope(|s| {
        for w in 0..WRITERS {
            let map = &map;
            s.spawn(move || {
                let mut rng = StdRng::seed_from_u64(w);
                for _ in 0..APPENDS_PER_WRITER {
                    let i = rng.gen_range(0..KEYS);
                    // values grow past one block and are refused from then on
                    match Strings::append(map, &user_key(i), &[w as u8 + 1; 8]) {
                        Ok(_) | Err(StorageError::RecordTooLarge { .. }) => {}
                        Err(e) => panic!("append failed: {}", e),
                    }
                }
            });
        }
        s.spawn(|| {
            for _ in 0..50 {
                for entry in map.prefix_scanner(&string_prefix()) {
                    let entry = entry.unwrap();
                    assert_eq!(entry.value.len() % 8, 0, "half-applied append observed");
                    for chunk in entry.value.chunks(8) {
                        assert!(chunk.iter().all(|b| *b == chunk[0]));
                    }
                }
            }
        });
    });
    map.verify_partition().unwrap();
}

#[test]
fn test_bitmap_reads_match_last_write_in_either_form() {
    let map = BigSortedMap::new(MapConfig::for_testing()).unwrap();
    let chunk_bits = map.config().bitmap.chunk_bits;
    let mut model = BTreeMap::new();
    let mut rng = StdRng::seed_from_u64(3);

    // dense traffic on the first chunks pushes them across the sparse threshold
    for _ in 0..6_000 {
        let offset = if rng.gen_bool(0.8) {
            rng.gen_range(0..chunk_bits * 2)
        } else {
            rng.gen_range(0..chunk_bits * 200)
        };
        let value = rng.gen_bool(0.6);
        let previous = SparseBitmaps::set_bit(&map, b"bits", offset, value).unwrap().unwrap();
        assert_eq!(previous, model.get(&offset).copied().unwrap_or(false));
        model.insert(offset, value);
    }

    for (offset, value) in &model {
        assert_eq!(SparseBitmaps::get_bit(&map, b"bits", *offset).unwrap(), *value);
    }
    let expected = model.values().filter(|v| **v).count() as u64;
    assert_eq!(SparseBitmaps::bit_count(&map, b"bits").unwrap(), expected);
}
