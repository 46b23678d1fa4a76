// End-to-end scenarios against the public API: cache fill-to-limit,
// directory splits, large objects, file replacement under a live peer
// handle, partition-locked iteration, and defragmentation.

use mmapdb::{
    CacheMode, CacheModeKind, ChunkType, Db, DbError, DbOptions, Iter, LockMode, StoreMode,
    StoreOptions,
};

fn insert(db: &mut Db, key: &[u8], val: &[u8]) {
    db.store(key, val, &StoreOptions::mode(StoreMode::Insert))
        .unwrap();
}

#[test]
fn fill_to_limit_lru_eviction() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = DbOptions::new()
        .create(true)
        .pagesize(1024)
        .cache_mode(CacheMode {
            policy: CacheModeKind::Lru,
            evict_clean_first: false,
        })
        .open(dir.path().join("lru.db"))
        .unwrap();
    db.limit_size(1, None).unwrap();

    // Eight 8-byte keys with 100-byte values fill the single page.
    for i in 0u64..8 {
        db.store(
            &i.to_le_bytes(),
            &[0xab; 100],
            &StoreOptions::mode(StoreMode::Insert),
        )
        .unwrap();
    }
    for i in 0u64..8 {
        assert_eq!(db.fetch(&i.to_le_bytes()).unwrap(), vec![0xab; 100]);
    }

    // The ninth insert evicts the least-recently-used entry: key 0.
    db.store(
        &8u64.to_le_bytes(),
        &[0xab; 100],
        &StoreOptions::mode(StoreMode::Insert),
    )
    .unwrap();
    assert!(matches!(db.fetch(&0u64.to_le_bytes()), Err(DbError::NotFound)));
    for i in 1u64..=8 {
        assert_eq!(
            db.fetch(&i.to_le_bytes()).unwrap(),
            vec![0xab; 100],
            "key {i} must survive the eviction"
        );
    }
}

#[test]
fn first_split_grows_directory() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = DbOptions::new()
        .create(true)
        .pagesize(1024)
        .open(dir.path().join("split.db"))
        .unwrap();
    assert_eq!(db.info().dir_shift, 0);

    // Insert until the single page overflows and the store splits it.
    let mut keys = Vec::new();
    let mut i = 0u64;
    while db.info().dir_shift == 0 {
        let k = format!("split-key-{i}");
        insert(&mut db, k.as_bytes(), &[0x11; 24]);
        keys.push(k);
        i += 1;
        assert!(i < 10_000, "split never happened");
    }

    assert_eq!(db.info().dir_shift, 1);
    // Every key still present, and each lives on the page its hash picks.
    for k in &keys {
        assert_eq!(db.fetch(k.as_bytes()).unwrap(), vec![0x11; 24]);
        let h = db.hash_value(k.as_bytes());
        assert_eq!(db.key_logical_page(k.as_bytes()), h & 1);
    }
    // Both logical pages are in use.
    let pages: std::collections::HashSet<u32> = keys
        .iter()
        .map(|k| db.key_logical_page(k.as_bytes()))
        .collect();
    assert_eq!(pages.len(), 2);
    assert_eq!(db.check(3, true).unwrap(), 0);
}

#[test]
fn large_object_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = DbOptions::new()
        .create(true)
        .pagesize(1024)
        .large_objects(384)
        .open(dir.path().join("lob.db"))
        .unwrap();

    let val = vec![0x5a; 1500];
    insert(&mut db, b"LOB", &val);
    assert_eq!(db.fetch(b"LOB").unwrap(), val);

    // Exactly one LOB chunk, ceil((1500+16)/1024) = 2 pages, owned by the
    // logical page hosting the key.
    let lobs: Vec<_> = db
        .walk_chunks()
        .unwrap()
        .into_iter()
        .filter(|c| c.chunk_type == Some(ChunkType::Lob))
        .collect();
    assert_eq!(lobs.len(), 1);
    assert_eq!(lobs[0].num_pages, 2);
    assert_eq!(lobs[0].data, 1500);
    assert_eq!(lobs[0].owner, db.key_logical_page(b"LOB"));

    // Same-size replace stays in place; the chunk count is stable.
    let val2 = vec![0x66; 1400];
    db.store(b"LOB", &val2, &StoreOptions::mode(StoreMode::Replace))
        .unwrap();
    assert_eq!(db.fetch(b"LOB").unwrap(), val2);
    let lobs2: Vec<_> = db
        .walk_chunks()
        .unwrap()
        .into_iter()
        .filter(|c| c.chunk_type == Some(ChunkType::Lob))
        .collect();
    assert_eq!(lobs2.len(), 1);
    assert_eq!(lobs2[0].start, lobs[0].start);

    // Deleting the entry frees the chunk.
    db.delete(b"LOB").unwrap();
    assert!(db
        .walk_chunks()
        .unwrap()
        .iter()
        .all(|c| c.chunk_type != Some(ChunkType::Lob)));
    assert_eq!(db.check(3, true).unwrap(), 0);
}

#[test]
fn spill_threshold_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = DbOptions::new()
        .create(true)
        .pagesize(1024)
        .large_objects(384)
        .open(dir.path().join("spill.db"))
        .unwrap();

    insert(&mut db, b"inline", &vec![1u8; 383]);
    insert(&mut db, b"spilled", &vec![2u8; 384]);

    let lob_owners: Vec<u32> = db
        .walk_chunks()
        .unwrap()
        .into_iter()
        .filter(|c| c.chunk_type == Some(ChunkType::Lob))
        .map(|c| c.owner)
        .collect();
    assert_eq!(lob_owners.len(), 1);
    assert_eq!(lob_owners[0], db.key_logical_page(b"spilled"));

    assert_eq!(db.fetch(b"inline").unwrap(), vec![1u8; 383]);
    assert_eq!(db.fetch(b"spilled").unwrap(), vec![2u8; 384]);
}

#[test]
fn replace_db_under_live_peer() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("live.db");

    let mut a = DbOptions::new().create(true).open(&path).unwrap();
    insert(&mut a, b"x", b"old");

    // An independent peer handle on the same file.
    let mut c = Db::open(&path).unwrap();
    assert_eq!(c.fetch(b"x").unwrap(), b"old");

    // Build the replacement DB with different contents.
    let new_path = dir.path().join("new.db");
    {
        let mut b = DbOptions::new().create(true).open(&new_path).unwrap();
        insert(&mut b, b"x", b"new");
        insert(&mut b, b"y", b"extra");
    }

    a.replace_db(&new_path).unwrap();
    assert_eq!(a.fetch(b"x").unwrap(), b"new");

    // The peer notices on its next operation and re-opens transparently.
    assert_eq!(c.fetch(b"x").unwrap(), b"new");
    assert_eq!(c.fetch(b"y").unwrap(), b"extra");
}

#[test]
fn partitioned_iteration_with_concurrent_stores() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("part.db");

    let mut p1 = DbOptions::new()
        .create(true)
        .pagesize(1024)
        .initial_size(8 * 1024)
        .lock_mode(LockMode::Partitioned)
        .open(&path)
        .unwrap();
    let mut original = std::collections::HashSet::new();
    for i in 0u64..100 {
        let k = format!("orig-{i}");
        insert(&mut p1, k.as_bytes(), b"v");
        original.insert(k.into_bytes());
    }

    let mut p2 = DbOptions::new()
        .pagesize(1024)
        .lock_mode(LockMode::Partitioned)
        .open(&path)
        .unwrap();

    // P1 iterates while P2 stores new records into pages already passed.
    let mut iter = Iter::new();
    let mut emitted = Vec::new();
    let mut added = std::collections::HashSet::new();
    let mut n = 0u64;
    while let Some((k, _v)) = p1.next_r(&mut iter).unwrap() {
        emitted.push(k);
        let nk = format!("added-{n}");
        p2.store(nk.as_bytes(), b"w", &StoreOptions::mode(StoreMode::Insert))
            .unwrap();
        added.insert(nk.into_bytes());
        n += 1;
    }

    // Iteration terminated and every original key was emitted exactly
    // once; concurrently added keys may or may not have been observed.
    let emitted_set: std::collections::HashSet<Vec<u8>> = emitted.iter().cloned().collect();
    assert_eq!(emitted_set.len(), emitted.len(), "no duplicates");
    for k in &original {
        assert!(emitted_set.contains(k), "missing original key");
    }
    for k in &emitted_set {
        assert!(
            original.contains(k) || added.contains(k),
            "emitted key that never existed"
        );
    }
}

#[test]
fn defrag_satisfies_large_allocation_without_growth() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = DbOptions::new()
        .create(true)
        .pagesize(1024)
        .large_objects(384)
        .open(dir.path().join("defrag.db"))
        .unwrap();

    // Six one-page LOB chunks, then free alternating ones to leave
    // interleaved free/live chunks.
    for i in 0u32..6 {
        insert(&mut db, format!("big-{i}").as_bytes(), &vec![i as u8; 900]);
    }
    for i in (0u32..6).step_by(2) {
        db.delete(format!("big-{i}").as_bytes()).unwrap();
    }
    let before = db.info().num_pages;

    // Cap the file at its current size so the allocator cannot grow it.
    let data_pages = before - 1;
    db.limit_size(data_pages, None).unwrap();
    assert_eq!(db.info().max_pages, before);

    // A three-page large object only fits by defragmenting.
    let big = vec![0xEEu8; 2800];
    insert(&mut db, b"big-new", &big);
    assert_eq!(db.fetch(b"big-new").unwrap(), big);
    assert_eq!(db.info().num_pages, before, "file must not grow");

    // Remaining old LOBs survived relocation.
    for i in [1u32, 3, 5] {
        assert_eq!(
            db.fetch(format!("big-{i}").as_bytes()).unwrap(),
            vec![i as u8; 900]
        );
    }
    assert_eq!(db.check(3, true).unwrap(), 0);
}

#[test]
fn fcopy_snapshot_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = DbOptions::new()
        .create(true)
        .pagesize(1024)
        .large_objects(384)
        .open(dir.path().join("src.db"))
        .unwrap();
    for i in 0u32..60 {
        insert(&mut db, format!("k{i}").as_bytes(), &vec![i as u8; 40]);
    }
    insert(&mut db, b"blob", &vec![9u8; 2000]);

    let copy_path = dir.path().join("copy.db");
    let mut out = std::fs::File::create(&copy_path).unwrap();
    db.fcopy(&mut out, true).unwrap();
    drop(out);

    let mut copy = Db::open(&copy_path).unwrap();
    assert_eq!(copy.count_records().unwrap(), db.count_records().unwrap());
    for i in 0u32..60 {
        assert_eq!(
            copy.fetch(format!("k{i}").as_bytes()).unwrap(),
            vec![i as u8; 40]
        );
    }
    assert_eq!(copy.fetch(b"blob").unwrap(), vec![9u8; 2000]);
    assert_eq!(copy.check(3, true).unwrap(), 0);
    assert_eq!(copy.info().pagesize, db.info().pagesize);
    assert_eq!(copy.info().dir_shift, db.info().dir_shift);
}

#[test]
fn dup_handles_follow_remaps() {
    let dir = tempfile::tempdir().unwrap();
    let mut a = DbOptions::new()
        .create(true)
        .pagesize(1024)
        .open(dir.path().join("dup.db"))
        .unwrap();
    let mut b = a.dup().unwrap();

    insert(&mut a, b"before", b"1");
    assert_eq!(b.fetch(b"before").unwrap(), b"1");

    // Force splits and file growth through handle A.
    for i in 0u32..500 {
        insert(&mut a, format!("grow-{i}").as_bytes(), &[3u8; 32]);
    }
    // B picks up the republished mapping on its next operation.
    assert_eq!(b.fetch(b"before").unwrap(), b"1");
    assert_eq!(b.fetch(b"grow-499").unwrap(), vec![3u8; 32]);
    assert_eq!(b.count_records().unwrap(), 501);
}

#[test]
fn purge_keeps_configuration() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = DbOptions::new()
        .create(true)
        .pagesize(1024)
        .large_objects(300)
        .open(dir.path().join("purge.db"))
        .unwrap();
    insert(&mut db, b"a", b"1");
    insert(&mut db, b"big", &vec![4u8; 800]);
    db.purge().unwrap();

    assert_eq!(db.count_records().unwrap(), 0);
    assert_eq!(db.info().spill_size, 300);
    // Large-object chunks were released.
    assert!(db
        .walk_chunks()
        .unwrap()
        .iter()
        .all(|c| c.chunk_type != Some(ChunkType::Lob)));
    // Config survives and the DB is usable.
    insert(&mut db, b"again", &vec![5u8; 700]);
    assert_eq!(db.fetch(b"again").unwrap(), vec![5u8; 700]);
}

#[test]
fn truncate_resets_everything() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = DbOptions::new()
        .create(true)
        .pagesize(1024)
        .large_objects(300)
        .open(dir.path().join("trunc.db"))
        .unwrap();
    for i in 0u32..100 {
        insert(&mut db, format!("k{i}").as_bytes(), &[1u8; 32]);
    }
    db.truncate_reset().unwrap();
    assert_eq!(db.count_records().unwrap(), 0);
    assert_eq!(db.info().spill_size, 0);
    assert_eq!(db.info().dir_shift, 0);
    insert(&mut db, b"fresh", b"start");
    assert_eq!(db.fetch(b"fresh").unwrap(), b"start");
}

#[test]
fn windowed_mode_point_operations() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = DbOptions::new()
        .create(true)
        .pagesize(1024)
        .initial_size(16 * 1024)
        .large_objects(384)
        .windowed(8 * 1024)
        .open(dir.path().join("win.db"))
        .unwrap();

    for i in 0u32..100 {
        insert(&mut db, format!("w{i}").as_bytes(), &vec![i as u8; 48]);
    }
    // A three-page oversized chunk pulls multi-slot window mappings in.
    let big = vec![0x77u8; 2500];
    insert(&mut db, b"big", &big);

    for i in 0u32..100 {
        assert_eq!(
            db.fetch(format!("w{i}").as_bytes()).unwrap(),
            vec![i as u8; 48]
        );
    }
    assert_eq!(db.fetch(b"big").unwrap(), big);
    let (reused, remapped, _) = db.window_stats().unwrap();
    assert!(remapped > 0);
    assert!(reused > 0);
}

#[test]
fn memory_only_cache() {
    let mut db = DbOptions::new()
        .memory_only(true)
        .pagesize(1024)
        .initial_size(8 * 1024)
        .cache_mode(CacheMode {
            policy: CacheModeKind::Lfu,
            evict_clean_first: false,
        })
        .open("/nonexistent/memonly")
        .unwrap();

    // Growth is pinned so allocation failure cannot remap data away.
    let info = db.info();
    assert_eq!(info.max_pages, info.num_pages);

    for i in 0u64..2000 {
        db.store(
            &i.to_le_bytes(),
            &[6u8; 64],
            &StoreOptions::mode(StoreMode::Replace),
        )
        .unwrap();
    }
    let count = db.count_records().unwrap();
    assert!(count > 0 && count < 2000, "eviction kept the cache bounded");
}

#[test]
fn count_records_matches_page_sums() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = DbOptions::new()
        .create(true)
        .pagesize(1024)
        .open(dir.path().join("count.db"))
        .unwrap();
    for i in 0u32..250 {
        insert(&mut db, format!("c{i}").as_bytes(), &[0u8; 16]);
    }
    for i in (0u32..250).step_by(5) {
        db.delete(format!("c{i}").as_bytes()).unwrap();
    }
    let total = db.count_records().unwrap();
    let width = 1u32 << db.info().dir_shift;
    let mut by_pages = 0u64;
    for p in 0..width {
        by_pages += db.count_page_entries(p).unwrap();
    }
    assert_eq!(total, by_pages);
    assert_eq!(total, 200);
}

#[test]
fn count_pages_matches_chunk_walk() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = DbOptions::new()
        .create(true)
        .pagesize(1024)
        .large_objects(384)
        .open(dir.path().join("pages.db"))
        .unwrap();
    for i in 0u32..200 {
        insert(&mut db, format!("pg{i}").as_bytes(), &[1u8; 24]);
    }
    insert(&mut db, b"blob", &vec![2u8; 1800]);
    // Leave a free chunk behind so used != total.
    db.delete(b"blob").unwrap();
    insert(&mut db, b"blob2", &vec![3u8; 3000]);

    let used = db.count_pages().unwrap();
    let by_walk: u64 = db
        .walk_chunks()
        .unwrap()
        .iter()
        .filter(|c| {
            matches!(
                c.chunk_type,
                Some(ChunkType::Dir) | Some(ChunkType::Data) | Some(ChunkType::Lob)
            )
        })
        .map(|c| c.num_pages as u64)
        .sum();
    assert_eq!(used, by_walk);
    assert!(used > 0);
    assert!(used <= db.info().num_pages as u64);
}

#[test]
fn insert_delete_leaves_counts_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = DbOptions::new()
        .create(true)
        .open(dir.path().join("idem.db"))
        .unwrap();
    for i in 0u32..50 {
        insert(&mut db, format!("base{i}").as_bytes(), &[2u8; 10]);
    }
    let before = db.count_records().unwrap();

    insert(&mut db, b"transient", b"x");
    db.delete(b"transient").unwrap();

    assert_eq!(db.count_records().unwrap(), before);
    // The slot is reusable.
    insert(&mut db, b"transient", b"y");
    assert_eq!(db.fetch(b"transient").unwrap(), b"y");
}
