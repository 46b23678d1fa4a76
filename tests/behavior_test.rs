// Behavioral properties: replace byte-identity across size classes,
// clean-first eviction, the shake callback, fetch metadata, alignment
// modes, read-only handles, pruning, and stats counters.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mmapdb::{
    Alignment, CacheMode, CacheModeKind, CleanDisposition, CleanFunc, Db, DbError, DbOptions,
    Iter, ShakeFunc, ShakeItem, StoreMode, StoreOptions,
};

fn insert(db: &mut Db, key: &[u8], val: &[u8]) {
    db.store(key, val, &StoreOptions::mode(StoreMode::Insert))
        .unwrap();
}

fn replace(db: &mut Db, key: &[u8], val: &[u8]) {
    db.store(key, val, &StoreOptions::mode(StoreMode::Replace))
        .unwrap();
}

#[test]
fn replace_is_byte_identical_across_size_classes() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = DbOptions::new()
        .create(true)
        .pagesize(1024)
        .large_objects(384)
        .open(dir.path().join("t.db"))
        .unwrap();

    // Same size, smaller, larger, inline->LOB, LOB->LOB, LOB->inline.
    let sizes = [64usize, 64, 10, 300, 500, 2000, 3000, 100];
    for (round, n) in sizes.iter().enumerate() {
        let val: Vec<u8> = (0..*n).map(|i| (i as u8) ^ (round as u8)).collect();
        replace(&mut db, b"proteus", &val);
        assert_eq!(db.fetch(b"proteus").unwrap(), val, "round {round}");
        assert_eq!(db.check(3, true).unwrap(), 0, "round {round}");
    }
}

struct CountingClean {
    calls: Arc<AtomicUsize>,
}

impl CleanFunc for CountingClean {
    fn clean(&mut self, _key: &[u8], _val: &[u8]) -> CleanDisposition {
        self.calls.fetch_add(1, Ordering::Relaxed);
        CleanDisposition::Evictable
    }
}

#[test]
fn clean_first_eviction_prefers_clean_entries() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = DbOptions::new()
        .create(true)
        .pagesize(1024)
        .cache_mode(CacheMode {
            policy: CacheModeKind::Lfu,
            evict_clean_first: true,
        })
        .open(dir.path().join("t.db"))
        .unwrap();
    db.limit_size(1, None).unwrap();

    // Two dirty entries, the rest stored clean.
    insert(&mut db, b"dirty-a", &[1u8; 100]);
    insert(&mut db, b"dirty-b", &[2u8; 100]);
    for i in 0u64..6 {
        db.store(
            &i.to_le_bytes(),
            &[3u8; 100],
            &StoreOptions::mode(StoreMode::Insert).clean(),
        )
        .unwrap();
    }

    // Force evictions; clean entries must go first.
    for i in 100u64..104 {
        db.store(
            &i.to_le_bytes(),
            &[4u8; 100],
            &StoreOptions::mode(StoreMode::Insert).clean(),
        )
        .unwrap();
    }
    assert_eq!(db.fetch(b"dirty-a").unwrap(), vec![1u8; 100]);
    assert_eq!(db.fetch(b"dirty-b").unwrap(), vec![2u8; 100]);
}

#[test]
fn clean_callback_runs_before_dirty_eviction() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut db = DbOptions::new()
        .create(true)
        .pagesize(1024)
        .cache_mode(CacheMode {
            policy: CacheModeKind::Lru,
            evict_clean_first: true,
        })
        .open(dir.path().join("t.db"))
        .unwrap();
    db.limit_size(1, None).unwrap();
    db.set_clean(Some(Box::new(CountingClean {
        calls: Arc::clone(&calls),
    })));

    // Every entry is dirty, so evictions must go through the clean-back.
    for i in 0u64..12 {
        db.store(
            &i.to_le_bytes(),
            &[5u8; 100],
            &StoreOptions::mode(StoreMode::Replace),
        )
        .unwrap();
    }
    assert!(calls.load(Ordering::Relaxed) > 0, "clean-back never invoked");
}

struct DropLargest;

impl ShakeFunc for DropLargest {
    fn shake(&mut self, _key: &[u8], _val: &[u8], entries: &[ShakeItem]) -> Vec<usize> {
        let mut best = 0;
        for (i, e) in entries.iter().enumerate() {
            if e.size > entries[best].size {
                best = i;
            }
        }
        vec![best]
    }
}

#[test]
fn shake_callback_makes_room_without_split() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = DbOptions::new()
        .create(true)
        .pagesize(1024)
        .open(dir.path().join("t.db"))
        .unwrap();
    db.limit_size(1, Some(Box::new(DropLargest))).unwrap();

    insert(&mut db, b"small-1", &[1u8; 50]);
    insert(&mut db, b"huge", &[2u8; 700]);
    insert(&mut db, b"small-2", &[3u8; 50]);
    // No split possible; the shake drops "huge" to fit this.
    insert(&mut db, b"newcomer", &[4u8; 600]);

    assert!(matches!(db.fetch(b"huge"), Err(DbError::NotFound)));
    assert_eq!(db.fetch(b"newcomer").unwrap(), vec![4u8; 600]);
    assert_eq!(db.fetch(b"small-1").unwrap(), vec![1u8; 50]);
    assert_eq!(db.fetch(b"small-2").unwrap(), vec![3u8; 50]);
}

#[test]
fn fetch_info_reports_cache_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = DbOptions::new()
        .create(true)
        .cache_mode(CacheMode {
            policy: CacheModeKind::Lfu,
            evict_clean_first: false,
        })
        .open(dir.path().join("t.db"))
        .unwrap();

    insert(&mut db, b"watched", b"value");
    let (_, info0) = db.fetch_info(b"watched").unwrap();
    assert!(info0.dirty, "fresh store is dirty");

    db.fetch(b"watched").unwrap();
    db.fetch(b"watched").unwrap();
    let (_, info) = db.fetch_info(b"watched").unwrap();
    assert!(info.num_accesses >= 3);

    db.store(b"watched", b"value", &StoreOptions::mode(StoreMode::Replace).clean())
        .unwrap();
    let (_, info) = db.fetch_info(b"watched").unwrap();
    assert!(!info.dirty, "clean store clears the dirty bit");
}

#[test]
fn aligned_mode_roundtrips_odd_lengths() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = DbOptions::new()
        .create(true)
        .pagesize(1024)
        .alignment(Alignment::EightBytes)
        .open(dir.path().join("t.db"))
        .unwrap();

    for (i, klen) in [1usize, 3, 7, 8, 9].iter().enumerate() {
        let key = vec![b'k' + i as u8; *klen];
        let val = vec![i as u8; 2 * i + 1];
        insert(&mut db, &key, &val);
        assert_eq!(db.fetch(&key).unwrap(), val);
    }
    assert_eq!(db.check(3, true).unwrap(), 0);
}

#[test]
fn read_only_handle_rejects_writes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.db");
    {
        let mut db = DbOptions::new().create(true).open(&path).unwrap();
        insert(&mut db, b"k", b"v");
    }
    let mut ro = DbOptions::new().read_only(true).open(&path).unwrap();
    assert_eq!(ro.fetch(b"k").unwrap(), b"v");
    assert!(ro
        .store(b"x", b"y", &StoreOptions::mode(StoreMode::Insert))
        .is_err());
}

#[test]
fn prune_deletes_by_predicate() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = DbOptions::new()
        .create(true)
        .pagesize(1024)
        .open(dir.path().join("t.db"))
        .unwrap();
    for i in 0u32..120 {
        insert(&mut db, format!("p{i}").as_bytes(), &[(i % 2) as u8; 8]);
    }
    // Drop every entry whose value is odd-tagged.
    db.prune(|_k, v| v[0] == 1).unwrap();
    assert_eq!(db.count_records().unwrap(), 60);
    assert_eq!(db.fetch(b"p0").unwrap(), vec![0u8; 8]);
    assert!(matches!(db.fetch(b"p1"), Err(DbError::NotFound)));
    assert_eq!(db.check(3, true).unwrap(), 0);
}

#[test]
fn handle_stats_count_operations() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = DbOptions::new()
        .create(true)
        .open(dir.path().join("t.db"))
        .unwrap();
    insert(&mut db, b"a", b"1");
    insert(&mut db, b"b", b"2");
    let _ = db.fetch(b"a");
    let _ = db.fetch(b"missing");
    let _ = db.delete(b"b");

    let snap = db.stats.snapshot();
    assert_eq!(snap.stores, 2);
    assert_eq!(snap.fetches, 2);
    assert_eq!(snap.fetch_not_found, 1);
    assert_eq!(snap.deletes, 1);
}

#[test]
fn set_hash_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.db");
    {
        let mut db = DbOptions::new().create(true).open(&path).unwrap();
        db.set_hash(mmapdb::hash::HASH_CRC32).unwrap();
        insert(&mut db, b"stable", b"addressing");
        // Hash choice is frozen once entries exist.
        assert!(db.set_hash(mmapdb::hash::HASH_JENKINS).is_err());
    }
    let mut db = Db::open(&path).unwrap();
    assert_eq!(db.info().hash_id, mmapdb::hash::HASH_CRC32);
    assert_eq!(db.fetch(b"stable").unwrap(), b"addressing");
}

#[test]
fn iterator_walks_every_page_once() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = DbOptions::new()
        .create(true)
        .pagesize(1024)
        .initial_size(4 * 1024)
        .open(dir.path().join("t.db"))
        .unwrap();
    let mut expect = std::collections::HashSet::new();
    for i in 0u32..80 {
        let k = format!("it{i}");
        insert(&mut db, k.as_bytes(), b"x");
        expect.insert(k.into_bytes());
    }
    let mut iter = Iter::new();
    let mut seen = std::collections::HashSet::new();
    while let Some((k, _)) = db.next_r(&mut iter).unwrap() {
        assert!(seen.insert(k), "duplicate emission");
    }
    assert_eq!(seen, expect);

    // Restarting with first_r replays from the beginning.
    let first = db.first_r(&mut iter).unwrap();
    assert!(first.is_some());
}

#[test]
fn sync_and_fsync_are_clean_noops_or_flushes() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = DbOptions::new()
        .create(true)
        .fsync_on_close(true)
        .open(dir.path().join("t.db"))
        .unwrap();
    insert(&mut db, b"durable", b"enough");
    db.sync().unwrap();
    db.fsync().unwrap();
    drop(db);

    let mut db = Db::open(dir.path().join("t.db")).unwrap();
    assert_eq!(db.fetch(b"durable").unwrap(), b"enough");
}
