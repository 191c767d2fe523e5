//! Scan engine tests: seqno ordering, stale-mapping suppression, filters,
//! pause/resume, snapshot isolation and the delete-vBucket drain.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use kelp_kvstore::{
    CacheLookup, CacheLookupCallback, CallbackStatus, DocKey, DocumentFilter, GetValue, Item,
    KVStore, KVStoreConfig, ScanCallback, ScanStatus, ValueFilter,
};
use tempfile::TempDir;

fn test_config(dir: &Path) -> KVStoreConfig {
    KVStoreConfig {
        db_name: dir.to_path_buf(),
        max_vbuckets: 16,
        max_shards: 1,
        shard_id: 0,
        ..KVStoreConfig::default()
    }
}

fn open_store(dir: &Path) -> KVStore {
    KVStore::open(test_config(dir)).unwrap()
}

fn commit_items(store: &KVStore, items: Vec<Item>) {
    store.begin(Box::new(()));
    for item in items {
        if item.deleted {
            store.del(item, Box::new(|_, _| {})).unwrap();
        } else {
            store.set(item, Box::new(|_, _| {})).unwrap();
        }
    }
    store.commit(None).unwrap();
}

/// Shared scan sink: records emissions and lookups, and can simulate
/// consumer memory pressure or a populated consumer-side cache.
#[derive(Default)]
struct SinkInner {
    values: Vec<GetValue>,
    lookups: Vec<CacheLookup>,
    /// When set, report NoMemory once this many values have been emitted.
    pause_after: Option<usize>,
    /// Seqnos the consumer claims to already hold.
    cached_seqnos: HashSet<i64>,
}

#[derive(Clone, Default)]
struct Sink(Arc<Mutex<SinkInner>>);

impl Sink {
    fn values(&self) -> Vec<(Vec<u8>, i64, bool)> {
        self.0
            .lock()
            .unwrap()
            .values
            .iter()
            .map(|v| (v.item.key.data().to_vec(), v.item.by_seqno, v.item.deleted))
            .collect()
    }

    fn lookup_count(&self) -> usize {
        self.0.lock().unwrap().lookups.len()
    }

    fn resume(&self) {
        self.0.lock().unwrap().pause_after = None;
    }
}

struct ValueCb(Sink);
impl ScanCallback for ValueCb {
    fn on_value(&mut self, value: GetValue) -> CallbackStatus {
        let mut inner = self.0 .0.lock().unwrap();
        if let Some(limit) = inner.pause_after {
            if inner.values.len() >= limit {
                return CallbackStatus::NoMemory;
            }
        }
        inner.values.push(value);
        CallbackStatus::Continue
    }
}

struct LookupCb(Sink);
impl CacheLookupCallback for LookupCb {
    fn on_lookup(&mut self, lookup: &CacheLookup) -> CallbackStatus {
        let mut inner = self.0 .0.lock().unwrap();
        inner.lookups.push(lookup.clone());
        if inner.cached_seqnos.contains(&lookup.by_seqno) {
            return CallbackStatus::KeyExists;
        }
        CallbackStatus::Continue
    }
}

fn run_scan(
    store: &KVStore,
    sink: &Sink,
    vbid: u16,
    start_seqno: i64,
    doc_filter: DocumentFilter,
    val_filter: ValueFilter,
) -> ScanStatus {
    let mut ctx = store
        .init_scan(
            Box::new(ValueCb(sink.clone())),
            Box::new(LookupCb(sink.clone())),
            vbid,
            start_seqno,
            doc_filter,
            val_filter,
        )
        .unwrap();
    let status = store.scan(&mut ctx);
    store.destroy_scan(ctx);
    status
}

#[test]
fn test_scan_yields_seqno_order() {
    let dir = TempDir::new().unwrap();
    let store = open_store(dir.path());

    commit_items(
        &store,
        vec![
            Item::new(DocKey::from_bytes("a"), 0, 5, "va"),
            Item::new(DocKey::from_bytes("b"), 0, 3, "vb"),
            Item::new(DocKey::from_bytes("c"), 0, 7, "vc"),
        ],
    );

    let sink = Sink::default();
    let status = run_scan(
        &store,
        &sink,
        0,
        0,
        DocumentFilter::NoDeletes,
        ValueFilter::MetaAndValue,
    );
    assert_eq!(status, ScanStatus::Success);
    assert_eq!(
        sink.values(),
        vec![
            (b"b".to_vec(), 3, false),
            (b"a".to_vec(), 5, false),
            (b"c".to_vec(), 7, false),
        ]
    );
}

#[test]
fn test_overwrite_emits_new_record_once() {
    let dir = TempDir::new().unwrap();
    let store = open_store(dir.path());

    commit_items(&store, vec![Item::new(DocKey::from_bytes("k"), 0, 1, "old")]);
    commit_items(&store, vec![Item::new(DocKey::from_bytes("k"), 0, 2, "new")]);

    let sink = Sink::default();
    let status = run_scan(
        &store,
        &sink,
        0,
        0,
        DocumentFilter::NoDeletes,
        ValueFilter::MetaAndValue,
    );
    assert_eq!(status, ScanStatus::Success);
    // The stale seqno mapping left by the overwrite is suppressed.
    assert_eq!(sink.values(), vec![(b"k".to_vec(), 2, false)]);
}

#[test]
fn test_deletion_filtering() {
    let dir = TempDir::new().unwrap();
    let store = open_store(dir.path());

    commit_items(
        &store,
        vec![
            Item::new(DocKey::from_bytes("live"), 0, 1, "v"),
            Item::deletion(DocKey::from_bytes("dead"), 0, 2),
        ],
    );

    let sink = Sink::default();
    run_scan(
        &store,
        &sink,
        0,
        0,
        DocumentFilter::NoDeletes,
        ValueFilter::MetaAndValue,
    );
    assert_eq!(sink.values(), vec![(b"live".to_vec(), 1, false)]);

    let sink = Sink::default();
    run_scan(
        &store,
        &sink,
        0,
        0,
        DocumentFilter::IncludeDeletes,
        ValueFilter::MetaAndValue,
    );
    assert_eq!(
        sink.values(),
        vec![(b"live".to_vec(), 1, false), (b"dead".to_vec(), 2, true)]
    );
}

#[test]
fn test_keys_only_filter_suppresses_bodies() {
    let dir = TempDir::new().unwrap();
    let store = open_store(dir.path());

    commit_items(&store, vec![Item::new(DocKey::from_bytes("k"), 0, 1, "body")]);

    let sink = Sink::default();
    run_scan(
        &store,
        &sink,
        0,
        0,
        DocumentFilter::NoDeletes,
        ValueFilter::KeysOnly,
    );
    let inner = sink.0.lock().unwrap();
    assert_eq!(inner.values.len(), 1);
    assert!(inner.values[0].keys_only);
    assert!(inner.values[0].item.body.is_empty());
}

#[test]
fn test_scan_past_high_seqno_is_empty_success() {
    let dir = TempDir::new().unwrap();
    let store = open_store(dir.path());

    commit_items(&store, vec![Item::new(DocKey::from_bytes("k"), 0, 3, "v")]);

    let sink = Sink::default();
    let mut ctx = store
        .init_scan(
            Box::new(ValueCb(sink.clone())),
            Box::new(LookupCb(sink.clone())),
            0,
            100,
            DocumentFilter::NoDeletes,
            ValueFilter::MetaAndValue,
        )
        .unwrap();
    assert_eq!(ctx.document_count(), 0);
    assert_eq!(store.scan(&mut ctx), ScanStatus::Success);
    store.destroy_scan(ctx);
    assert!(sink.values().is_empty());
    assert_eq!(sink.lookup_count(), 0);
}

#[test]
fn test_scan_window_bounds() {
    let dir = TempDir::new().unwrap();
    let store = open_store(dir.path());

    commit_items(
        &store,
        (1..=6i64)
            .map(|seqno| Item::new(DocKey::from_bytes(format!("k{seqno}")), 0, seqno, "v"))
            .collect(),
    );

    let sink = Sink::default();
    let mut ctx = store
        .init_scan(
            Box::new(ValueCb(sink.clone())),
            Box::new(LookupCb(sink.clone())),
            0,
            2,
            DocumentFilter::NoDeletes,
            ValueFilter::MetaAndValue,
        )
        .unwrap();
    // Inclusive at both ends: seqnos 2..=6 covers five documents.
    assert_eq!(ctx.max_seqno(), 6);
    assert_eq!(ctx.document_count(), 5);
    assert_eq!(store.scan(&mut ctx), ScanStatus::Success);
    store.destroy_scan(ctx);

    let seqnos: Vec<i64> = sink.values().iter().map(|(_, s, _)| *s).collect();
    assert_eq!(seqnos, vec![2, 3, 4, 5, 6]);
}

#[test]
fn test_scan_pause_and_resume_is_exact() {
    let dir = TempDir::new().unwrap();
    let store = open_store(dir.path());

    commit_items(
        &store,
        (1..=5i64)
            .map(|seqno| Item::new(DocKey::from_bytes(format!("k{seqno}")), 0, seqno, "v"))
            .collect(),
    );

    let sink = Sink::default();
    sink.0.lock().unwrap().pause_after = Some(2);

    let mut ctx = store
        .init_scan(
            Box::new(ValueCb(sink.clone())),
            Box::new(LookupCb(sink.clone())),
            0,
            0,
            DocumentFilter::NoDeletes,
            ValueFilter::MetaAndValue,
        )
        .unwrap();

    assert_eq!(store.scan(&mut ctx), ScanStatus::Again);
    assert_eq!(ctx.last_read_seqno(), 2);
    assert_eq!(sink.values().len(), 2);

    // Resume: the paused document is delivered exactly once, in order.
    sink.resume();
    assert_eq!(store.scan(&mut ctx), ScanStatus::Success);
    store.destroy_scan(ctx);

    let seqnos: Vec<i64> = sink.values().iter().map(|(_, s, _)| *s).collect();
    assert_eq!(seqnos, vec![1, 2, 3, 4, 5]);
}

#[test]
fn test_scan_resume_after_completion_is_noop() {
    let dir = TempDir::new().unwrap();
    let store = open_store(dir.path());

    commit_items(&store, vec![Item::new(DocKey::from_bytes("k"), 0, 1, "v")]);

    let sink = Sink::default();
    let mut ctx = store
        .init_scan(
            Box::new(ValueCb(sink.clone())),
            Box::new(LookupCb(sink.clone())),
            0,
            0,
            DocumentFilter::NoDeletes,
            ValueFilter::MetaAndValue,
        )
        .unwrap();
    assert_eq!(store.scan(&mut ctx), ScanStatus::Success);
    assert_eq!(store.scan(&mut ctx), ScanStatus::Success);
    store.destroy_scan(ctx);
    assert_eq!(sink.values().len(), 1);
}

#[test]
fn test_cache_lookup_short_circuits_emission() {
    let dir = TempDir::new().unwrap();
    let store = open_store(dir.path());

    commit_items(
        &store,
        (1..=3i64)
            .map(|seqno| Item::new(DocKey::from_bytes(format!("k{seqno}")), 0, seqno, "v"))
            .collect(),
    );

    let sink = Sink::default();
    sink.0.lock().unwrap().cached_seqnos.insert(2);

    let status = run_scan(
        &store,
        &sink,
        0,
        0,
        DocumentFilter::NoDeletes,
        ValueFilter::MetaAndValue,
    );
    assert_eq!(status, ScanStatus::Success);

    // Every document was offered to the lookup, but the cached one was not
    // materialised.
    assert_eq!(sink.lookup_count(), 3);
    let seqnos: Vec<i64> = sink.values().iter().map(|(_, s, _)| *s).collect();
    assert_eq!(seqnos, vec![1, 3]);
}

#[test]
fn test_scan_snapshot_isolation_from_later_commits() {
    let dir = TempDir::new().unwrap();
    let store = open_store(dir.path());

    commit_items(
        &store,
        vec![
            Item::new(DocKey::from_bytes("a"), 0, 1, "a1"),
            Item::new(DocKey::from_bytes("b"), 0, 2, "b1"),
        ],
    );

    let sink = Sink::default();
    let mut ctx = store
        .init_scan(
            Box::new(ValueCb(sink.clone())),
            Box::new(LookupCb(sink.clone())),
            0,
            0,
            DocumentFilter::NoDeletes,
            ValueFilter::MetaAndValue,
        )
        .unwrap();

    // Overwrite "a" after the snapshot was pinned. Without the snapshot the
    // record re-read would carry seqno 3 and the scan would drop "a" as a
    // stale mapping; under the snapshot it must still observe a@1.
    commit_items(&store, vec![Item::new(DocKey::from_bytes("a"), 0, 3, "a2")]);

    assert_eq!(store.scan(&mut ctx), ScanStatus::Success);
    store.destroy_scan(ctx);

    let bodies: Vec<(Vec<u8>, i64, bool)> = sink.values();
    assert_eq!(
        bodies,
        vec![(b"a".to_vec(), 1, false), (b"b".to_vec(), 2, false)]
    );
    let inner = sink.0.lock().unwrap();
    assert_eq!(inner.values[0].item.body.as_ref(), b"a1");
}

#[test]
fn test_delete_vbucket_blocks_until_scan_destroyed() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(open_store(dir.path()));

    commit_items(&store, vec![Item::new(DocKey::from_bytes("k"), 4, 1, "v")]);
    let vb_dir = dir.path().join("rocksdb.4");
    assert!(vb_dir.exists());

    let sink = Sink::default();
    let ctx = store
        .init_scan(
            Box::new(ValueCb(sink.clone())),
            Box::new(LookupCb(sink)),
            4,
            0,
            DocumentFilter::NoDeletes,
            ValueFilter::MetaAndValue,
        )
        .unwrap();

    let deleter = {
        let store = store.clone();
        std::thread::spawn(move || store.delete_vbucket(4))
    };

    // The scan still pins the handle, so the deleter must be spinning.
    std::thread::sleep(std::time::Duration::from_millis(200));
    assert!(!deleter.is_finished());
    assert!(vb_dir.exists());

    store.destroy_scan(ctx);
    deleter.join().unwrap().unwrap();
    assert!(!vb_dir.exists());
}
