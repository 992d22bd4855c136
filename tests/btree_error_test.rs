mod test_utils;

use std::sync::Arc;

use parking_lot::Mutex;
use small_store::{
    storage::{MemoryStore, PagePosition, PageStore},
    tx_log::MemoryLogSink,
    types::SmallResult,
    EngineConfig, ErrorKind, SmallError, StorageEngine, Tree, TreeKind,
};
use test_utils::{key, setup, value, FILE_ID};

/// A memory store that can only grow its files a limited number of
/// times.
struct LimitedStore {
    inner: MemoryStore,
    // remaining raises, negative for no limit
    raises: Mutex<i64>,
}

impl LimitedStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            raises: Mutex::new(-1),
        }
    }

    fn limit_raises(&self, raises: i64) {
        *self.raises.lock() = raises;
    }
}

impl PageStore for LimitedStore {
    fn read_page(&self, pos: &PagePosition, buf: &mut [u8]) -> SmallResult {
        self.inner.read_page(pos, buf)
    }

    fn write_page(&self, pos: &PagePosition, buf: &[u8]) -> SmallResult {
        self.inner.write_page(pos, buf)
    }

    fn page_count(&self, file_id: i32) -> SmallResult<i64> {
        self.inner.page_count(file_id)
    }

    fn raise(&self, file_id: i32, length: i64) -> SmallResult {
        {
            let mut raises = self.raises.lock();
            if *raises == 0 {
                return Err(SmallError::new(ErrorKind::Io, "no space left on device"));
            }
            if *raises > 0 {
                *raises -= 1;
            }
        }
        self.inner.raise(file_id, length)
    }
}

fn new_engine(store: &Arc<LimitedStore>) -> StorageEngine {
    // a small pool, so clean pages are reloaded from the store
    let engine = StorageEngine::new(
        EngineConfig::with_lru_limit(4),
        store.clone(),
        Arc::new(MemoryLogSink::new()),
    );
    engine.create_file(FILE_ID).unwrap();
    engine
}

/// Insert ascending keys from `start` until an insert fails. Returns the
/// first key that didn't go in and the error.
fn insert_until_failure(engine: &StorageEngine, tree: &Tree, start: u32) -> (u32, SmallError) {
    let tx = engine.begin_transaction();
    for i in start..start + 10_000 {
        if let Err(e) = tree.insert(engine, &tx, &key(i), &value(i)) {
            engine.commit_transaction(&tx);
            return (i, e);
        }
    }
    panic!("no insert failed");
}

fn assert_readable(engine: &StorageEngine, tree: &Tree, count: u32) {
    for i in 0..count {
        assert_eq!(Some(value(i)), tree.get(engine, &key(i)).unwrap(), "key {}", i);
    }
}

#[test]
fn test_failed_split_keeps_tree_intact() {
    setup();
    let store = Arc::new(LimitedStore::new());
    let engine = new_engine(&store);
    let tree = Tree::create(&engine, FILE_ID, TreeKind::Primary).unwrap();

    let tx = engine.begin_transaction();
    for i in 0..2000 {
        tree.insert(&engine, &tx, &key(i), &value(i)).unwrap();
    }
    engine.commit_transaction(&tx);
    let before = tree.check_integrity(&engine).unwrap();
    assert!(before.depth >= 1, "{:?}", before);
    let length = engine.file_length(FILE_ID).unwrap();

    store.limit_raises(0);
    let (failed, e) = insert_until_failure(&engine, &tree, 2000);
    assert_eq!(ErrorKind::Io, e.kind());
    assert_eq!(None, tree.get(&engine, &key(failed)).unwrap());
    assert_eq!(length, engine.file_length(FILE_ID).unwrap());

    // write everything out, then read it all back through the small pool
    engine.flush().unwrap();
    assert_readable(&engine, &tree, failed);
    let report = tree.check_integrity(&engine).unwrap();
    assert_eq!(failed as usize, report.entries);
    assert_eq!(before.depth, report.depth);

    store.limit_raises(-1);
    let tx = engine.begin_transaction();
    tree.insert(&engine, &tx, &key(failed), &value(failed)).unwrap();
    engine.commit_transaction(&tx);
    assert_readable(&engine, &tree, failed + 1);
    assert_eq!(failed as usize + 1, tree.check_integrity(&engine).unwrap().entries);
}

#[test]
fn test_partial_reserve_goes_back_to_free_map() {
    setup();
    let store = Arc::new(LimitedStore::new());
    let engine = new_engine(&store);
    let tree = Tree::create(&engine, FILE_ID, TreeKind::Primary).unwrap();
    let length = engine.file_length(FILE_ID).unwrap();

    // splitting the root leaf takes two pages, only one can be had
    store.limit_raises(1);
    let (failed, e) = insert_until_failure(&engine, &tree, 0);
    assert_eq!(ErrorKind::Io, e.kind());
    assert_eq!(vec![length], engine.free_pages(FILE_ID).unwrap());
    assert_eq!(length + 1, engine.file_length(FILE_ID).unwrap());

    let report = tree.check_integrity(&engine).unwrap();
    assert_eq!(0, report.depth);
    assert_eq!(failed as usize, report.entries);

    store.limit_raises(-1);
    let tx = engine.begin_transaction();
    tree.insert(&engine, &tx, &key(failed), &value(failed)).unwrap();
    engine.commit_transaction(&tx);

    assert!(engine.free_pages(FILE_ID).unwrap().is_empty());
    assert_eq!(length + 2, engine.file_length(FILE_ID).unwrap());
    let report = tree.check_integrity(&engine).unwrap();
    assert_eq!(1, report.depth);
    assert_eq!(failed as usize + 1, report.entries);
    assert_readable(&engine, &tree, failed + 1);
}
