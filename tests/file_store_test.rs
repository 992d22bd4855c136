mod test_utils;

use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use small_store::{
    storage::{FileStore, PagePosition, PageStore, PAGE_SIZE},
    tx_log::MemoryLogSink,
    EngineConfig, StorageEngine, Tree, TreeKind,
};
use test_utils::{assert_tree_content, insert_committed, key, setup, FILE_ID};

fn scratch_dir(name: &str) -> PathBuf {
    let dir = env::temp_dir().join(format!("small-store-{}-{}", name, std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    dir
}

fn new_engine(dir: &Path) -> StorageEngine {
    StorageEngine::new(
        EngineConfig::with_lru_limit(64),
        Arc::new(FileStore::new(dir).unwrap()),
        Arc::new(MemoryLogSink::new()),
    )
}

#[test]
fn test_unwritten_pages_read_as_zeroes() {
    setup();
    let dir = scratch_dir("zeroes");
    let store = FileStore::new(&dir).unwrap();
    let pos = PagePosition::new(3, 2);

    let mut buf = vec![7; PAGE_SIZE];
    store.read_page(&pos, &mut buf).unwrap();
    assert!(buf.iter().all(|b| *b == 0));
    assert_eq!(0, store.page_count(3).unwrap());

    let page: Vec<u8> = (0..PAGE_SIZE).map(|i| (i % 251) as u8).collect();
    store.write_page(&pos, &page).unwrap();
    assert_eq!(3, store.page_count(3).unwrap());
    store.read_page(&pos, &mut buf).unwrap();
    assert_eq!(page, buf);

    // raising never shrinks
    store.raise(3, 10).unwrap();
    store.raise(3, 5).unwrap();
    assert_eq!(10, store.page_count(3).unwrap());

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_reopen_after_flush() {
    setup();
    let dir = scratch_dir("reopen");

    let (root, length) = {
        let engine = new_engine(&dir);
        engine.create_file(FILE_ID).unwrap();
        let tree = Tree::create(&engine, FILE_ID, TreeKind::Primary).unwrap();
        insert_committed(&engine, &tree, 0..3000);

        let tx = engine.begin_transaction();
        for i in 0..1000 {
            assert!(tree.delete(&engine, &tx, &key(i)).unwrap());
        }
        engine.commit_transaction(&tx);

        assert!(engine.flush().unwrap() > 0);
        (tree.root(), engine.file_length(FILE_ID).unwrap())
    };

    let engine = new_engine(&dir);
    engine.open_file(FILE_ID).unwrap();
    assert_eq!(length, engine.file_length(FILE_ID).unwrap());

    let tree = Tree::open(root);
    let expected: Vec<u32> = (1000..3000).collect();
    assert_tree_content(&engine, &tree, &expected);

    // the free-page map came back too
    assert!(!engine.free_pages(FILE_ID).unwrap().is_empty());
    let reused = engine.allocate_page(FILE_ID).unwrap();
    assert!(reused.page_number < length);

    fs::remove_dir_all(&dir).unwrap();
}
