use std::sync::Arc;

use small_store::{
    storage::MemoryStore, tx_log::MemoryLogSink, utils, EngineConfig, FixedSizeTree,
    StorageEngine, Tree, TreeKind,
};

/// The file every test tree lives in.
pub const FILE_ID: i32 = 1;

/// An engine over an in-memory store and log, with `FILE_ID` created.
pub struct TestContext {
    pub store: Arc<MemoryStore>,
    pub sink: Arc<MemoryLogSink>,
    pub engine: StorageEngine,
}

impl TestContext {
    pub fn new_tree(&self, kind: TreeKind) -> Tree {
        Tree::create(&self.engine, FILE_ID, kind).unwrap()
    }

    pub fn new_fixed_tree(&self, element_size: u16) -> FixedSizeTree {
        let mut llt = self.engine.llt();
        let tree = FixedSizeTree::create(&self.engine, &mut llt, FILE_ID, element_size).unwrap();
        llt.commit().unwrap();
        tree
    }
}

/// # Conduct the initialization
///
/// - Setting up log configurations.
pub fn setup() {
    utils::init_log();
}

pub fn new_context() -> TestContext {
    new_context_with(EngineConfig::default())
}

pub fn new_context_with(config: EngineConfig) -> TestContext {
    new_context_over(config, Arc::new(MemoryStore::new()))
}

pub fn new_context_over(config: EngineConfig, store: Arc<MemoryStore>) -> TestContext {
    let sink = Arc::new(MemoryLogSink::new());
    let engine = StorageEngine::new(config, store.clone(), sink.clone());
    engine.create_file(FILE_ID).unwrap();
    TestContext {
        store,
        sink,
        engine,
    }
}
