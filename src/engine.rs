use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, RwLock,
    },
};

use log::{debug, info};

use crate::{
    btree::FixedSizeTree,
    buffer::BufferPool,
    config::EngineConfig,
    error::{ErrorKind, SmallError},
    lock::LockManager,
    storage::{PagePosition, PageStore},
    transaction::{LowLevelTransaction, Transaction},
    tx_log::{LogRecord, LogSink},
    types::SmallResult,
    utils::HandyRwLock,
};

/// Page number of the free-page map root in every file.
pub const FREE_MAP_PAGE: i64 = 0;

struct FileState {
    /// Length of the file in pages, the next page a raise hands out.
    next_page: AtomicI64,

    /// Page numbers given back by the trees, reused smallest first.
    free_pages: FixedSizeTree,
}

/// Everything a tree call needs: the buffer pool, the lock manager, the
/// log and the per-file allocation state.
///
/// Built once by whoever owns the storage and passed by reference.
pub struct StorageEngine {
    config: EngineConfig,
    pool: BufferPool,
    lock_manager: LockManager,
    log_sink: Arc<dyn LogSink>,
    files: RwLock<HashMap<i32, Arc<FileState>>>,
    next_tx_id: AtomicU64,
}

impl StorageEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn PageStore>,
        log_sink: Arc<dyn LogSink>,
    ) -> Self {
        info!("storage engine, {:?}", config);
        Self {
            config,
            pool: BufferPool::new(config.buffer_pool, store),
            lock_manager: LockManager::new(),
            log_sink,
            files: RwLock::new(HashMap::new()),
            next_tx_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.lock_manager
    }

    pub fn log_sink(&self) -> &Arc<dyn LogSink> {
        &self.log_sink
    }

    /// A new low-level transaction over the pool and the log.
    pub fn llt(&self) -> LowLevelTransaction<'_> {
        LowLevelTransaction::new(&self.pool, self.log_sink.as_ref())
    }

    fn file(&self, file_id: i32) -> SmallResult<Arc<FileState>> {
        match self.files.rl().get(&file_id) {
            Some(state) => Ok(Arc::clone(state)),
            None => Err(SmallError::not_found(&format!("file {} is not open", file_id))),
        }
    }

    fn register(&self, file_id: i32, length: i64) -> SmallResult {
        let mut files = self.files.wl();
        if files.contains_key(&file_id) {
            return Err(SmallError::new(
                ErrorKind::Duplicate,
                &format!("file {} is already open", file_id),
            ));
        }
        files.insert(
            file_id,
            Arc::new(FileState {
                next_page: AtomicI64::new(length),
                free_pages: FixedSizeTree::open(PagePosition::new(file_id, FREE_MAP_PAGE), 0),
            }),
        );
        Ok(())
    }

    /// Create an empty file whose first page is the root of its
    /// free-page map.
    pub fn create_file(&self, file_id: i32) -> SmallResult {
        self.register(file_id, 0)?;

        let mut llt = self.llt();
        let page_number = self.raise_file(&mut llt, file_id)?;
        FixedSizeTree::init_root(&mut llt, PagePosition::new(file_id, page_number), 0)?;
        llt.commit()?;
        info!("created file {}", file_id);
        Ok(())
    }

    /// Open a file known to the store, creating it when it is empty.
    pub fn open_file(&self, file_id: i32) -> SmallResult {
        let length = self.pool.store().page_count(file_id)?;
        if length == 0 {
            return self.create_file(file_id);
        }
        self.register(file_id, length)?;
        info!("opened file {}, {} pages", file_id, length);
        Ok(())
    }

    /// Grow the file by one page and return its page number. The file
    /// length only moves once the store has grown.
    pub fn raise_file(&self, llt: &mut LowLevelTransaction, file_id: i32) -> SmallResult<i64> {
        let file = self.file(file_id)?;
        let mut page_number = file.next_page.load(Ordering::SeqCst);
        loop {
            // raising never shrinks, losing the race costs nothing
            self.pool.store().raise(file_id, page_number + 1)?;
            match file.next_page.compare_exchange(
                page_number,
                page_number + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(current) => page_number = current,
            }
        }
        llt.log(LogRecord::FileRaise {
            file_id,
            length: page_number + 1,
        });
        debug!("raise file {} to {} pages", file_id, page_number + 1);
        Ok(page_number)
    }

    /// Pick a page for a tree: the smallest free page, else a new page
    /// at the end of the file.
    ///
    /// Runs in a low-level transaction of its own, committed before the
    /// caller formats the page.
    pub fn allocate_page(&self, file_id: i32) -> SmallResult<PagePosition> {
        let file = self.file(file_id)?;
        let mut llt = self.llt();
        let page_number = match file.free_pages.pop_first(&mut llt)? {
            Some((page_number, _)) => page_number,
            None => self.raise_file(&mut llt, file_id)?,
        };
        llt.commit()?;

        let pos = PagePosition::new(file_id, page_number);
        debug!("allocate {}", pos);
        Ok(pos)
    }

    /// Hand a page back to the free-page map of its file.
    pub fn free_page(&self, pos: &PagePosition) -> SmallResult {
        let file = self.file(pos.file_id)?;
        let mut llt = self.llt();
        if !file.free_pages.insert(self, &mut llt, pos.page_number, &[])? {
            llt.rollback();
            return Err(SmallError::corruption(&format!("{} is freed twice", pos)));
        }
        llt.commit()?;
        debug!("free {}", pos);
        Ok(())
    }

    /// Free page numbers of a file, in order.
    pub fn free_pages(&self, file_id: i32) -> SmallResult<Vec<i64>> {
        self.file(file_id)?.free_pages.keys(self)
    }

    /// Length of the file in pages.
    pub fn file_length(&self, file_id: i32) -> SmallResult<i64> {
        Ok(self.file(file_id)?.next_page.load(Ordering::SeqCst))
    }

    pub fn begin_transaction(&self) -> Arc<Transaction> {
        let id = self.next_tx_id.fetch_add(1, Ordering::SeqCst);
        Arc::new(Transaction::new(id))
    }

    /// Release every lock of the transaction.
    pub fn commit_transaction(&self, tx: &Transaction) {
        self.lock_manager.release_all(tx);
        debug!("commit {}", tx);
    }

    /// Release every lock of the transaction. Its page changes stay.
    pub fn abort_transaction(&self, tx: &Transaction) {
        self.lock_manager.release_all(tx);
        debug!("abort {}", tx);
    }

    /// Write every dirty page through the store.
    pub fn flush(&self) -> SmallResult<usize> {
        self.pool.flush_all()
    }
}

impl fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut file_ids: Vec<i32> = self.files.rl().keys().copied().collect();
        file_ids.sort_unstable();
        write!(
            f,
            "StorageEngine(files: {:?}, pool: {:?}, locks: {})",
            file_ids,
            self.pool,
            self.lock_manager.entries_count()
        )
    }
}
