use std::{cmp::Ordering, fmt, sync::Arc};

use crossbeam::utils::Backoff;
use log::{debug, warn};

use super::{
    check_leaf_chain, delete,
    node::{bytes_compare, Comparator, TreePage},
    record::{leaf_record_size, ContentFlags, NodeFlags, MAX_KEY_SIZE, MAX_RECORD_SIZE},
    split::{self, PageReserve, PageSource},
    IntegrityReport, LeafLink, PathStep, TreeCursor,
};
use crate::{
    buffer::{FetchOptions, LatchMode, PageLatch},
    engine::StorageEngine,
    error::{ErrorKind, SmallError},
    lock::{LockMode, LockRequest, LockStatus},
    storage::PagePosition,
    transaction::{LatchId, LowLevelTransaction, Transaction},
    tx_log::LogRecord,
    types::{SmallResult, NO_PAGE},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeKind {
    /// Leaf records carry a `(txn_id, rollback_pointer)` version header.
    Primary,
    Secondary,
}

/// Where a tree lives. The root page never moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeRoot {
    pub file_id: i32,
    pub page_number: i64,
    pub kind: TreeKind,
}

impl TreeRoot {
    pub fn position(&self) -> PagePosition {
        PagePosition::new(self.file_id, self.page_number)
    }
}

/// A B+tree of variable-size keys and values.
///
/// Readers couple read latches from the root down and never lock. A
/// writer first tries an optimistic descent that write-latches only
/// the leaf, and restarts with write latches on the whole path when the
/// leaf has to split or disappear. Inserted and deleted records are
/// locked exclusively on behalf of the calling transaction.
#[derive(Clone, Copy)]
pub struct Tree {
    root: TreeRoot,
    compare: Comparator,
}

enum DeleteStep {
    Done(bool),
    /// A lock request is queued, wait for it then retry.
    Wait,
    /// A sibling latch could not be taken, retry after a pause.
    Retry,
}

impl Tree {
    /// Allocate a root page and format it as an empty leaf.
    pub fn create(engine: &StorageEngine, file_id: i32, kind: TreeKind) -> SmallResult<Self> {
        let pos = engine.allocate_page(file_id)?;
        let flags = NodeFlags::leaf(true);

        let mut llt = engine.llt();
        let latch = llt.alloc(&pos)?;
        TreePage::new(llt.page_mut(latch)?).init(&pos, flags, 0)?;
        llt.log(LogRecord::PageCreated {
            pos,
            flags: flags.bits(),
            depth: 0,
            element_size: None,
        });
        llt.commit()?;

        debug!("created tree at {}", pos);
        Ok(Self::open(TreeRoot {
            file_id,
            page_number: pos.page_number,
            kind,
        }))
    }

    pub fn open(root: TreeRoot) -> Self {
        Self {
            root,
            compare: bytes_compare,
        }
    }

    pub fn with_comparator(mut self, compare: Comparator) -> Self {
        self.compare = compare;
        self
    }

    pub fn root(&self) -> TreeRoot {
        self.root
    }

    fn primary(&self) -> bool {
        self.root.kind == TreeKind::Primary
    }

    fn record_size(&self, key: &[u8], value: &[u8]) -> usize {
        leaf_record_size(key.len(), value.len(), self.primary())
    }

    fn check_limits(&self, key: &[u8], value: &[u8]) -> SmallResult {
        if key.len() > MAX_KEY_SIZE {
            return Err(SmallError::new(
                ErrorKind::RecordTooLarge,
                &format!("key of {} bytes, the limit is {}", key.len(), MAX_KEY_SIZE),
            ));
        }
        if key.len() + value.len() > MAX_RECORD_SIZE {
            return Err(SmallError::new(
                ErrorKind::RecordTooLarge,
                &format!(
                    "record of {} bytes, the limit is {}",
                    key.len() + value.len(),
                    MAX_RECORD_SIZE
                ),
            ));
        }
        Ok(())
    }

    fn duplicate(key: &[u8]) -> SmallError {
        SmallError::new(
            ErrorKind::Duplicate,
            &format!("key {} already exists", hex::encode(key)),
        )
    }

    fn child_options(depth: u8) -> FetchOptions {
        // only leaves are worth keeping hot
        if depth == 1 {
            FetchOptions::default()
        } else {
            FetchOptions::no_touch()
        }
    }

    /// Read-couple from the root to the leaf covering `key`, or the
    /// leftmost leaf.
    pub(crate) fn read_leaf(
        &self,
        engine: &StorageEngine,
        key: Option<&[u8]>,
    ) -> SmallResult<PageLatch> {
        let pool = engine.pool();
        let root = self.root.position();
        let mut latch = pool.fetch(&root)?.latch_read();
        loop {
            let child = {
                let page = TreePage::new(latch.page());
                page.check()?;
                if page.is_leaf()? {
                    None
                } else {
                    let index = match key {
                        Some(key) => page.child_index(key, self.compare)?,
                        None => 0,
                    };
                    Some((page.child(index)?, page.depth()?))
                }
            };
            match child {
                Some((child, depth)) => {
                    latch = pool
                        .fetch_with(&root.sibling(child), Self::child_options(depth))?
                        .latch_read();
                }
                None => return Ok(latch),
            }
        }
    }

    /// Descend with read latches and write-latch the leaf covering
    /// `key`. `None` when the root turned out not to be a leaf anymore
    /// once write-latched.
    fn optimistic_leaf(
        &self,
        engine: &StorageEngine,
        key: &[u8],
    ) -> SmallResult<Option<PageLatch>> {
        let pool = engine.pool();
        let root = self.root.position();
        let mut latch = pool.fetch(&root)?.latch_read();
        loop {
            let child = {
                let page = TreePage::new(latch.page());
                page.check()?;
                if page.is_leaf()? {
                    None
                } else {
                    Some((page.child(page.child_index(key, self.compare)?)?, page.depth()?))
                }
            };

            let (child, depth) = match child {
                Some(child) => child,
                None => break,
            };
            let handle = pool.fetch_with(&root.sibling(child), Self::child_options(depth))?;
            if depth > 1 {
                latch = handle.latch_read();
                continue;
            }

            // the parent stays read-latched, so the leaf can't be split
            // or removed under us
            let mut leaf = handle.latch_upgradable();
            if !leaf.try_upgrade() {
                leaf = leaf.unlatch().latch_write();
            }
            drop(latch);
            return Ok(Some(leaf));
        }

        // the root is a leaf, retake it for writing
        let leaf = latch.unlatch().latch_write();
        if TreePage::new(leaf.page()).is_leaf()? {
            Ok(Some(leaf))
        } else {
            Ok(None)
        }
    }

    /// Write-latch every page from the root to the leaf covering `key`.
    pub(crate) fn write_path(
        &self,
        llt: &mut LowLevelTransaction,
        key: &[u8],
    ) -> SmallResult<Vec<PathStep>> {
        let mut path = Vec::new();
        let mut pos = self.root.position();
        let mut index = 0;
        loop {
            let latch = llt.latch(&pos, LatchMode::Write, FetchOptions::default())?;
            path.push(PathStep { latch, index });

            let page = TreePage::new(llt.page(latch)?);
            page.check()?;
            if page.is_leaf()? {
                return Ok(path);
            }
            index = page.child_index(key, self.compare)?;
            pos = pos.sibling(page.child(index)?);
        }
    }

    pub fn insert(
        &self,
        engine: &StorageEngine,
        tx: &Arc<Transaction>,
        key: &[u8],
        value: &[u8],
    ) -> SmallResult {
        self.check_limits(key, value)?;
        if self.insert_optimistic(engine, tx, key, value)? {
            return Ok(());
        }
        self.insert_pessimistic(engine, tx, key, value)
    }

    /// Insert into the leaf if it has room. False when a split is
    /// needed.
    fn insert_optimistic(
        &self,
        engine: &StorageEngine,
        tx: &Arc<Transaction>,
        key: &[u8],
        value: &[u8],
    ) -> SmallResult<bool> {
        let leaf = match self.optimistic_leaf(engine, key)? {
            Some(leaf) => leaf,
            None => return Ok(false),
        };

        let mut llt = engine.llt();
        let leaf = llt.adopt(leaf)?;
        let (ord, index, fits) = {
            let page = TreePage::new(llt.page(leaf)?);
            let (ord, index) = page.search(key, self.compare)?;
            (ord, index, page.fits(self.record_size(key, value))?)
        };

        if ord == Ordering::Equal {
            llt.rollback();
            return Err(Self::duplicate(key));
        }
        if !fits {
            llt.rollback();
            return Ok(false);
        }

        self.write_record(engine, &mut llt, tx, leaf, index, key, value)?;
        llt.commit()?;
        Ok(true)
    }

    fn insert_pessimistic(
        &self,
        engine: &StorageEngine,
        tx: &Arc<Transaction>,
        key: &[u8],
        value: &[u8],
    ) -> SmallResult {
        let mut llt = engine.llt();
        let mut path = self.write_path(&mut llt, key)?;
        let leaf = path[path.len() - 1].latch;
        let (ord, index, fits) = {
            let page = TreePage::new(llt.page(leaf)?);
            let (ord, index) = page.search(key, self.compare)?;
            (ord, index, page.fits(self.record_size(key, value))?)
        };

        if ord == Ordering::Equal {
            llt.rollback();
            return Err(Self::duplicate(key));
        }
        if fits {
            // someone else split the leaf in the meantime
            self.write_record(engine, &mut llt, tx, leaf, index, key, value)?;
            llt.commit()?;
            return Ok(());
        }

        let needed = split::pages_needed(&llt, &path, key, index)?;
        let file_id = self.root.file_id;
        let mut reserve =
            match PageReserve::new(engine, &mut llt, file_id, PageSource::FreeMap, needed) {
                Ok(reserve) => reserve,
                Err(e) => {
                    llt.rollback();
                    return Err(e);
                }
            };

        llt.begin_multi();
        if path.len() == 1 {
            split::demote_root(engine, &mut llt, &mut path, &mut reserve)?;
        }
        let ctx = split::split_leaf(engine, &mut llt, &mut path, &mut reserve, key, index)?;
        let (target, index) = ctx.target(index);

        // the split is complete on its own and is kept even if the
        // record doesn't go in
        let written = self.write_record(engine, &mut llt, tx, target, index, key, value);
        llt.end_multi();
        llt.commit()?;
        reserve.release(engine);
        written
    }

    /// Lock the slot at `index` of a write-latched leaf for `tx`, then
    /// insert the record there and log it. The page is untouched when
    /// the lock fails.
    #[allow(clippy::too_many_arguments)]
    fn write_record(
        &self,
        engine: &StorageEngine,
        llt: &mut LowLevelTransaction,
        tx: &Arc<Transaction>,
        leaf: LatchId,
        index: usize,
        key: &[u8],
        value: &[u8],
    ) -> SmallResult {
        let pos = llt.position(leaf)?;
        let (content, version) = if self.primary() {
            (
                ContentFlags::PRIMARY | ContentFlags::DATA,
                Some((tx.get_id() as i64, 0)),
            )
        } else {
            (ContentFlags::DATA, None)
        };

        let count = TreePage::new(llt.page(leaf)?).count()? + 1;

        let lock_manager = engine.lock_manager();
        lock_manager.on_record_inserted(&pos, index);
        let request =
            LockRequest::document(self.root.file_id, pos, index, count, LockMode::Exclusive);
        match lock_manager.lock(tx, &request) {
            Ok(LockStatus::Success) => {}
            // a fresh slot carries no bits, nobody can conflict with it
            Ok(status) => warn!("lock of a new record of {} returned {:?}", pos, status),
            Err(e) => {
                lock_manager.on_record_removed(&pos, index);
                return Err(e);
            }
        }

        let inserted = {
            let mut page = TreePage::new(llt.page_mut(leaf)?);
            page.insert_leaf(index, key, value, content, version)
                .and_then(|_| page.flags())
        };
        let flags = match inserted {
            Ok(flags) => flags,
            Err(e) => {
                lock_manager.on_record_removed(&pos, index);
                return Err(e);
            }
        };
        llt.log(LogRecord::LeafInsert {
            pos,
            flags: flags.bits(),
            key: key.to_vec(),
            value: value.to_vec(),
        });
        Ok(())
    }

    /// The value of `key`. Takes no lock.
    pub fn get(&self, engine: &StorageEngine, key: &[u8]) -> SmallResult<Option<Vec<u8>>> {
        let latch = self.read_leaf(engine, Some(key))?;
        let page = TreePage::new(latch.page());
        match page.search(key, self.compare)? {
            (Ordering::Equal, index) => Ok(Some(page.value(index)?.to_vec())),
            _ => Ok(None),
        }
    }

    /// Remove `key`, locking it exclusively first. Returns false when
    /// the key is absent.
    ///
    /// Blocks while another transaction holds the record. A deadlock
    /// surfaces as an error of kind `DeadLock`, the caller is expected
    /// to abort the transaction.
    pub fn delete(
        &self,
        engine: &StorageEngine,
        tx: &Arc<Transaction>,
        key: &[u8],
    ) -> SmallResult<bool> {
        let backoff = Backoff::new();
        loop {
            match self.try_delete(engine, tx, key)? {
                DeleteStep::Done(found) => return Ok(found),
                DeleteStep::Wait => engine.lock_manager().wait(tx),
                DeleteStep::Retry => backoff.snooze(),
            }
        }
    }

    fn lock_record(
        &self,
        engine: &StorageEngine,
        tx: &Arc<Transaction>,
        llt: &LowLevelTransaction,
        leaf: LatchId,
        index: usize,
    ) -> SmallResult<LockStatus> {
        let pos = llt.position(leaf)?;
        let count = TreePage::new(llt.page(leaf)?).count()?;
        let request =
            LockRequest::document(self.root.file_id, pos, index, count, LockMode::Exclusive);
        engine.lock_manager().lock(tx, &request)
    }

    fn try_delete(
        &self,
        engine: &StorageEngine,
        tx: &Arc<Transaction>,
        key: &[u8],
    ) -> SmallResult<DeleteStep> {
        if let Some(leaf) = self.optimistic_leaf(engine, key)? {
            let mut llt = engine.llt();
            let leaf = llt.adopt(leaf)?;
            let (ord, index, count, is_root) = {
                let page = TreePage::new(llt.page(leaf)?);
                let (ord, index) = page.search(key, self.compare)?;
                (ord, index, page.count()?, page.is_root()?)
            };
            if ord != Ordering::Equal {
                llt.rollback();
                return Ok(DeleteStep::Done(false));
            }

            match self.lock_record(engine, tx, &llt, leaf, index)? {
                LockStatus::Success => {}
                LockStatus::WaitLock => {
                    llt.rollback();
                    return Ok(DeleteStep::Wait);
                }
                LockStatus::DeadLock => {
                    llt.rollback();
                    return Err(self.deadlock(tx, key));
                }
            }

            if count > 1 || is_root {
                self.remove_record(engine, &mut llt, leaf, index)?;
                llt.commit()?;
                return Ok(DeleteStep::Done(true));
            }
            llt.rollback();
        }

        // the leaf becomes empty and goes away
        let mut llt = engine.llt();
        let path = self.write_path(&mut llt, key)?;
        let leaf = path[path.len() - 1].latch;
        let leaf_pos = llt.position(leaf)?;
        let (ord, index, count, is_root, prev, next) = {
            let page = TreePage::new(llt.page(leaf)?);
            let (ord, index) = page.search(key, self.compare)?;
            (ord, index, page.count()?, page.is_root()?, page.prev()?, page.next()?)
        };
        if ord != Ordering::Equal {
            llt.rollback();
            return Ok(DeleteStep::Done(false));
        }

        match self.lock_record(engine, tx, &llt, leaf, index)? {
            LockStatus::Success => {}
            LockStatus::WaitLock => {
                llt.rollback();
                return Ok(DeleteStep::Wait);
            }
            LockStatus::DeadLock => {
                llt.rollback();
                return Err(self.deadlock(tx, key));
            }
        }

        let remove_leaf = count == 1 && !is_root;
        if remove_leaf && prev != NO_PAGE {
            // right to left against readers, only try
            if llt.try_latch_write(&leaf_pos.sibling(prev))?.is_none() {
                debug!("left sibling {} of {} is busy", prev, leaf_pos);
                llt.rollback();
                return Ok(DeleteStep::Retry);
            }
        }
        if remove_leaf && next != NO_PAGE {
            let next_pos = leaf_pos.sibling(next);
            if let Err(e) = llt.latch(&next_pos, LatchMode::Write, FetchOptions::default()) {
                llt.rollback();
                return Err(e);
            }
        }

        llt.begin_multi();
        self.remove_record(engine, &mut llt, leaf, index)?;
        let vacated = if remove_leaf {
            delete::remove_empty_leaf(engine, &mut llt, &path)?
        } else {
            Vec::new()
        };
        llt.end_multi();
        llt.commit()?;
        delete::free_vacated(engine, vacated);
        Ok(DeleteStep::Done(true))
    }

    fn deadlock(&self, tx: &Transaction, key: &[u8]) -> SmallError {
        let e = SmallError::deadlock(&format!(
            "{} deadlocked deleting {}",
            tx,
            hex::encode(key)
        ));
        e.show_backtrace();
        e
    }

    fn remove_record(
        &self,
        engine: &StorageEngine,
        llt: &mut LowLevelTransaction,
        leaf: LatchId,
        index: usize,
    ) -> SmallResult {
        let pos = llt.position(leaf)?;
        TreePage::new(llt.page_mut(leaf)?).remove(index)?;
        llt.log(LogRecord::LeafRemove {
            pos,
            index: index as u16,
        });
        engine.lock_manager().on_record_removed(&pos, index);
        Ok(())
    }

    /// Entries with keys at or above `from`, in key order.
    pub fn cursor<'a>(
        &self,
        engine: &'a StorageEngine,
        from: &[u8],
    ) -> SmallResult<TreeCursor<'a>> {
        let latch = self.read_leaf(engine, Some(from))?;
        let (_, index) = TreePage::new(latch.page()).search(from, self.compare)?;
        Ok(TreeCursor::new(engine, latch, index))
    }

    /// Every entry, in key order.
    pub fn cursor_first<'a>(&self, engine: &'a StorageEngine) -> SmallResult<TreeCursor<'a>> {
        let latch = self.read_leaf(engine, None)?;
        Ok(TreeCursor::new(engine, latch, 0))
    }

    pub fn entries(&self, engine: &StorageEngine) -> SmallResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.cursor_first(engine)?.collect()
    }

    /// Walk the whole tree and verify its structure: key order inside
    /// pages, separators bounding their subtrees, uniform leaf depth
    /// and the leaf sibling chain. Only meaningful while no mutation is
    /// running.
    pub fn check_integrity(&self, engine: &StorageEngine) -> SmallResult<IntegrityReport> {
        let mut report = IntegrityReport::default();
        let mut leaves = Vec::new();
        let depth = self.check_node(
            engine,
            self.root.page_number,
            (None, None),
            None,
            &mut leaves,
            &mut report,
        )?;
        check_leaf_chain(&leaves)?;
        report.depth = depth as usize;
        Ok(report)
    }

    fn check_node(
        &self,
        engine: &StorageEngine,
        page_number: i64,
        bounds: (Option<Vec<u8>>, Option<Vec<u8>>),
        expected_depth: Option<u8>,
        leaves: &mut Vec<LeafLink>,
        report: &mut IntegrityReport,
    ) -> SmallResult<u8> {
        let pos = self.root.position().sibling(page_number);
        let compare = self.compare;
        let (lower, upper) = bounds;
        let out_of_bounds = |key: &[u8]| {
            lower.as_ref().map_or(false, |l| compare(key, l) == Ordering::Less)
                || upper.as_ref().map_or(false, |u| compare(key, u) != Ordering::Less)
        };

        let (depth, children) = {
            let latch = engine.pool().fetch(&pos)?.latch_read();
            let page = TreePage::new(latch.page());
            page.check()?;

            let depth = page.depth()?;
            if page.is_root()? != expected_depth.is_none() {
                return Err(SmallError::corruption(&format!("{} has a wrong root flag", pos)));
            }
            if expected_depth.map_or(false, |d| d != depth) {
                return Err(SmallError::corruption(&format!(
                    "{} has depth {}, expected {:?}",
                    pos, depth, expected_depth
                )));
            }

            let count = page.count()?;
            if page.is_leaf()? {
                if depth != 0 || (count == 0 && expected_depth.is_some()) {
                    return Err(SmallError::corruption(&format!(
                        "malformed leaf {}, depth {}, {} entries",
                        pos, depth, count
                    )));
                }
                for index in 0..count {
                    let key = page.key(index)?;
                    let ordered =
                        index == 0 || compare(page.key(index - 1)?, key) == Ordering::Less;
                    if !ordered || out_of_bounds(key) {
                        return Err(SmallError::corruption(&format!(
                            "key {} of {} is out of order",
                            hex::encode(key),
                            pos
                        )));
                    }
                }
                report.leaves += 1;
                report.entries += count;
                leaves.push(LeafLink {
                    page_number,
                    prev: page.prev()?,
                    next: page.next()?,
                });
                return Ok(0);
            }

            if count == 0 || depth == 0 {
                return Err(SmallError::corruption(&format!("malformed branch {}", pos)));
            }
            if !page.key(0)?.is_empty() {
                return Err(SmallError::corruption(&format!(
                    "first entry of {} has a key",
                    pos
                )));
            }

            let mut children = Vec::with_capacity(count);
            for index in 0..count {
                let lo = if index == 0 {
                    lower.clone()
                } else {
                    let key = page.key(index)?;
                    let ordered =
                        index == 1 || compare(page.key(index - 1)?, key) == Ordering::Less;
                    if !ordered || out_of_bounds(key) {
                        return Err(SmallError::corruption(&format!(
                            "separator {} of {} is out of order",
                            index, pos
                        )));
                    }
                    Some(key.to_vec())
                };
                let hi = if index + 1 < count {
                    Some(page.key(index + 1)?.to_vec())
                } else {
                    upper.clone()
                };
                children.push((page.child(index)?, lo, hi));
            }
            report.branches += 1;
            (depth, children)
        };

        for (child, lo, hi) in children {
            self.check_node(engine, child, (lo, hi), Some(depth - 1), leaves, report)?;
        }
        Ok(depth)
    }
}

impl fmt::Debug for Tree {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Tree({:?} at {})", self.root.kind, self.root.position())
    }
}
