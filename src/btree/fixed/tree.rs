use std::cmp::Ordering;

use log::debug;

use super::page::{FixedPage, FIXED_NEXT_OFFSET, FIXED_PREV_OFFSET};
use crate::{
    btree::{
        check_leaf_chain,
        record::NodeFlags,
        split::{PageReserve, PageSource},
        IntegrityReport, LeafLink, PathStep,
    },
    buffer::{FetchOptions, PageLatch},
    engine::StorageEngine,
    error::{ErrorKind, SmallError},
    storage::{PageHeader, PageKind, PagePosition},
    transaction::{LatchId, LowLevelTransaction},
    tx_log::LogRecord,
    types::{SmallResult, NO_PAGE},
};

/// Largest value a fixed-size tree accepts.
pub const MAX_ELEMENT_SIZE: usize = 1024;

/// B+tree of i64 keys and values of `element_size` bytes.
///
/// Every mutation write-latches the path from the root, so mutations of
/// one tree are serialized while readers couple read latches down the
/// tree. New pages come from growing the file, all of them before a
/// split changes anything, and pages are never given back: leaves
/// emptied by deletes stay in the chain.
///
/// A low-level transaction shared by several mutations keeps the latches
/// of every earlier path, so only share one while nobody else scans the
/// tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedSizeTree {
    root: PagePosition,
    element_size: u16,
}

impl FixedSizeTree {
    /// Grow `file_id` by one page and make it the root of an empty tree.
    pub fn create(
        engine: &StorageEngine,
        llt: &mut LowLevelTransaction,
        file_id: i32,
        element_size: u16,
    ) -> SmallResult<Self> {
        let page_number = engine.raise_file(llt, file_id)?;
        Self::init_root(llt, PagePosition::new(file_id, page_number), element_size)
    }

    /// Format the already reserved page `root` as an empty root leaf.
    pub(crate) fn init_root(
        llt: &mut LowLevelTransaction,
        root: PagePosition,
        element_size: u16,
    ) -> SmallResult<Self> {
        if element_size as usize > MAX_ELEMENT_SIZE {
            return Err(SmallError::new(
                ErrorKind::RecordTooLarge,
                &format!("element size {} exceeds {}", element_size, MAX_ELEMENT_SIZE),
            ));
        }

        let flags = NodeFlags::leaf(true);
        let latch = llt.alloc(&root)?;
        FixedPage::new(llt.page_mut(latch)?).init(&root, flags, 0, element_size)?;
        llt.log(LogRecord::PageCreated {
            pos: root,
            flags: flags.bits(),
            depth: 0,
            element_size: Some(element_size),
        });
        Ok(Self { root, element_size })
    }

    pub fn open(root: PagePosition, element_size: u16) -> Self {
        Self { root, element_size }
    }

    pub fn root(&self) -> PagePosition {
        self.root
    }

    pub fn element_size(&self) -> u16 {
        self.element_size
    }

    fn check_value(&self, value: &[u8]) -> SmallResult {
        if value.len() != self.element_size as usize {
            return Err(SmallError::new(
                ErrorKind::RecordTooLarge,
                &format!(
                    "value of {} bytes in a tree of {}-byte elements",
                    value.len(),
                    self.element_size
                ),
            ));
        }
        Ok(())
    }

    /// Write-latch every page from the root down to the leaf covering
    /// `key`, or the leftmost leaf.
    fn write_path(
        &self,
        llt: &mut LowLevelTransaction,
        key: Option<i64>,
    ) -> SmallResult<Vec<PathStep>> {
        let mut path = Vec::new();
        let mut pos = self.root;
        let mut index = 0;
        loop {
            let latch = llt.latch_write(&pos)?;
            path.push(PathStep { latch, index });

            let page = FixedPage::new(llt.page(latch)?);
            page.check()?;
            if page.is_leaf()? {
                return Ok(path);
            }
            index = match key {
                Some(key) => page.child_index(key)?,
                None => 0,
            };
            pos = pos.sibling(page.child(index)?);
        }
    }

    /// Read-latch the leaf covering `key`, or the leftmost leaf.
    fn read_leaf(&self, engine: &StorageEngine, key: Option<i64>) -> SmallResult<PageLatch> {
        let pool = engine.pool();
        let mut latch = pool.fetch(&self.root)?.latch_read();
        loop {
            let child = {
                let page = FixedPage::new(latch.page());
                page.check()?;
                if page.is_leaf()? {
                    None
                } else {
                    let index = match key {
                        Some(key) => page.child_index(key)?,
                        None => 0,
                    };
                    Some(page.child(index)?)
                }
            };
            match child {
                Some(child) => {
                    latch = pool
                        .fetch_with(&self.root.sibling(child), FetchOptions::no_touch())?
                        .latch_read();
                }
                None => return Ok(latch),
            }
        }
    }

    /// Insert `key`, or overwrite its value. Returns true when the key
    /// was not present.
    pub fn insert(
        &self,
        engine: &StorageEngine,
        llt: &mut LowLevelTransaction,
        key: i64,
        value: &[u8],
    ) -> SmallResult<bool> {
        self.check_value(value)?;

        let mut path = self.write_path(llt, Some(key))?;
        let leaf = path[path.len() - 1].latch;
        let leaf_pos = llt.position(leaf)?;
        let (found, index, full, flags) = {
            let page = FixedPage::new(llt.page(leaf)?);
            let (ord, index) = page.search(key)?;
            (ord == Ordering::Equal, index, page.is_full()?, page.flags()?)
        };

        if found {
            let offset = FixedPage::new(llt.page_mut(leaf)?).set_value(index, value)?;
            llt.log(LogRecord::SetBytes {
                pos: leaf_pos,
                offset: offset as u16,
                bytes: value.to_vec(),
            });
            return Ok(false);
        }

        if !full {
            FixedPage::new(llt.page_mut(leaf)?).insert_leaf(index, key, value)?;
            llt.log(LogRecord::LeafInsert {
                pos: leaf_pos,
                flags: flags.bits(),
                key: key.to_le_bytes().to_vec(),
                value: value.to_vec(),
            });
            return Ok(true);
        }

        let needed = Self::pages_needed(llt, &path)?;
        let file_id = self.root.file_id;
        let mut reserve = PageReserve::new(engine, llt, file_id, PageSource::FileEnd, needed)?;

        llt.begin_multi();
        if path.len() == 1 {
            self.demote_root(engine, llt, &mut path, &mut reserve)?;
        }
        let (target, index) = self.split_leaf(engine, llt, &mut path, &mut reserve, key, index)?;
        let target_pos = llt.position(target)?;
        FixedPage::new(llt.page_mut(target)?).insert_leaf(index, key, value)?;
        llt.log(LogRecord::LeafInsert {
            pos: target_pos,
            flags: NodeFlags::leaf(false).bits(),
            key: key.to_le_bytes().to_vec(),
            value: value.to_vec(),
        });
        llt.end_multi();
        reserve.release(engine);
        Ok(true)
    }

    /// Pages a split of the full leaf at the end of `path` takes.
    fn pages_needed(llt: &LowLevelTransaction, path: &[PathStep]) -> SmallResult<usize> {
        if path.len() == 1 {
            return Ok(2);
        }
        let mut needed = 1;
        for level in (0..path.len() - 1).rev() {
            if !FixedPage::new(llt.page(path[level].latch)?).is_full()? {
                break;
            }
            // a full root is demoted, then its content splits
            needed += if level == 0 { 2 } else { 1 };
        }
        Ok(needed)
    }

    /// Move the content of the root to a new page and turn the root
    /// into a branch with that page as its only child. The root keeps
    /// its page number.
    fn demote_root(
        &self,
        engine: &StorageEngine,
        llt: &mut LowLevelTransaction,
        path: &mut Vec<PathStep>,
        reserve: &mut PageReserve,
    ) -> SmallResult {
        let root = path[0].latch;
        let child_pos = reserve.take(engine, llt)?;
        let child = llt.alloc(&child_pos)?;

        let (flags, depth) = {
            let (root_page, child_page) = llt.pages_mut(root, child)?;
            child_page.bytes_mut().copy_from_slice(root_page.bytes());
            child_page.set_header(&PageHeader::new(PageKind::FixedTree, &child_pos))?;
            let mut moved = FixedPage::new(child_page);
            let flags = moved.flags()?.without_root();
            moved.set_flags(flags)?;
            let depth = moved.depth()?;

            let mut root_page = FixedPage::new(root_page);
            root_page.init(&self.root, NodeFlags::branch(true), depth + 1, self.element_size)?;
            root_page.insert_branch(0, i64::MIN, child_pos.page_number)?;
            (flags, depth)
        };

        llt.log(LogRecord::PageCreated {
            pos: child_pos,
            flags: flags.bits(),
            depth,
            element_size: Some(self.element_size),
        });
        llt.log(LogRecord::RootSplit { pos: self.root });
        path.insert(1, PathStep { latch: child, index: 0 });
        debug!("fixed tree {} grows to depth {}", self.root, depth + 1);
        Ok(())
    }

    /// Split the full leaf at the end of `path`. Returns where the
    /// entry for `key` goes.
    fn split_leaf(
        &self,
        engine: &StorageEngine,
        llt: &mut LowLevelTransaction,
        path: &mut Vec<PathStep>,
        reserve: &mut PageReserve,
        key: i64,
        index: usize,
    ) -> SmallResult<(LatchId, usize)> {
        let leaf = path[path.len() - 1].latch;
        let leaf_pos = llt.position(leaf)?;
        let (count, old_next) = {
            let page = FixedPage::new(llt.page(leaf)?);
            (page.count()?, page.next()?)
        };

        // appending leaves the full page alone
        let sequential = index == count;
        let (split_at, separator) = if sequential {
            (count, key)
        } else {
            let split_at = count / 2;
            (split_at, FixedPage::new(llt.page(leaf)?).key(split_at)?)
        };

        let next = if old_next != NO_PAGE {
            let next_pos = leaf_pos.sibling(old_next);
            Some((next_pos, llt.latch_write(&next_pos)?))
        } else {
            None
        };

        let sibling_pos = reserve.take(engine, llt)?;
        let sibling = llt.alloc(&sibling_pos)?;
        {
            let (page, sibling_page) = llt.pages_mut(leaf, sibling)?;
            let mut page = FixedPage::new(page);
            let mut new_page = FixedPage::new(sibling_page);
            new_page.init(&sibling_pos, NodeFlags::leaf(false), 0, self.element_size)?;
            new_page.append_from(&page, split_at)?;
            page.truncate(split_at)?;

            new_page.set_prev(leaf_pos.page_number)?;
            new_page.set_next(old_next)?;
            page.set_next(sibling_pos.page_number)?;
        }

        llt.log(LogRecord::PageCreated {
            pos: sibling_pos,
            flags: NodeFlags::leaf(false).bits(),
            depth: 0,
            element_size: Some(self.element_size),
        });
        llt.log(LogRecord::CopyEntries {
            from: leaf_pos,
            to: sibling_pos,
            start_index: split_at as u16,
        });
        llt.log(LogRecord::SetByte8 {
            pos: sibling_pos,
            offset: FIXED_PREV_OFFSET as u16,
            value: leaf_pos.page_number as u64,
        });
        llt.log(LogRecord::SetByte8 {
            pos: sibling_pos,
            offset: FIXED_NEXT_OFFSET as u16,
            value: old_next as u64,
        });
        llt.log(LogRecord::SetByte8 {
            pos: leaf_pos,
            offset: FIXED_NEXT_OFFSET as u16,
            value: sibling_pos.page_number as u64,
        });

        if let Some((next_pos, next)) = next {
            FixedPage::new(llt.page_mut(next)?).set_prev(sibling_pos.page_number)?;
            llt.log(LogRecord::SetByte8 {
                pos: next_pos,
                offset: FIXED_PREV_OFFSET as u16,
                value: sibling_pos.page_number as u64,
            });
        }

        let level = path.len() - 2;
        let right = sibling_pos.page_number;
        self.insert_separator(engine, llt, path, reserve, level, separator, right)?;

        if sequential {
            Ok((sibling, 0))
        } else if index <= split_at {
            Ok((leaf, index))
        } else {
            Ok((sibling, index - split_at))
        }
    }

    /// Add `(separator -> right)` to the branch at `level` of the path,
    /// right after the child the path went through. Full branches are
    /// split on the way up.
    fn insert_separator(
        &self,
        engine: &StorageEngine,
        llt: &mut LowLevelTransaction,
        path: &mut Vec<PathStep>,
        reserve: &mut PageReserve,
        mut level: usize,
        mut separator: i64,
        mut right: i64,
    ) -> SmallResult {
        loop {
            let parent = path[level].latch;
            let parent_pos = llt.position(parent)?;
            let at = path[level + 1].index + 1;
            let (full, count) = {
                let page = FixedPage::new(llt.page(parent)?);
                (page.is_full()?, page.count()?)
            };

            if !full {
                let left = {
                    let mut page = FixedPage::new(llt.page_mut(parent)?);
                    page.insert_branch(at, separator, right)?;
                    page.child(at - 1)?
                };
                llt.log(LogRecord::BranchInsert {
                    pos: parent_pos,
                    key: separator.to_le_bytes().to_vec(),
                    left_page: left,
                    right_page: right,
                });
                return Ok(());
            }

            if level == 0 {
                self.demote_root(engine, llt, path, reserve)?;
                level = 1;
                continue;
            }

            let split_at = count / 2;
            let sibling_pos = reserve.take(engine, llt)?;
            let sibling = llt.alloc(&sibling_pos)?;
            let (depth, next_separator, target_pos, left) = {
                let (page, sibling_page) = llt.pages_mut(parent, sibling)?;
                let mut page = FixedPage::new(page);
                let mut new_page = FixedPage::new(sibling_page);
                let depth = page.depth()?;
                let next_separator = page.key(split_at)?;
                new_page.init(&sibling_pos, NodeFlags::branch(false), depth, self.element_size)?;
                new_page.append_from(&page, split_at)?;
                page.truncate(split_at)?;

                if at <= split_at {
                    page.insert_branch(at, separator, right)?;
                    (depth, next_separator, parent_pos, page.child(at - 1)?)
                } else {
                    let at = at - split_at;
                    new_page.insert_branch(at, separator, right)?;
                    (depth, next_separator, sibling_pos, new_page.child(at - 1)?)
                }
            };

            llt.log(LogRecord::PageCreated {
                pos: sibling_pos,
                flags: NodeFlags::branch(false).bits(),
                depth,
                element_size: Some(self.element_size),
            });
            llt.log(LogRecord::CopyEntries {
                from: parent_pos,
                to: sibling_pos,
                start_index: split_at as u16,
            });
            llt.log(LogRecord::BranchInsert {
                pos: target_pos,
                key: separator.to_le_bytes().to_vec(),
                left_page: left,
                right_page: right,
            });

            separator = next_separator;
            right = sibling_pos.page_number;
            level -= 1;
        }
    }

    pub fn get(&self, engine: &StorageEngine, key: i64) -> SmallResult<Option<Vec<u8>>> {
        let latch = self.read_leaf(engine, Some(key))?;
        let page = FixedPage::new(latch.page());
        match page.search(key)? {
            (Ordering::Equal, index) => Ok(Some(page.value(index)?.to_vec())),
            _ => Ok(None),
        }
    }

    /// Returns false when the key is absent.
    pub fn delete(&self, llt: &mut LowLevelTransaction, key: i64) -> SmallResult<bool> {
        let path = self.write_path(llt, Some(key))?;
        let leaf = path[path.len() - 1].latch;
        let (ord, index) = FixedPage::new(llt.page(leaf)?).search(key)?;
        if ord != Ordering::Equal {
            return Ok(false);
        }
        self.remove_at(llt, leaf, index)?;
        Ok(true)
    }

    fn remove_at(&self, llt: &mut LowLevelTransaction, leaf: LatchId, index: usize) -> SmallResult {
        let pos = llt.position(leaf)?;
        FixedPage::new(llt.page_mut(leaf)?).remove(index)?;
        llt.log(LogRecord::LeafRemove {
            pos,
            index: index as u16,
        });
        Ok(())
    }

    /// Remove and return the smallest entry.
    pub fn pop_first(&self, llt: &mut LowLevelTransaction) -> SmallResult<Option<(i64, Vec<u8>)>> {
        let path = self.write_path(llt, None)?;
        let mut leaf = path[path.len() - 1].latch;
        loop {
            let (first, next) = {
                let page = FixedPage::new(llt.page(leaf)?);
                let first = if page.count()? > 0 {
                    Some((page.key(0)?, page.value(0)?.to_vec()))
                } else {
                    None
                };
                (first, page.next()?)
            };

            if let Some(entry) = first {
                self.remove_at(llt, leaf, 0)?;
                return Ok(Some(entry));
            }
            if next == NO_PAGE {
                return Ok(None);
            }

            // skip leaves emptied by earlier deletes
            let next = llt.latch_write(&self.root.sibling(next))?;
            llt.release(leaf);
            leaf = next;
        }
    }

    /// Every key, in order.
    pub fn keys(&self, engine: &StorageEngine) -> SmallResult<Vec<i64>> {
        let mut latch = self.read_leaf(engine, None)?;
        let mut keys = Vec::new();
        loop {
            let next = {
                let page = FixedPage::new(latch.page());
                for index in 0..page.count()? {
                    keys.push(page.key(index)?);
                }
                page.next()?
            };
            if next == NO_PAGE {
                return Ok(keys);
            }
            latch = engine.pool().fetch(&self.root.sibling(next))?.latch_read();
        }
    }

    pub fn len(&self, engine: &StorageEngine) -> SmallResult<usize> {
        Ok(self.keys(engine)?.len())
    }

    pub fn is_empty(&self, engine: &StorageEngine) -> SmallResult<bool> {
        Ok(self.len(engine)? == 0)
    }

    /// Walk the whole tree and verify its structure. Only meaningful
    /// while no mutation is running.
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
        bounds: (Option<i64>, Option<i64>),
        expected_depth: Option<u8>,
        leaves: &mut Vec<LeafLink>,
        report: &mut IntegrityReport,
    ) -> SmallResult<u8> {
        let pos = self.root.sibling(page_number);
        let (lower, upper) = bounds;
        let out_of_bounds =
            |key: i64| lower.map_or(false, |l| key < l) || upper.map_or(false, |u| key >= u);

        let (depth, children) = {
            let latch = engine.pool().fetch(&pos)?.latch_read();
            let page = FixedPage::new(latch.page());
            page.check()?;

            let depth = page.depth()?;
            let is_root = page.flags()?.is_root();
            if is_root != expected_depth.is_none() {
                return Err(SmallError::corruption(&format!(
                    "{} has a wrong root flag",
                    pos
                )));
            }
            if expected_depth.map_or(false, |d| d != depth) {
                return Err(SmallError::corruption(&format!(
                    "{} has depth {}, expected {:?}",
                    pos, depth, expected_depth
                )));
            }

            let count = page.count()?;
            if page.is_leaf()? {
                if depth != 0 {
                    return Err(SmallError::corruption(&format!("leaf {} at depth {}", pos, depth)));
                }
                for index in 0..count {
                    let key = page.key(index)?;
                    if (index > 0 && key <= page.key(index - 1)?) || out_of_bounds(key) {
                        return Err(SmallError::corruption(&format!(
                            "key {} of {} is out of order",
                            key, pos
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
            let mut children = Vec::with_capacity(count);
            for index in 0..count {
                let lo = if index == 0 { lower } else { Some(page.key(index)?) };
                let hi = if index + 1 < count {
                    Some(page.key(index + 1)?)
                } else {
                    upper
                };
                if index > 0 && (out_of_bounds(page.key(index)?) || (hi.is_some() && lo >= hi)) {
                    return Err(SmallError::corruption(&format!(
                        "separator {} of {} is out of order",
                        index, pos
                    )));
                }
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
