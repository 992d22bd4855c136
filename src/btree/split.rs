use std::collections::VecDeque;

use log::{debug, error, warn};

use super::{
    node::{TreePage, NEXT_OFFSET, PREV_OFFSET},
    record::{branch_record_size, NodeFlags},
    PathStep,
};
use crate::{
    buffer::{FetchOptions, LatchMode},
    engine::StorageEngine,
    storage::{PageHeader, PageKind, PagePosition},
    transaction::{LatchId, LowLevelTransaction},
    tx_log::LogRecord,
    types::{SmallResult, NO_PAGE},
};

/// Where the pages of a `PageReserve` come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PageSource {
    /// The free-page map of the file, else the end of the file.
    FreeMap,
    /// The end of the file only, for the free-page map itself.
    FileEnd,
}

/// Pages set aside before a split touches the path. A split that can't
/// get all of its pages fails while every page is still intact.
#[derive(Debug)]
pub(crate) struct PageReserve {
    file_id: i32,
    source: PageSource,
    pages: VecDeque<i64>,
}

impl PageReserve {
    pub fn new(
        engine: &StorageEngine,
        llt: &mut LowLevelTransaction,
        file_id: i32,
        source: PageSource,
        count: usize,
    ) -> SmallResult<Self> {
        let mut reserve = Self {
            file_id,
            source,
            pages: VecDeque::with_capacity(count),
        };
        for _ in 0..count {
            match reserve.fetch(engine, llt) {
                Ok(page_number) => reserve.pages.push_back(page_number),
                Err(e) => {
                    debug!("reserve of {} pages failed after {}", count, reserve.pages.len());
                    reserve.release(engine);
                    return Err(e);
                }
            }
        }
        Ok(reserve)
    }

    fn fetch(&self, engine: &StorageEngine, llt: &mut LowLevelTransaction) -> SmallResult<i64> {
        match self.source {
            PageSource::FreeMap => Ok(engine.allocate_page(self.file_id)?.page_number),
            PageSource::FileEnd => engine.raise_file(llt, self.file_id),
        }
    }

    pub fn take(
        &mut self,
        engine: &StorageEngine,
        llt: &mut LowLevelTransaction,
    ) -> SmallResult<PagePosition> {
        let page_number = match self.pages.pop_front() {
            Some(page_number) => page_number,
            None => {
                warn!("split in file {} needs more pages than reserved", self.file_id);
                self.fetch(engine, llt)?
            }
        };
        Ok(PagePosition::new(self.file_id, page_number))
    }

    /// Give back the pages nobody took.
    pub fn release(self, engine: &StorageEngine) {
        for page_number in self.pages {
            let pos = PagePosition::new(self.file_id, page_number);
            match self.source {
                PageSource::FreeMap => {
                    if let Err(e) = engine.free_page(&pos) {
                        error!("reserved page {} is lost: {}", pos, e);
                    }
                }
                PageSource::FileEnd => warn!("reserved page {} stays unused", pos),
            }
        }
    }
}

/// Number of pages `split_leaf` takes to split the full leaf at the end
/// of `path` for an insert at `index`, root demotions included.
pub(crate) fn pages_needed(
    llt: &LowLevelTransaction,
    path: &[PathStep],
    key: &[u8],
    index: usize,
) -> SmallResult<usize> {
    if path.len() == 1 {
        // a new child for the content of the root, and its sibling
        return Ok(2);
    }

    let leaf = TreePage::new(llt.page(path[path.len() - 1].latch)?);
    let mut separator_len = if index == leaf.count()? {
        key.len()
    } else {
        leaf.key(leaf.split_point()?)?.len()
    };

    let mut needed = 1;
    for level in (0..path.len() - 1).rev() {
        let page = TreePage::new(llt.page(path[level].latch)?);
        if page.fits(branch_record_size(separator_len))? {
            break;
        }
        if level == 0 {
            needed += 2;
            break;
        }
        needed += 1;
        separator_len = page.key(page.split_point()?)?.len();
    }
    Ok(needed)
}

/// The pages involved in a leaf split.
#[derive(Debug)]
pub(crate) struct SplitContext {
    pub current: LatchId,
    pub sibling: LatchId,

    /// Entries at and above it moved to `sibling`.
    pub index: usize,

    /// Nothing moved, the sibling starts empty.
    pub sequential: bool,
}

impl SplitContext {
    /// Where an insert that wanted `index` of the original page goes.
    pub fn target(&self, index: usize) -> (LatchId, usize) {
        if self.sequential {
            (self.sibling, 0)
        } else if index <= self.index {
            (self.current, index)
        } else {
            (self.sibling, index - self.index)
        }
    }
}

/// Move the content of the root into a new child and turn the root
/// into a branch pointing at it. The root keeps its page number.
pub(crate) fn demote_root(
    engine: &StorageEngine,
    llt: &mut LowLevelTransaction,
    path: &mut Vec<PathStep>,
    reserve: &mut PageReserve,
) -> SmallResult {
    let root = path[0].latch;
    let root_pos = llt.position(root)?;
    let child_pos = reserve.take(engine, llt)?;
    let child = llt.alloc(&child_pos)?;

    let (flags, depth) = {
        let (root_page, child_page) = llt.pages_mut(root, child)?;
        child_page.bytes_mut().copy_from_slice(root_page.bytes());
        child_page.set_header(&PageHeader::new(PageKind::Tree, &child_pos))?;

        let mut moved = TreePage::new(child_page);
        let flags = moved.flags()?.without_root();
        moved.set_flags(flags)?;
        moved.set_prev(NO_PAGE)?;
        moved.set_next(NO_PAGE)?;
        let depth = moved.depth()?;

        let mut root_page = TreePage::new(root_page);
        root_page.init(&root_pos, NodeFlags::branch(true), depth + 1)?;
        root_page.insert_branch(0, &[], child_pos.page_number)?;
        (flags, depth)
    };

    if flags.is_leaf() {
        engine.lock_manager().split_page(&root_pos, &child_pos, 0);
    }

    llt.log(LogRecord::PageCreated {
        pos: child_pos,
        flags: flags.bits(),
        depth,
        element_size: None,
    });
    llt.log(LogRecord::RootSplit { pos: root_pos });
    path.insert(1, PathStep { latch: child, index: 0 });
    debug!("root {} demoted into {}, depth {}", root_pos, child_pos, depth + 1);
    Ok(())
}

/// Split the full leaf at the end of `path` for an insert at `index`.
///
/// An insert past the last entry leaves the full page alone and starts
/// an empty sibling, otherwise the upper half of the bytes moves. The
/// separator then goes up the path, splitting full branches on the way.
pub(crate) fn split_leaf(
    engine: &StorageEngine,
    llt: &mut LowLevelTransaction,
    path: &mut Vec<PathStep>,
    reserve: &mut PageReserve,
    key: &[u8],
    index: usize,
) -> SmallResult<SplitContext> {
    let level = path.len() - 1;
    let current = path[level].latch;
    let pos = llt.position(current)?;

    let (sequential, split_at, separator, old_next) = {
        let page = TreePage::new(llt.page(current)?);
        let count = page.count()?;
        let old_next = page.next()?;
        if index == count {
            (true, count, key.to_vec(), old_next)
        } else {
            let split_at = page.split_point()?;
            (false, split_at, page.key(split_at)?.to_vec(), old_next)
        }
    };

    // load the right neighbour before the first change
    let next = if old_next != NO_PAGE {
        let next_pos = pos.sibling(old_next);
        Some((next_pos, llt.latch(&next_pos, LatchMode::Write, FetchOptions::default())?))
    } else {
        None
    };

    let sibling_pos = reserve.take(engine, llt)?;
    let sibling = llt.alloc(&sibling_pos)?;
    {
        let (page, sibling_page) = llt.pages_mut(current, sibling)?;
        let mut page = TreePage::new(page);
        let mut new_page = TreePage::new(sibling_page);
        new_page.init(&sibling_pos, NodeFlags::leaf(false), 0)?;
        new_page.append_from(&page, split_at)?;
        page.truncate(split_at)?;

        new_page.set_prev(pos.page_number)?;
        new_page.set_next(old_next)?;
        page.set_next(sibling_pos.page_number)?;
    }

    llt.log(LogRecord::PageCreated {
        pos: sibling_pos,
        flags: NodeFlags::leaf(false).bits(),
        depth: 0,
        element_size: None,
    });
    llt.log(LogRecord::CopyEntries {
        from: pos,
        to: sibling_pos,
        start_index: split_at as u16,
    });
    log_link(llt, &sibling_pos, PREV_OFFSET, pos.page_number);
    log_link(llt, &sibling_pos, NEXT_OFFSET, old_next);
    log_link(llt, &pos, NEXT_OFFSET, sibling_pos.page_number);

    if let Some((next_pos, next)) = next {
        TreePage::new(llt.page_mut(next)?).set_prev(sibling_pos.page_number)?;
        log_link(llt, &next_pos, PREV_OFFSET, sibling_pos.page_number);
    }

    engine.lock_manager().split_page(&pos, &sibling_pos, split_at);
    debug!("split leaf {} at {} into {}", pos, split_at, sibling_pos);

    let right = sibling_pos.page_number;
    insert_separator(engine, llt, path, reserve, level - 1, separator, right)?;
    Ok(SplitContext {
        current,
        sibling,
        index: split_at,
        sequential,
    })
}

fn log_link(llt: &mut LowLevelTransaction, pos: &PagePosition, offset: usize, page_number: i64) {
    llt.log(LogRecord::SetByte8 {
        pos: *pos,
        offset: offset as u16,
        value: page_number as u64,
    });
}

/// Add `(separator -> right)` to the branch at `level` of the path,
/// next to the child the path went through.
///
/// A full branch is split: its upper half moves to a new sibling whose
/// first key goes up as the next separator, and the sibling's first
/// entry loses its key.
fn insert_separator(
    engine: &StorageEngine,
    llt: &mut LowLevelTransaction,
    path: &mut Vec<PathStep>,
    reserve: &mut PageReserve,
    mut level: usize,
    mut separator: Vec<u8>,
    mut right: i64,
) -> SmallResult {
    loop {
        let parent = path[level].latch;
        let parent_pos = llt.position(parent)?;
        let at = path[level + 1].index + 1;
        let fits = TreePage::new(llt.page(parent)?).fits(branch_record_size(separator.len()))?;

        if fits {
            let left = {
                let mut page = TreePage::new(llt.page_mut(parent)?);
                page.insert_branch(at, &separator, right)?;
                page.child(at - 1)?
            };
            llt.log(LogRecord::BranchInsert {
                pos: parent_pos,
                key: separator,
                left_page: left,
                right_page: right,
            });
            return Ok(());
        }

        if level == 0 {
            demote_root(engine, llt, path, reserve)?;
            level = 1;
            continue;
        }

        let sibling_pos = reserve.take(engine, llt)?;
        let sibling = llt.alloc(&sibling_pos)?;
        let (depth, split_at, next_separator, first_child, target_pos, left) = {
            let (page, sibling_page) = llt.pages_mut(parent, sibling)?;
            let mut page = TreePage::new(page);
            let mut new_page = TreePage::new(sibling_page);
            let depth = page.depth()?;
            let split_at = page.split_point()?;
            let next_separator = page.key(split_at)?.to_vec();

            new_page.init(&sibling_pos, NodeFlags::branch(false), depth)?;
            new_page.append_from(&page, split_at)?;
            page.truncate(split_at)?;
            let first_child = new_page.child(0)?;
            new_page.remove(0)?;
            new_page.insert_branch(0, &[], first_child)?;

            let (target_pos, left) = if at <= split_at {
                page.insert_branch(at, &separator, right)?;
                (parent_pos, page.child(at - 1)?)
            } else {
                let at = at - split_at;
                new_page.insert_branch(at, &separator, right)?;
                (sibling_pos, new_page.child(at - 1)?)
            };
            (depth, split_at, next_separator, first_child, target_pos, left)
        };

        llt.log(LogRecord::PageCreated {
            pos: sibling_pos,
            flags: NodeFlags::branch(false).bits(),
            depth,
            element_size: None,
        });
        llt.log(LogRecord::CopyEntries {
            from: parent_pos,
            to: sibling_pos,
            start_index: split_at as u16,
        });
        llt.log(LogRecord::BranchRemove {
            pos: sibling_pos,
            index: 0,
        });
        llt.log(LogRecord::BranchInsert {
            pos: sibling_pos,
            key: Vec::new(),
            left_page: NO_PAGE,
            right_page: first_child,
        });
        llt.log(LogRecord::BranchInsert {
            pos: target_pos,
            key: separator,
            left_page: left,
            right_page: right,
        });
        debug!(
            "split branch {} at {} into {}, depth {}",
            parent_pos, split_at, sibling_pos, depth
        );

        separator = next_separator;
        right = sibling_pos.page_number;
        level -= 1;
    }
}
