use log::{debug, error};

use super::{
    node::{TreePage, NEXT_OFFSET, PREV_OFFSET},
    record::{branch_record_size, NodeFlags},
    PathStep,
};
use crate::{
    engine::StorageEngine,
    error::SmallError,
    storage::{PageHeader, PageKind, PagePosition},
    transaction::{LatchId, LowLevelTransaction},
    tx_log::LogRecord,
    types::{SmallResult, NO_PAGE},
};

/// Remove the now empty, non-root leaf at the end of `path`.
///
/// The leaf leaves the sibling chain and its parent. A non-root branch
/// left with a single child hands it over to a neighbour branch and is
/// removed in turn, one level further up each time. A root branch left
/// with a single child takes over the content of that child, one left
/// without entries becomes an empty root leaf again.
///
/// Both leaf siblings must already be write-latched in `llt`. Returns
/// the vacated pages, to be given back with `free_vacated` once `llt`
/// is committed.
pub(crate) fn remove_empty_leaf(
    engine: &StorageEngine,
    llt: &mut LowLevelTransaction,
    path: &[PathStep],
) -> SmallResult<Vec<PagePosition>> {
    let mut vacated = Vec::new();
    let mut level = path.len() - 1;
    unlink_leaf(llt, path[level].latch)?;

    loop {
        vacated.push(vacate(llt, path[level].latch)?);

        level -= 1;
        let branch = path[level].latch;
        remove_child(llt, branch, path[level + 1].index)?;

        let (count, is_root) = {
            let page = TreePage::new(llt.page(branch)?);
            (page.count()?, page.is_root()?)
        };
        if is_root {
            if count == 0 {
                let pos = llt.position(branch)?;
                TreePage::new(llt.page_mut(branch)?).init(&pos, NodeFlags::leaf(true), 0)?;
                llt.log(LogRecord::RootInit { pos });
                debug!("root {} is an empty leaf again", pos);
            } else {
                collapse_root(engine, llt, branch, &mut vacated)?;
            }
            return Ok(vacated);
        }

        match count {
            0 => continue,
            1 if hand_over_child(llt, path, level)? => continue,
            _ => return Ok(vacated),
        }
    }
}

/// Give pages vacated by a committed removal back to the free-page map.
pub(crate) fn free_vacated(engine: &StorageEngine, vacated: Vec<PagePosition>) {
    for pos in vacated {
        // the tree doesn't reach the page anymore, a failure only leaks it
        if let Err(e) = engine.free_page(&pos) {
            error!("vacated page {} is lost: {}", pos, e);
        }
    }
}

fn unlink_leaf(llt: &mut LowLevelTransaction, leaf: LatchId) -> SmallResult {
    let pos = llt.position(leaf)?;
    let (prev, next) = {
        let page = TreePage::new(llt.page(leaf)?);
        (page.prev()?, page.next()?)
    };

    if prev != NO_PAGE {
        let prev_pos = pos.sibling(prev);
        let prev_latch = latched(llt, &prev_pos, "left sibling")?;
        TreePage::new(llt.page_mut(prev_latch)?).set_next(next)?;
        llt.log(LogRecord::SetByte8 {
            pos: prev_pos,
            offset: NEXT_OFFSET as u16,
            value: next as u64,
        });
    }

    if next != NO_PAGE {
        let next_pos = pos.sibling(next);
        let next_latch = latched(llt, &next_pos, "right sibling")?;
        TreePage::new(llt.page_mut(next_latch)?).set_prev(prev)?;
        llt.log(LogRecord::SetByte8 {
            pos: next_pos,
            offset: PREV_OFFSET as u16,
            value: prev as u64,
        });
    }
    Ok(())
}

fn latched(llt: &LowLevelTransaction, pos: &PagePosition, what: &str) -> SmallResult<LatchId> {
    llt.find(pos)
        .ok_or_else(|| SmallError::latch(&format!("{} {} is not latched", what, pos)))
}

/// Mark a page of the tree as free. It only reaches the free-page map
/// after the commit.
fn vacate(llt: &mut LowLevelTransaction, latch: LatchId) -> SmallResult<PagePosition> {
    let pos = llt.position(latch)?;
    llt.page_mut(latch)?.format(PageKind::Free, &pos)?;
    llt.log(LogRecord::PageFreed { pos });
    debug!("removed page {}", pos);
    Ok(pos)
}

/// Drop entry `index` of a branch. The entry taking the first place
/// loses its key.
fn remove_child(llt: &mut LowLevelTransaction, branch: LatchId, index: usize) -> SmallResult {
    let pos = llt.position(branch)?;
    let first_child = {
        let mut page = TreePage::new(llt.page_mut(branch)?);
        page.remove(index)?;
        if index == 0 && page.count()? > 0 {
            let child = page.child(0)?;
            page.remove(0)?;
            page.insert_branch(0, &[], child)?;
            Some(child)
        } else {
            None
        }
    };

    llt.log(LogRecord::BranchRemove {
        pos,
        index: index as u16,
    });
    if let Some(child) = first_child {
        llt.log(LogRecord::BranchRemove { pos, index: 0 });
        llt.log(LogRecord::BranchInsert {
            pos,
            key: Vec::new(),
            left_page: NO_PAGE,
            right_page: child,
        });
    }
    Ok(())
}

/// Move the only child of the non-root branch at `level` of the path to
/// the neighbour branch on its left, or on its right for a first child.
/// The branch is left without entries.
///
/// False when there is no neighbour, when it is busy or when it has no
/// room for the separator. The branch then keeps its single child.
fn hand_over_child(
    llt: &mut LowLevelTransaction,
    path: &[PathStep],
    level: usize,
) -> SmallResult<bool> {
    let branch = path[level].latch;
    let branch_pos = llt.position(branch)?;
    let index = path[level].index;
    let child = TreePage::new(llt.page(branch)?).child(0)?;

    // separator of the moved child, and the neighbour receiving it
    let (separator, neighbour) = {
        let parent = TreePage::new(llt.page(path[level - 1].latch)?);
        if index > 0 {
            (parent.key(index)?.to_vec(), parent.child(index - 1)?)
        } else if parent.count()? > 1 {
            (parent.key(1)?.to_vec(), parent.child(1)?)
        } else {
            return Ok(false);
        }
    };

    // readers may hold the neighbour while waiting for a leaf latched
    // here, only try
    let neighbour_pos = branch_pos.sibling(neighbour);
    let neighbour = match llt.try_latch_write(&neighbour_pos) {
        Ok(Some(latch)) => latch,
        Ok(None) => {
            debug!("neighbour {} of {} is busy", neighbour_pos, branch_pos);
            return Ok(false);
        }
        Err(e) => {
            debug!("neighbour {} of {} unavailable: {}", neighbour_pos, branch_pos, e);
            return Ok(false);
        }
    };
    if !TreePage::new(llt.page(neighbour)?).fits(branch_record_size(separator.len()))? {
        llt.release(neighbour);
        return Ok(false);
    }

    if index > 0 {
        let left = {
            let mut page = TreePage::new(llt.page_mut(neighbour)?);
            let count = page.count()?;
            page.insert_branch(count, &separator, child)?;
            page.child(count - 1)?
        };
        llt.log(LogRecord::BranchInsert {
            pos: neighbour_pos,
            key: separator,
            left_page: left,
            right_page: child,
        });
    } else {
        // the child goes first, the old first entry gets its key back
        let first = {
            let mut page = TreePage::new(llt.page_mut(neighbour)?);
            let first = page.child(0)?;
            page.remove(0)?;
            page.insert_branch(0, &separator, first)?;
            page.insert_branch(0, &[], child)?;
            first
        };
        llt.log(LogRecord::BranchRemove {
            pos: neighbour_pos,
            index: 0,
        });
        llt.log(LogRecord::BranchInsert {
            pos: neighbour_pos,
            key: separator,
            left_page: NO_PAGE,
            right_page: first,
        });
        llt.log(LogRecord::BranchInsert {
            pos: neighbour_pos,
            key: Vec::new(),
            left_page: NO_PAGE,
            right_page: child,
        });
    }

    TreePage::new(llt.page_mut(branch)?).remove(0)?;
    llt.log(LogRecord::BranchRemove {
        pos: branch_pos,
        index: 0,
    });
    debug!("branch {} hands {} over to {}", branch_pos, child, neighbour_pos);
    Ok(true)
}

/// While the root is a branch with a single child, copy that child into
/// the root and vacate it. The tree gets one level shallower each time.
fn collapse_root(
    engine: &StorageEngine,
    llt: &mut LowLevelTransaction,
    root: LatchId,
    vacated: &mut Vec<PagePosition>,
) -> SmallResult {
    let root_pos = llt.position(root)?;
    loop {
        let child_pos = {
            let page = TreePage::new(llt.page(root)?);
            if page.is_leaf()? || page.count()? != 1 {
                return Ok(());
            }
            root_pos.sibling(page.child(0)?)
        };

        let child = match llt.find(&child_pos) {
            Some(latch) => latch,
            None => match llt.try_latch_write(&child_pos) {
                Ok(Some(latch)) => latch,
                Ok(None) => {
                    debug!("root {} keeps its busy child {}", root_pos, child_pos);
                    return Ok(());
                }
                Err(e) => {
                    debug!("root {} keeps its child {}: {}", root_pos, child_pos, e);
                    return Ok(());
                }
            },
        };

        let (flags, depth) = {
            let (root_page, child_page) = llt.pages_mut(root, child)?;
            root_page.bytes_mut().copy_from_slice(child_page.bytes());
            root_page.set_header(&PageHeader::new(PageKind::Tree, &root_pos))?;

            let mut page = TreePage::new(root_page);
            let flags = page.flags()?.with_root();
            page.set_flags(flags)?;
            (flags, page.depth()?)
        };
        if flags.is_leaf() {
            engine.lock_manager().merge_pages(&child_pos, &root_pos, 0);
        }

        llt.log(LogRecord::PageCreated {
            pos: root_pos,
            flags: flags.bits(),
            depth,
            element_size: None,
        });
        llt.log(LogRecord::CopyEntries {
            from: child_pos,
            to: root_pos,
            start_index: 0,
        });
        vacated.push(vacate(llt, child)?);
        debug!("root {} takes over {}, depth {}", root_pos, child_pos, depth);
    }
}
