/*
B+trees stored in buffer pool pages.

Two flavours share the same latching discipline (top-down, left to
right) and the same logging: `Tree` keeps variable-size records in
slotted pages and takes record locks, `FixedSizeTree` keeps i64 keys
with fixed-size values and is used for internal bookkeeping such as
the free-page map.
*/

mod cursor;
mod delete;
pub mod fixed;
mod node;
mod record;
mod split;
mod tree;

pub use cursor::TreeCursor;
pub use fixed::FixedSizeTree;
pub use node::{bytes_compare, Comparator, TreePage, USABLE_SPACE};
pub use record::{
    branch_record_size, leaf_record_size, ContentFlags, NodeFlags, RecordHeader,
    MAX_KEY_SIZE, MAX_RECORD_SIZE, RECORD_HEADER_SIZE, VERSION_HEADER_SIZE,
};
pub use tree::{Tree, TreeKind, TreeRoot};

use crate::{error::SmallError, transaction::LatchId, types::{SmallResult, NO_PAGE}};

/// Shape of a tree, as measured by `check_integrity`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    /// Depth of the root, 0 when the root is a leaf.
    pub depth: usize,
    pub leaves: usize,
    pub branches: usize,
    pub entries: usize,
}

/// One level of a write-latched root-to-leaf path.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PathStep {
    pub latch: LatchId,

    /// Index of this page in its parent, 0 for the root.
    pub index: usize,
}

/// A leaf seen by an integrity check, in key order.
pub(crate) struct LeafLink {
    pub page_number: i64,
    pub prev: i64,
    pub next: i64,
}

/// The sibling links of the leaves must follow key order.
pub(crate) fn check_leaf_chain(leaves: &[LeafLink]) -> SmallResult {
    for (i, leaf) in leaves.iter().enumerate() {
        let expected_prev = if i == 0 { NO_PAGE } else { leaves[i - 1].page_number };
        let expected_next = leaves.get(i + 1).map_or(NO_PAGE, |l| l.page_number);
        if leaf.prev != expected_prev || leaf.next != expected_next {
            return Err(SmallError::corruption(&format!(
                "leaf {} links ({}, {}), expected ({}, {})",
                leaf.page_number, leaf.prev, leaf.next, expected_prev, expected_next
            )));
        }
    }
    Ok(())
}
