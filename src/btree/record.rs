use std::fmt;

use crate::{storage::Page, types::SmallResult};

/// Size of the per-record header:
///
/// - deleted flag (1) @0
/// - key size (2) @1
/// - child page number (8, branch) or data size (2, leaf) @3
/// - content flags (1) @11
pub const RECORD_HEADER_SIZE: usize = 12;

/// `(txn_id, rollback_pointer)`, only in primary leaf records.
pub const VERSION_HEADER_SIZE: usize = 16;

pub const MAX_KEY_SIZE: usize = 1024;
pub const MAX_RECORD_SIZE: usize = 4000;

const DELETED_OFFSET: usize = 0;
const KEY_SIZE_OFFSET: usize = 1;
const UNION_OFFSET: usize = 3;
const CONTENT_FLAGS_OFFSET: usize = 11;

/// Role of a tree page, stored in its header.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeFlags(u8);

impl NodeFlags {
    pub const ROOT: u8 = 1;
    pub const LEAF: u8 = 2;
    pub const BRANCH: u8 = 4;

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn leaf(root: bool) -> Self {
        Self(Self::LEAF | if root { Self::ROOT } else { 0 })
    }

    pub fn branch(root: bool) -> Self {
        Self(Self::BRANCH | if root { Self::ROOT } else { 0 })
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 & Self::ROOT != 0
    }

    pub fn is_leaf(&self) -> bool {
        self.0 & Self::LEAF != 0
    }

    pub fn is_branch(&self) -> bool {
        self.0 & Self::BRANCH != 0
    }

    pub fn without_root(&self) -> Self {
        Self(self.0 & !Self::ROOT)
    }

    pub fn with_root(&self) -> Self {
        Self(self.0 | Self::ROOT)
    }
}

impl fmt::Debug for NodeFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = if self.is_leaf() { "Leaf" } else { "Branch" };
        if self.is_root() {
            write!(f, "Root|{}", kind)
        } else {
            write!(f, "{}", kind)
        }
    }
}

/// What a leaf record holds.
pub struct ContentFlags;

impl ContentFlags {
    pub const PRIMARY: u8 = 1;
    pub const DATA: u8 = 2;
    pub const PAGE: u8 = 4;
    pub const OVERFLOW: u8 = 8;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub deleted: bool,
    pub key_size: u16,

    /// Child page number, branch records only.
    pub child: i64,

    /// Value size, leaf records only.
    pub data_size: u16,

    pub content: u8,
}

impl RecordHeader {
    pub fn leaf(key_size: usize, data_size: usize, content: u8) -> Self {
        Self {
            deleted: false,
            key_size: key_size as u16,
            child: 0,
            data_size: data_size as u16,
            content,
        }
    }

    pub fn branch(key_size: usize, child: i64) -> Self {
        Self {
            deleted: false,
            key_size: key_size as u16,
            child,
            data_size: 0,
            content: ContentFlags::PAGE,
        }
    }

    pub fn has_version(&self) -> bool {
        self.content & ContentFlags::PRIMARY != 0
    }

    pub fn decode(page: &Page, offset: usize, leaf: bool) -> SmallResult<Self> {
        let deleted = page.read_u8(offset + DELETED_OFFSET)? != 0;
        let key_size = page.read_u16(offset + KEY_SIZE_OFFSET)?;
        let content = page.read_u8(offset + CONTENT_FLAGS_OFFSET)?;
        let (child, data_size) = if leaf {
            (0, page.read_u16(offset + UNION_OFFSET)?)
        } else {
            (page.read_i64(offset + UNION_OFFSET)?, 0)
        };
        Ok(Self {
            deleted,
            key_size,
            child,
            data_size,
            content,
        })
    }

    pub fn encode(&self, page: &mut Page, offset: usize, leaf: bool) -> SmallResult {
        page.write_bytes(offset, &self.to_bytes(leaf))
    }

    pub fn to_bytes(&self, leaf: bool) -> [u8; RECORD_HEADER_SIZE] {
        let mut buf = [0u8; RECORD_HEADER_SIZE];
        buf[DELETED_OFFSET] = self.deleted as u8;
        buf[KEY_SIZE_OFFSET..KEY_SIZE_OFFSET + 2].copy_from_slice(&self.key_size.to_le_bytes());
        if leaf {
            buf[UNION_OFFSET..UNION_OFFSET + 2].copy_from_slice(&self.data_size.to_le_bytes());
        } else {
            buf[UNION_OFFSET..UNION_OFFSET + 8].copy_from_slice(&self.child.to_le_bytes());
        }
        buf[CONTENT_FLAGS_OFFSET] = self.content;
        buf
    }

    /// Offset of the key from the start of the record.
    pub fn key_offset(&self, leaf: bool) -> usize {
        if leaf && self.has_version() {
            RECORD_HEADER_SIZE + VERSION_HEADER_SIZE
        } else {
            RECORD_HEADER_SIZE
        }
    }

    /// Total bytes of the record.
    pub fn record_size(&self, leaf: bool) -> usize {
        self.key_offset(leaf)
            + self.key_size as usize
            + if leaf { self.data_size as usize } else { 0 }
    }
}

/// Bytes needed by a leaf record.
pub fn leaf_record_size(key_size: usize, data_size: usize, primary: bool) -> usize {
    let version = if primary { VERSION_HEADER_SIZE } else { 0 };
    RECORD_HEADER_SIZE + version + key_size + data_size
}

pub fn branch_record_size(key_size: usize) -> usize {
    RECORD_HEADER_SIZE + key_size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_union_field() {
        let mut page = Page::new();

        RecordHeader::leaf(4, 300, ContentFlags::PRIMARY | ContentFlags::DATA)
            .encode(&mut page, 200, true)
            .unwrap();
        let leaf = RecordHeader::decode(&page, 200, true).unwrap();
        assert_eq!(leaf.data_size, 300);
        assert_eq!(leaf.key_offset(true), 28);
        assert_eq!(leaf.record_size(true), 28 + 4 + 300);

        RecordHeader::branch(4, 1 << 40).encode(&mut page, 200, false).unwrap();
        let branch = RecordHeader::decode(&page, 200, false).unwrap();
        assert_eq!(branch.child, 1 << 40);
        assert_eq!(branch.record_size(false), 16);
    }
}
