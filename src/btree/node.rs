use std::{
    cmp::Ordering,
    fmt,
    ops::{Deref, DerefMut},
};

use super::record::{
    branch_record_size, NodeFlags, RecordHeader, RECORD_HEADER_SIZE, VERSION_HEADER_SIZE,
};
use crate::{
    error::SmallError,
    storage::{
        Page, PageKind, PagePosition, COMMON_HEADER_END, FOOTER_OFFSET, PAGE_HEADER_SIZE,
    },
    types::{SmallResult, NO_PAGE},
};

pub const PREV_OFFSET: usize = COMMON_HEADER_END;
pub const NEXT_OFFSET: usize = COMMON_HEADER_END + 8;
pub const LOW_OFFSET: usize = COMMON_HEADER_END + 16;
pub const UPPER_OFFSET: usize = COMMON_HEADER_END + 18;
pub const COUNT_OFFSET: usize = COMMON_HEADER_END + 20;
pub const USED_SIZE_OFFSET: usize = COMMON_HEADER_END + 22;
pub const NODE_FLAGS_OFFSET: usize = COMMON_HEADER_END + 24;
pub const DEPTH_OFFSET: usize = COMMON_HEADER_END + 25;

const SLOT_SIZE: usize = 2;

/// Bytes available to slots and records of an empty page.
pub const USABLE_SPACE: usize = FOOTER_OFFSET - PAGE_HEADER_SIZE;

/// Key ordering of a tree.
pub type Comparator = fn(&[u8], &[u8]) -> Ordering;

pub fn bytes_compare(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

/// Slotted page view of a variable-key tree node.
///
/// The slot array (2-byte record offsets in key order) grows from the
/// end of the header, record bytes grow down from the footer:
///
/// `[header][slots ->   low ... upper   <- records][footer]`
///
/// Removing a record leaves a hole, holes are squeezed out by
/// `compact` when an insert doesn't fit in the contiguous free space.
///
/// In branch pages entry 0 has an empty key and points to the leftmost
/// child, the key of entry `i >= 1` is the smallest key reachable
/// through its child.
pub struct TreePage<T> {
    page: T,
}

impl<T: Deref<Target = Page>> TreePage<T> {
    pub fn new(page: T) -> Self {
        Self { page }
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    pub fn position(&self) -> SmallResult<PagePosition> {
        self.page.position()
    }

    pub fn count(&self) -> SmallResult<usize> {
        Ok(self.page.read_u16(COUNT_OFFSET)? as usize)
    }

    pub fn low(&self) -> SmallResult<usize> {
        Ok(self.page.read_u16(LOW_OFFSET)? as usize)
    }

    pub fn upper(&self) -> SmallResult<usize> {
        Ok(self.page.read_u16(UPPER_OFFSET)? as usize)
    }

    /// Bytes of live records, holes excluded.
    pub fn used_size(&self) -> SmallResult<usize> {
        Ok(self.page.read_u16(USED_SIZE_OFFSET)? as usize)
    }

    pub fn flags(&self) -> SmallResult<NodeFlags> {
        Ok(NodeFlags::from_bits(self.page.read_u8(NODE_FLAGS_OFFSET)?))
    }

    pub fn is_leaf(&self) -> SmallResult<bool> {
        Ok(self.flags()?.is_leaf())
    }

    pub fn is_root(&self) -> SmallResult<bool> {
        Ok(self.flags()?.is_root())
    }

    /// Distance from the leaf level, leaves are at 0.
    pub fn depth(&self) -> SmallResult<u8> {
        self.page.read_u8(DEPTH_OFFSET)
    }

    pub fn prev(&self) -> SmallResult<i64> {
        self.page.read_i64(PREV_OFFSET)
    }

    pub fn next(&self) -> SmallResult<i64> {
        self.page.read_i64(NEXT_OFFSET)
    }

    /// Validate the header pointers.
    pub fn check(&self) -> SmallResult {
        if self.page.kind()? != PageKind::Tree {
            return Err(SmallError::corruption(&format!(
                "{:?} is not a tree page",
                self.page.position()?
            )));
        }
        let count = self.count()?;
        let low = self.low()?;
        let upper = self.upper()?;
        if low != PAGE_HEADER_SIZE + count * SLOT_SIZE || upper < low || upper > FOOTER_OFFSET {
            return Err(SmallError::corruption(&format!(
                "bad slotted page header, count: {}, low: {}, upper: {}",
                count, low, upper
            )));
        }
        Ok(())
    }

    /// Contiguous free bytes between the slot array and the records.
    pub fn free_space(&self) -> SmallResult<usize> {
        let low = self.low()?;
        let upper = self.upper()?;
        if upper < low {
            return Err(SmallError::corruption(&format!(
                "low {} above upper {}",
                low, upper
            )));
        }
        Ok(upper - low)
    }

    /// Free bytes after compaction.
    pub fn total_free(&self) -> SmallResult<usize> {
        let taken = self.count()? * SLOT_SIZE + self.used_size()?;
        USABLE_SPACE.checked_sub(taken).ok_or_else(|| {
            SmallError::corruption(&format!("used size {} exceeds the page", taken))
        })
    }

    /// Whether a record of `size` bytes can be inserted, compacting if
    /// needed.
    pub fn fits(&self, size: usize) -> SmallResult<bool> {
        Ok(self.total_free()? >= size + SLOT_SIZE)
    }

    pub fn slot(&self, index: usize) -> SmallResult<usize> {
        let count = self.count()?;
        if index >= count {
            return Err(SmallError::corruption(&format!(
                "slot {} out of {} entries",
                index, count
            )));
        }
        let offset = self.page.read_u16(PAGE_HEADER_SIZE + index * SLOT_SIZE)? as usize;
        if offset < PAGE_HEADER_SIZE || offset >= FOOTER_OFFSET {
            return Err(SmallError::corruption(&format!(
                "slot {} points outside the page: {}",
                index, offset
            )));
        }
        Ok(offset)
    }

    pub fn header(&self, index: usize) -> SmallResult<RecordHeader> {
        let leaf = self.is_leaf()?;
        RecordHeader::decode(&self.page, self.slot(index)?, leaf)
    }

    /// The raw bytes of one record, header included.
    pub fn raw_record(&self, index: usize) -> SmallResult<&[u8]> {
        let leaf = self.is_leaf()?;
        let offset = self.slot(index)?;
        let header = RecordHeader::decode(&self.page, offset, leaf)?;
        let size = header.record_size(leaf);
        if offset + size > FOOTER_OFFSET {
            return Err(SmallError::corruption(&format!(
                "record {} overflows the page, offset: {}, size: {}",
                index, offset, size
            )));
        }
        self.page.read_bytes(offset, size)
    }

    pub fn key(&self, index: usize) -> SmallResult<&[u8]> {
        let leaf = self.is_leaf()?;
        let offset = self.slot(index)?;
        let header = RecordHeader::decode(&self.page, offset, leaf)?;
        self.page
            .read_bytes(offset + header.key_offset(leaf), header.key_size as usize)
    }

    pub fn value(&self, index: usize) -> SmallResult<&[u8]> {
        let offset = self.slot(index)?;
        let header = RecordHeader::decode(&self.page, offset, true)?;
        self.page.read_bytes(
            offset + header.key_offset(true) + header.key_size as usize,
            header.data_size as usize,
        )
    }

    /// `(txn_id, rollback_pointer)` of a primary leaf record.
    pub fn version(&self, index: usize) -> SmallResult<Option<(i64, i64)>> {
        let offset = self.slot(index)?;
        let header = RecordHeader::decode(&self.page, offset, true)?;
        if !header.has_version() {
            return Ok(None);
        }
        let base = offset + RECORD_HEADER_SIZE;
        Ok(Some((
            self.page.read_i64(base)?,
            self.page.read_i64(base + 8)?,
        )))
    }

    pub fn child(&self, index: usize) -> SmallResult<i64> {
        let offset = self.slot(index)?;
        Ok(RecordHeader::decode(&self.page, offset, false)?.child)
    }

    /// Search a leaf.
    ///
    /// Returns `(Equal, i)` when the key is at `i`, otherwise the
    /// comparison of the key against the entry at the insertion point
    /// `i`: `(Less, i)`, or `(Greater, count)` past the last entry.
    pub fn search(&self, key: &[u8], compare: Comparator) -> SmallResult<(Ordering, usize)> {
        let count = self.count()?;
        if count == 0 {
            return Ok((Ordering::Greater, 0));
        }

        match compare(key, self.key(count - 1)?) {
            Ordering::Greater => return Ok((Ordering::Greater, count)),
            Ordering::Equal => return Ok((Ordering::Equal, count - 1)),
            Ordering::Less => {}
        }
        match compare(key, self.key(0)?) {
            Ordering::Greater => {}
            other => return Ok((other, 0)),
        }

        // key(0) < key < key(count - 1)
        let (mut lo, mut hi) = (1, count - 1);
        while lo < hi {
            let mid = (lo + hi) / 2;
            match compare(key, self.key(mid)?) {
                Ordering::Equal => return Ok((Ordering::Equal, mid)),
                Ordering::Greater => lo = mid + 1,
                Ordering::Less => hi = mid,
            }
        }
        Ok((Ordering::Less, lo))
    }

    /// Index of the branch entry to descend into for `key`: the last
    /// entry whose key is less than or equal to it, entry 0 if none is.
    pub fn child_index(&self, key: &[u8], compare: Comparator) -> SmallResult<usize> {
        let count = self.count()?;
        if count <= 1 {
            return Ok(0);
        }
        if compare(key, self.key(count - 1)?) != Ordering::Less {
            return Ok(count - 1);
        }
        if compare(key, self.key(1)?) == Ordering::Less {
            return Ok(0);
        }

        // key(lo) <= key < key(hi)
        let (mut lo, mut hi) = (1, count - 1);
        while hi - lo > 1 {
            let mid = (lo + hi) / 2;
            if compare(key, self.key(mid)?) == Ordering::Less {
                hi = mid;
            } else {
                lo = mid;
            }
        }
        Ok(lo)
    }

    /// Index to move entries from when splitting: the first entry past
    /// half of the used bytes, keeping both halves non-empty.
    pub fn split_point(&self) -> SmallResult<usize> {
        let count = self.count()?;
        if count < 2 {
            return Ok(0);
        }
        let half = self.used_size()? / 2;
        let mut acc = 0;
        for i in 0..count {
            acc += self.raw_record(i)?.len();
            if acc >= half {
                return Ok((i + 1).max(1).min(count - 1));
            }
        }
        Ok(count - 1)
    }

    /// Entry keys in order, for diagnostics.
    pub fn keys(&self) -> SmallResult<Vec<Vec<u8>>> {
        let mut keys = Vec::new();
        for i in 0..self.count()? {
            keys.push(self.key(i)?.to_vec());
        }
        Ok(keys)
    }
}

impl<T: DerefMut<Target = Page>> TreePage<T> {
    pub fn page_mut(&mut self) -> &mut Page {
        &mut self.page
    }

    /// Format an empty node.
    pub fn init(&mut self, pos: &PagePosition, flags: NodeFlags, depth: u8) -> SmallResult {
        self.page.format(PageKind::Tree, pos)?;
        self.page.write_i64(PREV_OFFSET, NO_PAGE)?;
        self.page.write_i64(NEXT_OFFSET, NO_PAGE)?;
        self.page.write_u16(LOW_OFFSET, PAGE_HEADER_SIZE as u16)?;
        self.page.write_u16(UPPER_OFFSET, FOOTER_OFFSET as u16)?;
        self.page.write_u16(COUNT_OFFSET, 0)?;
        self.page.write_u16(USED_SIZE_OFFSET, 0)?;
        self.set_flags(flags)?;
        self.set_depth(depth)
    }

    pub fn set_flags(&mut self, flags: NodeFlags) -> SmallResult {
        self.page.write_u8(NODE_FLAGS_OFFSET, flags.bits())
    }

    pub fn set_depth(&mut self, depth: u8) -> SmallResult {
        self.page.write_u8(DEPTH_OFFSET, depth)
    }

    pub fn set_prev(&mut self, page_number: i64) -> SmallResult {
        self.page.write_i64(PREV_OFFSET, page_number)
    }

    pub fn set_next(&mut self, page_number: i64) -> SmallResult {
        self.page.write_i64(NEXT_OFFSET, page_number)
    }

    fn set_count(&mut self, count: usize) -> SmallResult {
        self.page.write_u16(COUNT_OFFSET, count as u16)
    }

    fn set_used_size(&mut self, size: usize) -> SmallResult {
        self.page.write_u16(USED_SIZE_OFFSET, size as u16)
    }

    /// Reserve `size` bytes for a record and one slot, compacting the
    /// page when the contiguous free space is too small. Returns the
    /// record offset, the slot array is not touched.
    fn alloc(&mut self, size: usize) -> SmallResult<usize> {
        if self.free_space()? < size + SLOT_SIZE {
            if !self.fits(size)? {
                return Err(SmallError::full(&format!(
                    "{} bytes don't fit in {:?}",
                    size,
                    self.page.position()?
                )));
            }
            self.compact()?;
        }

        let upper = self.upper()? - size;
        let low = self.low()? + SLOT_SIZE;
        self.page.write_u16(UPPER_OFFSET, upper as u16)?;
        self.page.write_u16(LOW_OFFSET, low as u16)?;
        Ok(upper)
    }

    /// Insert raw record bytes at `index`.
    pub fn insert_raw(&mut self, index: usize, record: &[u8]) -> SmallResult {
        let count = self.count()?;
        if index > count {
            return Err(SmallError::corruption(&format!(
                "insert at {} beyond {} entries",
                index, count
            )));
        }

        let offset = self.alloc(record.len())?;
        self.page.write_bytes(offset, record)?;

        let slot_at = PAGE_HEADER_SIZE + index * SLOT_SIZE;
        self.page.copy_within(
            slot_at,
            (count - index) * SLOT_SIZE,
            slot_at + SLOT_SIZE,
        )?;
        self.page.write_u16(slot_at, offset as u16)?;

        self.set_count(count + 1)?;
        let used = self.used_size()?;
        self.set_used_size(used + record.len())
    }

    pub fn insert_leaf(
        &mut self,
        index: usize,
        key: &[u8],
        value: &[u8],
        content: u8,
        version: Option<(i64, i64)>,
    ) -> SmallResult {
        let header = RecordHeader::leaf(key.len(), value.len(), content);
        let mut record = vec![0; header.record_size(true)];
        record[..RECORD_HEADER_SIZE].copy_from_slice(&header.to_bytes(true));
        let mut at = RECORD_HEADER_SIZE;
        if let Some((txn_id, rollback)) = version {
            record[at..at + 8].copy_from_slice(&txn_id.to_le_bytes());
            record[at + 8..at + 16].copy_from_slice(&rollback.to_le_bytes());
            at += VERSION_HEADER_SIZE;
        }
        record[at..at + key.len()].copy_from_slice(key);
        at += key.len();
        record[at..at + value.len()].copy_from_slice(value);

        self.insert_raw(index, &record)
    }

    pub fn insert_branch(&mut self, index: usize, key: &[u8], child: i64) -> SmallResult {
        let mut record = vec![0; branch_record_size(key.len())];
        let header = RecordHeader::branch(key.len(), child);
        record[..RECORD_HEADER_SIZE].copy_from_slice(&header.to_bytes(false));
        record[RECORD_HEADER_SIZE..].copy_from_slice(key);
        self.insert_raw(index, &record)
    }

    pub fn set_child(&mut self, index: usize, child: i64) -> SmallResult {
        let offset = self.slot(index)?;
        self.page.write_i64(offset + 3, child)
    }

    /// Remove the entry at `index`. Its bytes become a hole.
    pub fn remove(&mut self, index: usize) -> SmallResult {
        let count = self.count()?;
        let offset = self.slot(index)?;
        let size = self.raw_record(index)?.len();
        self.page.write_u8(offset, 1)?;

        let slot_at = PAGE_HEADER_SIZE + index * SLOT_SIZE;
        self.page.copy_within(
            slot_at + SLOT_SIZE,
            (count - index - 1) * SLOT_SIZE,
            slot_at,
        )?;

        let low = self.low()? - SLOT_SIZE;
        self.page.write_u16(LOW_OFFSET, low as u16)?;
        self.set_count(count - 1)?;
        let used = self.used_size()?;
        self.set_used_size(used - size)?;

        if count == 1 {
            // nothing live left, reclaim everything
            self.page.write_u16(UPPER_OFFSET, FOOTER_OFFSET as u16)?;
        }
        Ok(())
    }

    /// Drop the entries at and above `from`.
    pub fn truncate(&mut self, from: usize) -> SmallResult {
        let count = self.count()?;
        for index in (from..count).rev() {
            self.remove(index)?;
        }
        Ok(())
    }

    /// Append the entries of `src` starting at `start`.
    pub fn append_from<S: Deref<Target = Page>>(
        &mut self,
        src: &TreePage<S>,
        start: usize,
    ) -> SmallResult {
        for index in start..src.count()? {
            let at = self.count()?;
            self.insert_raw(at, src.raw_record(index)?)?;
        }
        Ok(())
    }

    /// Rewrite the records contiguously against the footer, in slot
    /// order.
    pub fn compact(&mut self) -> SmallResult {
        let count = self.count()?;
        let mut records = Vec::with_capacity(count);
        for index in 0..count {
            records.push(self.raw_record(index)?.to_vec());
        }

        let mut upper = FOOTER_OFFSET;
        for (index, record) in records.iter().enumerate() {
            upper -= record.len();
            self.page.write_bytes(upper, record)?;
            self.page
                .write_u16(PAGE_HEADER_SIZE + index * SLOT_SIZE, upper as u16)?;
        }
        self.page.write_u16(UPPER_OFFSET, upper as u16)
    }
}

impl<T: Deref<Target = Page>> fmt::Debug for TreePage<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let describe = || -> SmallResult<String> {
            Ok(format!(
                "TreePage({:?}, {:?}, depth: {}, count: {}, free: {}, prev: {}, next: {})",
                self.position()?,
                self.flags()?,
                self.depth()?,
                self.count()?,
                self.total_free()?,
                self.prev()?,
                self.next()?,
            ))
        };
        match describe() {
            Ok(s) => write!(f, "{}", s),
            Err(e) => write!(f, "TreePage(<{}>)", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::record::ContentFlags;

    fn leaf() -> TreePage<Box<Page>> {
        let mut page = TreePage::new(Box::new(Page::new()));
        page.init(&PagePosition::new(1, 1), NodeFlags::leaf(false), 0)
            .unwrap();
        page
    }

    #[test]
    fn test_header_offsets() {
        let page = leaf();
        assert_eq!(page.page().read_i64(21).unwrap(), NO_PAGE);
        assert_eq!(page.page().read_u16(37).unwrap(), 96);
        assert_eq!(page.page().read_u16(39).unwrap(), FOOTER_OFFSET as u16);
        assert_eq!(page.page().read_u8(45).unwrap(), NodeFlags::LEAF);
    }

    #[test]
    fn test_search() {
        let mut page = leaf();
        for (i, k) in [b"b", b"d", b"f"].iter().enumerate() {
            page.insert_leaf(i, *k, b"v", ContentFlags::DATA, None).unwrap();
        }

        let cmp = bytes_compare;
        assert_eq!(page.search(b"a", cmp).unwrap(), (Ordering::Less, 0));
        assert_eq!(page.search(b"b", cmp).unwrap(), (Ordering::Equal, 0));
        assert_eq!(page.search(b"c", cmp).unwrap(), (Ordering::Less, 1));
        assert_eq!(page.search(b"d", cmp).unwrap(), (Ordering::Equal, 1));
        assert_eq!(page.search(b"e", cmp).unwrap(), (Ordering::Less, 2));
        assert_eq!(page.search(b"f", cmp).unwrap(), (Ordering::Equal, 2));
        assert_eq!(page.search(b"g", cmp).unwrap(), (Ordering::Greater, 3));

        // reading doesn't change the outcome
        let before = page.search(b"e", cmp).unwrap();
        let _ = page.keys().unwrap();
        assert_eq!(page.search(b"e", cmp).unwrap(), before);
    }

    #[test]
    fn test_child_index() {
        let mut page = TreePage::new(Box::new(Page::new()));
        page.init(&PagePosition::new(1, 1), NodeFlags::branch(true), 1)
            .unwrap();
        page.insert_branch(0, b"", 10).unwrap();
        page.insert_branch(1, b"d", 11).unwrap();
        page.insert_branch(2, b"h", 12).unwrap();
        page.insert_branch(3, b"m", 13).unwrap();

        let cmp = bytes_compare;
        assert_eq!(page.child_index(b"a", cmp).unwrap(), 0);
        assert_eq!(page.child_index(b"d", cmp).unwrap(), 1);
        assert_eq!(page.child_index(b"g", cmp).unwrap(), 1);
        assert_eq!(page.child_index(b"h", cmp).unwrap(), 2);
        assert_eq!(page.child_index(b"l", cmp).unwrap(), 2);
        assert_eq!(page.child_index(b"z", cmp).unwrap(), 3);
        assert_eq!(page.child(2).unwrap(), 12);
    }

    #[test]
    fn test_compaction() {
        let mut page = leaf();
        let value = vec![9u8; 1000];
        let mut n = 0;
        while page
            .insert_leaf(n, &(n as u32).to_be_bytes(), &value, ContentFlags::DATA, None)
            .is_ok()
        {
            n += 1;
        }
        assert!(n > 10);
        assert!(!page.fits(1000 + 16).unwrap());

        // free space is scattered in holes until an insert compacts it
        page.remove(0).unwrap();
        page.remove(3).unwrap();
        assert!(page.free_space().unwrap() < 1016 + 2);
        assert!(page.fits(1016).unwrap());

        page.insert_leaf(0, &[0, 0, 0, 0], &value, ContentFlags::DATA, None)
            .unwrap();
        assert_eq!(page.count().unwrap(), n - 1);
        assert_eq!(page.key(0).unwrap(), &[0, 0, 0, 0]);
        assert_eq!(page.value(1).unwrap(), &value[..]);
        page.check().unwrap();
    }

    #[test]
    fn test_corrupted_slot() {
        let mut page = leaf();
        page.insert_leaf(0, b"k", b"v", ContentFlags::DATA, None)
            .unwrap();
        page.page_mut().write_u16(PAGE_HEADER_SIZE, 10).unwrap();
        let err = page.key(0).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::StructuralCorruption);
    }
}
