use std::{
    cmp::Ordering,
    fmt,
    ops::{Deref, DerefMut},
};

use crate::{
    btree::{node::USABLE_SPACE, record::NodeFlags},
    error::SmallError,
    storage::{Page, PageKind, PagePosition, COMMON_HEADER_END, PAGE_HEADER_SIZE},
    types::{SmallResult, NO_PAGE},
};

pub const FIXED_COUNT_OFFSET: usize = COMMON_HEADER_END;
pub const ELEMENT_SIZE_OFFSET: usize = COMMON_HEADER_END + 2;
pub const FIXED_FLAGS_OFFSET: usize = COMMON_HEADER_END + 4;
pub const FIXED_DEPTH_OFFSET: usize = COMMON_HEADER_END + 5;
pub const FIXED_PREV_OFFSET: usize = COMMON_HEADER_END + 6;
pub const FIXED_NEXT_OFFSET: usize = COMMON_HEADER_END + 14;

const KEY_SIZE: usize = 8;

/// Densely packed node of a fixed-size tree.
///
/// Entry `i` lives at `PAGE_HEADER_SIZE + i * record_size`. Leaf
/// records are `key (i64) + value (element_size)`, branch records are
/// `key (i64) + child page number (i64)`. The key of branch entry 0 is
/// never read.
pub struct FixedPage<T> {
    page: T,
}

impl<T: Deref<Target = Page>> FixedPage<T> {
    pub fn new(page: T) -> Self {
        Self { page }
    }

    pub fn position(&self) -> SmallResult<PagePosition> {
        self.page.position()
    }

    pub fn count(&self) -> SmallResult<usize> {
        Ok(self.page.read_u16(FIXED_COUNT_OFFSET)? as usize)
    }

    pub fn element_size(&self) -> SmallResult<usize> {
        Ok(self.page.read_u16(ELEMENT_SIZE_OFFSET)? as usize)
    }

    pub fn flags(&self) -> SmallResult<NodeFlags> {
        Ok(NodeFlags::from_bits(self.page.read_u8(FIXED_FLAGS_OFFSET)?))
    }

    pub fn is_leaf(&self) -> SmallResult<bool> {
        Ok(self.flags()?.is_leaf())
    }

    pub fn depth(&self) -> SmallResult<u8> {
        self.page.read_u8(FIXED_DEPTH_OFFSET)
    }

    pub fn prev(&self) -> SmallResult<i64> {
        self.page.read_i64(FIXED_PREV_OFFSET)
    }

    pub fn next(&self) -> SmallResult<i64> {
        self.page.read_i64(FIXED_NEXT_OFFSET)
    }

    pub fn record_size(&self) -> SmallResult<usize> {
        if self.is_leaf()? {
            Ok(KEY_SIZE + self.element_size()?)
        } else {
            Ok(KEY_SIZE + 8)
        }
    }

    pub fn capacity(&self) -> SmallResult<usize> {
        Ok(USABLE_SPACE / self.record_size()?)
    }

    pub fn is_full(&self) -> SmallResult<bool> {
        Ok(self.count()? >= self.capacity()?)
    }

    pub fn check(&self) -> SmallResult {
        if self.page.kind()? != PageKind::FixedTree {
            return Err(SmallError::corruption(&format!(
                "{:?} is not a fixed tree page",
                self.page.position()?
            )));
        }
        if self.count()? > self.capacity()? {
            return Err(SmallError::corruption(&format!(
                "{} entries exceed the capacity {}",
                self.count()?,
                self.capacity()?
            )));
        }
        Ok(())
    }

    fn offset(&self, index: usize) -> SmallResult<usize> {
        let count = self.count()?;
        if index >= count {
            return Err(SmallError::corruption(&format!(
                "entry {} out of {} entries",
                index, count
            )));
        }
        Ok(PAGE_HEADER_SIZE + index * self.record_size()?)
    }

    pub fn key(&self, index: usize) -> SmallResult<i64> {
        self.page.read_i64(self.offset(index)?)
    }

    pub fn value(&self, index: usize) -> SmallResult<&[u8]> {
        let offset = self.offset(index)?;
        self.page.read_bytes(offset + KEY_SIZE, self.element_size()?)
    }

    pub fn child(&self, index: usize) -> SmallResult<i64> {
        self.page.read_i64(self.offset(index)? + KEY_SIZE)
    }

    fn raw_record(&self, index: usize) -> SmallResult<&[u8]> {
        let offset = self.offset(index)?;
        self.page.read_bytes(offset, self.record_size()?)
    }

    /// Same contract as the slotted page search.
    pub fn search(&self, key: i64) -> SmallResult<(Ordering, usize)> {
        let count = self.count()?;
        if count == 0 {
            return Ok((Ordering::Greater, 0));
        }
        match key.cmp(&self.key(count - 1)?) {
            Ordering::Greater => return Ok((Ordering::Greater, count)),
            Ordering::Equal => return Ok((Ordering::Equal, count - 1)),
            Ordering::Less => {}
        }

        let (mut lo, mut hi) = (0, count - 1);
        while lo < hi {
            let mid = (lo + hi) / 2;
            match key.cmp(&self.key(mid)?) {
                Ordering::Equal => return Ok((Ordering::Equal, mid)),
                Ordering::Greater => lo = mid + 1,
                Ordering::Less => hi = mid,
            }
        }
        Ok((Ordering::Less, lo))
    }

    pub fn child_index(&self, key: i64) -> SmallResult<usize> {
        let count = self.count()?;
        if count <= 1 {
            return Ok(0);
        }
        if key >= self.key(count - 1)? {
            return Ok(count - 1);
        }

        // entry 0 has no key: look for the last entry <= key in 1..count
        let (mut lo, mut hi) = (0, count - 1);
        while hi - lo > 1 {
            let mid = (lo + hi) / 2;
            if key < self.key(mid)? {
                hi = mid;
            } else {
                lo = mid;
            }
        }
        Ok(lo)
    }
}

impl<T: DerefMut<Target = Page>> FixedPage<T> {
    pub fn init(
        &mut self,
        pos: &PagePosition,
        flags: NodeFlags,
        depth: u8,
        element_size: u16,
    ) -> SmallResult {
        self.page.format(PageKind::FixedTree, pos)?;
        self.page.write_u16(FIXED_COUNT_OFFSET, 0)?;
        self.page.write_u16(ELEMENT_SIZE_OFFSET, element_size)?;
        self.set_flags(flags)?;
        self.page.write_u8(FIXED_DEPTH_OFFSET, depth)?;
        self.set_prev(NO_PAGE)?;
        self.set_next(NO_PAGE)
    }

    pub fn set_flags(&mut self, flags: NodeFlags) -> SmallResult {
        self.page.write_u8(FIXED_FLAGS_OFFSET, flags.bits())
    }

    pub fn set_prev(&mut self, page_number: i64) -> SmallResult {
        self.page.write_i64(FIXED_PREV_OFFSET, page_number)
    }

    pub fn set_next(&mut self, page_number: i64) -> SmallResult {
        self.page.write_i64(FIXED_NEXT_OFFSET, page_number)
    }

    fn set_count(&mut self, count: usize) -> SmallResult {
        self.page.write_u16(FIXED_COUNT_OFFSET, count as u16)
    }

    fn insert_raw(&mut self, index: usize, record: &[u8]) -> SmallResult {
        let count = self.count()?;
        if index > count {
            return Err(SmallError::corruption(&format!(
                "insert at {} beyond {} entries",
                index, count
            )));
        }
        if count >= self.capacity()? {
            return Err(SmallError::full(&format!(
                "{:?} is full",
                self.page.position()?
            )));
        }

        let size = self.record_size()?;
        let at = PAGE_HEADER_SIZE + index * size;
        self.page.copy_within(at, (count - index) * size, at + size)?;
        self.page.write_bytes(at, record)?;
        self.set_count(count + 1)
    }

    pub fn insert_leaf(&mut self, index: usize, key: i64, value: &[u8]) -> SmallResult {
        let mut record = Vec::with_capacity(KEY_SIZE + value.len());
        record.extend_from_slice(&key.to_le_bytes());
        record.extend_from_slice(value);
        self.insert_raw(index, &record)
    }

    pub fn insert_branch(&mut self, index: usize, key: i64, child: i64) -> SmallResult {
        let mut record = Vec::with_capacity(KEY_SIZE + 8);
        record.extend_from_slice(&key.to_le_bytes());
        record.extend_from_slice(&child.to_le_bytes());
        self.insert_raw(index, &record)
    }

    pub fn set_key(&mut self, index: usize, key: i64) -> SmallResult {
        let offset = self.offset(index)?;
        self.page.write_i64(offset, key)
    }

    /// Overwrite a leaf value in place. Returns its offset in the page.
    pub fn set_value(&mut self, index: usize, value: &[u8]) -> SmallResult<usize> {
        let offset = self.offset(index)? + KEY_SIZE;
        self.page.write_bytes(offset, value)?;
        Ok(offset)
    }

    pub fn remove(&mut self, index: usize) -> SmallResult {
        let count = self.count()?;
        let size = self.record_size()?;
        let at = self.offset(index)?;
        self.page
            .copy_within(at + size, (count - index - 1) * size, at)?;
        self.set_count(count - 1)
    }

    pub fn truncate(&mut self, from: usize) -> SmallResult {
        if from < self.count()? {
            self.set_count(from)?;
        }
        Ok(())
    }

    pub fn append_from<S: Deref<Target = Page>>(
        &mut self,
        src: &FixedPage<S>,
        start: usize,
    ) -> SmallResult {
        for index in start..src.count()? {
            let at = self.count()?;
            self.insert_raw(at, src.raw_record(index)?)?;
        }
        Ok(())
    }
}

impl<T: Deref<Target = Page>> fmt::Debug for FixedPage<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let describe = || -> SmallResult<String> {
            Ok(format!(
                "FixedPage({:?}, {:?}, depth: {}, count: {}/{})",
                self.position()?,
                self.flags()?,
                self.depth()?,
                self.count()?,
                self.capacity()?,
            ))
        };
        match describe() {
            Ok(s) => write!(f, "{}", s),
            Err(e) => write!(f, "FixedPage(<{}>)", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_and_shift() {
        let mut page = FixedPage::new(Box::new(Page::new()));
        page.init(&PagePosition::new(1, 0), NodeFlags::leaf(true), 0, 4)
            .unwrap();
        assert_eq!(page.capacity().unwrap(), USABLE_SPACE / 12);

        for (i, key) in [10i64, 20, 30].iter().enumerate() {
            page.insert_leaf(i, *key, &[i as u8; 4]).unwrap();
        }
        assert_eq!(page.search(5).unwrap(), (Ordering::Less, 0));
        assert_eq!(page.search(20).unwrap(), (Ordering::Equal, 1));
        assert_eq!(page.search(25).unwrap(), (Ordering::Less, 2));
        assert_eq!(page.search(31).unwrap(), (Ordering::Greater, 3));

        page.insert_leaf(1, 15, &[9; 4]).unwrap();
        assert_eq!(page.key(2).unwrap(), 20);
        assert_eq!(page.value(1).unwrap(), &[9; 4]);

        page.remove(0).unwrap();
        assert_eq!(page.key(0).unwrap(), 15);
        assert_eq!(page.count().unwrap(), 3);
    }

    #[test]
    fn test_child_index() {
        let mut page = FixedPage::new(Box::new(Page::new()));
        page.init(&PagePosition::new(1, 0), NodeFlags::branch(true), 1, 0)
            .unwrap();
        page.insert_branch(0, i64::MIN, 100).unwrap();
        page.insert_branch(1, 50, 101).unwrap();
        page.insert_branch(2, 90, 102).unwrap();

        assert_eq!(page.child_index(-7).unwrap(), 0);
        assert_eq!(page.child_index(49).unwrap(), 0);
        assert_eq!(page.child_index(50).unwrap(), 1);
        assert_eq!(page.child_index(89).unwrap(), 1);
        assert_eq!(page.child_index(1000).unwrap(), 2);
    }
}
