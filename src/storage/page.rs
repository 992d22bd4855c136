use std::fmt;

use crate::{error::SmallError, storage::PagePosition, types::{Lsn, SmallResult}};

pub const PAGE_SIZE: usize = 16 * 1024;

/// Size of the header region. The common header fields come first,
/// the page-type specific fields fill the rest.
pub const PAGE_HEADER_SIZE: usize = 96;

/// The footer only holds a copy of the LSN.
pub const PAGE_FOOTER_SIZE: usize = 8;

pub const FLAGS_OFFSET: usize = 0;
pub const FILE_ID_OFFSET: usize = 1;
pub const PAGE_NUMBER_OFFSET: usize = 5;
pub const LSN_OFFSET: usize = 13;

/// First byte after the common header fields.
pub const COMMON_HEADER_END: usize = 21;

pub const FOOTER_OFFSET: usize = PAGE_SIZE - PAGE_FOOTER_SIZE;

/// What a page is used for, stored in the flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Free,
    Tree,
    FixedTree,
}

impl PageKind {
    pub fn to_byte(&self) -> u8 {
        match self {
            PageKind::Free => 0,
            PageKind::Tree => 1,
            PageKind::FixedTree => 2,
        }
    }

    pub fn from_byte(byte: u8) -> SmallResult<Self> {
        match byte {
            0 => Ok(PageKind::Free),
            1 => Ok(PageKind::Tree),
            2 => Ok(PageKind::FixedTree),
            _ => Err(SmallError::corruption(&format!(
                "invalid page flags: {}",
                byte
            ))),
        }
    }
}

/// Owned value of the common page header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub kind: PageKind,
    pub file_id: i32,
    pub page_number: i64,
    pub lsn: Lsn,
}

impl PageHeader {
    pub fn new(kind: PageKind, pos: &PagePosition) -> Self {
        Self {
            kind,
            file_id: pos.file_id,
            page_number: pos.page_number,
            lsn: 0,
        }
    }

    pub fn position(&self) -> PagePosition {
        PagePosition::new(self.file_id, self.page_number)
    }
}

/// A fixed-size block of bytes.
///
/// Every access is bounds-checked, an out of range offset is reported
/// as `StructuralCorruption`. Page layouts (tree page, fixed tree page)
/// are typed views that read and write through these accessors.
#[derive(Clone)]
pub struct Page {
    data: Box<[u8]>,
}

impl Page {
    pub fn new() -> Self {
        Self {
            data: vec![0; PAGE_SIZE].into_boxed_slice(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Zero the whole page.
    pub fn reset(&mut self) {
        for b in self.data.iter_mut() {
            *b = 0;
        }
    }

    fn check(&self, offset: usize, len: usize) -> SmallResult {
        match offset.checked_add(len) {
            Some(end) if end <= self.data.len() => Ok(()),
            _ => Err(SmallError::corruption(&format!(
                "access out of page bounds, offset: {}, len: {}",
                offset, len
            ))),
        }
    }

    pub fn read_bytes(&self, offset: usize, len: usize) -> SmallResult<&[u8]> {
        self.check(offset, len)?;
        Ok(&self.data[offset..offset + len])
    }

    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) -> SmallResult {
        self.check(offset, bytes.len())?;
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Move `len` bytes from `src` to `dest` inside the page, the two
    /// ranges may overlap.
    pub fn copy_within(&mut self, src: usize, len: usize, dest: usize) -> SmallResult {
        self.check(src, len)?;
        self.check(dest, len)?;
        self.data.copy_within(src..src + len, dest);
        Ok(())
    }

    pub fn read_u8(&self, offset: usize) -> SmallResult<u8> {
        self.check(offset, 1)?;
        Ok(self.data[offset])
    }

    pub fn write_u8(&mut self, offset: usize, v: u8) -> SmallResult {
        self.check(offset, 1)?;
        self.data[offset] = v;
        Ok(())
    }

    pub fn read_u16(&self, offset: usize) -> SmallResult<u16> {
        let mut buf = [0u8; 2];
        buf.copy_from_slice(self.read_bytes(offset, 2)?);
        Ok(u16::from_le_bytes(buf))
    }

    pub fn write_u16(&mut self, offset: usize, v: u16) -> SmallResult {
        self.write_bytes(offset, &v.to_le_bytes())
    }

    pub fn read_u32(&self, offset: usize) -> SmallResult<u32> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.read_bytes(offset, 4)?);
        Ok(u32::from_le_bytes(buf))
    }

    pub fn write_u32(&mut self, offset: usize, v: u32) -> SmallResult {
        self.write_bytes(offset, &v.to_le_bytes())
    }

    pub fn read_i32(&self, offset: usize) -> SmallResult<i32> {
        Ok(self.read_u32(offset)? as i32)
    }

    pub fn write_i32(&mut self, offset: usize, v: i32) -> SmallResult {
        self.write_bytes(offset, &v.to_le_bytes())
    }

    pub fn read_u64(&self, offset: usize) -> SmallResult<u64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.read_bytes(offset, 8)?);
        Ok(u64::from_le_bytes(buf))
    }

    pub fn write_u64(&mut self, offset: usize, v: u64) -> SmallResult {
        self.write_bytes(offset, &v.to_le_bytes())
    }

    pub fn read_i64(&self, offset: usize) -> SmallResult<i64> {
        Ok(self.read_u64(offset)? as i64)
    }

    pub fn write_i64(&mut self, offset: usize, v: i64) -> SmallResult {
        self.write_bytes(offset, &v.to_le_bytes())
    }

    pub fn header(&self) -> SmallResult<PageHeader> {
        Ok(PageHeader {
            kind: PageKind::from_byte(self.read_u8(FLAGS_OFFSET)?)?,
            file_id: self.read_i32(FILE_ID_OFFSET)?,
            page_number: self.read_i64(PAGE_NUMBER_OFFSET)?,
            lsn: self.read_i64(LSN_OFFSET)?,
        })
    }

    pub fn set_header(&mut self, header: &PageHeader) -> SmallResult {
        self.write_u8(FLAGS_OFFSET, header.kind.to_byte())?;
        self.write_i32(FILE_ID_OFFSET, header.file_id)?;
        self.write_i64(PAGE_NUMBER_OFFSET, header.page_number)?;
        self.write_i64(LSN_OFFSET, header.lsn)?;
        self.write_i64(FOOTER_OFFSET, header.lsn)
    }

    pub fn kind(&self) -> SmallResult<PageKind> {
        PageKind::from_byte(self.read_u8(FLAGS_OFFSET)?)
    }

    pub fn position(&self) -> SmallResult<PagePosition> {
        Ok(PagePosition::new(
            self.read_i32(FILE_ID_OFFSET)?,
            self.read_i64(PAGE_NUMBER_OFFSET)?,
        ))
    }

    pub fn lsn(&self) -> SmallResult<Lsn> {
        self.read_i64(LSN_OFFSET)
    }

    pub fn footer_lsn(&self) -> SmallResult<Lsn> {
        self.read_i64(FOOTER_OFFSET)
    }

    /// Write the LSN into both the header and the footer.
    pub fn stamp_lsn(&mut self, lsn: Lsn) -> SmallResult {
        self.write_i64(LSN_OFFSET, lsn)?;
        self.write_i64(FOOTER_OFFSET, lsn)
    }

    /// Reset the page and write a fresh common header for `pos`.
    pub fn format(&mut self, kind: PageKind, pos: &PagePosition) -> SmallResult {
        self.reset();
        self.set_header(&PageHeader::new(kind, pos))
    }

    /// Hex rendering of the header region, for diagnostics.
    pub fn dump(&self) -> String {
        hex::encode(&self.data[..PAGE_HEADER_SIZE])
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.header() {
            Ok(header) => write!(f, "Page({:?})", header),
            Err(_) => write!(f, "Page(<corrupted header: {}>)", self.dump()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_offsets() {
        let pos = PagePosition::new(7, 42);
        let mut page = Page::new();
        page.format(PageKind::Tree, &pos).unwrap();
        page.stamp_lsn(99).unwrap();

        assert_eq!(page.bytes()[0], 1);
        assert_eq!(&page.bytes()[1..5], &7i32.to_le_bytes());
        assert_eq!(&page.bytes()[5..13], &42i64.to_le_bytes());
        assert_eq!(&page.bytes()[13..21], &99i64.to_le_bytes());
        assert_eq!(page.footer_lsn().unwrap(), 99);

        let header = page.header().unwrap();
        assert_eq!(header.position(), pos);
        assert_eq!(header.kind, PageKind::Tree);
    }

    #[test]
    fn test_out_of_bounds() {
        let mut page = Page::new();
        assert!(page.read_u64(PAGE_SIZE - 4).is_err());
        let err = page.write_u16(PAGE_SIZE, 1).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::StructuralCorruption);
        assert!(page.copy_within(PAGE_SIZE - 8, 16, 0).is_err());
    }
}
