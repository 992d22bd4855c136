use std::fmt;

/// The stable logical address of a page.
///
/// Used as the key of the buffer pool map and of the per-page lock
/// queues.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PagePosition {
    pub file_id: i32,
    pub page_number: i64,
}

impl PagePosition {
    pub fn new(file_id: i32, page_number: i64) -> Self {
        Self {
            file_id,
            page_number,
        }
    }

    /// The position of another page in the same file.
    pub fn sibling(&self, page_number: i64) -> Self {
        Self::new(self.file_id, page_number)
    }
}

impl fmt::Display for PagePosition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "page({}:{})", self.file_id, self.page_number)
    }
}

impl fmt::Debug for PagePosition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}
