use super::node::TreePage;
use crate::{
    buffer::PageLatch,
    engine::StorageEngine,
    types::{SmallResult, NO_PAGE},
};

/// Forward iterator over leaf entries.
///
/// The current leaf stays read-latched between calls and the next leaf
/// is latched before the current one is released. Don't modify the
/// tree from the thread owning a live cursor.
pub struct TreeCursor<'a> {
    engine: &'a StorageEngine,
    latch: Option<PageLatch>,
    index: usize,
}

impl<'a> TreeCursor<'a> {
    pub(crate) fn new(engine: &'a StorageEngine, latch: PageLatch, index: usize) -> Self {
        Self {
            engine,
            latch: Some(latch),
            index,
        }
    }

    fn advance(&mut self) -> SmallResult<Option<(Vec<u8>, Vec<u8>)>> {
        loop {
            let (entry, next, pos) = match &self.latch {
                None => return Ok(None),
                Some(latch) => {
                    let page = TreePage::new(latch.page());
                    if self.index < page.count()? {
                        let entry = (
                            page.key(self.index)?.to_vec(),
                            page.value(self.index)?.to_vec(),
                        );
                        (Some(entry), NO_PAGE, latch.position())
                    } else {
                        (None, page.next()?, latch.position())
                    }
                }
            };

            if let Some(entry) = entry {
                self.index += 1;
                return Ok(Some(entry));
            }
            if next == NO_PAGE {
                self.latch = None;
                return Ok(None);
            }

            let next = self.engine.pool().fetch(&pos.sibling(next))?.latch_read();
            self.latch = Some(next);
            self.index = 0;
        }
    }
}

impl Iterator for TreeCursor<'_> {
    type Item = SmallResult<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(e) => {
                self.latch = None;
                Some(Err(e))
            }
        }
    }
}
