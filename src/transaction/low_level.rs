use std::{fmt, mem};

use log::{debug, error, warn};

use crate::{
    buffer::{BufferPool, FetchOptions, LatchMode, PageLatch},
    error::SmallError,
    storage::{Page, PagePosition},
    tx_log::{LogRecord, LogSink},
    types::{Lsn, SmallResult},
};

/// Handle of a latch held by a `LowLevelTransaction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatchId(usize);

/// The context of one tree call.
///
/// Every page latch taken by the call is registered here. Latches on
/// pages that were never written may be released early (latch coupling),
/// latches on modified pages stay until `commit` or `rollback`.
///
/// On commit the buffered log records are appended to the sink, the
/// returned LSN is stamped into every modified page and those pages are
/// marked dirty, all while the write latches are still held.
pub struct LowLevelTransaction<'a> {
    pool: &'a BufferPool,
    sink: &'a dyn LogSink,

    latches: Vec<Option<PageLatch>>,
    records: Vec<LogRecord>,

    // nesting depth of BeginMulti/EndMulti
    multi_depth: usize,
}

impl<'a> LowLevelTransaction<'a> {
    pub fn new(pool: &'a BufferPool, sink: &'a dyn LogSink) -> Self {
        Self {
            pool,
            sink,
            latches: Vec::new(),
            records: Vec::new(),
            multi_depth: 0,
        }
    }

    pub fn pool(&self) -> &'a BufferPool {
        self.pool
    }

    fn track(&mut self, latch: PageLatch) -> LatchId {
        self.latches.push(Some(latch));
        LatchId(self.latches.len() - 1)
    }

    /// The latch this transaction holds on `pos`, if any.
    pub fn find(&self, pos: &PagePosition) -> Option<LatchId> {
        self.latches
            .iter()
            .position(|l| l.as_ref().map_or(false, |l| l.position() == *pos))
            .map(LatchId)
    }

    // latches are not reentrant, a second latch on the same page from
    // the same thread would block forever
    fn check_reentry(&self, pos: &PagePosition) -> SmallResult {
        if self.find(pos).is_some() {
            return Err(SmallError::latch(&format!("{} is already latched", pos)));
        }
        Ok(())
    }

    pub fn latch(
        &mut self,
        pos: &PagePosition,
        mode: LatchMode,
        options: FetchOptions,
    ) -> SmallResult<LatchId> {
        self.check_reentry(pos)?;
        let handle = match self.pool.get_entry(pos, options)? {
            Some(handle) => handle,
            None => return Err(SmallError::not_found(&format!("{} is loading", pos))),
        };
        let latch = match mode {
            LatchMode::Read => handle.latch_read(),
            LatchMode::Upgradable => handle.latch_upgradable(),
            LatchMode::Write => handle.latch_write(),
        };
        Ok(self.track(latch))
    }

    /// Take a write latch without blocking. `None` if anyone else holds
    /// the page or it is still loading.
    pub fn try_latch_write(&mut self, pos: &PagePosition) -> SmallResult<Option<LatchId>> {
        self.check_reentry(pos)?;
        let handle = match self.pool.get_entry(pos, FetchOptions::no_wait())? {
            Some(handle) => handle,
            None => return Ok(None),
        };
        match handle.try_latch_write() {
            Ok(latch) => Ok(Some(self.track(latch))),
            Err(_) => Ok(None),
        }
    }

    /// Write-latch `pos`, or hand back the write latch this transaction
    /// already holds on it. Several operations on the same tree can then
    /// share one transaction.
    pub fn latch_write(&mut self, pos: &PagePosition) -> SmallResult<LatchId> {
        match self.find(pos) {
            Some(id) if self.get(id)?.mode() == LatchMode::Write => Ok(id),
            Some(_) => Err(SmallError::latch(&format!(
                "{} is held, but not for writing",
                pos
            ))),
            None => self.latch(pos, LatchMode::Write, FetchOptions::default()),
        }
    }

    /// Register a latch taken outside of the transaction, e.g. at the end
    /// of an optimistic descent.
    pub fn adopt(&mut self, latch: PageLatch) -> SmallResult<LatchId> {
        self.check_reentry(&latch.position())?;
        Ok(self.track(latch))
    }

    /// Latch a brand new zero-filled page.
    pub fn alloc(&mut self, pos: &PagePosition) -> SmallResult<LatchId> {
        self.check_reentry(pos)?;
        let latch = self.pool.alloc_entry(pos)?;
        Ok(self.track(latch))
    }

    fn get(&self, id: LatchId) -> SmallResult<&PageLatch> {
        match self.latches.get(id.0) {
            Some(Some(latch)) => Ok(latch),
            _ => Err(SmallError::latch(&format!("latch {:?} was released", id))),
        }
    }

    fn get_mut(&mut self, id: LatchId) -> SmallResult<&mut PageLatch> {
        match self.latches.get_mut(id.0) {
            Some(Some(latch)) => Ok(latch),
            _ => Err(SmallError::latch(&format!("latch {:?} was released", id))),
        }
    }

    pub fn position(&self, id: LatchId) -> SmallResult<PagePosition> {
        Ok(self.get(id)?.position())
    }

    pub fn mode(&self, id: LatchId) -> SmallResult<LatchMode> {
        Ok(self.get(id)?.mode())
    }

    pub fn page(&self, id: LatchId) -> SmallResult<&Page> {
        Ok(self.get(id)?.page())
    }

    pub fn page_mut(&mut self, id: LatchId) -> SmallResult<&mut Page> {
        self.get_mut(id)?.page_mut()
    }

    /// Two distinct write-latched pages at once.
    pub fn pages_mut(&mut self, a: LatchId, b: LatchId) -> SmallResult<(&mut Page, &mut Page)> {
        if a == b {
            return Err(SmallError::latch("the two latches must differ"));
        }
        let (lo, hi) = if a.0 < b.0 { (a.0, b.0) } else { (b.0, a.0) };
        if hi >= self.latches.len() {
            return Err(SmallError::latch(&format!("latch {} was never taken", hi)));
        }

        let (left, right) = self.latches.split_at_mut(hi);
        let first = match left[lo].as_mut() {
            Some(latch) => latch.page_mut()?,
            None => return Err(SmallError::latch(&format!("latch {} was released", lo))),
        };
        let second = match right[0].as_mut() {
            Some(latch) => latch.page_mut()?,
            None => return Err(SmallError::latch(&format!("latch {} was released", hi))),
        };

        if a.0 < b.0 {
            Ok((first, second))
        } else {
            Ok((second, first))
        }
    }

    pub fn try_upgrade(&mut self, id: LatchId) -> SmallResult<bool> {
        Ok(self.get_mut(id)?.try_upgrade())
    }

    /// Release a latch before the end of the transaction. Latches on
    /// modified pages are kept until commit.
    pub fn release(&mut self, id: LatchId) {
        if let Some(slot) = self.latches.get_mut(id.0) {
            if slot.as_ref().map_or(false, |l| !l.is_modified()) {
                slot.take();
            }
        }
    }

    pub fn log(&mut self, record: LogRecord) {
        self.records.push(record);
    }

    pub fn begin_multi(&mut self) {
        if self.multi_depth == 0 {
            self.records.push(LogRecord::BeginMulti);
        }
        self.multi_depth += 1;
    }

    pub fn end_multi(&mut self) {
        match self.multi_depth {
            0 => warn!("EndMulti without BeginMulti"),
            1 => {
                self.multi_depth = 0;
                self.records.push(LogRecord::EndMulti);
            }
            _ => self.multi_depth -= 1,
        }
    }

    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }

    /// Publish the buffered records and release every latch. Returns the
    /// LSN stamped into the modified pages, `None` if nothing was
    /// logged.
    pub fn commit(mut self) -> SmallResult<Option<Lsn>> {
        if self.multi_depth > 0 {
            warn!("commit inside a multi-page operation, closing it");
            self.multi_depth = 0;
            self.records.push(LogRecord::EndMulti);
        }

        let records = mem::take(&mut self.records);
        let lsn = if records.is_empty() {
            None
        } else {
            Some(self.sink.append(&records)?)
        };

        let pool = self.pool;
        for latch in self.latches.iter_mut().flatten() {
            if latch.is_modified() {
                if let Some(lsn) = lsn {
                    latch.page_mut()?.stamp_lsn(lsn)?;
                }
                pool.mark_dirty(latch.entry());
            }
        }
        self.latches.clear();
        Ok(lsn)
    }

    /// Release every latch and discard the buffered records.
    ///
    /// Callers only roll back before touching any page, page bytes are
    /// not restored.
    pub fn rollback(mut self) {
        debug!("rollback {:?}", self);
        self.keep_modified();
        self.records.clear();
        self.multi_depth = 0;
        self.latches.clear();
    }

    // A modified page never goes back to being evictable, a reload from
    // the store would silently drop the change.
    fn keep_modified(&mut self) {
        let pool = self.pool;
        for latch in self.latches.iter().flatten() {
            if latch.is_modified() {
                error!("{} modified by an unfinished {:?}", latch.position(), self);
                pool.mark_dirty(latch.entry());
            }
        }
    }
}

impl Drop for LowLevelTransaction<'_> {
    fn drop(&mut self) {
        if !self.records.is_empty() {
            warn!(
                "low-level transaction dropped with {} pending log records",
                self.records.len()
            );
        }
        self.keep_modified();
    }
}

impl fmt::Debug for LowLevelTransaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let latches: Vec<String> = self
            .latches
            .iter()
            .flatten()
            .map(|l| format!("{}:{:?}", l.position(), l.mode()))
            .collect();
        write!(
            f,
            "LowLevelTransaction(latches: [{}], records: {})",
            latches.join(", "),
            self.records.len()
        )
    }
}
