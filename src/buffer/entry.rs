use std::{
    fmt,
    ops::Deref,
    sync::{
        atomic::{AtomicU8, AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::RwLock;

use super::PageLatch;
use crate::{
    storage::{Page, PagePosition},
    utils::latch_state,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Bytes are being read from the store, the loader holds the write
    /// latch.
    Loading,
    Clean,
    Dirty,
    /// The load failed, the entry is about to be dropped from the pool.
    Failed,
}

impl EntryState {
    fn to_u8(self) -> u8 {
        match self {
            EntryState::Loading => 0,
            EntryState::Clean => 1,
            EntryState::Dirty => 2,
            EntryState::Failed => 3,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => EntryState::Loading,
            1 => EntryState::Clean,
            2 => EntryState::Dirty,
            _ => EntryState::Failed,
        }
    }
}

/// One cached page.
///
/// An entry with a positive reference count is never evicted.
pub struct BufferEntry {
    position: PagePosition,

    // index of the pool slot, also the node of the lru/flush lists
    slot: usize,

    latch: Arc<RwLock<Page>>,
    ref_count: AtomicUsize,
    state: AtomicU8,
}

impl BufferEntry {
    pub(crate) fn new(position: PagePosition, slot: usize, state: EntryState) -> Self {
        Self {
            position,
            slot,
            latch: Arc::new(RwLock::new(Page::new())),
            ref_count: AtomicUsize::new(0),
            state: AtomicU8::new(state.to_u8()),
        }
    }

    pub fn position(&self) -> PagePosition {
        self.position
    }

    pub(crate) fn slot(&self) -> usize {
        self.slot
    }

    pub(crate) fn latch(&self) -> &Arc<RwLock<Page>> {
        &self.latch
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn state(&self) -> EntryState {
        EntryState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: EntryState) {
        self.state.store(state.to_u8(), Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.state() == EntryState::Dirty
    }

    pub(crate) fn pin(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unpin(&self) {
        let prev = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpin of an unreferenced entry");
    }
}

impl fmt::Debug for BufferEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "BufferEntry({}, refs: {}, {:?}, latch: {})",
            self.position,
            self.ref_count(),
            self.state(),
            latch_state(&self.latch)
        )
    }
}

/// A pinned reference to a buffer entry. Dropping it releases the pin.
pub struct EntryHandle {
    entry: Arc<BufferEntry>,
}

impl EntryHandle {
    /// Wrap an entry whose reference count was already incremented
    /// under the pool mutex.
    pub(crate) fn from_pinned(entry: Arc<BufferEntry>) -> Self {
        Self { entry }
    }

    pub fn same_entry(&self, other: &EntryHandle) -> bool {
        Arc::ptr_eq(&self.entry, &other.entry)
    }

    pub fn latch_read(self) -> PageLatch {
        let guard = self.entry.latch().read_arc();
        PageLatch::read(guard, self)
    }

    pub fn latch_upgradable(self) -> PageLatch {
        let guard = self.entry.latch().upgradable_read_arc();
        PageLatch::upgradable(guard, self)
    }

    pub fn latch_write(self) -> PageLatch {
        let guard = self.entry.latch().write_arc();
        PageLatch::write(guard, self)
    }

    /// Take the write latch only if it is free right now.
    pub fn try_latch_write(self) -> Result<PageLatch, EntryHandle> {
        match self.entry.latch().try_write_arc() {
            Some(guard) => Ok(PageLatch::write(guard, self)),
            None => Err(self),
        }
    }
}

impl Deref for EntryHandle {
    type Target = BufferEntry;

    fn deref(&self) -> &Self::Target {
        &self.entry
    }
}

impl Clone for EntryHandle {
    fn clone(&self) -> Self {
        self.entry.pin();
        Self {
            entry: Arc::clone(&self.entry),
        }
    }
}

impl Drop for EntryHandle {
    fn drop(&mut self) {
        self.entry.unpin();
    }
}

impl fmt::Debug for EntryHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self.entry)
    }
}
