use std::{collections::HashMap, fmt, sync::Arc};

use log::{debug, error};
use parking_lot::Mutex;

use super::{lru::IntrusiveList, BufferEntry, EntryHandle, EntryState, PageLatch};
use crate::{
    config::BufferPoolConfig,
    error::SmallError,
    storage::{PagePosition, PageStore},
    types::SmallResult,
};

#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
    /// Block until a concurrent load finishes. When false the fetch
    /// reports "no entry" instead.
    pub wait: bool,

    /// Move the entry to the front of the LRU list. Tree descent skips
    /// this for intermediate branch pages.
    pub touch_lru: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            wait: true,
            touch_lru: true,
        }
    }
}

impl FetchOptions {
    pub fn no_touch() -> Self {
        Self {
            wait: true,
            touch_lru: false,
        }
    }

    pub fn no_wait() -> Self {
        Self {
            wait: false,
            touch_lru: true,
        }
    }
}

struct PoolInner {
    map: HashMap<PagePosition, usize>,
    slots: Vec<Option<Arc<BufferEntry>>>,
    free_slots: Vec<usize>,
    lru: IntrusiveList,
    flush: IntrusiveList,
}

impl PoolInner {
    fn entry(&self, slot: usize) -> Option<&Arc<BufferEntry>> {
        self.slots.get(slot).and_then(|s| s.as_ref())
    }

    fn new_slot(&mut self, pos: &PagePosition, state: EntryState) -> Arc<BufferEntry> {
        let slot = match self.free_slots.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        };
        let entry = Arc::new(BufferEntry::new(*pos, slot, state));
        self.slots[slot] = Some(Arc::clone(&entry));
        self.map.insert(*pos, slot);
        self.lru.push_front(slot);
        entry
    }

    fn remove_slot(&mut self, slot: usize) {
        if let Some(entry) = self.slots[slot].take() {
            self.map.remove(&entry.position());
        }
        self.lru.remove(slot);
        self.flush.remove(slot);
        self.free_slots.push(slot);
    }
}

/// The page cache.
///
/// One pool-wide mutex guards the map and the LRU/flush lists. Page
/// bytes are guarded by the per-entry latch only, so loads and long
/// page scans never hold the pool mutex.
pub struct BufferPool {
    inner: Mutex<PoolInner>,
    store: Arc<dyn PageStore>,
    config: BufferPoolConfig,
}

impl BufferPool {
    pub fn new(config: BufferPoolConfig, store: Arc<dyn PageStore>) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                map: HashMap::new(),
                slots: Vec::new(),
                free_slots: Vec::new(),
                lru: IntrusiveList::new(),
                flush: IntrusiveList::new(),
            }),
            store,
            config,
        }
    }

    pub fn config(&self) -> &BufferPoolConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn PageStore> {
        &self.store
    }

    /// Fetch a page, loading it from the store if it's not cached.
    ///
    /// The returned handle is pinned. Concurrent callers for the same
    /// missing page trigger exactly one load: the first caller inserts a
    /// `Loading` entry while holding its write latch, the others pin
    /// that entry and wait on its read latch.
    pub fn get_entry(
        &self,
        pos: &PagePosition,
        options: FetchOptions,
    ) -> SmallResult<Option<EntryHandle>> {
        let mut inner = self.inner.lock();

        if let Some(slot) = inner.map.get(pos).copied() {
            let entry = match inner.entry(slot) {
                Some(entry) => Arc::clone(entry),
                None => {
                    return Err(SmallError::corruption(&format!(
                        "buffer pool slot {} of {} is empty",
                        slot, pos
                    )))
                }
            };

            if entry.state() != EntryState::Loading {
                entry.pin();
                if options.touch_lru {
                    inner.lru.move_to_front(slot);
                }
                return Ok(Some(EntryHandle::from_pinned(entry)));
            }

            if !options.wait {
                return Ok(None);
            }

            entry.pin();
            let handle = EntryHandle::from_pinned(entry);
            drop(inner);

            // the loader holds the write latch until the bytes are in
            drop(handle.latch().read());

            if handle.state() == EntryState::Failed {
                return Err(SmallError::not_found(&format!("load of {} failed", pos)));
            }

            if options.touch_lru {
                let mut inner = self.inner.lock();
                if inner.map.get(pos) == Some(&handle.slot()) {
                    inner.lru.move_to_front(handle.slot());
                }
            }
            return Ok(Some(handle));
        }

        // miss: publish a loading entry, then read outside the mutex
        let entry = inner.new_slot(pos, EntryState::Loading);
        entry.pin();
        let mut guard = entry.latch().write_arc();
        self.evict(&mut inner);
        drop(inner);

        debug!("load {}", pos);
        let result = self.store.read_page(pos, guard.bytes_mut());
        let handle = EntryHandle::from_pinned(entry);
        match result {
            Ok(()) => {
                handle.set_state(EntryState::Clean);
                drop(guard);
                Ok(Some(handle))
            }
            Err(e) => {
                error!("load {} failed: {}", pos, e);
                handle.set_state(EntryState::Failed);
                self.inner.lock().remove_slot(handle.slot());
                drop(guard);
                Err(e)
            }
        }
    }

    /// `get_entry` with the default options.
    pub fn fetch(&self, pos: &PagePosition) -> SmallResult<EntryHandle> {
        self.fetch_with(pos, FetchOptions::default())
    }

    /// `get_entry` for callers that can't do anything useful with a
    /// missing entry.
    pub fn fetch_with(
        &self,
        pos: &PagePosition,
        options: FetchOptions,
    ) -> SmallResult<EntryHandle> {
        match self.get_entry(pos, options)? {
            Some(handle) => Ok(handle),
            None => Err(SmallError::not_found(&format!("{} is not available", pos))),
        }
    }

    /// Create a zero-filled page without reading the store, returned
    /// write-latched.
    ///
    /// If the position is still cached (a freed page being reused) the
    /// cached entry is reset instead.
    pub fn alloc_entry(&self, pos: &PagePosition) -> SmallResult<PageLatch> {
        let mut inner = self.inner.lock();

        if let Some(slot) = inner.map.get(pos).copied() {
            let entry = match inner.entry(slot) {
                Some(entry) => Arc::clone(entry),
                None => {
                    return Err(SmallError::corruption(&format!(
                        "buffer pool slot {} of {} is empty",
                        slot, pos
                    )))
                }
            };
            entry.pin();
            inner.lru.move_to_front(slot);
            drop(inner);

            let mut latch = EntryHandle::from_pinned(entry).latch_write();
            latch.page_mut()?.reset();
            return Ok(latch);
        }

        let entry = inner.new_slot(pos, EntryState::Clean);
        entry.pin();
        let guard = entry.latch().write_arc();
        self.evict(&mut inner);
        drop(inner);

        debug!("alloc {}", pos);
        let mut latch = PageLatch::write(guard, EntryHandle::from_pinned(entry));
        latch.page_mut()?.reset();
        Ok(latch)
    }

    /// Put an entry on the flush list. Called while the page is still
    /// write-latched.
    pub fn mark_dirty(&self, entry: &EntryHandle) {
        let mut inner = self.inner.lock();
        if inner.map.get(&entry.position()) != Some(&entry.slot()) {
            return;
        }
        if entry.state() != EntryState::Dirty {
            entry.set_state(EntryState::Dirty);
            inner.flush.push_back(entry.slot());
        }
    }

    /// Drop clean, unreferenced entries from the LRU tail until the pool
    /// is back within its limit. Dirty entries wait for a flush.
    fn evict(&self, inner: &mut PoolInner) {
        if inner.map.len() <= self.config.lru_limit {
            return;
        }

        for slot in inner.lru.iter_from_tail() {
            if inner.map.len() <= self.config.lru_limit {
                break;
            }
            let evictable = match inner.entry(slot) {
                Some(entry) if entry.ref_count() == 0 && entry.state() == EntryState::Clean => {
                    debug!("evict {:?}", entry);
                    true
                }
                _ => false,
            };
            if evictable {
                inner.remove_slot(slot);
            }
        }
    }

    /// Dirty entries without holders, least recently used first.
    pub fn flush_candidates(&self, limit: usize) -> Vec<PagePosition> {
        let inner = self.inner.lock();
        inner
            .lru
            .iter_from_tail()
            .into_iter()
            .filter_map(|slot| inner.entry(slot))
            .filter(|e| e.ref_count() == 0 && e.state() == EntryState::Dirty)
            .map(|e| e.position())
            .take(limit)
            .collect()
    }

    /// Write one cached page through the store. Returns false if the
    /// page isn't cached or isn't dirty.
    pub fn flush_page(&self, pos: &PagePosition) -> SmallResult<bool> {
        let handle = {
            let inner = self.inner.lock();
            match inner.map.get(pos).and_then(|&slot| inner.entry(slot)) {
                Some(entry) if entry.state() == EntryState::Dirty => {
                    entry.pin();
                    EntryHandle::from_pinned(Arc::clone(entry))
                }
                _ => return Ok(false),
            }
        };

        let latch = handle.latch_read();
        self.store.write_page(pos, latch.page().bytes())?;
        {
            let mut inner = self.inner.lock();
            latch.entry().set_state(EntryState::Clean);
            let slot = latch.entry().slot();
            inner.flush.remove(slot);
        }
        debug!("flushed {}", pos);
        Ok(true)
    }

    /// Flush every dirty page, in flush list order.
    pub fn flush_all(&self) -> SmallResult<usize> {
        let positions: Vec<PagePosition> = {
            let inner = self.inner.lock();
            inner
                .flush
                .iter_from_head()
                .into_iter()
                .filter_map(|slot| inner.entry(slot).map(|e| e.position()))
                .collect()
        };

        let mut count = 0;
        for pos in positions {
            if self.flush_page(&pos)? {
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn contains(&self, pos: &PagePosition) -> bool {
        self.inner.lock().map.contains_key(pos)
    }

    pub fn entries_count(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn dirty_count(&self) -> usize {
        self.inner.lock().flush.len()
    }

    /// Cached positions, most recently used first.
    pub fn lru_order(&self) -> Vec<PagePosition> {
        let inner = self.inner.lock();
        inner
            .lru
            .iter_from_head()
            .into_iter()
            .filter_map(|slot| inner.entry(slot).map(|e| e.position()))
            .collect()
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock();
        write!(
            f,
            "BufferPool(entries: {}, dirty: {}, limit: {})",
            inner.map.len(),
            inner.flush.len(),
            self.config.lru_limit
        )
    }
}
