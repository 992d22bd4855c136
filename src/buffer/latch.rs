use std::{fmt, mem};

use parking_lot::{
    lock_api::{ArcRwLockReadGuard, ArcRwLockUpgradableReadGuard, ArcRwLockWriteGuard},
    RawRwLock,
};

use super::EntryHandle;
use crate::{
    error::SmallError,
    storage::{Page, PagePosition},
    types::SmallResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchMode {
    Read,
    /// Shared with readers, exclusive against other upgradable and
    /// write latches. Used to read a page that may have to be written.
    Upgradable,
    Write,
}

enum LatchGuard {
    Read(ArcRwLockReadGuard<RawRwLock, Page>),
    Upgradable(ArcRwLockUpgradableReadGuard<RawRwLock, Page>),
    Write(ArcRwLockWriteGuard<RawRwLock, Page>),
    // only observable inside `try_upgrade`
    Upgrading,
}

/// A latch on one page, keeping the buffer entry pinned while held.
pub struct PageLatch {
    // declared first: the guard must be released before the pin
    guard: LatchGuard,
    entry: EntryHandle,
    modified: bool,
}

impl PageLatch {
    pub(crate) fn read(guard: ArcRwLockReadGuard<RawRwLock, Page>, entry: EntryHandle) -> Self {
        Self {
            guard: LatchGuard::Read(guard),
            entry,
            modified: false,
        }
    }

    pub(crate) fn upgradable(
        guard: ArcRwLockUpgradableReadGuard<RawRwLock, Page>,
        entry: EntryHandle,
    ) -> Self {
        Self {
            guard: LatchGuard::Upgradable(guard),
            entry,
            modified: false,
        }
    }

    pub(crate) fn write(guard: ArcRwLockWriteGuard<RawRwLock, Page>, entry: EntryHandle) -> Self {
        Self {
            guard: LatchGuard::Write(guard),
            entry,
            modified: false,
        }
    }

    pub fn position(&self) -> PagePosition {
        self.entry.position()
    }

    pub fn entry(&self) -> &EntryHandle {
        &self.entry
    }

    pub fn mode(&self) -> LatchMode {
        match self.guard {
            LatchGuard::Read(_) => LatchMode::Read,
            LatchGuard::Upgradable(_) => LatchMode::Upgradable,
            LatchGuard::Write(_) | LatchGuard::Upgrading => LatchMode::Write,
        }
    }

    /// Whether the page was borrowed mutably through this latch.
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn page(&self) -> &Page {
        match &self.guard {
            LatchGuard::Read(g) => &**g,
            LatchGuard::Upgradable(g) => &**g,
            LatchGuard::Write(g) => &**g,
            LatchGuard::Upgrading => unreachable!("latch observed in the middle of an upgrade"),
        }
    }

    pub fn page_mut(&mut self) -> SmallResult<&mut Page> {
        match &mut self.guard {
            LatchGuard::Write(g) => {
                self.modified = true;
                Ok(&mut **g)
            }
            _ => Err(SmallError::latch(&format!(
                "{} is not write-latched",
                self.entry.position()
            ))),
        }
    }

    /// Escalate an upgradable latch to a write latch without blocking.
    ///
    /// Returns false (and keeps the upgradable latch) when other
    /// readers are present. A write latch upgrades trivially.
    pub fn try_upgrade(&mut self) -> bool {
        match mem::replace(&mut self.guard, LatchGuard::Upgrading) {
            LatchGuard::Upgradable(g) => match ArcRwLockUpgradableReadGuard::try_upgrade(g) {
                Ok(w) => {
                    self.guard = LatchGuard::Write(w);
                    true
                }
                Err(g) => {
                    self.guard = LatchGuard::Upgradable(g);
                    false
                }
            },
            LatchGuard::Write(w) => {
                self.guard = LatchGuard::Write(w);
                true
            }
            other => {
                self.guard = other;
                false
            }
        }
    }

    /// Give up the latch but keep the entry pinned.
    pub fn unlatch(self) -> EntryHandle {
        let PageLatch { guard, entry, .. } = self;
        drop(guard);
        entry
    }
}

impl fmt::Debug for PageLatch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PageLatch({}, {:?})", self.position(), self.mode())
    }
}
