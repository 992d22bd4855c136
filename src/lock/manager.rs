use std::{collections::HashSet, fmt, sync::Arc};

use log::{debug, warn};
use parking_lot::Mutex;

use super::{
    entry::{
        clear_bit, insert_bit, or_shifted, remove_bit, set_bit, split_bits, LockEntry,
        LockRequest, LockStatus, QueueKey,
    },
    table::LockTable,
};
use crate::{
    error::{ErrorKind, SmallError},
    storage::PagePosition,
    transaction::{Transaction, TransactionState},
    types::{SmallResult, TransactionId},
};

/// Record and table locks of every transaction.
///
/// Record locks are kept per page as bitmaps, one bit per record slot,
/// so the trees report every slot shift (insert, remove, split, merge)
/// to keep the bits aligned with the records.
#[derive(Default)]
pub struct LockManager {
    table: Mutex<LockTable>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a lock without blocking.
    ///
    /// On `WaitLock` the request stays queued and the transaction is in
    /// the `Waiting` state: the caller must release its latches, `wait`,
    /// then repeat the same request, which will find the granted entry.
    pub fn lock(&self, tx: &Arc<Transaction>, request: &LockRequest) -> SmallResult<LockStatus> {
        let mut table = self.table.lock();
        table.register(tx);
        let txn = tx.get_id();
        let key = request.queue_key();
        let ids = table.queue(&key);

        if let Some(pending) = table.wait_lock(txn) {
            let e = &table.entries[pending];
            if e.key == key && e.mode == request.mode && e.covers(request) {
                return Ok(LockStatus::WaitLock);
            }
            return Err(SmallError::new(
                ErrorKind::WaitLock,
                &format!("{} is still waiting on {}", tx, e),
            ));
        }

        let held = ids.iter().any(|&id| {
            let e = &table.entries[id];
            e.txn == txn && !e.waiting && e.mode.covers(request.mode) && e.covers(request)
        });
        if held {
            return Ok(LockStatus::Success);
        }

        let conflict = ids
            .iter()
            .any(|&id| table.entries[id].conflicts_with_request(txn, request));

        if !conflict {
            let own = ids.iter().copied().find(|&id| {
                let e = &table.entries[id];
                e.txn == txn && !e.waiting && e.mode == request.mode
            });
            match own {
                Some(id) => {
                    if let QueueKey::Page(_) = key {
                        set_bit(
                            &mut table.entries[id].bits,
                            request.record_index,
                            request.record_count,
                        );
                    }
                }
                None => {
                    table.insert(LockEntry::for_request(txn, request));
                }
            }
            return Ok(LockStatus::Success);
        }

        let mut entry = LockEntry::for_request(txn, request);
        entry.waiting = true;
        let id = table.insert(entry);
        table.set_waiting(txn, id);

        if table.detect_deadlock(id) {
            warn!("deadlock detected, {} gives up {:?}", tx, request);
            table.remove(id);
            tx.set_state(TransactionState::Running);
            // the cancelled request may have been the only thing
            // blocking a later waiter
            table.wake(&key);
            return Ok(LockStatus::DeadLock);
        }

        debug!("{} waits for {:?}", tx, request);
        Ok(LockStatus::WaitLock)
    }

    /// Block until a queued request of `tx` is granted (or dropped
    /// because its record vanished).
    pub fn wait(&self, tx: &Transaction) {
        if tx.state() == TransactionState::Waiting {
            debug!("{} blocks", tx);
            tx.wait_signal();
        }
    }

    /// `lock` then `wait` until granted. A deadlock surfaces as an
    /// error of kind `DeadLock`.
    pub fn lock_blocking(&self, tx: &Arc<Transaction>, request: &LockRequest) -> SmallResult {
        loop {
            match self.lock(tx, request)? {
                LockStatus::Success => return Ok(()),
                LockStatus::WaitLock => self.wait(tx),
                LockStatus::DeadLock => {
                    return Err(SmallError::deadlock(&format!(
                        "{} deadlocked on {:?}",
                        tx, request
                    )))
                }
            }
        }
    }

    /// Drop one record bit (or the table lock) held by `tx`, then wake
    /// whoever was waiting on it.
    pub fn unlock(&self, tx: &Transaction, request: &LockRequest) {
        let mut table = self.table.lock();
        let txn = tx.get_id();
        let key = request.queue_key();

        for id in table.queue(&key) {
            let e = &mut table.entries[id];
            if e.txn != txn || e.waiting || e.mode != request.mode {
                continue;
            }
            match key {
                QueueKey::Table(_) => table.remove(id),
                QueueKey::Page(_) => {
                    clear_bit(&mut e.bits, request.record_index);
                    if e.is_empty() {
                        table.remove(id);
                    }
                }
            }
        }
        table.wake(&key);
    }

    /// Drop every lock of the transaction, granted or queued, and forget
    /// about it.
    pub fn release_all(&self, tx: &Transaction) {
        let mut table = self.table.lock();
        let txn = tx.get_id();

        let mut keys = HashSet::new();
        for id in table.txn_entries(txn) {
            keys.insert(table.entries[id].key);
            table.remove(id);
        }
        table.txns.remove(&txn);
        tx.set_state(TransactionState::Running);

        for key in keys {
            table.wake(&key);
        }
        debug!("{} released all locks", tx);
    }

    /// Records at and above `split_index` of `from` moved to the start
    /// of `to`: move their bits along.
    pub fn split_page(&self, from: &PagePosition, to: &PagePosition, split_index: usize) {
        let mut table = self.table.lock();
        for id in table.queue(&QueueKey::Page(*from)) {
            let moved = split_bits(&mut table.entries[id].bits, split_index);
            if moved.none() {
                if table.entries[id].is_empty() {
                    table.remove(id);
                }
                continue;
            }

            let (txn, mode, waiting) = {
                let e = &table.entries[id];
                (e.txn, e.mode, e.waiting)
            };
            let mut entry = LockEntry::new(txn, QueueKey::Page(*to), mode, moved);
            entry.waiting = waiting;
            let new_id = table.insert(entry);

            if table.entries[id].is_empty() {
                let was_wait_lock = table.wait_lock(txn) == Some(id);
                table.remove(id);
                if was_wait_lock {
                    if let Some(slot) = table.txns.get_mut(&txn) {
                        slot.wait_lock = Some(new_id);
                    }
                }
            }
        }
        debug!("split locks {} -> {} at {}", from, to, split_index);
    }

    /// Records of `from` were appended to `to` starting at slot
    /// `offset`: fold the bits of `from` into `to`.
    pub fn merge_pages(&self, from: &PagePosition, to: &PagePosition, offset: usize) {
        let mut table = self.table.lock();
        let to_key = QueueKey::Page(*to);

        for id in table.queue(&QueueKey::Page(*from)) {
            let (txn, mode, waiting, bits) = {
                let e = &table.entries[id];
                (e.txn, e.mode, e.waiting, e.bits.clone())
            };
            let was_wait_lock = table.wait_lock(txn) == Some(id);

            let target = if waiting {
                None
            } else {
                table.queue(&to_key).into_iter().find(|&t| {
                    let e = &table.entries[t];
                    e.txn == txn && e.mode == mode && !e.waiting
                })
            };

            table.remove(id);
            match target {
                Some(t) => or_shifted(&mut table.entries[t].bits, &bits, offset),
                None => {
                    let mut shifted = bit_vec::BitVec::new();
                    or_shifted(&mut shifted, &bits, offset);
                    let mut entry = LockEntry::new(txn, to_key, mode, shifted);
                    entry.waiting = waiting;
                    let new_id = table.insert(entry);
                    if was_wait_lock {
                        if let Some(slot) = table.txns.get_mut(&txn) {
                            slot.wait_lock = Some(new_id);
                        }
                    }
                }
            }
        }
        table.wake(&to_key);
        debug!("merge locks {} -> {} at {}", from, to, offset);
    }

    /// A record slot was inserted at `index` of the page.
    pub fn on_record_inserted(&self, page: &PagePosition, index: usize) {
        let mut table = self.table.lock();
        for id in table.queue(&QueueKey::Page(*page)) {
            insert_bit(&mut table.entries[id].bits, index);
        }
    }

    /// The record slot at `index` of the page was removed. Entries left
    /// without bits are dropped, a waiter whose record vanished is woken
    /// up to retry.
    pub fn on_record_removed(&self, page: &PagePosition, index: usize) {
        let mut table = self.table.lock();
        let key = QueueKey::Page(*page);
        for id in table.queue(&key) {
            remove_bit(&mut table.entries[id].bits, index);
            if !table.entries[id].is_empty() {
                continue;
            }

            let txn = table.entries[id].txn;
            let was_wait_lock = table.entries[id].waiting && table.wait_lock(txn) == Some(id);
            table.remove(id);
            if was_wait_lock {
                table.resume(txn);
            }
        }
        table.wake(&key);
    }

    /// Whether `tx` holds a granted lock at least as strong as the
    /// request.
    pub fn holds(&self, tx: &Transaction, request: &LockRequest) -> bool {
        let table = self.table.lock();
        let txn = tx.get_id();
        table.queue(&request.queue_key()).into_iter().any(|id| {
            let e = &table.entries[id];
            e.txn == txn && !e.waiting && e.mode.covers(request.mode) && e.covers(request)
        })
    }

    /// `None` for a transaction without locks.
    pub fn transaction_state(&self, txn: TransactionId) -> Option<TransactionState> {
        let table = self.table.lock();
        table.txns.get(&txn).map(|slot| {
            if slot.wait_lock.is_some() {
                TransactionState::Waiting
            } else {
                TransactionState::Running
            }
        })
    }

    /// Number of live lock entries.
    pub fn entries_count(&self) -> usize {
        self.table.lock().live_count()
    }

    pub fn queues_count(&self) -> usize {
        self.table.lock().queues_count()
    }
}

impl fmt::Display for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.table.lock())
    }
}
