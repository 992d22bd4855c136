use std::{collections::HashMap, fmt, sync::Arc};

use bit_vec::BitVec;
use itertools::Itertools;
use log::debug;

use super::entry::{LockEntry, QueueKey};
use crate::{
    transaction::{Transaction, TransactionState},
    types::TransactionId,
};

#[derive(Debug, Default, Clone, Copy)]
struct LockQueue {
    head: Option<usize>,
    tail: Option<usize>,
}

pub(crate) struct TxnSlot {
    pub(crate) tx: Arc<Transaction>,

    // head of the per-transaction entry list
    head: Option<usize>,

    /// The entry the transaction is blocked on.
    pub(crate) wait_lock: Option<usize>,

    /// Equal to the table epoch when visited by the running deadlock
    /// detection.
    pub(crate) dead_epoch: u64,
}

/// Every lock entry plus the queues threading them.
///
/// Only accessed under the lock manager mutex.
#[derive(Default)]
pub(crate) struct LockTable {
    pub(crate) entries: Vec<LockEntry>,
    free: Vec<usize>,
    queues: HashMap<QueueKey, LockQueue>,
    pub(crate) txns: HashMap<TransactionId, TxnSlot>,
    pub(crate) epoch: u64,
}

impl LockTable {
    pub(crate) fn register(&mut self, tx: &Arc<Transaction>) {
        self.txns.entry(tx.get_id()).or_insert_with(|| TxnSlot {
            tx: Arc::clone(tx),
            head: None,
            wait_lock: None,
            dead_epoch: 0,
        });
    }

    /// Add an entry at the tail of its queue and the head of its
    /// transaction list.
    pub(crate) fn insert(&mut self, entry: LockEntry) -> usize {
        let key = entry.key;
        let txn = entry.txn;
        let id = match self.free.pop() {
            Some(id) => {
                self.entries[id] = entry;
                id
            }
            None => {
                self.entries.push(entry);
                self.entries.len() - 1
            }
        };

        let queue = self.queues.entry(key).or_default();
        match queue.tail {
            Some(tail) => {
                self.entries[tail].g_next = Some(id);
                self.entries[id].g_prev = Some(tail);
            }
            None => queue.head = Some(id),
        }
        queue.tail = Some(id);

        if let Some(slot) = self.txns.get_mut(&txn) {
            if let Some(head) = slot.head {
                self.entries[head].t_prev = Some(id);
                self.entries[id].t_next = Some(head);
            }
            slot.head = Some(id);
        }
        id
    }

    fn unlink_queue(&mut self, id: usize) {
        let (key, prev, next) = {
            let e = &self.entries[id];
            (e.key, e.g_prev, e.g_next)
        };
        if let Some(prev) = prev {
            self.entries[prev].g_next = next;
        }
        if let Some(next) = next {
            self.entries[next].g_prev = prev;
        }

        let mut empty = false;
        if let Some(queue) = self.queues.get_mut(&key) {
            if queue.head == Some(id) {
                queue.head = next;
            }
            if queue.tail == Some(id) {
                queue.tail = prev;
            }
            empty = queue.head.is_none();
        }
        if empty {
            self.queues.remove(&key);
        }
    }

    fn unlink_txn(&mut self, id: usize) {
        let (txn, prev, next) = {
            let e = &self.entries[id];
            (e.txn, e.t_prev, e.t_next)
        };
        if let Some(prev) = prev {
            self.entries[prev].t_next = next;
        }
        if let Some(next) = next {
            self.entries[next].t_prev = prev;
        }
        if let Some(slot) = self.txns.get_mut(&txn) {
            if slot.head == Some(id) {
                slot.head = next;
            }
            if slot.wait_lock == Some(id) {
                slot.wait_lock = None;
            }
        }
    }

    /// Unlink an entry from both lists and recycle its slot.
    pub(crate) fn remove(&mut self, id: usize) {
        self.unlink_queue(id);
        self.unlink_txn(id);

        let e = &mut self.entries[id];
        e.live = false;
        e.waiting = false;
        e.bits = BitVec::new();
        e.g_prev = None;
        e.g_next = None;
        e.t_prev = None;
        e.t_next = None;
        self.free.push(id);
    }

    /// Entries of one queue, in arrival order.
    pub(crate) fn queue(&self, key: &QueueKey) -> Vec<usize> {
        let mut ids = Vec::new();
        let mut cursor = self.queues.get(key).and_then(|q| q.head);
        while let Some(id) = cursor {
            ids.push(id);
            cursor = self.entries[id].g_next;
        }
        ids
    }

    /// Entries queued before `id`, nearest first.
    pub(crate) fn ahead_of(&self, id: usize) -> Vec<usize> {
        let mut ids = Vec::new();
        let mut cursor = self.entries[id].g_prev;
        while let Some(prev) = cursor {
            ids.push(prev);
            cursor = self.entries[prev].g_prev;
        }
        ids
    }

    /// Entries of one transaction, most recent first.
    pub(crate) fn txn_entries(&self, txn: TransactionId) -> Vec<usize> {
        let mut ids = Vec::new();
        let mut cursor = self.txns.get(&txn).and_then(|s| s.head);
        while let Some(id) = cursor {
            ids.push(id);
            cursor = self.entries[id].t_next;
        }
        ids
    }

    pub(crate) fn wait_lock(&self, txn: TransactionId) -> Option<usize> {
        self.txns.get(&txn).and_then(|s| s.wait_lock)
    }

    pub(crate) fn set_waiting(&mut self, txn: TransactionId, id: usize) {
        if let Some(slot) = self.txns.get_mut(&txn) {
            slot.wait_lock = Some(id);
            slot.tx.reset_signal();
            slot.tx.set_state(TransactionState::Waiting);
        }
    }

    /// Move a transaction back to running and signal it.
    pub(crate) fn resume(&mut self, txn: TransactionId) {
        if let Some(slot) = self.txns.get_mut(&txn) {
            slot.wait_lock = None;
            slot.tx.set_state(TransactionState::Running);
            slot.tx.signal();
            debug!("wake up {}", slot.tx);
        }
    }

    /// Grant every waiting entry of the queue that no longer conflicts
    /// with a granted entry ahead of it. Entries are visited in arrival
    /// order, a waiter behind a still-blocked one may be granted first.
    pub(crate) fn wake(&mut self, key: &QueueKey) {
        let ids = self.queue(key);
        for (pos, &id) in ids.iter().enumerate() {
            if !self.entries[id].waiting {
                continue;
            }
            let blocked = ids[..pos].iter().any(|&other| {
                let o = &self.entries[other];
                !o.waiting && o.conflicts_with(&self.entries[id])
            });
            if blocked {
                continue;
            }

            self.entries[id].waiting = false;
            let txn = self.entries[id].txn;
            if self.wait_lock(txn) == Some(id) {
                self.resume(txn);
            }
        }
    }

    pub(crate) fn queues_count(&self) -> usize {
        self.queues.len()
    }

    pub(crate) fn live_count(&self) -> usize {
        self.entries.iter().filter(|e| e.live).count()
    }
}

impl fmt::Display for LockTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let keys = self
            .queues
            .keys()
            .sorted_by_key(|k| format!("{}", k))
            .collect::<Vec<_>>();
        for key in keys {
            let entries = self
                .queue(key)
                .into_iter()
                .map(|id| format!("{}", self.entries[id]))
                .join(", ");
            writeln!(f, "{}: [{}]", key, entries)?;
        }
        Ok(())
    }
}
