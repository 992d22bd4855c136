use std::fmt;

use bit_vec::BitVec;

use crate::{storage::PagePosition, types::TransactionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    /// Whether holding `self` makes a request for `other` redundant.
    pub fn covers(&self, other: LockMode) -> bool {
        *self == LockMode::Exclusive || other == LockMode::Shared
    }

    fn compatible(&self, other: LockMode) -> bool {
        *self == LockMode::Shared && other == LockMode::Shared
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LockMode::Shared => write!(f, "S"),
            LockMode::Exclusive => write!(f, "X"),
        }
    }
}

/// Granularity of a lock. Table locks and document (record) locks live
/// in separate queues and never conflict with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    Table,
    Document,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    Success,
    /// The request is queued, the caller has to `wait` before retrying.
    WaitLock,
    /// Waiting would close a cycle. Nothing was queued.
    DeadLock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRequest {
    /// The table or index the page belongs to.
    pub object_id: i32,
    pub page: PagePosition,
    pub record_index: usize,

    /// Number of records on the page, used to size a new bitmap.
    pub record_count: usize,

    pub mode: LockMode,
    pub kind: LockKind,
}

impl LockRequest {
    pub fn document(
        object_id: i32,
        page: PagePosition,
        record_index: usize,
        record_count: usize,
        mode: LockMode,
    ) -> Self {
        Self {
            object_id,
            page,
            record_index,
            record_count,
            mode,
            kind: LockKind::Document,
        }
    }

    pub fn table(object_id: i32, mode: LockMode) -> Self {
        Self {
            object_id,
            page: PagePosition::new(object_id, -1),
            record_index: 0,
            record_count: 0,
            mode,
            kind: LockKind::Table,
        }
    }

    pub(crate) fn queue_key(&self) -> QueueKey {
        match self.kind {
            LockKind::Table => QueueKey::Table(self.object_id),
            LockKind::Document => QueueKey::Page(self.page),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum QueueKey {
    Table(i32),
    Page(PagePosition),
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            QueueKey::Table(id) => write!(f, "table({})", id),
            QueueKey::Page(pos) => write!(f, "{}", pos),
        }
    }
}

/// One transaction's held or requested lock on a table or on records
/// of one page.
///
/// Entries live in a slab inside the lock table. `g_prev`/`g_next` link
/// the entry into the queue of its page (or table) in arrival order,
/// `t_prev`/`t_next` into the list of its transaction.
#[derive(Debug)]
pub(crate) struct LockEntry {
    pub(crate) live: bool,
    pub(crate) txn: TransactionId,
    pub(crate) key: QueueKey,
    pub(crate) mode: LockMode,
    pub(crate) waiting: bool,

    // one bit per record slot, empty for table locks
    pub(crate) bits: BitVec,

    pub(crate) g_prev: Option<usize>,
    pub(crate) g_next: Option<usize>,
    pub(crate) t_prev: Option<usize>,
    pub(crate) t_next: Option<usize>,
}

impl LockEntry {
    pub(crate) fn new(txn: TransactionId, key: QueueKey, mode: LockMode, bits: BitVec) -> Self {
        Self {
            live: true,
            txn,
            key,
            mode,
            waiting: false,
            bits,
            g_prev: None,
            g_next: None,
            t_prev: None,
            t_next: None,
        }
    }

    pub(crate) fn for_request(txn: TransactionId, request: &LockRequest) -> Self {
        let mut bits = BitVec::new();
        if request.kind == LockKind::Document {
            set_bit(&mut bits, request.record_index, request.record_count);
        }
        Self::new(txn, request.queue_key(), request.mode, bits)
    }

    fn is_table(&self) -> bool {
        matches!(self.key, QueueKey::Table(_))
    }

    /// Whether the entry names the record of `request`.
    pub(crate) fn covers(&self, request: &LockRequest) -> bool {
        self.is_table() || get_bit(&self.bits, request.record_index)
    }

    /// Whether the entry, owned by another transaction, stands in the
    /// way of `request`.
    pub(crate) fn conflicts_with_request(&self, txn: TransactionId, request: &LockRequest) -> bool {
        self.txn != txn && !self.mode.compatible(request.mode) && self.covers(request)
    }

    pub(crate) fn conflicts_with(&self, other: &LockEntry) -> bool {
        self.txn != other.txn
            && !self.mode.compatible(other.mode)
            && (self.is_table() || intersects(&self.bits, &other.bits))
    }

    pub(crate) fn is_empty(&self) -> bool {
        !self.is_table() && self.bits.none()
    }
}

impl fmt::Display for LockEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let bits: String = self.bits.iter().map(|b| if b { '1' } else { '0' }).collect();
        write!(
            f,
            "tx_{} {}{} {}",
            self.txn,
            self.mode,
            if self.waiting { " waiting" } else { "" },
            bits
        )
    }
}

pub(crate) fn get_bit(bits: &BitVec, index: usize) -> bool {
    bits.get(index).unwrap_or(false)
}

/// Set `index`, growing the bitmap to at least `capacity` bits.
pub(crate) fn set_bit(bits: &mut BitVec, index: usize, capacity: usize) {
    let len = capacity.max(index + 1);
    if bits.len() < len {
        let extra = len - bits.len();
        bits.grow(extra, false);
    }
    bits.set(index, true);
}

pub(crate) fn clear_bit(bits: &mut BitVec, index: usize) {
    if index < bits.len() {
        bits.set(index, false);
    }
}

pub(crate) fn intersects(a: &BitVec, b: &BitVec) -> bool {
    a.iter().zip(b.iter()).any(|(x, y)| x && y)
}

/// A record slot was inserted at `index`, bits at and above it move up.
pub(crate) fn insert_bit(bits: &mut BitVec, index: usize) {
    if index >= bits.len() {
        return;
    }
    bits.push(false);
    for i in (index + 1..bits.len()).rev() {
        let v = get_bit(bits, i - 1);
        bits.set(i, v);
    }
    bits.set(index, false);
}

/// The record slot at `index` was removed, bits above it move down.
pub(crate) fn remove_bit(bits: &mut BitVec, index: usize) {
    if index >= bits.len() {
        return;
    }
    for i in index..bits.len() - 1 {
        let v = get_bit(bits, i + 1);
        bits.set(i, v);
    }
    bits.pop();
}

/// Move the bits at and above `at` out of `bits`, renumbered from 0.
pub(crate) fn split_bits(bits: &mut BitVec, at: usize) -> BitVec {
    if at >= bits.len() {
        return BitVec::new();
    }
    let moved: BitVec = bits.iter().skip(at).collect();
    bits.truncate(at);
    moved
}

/// OR `src` into `dst`, bit `i` of `src` landing on `i + offset`.
///
/// `BitVec::or` only works on equal lengths, so the bits are copied one
/// by one.
pub(crate) fn or_shifted(dst: &mut BitVec, src: &BitVec, offset: usize) {
    for (i, bit) in src.iter().enumerate() {
        if bit {
            set_bit(dst, i + offset, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(bits: &BitVec) -> String {
        bits.iter().map(|b| if b { '1' } else { '0' }).collect()
    }

    fn parse(s: &str) -> BitVec {
        s.chars().map(|c| c == '1').collect()
    }

    #[test]
    fn test_insert_and_remove_shift() {
        let mut bits = parse("1011");
        insert_bit(&mut bits, 1);
        assert_eq!(render(&bits), "10011");

        remove_bit(&mut bits, 0);
        assert_eq!(render(&bits), "0011");

        // beyond the end nothing moves
        insert_bit(&mut bits, 10);
        remove_bit(&mut bits, 10);
        assert_eq!(render(&bits), "0011");
    }

    #[test]
    fn test_split_and_merge() {
        let mut bits = parse("110101");
        let moved = split_bits(&mut bits, 3);
        assert_eq!(render(&bits), "110");
        assert_eq!(render(&moved), "101");

        or_shifted(&mut bits, &moved, 3);
        assert_eq!(render(&bits), "110101");

        let mut short = parse("1");
        or_shifted(&mut short, &parse("01"), 4);
        assert_eq!(render(&short), "100001");
    }

    #[test]
    fn test_conflicts() {
        let pos = PagePosition::new(1, 3);
        let shared = LockRequest::document(1, pos, 2, 4, LockMode::Shared);
        let exclusive = LockRequest::document(1, pos, 2, 4, LockMode::Exclusive);

        let held = LockEntry::for_request(1, &shared);
        assert!(!held.conflicts_with_request(2, &shared));
        assert!(held.conflicts_with_request(2, &exclusive));
        assert!(!held.conflicts_with_request(1, &exclusive));

        let other_record = LockRequest::document(1, pos, 3, 4, LockMode::Exclusive);
        assert!(!held.conflicts_with_request(2, &other_record));
    }
}
