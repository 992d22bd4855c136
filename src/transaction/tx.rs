use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::types::TransactionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Running,
    /// Blocked on a lock request, see `LockManager::wait`.
    Waiting,
}

/// A user transaction, as seen by the lock manager.
///
/// The authoritative lock state lives in the lock table; `state` mirrors
/// it so it can be read without taking the lock table mutex.
pub struct Transaction {
    // increase monotonically by 1
    id: TransactionId,

    state: AtomicU8,

    signaled: Mutex<bool>,
    cond: Condvar,
}

impl Transaction {
    pub(crate) fn new(id: TransactionId) -> Self {
        Self {
            id,
            state: AtomicU8::new(0),
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn get_id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        match self.state.load(Ordering::Acquire) {
            0 => TransactionState::Running,
            _ => TransactionState::Waiting,
        }
    }

    pub(crate) fn set_state(&self, state: TransactionState) {
        let v = match state {
            TransactionState::Running => 0,
            TransactionState::Waiting => 1,
        };
        self.state.store(v, Ordering::Release);
    }

    pub(crate) fn reset_signal(&self) {
        *self.signaled.lock() = false;
    }

    /// Wake the thread blocked in `wait_signal`, or let its next call
    /// return immediately.
    pub(crate) fn signal(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.cond.notify_all();
    }

    pub fn is_signaled(&self) -> bool {
        *self.signaled.lock()
    }

    /// Block until the transaction is signaled.
    pub fn wait_signal(&self) {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            self.cond.wait(&mut signaled);
        }
    }
}

impl std::hash::Hash for Transaction {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Transaction {}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "tx_{}", self.id)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}({:?})", self, self.state())
    }
}
