use std::{error::Error, fmt, io};

use backtrace::Backtrace;
use log::error;

/// The category of a `SmallError`.
///
/// `Full` and `NotFound` are handled inside the tree algorithms and
/// never escape a successful call. `WaitLock` and `DeadLock` are
/// surfaced so the caller can tell "must block" from "must abort".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Offsets inside a page point outside of it. The page must not be
    /// interpreted any further.
    StructuralCorruption,
    NotFound,
    Full,
    WaitLock,
    DeadLock,
    Duplicate,
    RecordTooLarge,
    /// Misuse of a page latch, e.g. writing through a read latch.
    Latch,
    Io,
}

#[derive(Debug, Clone)]
pub struct SmallError {
    kind: ErrorKind,
    details: String,
}

impl SmallError {
    pub fn new(kind: ErrorKind, msg: &str) -> SmallError {
        SmallError {
            kind,
            details: msg.to_string(),
        }
    }

    pub fn corruption(msg: &str) -> SmallError {
        Self::new(ErrorKind::StructuralCorruption, msg)
    }

    pub fn not_found(msg: &str) -> SmallError {
        Self::new(ErrorKind::NotFound, msg)
    }

    pub fn full(msg: &str) -> SmallError {
        Self::new(ErrorKind::Full, msg)
    }

    pub fn deadlock(msg: &str) -> SmallError {
        Self::new(ErrorKind::DeadLock, msg)
    }

    pub fn latch(msg: &str) -> SmallError {
        Self::new(ErrorKind::Latch, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn details(&self) -> &str {
        &self.details
    }

    pub fn is_deadlock(&self) -> bool {
        self.kind == ErrorKind::DeadLock
    }

    pub fn show_backtrace(&self) {
        let bt = Backtrace::new();
        error!("{}, backtrace: {:?}", self, bt);
    }
}

impl fmt::Display for SmallError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.details)
    }
}

impl Error for SmallError {}

impl From<io::Error> for SmallError {
    fn from(e: io::Error) -> Self {
        SmallError::new(ErrorKind::Io, &e.to_string())
    }
}
