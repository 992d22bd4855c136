use crate::error::SmallError;

pub type SmallResult<T = ()> = Result<T, SmallError>;

/// Log sequence number.
pub type Lsn = i64;

pub type TransactionId = u64;

/// Sentinel page number meaning "no page" in sibling links.
pub const NO_PAGE: i64 = -1;
