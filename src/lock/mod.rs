mod deadlock;
mod entry;
mod manager;
mod table;

pub use entry::{LockKind, LockMode, LockRequest, LockStatus};
pub use manager::LockManager;
