mod entry;
mod latch;
mod lru;
mod pool;

pub use entry::*;
pub use latch::*;
pub use pool::*;
