pub mod btree;
pub mod buffer;
pub mod config;
pub mod engine;
pub mod lock;
pub mod storage;
pub mod transaction;
pub mod tx_log;
pub mod types;
pub mod utils;

mod error;

pub use btree::{FixedSizeTree, Tree, TreeKind, TreeRoot};
pub use config::{BufferPoolConfig, EngineConfig};
pub use engine::StorageEngine;
pub use error::{ErrorKind, SmallError};
pub use transaction::Transaction;
