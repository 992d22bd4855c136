mod page;
mod tree;

pub use page::*;
pub use tree::*;
