mod page;
mod page_position;
mod store;

pub use page::*;
pub use page_position::*;
pub use store::*;
