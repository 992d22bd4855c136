mod low_level;
mod tx;

pub use low_level::*;
pub use tx::*;
