pub mod bitfield;
pub mod constants;
pub mod stack;
pub mod utils;
pub mod virtual_memory;

pub use utils::{formatted_size, FormattedSize};
