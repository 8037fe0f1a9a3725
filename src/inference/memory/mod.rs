pub mod block_table;

pub use block_table::BlockTable;

/// Physical page index into the paged KV cache
pub type BlockId = u32;
