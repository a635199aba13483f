//! Cache module - LRU tracking of decompressed blocks

pub mod block_cache;

pub use block_cache::{BlockCache, CacheStats};
