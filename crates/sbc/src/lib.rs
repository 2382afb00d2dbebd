#![forbid(unsafe_code)]
//! Public facade for the sharded buffer cache.
//!
//! Re-exports the stable surface from the member crates so downstream
//! consumers depend on one crate.

pub use sbc_block::{BlockDevice, FileBlockDevice, MemBlockDevice};
pub use sbc_cache::{BufCache, BufGuard, CacheConfig, CacheStats, PinGuard};
pub use sbc_error::{CacheError, Result};
pub use sbc_types::{
    BlockAddr, BlockNumber, DeviceId, SlotIndex, Stamp, BLOCK_SIZE, DEFAULT_POOL_SLOTS,
    DEFAULT_SHARD_COUNT,
};
