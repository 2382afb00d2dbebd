#![forbid(unsafe_code)]
//! Identifier newtypes and sizing constants shared by the cache crates.

use serde::{Deserialize, Serialize};

/// Size in bytes of one cached block.
///
/// Every buffer slot holds exactly one block; devices and callers exchange
/// whole blocks of this size.
pub const BLOCK_SIZE: usize = 4096;

/// Default number of buffer slots in the pool.
pub const DEFAULT_POOL_SLOTS: usize = 64;

/// Default shard count.
///
/// Prime, so sequentially numbered blocks spread evenly across shards even
/// when callers scan block ranges whose stride shares a factor with the
/// table size.
pub const DEFAULT_SHARD_COUNT: usize = 13;

/// Stable identifier for a registered block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u64);

/// Block number within one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

/// Identity of a cached block: the `(device, block)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockAddr {
    pub device: DeviceId,
    pub block: BlockNumber,
}

impl BlockAddr {
    #[must_use]
    pub fn new(device: DeviceId, block: BlockNumber) -> Self {
        Self { device, block }
    }

    /// Deterministic shard routing for this identity.
    ///
    /// Pure and total: every address maps to exactly one index in
    /// `[0, shard_count)`. The sum keeps sequential block numbers on
    /// distinct shards so per-shard lock hold times stay short under
    /// scan workloads.
    #[must_use]
    pub fn shard_index(self, shard_count: usize) -> usize {
        let count = u64::try_from(shard_count.max(1)).expect("shard_count must fit in u64");
        let rem = self.device.0.wrapping_add(self.block.0) % count;
        usize::try_from(rem).expect("remainder must fit in usize")
    }
}

/// Index of a slot in the fixed arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotIndex(pub u32);

/// Monotonic recency stamp.
///
/// Assigned when a slot's reference count returns to zero; smaller stamps
/// are older and are evicted first. `Stamp(0)` marks a slot that has never
/// been released since initialization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp(pub u64);

impl Stamp {
    pub const NEVER: Self = Self(0);
}
