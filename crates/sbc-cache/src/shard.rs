//! Shard metadata: the lock partitions of the slot pool.

use sbc_types::{BlockAddr, SlotIndex, Stamp};

/// Metadata for one slot currently resident in a shard.
///
/// Guarded by the owning shard's lock. A record belongs to exactly one
/// shard at any instant; eviction moves the record from the donor shard to
/// the new identity's home shard.
#[derive(Debug, Clone)]
pub(crate) struct SlotMeta {
    pub slot: SlotIndex,
    /// Assigned identity, or `None` for a slot never assigned since init.
    pub addr: Option<BlockAddr>,
    pub refcount: u32,
    /// Meaningful only while `refcount == 0`.
    pub released_at: Stamp,
}

impl SlotMeta {
    pub fn unused(slot: SlotIndex) -> Self {
        Self {
            slot,
            addr: None,
            refcount: 0,
            released_at: Stamp::NEVER,
        }
    }
}

/// One lock partition of the pool.
///
/// The shard lock is short-hold: it guards only these records and is never
/// held across device I/O or a blocking content-lock acquisition.
#[derive(Debug, Default)]
pub(crate) struct Shard {
    pub members: Vec<SlotMeta>,
}

impl Shard {
    /// Position of the member caching `addr`, if resident.
    pub fn find(&self, addr: BlockAddr) -> Option<usize> {
        self.members.iter().position(|m| m.addr == Some(addr))
    }

    /// Position of the member using slot `slot`.
    pub fn find_slot(&self, slot: SlotIndex) -> Option<usize> {
        self.members.iter().position(|m| m.slot == slot)
    }

    /// Best local eviction candidate: unreferenced with the smallest
    /// `(released_at, slot)`. Slot index breaks stamp ties so candidate
    /// selection is deterministic regardless of membership order.
    pub fn lru_candidate(&self) -> Option<(usize, Stamp)> {
        self.members
            .iter()
            .enumerate()
            .filter(|(_, m)| m.refcount == 0)
            .min_by_key(|(_, m)| (m.released_at, m.slot))
            .map(|(pos, m)| (pos, m.released_at))
    }

    /// Remove and return the member at `pos`. Membership order carries no
    /// meaning, so the cheaper swap removal is fine.
    pub fn remove(&mut self, pos: usize) -> SlotMeta {
        self.members.swap_remove(pos)
    }
}
