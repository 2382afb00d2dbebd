//! The fixed slot arena: pre-allocated buffers and their exclusive locks.

use parking_lot::Mutex;
use sbc_types::{BlockAddr, BLOCK_SIZE};

/// Contents of one buffer slot, guarded by the slot's exclusive lock.
#[derive(Debug)]
pub(crate) struct SlotContent {
    /// Copy of the assigned identity for flush paths that hold only this
    /// lock. The authoritative identity lives in the shard metadata; both
    /// are written together at assignment time.
    pub addr: Option<BlockAddr>,
    /// Bytes reflect on-device content.
    pub valid: bool,
    /// Bytes modified since the last fill or flush.
    pub dirty: bool,
    pub bytes: Box<[u8; BLOCK_SIZE]>,
}

/// One pre-allocated buffer slot.
///
/// Slots are allocated once at cache construction and recycled forever;
/// eviction reassigns identity, it never frees memory.
#[derive(Debug)]
pub(crate) struct Slot {
    /// Exclusive content lock: blocking, may be held across device I/O.
    pub content: Mutex<SlotContent>,
}

impl Slot {
    pub fn new() -> Self {
        Self {
            content: Mutex::new(SlotContent {
                addr: None,
                valid: false,
                dirty: false,
                bytes: Box::new([0_u8; BLOCK_SIZE]),
            }),
        }
    }
}
