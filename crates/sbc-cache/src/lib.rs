#![forbid(unsafe_code)]
//! Sharded, fixed-capacity buffer cache for block devices.
//!
//! [`BufCache`] owns a pool of block-sized buffer slots, pre-allocated once
//! and recycled forever. Slot metadata (identity, reference count, recency
//! stamp) is partitioned across shards, each guarded by its own short-hold
//! lock, so concurrent callers touching different blocks rarely contend.
//! Each slot additionally carries a blocking exclusive lock that grants one
//! caller at a time access to the block's bytes and may be held across
//! device I/O.
//!
//! The two lock tiers follow different disciplines. Shard locks are never
//! held across device I/O or across a blocking content-lock acquisition;
//! during the eviction scan at most two are held transiently (the best
//! candidate's shard plus the shard under examination), always acquired in
//! ascending index order, which makes concurrent evictions deadlock-free.
//! Content locks are held for as long as the caller keeps its [`BufGuard`].
//!
//! On a miss with no free slot in the pool, [`BufCache::acquire`] reclaims
//! the globally least-recently-released unreferenced slot, relocating its
//! metadata from the donor shard to the new identity's home shard, and
//! re-validates the home shard after the relocation window in case a racing
//! caller inserted the same identity first.
//!
//! # Example
//!
//! ```
//! use sbc_block::MemBlockDevice;
//! use sbc_cache::{BufCache, CacheConfig};
//! use sbc_types::{BlockNumber, DeviceId};
//! use std::sync::Arc;
//!
//! # fn main() -> sbc_error::Result<()> {
//! let cache = BufCache::new(CacheConfig::default())?;
//! cache.register_device(DeviceId(0), Arc::new(MemBlockDevice::new(128)));
//!
//! let mut buf = cache.read_through(DeviceId(0), BlockNumber(5))?;
//! buf.bytes_mut()[0] = 0xA5;
//! buf.flush()?;
//! buf.release();
//! # Ok(())
//! # }
//! ```

mod shard;
mod slot;

use crate::shard::{Shard, SlotMeta};
use crate::slot::{Slot, SlotContent};
use parking_lot::{Mutex, MutexGuard, RwLock};
use sbc_block::BlockDevice;
use sbc_error::{CacheError, Result};
use sbc_types::{
    BlockAddr, BlockNumber, DeviceId, SlotIndex, Stamp, BLOCK_SIZE, DEFAULT_POOL_SLOTS,
    DEFAULT_SHARD_COUNT,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Construction parameters for [`BufCache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Total number of buffer slots in the pool.
    pub pool_slots: usize,
    /// Number of lock partitions. A prime keeps sequential block numbers
    /// spread across shards.
    pub shard_count: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            pool_slots: DEFAULT_POOL_SLOTS,
            shard_count: DEFAULT_SHARD_COUNT,
        }
    }
}

impl CacheConfig {
    fn validate(&self) -> Result<()> {
        if self.pool_slots == 0 {
            return Err(CacheError::InvalidGeometry("pool_slots must be > 0".to_owned()));
        }
        if self.shard_count == 0 {
            return Err(CacheError::InvalidGeometry("shard_count must be > 0".to_owned()));
        }
        if u32::try_from(self.pool_slots).is_err() {
            return Err(CacheError::InvalidGeometry(format!(
                "pool_slots does not fit a slot index: {}",
                self.pool_slots
            )));
        }
        Ok(())
    }
}

/// Point-in-time view of cache activity counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub device_reads: u64,
    pub device_writes: u64,
}

#[derive(Debug, Default)]
struct StatCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    device_reads: AtomicU64,
    device_writes: AtomicU64,
}

impl StatCounters {
    fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            device_reads: self.device_reads.load(Ordering::Relaxed),
            device_writes: self.device_writes.load(Ordering::Relaxed),
        }
    }
}

/// The best eviction candidate found so far during the cross-shard scan.
/// Holding `guard` keeps the candidate from being taken by a racing evictor.
struct Victim<'a> {
    shard_idx: usize,
    guard: MutexGuard<'a, Shard>,
    pos: usize,
    stamp: Stamp,
}

/// Concurrent, fixed-capacity cache of block-sized buffers.
pub struct BufCache {
    slots: Box<[Slot]>,
    shards: Box<[Mutex<Shard>]>,
    devices: RwLock<HashMap<DeviceId, Arc<dyn BlockDevice>>>,
    /// Monotonic recency clock; advanced each time a reference count
    /// returns to zero via release.
    clock: AtomicU64,
    stats: StatCounters,
}

impl std::fmt::Debug for BufCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufCache")
            .field("pool_slots", &self.slots.len())
            .field("shard_count", &self.shards.len())
            .finish_non_exhaustive()
    }
}

impl BufCache {
    /// Create the cache: pre-allocate every slot and shard lock.
    ///
    /// All slots start unused, with no identity, resident in shard 0.
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        info!(
            pool_slots = config.pool_slots,
            shard_count = config.shard_count,
            "buffer cache: initializing"
        );

        let slots: Box<[Slot]> = (0..config.pool_slots).map(|_| Slot::new()).collect();
        let shards: Box<[Mutex<Shard>]> = (0..config.shard_count)
            .map(|_| Mutex::new(Shard::default()))
            .collect();

        {
            let mut shard0 = shards[0].lock();
            for index in 0..config.pool_slots {
                let index = u32::try_from(index).expect("validated against u32::MAX");
                shard0.members.push(SlotMeta::unused(SlotIndex(index)));
            }
        }

        Ok(Self {
            slots,
            shards,
            devices: RwLock::new(HashMap::new()),
            clock: AtomicU64::new(0),
            stats: StatCounters::default(),
        })
    }

    /// Register (or replace) the device backing `id`.
    pub fn register_device(&self, id: DeviceId, device: Arc<dyn BlockDevice>) {
        info!(device = id.0, block_count = device.block_count(), "device registered");
        self.devices.write().insert(id, device);
    }

    /// Total number of buffer slots.
    #[must_use]
    pub fn pool_slots(&self) -> usize {
        self.slots.len()
    }

    /// Number of lock partitions.
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Activity counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    /// Identities currently resident in the cache, across all shards.
    ///
    /// Taken shard by shard, so the view is only quiescent-consistent.
    #[must_use]
    pub fn resident(&self) -> Vec<BlockAddr> {
        let mut out = Vec::new();
        for lock in self.shards.iter() {
            let shard = lock.lock();
            out.extend(shard.members.iter().filter_map(|m| m.addr));
        }
        out
    }

    /// Acquire the buffer caching `(device, block)`, blocking until the
    /// slot's exclusive lock is obtained.
    ///
    /// On a hit this touches only the identity's home shard. On a miss the
    /// globally least-recently-released unreferenced slot is reclaimed and
    /// reassigned; the returned buffer is then invalid (stale bytes) until
    /// filled. Use [`BufCache::read_through`] to fill from the device.
    ///
    /// # Errors
    ///
    /// [`CacheError::Exhausted`] when every slot in the pool is referenced.
    pub fn acquire(&self, device: DeviceId, block: BlockNumber) -> Result<BufGuard<'_>> {
        let addr = BlockAddr::new(device, block);

        // Fast path: resident in its home shard.
        {
            let mut home = self.shard_lock(addr).lock();
            if let Some(pos) = home.find(addr) {
                home.members[pos].refcount += 1;
                let slot = home.members[pos].slot;
                drop(home);
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                trace!(device = device.0, block = block.0, slot = slot.0, "cache_hit");
                return Ok(self.lock_slot(slot, addr));
            }
        }

        // Miss. The home shard's lock is NOT held during the scan, so this
        // request cannot deadlock against a concurrent eviction targeting
        // the same shard.
        let victim = self.find_victim().ok_or(CacheError::Exhausted {
            capacity: self.slots.len(),
        })?;
        let Victim {
            shard_idx: donor_idx,
            guard: mut donor,
            pos,
            ..
        } = victim;
        let meta = donor.remove(pos);
        debug_assert_eq!(meta.refcount, 0);
        drop(donor);

        // Unreferenced and now unlinked: no caller can reach this slot, so
        // the lock is free except for a transient sync pass, which never
        // waits on a shard lock. Uncontended in the common case.
        let content = self.slot(meta.slot).content.lock();

        Ok(self.claim_or_rejoin(meta, content, donor_idx, addr))
    }

    /// Finish a miss after the relocation window: re-validate the home
    /// shard, then either claim the unlinked victim for `addr` or, when a
    /// racing caller published `addr` first, return the victim to its
    /// donor shard.
    fn claim_or_rejoin<'a>(
        &'a self,
        mut meta: SlotMeta,
        mut content: MutexGuard<'a, SlotContent>,
        donor_idx: usize,
        addr: BlockAddr,
    ) -> BufGuard<'a> {
        let slot = meta.slot;
        let evicted = meta.addr;

        // Re-validate: between the donor unlock and the content-lock
        // acquisition no lock was held, so a racing caller may have
        // completed an acquire for `addr`.
        let mut home = self.shard_lock(addr).lock();
        if let Some(existing) = home.find(addr) {
            home.members[existing].refcount += 1;
            let winner = home.members[existing].slot;
            drop(home);
            // The victim's old identity may have been re-cached in another
            // slot during the window, so the victim must not rejoin the
            // donor shard still wearing it. Strip the identity; keep the
            // recency stamp.
            meta.addr = None;
            content.addr = None;
            content.valid = false;
            content.dirty = false;
            drop(content);
            self.shards[donor_idx].lock().members.push(meta);
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            trace!(
                device = addr.device.0,
                block = addr.block.0,
                slot = winner.0,
                "cache_hit_after_relocation_race"
            );
            return self.lock_slot(winner, addr);
        }

        // Claim: assign the new identity and publish into the home shard.
        meta.addr = Some(addr);
        meta.refcount = 1;
        content.addr = Some(addr);
        content.valid = false;
        content.dirty = false;
        home.members.push(meta);
        drop(home);

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        if evicted.is_some() {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
        trace!(
            device = addr.device.0,
            block = addr.block.0,
            slot = slot.0,
            evicted_device = evicted.map(|a| a.device.0),
            evicted_block = evicted.map(|a| a.block.0),
            "cache_miss"
        );
        BufGuard {
            cache: self,
            slot,
            addr,
            content: Some(content),
        }
    }

    /// Acquire and fill from the device if the buffer is not valid.
    ///
    /// The fill runs while the caller holds the slot's exclusive lock, so
    /// concurrent requests for the same block serialize behind it and
    /// observe fully filled bytes.
    ///
    /// # Errors
    ///
    /// [`CacheError::Exhausted`] on pool exhaustion,
    /// [`CacheError::UnknownDevice`] for an unregistered device, or any
    /// device read failure.
    pub fn read_through(&self, device: DeviceId, block: BlockNumber) -> Result<BufGuard<'_>> {
        let mut guard = self.acquire(device, block)?;
        if !guard.is_valid() {
            let dev = self.device(device)?;
            guard.fill_from(dev.as_ref())?;
            self.stats.device_reads.fetch_add(1, Ordering::Relaxed);
            trace!(device = device.0, block = block.0, "fill");
        }
        Ok(guard)
    }

    /// Write through every valid, dirty buffer whose exclusive lock is free.
    ///
    /// Slots currently held by a caller are skipped: the holder is
    /// responsible for flushing its own modifications.
    pub fn sync_all(&self) -> Result<()> {
        let mut flushed = 0_u64;
        for slot in self.slots.iter() {
            let Some(mut content) = slot.content.try_lock() else {
                continue;
            };
            let Some(addr) = content.addr else {
                continue;
            };
            if content.valid && content.dirty {
                let device = self.device(addr.device)?;
                device.write_block(addr.block, &content.bytes[..])?;
                content.dirty = false;
                self.stats.device_writes.fetch_add(1, Ordering::Relaxed);
                flushed += 1;
            }
        }
        debug!(flushed, "sync_all");
        Ok(())
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn device(&self, id: DeviceId) -> Result<Arc<dyn BlockDevice>> {
        self.devices
            .read()
            .get(&id)
            .cloned()
            .ok_or(CacheError::UnknownDevice { device: id.0 })
    }

    fn shard_lock(&self, addr: BlockAddr) -> &Mutex<Shard> {
        &self.shards[addr.shard_index(self.shards.len())]
    }

    fn slot(&self, index: SlotIndex) -> &Slot {
        &self.slots[usize::try_from(index.0).expect("slot index fits in usize")]
    }

    fn next_stamp(&self) -> Stamp {
        // Stamps start at 1; Stamp(0) is reserved for never-released slots.
        Stamp(self.clock.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Block-acquire `slot`'s content lock with no shard lock held.
    fn lock_slot(&self, slot: SlotIndex, addr: BlockAddr) -> BufGuard<'_> {
        let content = self.slot(slot).content.lock();
        BufGuard {
            cache: self,
            slot,
            addr,
            content: Some(content),
        }
    }

    /// Cross-shard LRU scan, ascending shard order.
    ///
    /// Each shard's lock is released before moving on, except the shard
    /// holding the best candidate seen so far; that hold is replaced only
    /// when a strictly older candidate appears later, so stamp ties resolve
    /// to the lowest shard index. At most one shard lock survives the scan.
    fn find_victim(&self) -> Option<Victim<'_>> {
        let mut best: Option<Victim<'_>> = None;
        for (shard_idx, lock) in self.shards.iter().enumerate() {
            let guard = lock.lock();
            match guard.lru_candidate() {
                Some((pos, stamp)) if best.as_ref().map_or(true, |b| stamp < b.stamp) => {
                    // Release the superseded hold before retaining this one.
                    drop(best.take());
                    best = Some(Victim {
                        shard_idx,
                        guard,
                        pos,
                        stamp,
                    });
                }
                _ => drop(guard),
            }
        }
        best
    }

    /// Raise the reference count of a resident slot (pin path).
    fn increment(&self, slot: SlotIndex, addr: BlockAddr) {
        let mut home = self.shard_lock(addr).lock();
        let pos = home
            .find_slot(slot)
            .expect("referenced slot must be resident in its home shard");
        home.members[pos].refcount += 1;
    }

    /// Drop one reference. `stamp_on_zero` distinguishes release (which
    /// marks the slot most-recently-used among unused slots) from unpin
    /// (which does not touch recency).
    fn decrement(&self, slot: SlotIndex, addr: BlockAddr, stamp_on_zero: bool) {
        let mut home = self.shard_lock(addr).lock();
        let pos = home
            .find_slot(slot)
            .expect("referenced slot must be resident in its home shard");
        let meta = &mut home.members[pos];
        meta.refcount = meta
            .refcount
            .checked_sub(1)
            .expect("reference count underflow");
        if meta.refcount == 0 && stamp_on_zero {
            meta.released_at = self.next_stamp();
        }
    }
}

/// Exclusively locked handle to one cached block.
///
/// Holding the guard is the proof of exclusive-lock ownership: byte access
/// and [`flush`](BufGuard::flush) exist only here, and the release
/// bookkeeping runs exactly once when the guard is consumed or dropped.
#[must_use = "dropping the guard releases the buffer"]
#[derive(Debug)]
pub struct BufGuard<'a> {
    cache: &'a BufCache,
    slot: SlotIndex,
    addr: BlockAddr,
    /// `Some` for the guard's whole lifetime; taken once, in `drop`.
    content: Option<MutexGuard<'a, SlotContent>>,
}

impl<'a> BufGuard<'a> {
    fn content(&self) -> &SlotContent {
        self.content
            .as_ref()
            .expect("content lock held for the guard's lifetime")
    }

    fn content_mut(&mut self) -> &mut SlotContent {
        self.content
            .as_mut()
            .expect("content lock held for the guard's lifetime")
    }

    #[must_use]
    pub fn device(&self) -> DeviceId {
        self.addr.device
    }

    #[must_use]
    pub fn block(&self) -> BlockNumber {
        self.addr.block
    }

    /// Whether the bytes reflect on-device content.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.content().valid
    }

    /// Whether the bytes were modified since the last fill or flush.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.content().dirty
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8; BLOCK_SIZE] {
        &self.content().bytes
    }

    /// Mutable byte access; marks the buffer dirty.
    pub fn bytes_mut(&mut self) -> &mut [u8; BLOCK_SIZE] {
        let content = self.content_mut();
        content.dirty = true;
        &mut content.bytes
    }

    /// Write the buffer through to its device.
    ///
    /// Leaves `valid` untouched and keeps the lock held; clears `dirty`.
    ///
    /// # Errors
    ///
    /// [`CacheError::UnknownDevice`] or any device write failure.
    pub fn flush(&mut self) -> Result<()> {
        let device = self.cache.device(self.addr.device)?;
        let block = self.addr.block;
        let content = self.content_mut();
        device.write_block(block, &content.bytes[..])?;
        content.dirty = false;
        self.cache.stats.device_writes.fetch_add(1, Ordering::Relaxed);
        trace!(
            device = self.addr.device.0,
            block = self.addr.block.0,
            "flush"
        );
        Ok(())
    }

    /// Keep the slot's reference count elevated past this guard's lifetime
    /// without holding the exclusive lock.
    #[must_use]
    pub fn pin(&self) -> PinGuard<'a> {
        self.cache.increment(self.slot, self.addr);
        trace!(
            device = self.addr.device.0,
            block = self.addr.block.0,
            "pin"
        );
        PinGuard {
            cache: self.cache,
            slot: self.slot,
            addr: self.addr,
        }
    }

    /// Consume the guard: release the exclusive lock, then drop the
    /// caller's reference.
    ///
    /// Dropping the guard has the same effect; `release` exists to make the
    /// hand-back explicit at call sites. Because it consumes the guard,
    /// using the buffer after release is rejected at compile time:
    ///
    /// ```compile_fail
    /// use sbc_block::MemBlockDevice;
    /// use sbc_cache::{BufCache, CacheConfig};
    /// use sbc_types::{BlockNumber, DeviceId};
    /// use std::sync::Arc;
    ///
    /// let cache = BufCache::new(CacheConfig::default()).unwrap();
    /// cache.register_device(DeviceId(0), Arc::new(MemBlockDevice::new(8)));
    /// let mut buf = cache.read_through(DeviceId(0), BlockNumber(1)).unwrap();
    /// buf.release();
    /// buf.flush().unwrap(); // use after release
    /// ```
    pub fn release(self) {}

    fn fill_from(&mut self, device: &dyn BlockDevice) -> Result<()> {
        let block = self.addr.block;
        let content = self.content_mut();
        device.read_block(block, &mut content.bytes[..])?;
        content.valid = true;
        content.dirty = false;
        Ok(())
    }
}

impl Drop for BufGuard<'_> {
    fn drop(&mut self) {
        // Release the exclusive lock before the refcount bookkeeping; the
        // next blocked acquirer already holds its own reference.
        drop(self.content.take());
        self.cache.decrement(self.slot, self.addr, true);
    }
}

/// Reference-count hold on a slot, independent of the exclusive lock.
///
/// While alive, the slot can neither be evicted nor reassigned. Metadata
/// only: creating or dropping a pin touches the owning shard's lock and
/// nothing else.
#[must_use = "dropping the pin makes the slot evictable again"]
#[derive(Debug)]
pub struct PinGuard<'a> {
    cache: &'a BufCache,
    slot: SlotIndex,
    addr: BlockAddr,
}

impl PinGuard<'_> {
    #[must_use]
    pub fn device(&self) -> DeviceId {
        self.addr.device
    }

    #[must_use]
    pub fn block(&self) -> BlockNumber {
        self.addr.block
    }

    /// Consume the pin, dropping its reference. Equivalent to `drop`.
    pub fn unpin(self) {}
}

impl Drop for PinGuard<'_> {
    fn drop(&mut self) {
        // Unpin adjusts the reference count only; recency is stamped by
        // release, not here.
        self.cache.decrement(self.slot, self.addr, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sbc_block::MemBlockDevice;

    const DEV: DeviceId = DeviceId(0);

    fn cache_with_device(
        pool_slots: usize,
        shard_count: usize,
        blocks: u64,
    ) -> (BufCache, Arc<MemBlockDevice>) {
        let cache = BufCache::new(CacheConfig {
            pool_slots,
            shard_count,
        })
        .expect("config");
        let device = Arc::new(MemBlockDevice::new(blocks));
        cache.register_device(DEV, Arc::clone(&device) as Arc<dyn BlockDevice>);
        (cache, device)
    }

    #[test]
    fn rejects_zero_geometry() {
        let err = BufCache::new(CacheConfig {
            pool_slots: 0,
            shard_count: 1,
        })
        .expect_err("pool_slots");
        assert!(matches!(err, CacheError::InvalidGeometry(_)));

        let err = BufCache::new(CacheConfig {
            pool_slots: 1,
            shard_count: 0,
        })
        .expect_err("shard_count");
        assert!(matches!(err, CacheError::InvalidGeometry(_)));
    }

    #[test]
    fn exhaustion_when_every_slot_is_held() {
        let (cache, _dev) = cache_with_device(2, 1, 16);

        let _b0 = cache.acquire(DEV, BlockNumber(0)).expect("first");
        let _b1 = cache.acquire(DEV, BlockNumber(1)).expect("second");

        let err = cache.acquire(DEV, BlockNumber(2)).expect_err("third");
        assert!(matches!(err, CacheError::Exhausted { capacity: 2 }));
    }

    #[test]
    fn released_slot_is_reusable_after_exhaustion() {
        let (cache, _dev) = cache_with_device(2, 1, 16);

        let b0 = cache.acquire(DEV, BlockNumber(0)).expect("first");
        let _b1 = cache.acquire(DEV, BlockNumber(1)).expect("second");
        assert!(cache.acquire(DEV, BlockNumber(2)).is_err());

        b0.release();
        let _b2 = cache.acquire(DEV, BlockNumber(2)).expect("after release");
    }

    #[test]
    fn valid_bytes_survive_release_and_reacquire() {
        let (cache, dev) = cache_with_device(4, 3, 16);

        let mut buf = cache.read_through(DEV, BlockNumber(5)).expect("read");
        assert_eq!(dev.read_count(), 1);
        buf.bytes_mut()[0] = b'A';
        buf.flush().expect("flush");
        buf.release();

        let buf = cache.read_through(DEV, BlockNumber(5)).expect("re-read");
        assert!(buf.is_valid());
        assert_eq!(buf.bytes()[0], b'A');
        // Still one device read: the re-acquire hit the cache.
        assert_eq!(dev.read_count(), 1);
    }

    #[test]
    fn eviction_picks_globally_oldest_release() {
        let (cache, _dev) = cache_with_device(3, 1, 16);

        for block in 1_u64..=3 {
            cache
                .read_through(DEV, BlockNumber(block))
                .expect("warm")
                .release();
        }

        cache.read_through(DEV, BlockNumber(4)).expect("miss").release();

        let resident = cache.resident();
        assert_eq!(resident.len(), 3);
        assert!(!resident.contains(&BlockAddr::new(DEV, BlockNumber(1))));
        for block in 2_u64..=4 {
            assert!(resident.contains(&BlockAddr::new(DEV, BlockNumber(block))));
        }
    }

    #[test]
    fn pinned_slot_is_never_evicted() {
        let (cache, dev) = cache_with_device(2, 1, 16);

        let buf = cache.read_through(DEV, BlockNumber(0)).expect("read");
        let pin = buf.pin();
        buf.release();
        assert_eq!(dev.read_count(), 1);

        // Churn more distinct blocks than the pool holds.
        for block in 1_u64..=4 {
            cache
                .read_through(DEV, BlockNumber(block))
                .expect("churn")
                .release();
        }

        // Still resident: no second device read.
        cache.read_through(DEV, BlockNumber(0)).expect("hit").release();
        assert_eq!(dev.read_count(), 5);

        pin.unpin();
        for block in 5_u64..=7 {
            cache
                .read_through(DEV, BlockNumber(block))
                .expect("churn")
                .release();
        }
        // Unpinned, so the churn above evicted it.
        cache.read_through(DEV, BlockNumber(0)).expect("miss").release();
        assert_eq!(dev.read_count(), 9);
    }

    #[test]
    fn flush_writes_through_without_touching_valid() {
        let (cache, dev) = cache_with_device(4, 3, 16);

        let mut buf = cache.read_through(DEV, BlockNumber(2)).expect("read");
        buf.bytes_mut()[..4].copy_from_slice(b"data");
        assert!(buf.is_dirty());
        buf.flush().expect("flush");
        assert!(!buf.is_dirty());
        assert!(buf.is_valid());
        buf.release();

        assert_eq!(dev.write_count(), 1);
        let mut raw = [0_u8; BLOCK_SIZE];
        dev.read_block(BlockNumber(2), &mut raw).expect("verify");
        assert_eq!(&raw[..4], b"data");
    }

    #[test]
    fn sync_all_flushes_dirty_unheld_buffers() {
        let (cache, dev) = cache_with_device(4, 3, 16);

        for block in [1_u64, 2] {
            let mut buf = cache.read_through(DEV, BlockNumber(block)).expect("read");
            buf.bytes_mut()[0] = 0xEE;
            buf.release();
        }
        assert_eq!(dev.write_count(), 0);

        cache.sync_all().expect("sync");
        assert_eq!(dev.write_count(), 2);

        // Second pass is a no-op: nothing is dirty anymore.
        cache.sync_all().expect("sync again");
        assert_eq!(dev.write_count(), 2);
    }

    #[test]
    fn sync_all_skips_held_buffers() {
        let (cache, dev) = cache_with_device(4, 3, 16);

        let mut held = cache.read_through(DEV, BlockNumber(1)).expect("read");
        held.bytes_mut()[0] = 1;

        cache.sync_all().expect("sync");
        assert_eq!(dev.write_count(), 0);
        assert!(held.is_dirty());
    }

    #[test]
    fn unknown_device_is_reported() {
        let cache = BufCache::new(CacheConfig {
            pool_slots: 2,
            shard_count: 1,
        })
        .expect("config");

        let err = cache.read_through(DeviceId(9), BlockNumber(0)).expect_err("no device");
        assert!(matches!(err, CacheError::UnknownDevice { device: 9 }));
    }

    #[test]
    fn distinct_devices_do_not_collide() {
        let (cache, dev_a) = cache_with_device(4, 3, 16);
        let dev_b = Arc::new(MemBlockDevice::new(16));
        cache.register_device(DeviceId(1), Arc::clone(&dev_b) as Arc<dyn BlockDevice>);

        dev_a
            .write_block(BlockNumber(3), &[0xAA_u8; BLOCK_SIZE])
            .expect("seed a");
        dev_b
            .write_block(BlockNumber(3), &[0xBB_u8; BLOCK_SIZE])
            .expect("seed b");

        let a = cache.read_through(DeviceId(0), BlockNumber(3)).expect("a");
        assert_eq!(a.bytes()[0], 0xAA);
        a.release();

        let b = cache.read_through(DeviceId(1), BlockNumber(3)).expect("b");
        assert_eq!(b.bytes()[0], 0xBB);
        b.release();

        // Same block number on two devices must occupy two slots.
        assert_eq!(cache.resident().len(), 2);
    }

    #[test]
    fn repeated_reacquire_keeps_one_resident_entry() {
        let (cache, _dev) = cache_with_device(4, 3, 16);
        for _ in 0..10 {
            cache.read_through(DEV, BlockNumber(7)).expect("read").release();
        }
        let resident = cache.resident();
        assert_eq!(resident.len(), 1);
        assert_eq!(resident[0], BlockAddr::new(DEV, BlockNumber(7)));
    }

    #[test]
    fn lost_relocation_race_strips_victim_identity() {
        let (cache, _dev) = cache_with_device(3, 1, 16);
        for block in 0_u64..3 {
            cache.read_through(DEV, BlockNumber(block)).expect("warm").release();
        }

        // Walk the miss path for block 3 by hand, pausing inside the
        // window where no lock is held.
        let target = BlockAddr::new(DEV, BlockNumber(3));
        let Victim {
            shard_idx,
            mut guard,
            pos,
            ..
        } = cache.find_victim().expect("victim");
        let meta = guard.remove(pos);
        let old = meta.addr.expect("warmed slot has an identity");
        drop(guard);
        let content = cache.slot(meta.slot).content.lock();

        // During the window the victim's old identity gets re-cached into
        // another slot, and a racing caller wins block 3.
        cache.read_through(DEV, old.block).expect("re-cache").release();
        cache.read_through(DEV, BlockNumber(3)).expect("winner").release();

        // Resuming must hand back the winner's slot and return the victim
        // to its donor shard without its stale identity.
        let buf = cache.claim_or_rejoin(meta, content, shard_idx, target);
        assert_eq!(buf.block(), BlockNumber(3));
        assert!(buf.is_valid());
        buf.release();

        let mut resident = cache.resident();
        let total = resident.len();
        resident.sort();
        resident.dedup();
        assert_eq!(resident.len(), total, "duplicate identity cached");
        assert_eq!(total, 2);
    }

    #[test]
    fn stats_track_hits_misses_and_evictions() {
        let (cache, _dev) = cache_with_device(2, 1, 16);

        cache.read_through(DEV, BlockNumber(0)).expect("miss").release();
        cache.read_through(DEV, BlockNumber(0)).expect("hit").release();
        cache.read_through(DEV, BlockNumber(1)).expect("miss").release();
        cache.read_through(DEV, BlockNumber(2)).expect("evicting miss").release();

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 3);
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.device_reads, 3);
    }
}
