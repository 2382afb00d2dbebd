#![forbid(unsafe_code)]
//! Block device abstraction for the buffer cache.
//!
//! The cache calls a device through [`BlockDevice`]: synchronous, whole-block
//! reads and writes. Two implementations are provided:
//!
//! - [`FileBlockDevice`]: file- or block-special-backed, using
//!   `pread`/`pwrite` style positioned I/O (`std::os::unix::fs::FileExt`),
//!   which is thread-safe and needs no shared seek position.
//! - [`MemBlockDevice`]: an in-memory device with read/write counters, used
//!   by tests and benchmarks to assert how many device operations the cache
//!   actually issued.

use parking_lot::Mutex;
use sbc_error::{CacheError, Result};
use sbc_types::{BlockNumber, BLOCK_SIZE};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Block-addressed I/O interface.
///
/// All buffers are exactly [`BLOCK_SIZE`] bytes; implementations MUST reject
/// any other length with [`CacheError::InvalidGeometry`].
pub trait BlockDevice: Send + Sync {
    /// Read block `block` into `buf`.
    fn read_block(&self, block: BlockNumber, buf: &mut [u8]) -> Result<()>;

    /// Write `data` to block `block`.
    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()>;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn check_len(len: usize) -> Result<()> {
    if len != BLOCK_SIZE {
        return Err(CacheError::InvalidGeometry(format!(
            "buffer size mismatch: got={len} expected={BLOCK_SIZE}"
        )));
    }
    Ok(())
}

fn check_range(block: BlockNumber, block_count: u64) -> Result<u64> {
    if block.0 >= block_count {
        return Err(CacheError::OutOfRange {
            block: block.0,
            block_count,
        });
    }
    block
        .0
        .checked_mul(u64::try_from(BLOCK_SIZE).expect("BLOCK_SIZE fits in u64"))
        .ok_or_else(|| CacheError::InvalidGeometry("block offset overflow".to_owned()))
}

/// File-backed block device.
#[derive(Debug, Clone)]
pub struct FileBlockDevice {
    file: Arc<File>,
    block_count: u64,
    writable: bool,
}

impl FileBlockDevice {
    /// Open `path` read-write, falling back to read-only.
    ///
    /// The file length must be a whole number of blocks.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        let block_size = u64::try_from(BLOCK_SIZE).expect("BLOCK_SIZE fits in u64");
        if len % block_size != 0 {
            return Err(CacheError::InvalidGeometry(format!(
                "image length is not block-aligned: len_bytes={len} block_size={block_size}"
            )));
        }
        Ok(Self {
            file: Arc::new(file),
            block_count: len / block_size,
            writable,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl BlockDevice for FileBlockDevice {
    fn read_block(&self, block: BlockNumber, buf: &mut [u8]) -> Result<()> {
        check_len(buf.len())?;
        let offset = check_range(block, self.block_count)?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        check_len(data.len())?;
        if !self.writable {
            return Err(CacheError::ReadOnly);
        }
        let offset = check_range(block, self.block_count)?;
        self.file.write_all_at(data, offset)?;
        Ok(())
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// In-memory block device.
///
/// The read/write counters let tests assert exactly how many physical
/// operations reached the device (e.g. that a cache hit issued none).
#[derive(Debug)]
pub struct MemBlockDevice {
    bytes: Mutex<Vec<u8>>,
    block_count: u64,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemBlockDevice {
    /// Create a zero-filled device holding `block_count` blocks.
    #[must_use]
    pub fn new(block_count: u64) -> Self {
        let len = usize::try_from(block_count).expect("block_count fits in usize") * BLOCK_SIZE;
        Self {
            bytes: Mutex::new(vec![0_u8; len]),
            block_count,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Number of `read_block` calls served so far.
    #[must_use]
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of `write_block` calls served so far.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_block(&self, block: BlockNumber, buf: &mut [u8]) -> Result<()> {
        check_len(buf.len())?;
        let offset = check_range(block, self.block_count)?;
        let start = usize::try_from(offset).expect("offset fits in usize");
        let bytes = self.bytes.lock();
        buf.copy_from_slice(&bytes[start..start + BLOCK_SIZE]);
        drop(bytes);
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        check_len(data.len())?;
        let offset = check_range(block, self.block_count)?;
        let start = usize::try_from(offset).expect("offset fits in usize");
        let mut bytes = self.bytes.lock();
        bytes[start..start + BLOCK_SIZE].copy_from_slice(data);
        drop(bytes);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}
