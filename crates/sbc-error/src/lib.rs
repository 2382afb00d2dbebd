#![forbid(unsafe_code)]
//! Error types for the sharded buffer cache.
//!
//! [`CacheError`] is the single error type returned across the public API.
//! Device-layer failures (`Io`, `OutOfRange`, `ReadOnly`) are surfaced to
//! the caller untouched: the cache never retries device I/O; retry policy
//! belongs to the device layer or the caller.
//!
//! Contract violations that indicate cache-invariant corruption (reference
//! count underflow, a supposedly free exclusive lock found held) are not
//! represented here. They panic eagerly, because continuing would serve
//! stale or doubly-owned buffers. Flushing or releasing a buffer without
//! holding its exclusive lock is unrepresentable: both operations exist
//! only on the locked guard type in `sbc-cache`.
//!
//! This crate MUST NOT depend on `sbc-types` (keeps the error type usable
//! from every layer without cycles), so identifier payloads are raw
//! integers.

use thiserror::Error;

/// Unified error type for all cache and device operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Operating system I/O error from the block device.
    #[error("device I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Every slot in the pool is referenced; nothing can be evicted.
    ///
    /// This is a capacity-planning failure, not a transient condition: the
    /// caller's request cannot be served until some holder releases.
    #[error("buffer pool exhausted: all {capacity} slots are referenced")]
    Exhausted { capacity: usize },

    /// No device registered under the given identifier.
    #[error("unknown device: {device}")]
    UnknownDevice { device: u64 },

    /// Block number beyond the end of the device.
    #[error("block out of range: block={block} block_count={block_count}")]
    OutOfRange { block: u64, block_count: u64 },

    /// Invalid construction or size parameters.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Write attempted on a device opened read-only.
    #[error("read-only device")]
    ReadOnly,
}

impl CacheError {
    /// Convert this error into a POSIX errno.
    ///
    /// Every variant has an explicit arm, so adding a variant without
    /// assigning its errno is a compile error.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Exhausted { .. } => libc::ENOMEM,
            Self::UnknownDevice { .. } => libc::ENODEV,
            Self::OutOfRange { .. } | Self::InvalidGeometry(_) => libc::EINVAL,
            Self::ReadOnly => libc::EROFS,
        }
    }
}

/// Result alias using [`CacheError`].
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(CacheError, libc::c_int)> = vec![
            (CacheError::Io(std::io::Error::other("test")), libc::EIO),
            (CacheError::Exhausted { capacity: 8 }, libc::ENOMEM),
            (CacheError::UnknownDevice { device: 3 }, libc::ENODEV),
            (
                CacheError::OutOfRange {
                    block: 10,
                    block_count: 4,
                },
                libc::EINVAL,
            ),
            (
                CacheError::InvalidGeometry("pool_slots=0".into()),
                libc::EINVAL,
            ),
            (CacheError::ReadOnly, libc::EROFS),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(error.to_errno(), *expected_errno, "wrong errno for {error:?}");
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(CacheError::Io(raw).to_errno(), libc::EACCES);
    }

    #[test]
    fn display_formatting() {
        let err = CacheError::Exhausted { capacity: 2 };
        assert_eq!(
            err.to_string(),
            "buffer pool exhausted: all 2 slots are referenced"
        );

        let oob = CacheError::OutOfRange {
            block: 9,
            block_count: 8,
        };
        assert_eq!(oob.to_string(), "block out of range: block=9 block_count=8");

        assert_eq!(
            CacheError::UnknownDevice { device: 7 }.to_string(),
            "unknown device: 7"
        );
    }
}
