//! Append-only, content-addressable key-value storage core.
//!
//! This crate provides the two pieces a larger key-value engine builds on:
//! a [`storage::DataLog`] that owns segment files and the append-only write
//! path, and an [`index::BucketArray`] that resolves a key to its most
//! recent on-disk location. The two are independent — this crate does not
//! wire them together, run a server, or speak any wire protocol.
//!
//! # Overview
//!
//! - Segment files hold a small header followed by a sequence of
//!   checksummed, immutable entries.
//! - The data log keeps exactly one segment open for writes; any other
//!   segment is opened read-only for the duration of a single read.
//! - The bucket index is a fixed-size table of lazily-allocated hash
//!   chains, sized once at construction.
//!
//! # Example
//!
//! ```rust,no_run
//! use segkv::{Settings, SyncMode};
//! use segkv::storage::DataLog;
//!
//! # fn example() -> segkv::Result<()> {
//! let settings = Settings::new("/path/to/data", 0)
//!     .with_sync(SyncMode::Always);
//!
//! let mut log = DataLog::open(settings)?;
//! let offset = log.insert(b"hello", b"world")?;
//! let payload = log.get(log.dataid(), offset, 5, None)?;
//! assert_eq!(payload.as_slice(), b"world");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![allow(clippy::must_use_candidate)]

use thiserror::Error;

pub mod config;
pub mod crc;
pub mod index;
pub mod storage;

pub use config::{Settings, SyncMode};
pub use index::{BucketArray, IndexEntry};
pub use storage::DataLog;

/// Result type for storage core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the storage core.
#[derive(Debug, Error)]
pub enum Error {
    /// A syscall (`open`, `read`, `write`, `lseek`, `fsync`) failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A read or write returned fewer bytes than requested, with no
    /// underlying OS error.
    #[error("short I/O: expected {expected} bytes, got {actual}")]
    ShortIo {
        /// Bytes requested.
        expected: usize,
        /// Bytes actually transferred.
        actual: usize,
    },

    /// `check` recomputed the payload CRC and it didn't match the stored
    /// integrity field.
    #[error("integrity mismatch in segment {fileid} at offset {offset}")]
    IntegrityMismatch {
        /// Segment file id.
        fileid: u16,
        /// Byte offset of the entry header.
        offset: u64,
    },

    /// `match_key` could not confirm that the header at the given offset
    /// describes the requested key.
    #[error("validation miss in segment {fileid} at offset {offset}")]
    ValidationMiss {
        /// Segment file id.
        fileid: u16,
        /// Byte offset of the entry header.
        offset: u64,
    },

    /// The log was demoted to read-only (the underlying filesystem
    /// rejected a write with `EROFS`/permission denied) and a mutating
    /// call was attempted.
    #[error("data log is read-only")]
    ReadOnlyFilesystem,

    /// A key longer than the configured maximum was passed to `insert`.
    #[error("key too long: {length} bytes, max {max}")]
    KeyTooLong {
        /// Length of the offending key.
        length: usize,
        /// Configured maximum.
        max: usize,
    },

    /// A payload longer than `DATA_MAXSIZE` was passed to `insert`.
    #[error("payload too large: {length} bytes, max {max}")]
    PayloadTooLarge {
        /// Length of the offending payload.
        length: usize,
        /// Configured maximum.
        max: usize,
    },

    /// `bucket_bits` outside the valid `1..=32` range.
    #[error("invalid bucket bits: {0}, must be in 1..=32")]
    InvalidBucketBits(u8),
}

/// Crate version, re-exported for callers that want to log it.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Upper bound on an entry's payload length (`datalength`), in bytes.
pub const DATA_MAXSIZE: u32 = 8 * 1024 * 1024;

/// Upper bound on a key's length (`idlength`), in bytes.
pub const MAX_KEY_LENGTH: usize = 255;

/// Default bucket index sizing, `2^24` buckets.
pub const DEFAULT_BUCKET_BITS: u8 = 24;
