//! Settings the data log and bucket index are constructed from.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{DEFAULT_BUCKET_BITS, Error, Result};

/// Durability policy applied after an entry's payload is written.
///
/// Checked once per [`crate::storage::DataLog::insert`] call, after the
/// payload write — never after the header-only write, so one insert never
/// triggers two fsyncs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// fsync unconditionally after every payload write.
    Always,
    /// fsync a payload write only if more than `Duration` has elapsed
    /// since the last fsync.
    Timed(Duration),
    /// Never fsync proactively; only `emergency()` forces data to disk.
    None,
}

impl Default for SyncMode {
    fn default() -> Self {
        SyncMode::None
    }
}

/// Construction settings for a [`crate::storage::DataLog`] and, separately,
/// the bucket sizing used to build a [`crate::index::BucketArray`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Directory holding segment files. Must exist.
    pub datadir: PathBuf,
    /// Starting (and initially current) segment id.
    pub dataid: u16,
    /// Durability policy.
    pub sync: SyncMode,
    /// One-time bucket index sizing, `1..=32`.
    pub bucket_bits: u8,
}

impl Settings {
    /// Build settings pointing at `datadir` with the given starting
    /// segment id, sync disabled and default bucket sizing.
    pub fn new(datadir: impl Into<PathBuf>, dataid: u16) -> Self {
        Self {
            datadir: datadir.into(),
            dataid,
            sync: SyncMode::None,
            bucket_bits: DEFAULT_BUCKET_BITS,
        }
    }

    /// Set the durability policy.
    #[must_use]
    pub fn with_sync(mut self, sync: SyncMode) -> Self {
        self.sync = sync;
        self
    }

    /// Set the bucket index sizing.
    #[must_use]
    pub fn with_bucket_bits(mut self, bucket_bits: u8) -> Self {
        self.bucket_bits = bucket_bits;
        self
    }

    /// Validate the settings, chiefly `bucket_bits`' range.
    pub fn validate(&self) -> Result<()> {
        if !(1..=32).contains(&self.bucket_bits) {
            return Err(Error::InvalidBucketBits(self.bucket_bits));
        }
        Ok(())
    }

    /// Path of the segment file for `dataid` under `datadir`.
    pub fn segment_path(&self, dataid: u16) -> PathBuf {
        segment_path(&self.datadir, dataid)
    }
}

/// Path of the segment file for `dataid` under `datadir`.
///
/// Filenames follow `zdb-data-<fileid>` with the id zero-padded to five
/// decimal digits.
pub fn segment_path(datadir: &Path, dataid: u16) -> PathBuf {
    datadir.join(format!("zdb-data-{dataid:05}"))
}

/// Parse a segment filename back into its numeric id, rejecting anything
/// that doesn't match `zdb-data-NNNNN`.
pub fn parse_segment_filename(filename: &str) -> Option<u16> {
    let suffix = filename.strip_prefix("zdb-data-")?;
    if suffix.len() != 5 || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}
