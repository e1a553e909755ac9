//! The fixed preamble written once at the start of every segment file.
//!
//! ```text
//! magic        4 bytes   "DAT0"
//! version      1 byte    currently 1
//! created      4 bytes   unix seconds, u32, little-endian
//! opened       4 bytes   reserved, currently 0
//! fileid       2 bytes   u16, little-endian, must equal the filename suffix
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use crate::{Error, Result};

/// Magic bytes identifying a segment file.
pub const MAGIC: [u8; 4] = *b"DAT0";

/// Current on-disk version written by this crate.
pub const VERSION: u8 = 1;

/// Preamble of a segment file, written once at creation and never
/// rewritten afterward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Format version.
    pub version: u8,
    /// Unix timestamp the segment was created.
    pub created: u32,
    /// Reserved; always 0.
    pub opened: u32,
    /// Numeric id encoded in the segment's filename.
    pub fileid: u16,
}

impl SegmentHeader {
    /// On-disk size in bytes.
    pub const SIZE: usize = 15;

    /// Build a fresh header for `fileid`, stamped with the current time.
    pub fn new(fileid: u16) -> Self {
        let created = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);

        Self {
            version: VERSION,
            created,
            opened: 0,
            fileid,
        }
    }

    /// Serialize to the on-disk byte layout.
    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4] = self.version;
        buf[5..9].copy_from_slice(&self.created.to_le_bytes());
        buf[9..13].copy_from_slice(&self.opened.to_le_bytes());
        buf[13..15].copy_from_slice(&self.fileid.to_le_bytes());
        buf
    }

    /// Parse from the on-disk byte layout, rejecting a bad magic.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::ShortIo {
                expected: Self::SIZE,
                actual: buf.len(),
            });
        }

        if buf[0..4] != MAGIC {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "bad segment magic",
            )));
        }

        Ok(Self {
            version: buf[4],
            created: u32::from_le_bytes(buf[5..9].try_into().unwrap()),
            opened: u32::from_le_bytes(buf[9..13].try_into().unwrap()),
            fileid: u16::from_le_bytes(buf[13..15].try_into().unwrap()),
        })
    }
}
