//! The append-only data log: one writable segment plus transient read-only
//! access to any other segment.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::config::{Settings, SyncMode, segment_path};
use crate::storage::entry::{EntryHeader, FLAG_DELETED};
use crate::storage::header::SegmentHeader;
use crate::{DATA_MAXSIZE, Error, MAX_KEY_LENGTH, Result, crc};

/// One writable segment, with on-demand read-only access to any other
/// segment in the same data directory.
///
/// Mutating calls (`insert`, `delete`, `rollover`) take `&mut self`;
/// reads (`get`, `check`, `match_key`, `next_offset`) take `&self`, since
/// nothing in this crate runs more than one of these at a time — callers
/// driving this from multiple threads are responsible for serializing
/// writes themselves.
pub struct DataLog {
    datadir: PathBuf,
    dataid: u16,
    file: File,
    readonly: bool,
    previous: u64,
    sync: SyncMode,
    last_sync: SystemTime,
}

impl DataLog {
    /// Open or create the segment named by `settings.dataid`, replaying
    /// its entries to recover the insertion point.
    pub fn open(settings: Settings) -> Result<Self> {
        settings.validate()?;

        let path = settings.segment_path(settings.dataid);
        let (file, readonly) = open_or_init_segment(&path, settings.dataid)?;

        let mut log = Self {
            datadir: settings.datadir,
            dataid: settings.dataid,
            file,
            readonly,
            previous: SegmentHeader::SIZE as u64,
            sync: settings.sync,
            last_sync: UNIX_EPOCH,
        };

        log.previous = log.scan_last_offset()?;
        Ok(log)
    }

    /// The segment id currently open for writes.
    pub fn dataid(&self) -> u16 {
        self.dataid
    }

    /// Whether the log was demoted to read-only (the filesystem rejected a
    /// write as `EROFS`/permission denied).
    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Offset the next `insert` into the current segment will return.
    pub fn next_offset(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Append `key` and `payload` as one entry to the current segment,
    /// returning the offset of its header.
    pub fn insert(&mut self, key: &[u8], payload: &[u8]) -> Result<u64> {
        if self.readonly {
            return Err(Error::ReadOnlyFilesystem);
        }
        if key.len() > MAX_KEY_LENGTH {
            return Err(Error::KeyTooLong {
                length: key.len(),
                max: MAX_KEY_LENGTH,
            });
        }
        if payload.len() as u64 > DATA_MAXSIZE as u64 {
            return Err(Error::PayloadTooLarge {
                length: payload.len(),
                max: DATA_MAXSIZE as usize,
            });
        }

        let offset = self.file.seek(SeekFrom::End(0))?;
        let header = EntryHeader {
            idlength: key.len() as u8,
            datalength: payload.len() as u32,
            previous: self.previous,
            integrity: crc::checksum(payload),
            flags: 0,
        };

        self.file.write_all(&header.to_bytes())?;
        self.file.write_all(key)?;
        self.file.write_all(payload)?;

        self.sync_after_payload()?;

        self.previous = offset;
        Ok(offset)
    }

    /// Read `idlength` bytes of key and fetch the payload stored at
    /// `offset` in segment `fileid`. If `length` is `None`, the header is
    /// read first to learn the payload length.
    pub fn get(
        &self,
        fileid: u16,
        offset: u64,
        idlength: u8,
        length: Option<u32>,
    ) -> Result<Vec<u8>> {
        let handle = self.acquire(fileid)?;
        let file = handle.file();

        let datalength = match length {
            Some(length) => length,
            None => {
                let mut header_buf = [0u8; EntryHeader::SIZE];
                pread_exact(file, offset, &mut header_buf)?;
                EntryHeader::from_bytes(&header_buf)?.datalength
            }
        };

        let payload_offset = offset + EntryHeader::SIZE as u64 + idlength as u64;
        let mut payload = vec![0u8; datalength as usize];
        pread_exact(file, payload_offset, &mut payload)?;
        Ok(payload)
    }

    /// Recompute the CRC32C of the payload stored at `offset` in segment
    /// `fileid` and compare it to the stored integrity field.
    pub fn check(&self, fileid: u16, offset: u64) -> Result<()> {
        let handle = self.acquire(fileid)?;
        let file = handle.file();

        let mut header_buf = [0u8; EntryHeader::SIZE];
        pread_exact(file, offset, &mut header_buf)?;
        let header = EntryHeader::from_bytes(&header_buf)?;

        let payload_offset = offset + EntryHeader::SIZE as u64 + header.idlength as u64;
        let mut payload = vec![0u8; header.datalength as usize];
        pread_exact(file, payload_offset, &mut payload)?;

        if crc::checksum(&payload) != header.integrity {
            return Err(Error::IntegrityMismatch { fileid, offset });
        }
        Ok(())
    }

    /// Validate that `offset` in segment `fileid` plausibly refers to an
    /// entry with `key`: the header must be readable, its key length and
    /// bytes must match, it must not be flagged deleted, and its declared
    /// payload length must not exceed [`DATA_MAXSIZE`]. Returns the
    /// entry's payload length on success.
    pub fn match_key(&self, fileid: u16, offset: u64, key: &[u8]) -> Result<u32> {
        let handle = self.acquire(fileid)?;
        let file = handle.file();

        let mut header_buf = [0u8; EntryHeader::SIZE];
        pread_exact(file, offset, &mut header_buf)?;
        let header = EntryHeader::from_bytes(&header_buf)?;

        if header.idlength as usize != key.len()
            || header.is_deleted()
            || header.datalength > DATA_MAXSIZE
        {
            return Err(Error::ValidationMiss { fileid, offset });
        }

        let mut stored_key = vec![0u8; key.len()];
        pread_exact(file, offset + EntryHeader::SIZE as u64, &mut stored_key)?;
        if stored_key != key {
            return Err(Error::ValidationMiss { fileid, offset });
        }

        Ok(header.datalength)
    }

    /// Flag the entry at `offset` in segment `fileid` as deleted, by
    /// reopening that segment read-write (never in append mode) and
    /// rewriting its header in place. The only operation that mutates an
    /// existing byte range.
    pub fn delete(&mut self, fileid: u16, offset: u64) -> Result<()> {
        if self.readonly {
            return Err(Error::ReadOnlyFilesystem);
        }

        // Always reopen the target segment non-append, even when it's the
        // current one: `self.file` is opened with O_APPEND, and on Linux
        // `pwrite` on an O_APPEND fd ignores the requested offset and
        // writes at EOF instead of flipping the bit in place.
        let path = segment_path(&self.datadir, fileid);
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        set_deleted_flag(&file, offset)
    }

    /// Close the current segment and open `new_fileid` as the new current
    /// segment, creating it if needed.
    pub fn rollover(&mut self, new_fileid: u16) -> Result<u16> {
        debug!(old = self.dataid, new = new_fileid, "rolling over segment");

        let path = segment_path(&self.datadir, new_fileid);
        let (file, readonly) = open_or_init_segment(&path, new_fileid)?;

        self.file = file;
        self.readonly = readonly;
        self.dataid = new_fileid;
        self.previous = self.scan_last_offset()?;

        Ok(self.dataid)
    }

    /// Best-effort fsync of the current segment, for shutdown/signal
    /// paths. Never fails; errors are logged and swallowed.
    pub fn emergency(&self) {
        if let Err(error) = self.file.sync_all() {
            warn!(%error, "emergency fsync failed");
        }
    }

    fn acquire(&self, fileid: u16) -> Result<Handle<'_>> {
        if fileid == self.dataid {
            Ok(Handle::Current(&self.file))
        } else {
            let path = segment_path(&self.datadir, fileid);
            let file = OpenOptions::new().read(true).open(path)?;
            Ok(Handle::Transient(file))
        }
    }

    fn sync_after_payload(&mut self) -> Result<()> {
        match self.sync {
            SyncMode::Always => {
                self.file.sync_all()?;
                self.last_sync = SystemTime::now();
            }
            SyncMode::Timed(period) => {
                let now = SystemTime::now();
                let elapsed = now.duration_since(self.last_sync).unwrap_or(Duration::MAX);
                if elapsed > period {
                    debug!("last sync expired, forcing sync");
                    self.file.sync_all()?;
                    self.last_sync = now;
                }
            }
            SyncMode::None => {}
        }
        Ok(())
    }

    fn scan_last_offset(&mut self) -> Result<u64> {
        let mut cursor = SegmentHeader::SIZE as u64;
        let mut previous = cursor;
        self.file.seek(SeekFrom::Start(cursor))?;

        let mut header_buf = [0u8; EntryHeader::SIZE];
        let mut entries = 0u64;

        while read_full_or_eof(&mut self.file, &mut header_buf)? {
            let header = EntryHeader::from_bytes(&header_buf)?;
            previous = cursor;
            cursor += EntryHeader::SIZE as u64 + header.idlength as u64 + header.datalength as u64;
            self.file.seek(SeekFrom::Start(cursor))?;
            entries += 1;
        }

        debug!(entries, last_offset = previous, "segment scanned");
        Ok(previous)
    }
}

/// Either the data log's cached writable fd, or a transiently opened
/// read-only fd closed when this value is dropped.
enum Handle<'a> {
    Current(&'a File),
    Transient(File),
}

impl Handle<'_> {
    fn file(&self) -> &File {
        match self {
            Handle::Current(file) => file,
            Handle::Transient(file) => file,
        }
    }
}

fn set_deleted_flag(file: &File, offset: u64) -> Result<()> {
    let mut header_buf = [0u8; EntryHeader::SIZE];
    pread_exact(file, offset, &mut header_buf)?;
    let mut header = EntryHeader::from_bytes(&header_buf)?;
    header.flags |= FLAG_DELETED;
    pwrite_exact(file, offset, &header.to_bytes())?;
    Ok(())
}

fn open_or_init_segment(path: &std::path::Path, dataid: u16) -> Result<(File, bool)> {
    if !path.exists() {
        match OpenOptions::new().create(true).write(true).open(path) {
            Ok(mut file) => {
                let header = SegmentHeader::new(dataid);
                file.write_all(&header.to_bytes())?;
                file.sync_all()?;
            }
            Err(error) if is_read_only_error(&error) => {
                debug!(%error, "skipping segment initialization on read-only filesystem");
            }
            Err(error) => return Err(error.into()),
        }
    }

    match OpenOptions::new().create(true).read(true).append(true).open(path) {
        Ok(file) => Ok((file, false)),
        Err(error) if is_read_only_error(&error) => {
            debug!(%error, "opening segment read-only");
            let file = OpenOptions::new().read(true).open(path)?;
            Ok((file, true))
        }
        Err(error) => Err(error.into()),
    }
}

/// `true` for permission-denied and `EROFS` (errno 30 on Linux); checked
/// by raw errno since a stable, portable `ErrorKind` for read-only
/// filesystems isn't available on every supported toolchain yet.
fn is_read_only_error(error: &std::io::Error) -> bool {
    error.kind() == std::io::ErrorKind::PermissionDenied || error.raw_os_error() == Some(30)
}

/// Reads exactly `buf.len()` bytes, or returns `Ok(false)` if zero bytes
/// were available at all (clean EOF). A nonzero short read is corruption,
/// not EOF, and is reported as [`Error::ShortIo`].
fn read_full_or_eof(file: &mut File, buf: &mut [u8]) -> Result<bool> {
    let mut read = 0;
    while read < buf.len() {
        let n = file.read(&mut buf[read..])?;
        if n == 0 {
            if read == 0 {
                return Ok(false);
            }
            return Err(Error::ShortIo {
                expected: buf.len(),
                actual: read,
            });
        }
        read += n;
    }
    Ok(true)
}

#[cfg(unix)]
fn pread_exact(file: &File, mut offset: u64, buf: &mut [u8]) -> Result<()> {
    use std::os::unix::fs::FileExt;
    let mut read = 0;
    while read < buf.len() {
        let n = file.read_at(&mut buf[read..], offset)?;
        if n == 0 {
            return Err(Error::ShortIo {
                expected: buf.len(),
                actual: read,
            });
        }
        read += n;
        offset += n as u64;
    }
    Ok(())
}

#[cfg(windows)]
fn pread_exact(file: &File, mut offset: u64, buf: &mut [u8]) -> Result<()> {
    use std::os::windows::fs::FileExt;
    let mut read = 0;
    while read < buf.len() {
        let n = file.seek_read(&mut buf[read..], offset)?;
        if n == 0 {
            return Err(Error::ShortIo {
                expected: buf.len(),
                actual: read,
            });
        }
        read += n;
        offset += n as u64;
    }
    Ok(())
}

#[cfg(unix)]
fn pwrite_exact(file: &File, mut offset: u64, buf: &[u8]) -> Result<()> {
    use std::os::unix::fs::FileExt;
    let mut written = 0;
    while written < buf.len() {
        let n = file.write_at(&buf[written..], offset)?;
        if n == 0 {
            return Err(Error::ShortIo {
                expected: buf.len(),
                actual: written,
            });
        }
        written += n;
        offset += n as u64;
    }
    Ok(())
}

#[cfg(windows)]
fn pwrite_exact(file: &File, mut offset: u64, buf: &[u8]) -> Result<()> {
    use std::os::windows::fs::FileExt;
    let mut written = 0;
    while written < buf.len() {
        let n = file.seek_write(&buf[written..], offset)?;
        if n == 0 {
            return Err(Error::ShortIo {
                expected: buf.len(),
                actual: written,
            });
        }
        written += n;
        offset += n as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_log(dir: &tempfile::TempDir, dataid: u16) -> DataLog {
        let settings = Settings::new(dir.path(), dataid);
        DataLog::open(settings).unwrap()
    }

    #[test]
    fn first_insert_offset_is_segment_header_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open_log(&dir, 0);

        let offset = log.insert(b"key", b"value").unwrap();
        assert_eq!(offset, SegmentHeader::SIZE as u64);

        let handle = log.acquire(0).unwrap();
        let mut header_buf = [0u8; EntryHeader::SIZE];
        pread_exact(handle.file(), offset, &mut header_buf).unwrap();
        let header = EntryHeader::from_bytes(&header_buf).unwrap();
        assert_eq!(header.previous, offset);
    }

    #[test]
    fn second_insert_offset_follows_first_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open_log(&dir, 0);

        let first = log.insert(b"a", b"11").unwrap();
        let second = log.insert(b"bb", b"22").unwrap();

        let first_record_len = EntryHeader::SIZE as u64 + 1 + 2;
        assert_eq!(second, first + first_record_len);

        let handle = log.acquire(0).unwrap();
        let mut header_buf = [0u8; EntryHeader::SIZE];
        pread_exact(handle.file(), second, &mut header_buf).unwrap();
        let header = EntryHeader::from_bytes(&header_buf).unwrap();
        assert_eq!(header.previous, first);
    }

    #[test]
    fn insert_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open_log(&dir, 0);

        let offset = log.insert(b"greeting", b"hello world").unwrap();
        let payload = log.get(0, offset, 8, None).unwrap();
        assert_eq!(payload, b"hello world");

        let payload = log.get(0, offset, 8, Some(11)).unwrap();
        assert_eq!(payload, b"hello world");
    }

    #[test]
    fn insert_then_check_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open_log(&dir, 0);

        let offset = log.insert(b"k", b"payload bytes").unwrap();
        assert!(log.check(0, offset).is_ok());
    }

    #[test]
    fn corrupted_payload_fails_check() {
        use std::os::unix::fs::FileExt;

        let dir = tempfile::tempdir().unwrap();
        let mut log = open_log(&dir, 0);

        let offset = log.insert(b"k", b"payload bytes").unwrap();
        let corrupt_at = offset + EntryHeader::SIZE as u64 + 1;
        log.file.write_at(b"X", corrupt_at).unwrap();

        assert!(matches!(
            log.check(0, offset),
            Err(Error::IntegrityMismatch { .. })
        ));
    }

    #[test]
    fn match_key_rejects_wrong_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open_log(&dir, 0);

        let offset = log.insert(b"right-key", b"value").unwrap();
        assert!(matches!(
            log.match_key(0, offset, b"wrong-key"),
            Err(Error::ValidationMiss { .. })
        ));
        assert!(matches!(
            log.match_key(0, offset, b"short"),
            Err(Error::ValidationMiss { .. })
        ));
        assert_eq!(log.match_key(0, offset, b"right-key").unwrap(), 5);
    }

    #[test]
    fn delete_then_match_key_fails_but_get_still_works() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open_log(&dir, 0);

        let offset = log.insert(b"doomed", b"still here").unwrap();
        log.delete(0, offset).unwrap();

        assert!(matches!(
            log.match_key(0, offset, b"doomed"),
            Err(Error::ValidationMiss { .. })
        ));
        assert_eq!(log.get(0, offset, 6, Some(10)).unwrap(), b"still here");
    }

    #[test]
    fn reopen_recovers_next_offset() {
        let dir = tempfile::tempdir().unwrap();
        let last_offset = {
            let mut log = open_log(&dir, 0);
            log.insert(b"a", b"1").unwrap();
            log.insert(b"bb", b"22").unwrap();
            log.insert(b"ccc", b"333").unwrap()
        };

        let reopened = open_log(&dir, 0);
        assert_eq!(reopened.previous, last_offset);
    }

    #[test]
    fn rollover_switches_segment_and_resets_previous() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open_log(&dir, 0);
        log.insert(b"a", b"1").unwrap();

        let new_id = log.rollover(1).unwrap();
        assert_eq!(new_id, 1);
        assert_eq!(log.dataid(), 1);
        assert_eq!(log.previous, SegmentHeader::SIZE as u64);

        let offset = log.insert(b"b", b"2").unwrap();
        assert_eq!(offset, SegmentHeader::SIZE as u64);
    }

    #[test]
    fn back_pointer_chain_reaches_every_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open_log(&dir, 0);

        let mut offsets = Vec::new();
        for i in 0..5u8 {
            offsets.push(log.insert(&[i], &[i; 3]).unwrap());
        }

        let handle = log.acquire(0).unwrap();
        let mut cursor = *offsets.last().unwrap();
        let mut visited = Vec::new();
        loop {
            let mut header_buf = [0u8; EntryHeader::SIZE];
            pread_exact(handle.file(), cursor, &mut header_buf).unwrap();
            let header = EntryHeader::from_bytes(&header_buf).unwrap();
            visited.push(cursor);
            if header.previous == cursor {
                break;
            }
            cursor = header.previous;
        }

        visited.reverse();
        assert_eq!(visited, offsets);
    }

    #[test]
    fn rejects_key_longer_than_max() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open_log(&dir, 0);

        let key = vec![0u8; MAX_KEY_LENGTH + 1];
        assert!(matches!(
            log.insert(&key, b"v"),
            Err(Error::KeyTooLong { .. })
        ));
    }
}
