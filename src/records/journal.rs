//! Append-only journal of committed batches.
//!
//! Layout of a journal directory:
//! - `MANIFEST`: magic + format version
//! - `LOCK`: held exclusively while a store has the journal open
//! - `journal.log`: one framed entry per committed batch
//!
//! Entry framing (little endian):
//! `magic(4) version(1) sequence(8) timestamp(8) len(4) payload(len) crc32(4)`
//! where the payload is the batch's operations encoded as MessagePack.

use crate::error::{Result, StoreError};
use crate::transaction::Operation;
use crate::types::{Sequence, Timestamp};
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, warn};

/// Magic bytes for the journal manifest.
const MANIFEST_MAGIC: &[u8; 4] = b"LTD\0";

/// Magic bytes at the start of every entry.
const ENTRY_MAGIC: &[u8; 4] = b"TXB\0";

/// Current journal format version.
const JOURNAL_VERSION: u8 = 1;

/// Fixed bytes before the payload.
const ENTRY_HEADER_SIZE: usize = 4 + 1 + 8 + 8 + 4;

/// Bytes after the payload.
const ENTRY_TRAILER_SIZE: usize = 4;

const JOURNAL_FILE: &str = "journal.log";

/// One committed batch as stored on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JournalEntry {
    pub sequence: Sequence,
    pub timestamp: Timestamp,
    pub operations: Vec<Operation>,
}

struct JournalFile {
    file: File,
    size: u64,
    writes_since_sync: u64,
    /// Set when a failed append could not be rolled back.
    poisoned: bool,
}

/// Append-only journal.
pub struct Journal {
    /// Journal directory.
    path: PathBuf,

    /// Lock file for exclusive access.
    _lock_file: File,

    inner: Mutex<JournalFile>,

    /// Sync every N appends (0 and 1 both mean every append).
    sync_interval: u64,

    /// Makes the next sync fail.
    #[cfg(test)]
    pub(crate) fail_next_sync: AtomicBool,
}

impl Journal {
    /// Open or create a journal directory.
    ///
    /// Returns the journal positioned for appending plus every intact entry,
    /// oldest first. A torn entry at the end of the file (an interrupted
    /// write) is truncated away.
    pub fn open(path: impl AsRef<Path>, sync_interval: u64) -> Result<(Self, Vec<JournalEntry>)> {
        let path = path.as_ref().to_path_buf();

        if path.join("MANIFEST").exists() {
            Self::verify_manifest(&path)?;
        } else {
            fs::create_dir_all(&path)?;
            Self::write_manifest(&path)?;
        }

        let lock_file = Self::acquire_lock(&path)?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(JOURNAL_FILE))?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let (entries, valid_len) = Self::decode_entries(&bytes)?;
        if valid_len < bytes.len() as u64 {
            warn!(
                path = %path.display(),
                discarded = bytes.len() as u64 - valid_len,
                "truncating torn journal entry"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::Start(valid_len))?;

        debug!(path = %path.display(), entries = entries.len(), "journal opened");

        let journal = Self {
            path,
            _lock_file: lock_file,
            inner: Mutex::new(JournalFile {
                file,
                size: valid_len,
                writes_since_sync: 0,
                poisoned: false,
            }),
            sync_interval: sync_interval.max(1),
            #[cfg(test)]
            fail_next_sync: AtomicBool::new(false),
        };

        Ok((journal, entries))
    }

    /// Append a committed batch.
    ///
    /// The entry is written with a single `write_all`. If the write or the
    /// following sync fails, the file is cut back to its previous length, so
    /// an entry is either durable or absent. If that cut fails too, the
    /// journal refuses further appends until it is reopened.
    pub fn append(&self, entry: &JournalEntry) -> Result<()> {
        let frame = Self::encode_entry(entry)?;
        let mut inner = self.inner.lock();

        if inner.poisoned {
            return Err(StoreError::Transaction(
                "journal must be reopened after a failed rollback".into(),
            ));
        }

        let offset = inner.size;
        if let Err(e) = inner.file.write_all(&frame) {
            Self::rollback(&mut inner, offset);
            return Err(e.into());
        }

        if inner.writes_since_sync + 1 >= self.sync_interval {
            if let Err(e) = self.sync_data(&inner.file) {
                Self::rollback(&mut inner, offset);
                return Err(e.into());
            }
            inner.writes_since_sync = 0;
        } else {
            inner.writes_since_sync += 1;
        }

        inner.size += frame.len() as u64;
        Ok(())
    }

    /// Cut the file back to `offset` after a failed append.
    fn rollback(inner: &mut JournalFile, offset: u64) {
        let restored = inner
            .file
            .set_len(offset)
            .and_then(|_| inner.file.seek(SeekFrom::Start(offset)));
        if let Err(e) = restored {
            error!(offset, error = %e, "journal rollback failed");
            inner.poisoned = true;
        }
        inner.size = offset;
    }

    fn sync_data(&self, file: &File) -> std::io::Result<()> {
        #[cfg(test)]
        if self.fail_next_sync.swap(false, Ordering::SeqCst) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected sync failure",
            ));
        }
        file.sync_data()
    }

    /// Force sync all pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.file.sync_all()?;
        inner.writes_since_sync = 0;
        Ok(())
    }

    /// Current journal file size in bytes.
    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn encode_entry(entry: &JournalEntry) -> Result<Vec<u8>> {
        let payload = rmp_serde::to_vec_named(&entry.operations)?;
        let len = u32::try_from(payload.len())
            .map_err(|_| StoreError::Serialization("journal entry too large".into()))?;

        let mut frame = Vec::with_capacity(ENTRY_HEADER_SIZE + payload.len() + ENTRY_TRAILER_SIZE);
        frame.extend_from_slice(ENTRY_MAGIC);
        frame.push(JOURNAL_VERSION);
        frame.extend_from_slice(&entry.sequence.0.to_le_bytes());
        frame.extend_from_slice(&entry.timestamp.0.to_le_bytes());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        Ok(frame)
    }

    /// Decode consecutive entries. Returns the entries and the length of the
    /// intact prefix of `bytes`.
    fn decode_entries(bytes: &[u8]) -> Result<(Vec<JournalEntry>, u64)> {
        let mut entries = Vec::new();
        let mut offset = 0usize;

        while offset < bytes.len() {
            let rest = &bytes[offset..];
            if rest.len() < ENTRY_HEADER_SIZE {
                break;
            }

            if &rest[0..4] != ENTRY_MAGIC {
                return Err(StoreError::InvalidFormat(format!(
                    "Invalid journal entry magic at offset {}",
                    offset
                )));
            }
            if rest[4] != JOURNAL_VERSION {
                return Err(StoreError::InvalidFormat(format!(
                    "Unsupported journal version: {}",
                    rest[4]
                )));
            }

            let sequence = Sequence(u64::from_le_bytes(le_array(&rest[5..13])));
            let timestamp = Timestamp(i64::from_le_bytes(le_array(&rest[13..21])));
            let len = u32::from_le_bytes(le_array(&rest[21..25])) as usize;

            let total = ENTRY_HEADER_SIZE + len + ENTRY_TRAILER_SIZE;
            if rest.len() < total {
                break;
            }

            let payload = &rest[ENTRY_HEADER_SIZE..ENTRY_HEADER_SIZE + len];
            let expected = u32::from_le_bytes(le_array(&rest[ENTRY_HEADER_SIZE + len..total]));
            let got = crc32fast::hash(payload);
            if expected != got {
                return Err(StoreError::ChecksumMismatch {
                    sequence,
                    expected,
                    got,
                });
            }

            let operations: Vec<Operation> = rmp_serde::from_slice(payload)?;
            entries.push(JournalEntry {
                sequence,
                timestamp,
                operations,
            });
            offset += total;
        }

        Ok((entries, offset as u64))
    }

    fn write_manifest(path: &Path) -> Result<()> {
        let mut file = File::create(path.join("MANIFEST"))?;

        file.write_all(MANIFEST_MAGIC)?;
        file.write_all(&[JOURNAL_VERSION])?;
        file.sync_all()?;

        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        let mut file = File::open(path.join("MANIFEST"))?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != MANIFEST_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid journal magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != JOURNAL_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported journal version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;

        Ok(lock_file)
    }
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TodoFields, TodoId, TodoPatch};
    use tempfile::TempDir;

    fn entry(seq: u64) -> JournalEntry {
        JournalEntry {
            sequence: Sequence(seq),
            timestamp: Timestamp(1_700_000_000_000 + seq as i64),
            operations: vec![
                Operation::Create {
                    id: TodoId::new(format!("t{}", seq)),
                    fields: TodoFields::new("write tests", Timestamp(seq as i64)),
                },
                Operation::Update {
                    id: TodoId::new(format!("t{}", seq)),
                    patch: TodoPatch::done(true),
                },
            ],
        }
    }

    #[test]
    fn test_append_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal");

        {
            let (journal, entries) = Journal::open(&path, 1).unwrap();
            assert!(entries.is_empty());
            journal.append(&entry(1)).unwrap();
            journal.append(&entry(2)).unwrap();
            assert!(journal.size() > 0);
        }

        let (_journal, entries) = Journal::open(&path, 1).unwrap();
        assert_eq!(entries, vec![entry(1), entry(2)]);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal");

        let good_len = {
            let (journal, _) = Journal::open(&path, 1).unwrap();
            journal.append(&entry(1)).unwrap();
            journal.size()
        };

        // Simulate a crash halfway through the second entry.
        let frame = Journal::encode_entry(&entry(2)).unwrap();
        let mut file = OpenOptions::new()
            .append(true)
            .open(path.join(JOURNAL_FILE))
            .unwrap();
        file.write_all(&frame[..frame.len() / 2]).unwrap();
        drop(file);

        let (journal, entries) = Journal::open(&path, 1).unwrap();
        assert_eq!(entries, vec![entry(1)]);
        assert_eq!(journal.size(), good_len);
    }

    #[test]
    fn test_failed_sync_leaves_no_entry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal");

        {
            let (journal, _) = Journal::open(&path, 1).unwrap();
            journal.append(&entry(1)).unwrap();
            let size = journal.size();

            journal.fail_next_sync.store(true, Ordering::SeqCst);
            assert!(journal.append(&entry(2)).is_err());
            assert_eq!(journal.size(), size);
            assert_eq!(fs::metadata(path.join(JOURNAL_FILE)).unwrap().len(), size);

            // The same sequence can be appended again once syncing works.
            journal.append(&entry(2)).unwrap();
        }

        let (_journal, entries) = Journal::open(&path, 1).unwrap();
        assert_eq!(entries, vec![entry(1), entry(2)]);
    }

    #[test]
    fn test_checksum_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal");

        {
            let (journal, _) = Journal::open(&path, 1).unwrap();
            journal.append(&entry(1)).unwrap();
        }

        let log_path = path.join(JOURNAL_FILE);
        let mut bytes = fs::read(&log_path).unwrap();
        bytes[ENTRY_HEADER_SIZE + 2] ^= 0xff;
        fs::write(&log_path, bytes).unwrap();

        let result = Journal::open(&path, 1);
        assert!(matches!(result, Err(StoreError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_exclusive_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal");

        let _first = Journal::open(&path, 1).unwrap();
        let second = Journal::open(&path, 1);
        assert!(matches!(second, Err(StoreError::Locked)));
    }

    #[test]
    fn test_bad_manifest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal");
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join("MANIFEST"), b"NOPE\x01").unwrap();

        let result = Journal::open(&path, 1);
        assert!(matches!(result, Err(StoreError::InvalidFormat(_))));
    }
}
