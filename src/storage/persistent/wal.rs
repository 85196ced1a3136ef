//! Write-Ahead Log (WAL) for crash recovery.
//!
//! The WAL provides durability by:
//! 1. Writing every committed transaction to an append-only log as one record
//! 2. Using fsync to ensure the record reaches disk
//! 3. Replaying the log on startup to recover state
//!
//! A transaction is a single record, so it is either fully present or absent
//! after a crash. A record cut short by a crash (torn tail) is discarded on
//! open; a checksum failure anywhere else is reported as corruption.
//!
//! # File Format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [ENTRY 1: codec-encoded WalEntry]
//! [ENTRY 2: codec-encoded WalEntry]
//! ...
//! ```

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Error as IoError, ErrorKind, Result as IoResult, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::codec;

/// A single entry in the write-ahead log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    /// Monotonically increasing sequence number.
    pub sequence: u64,
    /// When this entry was written.
    pub timestamp: DateTime<Utc>,
    /// All mutations of one committed transaction, applied in order.
    pub ops: Vec<WriteOp>,
}

/// One mutation of the key-value state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOp {
    /// Create a partition if it does not exist.
    CreatePartition { partition: String },
    /// Set `key` to `value`.
    Put {
        partition: String,
        key: String,
        value: String,
    },
    /// Remove `key`.
    Delete { partition: String, key: String },
    /// Set the partition's sequence counter.
    SetSequence { partition: String, value: u64 },
}

// Records are encoded whole before writing, so the file is written directly
// and a failed append never leaves bytes buffered in memory.
struct WalWriter {
    file: File,
    sequence: u64,
    // Set when a failed append could not be cut back off the file.
    broken: bool,
}

impl WalWriter {
    fn write_record(&mut self, bytes: &[u8], sync: bool) -> IoResult<()> {
        self.file.write_all(bytes)?;
        if sync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Undo a failed append by cutting the file back to `len`.
    fn discard_from(&mut self, len: u64) -> IoResult<()> {
        self.file.set_len(len)
    }
}

/// Write-Ahead Log for crash recovery.
///
/// Thread-safe via internal mutex.
pub struct WriteAheadLog {
    path: PathBuf,
    inner: Mutex<WalWriter>,
    sync_on_write: bool,
}

impl WriteAheadLog {
    /// Open or create a WAL file.
    ///
    /// An existing file is scanned to find its last sequence number; a torn
    /// final record is cut off so later appends start on a record boundary.
    ///
    /// # Errors
    /// Fails if the file is unreadable, has a foreign header, or contains a
    /// corrupted record before its tail.
    pub fn open(path: &Path, sync_on_write: bool) -> IoResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let sequence = if file.metadata()?.len() >= codec::HEADER_LEN {
            let scan = Self::scan(path)?;
            if let Some(valid_len) = scan.torn_at {
                warn!(
                    path = %path.display(),
                    valid_len,
                    last_sequence = scan.last_sequence,
                    "WAL: discarding torn record at tail"
                );
                file.set_len(valid_len)?;
                file.sync_all()?;
            }
            scan.last_sequence
        } else {
            // New (or header-less) file, write header
            let mut file = file;
            file.set_len(0)?;
            codec::write_header(&mut file)?;
            if sync_on_write {
                file.sync_all()?;
            }
            0
        };

        // Reopen for appending
        let file = OpenOptions::new().append(true).open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(WalWriter {
                file,
                sequence,
                broken: false,
            }),
            sync_on_write,
        })
    }

    fn lock(&self) -> IoResult<MutexGuard<'_, WalWriter>> {
        self.inner
            .lock()
            .map_err(|_| IoError::new(ErrorKind::Other, "poisoned lock: wal"))
    }

    /// Append one committed transaction to the WAL.
    ///
    /// Returns the sequence number assigned to it. The sequence only advances
    /// once the record is written (and synced, if configured).
    ///
    /// On failure the file is cut back to where the record started, so a
    /// rejected transaction never reappears on replay. If that cut fails too,
    /// every later append is refused until the WAL is reopened.
    pub fn append(&self, ops: Vec<WriteOp>) -> IoResult<u64> {
        let mut inner = self.lock()?;
        if inner.broken {
            return Err(IoError::new(
                ErrorKind::Other,
                "WAL refused write after an unrecoverable append failure; reopen the database",
            ));
        }

        let candidate = inner.sequence + 1;
        let entry = WalEntry {
            sequence: candidate,
            timestamp: Utc::now(),
            ops,
        };
        let encoded = codec::encode(&entry)?;

        let start = inner.file.metadata()?.len();
        if let Err(e) = inner.write_record(&encoded, self.sync_on_write) {
            Self::abandon(&mut inner, start, &self.path);
            return Err(e);
        }

        inner.sequence = candidate;
        Ok(candidate)
    }

    fn abandon(inner: &mut WalWriter, start: u64, path: &Path) {
        if let Err(e) = inner.discard_from(start) {
            warn!(
                path = %path.display(),
                offset = start,
                error = %e,
                "WAL: could not discard failed append; refusing further writes"
            );
            inner.broken = true;
        }
    }

    /// Iterate over all entries in the WAL.
    ///
    /// Used during recovery to replay mutations.
    pub fn iter(&self) -> IoResult<WalIterator> {
        WalIterator::new(&self.path)
    }

    /// Get the current sequence number.
    pub fn current_sequence(&self) -> IoResult<u64> {
        Ok(self.lock()?.sequence)
    }

    /// Ensure future entries are numbered after `sequence`.
    ///
    /// Called on open when a segment already covers sequences the (truncated)
    /// log no longer holds.
    pub fn advance_to(&self, sequence: u64) -> IoResult<()> {
        let mut inner = self.lock()?;
        inner.sequence = inner.sequence.max(sequence);
        Ok(())
    }

    /// Get the WAL file size in bytes.
    pub fn size_bytes(&self) -> IoResult<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    /// Drop every entry, keeping only the header.
    ///
    /// Sequence numbering continues from where it was.
    ///
    /// # Safety
    /// Only call this after the state the entries describe has been written
    /// to a finalized segment.
    pub fn truncate(&self) -> IoResult<()> {
        let inner = self.lock()?;
        inner.file.set_len(codec::HEADER_LEN)?;
        if self.sync_on_write {
            inner.file.sync_all()?;
        }
        Ok(())
    }

    fn scan(path: &Path) -> IoResult<ScanResult> {
        let mut iter = WalIterator::new(path)?;
        let mut last_sequence = 0;

        loop {
            let start = iter.position()?;
            match iter.read_next() {
                Ok(None) => {
                    return Ok(ScanResult {
                        last_sequence,
                        torn_at: None,
                    })
                }
                Ok(Some(entry)) => last_sequence = entry.sequence,
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    return Ok(ScanResult {
                        last_sequence,
                        torn_at: Some(start),
                    })
                }
                Err(e) => {
                    return Err(IoError::new(
                        e.kind(),
                        format!("corrupted WAL entry after sequence {last_sequence}: {e}"),
                    ))
                }
            }
        }
    }
}

struct ScanResult {
    last_sequence: u64,
    /// Offset of a trailing partial record, if any.
    torn_at: Option<u64>,
}

/// Iterator over WAL entries.
///
/// Stops silently at a torn final record; yields an error for corruption.
pub struct WalIterator {
    reader: BufReader<File>,
    file_size: u64,
}

impl WalIterator {
    fn new(path: &Path) -> IoResult<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        // Skip header
        let _version = codec::read_header(&mut reader)?;

        Ok(Self { reader, file_size })
    }

    fn position(&mut self) -> IoResult<u64> {
        self.reader.stream_position()
    }

    fn read_next(&mut self) -> IoResult<Option<WalEntry>> {
        if self.position()? >= self.file_size {
            return Ok(None);
        }
        codec::decode(&mut self.reader).map(Some)
    }
}

impl Iterator for WalIterator {
    type Item = IoResult<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_next() {
            Ok(entry) => entry.map(Ok),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => None,
            Err(e) => Some(Err(e)),
        }
    }
}
