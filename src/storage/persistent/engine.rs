//! Transactional key-value engine.
//!
//! The engine holds named partitions, each a flat `String -> String` key space
//! with its own sequence counter, in memory, and makes them durable through
//! the WAL and snapshot segments.
//!
//! All access goes through closures:
//! - [`KvEngine::view`] runs a read-only transaction under a shared lock
//! - [`KvEngine::update`] runs a read-write transaction under an exclusive lock
//!
//! Read-write transactions are serialized. Their mutations are applied to the
//! in-memory state as they happen (so a transaction reads its own writes),
//! recorded, and committed as a single WAL record when the closure returns
//! `Ok`. If the closure fails or the WAL write fails, every mutation is rolled
//! back, so a partial transaction is never observable.

use std::collections::BTreeMap;
use std::fs;
use std::io::Error as IoError;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::storage::traits::StorageError;

use super::file_lock::FileLock;
use super::segment::{SegmentData, SegmentManager};
use super::wal::{WriteAheadLog, WriteOp};
use super::PersistentConfig;

/// Name of the WAL file inside a database directory.
pub const WAL_FILE: &str = "gameprofile.wal";

/// Name of the segment directory inside a database directory.
pub const SEGMENTS_DIR: &str = "segments";

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

fn io_context(e: IoError, context: impl std::fmt::Display) -> StorageError {
    StorageError::Io(IoError::new(e.kind(), format!("{context}: {e}")))
}

fn missing_partition(name: &str) -> StorageError {
    StorageError::BackendError(format!("partition not found: {name}"))
}

/// One named key space.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    /// Keys to serialized documents.
    pub entries: BTreeMap<String, String>,
    /// Last value handed out by [`WriteTx::next_sequence`].
    pub sequence: u64,
}

#[derive(Debug, Default)]
struct KvState {
    partitions: BTreeMap<String, Partition>,
}

enum Undo {
    DropPartition(String),
    Restore {
        partition: String,
        key: String,
        prev: Option<String>,
    },
    Sequence {
        partition: String,
        prev: u64,
    },
}

impl KvState {
    fn partition(&self, name: &str) -> Result<&Partition, StorageError> {
        self.partitions.get(name).ok_or_else(|| missing_partition(name))
    }

    /// Apply one op, returning what is needed to revert it.
    fn apply(&mut self, op: &WriteOp) -> Option<Undo> {
        match op {
            WriteOp::CreatePartition { partition } => {
                if self.partitions.contains_key(partition) {
                    return None;
                }
                self.partitions.insert(partition.clone(), Partition::default());
                Some(Undo::DropPartition(partition.clone()))
            }
            WriteOp::Put {
                partition,
                key,
                value,
            } => {
                let prev = self
                    .partitions
                    .entry(partition.clone())
                    .or_default()
                    .entries
                    .insert(key.clone(), value.clone());
                Some(Undo::Restore {
                    partition: partition.clone(),
                    key: key.clone(),
                    prev,
                })
            }
            WriteOp::Delete { partition, key } => {
                let prev = self.partitions.get_mut(partition)?.entries.remove(key);
                Some(Undo::Restore {
                    partition: partition.clone(),
                    key: key.clone(),
                    prev,
                })
            }
            WriteOp::SetSequence { partition, value } => {
                let p = self.partitions.entry(partition.clone()).or_default();
                let prev = p.sequence;
                p.sequence = prev.max(*value);
                Some(Undo::Sequence {
                    partition: partition.clone(),
                    prev,
                })
            }
        }
    }

    fn revert(&mut self, undo: Vec<Undo>) {
        for step in undo.into_iter().rev() {
            match step {
                Undo::DropPartition(name) => {
                    self.partitions.remove(&name);
                }
                Undo::Restore {
                    partition,
                    key,
                    prev,
                } => {
                    if let Some(p) = self.partitions.get_mut(&partition) {
                        match prev {
                            Some(value) => p.entries.insert(key, value),
                            None => p.entries.remove(&key),
                        };
                    }
                }
                Undo::Sequence { partition, prev } => {
                    if let Some(p) = self.partitions.get_mut(&partition) {
                        p.sequence = prev;
                    }
                }
            }
        }
    }
}

/// Read-only view of the engine state.
pub struct ReadTx<'a> {
    state: &'a KvState,
}

impl<'a> ReadTx<'a> {
    /// Get the document stored under `key`.
    pub fn get(&self, partition: &str, key: &str) -> Result<Option<&'a str>, StorageError> {
        Ok(self
            .state
            .partition(partition)?
            .entries
            .get(key)
            .map(String::as_str))
    }

    /// Iterate over every key of a partition in key order.
    pub fn scan(
        &self,
        partition: &str,
    ) -> Result<impl Iterator<Item = (&'a str, &'a str)> + 'a, StorageError> {
        Ok(self
            .state
            .partition(partition)?
            .entries
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str())))
    }

    /// Number of keys in a partition.
    pub fn len(&self, partition: &str) -> Result<usize, StorageError> {
        Ok(self.state.partition(partition)?.entries.len())
    }

    /// Current sequence value of a partition.
    pub fn sequence(&self, partition: &str) -> Result<u64, StorageError> {
        Ok(self.state.partition(partition)?.sequence)
    }
}

/// Read-write transaction.
pub struct WriteTx<'a> {
    state: &'a mut KvState,
    ops: Vec<WriteOp>,
    undo: Vec<Undo>,
}

impl<'a> WriteTx<'a> {
    fn new(state: &'a mut KvState) -> Self {
        Self {
            state,
            ops: Vec::new(),
            undo: Vec::new(),
        }
    }

    fn record(&mut self, op: WriteOp) {
        if let Some(undo) = self.state.apply(&op) {
            self.undo.push(undo);
        }
        self.ops.push(op);
    }

    /// Create a partition unless it already exists.
    pub fn create_partition_if_not_exists(&mut self, partition: &str) {
        if !self.state.partitions.contains_key(partition) {
            self.record(WriteOp::CreatePartition {
                partition: partition.to_string(),
            });
        }
    }

    /// Get the document stored under `key`, including this transaction's writes.
    pub fn get(&self, partition: &str, key: &str) -> Result<Option<&str>, StorageError> {
        Ok(self
            .state
            .partition(partition)?
            .entries
            .get(key)
            .map(String::as_str))
    }

    /// Iterate over every key of a partition in key order, including this
    /// transaction's writes.
    pub fn scan(
        &self,
        partition: &str,
    ) -> Result<impl Iterator<Item = (&str, &str)> + '_, StorageError> {
        Ok(self
            .state
            .partition(partition)?
            .entries
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str())))
    }

    /// Set `key` to `value`.
    pub fn put(&mut self, partition: &str, key: &str, value: String) -> Result<(), StorageError> {
        self.state.partition(partition)?;
        self.record(WriteOp::Put {
            partition: partition.to_string(),
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    /// Remove `key`. Returns whether it was present.
    pub fn delete(&mut self, partition: &str, key: &str) -> Result<bool, StorageError> {
        if !self.state.partition(partition)?.entries.contains_key(key) {
            return Ok(false);
        }
        self.record(WriteOp::Delete {
            partition: partition.to_string(),
            key: key.to_string(),
        });
        Ok(true)
    }

    /// Advance the partition's sequence and return the new value (starts at 1).
    pub fn next_sequence(&mut self, partition: &str) -> Result<u64, StorageError> {
        let next = self.state.partition(partition)?.sequence + 1;
        self.record(WriteOp::SetSequence {
            partition: partition.to_string(),
            value: next,
        });
        Ok(next)
    }

    /// Raise the partition's sequence to at least `value`.
    pub fn bump_sequence(&mut self, partition: &str, value: u64) -> Result<(), StorageError> {
        if self.state.partition(partition)?.sequence < value {
            self.record(WriteOp::SetSequence {
                partition: partition.to_string(),
                value,
            });
        }
        Ok(())
    }

    fn into_parts(self) -> (Vec<WriteOp>, Vec<Undo>) {
        (self.ops, self.undo)
    }
}

/// Result of a compaction.
#[derive(Debug, Clone)]
pub struct CompactionResult {
    /// Number of keys written to the new segment.
    pub entries_compacted: u64,
    /// Path to the new segment file (if created).
    pub segment_path: Option<PathBuf>,
    /// WAL size before compaction.
    pub wal_size_before: u64,
    /// WAL size after compaction.
    pub wal_size_after: u64,
}

/// Embedded transactional key-value engine.
///
/// One engine exclusively owns its directory for as long as it is open.
pub struct KvEngine {
    dir: PathBuf,
    _lock: FileLock,
    wal: WriteAheadLog,
    segments: Mutex<SegmentManager>,
    state: RwLock<KvState>,
    config: PersistentConfig,
}

impl KvEngine {
    /// Open or create an engine in `dir`.
    ///
    /// # Errors
    /// - If `config` fails [`PersistentConfig::validate`] (nothing is touched on disk)
    /// - If the directory cannot be created or accessed
    /// - If another handle holds the directory lock (fails immediately)
    /// - If a segment or a non-tail WAL record is corrupted
    pub fn open(dir: &Path, config: PersistentConfig) -> Result<Self, StorageError> {
        let config = config.validate()?;
        fs::create_dir_all(dir)
            .map_err(|e| io_context(e, "failed to create database directory"))?;

        let lock = FileLock::acquire(dir)
            .map_err(|e| io_context(e, format!("failed to acquire lock on {}", dir.display())))?;

        let segments = SegmentManager::open(&dir.join(SEGMENTS_DIR))
            .map_err(|e| io_context(e, "failed to open segments"))?;
        let persisted = segments.persisted_sequence();

        let mut state = KvState::default();
        if let Some(data) = segments
            .load_latest()
            .map_err(|e| io_context(e, "failed to load segment data"))?
        {
            state.partitions = data.partitions;
        }

        let wal = WriteAheadLog::open(&dir.join(WAL_FILE), config.sync_on_write)
            .map_err(|e| io_context(e, "failed to open WAL"))?;
        wal.advance_to(persisted)
            .map_err(|e| io_context(e, "failed to open WAL"))?;

        let replayed = Self::replay(&wal, &mut state, persisted)?;
        if replayed > 0 {
            info!(dir = %dir.display(), replayed, "replayed WAL entries");
        }
        debug!(
            dir = %dir.display(),
            persisted_sequence = persisted,
            partitions = state.partitions.len(),
            "opened key-value engine"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            _lock: lock,
            wal,
            segments: Mutex::new(segments),
            state: RwLock::new(state),
            config,
        })
    }

    fn replay(wal: &WriteAheadLog, state: &mut KvState, persisted: u64) -> Result<usize, StorageError> {
        let iter = wal.iter().map_err(|e| io_context(e, "failed to iterate WAL"))?;

        let mut count = 0;
        for entry_result in iter {
            let entry = entry_result.map_err(|e| io_context(e, "corrupted WAL entry"))?;
            // Already part of the snapshot (crash between segment install and truncate).
            if entry.sequence <= persisted {
                continue;
            }
            for op in &entry.ops {
                state.apply(op);
            }
            count += 1;
        }
        Ok(count)
    }

    /// Get the database directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Run a read-only transaction.
    pub fn view<T>(
        &self,
        f: impl FnOnce(&ReadTx<'_>) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("kv.view"))?;
        f(&ReadTx { state: &state })
    }

    /// Run a read-write transaction and commit it atomically.
    ///
    /// The closure's mutations become durable and visible together when it
    /// returns `Ok`; on `Err` none of them take effect.
    pub fn update<T>(
        &self,
        f: impl FnOnce(&mut WriteTx<'_>) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("kv.update"))?;

        let mut tx = WriteTx::new(&mut state);
        let result = f(&mut tx);
        let (ops, undo) = tx.into_parts();

        let value = match result {
            Ok(value) => value,
            Err(e) => {
                state.revert(undo);
                return Err(e);
            }
        };

        if ops.is_empty() {
            return Ok(value);
        }

        if let Err(e) = self.wal.append(ops) {
            state.revert(undo);
            return Err(io_context(e, "WAL write failed"));
        }

        self.maybe_compact(&state);
        Ok(value)
    }

    fn maybe_compact(&self, state: &KvState) {
        let size = match self.wal.size_bytes() {
            Ok(size) => size,
            Err(e) => {
                warn!(error = %e, "failed to stat WAL");
                return;
            }
        };
        if size <= self.config.max_wal_size {
            return;
        }
        // The commit that triggered this is already durable in the WAL.
        if let Err(e) = self.compact_locked(state) {
            warn!(error = %e, wal_size = size, "automatic compaction failed");
        }
    }

    /// Snapshot the current state into a new segment and truncate the WAL.
    ///
    /// This is safe to call at any time: if it fails partway through, the WAL
    /// still holds every commit and is replayed on next open.
    pub fn compact(&self) -> Result<CompactionResult, StorageError> {
        let state = self.state.write().map_err(|_| lock_err("kv.compact"))?;
        self.compact_locked(&state)
    }

    fn compact_locked(&self, state: &KvState) -> Result<CompactionResult, StorageError> {
        let mut segments = self.segments.lock().map_err(|_| lock_err("kv.segments"))?;

        let current_seq = self
            .wal
            .current_sequence()
            .map_err(|e| io_context(e, "failed to read WAL sequence"))?;
        let wal_size_before = self.wal.size_bytes().unwrap_or(0);

        if current_seq == segments.persisted_sequence() {
            return Ok(CompactionResult {
                entries_compacted: 0,
                segment_path: None,
                wal_size_before,
                wal_size_after: wal_size_before,
            });
        }

        let data = SegmentData {
            partitions: state.partitions.clone(),
        };
        let entries_compacted = data.entry_count();

        let segment = segments
            .create_segment_writer()
            .and_then(|writer| writer.finish(&data, current_seq))
            .map_err(|e| io_context(e, "failed to write segment"))?;
        let segment_path = segment.path().to_path_buf();
        segments
            .install(segment)
            .map_err(|e| io_context(e, "failed to install segment"))?;

        self.wal
            .truncate()
            .map_err(|e| io_context(e, "failed to truncate WAL"))?;

        let wal_size_after = self.wal.size_bytes().unwrap_or(0);
        info!(
            entries = entries_compacted,
            sequence = current_seq,
            wal_size_before,
            wal_size_after,
            "compacted WAL into segment"
        );

        Ok(CompactionResult {
            entries_compacted,
            segment_path: Some(segment_path),
            wal_size_before,
            wal_size_after,
        })
    }

    /// Get the current WAL size in bytes.
    pub fn wal_size(&self) -> u64 {
        self.wal.size_bytes().unwrap_or(0)
    }

    /// Get the number of segment files.
    pub fn segment_count(&self) -> usize {
        self.segments.lock().map_or(0, |s| s.segments().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open(dir: &Path) -> KvEngine {
        let engine = KvEngine::open(dir, PersistentConfig::default()).unwrap();
        engine
            .update(|tx| {
                tx.create_partition_if_not_exists("things");
                Ok(())
            })
            .unwrap();
        engine
    }

    #[test]
    fn test_put_get_across_reopen() {
        let dir = tempdir().unwrap();
        {
            let engine = open(dir.path());
            engine
                .update(|tx| tx.put("things", "a", "1".to_string()))
                .unwrap();
        }
        let engine = open(dir.path());
        let value = engine
            .view(|tx| Ok(tx.get("things", "a")?.map(str::to_string)))
            .unwrap();
        assert_eq!(value.as_deref(), Some("1"));
    }

    #[test]
    fn test_write_scan_sees_own_writes_in_key_order() {
        let dir = tempdir().unwrap();
        let engine = open(dir.path());
        engine
            .update(|tx| tx.put("things", "b", "2".to_string()))
            .unwrap();
        let keys = engine
            .update(|tx| {
                tx.put("things", "a", "1".to_string())?;
                tx.delete("things", "b")?;
                tx.put("things", "c", "3".to_string())?;
                Ok(tx
                    .scan("things")?
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>())
            })
            .unwrap();
        assert_eq!(keys, ["a=1", "c=3"]);
    }

    #[test]
    fn test_failed_update_rolls_back_everything() {
        let dir = tempdir().unwrap();
        let engine = open(dir.path());
        engine
            .update(|tx| tx.put("things", "keep", "old".to_string()))
            .unwrap();
        let wal_before = engine.wal_size();

        let err = engine
            .update(|tx| {
                tx.put("things", "keep", "new".to_string())?;
                tx.put("things", "extra", "x".to_string())?;
                tx.next_sequence("things")?;
                tx.create_partition_if_not_exists("scratch");
                Err::<(), _>(StorageError::BackendError("abort".to_string()))
            })
            .unwrap_err();
        assert!(err.to_string().contains("abort"));

        engine
            .view(|tx| {
                assert_eq!(tx.get("things", "keep")?, Some("old"));
                assert_eq!(tx.get("things", "extra")?, None);
                assert_eq!(tx.sequence("things")?, 0);
                assert!(tx.len("scratch").is_err());
                Ok(())
            })
            .unwrap();
        assert_eq!(engine.wal_size(), wal_before);
    }

    #[test]
    fn test_transaction_reads_its_own_writes() {
        let dir = tempdir().unwrap();
        let engine = open(dir.path());
        let seen = engine
            .update(|tx| {
                tx.put("things", "a", "1".to_string())?;
                Ok(tx.get("things", "a")?.map(str::to_string))
            })
            .unwrap();
        assert_eq!(seen.as_deref(), Some("1"));
    }

    #[test]
    fn test_missing_partition_is_an_error() {
        let dir = tempdir().unwrap();
        let engine = open(dir.path());
        assert!(engine.update(|tx| tx.put("nope", "a", "1".to_string())).is_err());
        assert!(engine.view(|tx| tx.get("nope", "a").map(|_| ())).is_err());
    }

    #[test]
    fn test_sequence_survives_delete_and_compaction() {
        let dir = tempdir().unwrap();
        {
            let engine = open(dir.path());
            let first = engine.update(|tx| tx.next_sequence("things")).unwrap();
            let second = engine.update(|tx| tx.next_sequence("things")).unwrap();
            assert_eq!((first, second), (1, 2));
            engine.compact().unwrap();
            engine.update(|tx| tx.bump_sequence("things", 10)).unwrap();
        }
        let engine = open(dir.path());
        assert_eq!(engine.update(|tx| tx.next_sequence("things")).unwrap(), 11);
    }

    #[test]
    fn test_compaction_truncates_wal_and_keeps_deletes() {
        let dir = tempdir().unwrap();
        {
            let engine = open(dir.path());
            for i in 0..10 {
                engine
                    .update(|tx| tx.put("things", &format!("k{i}"), i.to_string()))
                    .unwrap();
            }
            let result = engine.compact().unwrap();
            assert_eq!(result.entries_compacted, 10);
            assert!(result.wal_size_after < result.wal_size_before);
            assert_eq!(engine.segment_count(), 1);

            engine.update(|tx| tx.delete("things", "k3")).unwrap();
            engine.compact().unwrap();
            assert_eq!(engine.segment_count(), 1);

            let again = engine.compact().unwrap();
            assert!(again.segment_path.is_none());
        }
        let engine = open(dir.path());
        engine
            .view(|tx| {
                assert_eq!(tx.len("things")?, 9);
                assert_eq!(tx.get("things", "k3")?, None);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_automatic_compaction_when_wal_grows() {
        let dir = tempdir().unwrap();
        let config = PersistentConfig {
            max_wal_size: PersistentConfig::MIN_WAL_SIZE,
            sync_on_write: false,
        };
        {
            let engine = KvEngine::open(dir.path(), config.clone()).unwrap();
            engine
                .update(|tx| {
                    tx.create_partition_if_not_exists("things");
                    Ok(())
                })
                .unwrap();
            let blob = "x".repeat(512);
            for i in 0..20 {
                engine
                    .update(|tx| tx.put("things", &format!("k{i}"), blob.clone()))
                    .unwrap();
            }
            assert!(engine.segment_count() >= 1);
            assert!(engine.wal_size() <= config.max_wal_size + 1024);
        }
        let engine = KvEngine::open(dir.path(), config).unwrap();
        assert_eq!(engine.view(|tx| tx.len("things")).unwrap(), 20);
    }
}
