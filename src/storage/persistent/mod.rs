//! Persistent storage backend for gameprofile.
//!
//! This module provides durable, crash-safe storage with:
//! - Write-Ahead Logging (WAL) for crash recovery
//! - File locking for single-process ownership of a directory
//! - CRC32 checksums for corruption detection
//! - Snapshot segments so the WAL stays bounded
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       DurableStore                           │
//! │           (profiles / punishments partitions)                │
//! ├──────────────────────────────────────────────────────────────┤
//! │                         KvEngine                             │
//! │  ┌─────────────────┐  ┌─────────────────┐                    │
//! │  │ WriteAheadLog   │  │ SegmentManager  │                    │
//! │  │ (append-only)   │  │ (snapshots)     │                    │
//! │  └────────┬────────┘  └────────┬────────┘                    │
//! │           └──────────┬─────────┘                             │
//! │                      ↓                                       │
//! │           ┌─────────────────────┐                            │
//! │           │   FileLock (flock)  │                            │
//! │           └─────────────────────┘                            │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod codec;
mod engine;
mod file_lock;
mod segment;
mod store;
mod wal;

pub use engine::{CompactionResult, KvEngine, ReadTx, WriteTx, SEGMENTS_DIR, WAL_FILE};
pub use file_lock::{FileLock, LOCK_FILE};
pub use store::DurableStore;
pub use wal::{WalEntry, WriteAheadLog, WriteOp};

use std::path::Path;

use crate::storage::traits::StorageError;

/// Configuration for persistent storage.
#[derive(Debug, Clone)]
pub struct PersistentConfig {
    /// Maximum WAL size before automatic compaction (bytes).
    pub max_wal_size: u64,
    /// Whether to fsync after every write (slower but safer).
    pub sync_on_write: bool,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            max_wal_size: 64 * 1024 * 1024, // 64 MB
            sync_on_write: true,
        }
    }
}

impl PersistentConfig {
    /// Smallest accepted `max_wal_size`; anything lower compacts on nearly every write.
    pub const MIN_WAL_SIZE: u64 = 4 * 1024;

    /// Check the configuration, returning it unchanged if usable.
    ///
    /// # Errors
    /// `BackendError` if `max_wal_size` is below [`Self::MIN_WAL_SIZE`].
    pub fn validate(self) -> Result<Self, StorageError> {
        if self.max_wal_size < Self::MIN_WAL_SIZE {
            return Err(StorageError::BackendError(format!(
                "max_wal_size must be at least {} bytes (got {})",
                Self::MIN_WAL_SIZE,
                self.max_wal_size
            )));
        }
        Ok(self)
    }
}

/// Open or create a persistent gameprofile database at the given path.
///
/// # Arguments
/// * `path` - Directory to store the database files
/// * `config` - Optional configuration (uses defaults if None)
///
/// # Errors
/// - If the configuration is invalid
/// - If the path cannot be created or accessed
/// - If another handle holds the lock
/// - If WAL replay fails due to corruption
///
/// # Example
/// ```rust,no_run
/// use gameprofile::storage::persistent::open_database;
/// use gameprofile::{Profile, Storer};
///
/// let store = open_database("./profiles.db", None)?;
/// store.put_profile(Profile::new("p1").with_coins(100))?;
/// # Ok::<(), gameprofile::StorageError>(())
/// ```
pub fn open_database(
    path: impl AsRef<Path>,
    config: Option<PersistentConfig>,
) -> Result<DurableStore, StorageError> {
    DurableStore::open(path.as_ref(), config.unwrap_or_default())
}
