//! Storage backends for gameprofile.
//!
//! [`Storer`] is the contract; this module provides three implementations and
//! a way to pick one at startup:
//! - [`InMemoryStore`]: process-local, for tests and embedding
//! - [`DurableStore`] (feature `persistent`): embedded WAL-backed store
//! - [`RelationalStore`] (feature `relational`): SQLite

mod memory;
#[cfg(feature = "persistent")]
pub mod persistent;
#[cfg(feature = "relational")]
pub mod relational;
mod traits;

#[cfg(feature = "persistent")]
use std::path::PathBuf;
use std::sync::Arc;

pub use memory::InMemoryStore;
#[cfg(feature = "persistent")]
pub use persistent::{DurableStore, PersistentConfig};
#[cfg(feature = "relational")]
pub use relational::{RelationalConfig, RelationalStore};
pub use traits::{StorageError, StorageErrorKind, Storer};

/// Which backend to open, and how.
#[derive(Debug, Clone)]
pub enum StoreConfig {
    /// Process-local maps; nothing survives the process.
    InMemory,
    /// Embedded durable store in `dir`.
    #[cfg(feature = "persistent")]
    Persistent {
        /// Database directory (created if missing).
        dir: PathBuf,
        /// Engine settings.
        config: PersistentConfig,
    },
    /// SQLite database.
    #[cfg(feature = "relational")]
    Relational(RelationalConfig),
}

impl StoreConfig {
    /// Durable store in `dir` with default settings.
    #[cfg(feature = "persistent")]
    pub fn persistent(dir: impl Into<PathBuf>) -> Self {
        Self::Persistent {
            dir: dir.into(),
            config: PersistentConfig::default(),
        }
    }
}

/// Open the configured backend.
///
/// # Errors
/// Whatever the chosen backend reports on open: invalid configuration, a
/// held directory lock, corruption, or a database that cannot be opened.
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn Storer>, StorageError> {
    let store: Arc<dyn Storer> = match config {
        StoreConfig::InMemory => Arc::new(InMemoryStore::new()),
        #[cfg(feature = "persistent")]
        StoreConfig::Persistent { dir, config } => {
            Arc::new(persistent::open_database(dir, Some(config.clone()))?)
        }
        #[cfg(feature = "relational")]
        StoreConfig::Relational(config) => Arc::new(RelationalStore::open(config)?),
    };
    Ok(store)
}
