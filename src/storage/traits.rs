//! Abstract storage contract for gameprofile.
//!
//! [`Storer`] is the one capability every backend implements:
//! - [`crate::storage::InMemoryStore`] for tests and as the reference model
//! - `DurableStore` (feature `persistent`) for embedded on-disk storage
//! - `RelationalStore` (feature `relational`) for SQL storage
//!
//! Backends are interchangeable; callers cannot observe which one is in use.

use thiserror::Error;

use crate::error::ValidationError;
use crate::profile::Profile;
use crate::punishment::{Punishment, PunishmentId, PunishmentSet};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No profile is stored under this ID.
    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    /// The player has zero punishments.
    #[error("No punishments found for player: {0}")]
    NoPunishments(String),

    /// No punishment with this ID exists for any player.
    #[error("Punishment not found: {0}")]
    PunishmentNotFound(PunishmentId),

    /// A required field was missing or malformed.
    #[error("Invalid argument: {0}")]
    InvalidArgument(#[from] ValidationError),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Underlying I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The SQL database reported an error.
    #[cfg(feature = "relational")]
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Coarse classification of a [`StorageError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// The requested entity does not exist.
    NotFound,
    /// A required field was missing.
    InvalidArgument,
    /// I/O, serialization, or query failure.
    Storage,
}

impl StorageError {
    /// Returns the taxonomy bucket of this error.
    #[must_use]
    pub const fn kind(&self) -> StorageErrorKind {
        match self {
            Self::ProfileNotFound(_) | Self::NoPunishments(_) | Self::PunishmentNotFound(_) => {
                StorageErrorKind::NotFound
            }
            Self::InvalidArgument(_) => StorageErrorKind::InvalidArgument,
            _ => StorageErrorKind::Storage,
        }
    }

    /// Returns true if the requested entity does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self.kind(), StorageErrorKind::NotFound)
    }
}

/// Storage trait for profiles and punishments.
///
/// # Semantics
/// - Every call is synchronous and may be invoked from many threads.
/// - A failed validation never mutates stored state.
/// - Absence is always an error, never an empty or zeroed value.
/// - Version tokens are not checked here; see [`crate::service`].
pub trait Storer: Send + Sync {
    /// Get a profile by player ID.
    ///
    /// # Errors
    /// `ProfileNotFound` if nothing is stored under `id`.
    fn get_profile(&self, id: &str) -> Result<Profile, StorageError>;

    /// Insert or overwrite a profile.
    ///
    /// # Errors
    /// `InvalidArgument` if the ID is empty.
    fn put_profile(&self, profile: Profile) -> Result<(), StorageError>;

    /// Get a player's punishments keyed by type.
    ///
    /// # Errors
    /// `NoPunishments` if the player has none. An empty set is never returned.
    fn get_punishments(&self, player_id: &str) -> Result<PunishmentSet, StorageError>;

    /// Store a punishment, replacing any existing one of the same type for
    /// the same player, and any existing one with the same ID.
    ///
    /// Returns the punishment's ID, freshly assigned if it was unassigned.
    ///
    /// # Errors
    /// `InvalidArgument` if `player_id`, `by`, or `type` is empty.
    fn put_punishment(&self, punishment: Punishment) -> Result<PunishmentId, StorageError>;

    /// Delete a punishment by ID, whichever player it belongs to.
    ///
    /// # Errors
    /// `PunishmentNotFound` if no punishment has this ID.
    fn del_punishment(&self, id: PunishmentId) -> Result<(), StorageError>;
}
