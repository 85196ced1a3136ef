//! Error types for gameprofile.
//!
//! Input validation failures and calling-layer failures are strongly typed
//! using thiserror. Storage failures live in [`crate::storage::StorageError`]
//! and are wrapped here when they surface through [`crate::service`].

use thiserror::Error;

use crate::service::VersionedProfile;
use crate::storage::{StorageError, StorageErrorKind};

/// Validation errors that occur when a record is handed to a backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Profile ID cannot be empty")]
    EmptyProfileId,

    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },

    #[error("Punishment ID {id} is negative")]
    NegativePunishmentId {
        id: i64,
    },

    #[error("Punishment listed under type '{key}' has type '{kind}'")]
    TypeKeyMismatch {
        key: String,
        kind: String,
    },
}

impl ValidationError {
    pub(crate) fn missing(field: &str) -> Self {
        Self::MissingField {
            field: field.to_string(),
        }
    }
}

/// Top-level error type for the profile calling layer.
///
/// Conflict variants carry the current stored state together with its fresh
/// version token so the client can retry against it.
#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Version conflict on profile '{}': stored version is {}", .current.profile.id, .current.hash)]
    Conflict {
        current: Box<VersionedProfile>,
    },

    #[error("Profile '{}' already exists", .current.profile.id)]
    AlreadyExists {
        current: Box<VersionedProfile>,
    },

    #[error("ID mismatch: expected '{expected}', got '{actual}'")]
    IdMismatch {
        expected: String,
        actual: String,
    },
}

impl ProfileError {
    /// Returns true if the write lost an optimistic-lock race.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::AlreadyExists { .. })
    }

    /// Returns true if the requested record does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Storage(e) if e.kind() == StorageErrorKind::NotFound)
    }

    /// Returns true if the request was malformed.
    #[must_use]
    pub fn is_invalid(&self) -> bool {
        match self {
            Self::Validation(_) | Self::IdMismatch { .. } => true,
            Self::Storage(e) => e.kind() == StorageErrorKind::InvalidArgument,
            _ => false,
        }
    }

    /// Returns the current stored state carried by a conflict, if any.
    #[must_use]
    pub fn current(&self) -> Option<&VersionedProfile> {
        match self {
            Self::Conflict { current } | Self::AlreadyExists { current } => Some(current),
            _ => None,
        }
    }

    /// Returns true if repeating the call with fresh state may succeed.
    ///
    /// Only conflicts qualify: the caller re-reads, merges, and resubmits.
    /// Backend failures are not retried by this crate.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Result type alias for the profile calling layer.
pub type ProfileResult<T> = Result<T, ProfileError>;
