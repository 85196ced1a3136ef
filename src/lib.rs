//! # gameprofile - Player Profiles and Punishments
//!
//! gameprofile stores per-player game state (coins, inventory, equipment) and
//! disciplinary records behind one storage contract, with optimistic
//! concurrency control for profile writes.
//!
//! ## Core Concepts
//!
//! - **Profile**: A player's persisted state, keyed by player ID
//! - **Punishment**: A disciplinary record, unique per player and type
//! - **VersionToken**: A content fingerprint used as the optimistic-lock version
//! - **Storer**: The contract every backend implements
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use gameprofile::{InMemoryStore, Profile, ProfileService};
//!
//! let service = ProfileService::new(Arc::new(InMemoryStore::new()));
//!
//! let v1 = service.create_profile(Profile::new("p1").with_coins(100))?;
//!
//! // Edit against the token we read.
//! let mut edit = v1.clone();
//! edit.profile.coins = 50;
//! let v2 = service.update_profile("p1", edit)?;
//!
//! // A second edit still holding the old token is refused.
//! let err = service.update_profile("p1", v1).unwrap_err();
//! assert!(err.is_conflict());
//! assert_eq!(err.current(), Some(&v2));
//! # Ok::<(), gameprofile::ProfileError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod error;
pub mod profile;
pub mod punishment;
pub mod token;

// Storage and the calling layer
pub mod service;
pub mod storage;

// Re-export primary types at crate root for convenience
pub use error::{ProfileError, ProfileResult, ValidationError};
pub use profile::Profile;
pub use punishment::{Punishment, PunishmentId, PunishmentSet};
pub use service::{ProfileService, VersionedProfile};
pub use storage::{open_store, InMemoryStore, StorageError, StorageErrorKind, StoreConfig, Storer};
pub use token::VersionToken;

#[cfg(feature = "persistent")]
pub use storage::{DurableStore, PersistentConfig};
#[cfg(feature = "relational")]
pub use storage::{RelationalConfig, RelationalStore};
