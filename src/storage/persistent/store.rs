//! Durable [`Storer`] over the key-value engine.
//!
//! Two partitions hold the data:
//! - `profiles`: player ID to the profile's JSON document
//! - `punishments`: player ID to a JSON map of that player's punishments by type
//!
//! Punishment IDs come from the `punishments` partition sequence, so they are
//! never reused, even after a delete, a compaction, or a restart.

use std::path::Path;

use tracing::{debug, info};

use crate::profile::Profile;
use crate::punishment::{Punishment, PunishmentId, PunishmentSet};
use crate::storage::traits::{StorageError, Storer};

use super::engine::{CompactionResult, KvEngine, WriteTx};
use super::PersistentConfig;

const PROFILES: &str = "profiles";
const PUNISHMENTS: &str = "punishments";

/// Persistent profile and punishment store.
pub struct DurableStore {
    engine: KvEngine,
}

impl std::fmt::Debug for DurableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableStore").finish_non_exhaustive()
    }
}

impl DurableStore {
    /// Open or create a store in `dir`.
    ///
    /// # Errors
    /// See [`KvEngine::open`].
    pub fn open(dir: &Path, config: PersistentConfig) -> Result<Self, StorageError> {
        let engine = KvEngine::open(dir, config)?;
        engine.update(|tx| {
            tx.create_partition_if_not_exists(PROFILES);
            tx.create_partition_if_not_exists(PUNISHMENTS);
            Ok(())
        })?;

        let (profiles, players) =
            engine.view(|tx| Ok((tx.len(PROFILES)?, tx.len(PUNISHMENTS)?)))?;
        info!(
            dir = %dir.display(),
            profiles,
            punished_players = players,
            "opened durable store"
        );

        Ok(Self { engine })
    }

    /// Get the database directory.
    pub fn path(&self) -> &Path {
        self.engine.dir()
    }

    /// Snapshot the current state and truncate the WAL.
    ///
    /// # Errors
    /// If the segment cannot be written or the WAL cannot be truncated.
    pub fn compact(&self) -> Result<CompactionResult, StorageError> {
        self.engine.compact()
    }

    /// Get the current WAL size in bytes.
    pub fn wal_size(&self) -> u64 {
        self.engine.wal_size()
    }

    /// Get the number of segment files.
    pub fn segment_count(&self) -> usize {
        self.engine.segment_count()
    }

    /// Number of stored profiles.
    ///
    /// # Errors
    /// If the engine lock is poisoned.
    pub fn profile_count(&self) -> Result<usize, StorageError> {
        self.engine.view(|tx| tx.len(PROFILES))
    }

    /// Number of stored punishments across all players.
    ///
    /// # Errors
    /// If a stored punishment map cannot be decoded.
    pub fn punishment_count(&self) -> Result<usize, StorageError> {
        self.engine.view(|tx| {
            let mut total = 0;
            for (_, raw) in tx.scan(PUNISHMENTS)? {
                total += serde_json::from_str::<PunishmentSet>(raw)?.len();
            }
            Ok(total)
        })
    }
}

fn load_set(tx: &WriteTx<'_>, player_id: &str) -> Result<PunishmentSet, StorageError> {
    match tx.get(PUNISHMENTS, player_id)? {
        Some(raw) => Ok(serde_json::from_str(raw)?),
        None => Ok(PunishmentSet::new()),
    }
}

fn store_set(tx: &mut WriteTx<'_>, player_id: &str, set: &PunishmentSet) -> Result<(), StorageError> {
    if set.is_empty() {
        tx.delete(PUNISHMENTS, player_id)?;
        return Ok(());
    }
    tx.put(PUNISHMENTS, player_id, serde_json::to_string(set)?)
}

/// Remove the punishment with `id` from whichever player holds it.
fn remove_by_id(tx: &mut WriteTx<'_>, id: PunishmentId) -> Result<bool, StorageError> {
    let mut holder = None;
    for (player_id, raw) in tx.scan(PUNISHMENTS)? {
        let set: PunishmentSet = serde_json::from_str(raw)?;
        if set.values().any(|p| p.id == id) {
            holder = Some((player_id.to_string(), set));
            break;
        }
    }

    match holder {
        Some((player_id, mut set)) => {
            set.retain(|_, p| p.id != id);
            store_set(tx, &player_id, &set)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

impl Storer for DurableStore {
    fn get_profile(&self, id: &str) -> Result<Profile, StorageError> {
        self.engine.view(|tx| match tx.get(PROFILES, id)? {
            Some(raw) => Ok(serde_json::from_str(raw)?),
            None => Err(StorageError::ProfileNotFound(id.to_string())),
        })
    }

    fn put_profile(&self, profile: Profile) -> Result<(), StorageError> {
        profile.validate()?;
        let raw = serde_json::to_string(&profile)?;
        self.engine.update(|tx| tx.put(PROFILES, &profile.id, raw))
    }

    fn get_punishments(&self, player_id: &str) -> Result<PunishmentSet, StorageError> {
        let set: PunishmentSet = self.engine.view(|tx| match tx.get(PUNISHMENTS, player_id)? {
            Some(raw) => Ok(serde_json::from_str(raw)?),
            None => Ok(PunishmentSet::new()),
        })?;
        if set.is_empty() {
            return Err(StorageError::NoPunishments(player_id.to_string()));
        }
        Ok(set)
    }

    fn put_punishment(&self, mut punishment: Punishment) -> Result<PunishmentId, StorageError> {
        punishment.validate()?;
        self.engine.update(|tx| {
            if punishment.id.is_assigned() {
                // Non-negative after validation.
                tx.bump_sequence(PUNISHMENTS, punishment.id.get().unsigned_abs())?;
                if remove_by_id(tx, punishment.id)? {
                    debug!(id = %punishment.id, "replacing punishment with explicit id");
                }
            } else {
                let next = tx.next_sequence(PUNISHMENTS)?;
                let raw = i64::try_from(next).map_err(|_| {
                    StorageError::BackendError("punishment id space exhausted".to_string())
                })?;
                punishment.id = PunishmentId::new(raw);
            }

            let id = punishment.id;
            let player_id = punishment.player_id.clone();
            let mut set = load_set(tx, &player_id)?;
            set.insert(punishment.kind.clone(), punishment);
            store_set(tx, &player_id, &set)?;
            Ok(id)
        })
    }

    fn del_punishment(&self, id: PunishmentId) -> Result<(), StorageError> {
        self.engine.update(|tx| {
            if remove_by_id(tx, id)? {
                Ok(())
            } else {
                Err(StorageError::PunishmentNotFound(id))
            }
        })
    }
}
