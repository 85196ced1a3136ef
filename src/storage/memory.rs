//! In-memory storage backend.
//!
//! This module provides a thread-safe in-memory implementation of [`Storer`].
//! It is intended for tests and embedded usage, and is the reference model the
//! other backends are checked against.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use crate::profile::Profile;
use crate::punishment::{fold_by_type, Punishment, PunishmentId, PunishmentSet};
use crate::storage::traits::{StorageError, Storer};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

fn id_space_exhausted() -> StorageError {
    StorageError::BackendError("punishment id space exhausted".to_string())
}

#[derive(Debug)]
struct MemoryState {
    profiles: HashMap<String, Profile>,
    // Ordered by ID so grouping by type is deterministic: higher IDs win.
    punishments: BTreeMap<PunishmentId, Punishment>,
    next_punishment_id: Option<i64>,
}

impl Default for MemoryState {
    fn default() -> Self {
        Self {
            profiles: HashMap::new(),
            punishments: BTreeMap::new(),
            next_punishment_id: Some(1),
        }
    }
}

/// Thread-safe in-memory profile and punishment store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<MemoryState>,
}

impl InMemoryStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored profiles.
    pub fn profile_count(&self) -> Result<usize, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("profile.count"))?;
        Ok(state.profiles.len())
    }

    /// Number of stored punishments across all players.
    pub fn punishment_count(&self) -> Result<usize, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("punishment.count"))?;
        Ok(state.punishments.len())
    }
}

impl Storer for InMemoryStore {
    fn get_profile(&self, id: &str) -> Result<Profile, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("profile.get"))?;
        state
            .profiles
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::ProfileNotFound(id.to_string()))
    }

    fn put_profile(&self, profile: Profile) -> Result<(), StorageError> {
        profile.validate()?;
        let mut state = self.state.write().map_err(|_| lock_err("profile.put"))?;
        state.profiles.insert(profile.id.clone(), profile);
        Ok(())
    }

    fn get_punishments(&self, player_id: &str) -> Result<PunishmentSet, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("punishment.get"))?;
        let set = fold_by_type(
            state
                .punishments
                .values()
                .filter(|p| p.player_id == player_id)
                .cloned(),
        );
        if set.is_empty() {
            return Err(StorageError::NoPunishments(player_id.to_string()));
        }
        Ok(set)
    }

    fn put_punishment(&self, mut punishment: Punishment) -> Result<PunishmentId, StorageError> {
        punishment.validate()?;
        let mut state = self.state.write().map_err(|_| lock_err("punishment.put"))?;

        // `None` once the largest representable ID has been handed out.
        if punishment.id.is_assigned() {
            let after = punishment.id.get().checked_add(1);
            state.next_punishment_id = match (state.next_punishment_id, after) {
                (Some(current), Some(after)) => Some(current.max(after)),
                _ => None,
            };
        } else {
            let raw = state.next_punishment_id.ok_or_else(id_space_exhausted)?;
            punishment.id = PunishmentId::new(raw);
            state.next_punishment_id = raw.checked_add(1);
        }

        let id = punishment.id;
        state
            .punishments
            .retain(|_, p| !(p.player_id == punishment.player_id && p.kind == punishment.kind));
        state.punishments.insert(id, punishment);
        Ok(id)
    }

    fn del_punishment(&self, id: PunishmentId) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("punishment.del"))?;
        state
            .punishments
            .remove(&id)
            .map(|_| ())
            .ok_or(StorageError::PunishmentNotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::error::ValidationError;

    #[test]
    fn test_profile_roundtrip() {
        let store = InMemoryStore::new();
        let p = Profile::new("some_user").with_coins(999);
        store.put_profile(p.clone()).unwrap();
        assert_eq!(store.get_profile("some_user").unwrap(), p);
    }

    #[test]
    fn test_empty_profile_id_creates_nothing() {
        let store = InMemoryStore::new();
        let err = store.put_profile(Profile::default()).unwrap_err();
        assert!(matches!(err, StorageError::InvalidArgument(ValidationError::EmptyProfileId)));
        assert_eq!(store.profile_count().unwrap(), 0);
        assert!(store.get_profile("").unwrap_err().is_not_found());
    }

    #[test]
    fn test_assigned_ids_start_at_one_and_increase() {
        let store = InMemoryStore::new();
        let a = store.put_punishment(Punishment::new("p1", "admin", "ban")).unwrap();
        let b = store.put_punishment(Punishment::new("p1", "admin", "mute")).unwrap();
        assert_eq!(a, PunishmentId::new(1));
        assert_eq!(b, PunishmentId::new(2));
    }

    #[test]
    fn test_explicit_id_advances_counter() {
        let store = InMemoryStore::new();
        store
            .put_punishment(Punishment::new("p1", "admin", "ban").with_id(1234_i64))
            .unwrap();
        let next = store.put_punishment(Punishment::new("p2", "admin", "ban")).unwrap();
        assert_eq!(next, PunishmentId::new(1235));
    }

    #[test]
    fn test_top_explicit_id_exhausts_assignment_without_poisoning() {
        let store = InMemoryStore::new();
        store
            .put_punishment(Punishment::new("p1", "admin", "ban").with_id(i64::MAX))
            .unwrap();

        for _ in 0..2 {
            let err = store
                .put_punishment(Punishment::new("p2", "admin", "ban"))
                .unwrap_err();
            assert!(matches!(err, StorageError::BackendError(ref msg) if msg.contains("exhausted")));
        }
        assert_eq!(store.punishment_count().unwrap(), 1);

        // Lower explicit IDs do not bring assignment back.
        store
            .put_punishment(Punishment::new("p2", "admin", "mute").with_id(3_i64))
            .unwrap();
        assert!(store.put_punishment(Punishment::new("p3", "admin", "ban")).is_err());
        assert_eq!(store.get_punishments("p2").unwrap().len(), 1);
    }

    #[test]
    fn test_same_type_replaces_previous_punishment() {
        let store = InMemoryStore::new();
        let old = store.put_punishment(Punishment::new("p1", "admin", "ban")).unwrap();
        let new = store
            .put_punishment(Punishment::new("p1", "admin", "ban").with_reason("again"))
            .unwrap();
        assert_ne!(old, new);
        assert_eq!(store.punishment_count().unwrap(), 1);
        assert!(store.del_punishment(old).unwrap_err().is_not_found());
        assert_eq!(store.get_punishments("p1").unwrap()["ban"].reason, "again");
    }

    #[test]
    fn test_invalid_punishment_does_not_consume_an_id() {
        let store = InMemoryStore::new();
        assert!(store.put_punishment(Punishment::new("p1", "", "ban")).is_err());
        let id = store.put_punishment(Punishment::new("p1", "admin", "ban")).unwrap();
        assert_eq!(id, PunishmentId::new(1));
    }

    #[test]
    fn test_delete_last_punishment_leaves_player_empty() {
        let store = InMemoryStore::new();
        let id = store.put_punishment(Punishment::new("p1", "admin", "ban")).unwrap();
        store.del_punishment(id).unwrap();
        assert!(matches!(
            store.get_punishments("p1"),
            Err(StorageError::NoPunishments(_))
        ));
    }
}
