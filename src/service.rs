//! Optimistic-lock calling layer.
//!
//! Storage backends never look at version tokens. [`ProfileService`] wraps any
//! [`Storer`] and enforces the compare-and-swap protocol for profile writes:
//! a client must present the token of the state it last read, and the write
//! is refused with the current state if anything changed since.
//!
//! Within one service instance the fetch, compare, and write steps run under a
//! single mutex, so two writers holding the same token cannot both succeed.
//! Services built over the same store in different processes are not
//! coordinated.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ProfileError, ProfileResult, ValidationError};
use crate::profile::Profile;
use crate::punishment::{Punishment, PunishmentId, PunishmentSet};
use crate::storage::{StorageError, Storer};
use crate::token::VersionToken;

/// A profile together with its version token.
///
/// Serializes as the profile's fields plus a `hash` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedProfile {
    /// The profile state.
    #[serde(flatten)]
    pub profile: Profile,
    /// Token of the state the holder last saw.
    pub hash: VersionToken,
}

impl VersionedProfile {
    /// Pair a profile with its freshly computed token.
    #[must_use]
    pub fn new(profile: Profile) -> Self {
        let hash = profile.version_token();
        Self { profile, hash }
    }

    /// Pair a client-submitted profile with the token the client claims.
    #[must_use]
    pub fn with_token(profile: Profile, hash: VersionToken) -> Self {
        Self { profile, hash }
    }

    /// Returns true if `hash` is the token of `profile` itself.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.hash.matches(&self.profile)
    }
}

/// Profile and punishment operations over a shared [`Storer`].
pub struct ProfileService {
    store: Arc<dyn Storer>,
    write_guard: Mutex<()>,
}

impl ProfileService {
    /// Create a service over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn Storer>) -> Self {
        Self {
            store,
            write_guard: Mutex::new(()),
        }
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn Storer> {
        &self.store
    }

    fn lock(&self) -> ProfileResult<MutexGuard<'_, ()>> {
        self.write_guard.lock().map_err(|_| {
            StorageError::BackendError("poisoned lock: profile service".to_string()).into()
        })
    }

    /// Read a profile with its current token.
    pub fn get_profile(&self, id: &str) -> ProfileResult<VersionedProfile> {
        Ok(VersionedProfile::new(self.store.get_profile(id)?))
    }

    /// Store a profile that must not exist yet.
    ///
    /// # Errors
    /// - `Validation` if the ID is empty
    /// - `AlreadyExists` carrying the stored state if the ID is taken
    pub fn create_profile(&self, profile: Profile) -> ProfileResult<VersionedProfile> {
        profile.validate()?;
        let _guard = self.lock()?;

        match self.store.get_profile(&profile.id) {
            Ok(existing) => {
                debug!(profile_id = %profile.id, "create refused: profile exists");
                return Err(ProfileError::AlreadyExists {
                    current: Box::new(VersionedProfile::new(existing)),
                });
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        self.store.put_profile(profile.clone())?;
        Ok(VersionedProfile::new(profile))
    }

    /// Replace a profile if the submitted token matches the stored state.
    ///
    /// `id` is the identity the caller addressed; it must equal the submitted
    /// profile's ID.
    ///
    /// # Errors
    /// - `IdMismatch` if `id` differs from the submitted profile's ID
    /// - `Storage(ProfileNotFound)` if nothing is stored under `id`
    /// - `Conflict` carrying the current state and token if the token is stale
    pub fn update_profile(
        &self,
        id: &str,
        submitted: VersionedProfile,
    ) -> ProfileResult<VersionedProfile> {
        if submitted.profile.id != id {
            return Err(ProfileError::IdMismatch {
                expected: id.to_string(),
                actual: submitted.profile.id,
            });
        }
        submitted.profile.validate()?;

        let _guard = self.lock()?;
        let current = VersionedProfile::new(self.store.get_profile(id)?);
        if current.hash != submitted.hash {
            debug!(
                profile_id = %id,
                submitted = %submitted.hash,
                current = %current.hash,
                "optimistic lock conflict"
            );
            return Err(ProfileError::Conflict {
                current: Box::new(current),
            });
        }

        self.store.put_profile(submitted.profile.clone())?;
        Ok(VersionedProfile::new(submitted.profile))
    }

    /// Returns true if `token` matches the stored state of profile `id`.
    pub fn is_token_current(&self, id: &str, token: &VersionToken) -> ProfileResult<bool> {
        Ok(token.matches(&self.store.get_profile(id)?))
    }

    /// Read a player's punishments keyed by type.
    pub fn get_punishments(&self, player_id: &str) -> ProfileResult<PunishmentSet> {
        Ok(self.store.get_punishments(player_id)?)
    }

    /// Store one punishment addressed to `player_id`.
    ///
    /// # Errors
    /// `IdMismatch` if the punishment targets a different player.
    pub fn add_punishment(
        &self,
        player_id: &str,
        punishment: Punishment,
    ) -> ProfileResult<PunishmentId> {
        check_player(player_id, &punishment)?;
        Ok(self.store.put_punishment(punishment)?)
    }

    /// Store a batch of punishments addressed to `player_id`.
    ///
    /// Every entry is checked before any is written, so a malformed batch
    /// changes nothing. Writes are not atomic as a group: a backend failure
    /// partway leaves the earlier entries stored.
    ///
    /// Returns the stored IDs in ascending type order.
    ///
    /// # Errors
    /// `TypeKeyMismatch` if an entry is keyed under a type other than its own;
    /// `IdMismatch` if an entry targets a different player.
    pub fn put_punishments(
        &self,
        player_id: &str,
        set: PunishmentSet,
    ) -> ProfileResult<Vec<PunishmentId>> {
        let mut batch = Vec::with_capacity(set.len());
        for (key, punishment) in set {
            if key != punishment.kind {
                return Err(ValidationError::TypeKeyMismatch {
                    key,
                    kind: punishment.kind,
                }
                .into());
            }
            check_player(player_id, &punishment)?;
            punishment.validate()?;
            batch.push(punishment);
        }
        // Keys are unique, so types are too and the order is total.
        batch.sort_by(|a, b| a.kind.cmp(&b.kind));

        let mut ids = Vec::with_capacity(batch.len());
        for punishment in batch {
            ids.push(self.store.put_punishment(punishment)?);
        }
        Ok(ids)
    }

    /// Delete a punishment by ID.
    pub fn remove_punishment(&self, id: PunishmentId) -> ProfileResult<()> {
        Ok(self.store.del_punishment(id)?)
    }
}

fn check_player(player_id: &str, punishment: &Punishment) -> ProfileResult<()> {
    if player_id.is_empty() {
        return Err(ValidationError::missing("player_id").into());
    }
    if punishment.player_id != player_id {
        return Err(ProfileError::IdMismatch {
            expected: player_id.to_string(),
            actual: punishment.player_id.clone(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;

    fn service() -> ProfileService {
        ProfileService::new(Arc::new(InMemoryStore::new()))
    }

    #[test]
    fn test_versioned_profile_json_shape() {
        let v = VersionedProfile::new(Profile::new("p1").with_coins(3));
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["id"], "p1");
        assert_eq!(json["coins"], 3);
        assert_eq!(json["hash"], v.hash.as_str());

        let back: VersionedProfile = serde_json::from_value(json).unwrap();
        assert_eq!(back, v);
        assert!(back.is_consistent());
    }

    #[test]
    fn test_create_then_create_again_conflicts() {
        let svc = service();
        let created = svc.create_profile(Profile::new("p1").with_coins(1)).unwrap();

        let err = svc.create_profile(Profile::new("p1").with_coins(2)).unwrap_err();
        assert!(matches!(err, ProfileError::AlreadyExists { .. }));
        assert_eq!(err.current().unwrap(), &created);
        assert_eq!(svc.get_profile("p1").unwrap().profile.coins, 1);
    }

    #[test]
    fn test_create_rejects_empty_id() {
        let svc = service();
        assert!(svc.create_profile(Profile::default()).unwrap_err().is_invalid());
    }

    #[test]
    fn test_update_requires_matching_id() {
        let svc = service();
        let current = svc.create_profile(Profile::new("p1")).unwrap();
        let err = svc.update_profile("p2", current).unwrap_err();
        assert!(matches!(err, ProfileError::IdMismatch { .. }));
    }

    #[test]
    fn test_update_missing_profile_is_not_found() {
        let svc = service();
        let err = svc
            .update_profile("ghost", VersionedProfile::new(Profile::new("ghost")))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_is_token_current_tracks_writes() {
        let svc = service();
        let v1 = svc.create_profile(Profile::new("p1")).unwrap();
        assert!(svc.is_token_current("p1", &v1.hash).unwrap());

        let edited = VersionedProfile::with_token(v1.profile.clone().with_coins(10), v1.hash.clone());
        svc.update_profile("p1", edited).unwrap();
        assert!(!svc.is_token_current("p1", &v1.hash).unwrap());
    }

    #[test]
    fn test_add_punishment_checks_player() {
        let svc = service();
        let err = svc
            .add_punishment("p1", Punishment::new("p2", "admin", "ban"))
            .unwrap_err();
        assert!(err.is_invalid());

        let id = svc
            .add_punishment("p1", Punishment::new("p1", "admin", "ban"))
            .unwrap();
        assert!(id.is_assigned());
    }

    #[test]
    fn test_put_punishments_rejects_whole_batch_up_front() {
        let svc = service();
        let mut set = PunishmentSet::new();
        set.insert("ban".to_string(), Punishment::new("p1", "admin", "ban"));
        set.insert("mute".to_string(), Punishment::new("p1", "", "mute"));

        assert!(svc.put_punishments("p1", set).unwrap_err().is_invalid());
        assert!(svc.get_punishments("p1").unwrap_err().is_not_found());
    }

    #[test]
    fn test_put_punishments_stores_every_entry() {
        let svc = service();
        let mut set = PunishmentSet::new();
        set.insert("ban".to_string(), Punishment::new("p1", "admin", "ban"));
        set.insert("mute".to_string(), Punishment::new("p1", "admin", "mute"));

        let ids = svc.put_punishments("p1", set).unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(svc.get_punishments("p1").unwrap().len(), 2);

        svc.remove_punishment(ids[0]).unwrap();
        assert_eq!(svc.get_punishments("p1").unwrap().len(), 1);
    }

    #[test]
    fn test_put_punishments_rejects_entry_under_foreign_type() {
        let svc = service();
        let mut set = PunishmentSet::new();
        set.insert("ban".to_string(), Punishment::new("p1", "admin", "ban"));
        set.insert("mute".to_string(), Punishment::new("p1", "admin", "ban"));

        let err = svc.put_punishments("p1", set).unwrap_err();
        assert!(matches!(
            err,
            ProfileError::Validation(ValidationError::TypeKeyMismatch { ref key, ref kind })
                if key == "mute" && kind == "ban"
        ));
        assert!(err.is_invalid());
        assert!(svc.get_punishments("p1").unwrap_err().is_not_found());
    }
}
