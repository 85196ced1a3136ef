//! Behavioural suite every `Storer` backend must pass identically.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use chrono::Duration;
use gameprofile::{
    InMemoryStore, Profile, Punishment, PunishmentId, StorageError, StorageErrorKind, Storer,
};
use tempfile::TempDir;

struct Backend {
    name: &'static str,
    store: Arc<dyn Storer>,
    // Keeps on-disk backends alive for the duration of a test.
    _dir: Option<TempDir>,
}

fn backends() -> Vec<Backend> {
    let mut all = vec![Backend {
        name: "memory",
        store: Arc::new(InMemoryStore::new()),
        _dir: None,
    }];

    #[cfg(feature = "persistent")]
    {
        use gameprofile::storage::persistent::{open_database, PersistentConfig};
        let dir = tempfile::tempdir().unwrap();
        let config = PersistentConfig {
            sync_on_write: false,
            ..PersistentConfig::default()
        };
        all.push(Backend {
            name: "persistent",
            store: Arc::new(open_database(dir.path(), Some(config)).unwrap()),
            _dir: Some(dir),
        });
    }

    #[cfg(feature = "relational")]
    {
        use gameprofile::{RelationalConfig, RelationalStore};
        let dir = tempfile::tempdir().unwrap();
        let config = RelationalConfig::file(dir.path().join("conformance.sqlite"));
        all.push(Backend {
            name: "relational",
            store: Arc::new(RelationalStore::open(&config).unwrap()),
            _dir: Some(dir),
        });
    }

    all
}

fn kind_of(err: &StorageError) -> StorageErrorKind {
    err.kind()
}

#[test]
fn test_profile_roundtrip() {
    for b in backends() {
        let profile = Profile::new("some_user")
            .with_coins(999)
            .with_item("sword", "{\"sharpness\":3}")
            .with_item("shield", "")
            .with_equipment("hand", "sword");
        b.store.put_profile(profile.clone()).unwrap();
        assert_eq!(b.store.get_profile("some_user").unwrap(), profile, "{}", b.name);
    }
}

#[test]
fn test_profile_overwrite_replaces_all_fields() {
    for b in backends() {
        b.store
            .put_profile(Profile::new("p1").with_coins(100).with_item("sword", "+1"))
            .unwrap();
        let replacement = Profile::new("p1").with_coins(50).with_equipment("head", "helm");
        b.store.put_profile(replacement.clone()).unwrap();
        assert_eq!(b.store.get_profile("p1").unwrap(), replacement, "{}", b.name);
    }
}

#[test]
fn test_unknown_profile_is_not_found() {
    for b in backends() {
        let err = b.store.get_profile("nobody").unwrap_err();
        assert_eq!(kind_of(&err), StorageErrorKind::NotFound, "{}", b.name);
    }
}

#[test]
fn test_empty_profile_id_is_rejected_without_a_record() {
    for b in backends() {
        let err = b.store.put_profile(Profile::new("").with_coins(5)).unwrap_err();
        assert_eq!(kind_of(&err), StorageErrorKind::InvalidArgument, "{}", b.name);

        let err = b.store.get_profile("").unwrap_err();
        assert_eq!(kind_of(&err), StorageErrorKind::NotFound, "{}", b.name);
    }
}

#[test]
fn test_map_insertion_order_is_irrelevant() {
    for b in backends() {
        let forward = Profile::new("p1")
            .with_item("a", "1")
            .with_item("b", "2")
            .with_item("c", "3");
        let backward = Profile::new("p1")
            .with_item("c", "3")
            .with_item("b", "2")
            .with_item("a", "1");
        assert_eq!(forward, backward);
        assert_eq!(forward.version_token(), backward.version_token());

        b.store.put_profile(backward).unwrap();
        let stored = b.store.get_profile("p1").unwrap();
        assert_eq!(stored, forward, "{}", b.name);
        assert!(forward.version_token().matches(&stored), "{}", b.name);
    }
}

#[test]
fn test_ban_is_assigned_an_id_and_can_be_deleted() {
    for b in backends() {
        let ban = Punishment::new("p1", "admin", "ban")
            .with_reason("griefing")
            .expires_in(Duration::hours(24));
        let id = b.store.put_punishment(ban.clone()).unwrap();
        assert!(id.is_assigned(), "{}", b.name);

        let set = b.store.get_punishments("p1").unwrap();
        assert_eq!(set.len(), 1, "{}", b.name);
        assert_eq!(set["ban"], ban.with_id(id), "{}", b.name);

        b.store.del_punishment(id).unwrap();
        let err = b.store.get_punishments("p1").unwrap_err();
        assert_eq!(kind_of(&err), StorageErrorKind::NotFound, "{}", b.name);
    }
}

#[test]
fn test_invalid_punishment_is_rejected_without_mutation() {
    for b in backends() {
        let cases = [
            Punishment::new("", "admin", "ban"),
            Punishment::new("p1", "", "ban"),
            Punishment::new("p1", "admin", ""),
            Punishment::new("p1", "admin", "ban").with_id(-1_i64),
        ];
        for p in cases {
            let err = b.store.put_punishment(p).unwrap_err();
            assert_eq!(kind_of(&err), StorageErrorKind::InvalidArgument, "{}", b.name);
        }
        assert!(b.store.get_punishments("p1").unwrap_err().is_not_found(), "{}", b.name);

        // Rejected writes must not have consumed IDs either.
        let id = b.store.put_punishment(Punishment::new("p1", "admin", "ban")).unwrap();
        assert_eq!(id, PunishmentId::new(1), "{}", b.name);
    }
}

#[test]
fn test_player_without_punishments_is_not_found() {
    for b in backends() {
        b.store.put_profile(Profile::new("clean")).unwrap();
        let err = b.store.get_punishments("clean").unwrap_err();
        assert!(matches!(err, StorageError::NoPunishments(_)), "{}", b.name);
    }
}

#[test]
fn test_delete_removes_only_that_entry() {
    for b in backends() {
        let ban = b.store.put_punishment(Punishment::new("p1", "admin", "ban")).unwrap();
        let mute = b.store.put_punishment(Punishment::new("p1", "admin", "mute")).unwrap();
        b.store.put_punishment(Punishment::new("p2", "admin", "ban")).unwrap();

        b.store.del_punishment(ban).unwrap();
        let set = b.store.get_punishments("p1").unwrap();
        assert_eq!(set.len(), 1, "{}", b.name);
        assert_eq!(set["mute"].id, mute, "{}", b.name);
        assert_eq!(b.store.get_punishments("p2").unwrap().len(), 1, "{}", b.name);

        b.store.del_punishment(mute).unwrap();
        assert!(b.store.get_punishments("p1").unwrap_err().is_not_found(), "{}", b.name);
    }
}

#[test]
fn test_delete_unknown_id_changes_nothing() {
    for b in backends() {
        let id = b.store.put_punishment(Punishment::new("p1", "admin", "ban")).unwrap();

        let err = b.store.del_punishment(PunishmentId::new(9001)).unwrap_err();
        assert!(matches!(err, StorageError::PunishmentNotFound(_)), "{}", b.name);
        assert_eq!(b.store.get_punishments("p1").unwrap()["ban"].id, id, "{}", b.name);
    }
}

#[test]
fn test_same_type_replaces_previous_punishment() {
    for b in backends() {
        let first = b.store.put_punishment(Punishment::new("p1", "admin", "ban")).unwrap();
        let second = b
            .store
            .put_punishment(Punishment::new("p1", "moderator", "ban").with_reason("again"))
            .unwrap();
        assert_ne!(first, second, "{}", b.name);

        let set = b.store.get_punishments("p1").unwrap();
        assert_eq!(set.len(), 1, "{}", b.name);
        assert_eq!(set["ban"].id, second, "{}", b.name);
        assert_eq!(set["ban"].by, "moderator", "{}", b.name);

        // The replaced record is gone, not just hidden.
        assert!(b.store.del_punishment(first).unwrap_err().is_not_found(), "{}", b.name);
    }
}

#[test]
fn test_explicit_id_is_kept_and_never_reassigned() {
    for b in backends() {
        let id = b
            .store
            .put_punishment(Punishment::new("p1", "admin", "ban").with_id(100_i64))
            .unwrap();
        assert_eq!(id, PunishmentId::new(100), "{}", b.name);

        let next = b.store.put_punishment(Punishment::new("p2", "admin", "ban")).unwrap();
        assert!(next.get() > 100, "{}", b.name);
    }
}

#[test]
fn test_ids_are_unique_across_players() {
    for b in backends() {
        let mut seen = HashSet::new();
        for player in ["p1", "p2", "p3"] {
            for kind in ["ban", "mute", "kick"] {
                let id = b.store.put_punishment(Punishment::new(player, "admin", kind)).unwrap();
                assert!(seen.insert(id), "{}: duplicate id {id}", b.name);
            }
        }
    }
}

#[test]
fn test_concurrent_writers_get_distinct_ids() {
    for b in backends() {
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&b.store);
                thread::spawn(move || {
                    (0..10)
                        .map(|i| {
                            store
                                .put_punishment(Punishment::new(
                                    format!("player_{t}"),
                                    "admin",
                                    format!("type_{i}"),
                                ))
                                .unwrap()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let ids: HashSet<_> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(ids.len(), 80, "{}", b.name);

        for t in 0..8 {
            let set = b.store.get_punishments(&format!("player_{t}")).unwrap();
            assert_eq!(set.len(), 10, "{}", b.name);
        }
    }
}

#[test]
fn test_concurrent_writers_to_one_player_lose_nothing() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 20;

    for b in backends() {
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let store = Arc::clone(&b.store);
                thread::spawn(move || {
                    for i in 0..PER_THREAD {
                        store
                            .put_punishment(Punishment::new(
                                "shared",
                                format!("mod_{t}"),
                                format!("type_{t}_{i}"),
                            ))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let set = b.store.get_punishments("shared").unwrap();
        assert_eq!(set.len(), THREADS * PER_THREAD, "{}", b.name);
        let ids: HashSet<_> = set.values().map(|p| p.id).collect();
        assert_eq!(ids.len(), THREADS * PER_THREAD, "{}", b.name);
    }
}

#[test]
fn test_exhausted_id_space_is_an_error_not_a_collision() {
    for b in backends() {
        let top = PunishmentId::new(i64::MAX);
        let stored = b
            .store
            .put_punishment(Punishment::new("p1", "admin", "ban").with_id(i64::MAX))
            .unwrap();
        assert_eq!(stored, top, "{}", b.name);

        let err = b
            .store
            .put_punishment(Punishment::new("p2", "admin", "mute"))
            .unwrap_err();
        assert_eq!(kind_of(&err), StorageErrorKind::Storage, "{}", b.name);

        // Nothing changed and the store still serves reads and writes.
        assert_eq!(b.store.get_punishments("p1").unwrap()["ban"].id, top, "{}", b.name);
        assert!(b.store.get_punishments("p2").unwrap_err().is_not_found(), "{}", b.name);
        b.store
            .put_punishment(Punishment::new("p2", "admin", "mute").with_id(5_i64))
            .unwrap();
        assert_eq!(b.store.get_punishments("p2").unwrap().len(), 1, "{}", b.name);
    }
}
