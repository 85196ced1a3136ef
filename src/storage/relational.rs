//! Relational [`Storer`] backed by SQLite.
//!
//! Profiles map to one row each, with the inventory and equipment maps stored
//! as JSON text. Punishments map to one row each, keyed by `(id, "type")`.
//! Punishment IDs come from a single-row sequence table so they are never
//! reused after a delete.
//!
//! Every write runs in its own transaction.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use crate::profile::Profile;
use crate::punishment::{fold_by_type, Punishment, PunishmentId, PunishmentSet};
use crate::storage::traits::{StorageError, Storer};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS profiles (
    id TEXT PRIMARY KEY NOT NULL,
    coins INTEGER NOT NULL DEFAULT 0,
    inventory TEXT NOT NULL DEFAULT '{}',
    equipment TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS punishments (
    id INTEGER NOT NULL,
    player_id TEXT NOT NULL,
    "by" TEXT NOT NULL,
    "type" TEXT NOT NULL,
    reason TEXT NOT NULL DEFAULT '',
    date TEXT NOT NULL,
    expires TEXT NOT NULL,
    PRIMARY KEY (id, "type")
);

CREATE INDEX IF NOT EXISTS idx_punishments_player ON punishments(player_id);

CREATE TABLE IF NOT EXISTS punishment_sequence (
    id INTEGER PRIMARY KEY CHECK (id = 0),
    value INTEGER NOT NULL
);

INSERT OR IGNORE INTO punishment_sequence (id, value) VALUES (0, 0);
"#;

/// Connection settings for [`RelationalStore`].
#[derive(Debug, Clone)]
pub struct RelationalConfig {
    /// Database file; `None` opens a private in-memory database.
    pub path: Option<PathBuf>,
    /// How long a statement waits on a locked database before failing.
    pub busy_timeout: Duration,
}

impl Default for RelationalConfig {
    fn default() -> Self {
        Self {
            path: None,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl RelationalConfig {
    /// Settings for a database file at `path`.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }
}

/// SQLite-backed profile and punishment store.
#[derive(Debug)]
pub struct RelationalStore {
    conn: Mutex<Connection>,
}

impl RelationalStore {
    /// Open (creating if needed) a database and ensure the schema exists.
    ///
    /// # Errors
    /// If the database cannot be opened or the schema cannot be created.
    pub fn open(config: &RelationalConfig) -> Result<Self, StorageError> {
        let conn = match &config.path {
            Some(path) => {
                info!(path = %path.display(), "opening relational store");
                let conn = Connection::open(path)?;
                let mode: String =
                    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
                debug!(journal_mode = %mode, "configured journal mode");
                conn
            }
            None => Connection::open_in_memory()?,
        };
        conn.busy_timeout(config.busy_timeout)?;
        conn.execute_batch(SCHEMA)?;
        debug!("relational schema ready");

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open a private in-memory database.
    ///
    /// # Errors
    /// If SQLite cannot allocate the database.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::open(&RelationalConfig::default())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn
            .lock()
            .map_err(|_| StorageError::BackendError("poisoned lock: sqlite connection".to_string()))
    }
}

fn punishment_from_row(row: &Row<'_>) -> rusqlite::Result<Punishment> {
    Ok(Punishment {
        id: PunishmentId::new(row.get(0)?),
        player_id: row.get(1)?,
        by: row.get(2)?,
        kind: row.get(3)?,
        reason: row.get(4)?,
        date: row.get(5)?,
        expires: row.get(6)?,
    })
}

impl Storer for RelationalStore {
    fn get_profile(&self, id: &str) -> Result<Profile, StorageError> {
        let conn = self.lock()?;
        let row: Option<(i64, String, String)> = conn
            .query_row(
                "SELECT coins, inventory, equipment FROM profiles WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let (coins, inventory, equipment) =
            row.ok_or_else(|| StorageError::ProfileNotFound(id.to_string()))?;
        Ok(Profile {
            id: id.to_string(),
            coins,
            inventory: serde_json::from_str::<HashMap<String, String>>(&inventory)?,
            equipment: serde_json::from_str::<HashMap<String, String>>(&equipment)?,
        })
    }

    fn put_profile(&self, profile: Profile) -> Result<(), StorageError> {
        profile.validate()?;
        let inventory = serde_json::to_string(&profile.inventory)?;
        let equipment = serde_json::to_string(&profile.equipment)?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO profiles (id, coins, inventory, equipment)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                 coins = excluded.coins,
                 inventory = excluded.inventory,
                 equipment = excluded.equipment",
            params![profile.id, profile.coins, inventory, equipment],
        )?;
        Ok(())
    }

    fn get_punishments(&self, player_id: &str) -> Result<PunishmentSet, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            r#"SELECT id, player_id, "by", "type", reason, date, expires
               FROM punishments WHERE player_id = ?1 ORDER BY id"#,
        )?;
        let rows = stmt
            .query_map(params![player_id], punishment_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let set = fold_by_type(rows);
        if set.is_empty() {
            return Err(StorageError::NoPunishments(player_id.to_string()));
        }
        Ok(set)
    }

    fn put_punishment(&self, mut punishment: Punishment) -> Result<PunishmentId, StorageError> {
        punishment.validate()?;

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        if punishment.id.is_assigned() {
            tx.execute(
                "UPDATE punishment_sequence SET value = MAX(value, ?1) WHERE id = 0",
                params![punishment.id.get()],
            )?;
        } else {
            let current: i64 =
                tx.query_row("SELECT value FROM punishment_sequence WHERE id = 0", [], |row| {
                    row.get(0)
                })?;
            // SQLite would silently widen an overflowing sum to REAL.
            let next = current.checked_add(1).ok_or_else(|| {
                StorageError::BackendError("punishment id space exhausted".to_string())
            })?;
            tx.execute(
                "UPDATE punishment_sequence SET value = ?1 WHERE id = 0",
                params![next],
            )?;
            punishment.id = PunishmentId::new(next);
        }

        let replaced = tx.execute(
            r#"DELETE FROM punishments WHERE id = ?1 OR (player_id = ?2 AND "type" = ?3)"#,
            params![punishment.id.get(), punishment.player_id, punishment.kind],
        )?;
        tx.execute(
            r#"INSERT INTO punishments (id, player_id, "by", "type", reason, date, expires)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
            params![
                punishment.id.get(),
                punishment.player_id,
                punishment.by,
                punishment.kind,
                punishment.reason,
                punishment.date,
                punishment.expires,
            ],
        )?;
        tx.commit()?;

        if replaced > 0 {
            debug!(id = %punishment.id, replaced, "replaced existing punishment rows");
        }
        Ok(punishment.id)
    }

    fn del_punishment(&self, id: PunishmentId) -> Result<(), StorageError> {
        let conn = self.lock()?;
        let deleted = conn.execute("DELETE FROM punishments WHERE id = ?1", params![id.get()])?;
        if deleted == 0 {
            return Err(StorageError::PunishmentNotFound(id));
        }
        Ok(())
    }
}
