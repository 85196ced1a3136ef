//! Punishment records.
//!
//! A [`Punishment`] is a disciplinary record (ban, mute, ...) targeting one
//! player. Within a player's punishments the `type` is the uniqueness key, so
//! backends return them as a [`PunishmentSet`] keyed by type. Punishments are
//! also addressable by a numeric [`PunishmentId`], which is globally unique.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Numeric punishment identifier.
///
/// Zero is the "unassigned" sentinel: a backend assigns a fresh ID when it
/// stores a punishment carrying it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PunishmentId(i64);

impl PunishmentId {
    /// The "not yet assigned" sentinel.
    pub const UNASSIGNED: Self = Self(0);

    /// Wraps a raw ID.
    #[must_use]
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }

    /// Returns true unless this is the zero sentinel.
    #[must_use]
    pub const fn is_assigned(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for PunishmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for PunishmentId {
    fn from(raw: i64) -> Self {
        Self(raw)
    }
}

impl From<PunishmentId> for i64 {
    fn from(id: PunishmentId) -> Self {
        id.0
    }
}

/// A player's punishments keyed by punishment type.
pub type PunishmentSet = HashMap<String, Punishment>;

/// A disciplinary record tied to a player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Punishment {
    /// Numeric ID; [`PunishmentId::UNASSIGNED`] until a backend stores it.
    #[serde(default)]
    pub id: PunishmentId,
    /// The punished player.
    pub player_id: String,
    /// The issuing authority.
    pub by: String,
    /// Category, e.g. `"ban"`. Unique per player.
    #[serde(rename = "type")]
    pub kind: String,
    /// Free-form explanation.
    #[serde(default)]
    pub reason: String,
    /// When the punishment was issued.
    pub date: DateTime<Utc>,
    /// When the punishment lapses. Not checked against `date`.
    pub expires: DateTime<Utc>,
}

impl Punishment {
    /// Creates an unassigned punishment issued now and expiring immediately.
    ///
    /// Use [`Punishment::expires_in`] or [`Punishment::with_expires`] to set
    /// a real expiry.
    #[must_use]
    pub fn new(player_id: impl Into<String>, by: impl Into<String>, kind: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: PunishmentId::UNASSIGNED,
            player_id: player_id.into(),
            by: by.into(),
            kind: kind.into(),
            reason: String::new(),
            date: now,
            expires: now,
        }
    }

    /// Sets an explicit ID.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<PunishmentId>) -> Self {
        self.id = id.into();
        self
    }

    /// Sets the reason.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    /// Sets the expiry timestamp.
    #[must_use]
    pub fn with_expires(mut self, expires: DateTime<Utc>) -> Self {
        self.expires = expires;
        self
    }

    /// Sets the expiry relative to the issue date.
    #[must_use]
    pub fn expires_in(mut self, duration: Duration) -> Self {
        self.expires = self.date + duration;
        self
    }

    /// Returns true if the punishment has lapsed at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires <= now
    }

    /// Checks the fields every backend requires.
    ///
    /// # Errors
    /// - [`ValidationError::MissingField`] if `player_id`, `by`, or `type` is empty
    /// - [`ValidationError::NegativePunishmentId`] if `id` is below zero
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.player_id.is_empty() {
            return Err(ValidationError::missing("player_id"));
        }
        if self.by.is_empty() {
            return Err(ValidationError::missing("by"));
        }
        if self.kind.is_empty() {
            return Err(ValidationError::missing("type"));
        }
        if self.id.get() < 0 {
            return Err(ValidationError::NegativePunishmentId { id: self.id.get() });
        }
        Ok(())
    }
}

/// Folds punishments into a set keyed by type.
///
/// Later items overwrite earlier ones sharing a type, so callers that need a
/// deterministic winner must feed items in ascending ID order.
pub(crate) fn fold_by_type(items: impl IntoIterator<Item = Punishment>) -> PunishmentSet {
    let mut set = PunishmentSet::new();
    for p in items {
        set.insert(p.kind.clone(), p);
    }
    set
}
