//! Player profiles.
//!
//! A [`Profile`] is a player's persisted game state. It is keyed by a stable,
//! non-empty player ID and carries a coin balance plus two free-form maps.
//! Maps compare as sets of pairs, so insertion order never affects equality.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::token::VersionToken;

/// A player's persisted game state.
///
/// # Examples
///
/// ```
/// use gameprofile::Profile;
///
/// let profile = Profile::new("p1")
///     .with_coins(100)
///     .with_item("sword", "+1")
///     .with_equipment("hand", "sword");
/// assert!(profile.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Stable player identity; primary key.
    pub id: String,
    /// Coin balance.
    #[serde(default)]
    pub coins: i64,
    /// Item name to opaque item settings.
    #[serde(default)]
    pub inventory: HashMap<String, String>,
    /// Equipment slot to item name.
    #[serde(default)]
    pub equipment: HashMap<String, String>,
}

impl Profile {
    /// Creates an empty profile for the given player.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Sets the coin balance.
    #[must_use]
    pub fn with_coins(mut self, coins: i64) -> Self {
        self.coins = coins;
        self
    }

    /// Adds an inventory item.
    #[must_use]
    pub fn with_item(mut self, item: impl Into<String>, settings: impl Into<String>) -> Self {
        self.inventory.insert(item.into(), settings.into());
        self
    }

    /// Equips an item in a slot.
    #[must_use]
    pub fn with_equipment(mut self, slot: impl Into<String>, item: impl Into<String>) -> Self {
        self.equipment.insert(slot.into(), item.into());
        self
    }

    /// Checks the invariants required for the profile to be stored.
    ///
    /// # Errors
    /// Returns [`ValidationError::EmptyProfileId`] if `id` is empty.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.is_empty() {
            return Err(ValidationError::EmptyProfileId);
        }
        Ok(())
    }

    /// Computes the version token of the profile's current field values.
    #[must_use]
    pub fn version_token(&self) -> VersionToken {
        VersionToken::of(self)
    }
}
