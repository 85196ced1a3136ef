//! Profile version tokens.
//!
//! A [`VersionToken`] is a deterministic fingerprint of a profile's field
//! values, used as the optimistic-lock version by the calling layer. It is
//! never persisted: the storage layer knows nothing about it.
//!
//! The token is BLAKE3 over a canonical encoding. Every variable-length field
//! is length-prefixed and map entries are fed in key order, so the result
//! does not depend on `HashMap` iteration order.

use std::collections::BTreeMap;
use std::fmt;

use blake3::Hasher;
use serde::{Deserialize, Serialize};

use crate::profile::Profile;

const DOMAIN: &[u8] = b"gameprofile/profile/v1";

/// Opaque fingerprint of a profile's state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionToken(String);

impl VersionToken {
    /// Computes the token for a profile.
    #[must_use]
    pub fn of(profile: &Profile) -> Self {
        let mut h = Hasher::new();
        h.update(DOMAIN);
        write_str(&mut h, &profile.id);
        h.update(&profile.coins.to_le_bytes());
        write_map(&mut h, &profile.inventory);
        write_map(&mut h, &profile.equipment);
        Self(h.finalize().to_hex().to_string())
    }

    /// Wraps a token received from a client.
    #[must_use]
    pub fn from_client(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Returns the token text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if this token matches the profile's current state.
    #[must_use]
    pub fn matches(&self, profile: &Profile) -> bool {
        *self == Self::of(profile)
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn write_str(h: &mut Hasher, s: &str) {
    h.update(&(s.len() as u64).to_le_bytes());
    h.update(s.as_bytes());
}

fn write_map(h: &mut Hasher, map: &std::collections::HashMap<String, String>) {
    let sorted: BTreeMap<&str, &str> = map.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    h.update(&(sorted.len() as u64).to_le_bytes());
    for (k, v) in sorted {
        write_str(h, k);
        write_str(h, v);
    }
}
