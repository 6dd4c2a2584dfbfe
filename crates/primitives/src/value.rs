//! Versioned key-values and the publication deltas they travel in.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// TTL sentinel for keys that never expire.
pub const TTL_INFINITY: i64 = i64::MAX;

/// A single versioned record in the replicated store.
///
/// The tuple `(version, originator_id, value, ttl_version)` is totally
/// ordered; merge resolves conflicts by that order so every store converges
/// on the same record for the same logical update. `version == 0` is the
/// "I have nothing" sentinel used during sync and never appears in a store.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Value {
    pub version: i64,
    pub originator_id: String,
    /// Absent for hash dumps and pure TTL refreshes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Vec<u8>>,
    /// Milliseconds, or [`TTL_INFINITY`].
    pub ttl: i64,
    #[serde(default)]
    pub ttl_version: i64,
    /// Digest of `(version, originator_id, value)`, filled lazily on merge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<i64>,
}

impl Value {
    pub fn new(
        version: i64,
        originator_id: impl Into<String>,
        value: impl Into<Vec<u8>>,
        ttl: i64,
    ) -> Self {
        Self {
            version,
            originator_id: originator_id.into(),
            value: Some(value.into()),
            ttl,
            ttl_version: 0,
            hash: None,
        }
    }

    /// A value-less record refreshing only the TTL of an existing entry.
    pub fn ttl_refresh(
        version: i64,
        originator_id: impl Into<String>,
        ttl: i64,
        ttl_version: i64,
    ) -> Self {
        Self {
            version,
            originator_id: originator_id.into(),
            value: None,
            ttl,
            ttl_version,
            hash: None,
        }
    }

    pub fn compute_hash(&self) -> i64 {
        generate_hash(self.version, &self.originator_id, self.value.as_deref())
    }

    /// Fills `hash` if it has not been computed yet.
    pub fn ensure_hash(&mut self) {
        if self.hash.is_none() {
            self.hash = Some(self.compute_hash());
        }
    }

    /// Strips the payload, keeping version/originator/hash/ttl metadata.
    pub fn to_hash_only(&self) -> Self {
        Self {
            version: self.version,
            originator_id: self.originator_id.clone(),
            value: None,
            ttl: self.ttl,
            ttl_version: self.ttl_version,
            hash: self.hash,
        }
    }
}

/// Digest of `(version, originator_id, value)` as a signed 64-bit integer.
pub fn generate_hash(version: i64, originator_id: &str, value: Option<&[u8]>) -> i64 {
    let mut hasher = Sha256::new();
    hasher.update(version.to_be_bytes());
    hasher.update(originator_id.as_bytes());
    if let Some(value) = value {
        hasher.update(value);
    }
    let digest = hasher.finalize();
    let mut word = [0_u8; 8];
    word.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(word)
}

/// The unit of flooded change: updated key-values plus expiration
/// tombstones, carrying the path vector used for loop detection.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Publication {
    #[serde(default)]
    pub key_vals: BTreeMap<String, Value>,
    #[serde(default)]
    pub expired_keys: Vec<String>,
    /// Path vector; the terminal entry is the forwarder we got this from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_ids: Option<Vec<String>>,
    /// Root of the spanning tree this publication is flooded on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flood_root_id: Option<String>,
    /// Keys the sync responder wants back; only set during three-way sync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tobe_updated_keys: Option<Vec<String>>,
}

impl Publication {
    pub fn is_empty(&self) -> bool {
        self.key_vals.is_empty() && self.expired_keys.is_empty()
    }
}

#[cfg(test)]
#[path = "value_tests.rs"]
mod value_tests;
