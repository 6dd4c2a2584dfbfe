//! The key-value map and its deterministic merge.
//!
//! `merge_key_values` folds an incoming batch into the local map under the
//! strict total order on `(version, originator_id, value, ttl_version)`;
//! every store applying the same updates in any order lands on the same
//! winning record per key.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use meridian_primitives::{Publication, Value, TTL_INFINITY};
use tracing::trace;

/// Outcome of comparing two values for the same key.
///
/// `Unknown` arises when a hash-only record meets a record it cannot be
/// ordered against; three-way sync then exchanges both directions.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ComparisonResult {
    Greater,
    Less,
    Equal,
    Unknown,
}

/// Accepts keys by prefix OR values by originator. An empty dimension
/// matches everything; both empty matches all.
#[derive(Clone, Debug, Default)]
pub struct KeyFilters {
    key_prefixes: Vec<String>,
    originator_ids: BTreeSet<String>,
}

impl KeyFilters {
    pub fn new(
        key_prefixes: Vec<String>,
        originator_ids: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            key_prefixes,
            originator_ids: originator_ids.into_iter().collect(),
        }
    }

    /// A filter that accepts everything.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn key_match(&self, key: &str, value: &Value) -> bool {
        if self.key_prefixes.is_empty() && self.originator_ids.is_empty() {
            return true;
        }
        if !self.key_prefixes.is_empty()
            && self.key_prefixes.iter().any(|prefix| key.starts_with(prefix))
        {
            return true;
        }
        !self.originator_ids.is_empty() && self.originator_ids.contains(&value.originator_id)
    }

    pub fn key_prefixes(&self) -> &[String] {
        &self.key_prefixes
    }

    pub fn originator_ids(&self) -> &BTreeSet<String> {
        &self.originator_ids
    }
}

/// Folds `key_vals` into `store`, returning the delta of accepted updates
/// (full replacements and TTL bumps alike, recorded as received).
pub fn merge_key_values(
    store: &mut BTreeMap<String, Value>,
    key_vals: &BTreeMap<String, Value>,
    filters: Option<&KeyFilters>,
) -> BTreeMap<String, Value> {
    let mut updates = BTreeMap::new();

    for (key, value) in key_vals {
        if let Some(filters) = filters {
            if !filters.key_match(key, value) {
                trace!(%key, originator = %value.originator_id, "filtered out");
                continue;
            }
        }

        // TTL must be infinite or positive.
        if value.ttl != TTL_INFINITY && value.ttl <= 0 {
            continue;
        }

        let (update_all, update_ttl) = match store.get(key) {
            // Versions start at 1; version 0 is the "nothing" sentinel and
            // never enters the map.
            None => (value.value.is_some() && value.version > 0, false),
            Some(existing) => decide_update(value, existing),
        };

        if update_all {
            let mut stored = value.clone();
            stored.ensure_hash();
            let _ = store.insert(key.clone(), stored);
            let _ = updates.insert(key.clone(), value.clone());
        } else if update_ttl {
            if let Some(existing) = store.get_mut(key) {
                existing.ttl = value.ttl;
                existing.ttl_version = value.ttl_version;
            }
            let _ = updates.insert(key.clone(), value.clone());
        } else {
            trace!(%key, "no update needed");
        }
    }

    updates
}

fn decide_update(value: &Value, existing: &Value) -> (bool, bool) {
    if value.version < existing.version {
        return (false, false);
    }

    let mut update_all = false;
    let mut update_ttl = false;

    if value.value.is_some() {
        if value.version > existing.version {
            update_all = true;
        } else if value.originator_id > existing.originator_id {
            update_all = true;
        } else if value.originator_id == existing.originator_id {
            // Same version and originator: a previous incarnation reflected
            // back. One side must win deterministically or stores never
            // reconcile after restarts.
            match (value.value.as_deref(), existing.value.as_deref()) {
                (Some(new_bytes), Some(old_bytes)) => match new_bytes.cmp(old_bytes) {
                    Ordering::Greater => update_all = true,
                    Ordering::Equal => update_ttl = value.ttl_version > existing.ttl_version,
                    Ordering::Less => {}
                },
                (Some(_), None) => update_all = true,
                _ => {}
            }
        }
    }

    // Value-less records refresh the TTL of the exact record they name.
    if value.value.is_none()
        && value.version == existing.version
        && value.originator_id == existing.originator_id
        && value.ttl_version > existing.ttl_version
    {
        update_ttl = true;
    }

    (update_all, update_ttl)
}

/// Orders two values by `(version, originator_id, value, ttl_version)`.
pub fn compare_values(v1: &Value, v2: &Value) -> ComparisonResult {
    if v1.version != v2.version {
        return if v1.version > v2.version {
            ComparisonResult::Greater
        } else {
            ComparisonResult::Less
        };
    }

    if v1.originator_id != v2.originator_id {
        return if v1.originator_id > v2.originator_id {
            ComparisonResult::Greater
        } else {
            ComparisonResult::Less
        };
    }

    // Equal hashes mean equal (version, originator, value); only the
    // ttl-version can still differ.
    if let (Some(h1), Some(h2)) = (v1.hash, v2.hash) {
        if h1 == h2 {
            return match v1.ttl_version.cmp(&v2.ttl_version) {
                Ordering::Greater => ComparisonResult::Greater,
                Ordering::Less => ComparisonResult::Less,
                Ordering::Equal => ComparisonResult::Equal,
            };
        }
    }

    match (v1.value.as_deref(), v2.value.as_deref()) {
        (Some(b1), Some(b2)) => match b1.cmp(b2) {
            Ordering::Greater => ComparisonResult::Greater,
            Ordering::Less => ComparisonResult::Less,
            Ordering::Equal => ComparisonResult::Equal,
        },
        _ => ComparisonResult::Unknown,
    }
}

/// Publication of the requested keys that exist in the store.
pub fn get_key_vals(store: &BTreeMap<String, Value>, keys: &[String]) -> Publication {
    let mut publication = Publication::default();
    for key in keys {
        if let Some(value) = store.get(key) {
            let _ = publication.key_vals.insert(key.clone(), value.clone());
        }
    }
    publication
}

/// Full dump of every entry the filters accept.
pub fn dump_all_with_filters(store: &BTreeMap<String, Value>, filters: &KeyFilters) -> Publication {
    let mut publication = Publication::default();
    for (key, value) in store {
        if !filters.key_match(key, value) {
            continue;
        }
        let _ = publication.key_vals.insert(key.clone(), value.clone());
    }
    publication
}

/// Hash-only dump of every entry the filters accept.
pub fn dump_hash_with_filters(
    store: &BTreeMap<String, Value>,
    filters: &KeyFilters,
) -> Publication {
    let mut publication = Publication::default();
    for (key, value) in store {
        if !filters.key_match(key, value) {
            continue;
        }
        let _ = publication.key_vals.insert(key.clone(), value.to_hash_only());
    }
    publication
}

/// Diffs our entries against a requester's hash dump.
///
/// `key_vals` carries the keys where we are better or the requester has
/// nothing; `tobe_updated_keys` names the keys where the requester is
/// better or we have nothing, so it can send them back as the third leg
/// of the sync. On `Unknown` both directions are exchanged.
pub fn dump_difference(
    my_key_vals: &BTreeMap<String, Value>,
    req_key_vals: &BTreeMap<String, Value>,
) -> Publication {
    let mut publication = Publication::default();
    let mut tobe_updated = Vec::new();

    let all_keys: BTreeSet<&String> = my_key_vals.keys().chain(req_key_vals.keys()).collect();

    for key in all_keys {
        match (my_key_vals.get(key), req_key_vals.get(key)) {
            (None, _) => tobe_updated.push(key.clone()),
            (Some(my_value), None) => {
                let _ = publication.key_vals.insert(key.clone(), my_value.clone());
            }
            (Some(my_value), Some(req_value)) => {
                let ordering = compare_values(my_value, req_value);
                if matches!(
                    ordering,
                    ComparisonResult::Greater | ComparisonResult::Unknown
                ) {
                    let _ = publication.key_vals.insert(key.clone(), my_value.clone());
                }
                if matches!(ordering, ComparisonResult::Less | ComparisonResult::Unknown) {
                    tobe_updated.push(key.clone());
                }
            }
        }
    }

    publication.tobe_updated_keys = Some(tobe_updated);
    publication
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod store_tests;
