//! TTL countdown: expiring entries and adjusting TTLs on the way out.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap};
use std::time::Duration;

use meridian_primitives::{Publication, Value, TTL_INFINITY};
use tokio::time::Instant;

/// Keys with less than this left to live are dropped from outgoing
/// publications; the receiver would only expire them moments later.
pub const TTL_ABOUT_TO_EXPIRE: Duration = Duration::from_millis(500);

/// One scheduled expiry. Entries are never removed when superseded; a
/// popped entry whose identity no longer matches the live record is
/// simply discarded.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TtlCountdownEntry {
    pub expiry: Instant,
    pub key: String,
    pub version: i64,
    pub ttl_version: i64,
    pub originator_id: String,
}

impl Ord for TtlCountdownEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.expiry
            .cmp(&other.expiry)
            .then_with(|| self.key.cmp(&other.key))
            .then_with(|| self.version.cmp(&other.version))
            .then_with(|| self.ttl_version.cmp(&other.ttl_version))
            .then_with(|| self.originator_id.cmp(&other.originator_id))
    }
}

impl PartialOrd for TtlCountdownEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of pending expiries, soonest first.
#[derive(Debug, Default)]
pub struct TtlCountdownQueue {
    heap: BinaryHeap<Reverse<TtlCountdownEntry>>,
}

impl TtlCountdownQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// When the countdown timer must fire next.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(entry)| entry.expiry)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TtlCountdownEntry> {
        self.heap.iter().map(|Reverse(entry)| entry)
    }

    /// Queues an expiry for every finite-TTL entry in an accepted delta.
    pub fn schedule_from(&mut self, key_vals: &BTreeMap<String, Value>, now: Instant) {
        for (key, value) in key_vals {
            if value.ttl == TTL_INFINITY {
                continue;
            }
            self.heap.push(Reverse(TtlCountdownEntry {
                expiry: now + Duration::from_millis(value.ttl.max(0) as u64),
                key: key.clone(),
                version: value.version,
                ttl_version: value.ttl_version,
                originator_id: value.originator_id.clone(),
            }));
        }
    }

    /// Pops everything expired at `now`, erasing store entries whose
    /// `(version, originator_id, ttl_version)` still match. Returns the
    /// erased keys.
    pub fn purge_expired(
        &mut self,
        store: &mut BTreeMap<String, Value>,
        now: Instant,
    ) -> Vec<String> {
        let mut expired = Vec::new();

        loop {
            let due = match self.heap.peek() {
                Some(Reverse(entry)) => entry.expiry <= now,
                None => false,
            };
            if !due {
                break;
            }

            let Reverse(top) = self.heap.pop().expect("peeked entry");
            let matches = store.get(&top.key).is_some_and(|value| {
                value.version == top.version
                    && value.originator_id == top.originator_id
                    && value.ttl_version == top.ttl_version
            });
            if matches {
                let _ = store.remove(&top.key);
                expired.push(top.key);
            }
        }

        expired
    }
}

/// Rewrites each outgoing entry's TTL to its remaining lifetime minus the
/// per-hop decrement. Entries at or below the decrement are dropped, as
/// are (optionally) entries about to expire. The decrement bounds the
/// hop count of any value at roughly `ttl / decrement`.
pub fn update_publication_ttl(
    queue: &TtlCountdownQueue,
    ttl_decrement: Duration,
    publication: &mut Publication,
    remove_about_to_expire: bool,
    now: Instant,
) {
    let decrement_ms = ttl_decrement.as_millis() as i64;
    let mut to_drop = Vec::new();

    for entry in queue.iter() {
        // The queue entry must describe exactly the record being sent.
        let Some(value) = publication.key_vals.get(&entry.key) else {
            continue;
        };
        if value.version != entry.version
            || value.originator_id != entry.originator_id
            || value.ttl_version != entry.ttl_version
        {
            continue;
        }

        let time_left = entry.expiry.duration_since(now);
        if time_left <= ttl_decrement {
            to_drop.push(entry.key.clone());
            continue;
        }
        if remove_about_to_expire && time_left < TTL_ABOUT_TO_EXPIRE {
            to_drop.push(entry.key.clone());
            continue;
        }

        if let Some(value) = publication.key_vals.get_mut(&entry.key) {
            value.ttl = time_left.as_millis() as i64 - decrement_ms;
        }
    }

    for key in to_drop {
        let _ = publication.key_vals.remove(&key);
    }
}

#[cfg(test)]
#[path = "ttl_tests.rs"]
mod ttl_tests;
