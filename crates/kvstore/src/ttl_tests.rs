use std::time::Duration;

use meridian_primitives::{Publication, Value, TTL_INFINITY};
use tokio::time::Instant;

use super::*;

fn finite(version: i64, ttl: i64) -> Value {
    let mut v = Value::new(version, "node-a", b"x".to_vec(), ttl);
    v.ensure_hash();
    v
}

fn keyed(key: &str, value: Value) -> std::collections::BTreeMap<String, Value> {
    let mut map = std::collections::BTreeMap::new();
    let _ = map.insert(key.to_owned(), value);
    map
}

#[test]
fn infinite_ttls_are_never_scheduled() {
    let mut queue = TtlCountdownQueue::new();
    queue.schedule_from(
        &keyed("k", Value::new(1, "node-a", b"x".to_vec(), TTL_INFINITY)),
        Instant::now(),
    );
    assert!(queue.is_empty());
    assert!(queue.next_expiry().is_none());
}

#[test]
fn expired_matching_entry_erases_the_key() {
    let now = Instant::now();
    let mut queue = TtlCountdownQueue::new();
    let mut store = keyed("k", finite(1, 50));
    queue.schedule_from(&store.clone(), now);

    // Not yet due.
    assert!(queue.purge_expired(&mut store, now).is_empty());

    let expired = queue.purge_expired(&mut store, now + Duration::from_millis(60));
    assert_eq!(expired, vec!["k".to_owned()]);
    assert!(store.is_empty());
    assert!(queue.is_empty());
}

#[test]
fn superseded_entries_are_discarded_on_pop() {
    let now = Instant::now();
    let mut queue = TtlCountdownQueue::new();
    let mut store = keyed("k", finite(1, 50));
    queue.schedule_from(&store.clone(), now);

    // The record was replaced by a newer version before the timer fired.
    let _ = store.insert("k".to_owned(), finite(2, 10_000));
    queue.schedule_from(&store.clone(), now);

    let expired = queue.purge_expired(&mut store, now + Duration::from_millis(60));
    assert!(expired.is_empty());
    assert!(store.contains_key("k"));
    // The newer entry is still pending.
    assert_eq!(queue.len(), 1);
}

#[test]
fn next_expiry_is_the_soonest_entry() {
    let now = Instant::now();
    let mut queue = TtlCountdownQueue::new();
    queue.schedule_from(&keyed("slow", finite(1, 10_000)), now);
    queue.schedule_from(&keyed("fast", finite(1, 100)), now);

    let next = queue.next_expiry().expect("two entries queued");
    assert_eq!(next, now + Duration::from_millis(100));
}

#[test]
fn outgoing_ttl_is_remaining_time_minus_decrement() {
    let now = Instant::now();
    let mut queue = TtlCountdownQueue::new();
    let store = keyed("k", finite(1, 10_000));
    queue.schedule_from(&store, now);

    let mut publication = Publication {
        key_vals: store,
        ..Default::default()
    };
    update_publication_ttl(
        &queue,
        Duration::from_millis(1),
        &mut publication,
        false,
        now + Duration::from_millis(4_000),
    );

    let sent = &publication.key_vals["k"];
    assert_eq!(sent.ttl, 6_000 - 1);
}

#[test]
fn keys_about_to_expire_are_dropped_from_floods() {
    let now = Instant::now();
    let mut queue = TtlCountdownQueue::new();
    let store = keyed("k", finite(1, 600));
    queue.schedule_from(&store, now);

    let mut publication = Publication {
        key_vals: store,
        ..Default::default()
    };
    // 300ms left: under the about-to-expire threshold.
    update_publication_ttl(
        &queue,
        Duration::from_millis(1),
        &mut publication,
        true,
        now + Duration::from_millis(300),
    );

    assert!(publication.key_vals.is_empty());
}

#[test]
fn mismatched_queue_entries_leave_the_publication_alone() {
    let now = Instant::now();
    let mut queue = TtlCountdownQueue::new();
    queue.schedule_from(&keyed("k", finite(1, 5_000)), now);

    // The publication carries a newer record than the queue knows about.
    let mut publication = Publication {
        key_vals: keyed("k", finite(2, 7_000)),
        ..Default::default()
    };
    update_publication_ttl(
        &queue,
        Duration::from_millis(1),
        &mut publication,
        false,
        now,
    );

    assert_eq!(publication.key_vals["k"].ttl, 7_000);
}
