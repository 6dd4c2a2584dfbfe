use std::time::Duration;

use meridian_primitives::{Publication, Value, TTL_INFINITY};
use tokio::time::Instant;

use super::*;

#[test]
fn bucket_grants_the_burst_then_refuses() {
    let now = Instant::now();
    let mut bucket = TokenBucket::new(10, 3, now);

    assert!(bucket.consume(1.0, now));
    assert!(bucket.consume(1.0, now));
    assert!(bucket.consume(1.0, now));
    assert!(!bucket.consume(1.0, now));
}

#[test]
fn bucket_refills_over_time_up_to_the_burst() {
    let now = Instant::now();
    let mut bucket = TokenBucket::new(10, 3, now);
    for _ in 0..3 {
        assert!(bucket.consume(1.0, now));
    }

    // 100ms at 10/s earns one token back.
    let later = now + Duration::from_millis(100);
    assert!(bucket.consume(1.0, later));
    assert!(!bucket.consume(1.0, later));

    // A long idle period banks at most `burst`.
    let much_later = later + Duration::from_secs(60);
    for _ in 0..3 {
        assert!(bucket.consume(1.0, much_later));
    }
    assert!(!bucket.consume(1.0, much_later));
}

#[test]
fn buffer_groups_keys_by_flood_root() {
    let mut buffer = PublicationBuffer::default();
    assert!(buffer.is_empty());

    let mut rooted = Publication {
        flood_root_id: Some("root-a".to_owned()),
        ..Default::default()
    };
    let _ = rooted.key_vals.insert(
        "k1".to_owned(),
        Value::new(1, "node-a", b"x".to_vec(), TTL_INFINITY),
    );
    rooted.expired_keys.push("k2".to_owned());

    let mut unrooted = Publication::default();
    let _ = unrooted.key_vals.insert(
        "k3".to_owned(),
        Value::new(1, "node-b", b"y".to_vec(), TTL_INFINITY),
    );

    buffer.buffer(&rooted);
    buffer.buffer(&rooted);
    buffer.buffer(&unrooted);

    let mut drained = buffer.drain();
    drained.sort_by(|a, b| a.0.cmp(&b.0));
    assert!(buffer.is_empty());

    assert_eq!(drained.len(), 2);
    let (no_root, keys) = &drained[0];
    assert!(no_root.is_none());
    assert_eq!(keys.len(), 1);

    let (root, keys) = &drained[1];
    assert_eq!(root.as_deref(), Some("root-a"));
    // Duplicate buffering folds into one key set.
    assert_eq!(keys.len(), 2);
}
