use super::*;

fn value(version: i64, originator: &str, payload: &[u8]) -> Value {
    Value::new(version, originator, payload.to_vec(), TTL_INFINITY)
}

fn hashed(version: i64, originator: &str, payload: &[u8]) -> Value {
    let mut v = value(version, originator, payload);
    v.ensure_hash();
    v
}

fn singleton(key: &str, v: Value) -> BTreeMap<String, Value> {
    let mut map = BTreeMap::new();
    let _ = map.insert(key.to_owned(), v);
    map
}

#[test]
fn newer_version_replaces_the_record() {
    let mut store = singleton("k", hashed(1, "node-a", b"x"));

    let incoming = singleton("k", value(2, "node-a", b"y"));
    let delta = merge_key_values(&mut store, &incoming, None);

    assert_eq!(delta.len(), 1);
    let merged = &store["k"];
    assert_eq!(merged.version, 2);
    assert_eq!(merged.value.as_deref(), Some(b"y".as_slice()));
    assert!(merged.hash.is_some());
}

#[test]
fn same_version_higher_originator_wins() {
    let mut store = singleton("k", hashed(1, "node-a", b"x"));

    let incoming = singleton("k", value(1, "node-b", b"w"));
    let delta = merge_key_values(&mut store, &incoming, None);

    assert_eq!(delta.len(), 1);
    assert_eq!(store["k"].originator_id, "node-b");
    assert_eq!(store["k"].value.as_deref(), Some(b"w".as_slice()));
}

#[test]
fn ttl_refresh_without_value_bumps_only_ttl() {
    let mut seeded = hashed(1, "node-a", b"x");
    seeded.ttl = 1000;
    seeded.ttl_version = 3;
    let original_hash = seeded.hash;
    let mut store = singleton("k", seeded);

    let refresh = Value::ttl_refresh(1, "node-a", 5000, 4);
    let delta = merge_key_values(&mut store, &singleton("k", refresh), None);

    assert_eq!(delta.len(), 1);
    let merged = &store["k"];
    assert_eq!(merged.ttl, 5000);
    assert_eq!(merged.ttl_version, 4);
    assert_eq!(merged.value.as_deref(), Some(b"x".as_slice()));
    assert_eq!(merged.hash, original_hash);
    // The delta records the refresh, not the full value.
    assert!(delta["k"].value.is_none());
}

#[test]
fn stale_ttl_refresh_is_ignored() {
    let mut seeded = hashed(1, "node-a", b"x");
    seeded.ttl = 1000;
    seeded.ttl_version = 3;
    let mut store = singleton("k", seeded);

    let refresh = Value::ttl_refresh(1, "node-a", 9000, 3);
    let delta = merge_key_values(&mut store, &singleton("k", refresh), None);

    assert!(delta.is_empty());
    assert_eq!(store["k"].ttl, 1000);
}

#[test]
fn older_version_is_skipped() {
    let mut store = singleton("k", hashed(5, "node-a", b"x"));

    let delta = merge_key_values(&mut store, &singleton("k", value(4, "node-z", b"zzz")), None);

    assert!(delta.is_empty());
    assert_eq!(store["k"].version, 5);
}

#[test]
fn non_positive_ttl_is_rejected_on_ingress() {
    let mut store = BTreeMap::new();

    let mut dead = value(1, "node-a", b"x");
    dead.ttl = 0;
    let delta = merge_key_values(&mut store, &singleton("k", dead), None);

    assert!(delta.is_empty());
    assert!(store.is_empty());
}

#[test]
fn merging_a_value_into_itself_is_a_noop() {
    let v = hashed(2, "node-a", b"x");
    let mut store = singleton("k", v.clone());

    let delta = merge_key_values(&mut store, &singleton("k", v.clone()), None);

    assert!(delta.is_empty());
    assert_eq!(store["k"], v);
}

#[test]
fn merge_is_order_independent() {
    let updates = [
        value(1, "node-a", b"x"),
        value(2, "node-a", b"y"),
        value(2, "node-b", b"w"),
        value(3, "node-a", b"z"),
    ];

    // Apply in insertion order and in reverse; both runs must converge on
    // the unique maximum under the merge order.
    let mut forward = BTreeMap::new();
    for v in &updates {
        let _ = merge_key_values(&mut forward, &singleton("k", v.clone()), None);
    }

    let mut backward = BTreeMap::new();
    for v in updates.iter().rev() {
        let _ = merge_key_values(&mut backward, &singleton("k", v.clone()), None);
    }

    assert_eq!(forward["k"].version, 3);
    assert_eq!(forward["k"], backward["k"]);
}

#[test]
fn filters_match_by_prefix_or_originator() {
    let filters = KeyFilters::new(vec!["adj:".to_owned()], ["node-x".to_owned()]);

    assert!(filters.key_match("adj:node-a", &value(1, "node-a", b"")));
    assert!(filters.key_match("prefix:node-x", &value(1, "node-x", b"")));
    assert!(!filters.key_match("prefix:node-a", &value(1, "node-a", b"")));

    assert!(KeyFilters::all().key_match("anything", &value(1, "whoever", b"")));
}

#[test]
fn filtered_updates_never_enter_the_store() {
    let filters = KeyFilters::new(vec!["adj:".to_owned()], []);
    let mut store = BTreeMap::new();

    let mut incoming = BTreeMap::new();
    let _ = incoming.insert("adj:node-a".to_owned(), value(1, "node-a", b"in"));
    let _ = incoming.insert("other:node-a".to_owned(), value(1, "node-a", b"out"));

    let delta = merge_key_values(&mut store, &incoming, Some(&filters));

    assert_eq!(delta.len(), 1);
    assert!(store.contains_key("adj:node-a"));
    assert!(!store.contains_key("other:node-a"));
}

#[test]
fn compare_values_orders_the_full_tuple() {
    assert_eq!(
        compare_values(&hashed(2, "a", b"x"), &hashed(1, "a", b"x")),
        ComparisonResult::Greater
    );
    assert_eq!(
        compare_values(&hashed(1, "a", b"x"), &hashed(1, "b", b"x")),
        ComparisonResult::Less
    );

    // Same hash, differing ttl versions.
    let mut older = hashed(1, "a", b"x");
    let mut newer = older.clone();
    older.ttl_version = 1;
    newer.ttl_version = 2;
    assert_eq!(compare_values(&newer, &older), ComparisonResult::Greater);

    assert_eq!(
        compare_values(&hashed(1, "a", b"x"), &hashed(1, "a", b"x")),
        ComparisonResult::Equal
    );
}

#[test]
fn compare_values_without_payloads_is_unknown() {
    // Hash-only records with different hashes cannot be ordered.
    let lhs = hashed(1, "a", b"x").to_hash_only();
    let rhs = hashed(1, "a", b"y").to_hash_only();
    assert_eq!(compare_values(&lhs, &rhs), ComparisonResult::Unknown);
}

#[test]
fn dump_difference_splits_keys_both_ways() {
    // A holds k1(v1) and k2; B holds k1(v2) and k3. From A's perspective,
    // with B's hash dump as the request.
    let mut mine = BTreeMap::new();
    let _ = mine.insert("k1".to_owned(), hashed(1, "node-a", b"a"));
    let _ = mine.insert("k2".to_owned(), hashed(2, "node-a", b"b"));

    let mut req = BTreeMap::new();
    let _ = req.insert("k1".to_owned(), hashed(2, "node-a", b"a2").to_hash_only());
    let _ = req.insert("k3".to_owned(), hashed(1, "node-b", b"c").to_hash_only());

    let diff = dump_difference(&mine, &req);

    // We are better on nothing for k1 (requester newer) and own k2 alone.
    assert_eq!(diff.key_vals.keys().collect::<Vec<_>>(), vec!["k2"]);
    let mut tobe = diff.tobe_updated_keys.expect("requested keys");
    tobe.sort();
    assert_eq!(tobe, vec!["k1".to_owned(), "k3".to_owned()]);
}

#[test]
fn dump_difference_exchanges_both_ways_on_unknown() {
    let mut mine = BTreeMap::new();
    let _ = mine.insert("k".to_owned(), hashed(1, "node-a", b"mine").to_hash_only());

    let mut req = BTreeMap::new();
    let _ = req.insert("k".to_owned(), hashed(1, "node-a", b"theirs").to_hash_only());

    let diff = dump_difference(&mine, &req);

    assert!(diff.key_vals.contains_key("k"));
    assert_eq!(diff.tobe_updated_keys, Some(vec!["k".to_owned()]));
}

#[test]
fn hash_dump_strips_payloads() {
    let mut store = BTreeMap::new();
    let _ = store.insert("k".to_owned(), hashed(1, "node-a", b"payload"));

    let dump = dump_hash_with_filters(&store, &KeyFilters::all());
    let entry = &dump.key_vals["k"];
    assert!(entry.value.is_none());
    assert_eq!(entry.hash, store["k"].hash);
}
