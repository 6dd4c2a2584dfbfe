use super::*;

#[test]
fn count_sum_and_avg_fold_differently() {
    let store = CounterStore::new();

    for value in [10, 20, 30] {
        store.add_value("updates.count", value, ExportType::Count);
        store.add_value("updates.sum", value, ExportType::Sum);
        store.add_value("updates.avg", value, ExportType::Avg);
    }

    let snapshot = store.snapshot();
    assert_eq!(snapshot["updates.count"], 3);
    assert_eq!(snapshot["updates.sum"], 60);
    assert_eq!(snapshot["updates.avg"], 20);
}

#[test]
fn gauges_overwrite_previous_values() {
    let store = CounterStore::new();
    store.set_gauge("kvstore.num_keys", 5);
    store.set_gauge("kvstore.num_keys", 7);

    assert_eq!(store.snapshot()["kvstore.num_keys"], 7);
}

#[test]
fn snapshot_is_non_destructive() {
    let store = CounterStore::new();
    store.bump("events");

    assert_eq!(store.snapshot()["events"], 1);
    assert_eq!(store.snapshot()["events"], 1);
}

#[test]
fn null_monitor_accepts_submissions() {
    let monitor = null_monitor();
    monitor.set_counters("kvstore", BTreeMap::new());
}
