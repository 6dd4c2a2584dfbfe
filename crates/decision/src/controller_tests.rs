use std::time::Duration;

use meridian_primitives::PerfEvents;
use tokio::time::Instant;

use super::{Debounce, PendingUpdates};

fn chain_started_at(ts: i64) -> PerfEvents {
    PerfEvents {
        events: vec![meridian_primitives::PerfEvent {
            node_name: "origin".to_owned(),
            event_name: "ADJ_DB_UPDATED".to_owned(),
            unix_ts: ts,
        }],
    }
}

#[test]
fn counts_every_buffered_update() {
    let mut pending = PendingUpdates::default();
    pending.add_update("node-a", None);
    pending.add_update("node-b", None);
    pending.add_update("node-c", Some(&chain_started_at(100)));
    assert_eq!(pending.count, 3);
}

#[test]
fn keeps_the_oldest_perf_chain() {
    let mut pending = PendingUpdates::default();
    pending.add_update("node-a", Some(&chain_started_at(200)));
    pending.add_update("node-b", Some(&chain_started_at(100)));
    pending.add_update("node-c", Some(&chain_started_at(300)));

    let chain = pending.perf_events.as_ref().expect("chain kept");
    assert_eq!(chain.events[0].unix_ts, 100);
    // The receive marker was appended to the kept chain.
    assert_eq!(
        chain.events.last().expect("marker").event_name,
        "DECISION_RECEIVED"
    );
}

#[test]
fn missing_perf_information_synthesizes_a_chain_once() {
    let mut pending = PendingUpdates::default();
    pending.add_update("node-a", None);
    let first = pending.perf_events.clone().expect("synthesized");

    pending.add_update("node-b", None);
    assert_eq!(pending.perf_events, Some(first));
}

#[test]
fn clear_resets_everything() {
    let mut pending = PendingUpdates::default();
    pending.add_update("node-a", Some(&chain_started_at(100)));
    pending.clear();
    assert_eq!(pending.count, 0);
    assert!(pending.perf_events.is_none());
    assert!(pending.min_ts.is_none());
}

fn window(debounce: &Debounce) -> Duration {
    debounce
        .deadline()
        .expect("window armed")
        .duration_since(Instant::now())
}

#[test]
fn debounce_windows_grow_while_work_keeps_arriving() {
    let mut debounce = Debounce::new(Duration::from_millis(100), Duration::from_millis(800));

    // First burst arms the floor window.
    debounce.schedule();
    let first = window(&debounce);
    assert!(first <= Duration::from_millis(100));

    // Each window that fires with work pending doubles the next one.
    debounce.fired_busy();
    let second = window(&debounce);
    assert!(second > first);
    assert!(second <= Duration::from_millis(200));

    debounce.fired_busy();
    let third = window(&debounce);
    assert!(third > second);
    assert!(third <= Duration::from_millis(400));

    // An arbitrarily long storm saturates at the ceiling.
    debounce.fired_busy();
    debounce.fired_busy();
    debounce.fired_busy();
    assert!(window(&debounce) <= Duration::from_millis(800));
}

#[test]
fn idle_window_resets_the_debounce_floor() {
    let mut debounce = Debounce::new(Duration::from_millis(100), Duration::from_millis(800));
    debounce.schedule();
    debounce.fired_busy();
    debounce.fired_busy();
    assert!(window(&debounce) > Duration::from_millis(200));

    // The trailing window found nothing pending: storm over.
    debounce.fired_idle();
    assert!(debounce.deadline().is_none());

    debounce.schedule();
    assert!(window(&debounce) <= Duration::from_millis(100));
}

#[test]
fn updates_during_a_pending_window_do_not_rearm_it() {
    let mut debounce = Debounce::new(Duration::from_millis(100), Duration::from_millis(800));
    debounce.schedule();
    let armed = debounce.deadline();

    debounce.schedule();
    debounce.schedule();
    assert_eq!(debounce.deadline(), armed);
}
