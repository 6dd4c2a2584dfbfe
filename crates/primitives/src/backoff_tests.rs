use std::time::Duration;

use super::ExponentialBackoff;

#[test]
fn fresh_backoff_is_ready() {
    let backoff = ExponentialBackoff::new(Duration::from_millis(10), Duration::from_millis(80));
    assert!(backoff.can_try_now());
    assert_eq!(backoff.time_remaining_until_retry(), Duration::ZERO);
}

#[test]
fn errors_double_the_wait_up_to_the_cap() {
    let mut backoff =
        ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(350));

    backoff.report_error();
    let first = backoff.time_remaining_until_retry();
    assert!(first <= Duration::from_millis(100));
    assert!(!backoff.can_try_now());

    backoff.report_error();
    let second = backoff.time_remaining_until_retry();
    assert!(second > first);
    assert!(second <= Duration::from_millis(200));

    // Two more errors would exceed the cap without it.
    backoff.report_error();
    backoff.report_error();
    assert!(backoff.time_remaining_until_retry() <= Duration::from_millis(350));
}

#[test]
fn success_resets_the_schedule() {
    let mut backoff =
        ExponentialBackoff::new(Duration::from_millis(50), Duration::from_millis(400));
    backoff.report_error();
    backoff.report_error();

    backoff.report_success();
    assert!(backoff.can_try_now());

    backoff.report_error();
    assert!(backoff.time_remaining_until_retry() <= Duration::from_millis(50));
}
