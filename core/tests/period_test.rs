use chrono::{Duration, TimeZone, Utc};
use tillpulse_core::period::{compute_range, percent_change, today_window};
use tillpulse_core::PulseError;

#[test]
fn previous_window_has_same_duration_and_precedes_current() {
    let start = Utc.with_ymd_and_hms(2024, 1, 8, 0, 0, 0).unwrap();
    let end = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();

    let periods = compute_range(start, end).expect("valid range");

    assert_eq!(periods.current.start, start);
    assert_eq!(periods.current.end, end);
    assert_eq!(periods.previous.duration(), periods.current.duration());
    assert!(periods.previous.end < periods.current.start);
}

#[test]
fn previous_window_ends_one_millisecond_before_current() {
    let start = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
    let end = start + Duration::hours(6);

    let periods = compute_range(start, end).expect("valid range");

    assert_eq!(periods.previous.end, start - Duration::milliseconds(1));
    assert_eq!(
        periods.previous.start,
        periods.previous.end - Duration::hours(6)
    );
}

#[test]
fn zero_length_range_is_allowed() {
    let instant = Utc.with_ymd_and_hms(2024, 6, 1, 9, 30, 0).unwrap();

    let periods = compute_range(instant, instant).expect("zero-length range");

    assert_eq!(periods.current.duration(), Duration::zero());
    assert_eq!(periods.previous.duration(), Duration::zero());
    assert!(periods.previous.end < periods.current.start);
}

#[test]
fn end_before_start_is_rejected_not_fixed() {
    let start = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
    let end = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

    let err = compute_range(start, end).expect_err("inverted range");
    assert!(matches!(err, PulseError::InvalidRange(_)));
}

#[test]
fn percent_change_with_zero_previous_follows_documented_policy() {
    assert_eq!(percent_change(42.0, 0.0), 100.0);
    assert_eq!(percent_change(0.0, 0.0), 0.0);
    assert_eq!(percent_change(-5.0, 0.0), 0.0);
}

#[test]
fn percent_change_computes_relative_delta() {
    assert_eq!(percent_change(150.0, 100.0), 50.0);
    assert_eq!(percent_change(50.0, 100.0), -50.0);
    assert_eq!(percent_change(100.0, 100.0), 0.0);
}

#[test]
fn today_window_starts_at_midnight_and_ends_now() {
    let now = Utc.with_ymd_and_hms(2024, 5, 20, 14, 45, 30).unwrap();

    let window = today_window(now);

    assert_eq!(window.start, Utc.with_ymd_and_hms(2024, 5, 20, 0, 0, 0).unwrap());
    assert_eq!(window.end, now);
}
