// Period math: date-range derivation and delta percentages
//
// Pure helpers with no I/O; every delta in the engine goes through
// `percent_change` so the zero-denominator policy lives in one place.

use chrono::{DateTime, Duration, Utc};

use crate::model::{DateRange, PeriodPair};
use crate::{PulseError, Result};

/// Derives the comparison window for a metrics query.
///
/// `previous` has the same duration as `current` and ends one millisecond
/// before `current` starts, so the two never overlap.
pub fn compute_range(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<PeriodPair> {
    if end < start {
        return Err(PulseError::InvalidRange(format!(
            "end {} precedes start {}",
            end, start
        )));
    }

    let duration = end - start;
    let previous_end = start - Duration::milliseconds(1);
    let previous_start = previous_end - duration;

    Ok(PeriodPair {
        current: DateRange { start, end },
        previous: DateRange {
            start: previous_start,
            end: previous_end,
        },
    })
}

/// The default dashboard window: today so far, compared against the same
/// span of time immediately preceding it.
pub fn today_window(now: DateTime<Utc>) -> DateRange {
    let start = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|midnight| midnight.and_utc())
        .unwrap_or(now - Duration::hours(24));
    DateRange { start, end: now }
}

/// Period-over-period change in percent.
///
/// Zero-denominator policy: +100 when the current value is positive,
/// otherwise 0. Documented choice, not inferred magic.
pub fn percent_change(current: f64, previous: f64) -> f64 {
    if previous == 0.0 {
        if current > 0.0 {
            100.0
        } else {
            0.0
        }
    } else {
        (current - previous) / previous * 100.0
    }
}
