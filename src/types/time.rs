//! Saturating arithmetic between wall-clock instants and std durations.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// `at + delay`, clamped to the latest representable instant.
pub fn saturating_add(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| at.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `at - window`, clamped to the earliest representable instant.
pub fn saturating_sub(at: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|window| at.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
