//! Timestamp helpers shared by run records and artifacts.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Timestamp type used on every persisted record.
pub type Timestamp = DateTime<Utc>;

/// Returns the current UTC timestamp.
#[must_use]
pub fn now_utc() -> Timestamp {
    Utc::now()
}

/// Milliseconds elapsed between two timestamps, clamped at zero.
#[must_use]
pub fn elapsed_ms(start: &Timestamp, end: &Timestamp) -> u64 {
    u64::try_from((*end - *start).num_milliseconds()).unwrap_or(0)
}

/// Converts a possibly fractional number of seconds into a `Duration`.
///
/// Negative and non-finite inputs become zero.
#[must_use]
pub fn duration_from_secs_f64(secs: f64) -> Duration {
    if secs.is_finite() && secs > 0.0 {
        Duration::from_secs_f64(secs)
    } else {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elapsed_ms_is_clamped() {
        let later = now_utc();
        let earlier = later - chrono::Duration::milliseconds(250);
        assert_eq!(elapsed_ms(&earlier, &later), 250);
        assert_eq!(elapsed_ms(&later, &earlier), 0);
    }

    #[test]
    fn test_duration_from_secs_f64() {
        assert_eq!(duration_from_secs_f64(1.5), Duration::from_millis(1500));
        assert_eq!(duration_from_secs_f64(-3.0), Duration::ZERO);
        assert_eq!(duration_from_secs_f64(f64::NAN), Duration::ZERO);
    }
}
