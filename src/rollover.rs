//! Period rollover policy
//!
//! A period covers `[period_start, period_start + period_length_days)`.
//! Rollover never catches up on missed periods: the next period starts at
//! the moment the lapse is observed.

use chrono::{DateTime, Duration, Utc};

/// End of the period starting at `period_start`
pub fn period_end(period_start: DateTime<Utc>, period_length_days: u32) -> DateTime<Utc> {
    period_start
        .checked_add_signed(Duration::days(i64::from(period_length_days)))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Whether the period has lapsed at `now` (the end instant itself is expired)
pub fn is_expired(period_start: DateTime<Utc>, period_length_days: u32, now: DateTime<Utc>) -> bool {
    now >= period_end(period_start, period_length_days)
}

/// Whole days until `reset`, rounded up, zero once it has passed
pub fn days_until(reset: DateTime<Utc>, now: DateTime<Utc>) -> u32 {
    let remaining = reset.signed_duration_since(now);
    if remaining <= Duration::zero() {
        return 0;
    }
    let days = remaining.num_days();
    let days = if remaining > Duration::days(days) {
        days + 1
    } else {
        days
    };
    u32::try_from(days).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_expiry_boundary() {
        let end = period_end(start(), 30);
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 1, 31, 0, 0, 0).unwrap());

        assert!(is_expired(start(), 30, end));
        assert!(!is_expired(start(), 30, end - Duration::nanoseconds(1)));
        assert!(is_expired(start(), 30, end + Duration::days(10)));
    }

    #[test]
    fn test_fresh_period_is_not_expired() {
        assert!(!is_expired(start(), 1, start()));
    }

    #[test]
    fn test_days_until_rounds_up() {
        let reset = period_end(start(), 30);
        assert_eq!(days_until(reset, start()), 30);
        assert_eq!(days_until(reset, start() + Duration::hours(1)), 30);
        assert_eq!(days_until(reset, reset - Duration::seconds(1)), 1);
        assert_eq!(days_until(reset, reset), 0);
        assert_eq!(days_until(reset, reset + Duration::days(3)), 0);
    }
}
