//! Clock helpers for tollgated
//!
//! All session timestamps are UTC with millisecond precision, the resolution
//! the store persists. Callers take `now` once per operation and pass it
//! down, so every comparison inside an operation sees the same instant.
//!
//! # Mock Time for Development
//!
//! In debug builds, the `TOLLGATE_MOCK_TIME` environment variable shifts the
//! clock returned by [`now`]. The mock clock keeps advancing at real speed.
//!
//! Format: `YYYY-MM-DD HH:MM:SS`, interpreted as UTC (e.g. `2025-12-25 14:30:00`)

use chrono::{DateTime, Duration, NaiveDateTime, SubsecRound, Utc};
use std::sync::OnceLock;

/// Environment variable name for mock time (debug builds only)
pub const MOCK_TIME_ENV_VAR: &str = "TOLLGATE_MOCK_TIME";

const MOCK_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

static MOCK_TIME_OFFSET: OnceLock<Option<Duration>> = OnceLock::new();

fn parse_mock_time(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, MOCK_TIME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

fn get_mock_time_offset() -> Option<Duration> {
    *MOCK_TIME_OFFSET.get_or_init(|| {
        #[cfg(debug_assertions)]
        {
            let value = std::env::var(MOCK_TIME_ENV_VAR).ok()?;
            match parse_mock_time(&value) {
                Some(mock) => {
                    let offset = mock.signed_duration_since(Utc::now());
                    tracing::info!(
                        mock_time = %value,
                        offset_secs = offset.num_seconds(),
                        "Mock time enabled"
                    );
                    Some(offset)
                }
                None => {
                    tracing::warn!(
                        mock_time = %value,
                        expected_format = MOCK_TIME_FORMAT,
                        "Invalid mock time format"
                    );
                    None
                }
            }
        }
        #[cfg(not(debug_assertions))]
        {
            None
        }
    })
}

/// Returns whether mock time is currently active.
pub fn is_mock_time_active() -> bool {
    get_mock_time_offset().is_some()
}

/// Current UTC time, respecting `TOLLGATE_MOCK_TIME` in debug builds.
pub fn now() -> DateTime<Utc> {
    let real_now = Utc::now();
    let now = match get_mock_time_offset() {
        Some(offset) => real_now + offset,
        None => real_now,
    };
    now.trunc_subsecs(3)
}

/// Latest instant with a four-digit year, so it survives an RFC 3339 round trip.
pub fn far_future() -> DateTime<Utc> {
    DateTime::from_timestamp(253_402_300_799, 999_000_000).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `start` plus a whole number of minutes, saturating at [`far_future`].
pub fn add_minutes(start: DateTime<Utc>, minutes: u64) -> DateTime<Utc> {
    let far = far_future();
    i64::try_from(minutes)
        .ok()
        .and_then(Duration::try_minutes)
        .and_then(|d| start.checked_add_signed(d))
        .filter(|end| *end <= far)
        .unwrap_or(far)
}

/// Whole minutes from `now` until `deadline`, zero when already past.
pub fn minutes_until(deadline: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    deadline
        .signed_duration_since(now)
        .num_minutes()
        .max(0) as u64
}

/// Format a timestamp for logs and CLI output.
pub fn format_datetime_full(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn add_minutes_offsets_start() {
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let end = add_minutes(start, 90);
        assert_eq!(end, Utc.with_ymd_and_hms(2025, 6, 1, 13, 30, 0).unwrap());
    }

    #[test]
    fn add_minutes_saturates() {
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        assert_eq!(add_minutes(start, u64::MAX), far_future());
        assert_eq!(add_minutes(start, 10_000_000_000), far_future());
        assert!(far_future().to_rfc3339().starts_with("9999-12-31T23:59:59"));
    }

    #[test]
    fn minutes_until_floors_at_zero() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        assert_eq!(minutes_until(add_minutes(now, 30), now), 30);
        assert_eq!(minutes_until(now - Duration::minutes(5), now), 0);
    }

    #[test]
    fn parse_mock_time_format() {
        let parsed = parse_mock_time("2025-12-25 14:30:00").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2025, 12, 25, 14, 30, 0).unwrap());

        assert!(parse_mock_time("2025-12-25T14:30:00").is_none());
        assert!(parse_mock_time("14:30").is_none());
        assert!(parse_mock_time("").is_none());
    }

    #[test]
    fn format_datetime_full_is_utc() {
        let dt = Utc.with_ymd_and_hms(2025, 12, 25, 14, 30, 45).unwrap();
        assert_eq!(format_datetime_full(&dt), "2025-12-25 14:30:45 UTC");
    }

    #[test]
    fn now_is_monotonic_enough() {
        let a = now();
        let b = now();
        assert!(b >= a);
    }

    #[test]
    fn now_has_millisecond_precision() {
        assert_eq!(now().timestamp_subsec_nanos() % 1_000_000, 0);
    }
}
