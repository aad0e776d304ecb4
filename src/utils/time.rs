// src/utils/time.rs

//! Time helpers: UTC ISO timestamps, compact dates, announcement formatting.
//!
//! Stored timestamps are second-precision RFC 3339 strings with a `Z`
//! suffix. They have a fixed width, so lexicographic order equals
//! chronological order; the SQLite backend relies on this for range
//! filters.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, SecondsFormat, Timelike, Utc};

/// Current wall-clock time as a stored-timestamp string.
pub fn utc_now_iso() -> String {
    to_utc_iso(Utc::now())
}

/// Render a UTC instant as a stored-timestamp string.
pub fn to_utc_iso(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse a stored-timestamp string back into a UTC instant.
///
/// Returns `None` for anything unparseable; callers treat such rows as
/// never-expiring rather than failing the operation.
pub fn parse_utc_iso(value: &str) -> Option<DateTime<Utc>> {
    let text = value.trim();
    if text.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Parse a compact `YYYYMMDD` date as used by the upstream API.
pub fn parse_compact_date(value: &str) -> Option<NaiveDate> {
    let text = value.trim();
    if text.len() != 8 || !text.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    NaiveDate::parse_from_str(text, "%Y%m%d").ok()
}

/// Format a date in compact `YYYYMMDD` form.
pub fn format_compact_date(value: NaiveDate) -> String {
    value.format("%Y%m%d").to_string()
}

/// The local calendar date for a UTC instant at a fixed offset.
pub fn local_date(now: DateTime<Utc>, offset_hours: i32) -> NaiveDate {
    (now + Duration::hours(i64::from(offset_hours))).date_naive()
}

/// Format an upstream `YYYYMMDDHHMM` announcement time for display.
///
/// The API reports times in local civil time already; no conversion is
/// applied. `"0"` and unparseable values yield `None`.
pub fn format_announcement_time(value: &str) -> Option<String> {
    let text = value.trim();
    if text.is_empty() || text == "0" {
        return None;
    }
    let dt = NaiveDateTime::parse_from_str(text, "%Y%m%d%H%M").ok()?;

    let am_pm = if dt.hour() < 12 { "오전" } else { "오후" };
    let hour = match dt.hour() % 12 {
        0 => 12,
        h => h,
    };
    if dt.minute() == 0 {
        Some(format!(
            "{}년 {}월 {}일 {} {}시",
            dt.year(),
            dt.month(),
            dt.day(),
            am_pm,
            hour
        ))
    } else {
        Some(format!(
            "{}년 {}월 {}일 {} {}시 {}분",
            dt.year(),
            dt.month(),
            dt.day(),
            am_pm,
            hour,
            dt.minute()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_iso_round_trip() {
        let now = Utc.with_ymd_and_hms(2026, 2, 3, 4, 5, 6).unwrap();
        let text = to_utc_iso(now);
        assert_eq!(text, "2026-02-03T04:05:06Z");
        assert_eq!(parse_utc_iso(&text), Some(now));
    }

    #[test]
    fn test_parse_iso_rejects_garbage() {
        assert_eq!(parse_utc_iso(""), None);
        assert_eq!(parse_utc_iso("not-a-date"), None);
    }

    #[test]
    fn test_iso_strings_sort_chronologically() {
        let early = to_utc_iso(Utc.with_ymd_and_hms(2026, 1, 31, 23, 59, 59).unwrap());
        let late = to_utc_iso(Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap());
        assert!(early < late);
    }

    #[test]
    fn test_compact_date_round_trip() {
        let date = NaiveDate::from_ymd_opt(2026, 8, 2).unwrap();
        assert_eq!(format_compact_date(date), "20260802");
        assert_eq!(parse_compact_date("20260802"), Some(date));
    }

    #[test]
    fn test_compact_date_rejects_malformed() {
        assert_eq!(parse_compact_date("2026-08-02"), None);
        assert_eq!(parse_compact_date("2026080"), None);
        assert_eq!(parse_compact_date("20261350"), None);
    }

    #[test]
    fn test_local_date_crosses_midnight() {
        // 2026-08-01 16:00 UTC is 2026-08-02 01:00 at +9.
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 16, 0, 0).unwrap();
        assert_eq!(
            local_date(now, 9),
            NaiveDate::from_ymd_opt(2026, 8, 2).unwrap()
        );
        assert_eq!(
            local_date(now, 0),
            NaiveDate::from_ymd_opt(2026, 8, 1).unwrap()
        );
    }

    #[test]
    fn test_format_announcement_morning() {
        assert_eq!(
            format_announcement_time("202608020900").as_deref(),
            Some("2026년 8월 2일 오전 9시")
        );
    }

    #[test]
    fn test_format_announcement_afternoon_with_minutes() {
        assert_eq!(
            format_announcement_time("202608021430").as_deref(),
            Some("2026년 8월 2일 오후 2시 30분")
        );
    }

    #[test]
    fn test_format_announcement_midnight_and_noon() {
        assert_eq!(
            format_announcement_time("202608020010").as_deref(),
            Some("2026년 8월 2일 오전 12시 10분")
        );
        assert_eq!(
            format_announcement_time("202608021200").as_deref(),
            Some("2026년 8월 2일 오후 12시")
        );
    }

    #[test]
    fn test_format_announcement_invalid() {
        assert_eq!(format_announcement_time("0"), None);
        assert_eq!(format_announcement_time(""), None);
        assert_eq!(format_announcement_time("20260802"), None);
    }
}
