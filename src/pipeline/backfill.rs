// src/pipeline/backfill.rs

//! Recovery backfill: re-query the window that elapsed during an
//! incident, in bounded segments.
//!
//! The pending range lives in [`HealthState`] so unfinished segments
//! survive a restart. Each cycle consumes at most
//! `backfill_max_windows_per_cycle` segments; whatever remains is written
//! back as the new cursor.

use chrono::NaiveDate;

use crate::utils::time::{format_compact_date, parse_compact_date};

/// One backfill segment: compact start/end dates plus covered days.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillWindow {
    pub start_date: String,
    pub end_date: String,
    pub days: u32,
}

/// The historical range owed after a recovery: incident duration capped
/// at `max_backfill_days`, ending where the regular lookback begins.
/// `None` when the regular lookback already covers it.
pub fn plan_recovery_window(
    today: NaiveDate,
    lookback_days: u32,
    max_backfill_days: u32,
    incident_duration_sec: u64,
) -> Option<(String, String)> {
    if max_backfill_days <= lookback_days {
        return None;
    }
    let outage_days = incident_duration_sec.div_ceil(86_400).max(1) as u32;
    let backfill_days = outage_days.min(max_backfill_days);
    if backfill_days <= lookback_days {
        return None;
    }

    let current_start = today - chrono::Duration::days(i64::from(lookback_days));
    let backfill_start = today - chrono::Duration::days(i64::from(backfill_days));
    if backfill_start >= current_start {
        return None;
    }
    Some((
        format_compact_date(backfill_start),
        format_compact_date(current_start),
    ))
}

/// Split a compact-date range into windows of at most `window_days`.
pub fn split_into_windows(
    start_date: &str,
    end_date: &str,
    window_days: u32,
) -> Vec<BackfillWindow> {
    let (Some(start), Some(end)) = (parse_compact_date(start_date), parse_compact_date(end_date))
    else {
        return Vec::new();
    };
    if start >= end {
        return Vec::new();
    }

    let step = chrono::Duration::days(i64::from(window_days.max(1)));
    let mut windows = Vec::new();
    let mut cursor = start;
    while cursor < end {
        let next = (cursor + step).min(end);
        windows.push(BackfillWindow {
            start_date: format_compact_date(cursor),
            end_date: format_compact_date(next),
            days: (next - cursor).num_days() as u32,
        });
        cursor = next;
    }
    windows
}

/// Union of two pending ranges; `None` when the union collapses.
pub fn merge_windows(
    first: Option<(String, String)>,
    second: Option<(String, String)>,
) -> Option<(String, String)> {
    match (first, second) {
        (None, second) => second,
        (first, None) => first,
        (Some((first_start, first_end)), Some((second_start, second_end))) => {
            let start = first_start.min(second_start);
            let end = first_end.max(second_end);
            (start < end).then_some((start, end))
        }
    }
}

/// Validate a persisted cursor; garbage or inverted ranges clear it.
pub fn sanitize_window(window: Option<(String, String)>) -> Option<(String, String)> {
    let (start, end) = window?;
    parse_compact_date(&start)?;
    parse_compact_date(&end)?;
    (start < end).then_some((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(text: &str) -> NaiveDate {
        parse_compact_date(text).unwrap()
    }

    #[test]
    fn test_plan_caps_at_max_days() {
        // 10-day incident, cap at 7: window is the 7 days before the
        // regular lookback start.
        let window = plan_recovery_window(date("20260810"), 0, 7, 10 * 86_400).unwrap();
        assert_eq!(window, ("20260803".into(), "20260810".into()));
    }

    #[test]
    fn test_plan_uses_incident_duration_when_short() {
        let window = plan_recovery_window(date("20260810"), 0, 7, 2 * 86_400).unwrap();
        assert_eq!(window, ("20260808".into(), "20260810".into()));
    }

    #[test]
    fn test_plan_rounds_partial_days_up() {
        let window = plan_recovery_window(date("20260810"), 0, 7, 90_000).unwrap();
        assert_eq!(window, ("20260808".into(), "20260810".into()));
    }

    #[test]
    fn test_plan_none_when_lookback_covers_it() {
        assert_eq!(plan_recovery_window(date("20260810"), 3, 7, 86_400), None);
        assert_eq!(plan_recovery_window(date("20260810"), 7, 7, 864_000), None);
    }

    #[test]
    fn test_split_exact_and_remainder() {
        let windows = split_into_windows("20260801", "20260807", 2);
        assert_eq!(
            windows,
            vec![
                BackfillWindow {
                    start_date: "20260801".into(),
                    end_date: "20260803".into(),
                    days: 2
                },
                BackfillWindow {
                    start_date: "20260803".into(),
                    end_date: "20260805".into(),
                    days: 2
                },
                BackfillWindow {
                    start_date: "20260805".into(),
                    end_date: "20260807".into(),
                    days: 2
                },
            ]
        );

        let windows = split_into_windows("20260801", "20260806", 2);
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[2].days, 1);
    }

    #[test]
    fn test_split_budget_bound() {
        // Total windows never exceeds ceil(range / window_days).
        let windows = split_into_windows("20260801", "20260808", 3);
        assert_eq!(windows.len(), 3); // ceil(7/3)
        let total_days: u32 = windows.iter().map(|w| w.days).sum();
        assert_eq!(total_days, 7);
    }

    #[test]
    fn test_split_rejects_bad_input() {
        assert!(split_into_windows("20260807", "20260801", 2).is_empty());
        assert!(split_into_windows("garbage", "20260801", 2).is_empty());
        assert!(split_into_windows("20260801", "20260801", 2).is_empty());
    }

    #[test]
    fn test_merge_windows() {
        assert_eq!(
            merge_windows(None, Some(("20260801".into(), "20260803".into()))),
            Some(("20260801".into(), "20260803".into()))
        );
        assert_eq!(
            merge_windows(
                Some(("20260801".into(), "20260803".into())),
                Some(("20260802".into(), "20260805".into()))
            ),
            Some(("20260801".into(), "20260805".into()))
        );
        assert_eq!(merge_windows(None, None), None);
    }

    #[test]
    fn test_sanitize_window() {
        assert_eq!(
            sanitize_window(Some(("20260801".into(), "20260803".into()))),
            Some(("20260801".into(), "20260803".into()))
        );
        assert_eq!(sanitize_window(Some(("bad".into(), "20260803".into()))), None);
        assert_eq!(
            sanitize_window(Some(("20260803".into(), "20260801".into()))),
            None
        );
        assert_eq!(sanitize_window(None), None);
    }
}
