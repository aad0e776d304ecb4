// src/models/alert.rs

//! Warning events and their deduplication fingerprint.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One warning observation returned by the upstream API.
///
/// Categorical fields hold resolved labels (not raw codes); the fetch
/// layer performs the mapping so everything downstream works with display
/// values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub area_code: String,
    pub area_name: String,
    /// Warning kind label (호우, 대설, ...)
    pub warn_kind: String,
    /// Warning level label (주의보/경보)
    pub warn_level: String,
    /// Bulletin command label (발표/해제/...)
    pub command: String,
    /// Cancellation label (정상/취소된 특보)
    pub cancel: String,
    /// Display-formatted effective start time
    pub start_time: Option<String>,
    /// Display-formatted effective end time
    pub end_time: Option<String>,
    /// Issuing station id (stnId)
    pub station_id: String,
    /// Announcement time, compact YYYYMMDDHHMM (tmFc)
    pub announced_at: String,
    /// Announcement sequence within the bulletin (tmSeq)
    pub announce_seq: String,
}

impl AlertEvent {
    /// Stable deduplication key.
    ///
    /// The primary form includes the area and warning dimensions so the
    /// same bulletin metadata does not collide across regions or warning
    /// categories. When any bulletin field is missing the key degrades to
    /// a digest of all fields; both forms are stable across restarts and
    /// identical in every store backend.
    pub fn event_id(&self) -> String {
        if !self.station_id.is_empty()
            && !self.announced_at.is_empty()
            && !self.announce_seq.is_empty()
        {
            return format!(
                "event:{}:{}:{}:{}:{}:{}:{}:{}",
                self.station_id,
                self.announced_at,
                self.announce_seq,
                self.area_code,
                self.warn_kind,
                self.warn_level,
                self.command,
                self.cancel,
            );
        }

        let source = [
            self.area_code.as_str(),
            self.area_name.as_str(),
            self.warn_kind.as_str(),
            self.warn_level.as_str(),
            self.command.as_str(),
            self.cancel.as_str(),
            self.start_time.as_deref().unwrap_or(""),
            self.end_time.as_deref().unwrap_or(""),
            self.station_id.as_str(),
            self.announced_at.as_str(),
            self.announce_seq.as_str(),
        ]
        .join("|");
        let digest = Sha256::digest(source.as_bytes());
        format!("fallback:{}", &hex::encode(digest)[..20])
    }

    /// Validate the fields that feed the special-report deep link.
    ///
    /// Returns the blocking reason when the link cannot be built. Partial
    /// presence is reported separately from outright absence so the
    /// blocked-attachment log can distinguish them.
    pub fn validate_report_params(&self) -> Option<&'static str> {
        let fields = [&self.station_id, &self.announced_at, &self.announce_seq];
        let present = fields.iter().filter(|f| !f.is_empty()).count();

        if present > 0 && present < fields.len() {
            return Some("incomplete_report_params");
        }
        if present == 0 {
            return None;
        }
        if self.announced_at.len() != 12
            || !self.announced_at.chars().all(|c| c.is_ascii_digit())
        {
            return Some("invalid_announced_at");
        }
        if !self.announce_seq.chars().all(|c| c.is_ascii_digit()) {
            return Some("invalid_announce_seq");
        }
        None
    }

    /// Deep link to the official special-report page, when the bulletin
    /// fields are complete and valid.
    pub fn report_url(&self) -> Option<String> {
        if self.validate_report_params().is_some() || self.station_id.is_empty() {
            return None;
        }
        let date = format!(
            "{}-{}-{}",
            &self.announced_at[0..4],
            &self.announced_at[4..6],
            &self.announced_at[6..8]
        );
        Some(format!(
            "https://www.weather.go.kr/w/special-report/list.do\
             ?prevStn={stn}&prevKind=met&prevCmtCd=&stn={stn}&kind=met\
             &date={date}&reportId=met%3A{tmfc}%3A{seq}",
            stn = self.station_id,
            date = date,
            tmfc = self.announced_at,
            seq = self.announce_seq,
        ))
    }
}

/// A rendered notification ready for tracking and dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertNotification {
    pub event_id: String,
    pub area_code: String,
    pub message: String,
    pub report_url: Option<String>,
    pub url_validation_error: Option<&'static str>,
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_event() -> AlertEvent {
        AlertEvent {
            area_code: "L1070000".into(),
            area_name: "경기도".into(),
            warn_kind: "호우".into(),
            warn_level: "경보".into(),
            command: "발표".into(),
            cancel: "정상".into(),
            start_time: Some("2026년 8월 2일 오전 9시".into()),
            end_time: None,
            station_id: "109".into(),
            announced_at: "202608020900".into(),
            announce_seq: "1".into(),
        }
    }

    #[test]
    fn test_event_id_primary_form() {
        let event = sample_event();
        assert_eq!(
            event.event_id(),
            "event:109:202608020900:1:L1070000:호우:경보:발표:정상"
        );
    }

    #[test]
    fn test_event_id_differs_across_areas() {
        let a = sample_event();
        let mut b = sample_event();
        b.area_code = "L1080000".into();
        assert_ne!(a.event_id(), b.event_id());
    }

    #[test]
    fn test_event_id_fallback_is_stable() {
        let mut event = sample_event();
        event.station_id.clear();
        let first = event.event_id();
        let second = event.event_id();
        assert!(first.starts_with("fallback:"));
        assert_eq!(first.len(), "fallback:".len() + 20);
        assert_eq!(first, second);
    }

    #[test]
    fn test_fallback_changes_with_content() {
        let mut a = sample_event();
        a.station_id.clear();
        let mut b = a.clone();
        b.warn_kind = "대설".into();
        assert_ne!(a.event_id(), b.event_id());
    }

    #[test]
    fn test_report_url_built_when_complete() {
        let url = sample_event().report_url().unwrap();
        assert!(url.starts_with("https://www.weather.go.kr/w/special-report/list.do"));
        assert!(url.contains("date=2026-08-02"));
        assert!(url.contains("reportId=met%3A202608020900%3A1"));
    }

    #[test]
    fn test_report_url_blocked_on_partial_fields() {
        let mut event = sample_event();
        event.announce_seq.clear();
        assert_eq!(
            event.validate_report_params(),
            Some("incomplete_report_params")
        );
        assert_eq!(event.report_url(), None);
    }

    #[test]
    fn test_report_url_blocked_on_bad_timestamp() {
        let mut event = sample_event();
        event.announced_at = "2026-08-02".into();
        assert_eq!(event.validate_report_params(), Some("invalid_announced_at"));
        assert_eq!(event.report_url(), None);
    }

    #[test]
    fn test_report_url_absent_when_all_missing() {
        let mut event = sample_event();
        event.station_id.clear();
        event.announced_at.clear();
        event.announce_seq.clear();
        assert_eq!(event.validate_report_params(), None);
        assert_eq!(event.report_url(), None);
    }
}
