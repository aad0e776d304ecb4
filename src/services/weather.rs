// src/services/weather.rs

//! Upstream warning-API client.
//!
//! Fetches one region over one date window with pagination, retries, and
//! shared rate limiting. Parallel fetch workers each get their own client
//! via [`AlertSource::worker_client`] so no two workers share a
//! connection pool.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Settings;
use crate::error::Result;
use crate::events;
use crate::logging::log_event;
use crate::models::codes::{
    cancel_label, command_label, result_code_description, warn_kind_label, warn_level_label,
    RESULT_CODE_NODATA, RESULT_CODE_OK, RESULT_CODE_RATE_LIMITED,
};
use crate::models::AlertEvent;
use crate::utils::http::create_client;
use crate::utils::time::format_announcement_time;
use crate::utils::{RateLimiter, Redactor};

/// Classified fetch failure, keyed by a stable snake_case code.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub message: String,
    pub result_code: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    Timeout,
    Connection,
    HttpStatus(u16),
    Parse,
    ApiResult,
    MissingAreaResult,
    Cancelled,
    Unknown,
}

impl ApiErrorKind {
    /// Stable code used in events and error histograms.
    pub fn code(&self) -> String {
        match self {
            Self::Timeout => "timeout".into(),
            Self::Connection => "connection".into(),
            Self::HttpStatus(status) => format!("http_{status}"),
            Self::Parse => "parse_error".into(),
            Self::ApiResult => "api_result_error".into(),
            Self::MissingAreaResult => "missing_area_fetch_result".into(),
            Self::Cancelled => "cancelled".into(),
            Self::Unknown => "unknown_error".into(),
        }
    }

    fn retriable(&self) -> bool {
        match self {
            Self::Timeout | Self::Connection | Self::Parse => true,
            Self::HttpStatus(status) => *status >= 500,
            // Result-code failures are terminal except explicit rate
            // limiting, which the caller marks retriable via kind.
            _ => false,
        }
    }
}

impl ApiError {
    fn new(kind: ApiErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            result_code: None,
        }
    }

    /// Synthesized when the orchestrator never received a result for a
    /// region, so dashboards can tell "not attempted" from "failed".
    pub fn missing_area_result(area_code: &str) -> Self {
        Self::new(
            ApiErrorKind::MissingAreaResult,
            format!("no fetch result recorded for area_code={area_code}"),
        )
    }

    fn from_reqwest(error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::new(ApiErrorKind::Timeout, format!("request timed out: {error}"))
        } else if error.is_connect() {
            Self::new(
                ApiErrorKind::Connection,
                format!("connection failed: {error}"),
            )
        } else {
            Self::new(ApiErrorKind::Unknown, format!("request failed: {error}"))
        }
    }

    fn is_retriable(&self) -> bool {
        self.kind.retriable()
            || (self.kind == ApiErrorKind::ApiResult
                && self.result_code.as_deref() == Some(RESULT_CODE_RATE_LIMITED))
    }
}

/// Abstraction over the upstream feed; fakes implement this in tests.
#[async_trait]
pub trait AlertSource: Send + Sync {
    async fn fetch_alerts(
        &self,
        area_code: &str,
        start_date: &str,
        end_date: &str,
        area_name: &str,
    ) -> std::result::Result<Vec<AlertEvent>, ApiError>;

    /// A client suitable for a parallel fetch worker. Implementations
    /// must not share mutable HTTP state between the returned client and
    /// `self`.
    fn worker_client(&self) -> Arc<dyn AlertSource>;
}

/// Production client for the KMA special-report endpoint.
pub struct WeatherApi {
    settings: Arc<Settings>,
    client: reqwest::Client,
    limiter: Arc<RateLimiter>,
    redactor: Arc<Redactor>,
    cancel: CancellationToken,
    /// Warn once per distinct mapping anomaly, not once per cycle;
    /// shared with worker clients.
    warned_mappings: Arc<Mutex<HashSet<(String, String)>>>,
}

impl WeatherApi {
    pub fn new(
        settings: Arc<Settings>,
        limiter: Arc<RateLimiter>,
        redactor: Arc<Redactor>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let client = create_client(
            settings.api.connect_timeout_sec,
            settings.api.read_timeout_sec,
        )?;
        Ok(Self {
            settings,
            client,
            limiter,
            redactor,
            cancel,
            warned_mappings: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    async fn fetch_page(
        &self,
        area_code: &str,
        start_date: &str,
        end_date: &str,
        page_no: u32,
    ) -> std::result::Result<String, ApiError> {
        if !self.limiter.acquire(&self.cancel).await {
            return Err(ApiError::new(ApiErrorKind::Cancelled, "shutdown requested"));
        }

        let page_size = self.settings.api.page_size;
        let mut query: Vec<(&str, String)> = vec![
            ("serviceKey", self.settings.api.service_key.clone()),
            ("numOfRows", page_size.to_string()),
            ("pageNo", page_no.to_string()),
            ("dataType", "XML".to_string()),
            ("fromTmFc", start_date.to_string()),
            ("toTmFc", end_date.to_string()),
            ("areaCode", area_code.to_string()),
        ];
        if let Some(warning_type) = &self.settings.api.warning_type {
            query.push(("warningType", warning_type.clone()));
        }
        if let Some(station_id) = &self.settings.api.station_id {
            query.push(("stnId", station_id.clone()));
        }

        let response = self
            .client
            .get(&self.settings.api.url)
            .query(&query)
            .send()
            .await
            .map_err(|e| ApiError::from_reqwest(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::new(
                ApiErrorKind::HttpStatus(status.as_u16()),
                format!("HTTP {status}"),
            ));
        }

        response
            .text()
            .await
            .map_err(|e| ApiError::from_reqwest(&e))
    }

    /// One page fetch with exponential backoff on retriable failures.
    async fn fetch_page_with_retry(
        &self,
        area_code: &str,
        start_date: &str,
        end_date: &str,
        page_no: u32,
        area_name: &str,
    ) -> std::result::Result<ParsedPage, ApiError> {
        let max_retries = self.settings.api.max_retries;
        let mut backoff_sec = self.settings.api.retry_delay_sec;
        let mut last_error = ApiError::new(ApiErrorKind::Unknown, "no attempt made");

        for attempt in 1..=max_retries {
            let outcome = match self
                .fetch_page(area_code, start_date, end_date, page_no)
                .await
            {
                Ok(body) => self.parse_page(&body, area_code, area_name),
                Err(error) => Err(error),
            };

            match outcome {
                Ok(page) => return Ok(page),
                Err(error) if error.kind == ApiErrorKind::Cancelled => return Err(error),
                Err(error) => {
                    if !error.is_retriable() || attempt == max_retries {
                        return Err(error);
                    }
                    warn!(
                        "{}",
                        log_event(
                            events::AREA_FETCH_RETRY,
                            json!({
                                "area_code": area_code,
                                "attempt": attempt,
                                "max_retries": max_retries,
                                "error_code": error.kind.code(),
                                "error": self.redactor.redact(&error.message),
                                "backoff_sec": backoff_sec,
                            }),
                        )
                    );
                    last_error = error;
                }
            }

            if backoff_sec > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(backoff_sec)) => {}
                    _ = self.cancel.cancelled() => {
                        return Err(ApiError::new(ApiErrorKind::Cancelled, "shutdown requested"));
                    }
                }
            }
            backoff_sec = backoff_sec.saturating_mul(2);
        }
        Err(last_error)
    }

    fn parse_page(
        &self,
        body: &str,
        area_code: &str,
        area_name: &str,
    ) -> std::result::Result<ParsedPage, ApiError> {
        let document = roxmltree::Document::parse(body).map_err(|e| {
            ApiError::new(ApiErrorKind::Parse, format!("failed to parse XML: {e}"))
        })?;

        let result_code = normalize_result_code(text_of(&document, "resultCode"));
        if result_code == RESULT_CODE_NODATA {
            return Ok(ParsedPage {
                no_data: true,
                total_count: Some(0),
                alerts: Vec::new(),
            });
        }
        if result_code != RESULT_CODE_OK {
            let mut error = ApiError::new(
                ApiErrorKind::ApiResult,
                format!(
                    "API response error {result_code}: {}",
                    result_code_description(&result_code)
                ),
            );
            error.result_code = Some(result_code);
            return Err(error);
        }

        let total_count = text_of(&document, "totalCount")
            .and_then(|text| text.trim().parse::<u32>().ok());

        let alerts = document
            .descendants()
            .filter(|node| node.has_tag_name("item"))
            .map(|item| self.parse_item(&item, area_code, area_name))
            .collect();

        Ok(ParsedPage {
            no_data: false,
            total_count,
            alerts,
        })
    }

    fn parse_item(
        &self,
        item: &roxmltree::Node<'_, '_>,
        area_code: &str,
        configured_area_name: &str,
    ) -> AlertEvent {
        let field = |name: &str| {
            item.children()
                .find(|child| child.has_tag_name(name))
                .and_then(|child| child.text())
                .unwrap_or("")
                .trim()
                .to_string()
        };

        let response_area_name = field("areaName");
        let area_name =
            self.resolve_area_name(area_code, configured_area_name, &response_area_name);

        AlertEvent {
            area_code: area_code.to_string(),
            area_name,
            warn_kind: self.resolve_code(area_code, "warnVar", &field("warnVar"), warn_kind_label),
            warn_level: self.resolve_code(
                area_code,
                "warnStress",
                &field("warnStress"),
                warn_level_label,
            ),
            command: self.resolve_code(area_code, "command", &field("command"), command_label),
            cancel: self.resolve_code(area_code, "cancel", &field("cancel"), cancel_label),
            start_time: format_announcement_time(&field("startTime")),
            end_time: format_announcement_time(&field("endTime")),
            station_id: field("stnId"),
            announced_at: field("tmFc"),
            announce_seq: field("tmSeq"),
        }
    }

    /// Configured name wins; upstream name is the fallback, then the raw
    /// code. Disagreements are logged once per distinct combination.
    fn resolve_area_name(
        &self,
        area_code: &str,
        configured: &str,
        response: &str,
    ) -> String {
        let has_configured =
            !configured.is_empty() && configured != crate::config::UNKNOWN_AREA_NAME;

        if has_configured {
            if !response.is_empty() && configured != response {
                self.warn_once(
                    area_code,
                    "name:mismatch",
                    events::AREA_NAME_MAPPING_WARNING,
                    json!({
                        "area_code": area_code,
                        "reason": "mismatch",
                        "configured_area_name": configured,
                        "response_area_name": response,
                        "resolved_area_name": configured,
                    }),
                );
            }
            return configured.to_string();
        }
        if !response.is_empty() {
            self.warn_once(
                area_code,
                "name:missing_mapping",
                events::AREA_NAME_MAPPING_WARNING,
                json!({
                    "area_code": area_code,
                    "reason": "missing_mapping",
                    "response_area_name": response,
                    "resolved_area_name": response,
                }),
            );
            return response.to_string();
        }
        self.warn_once(
            area_code,
            "name:missing_mapping_and_response",
            events::AREA_NAME_MAPPING_WARNING,
            json!({
                "area_code": area_code,
                "reason": "missing_mapping_and_response",
                "resolved_area_name": area_code,
            }),
        );
        area_code.to_string()
    }

    fn resolve_code(
        &self,
        area_code: &str,
        field_name: &str,
        raw_code: &str,
        mapping: fn(&str) -> Option<&'static str>,
    ) -> String {
        if raw_code.is_empty() || raw_code.eq_ignore_ascii_case("N/A") {
            return "N/A".to_string();
        }
        if let Some(label) = mapping(raw_code) {
            return label.to_string();
        }
        let fallback = format!("UNKNOWN({field_name}:{raw_code})");
        self.warn_once(
            area_code,
            &format!("code:{field_name}:{raw_code}"),
            events::AREA_CODE_UNMAPPED,
            json!({
                "area_code": area_code,
                "field": field_name,
                "raw_code": raw_code,
                "fallback_value": fallback,
            }),
        );
        fallback
    }

    fn warn_once(&self, area_code: &str, key: &str, event: &str, fields: serde_json::Value) {
        let cache_key = (area_code.to_string(), key.to_string());
        let mut warned = self
            .warned_mappings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !warned.insert(cache_key) {
            return;
        }
        warn!("{}", log_event(event, fields));
    }
}

#[derive(Debug)]
struct ParsedPage {
    no_data: bool,
    total_count: Option<u32>,
    alerts: Vec<AlertEvent>,
}

fn text_of<'a>(document: &'a roxmltree::Document<'_>, tag: &str) -> Option<&'a str> {
    document
        .descendants()
        .find(|node| node.has_tag_name(tag))
        .and_then(|node| node.text())
}

/// Pad single-digit numeric codes to the documented two-digit form.
fn normalize_result_code(raw: Option<&str>) -> String {
    let text = raw.unwrap_or("N/A").trim();
    if text.len() == 1 && text.chars().all(|c| c.is_ascii_digit()) {
        return format!("0{text}");
    }
    text.to_string()
}

/// Whether another page remains after `page_no`.
fn has_next_page(page_no: u32, page_size: u32, items_on_page: usize, total_count: Option<u32>) -> bool {
    if items_on_page == 0 {
        return false;
    }
    match total_count {
        Some(total) => page_no.saturating_mul(page_size) < total,
        None => items_on_page as u32 >= page_size,
    }
}

#[async_trait]
impl AlertSource for WeatherApi {
    async fn fetch_alerts(
        &self,
        area_code: &str,
        start_date: &str,
        end_date: &str,
        area_name: &str,
    ) -> std::result::Result<Vec<AlertEvent>, ApiError> {
        let page_size = self.settings.api.page_size;
        let mut page_no = 1;
        let mut total_count: Option<u32> = None;
        let mut all_alerts = Vec::new();
        let mut page_count: u32 = 0;

        loop {
            let page = self
                .fetch_page_with_retry(area_code, start_date, end_date, page_no, area_name)
                .await?;

            if page.no_data {
                // NODATA on page 1 is an empty window; on later pages it
                // just terminates pagination.
                if page_no == 1 {
                    info!(
                        "{}",
                        log_event(
                            events::AREA_FETCH_SUMMARY,
                            json!({
                                "area_code": area_code,
                                "area_name": area_name,
                                "fetched_items": 0,
                                "page_count": 1,
                                "total_count": 0,
                            }),
                        )
                    );
                    return Ok(Vec::new());
                }
                break;
            }

            let items_on_page = page.alerts.len();
            all_alerts.extend(page.alerts);
            page_count += 1;
            if total_count.is_none() {
                total_count = page.total_count;
            }

            if !has_next_page(page_no, page_size, items_on_page, total_count) {
                break;
            }
            page_no += 1;
        }

        info!(
            "{}",
            log_event(
                events::AREA_FETCH_SUMMARY,
                json!({
                    "area_code": area_code,
                    "area_name": area_name,
                    "fetched_items": all_alerts.len(),
                    "page_count": page_count.max(1),
                    "total_count": total_count,
                }),
            )
        );
        Ok(all_alerts)
    }

    fn worker_client(&self) -> Arc<dyn AlertSource> {
        // A fresh reqwest client gives each worker its own pool; the
        // limiter, redactor, and warn cache stay shared.
        Arc::new(Self {
            settings: Arc::clone(&self.settings),
            client: create_client(
                self.settings.api.connect_timeout_sec,
                self.settings.api.read_timeout_sec,
            )
            .unwrap_or_else(|_| self.client.clone()),
            limiter: Arc::clone(&self.limiter),
            redactor: Arc::clone(&self.redactor),
            cancel: self.cancel.clone(),
            warned_mappings: Arc::clone(&self.warned_mappings),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api() -> WeatherApi {
        let mut settings = Settings::default();
        settings.api.service_key = "test-key".into();
        settings.webhook.url = "https://hook.example.com/services/1/2/tok".into();
        settings.areas.codes = vec!["L1070000".into()];
        WeatherApi::new(
            Arc::new(settings),
            Arc::new(RateLimiter::new(0.0)),
            Arc::new(Redactor::passthrough()),
            CancellationToken::new(),
        )
        .unwrap()
    }

    fn page_xml(result_code: &str, total: u32, items: &str) -> String {
        format!(
            "<response><header><resultCode>{result_code}</resultCode></header>\
             <body><totalCount>{total}</totalCount><items>{items}</items></body></response>"
        )
    }

    const ITEM: &str = "<item>\
        <areaName>경기도</areaName>\
        <warnVar>2</warnVar><warnStress>1</warnStress>\
        <command>1</command><cancel>0</cancel>\
        <startTime>202608020900</startTime><endTime>0</endTime>\
        <stnId>109</stnId><tmFc>202608020900</tmFc><tmSeq>1</tmSeq>\
        </item>";

    #[test]
    fn test_parse_page_resolves_codes() {
        let api = api();
        let page = api
            .parse_page(&page_xml("00", 1, ITEM), "L1070000", "경기도")
            .unwrap();
        assert_eq!(page.alerts.len(), 1);
        let alert = &page.alerts[0];
        assert_eq!(alert.warn_kind, "호우");
        assert_eq!(alert.warn_level, "경보");
        assert_eq!(alert.command, "발표");
        assert_eq!(alert.cancel, "정상");
        assert_eq!(alert.start_time.as_deref(), Some("2026년 8월 2일 오전 9시"));
        assert_eq!(alert.end_time, None);
        assert_eq!(alert.station_id, "109");
    }

    #[test]
    fn test_parse_page_unknown_code_falls_back() {
        let api = api();
        let item = ITEM.replace("<warnVar>2</warnVar>", "<warnVar>77</warnVar>");
        let page = api
            .parse_page(&page_xml("00", 1, &item), "L1070000", "경기도")
            .unwrap();
        assert_eq!(page.alerts[0].warn_kind, "UNKNOWN(warnVar:77)");
    }

    #[test]
    fn test_parse_page_nodata() {
        let api = api();
        let page = api
            .parse_page(&page_xml("03", 0, ""), "L1070000", "경기도")
            .unwrap();
        assert!(page.no_data);
    }

    #[test]
    fn test_parse_page_single_digit_success_code() {
        let api = api();
        let page = api
            .parse_page(&page_xml("0", 1, ITEM), "L1070000", "경기도")
            .unwrap();
        assert!(!page.no_data);
        assert_eq!(page.alerts.len(), 1);
    }

    #[test]
    fn test_parse_page_error_code_is_terminal() {
        let api = api();
        let error = api
            .parse_page(&page_xml("30", 0, ""), "L1070000", "경기도")
            .unwrap_err();
        assert_eq!(error.kind, ApiErrorKind::ApiResult);
        assert_eq!(error.result_code.as_deref(), Some("30"));
        assert!(!error.is_retriable());
    }

    #[test]
    fn test_rate_limit_result_code_is_retriable() {
        let api = api();
        let error = api
            .parse_page(&page_xml("22", 0, ""), "L1070000", "경기도")
            .unwrap_err();
        assert_eq!(error.result_code.as_deref(), Some("22"));
        assert!(error.is_retriable());
    }

    #[test]
    fn test_parse_page_malformed_xml() {
        let api = api();
        let error = api
            .parse_page("<response><unclosed>", "L1070000", "경기도")
            .unwrap_err();
        assert_eq!(error.kind, ApiErrorKind::Parse);
        assert!(error.is_retriable());
    }

    #[test]
    fn test_area_name_resolution_prefers_configured() {
        let api = api();
        assert_eq!(
            api.resolve_area_name("L1070000", "경기도", "京畿道"),
            "경기도"
        );
        assert_eq!(
            api.resolve_area_name("L1070000", crate::config::UNKNOWN_AREA_NAME, "경기도"),
            "경기도"
        );
        assert_eq!(
            api.resolve_area_name("L1070000", crate::config::UNKNOWN_AREA_NAME, ""),
            "L1070000"
        );
    }

    #[test]
    fn test_has_next_page() {
        assert!(has_next_page(1, 100, 100, Some(150)));
        assert!(!has_next_page(2, 100, 50, Some(150)));
        assert!(!has_next_page(1, 100, 0, Some(150)));
        // Without totalCount, a full page implies another request.
        assert!(has_next_page(1, 100, 100, None));
        assert!(!has_next_page(1, 100, 99, None));
    }

    #[test]
    fn test_normalize_result_code() {
        assert_eq!(normalize_result_code(Some("0")), "00");
        assert_eq!(normalize_result_code(Some("22")), "22");
        assert_eq!(normalize_result_code(Some(" 03 ")), "03");
        assert_eq!(normalize_result_code(None), "N/A");
    }

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(ApiErrorKind::Timeout.code(), "timeout");
        assert_eq!(ApiErrorKind::HttpStatus(503).code(), "http_503");
        assert_eq!(
            ApiError::missing_area_result("X").kind.code(),
            "missing_area_fetch_result"
        );
    }

    #[test]
    fn test_http_status_retriability() {
        assert!(ApiErrorKind::HttpStatus(500).retriable());
        assert!(ApiErrorKind::HttpStatus(503).retriable());
        assert!(!ApiErrorKind::HttpStatus(404).retriable());
        assert!(!ApiErrorKind::HttpStatus(400).retriable());
    }
}
