// src/pipeline/cycle.rs

//! One reconciliation cycle: fetch, track, dispatch, settle.
//!
//! Per-area failures stay inside their phase and end up in the
//! [`CycleReport`]; only cross-cutting failures (state persistence,
//! configuration) propagate to the service loop. Within a cycle the
//! ordering guarantee is upsert before send before mark-sent, and each
//! event id is attempted at most once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::error::{AppError, Result};
use crate::events;
use crate::logging::log_event;
use crate::models::{AlertNotification, CycleReport};
use crate::services::messages::build_notification;
use crate::services::weather::{AlertSource, ApiError};
use crate::services::Notifier;
use crate::storage::StateStore;
use crate::utils::time::{format_compact_date, local_date};
use crate::utils::Redactor;

struct AreaFetchResult {
    area_name: String,
    alerts: Option<Vec<crate::models::AlertEvent>>,
    error: Option<ApiError>,
}

/// Executes reconciliation cycles against a fixed set of collaborators.
pub struct CycleRunner {
    settings: Arc<Settings>,
    source: Arc<dyn AlertSource>,
    notifier: Arc<Notifier>,
    store: Arc<dyn StateStore>,
    redactor: Arc<Redactor>,
    cancel: CancellationToken,
    /// Rotates the dispatch starting area so no region is starved by the
    /// per-cycle attempt budget.
    dispatch_start: AtomicUsize,
}

impl CycleRunner {
    pub fn new(
        settings: Arc<Settings>,
        source: Arc<dyn AlertSource>,
        notifier: Arc<Notifier>,
        store: Arc<dyn StateStore>,
        redactor: Arc<Redactor>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            settings,
            source,
            notifier,
            store,
            redactor,
            cancel,
            dispatch_start: AtomicUsize::new(0),
        }
    }

    /// Run one cycle over the standard lookback window ending tomorrow.
    pub async fn run_once(
        &self,
        now: DateTime<Utc>,
        lookback_days_override: Option<u32>,
    ) -> Result<CycleReport> {
        let lookback_days =
            lookback_days_override.unwrap_or(self.settings.cycle.lookback_days);
        let today = local_date(now, self.settings.cycle.timezone_offset_hours);
        let start = today - chrono::Duration::days(i64::from(lookback_days));
        let end = today + chrono::Duration::days(1);
        self.run_date_range(&format_compact_date(start), &format_compact_date(end))
            .await
    }

    /// Run one cycle over an explicit compact-date window.
    pub async fn run_date_range(&self, start_date: &str, end_date: &str) -> Result<CycleReport> {
        if start_date >= end_date {
            return Err(AppError::validation(format!(
                "start_date must be earlier than end_date \
                 (received start_date={start_date}, end_date={end_date})"
            )));
        }

        let area_codes = &self.settings.areas.codes;
        let mut report = CycleReport::new(start_date, end_date, area_codes.len());
        info!(
            "{}",
            log_event(
                events::CYCLE_START,
                json!({
                    "start_date": start_date,
                    "end_date": end_date,
                    "area_count": area_codes.len(),
                }),
            )
        );

        // Phase 1: fetch.
        let mut area_results = self.fetch_all_areas(start_date, end_date).await;
        report.api_fetch_calls = area_results.len();

        // Phase 3 shares one attempt budget; the starting area rotates
        // across cycles.
        let ordered_codes = self.area_codes_for_cycle();
        let mut successful_sends: Vec<(String, String, u32)> = Vec::new();

        for area_code in &ordered_codes {
            report.areas_processed += 1;
            let result = area_results.remove(area_code).unwrap_or_else(|| {
                AreaFetchResult {
                    area_name: self.settings.areas.name_for(area_code),
                    alerts: None,
                    error: Some(ApiError::missing_area_result(area_code)),
                }
            });
            info!(
                "{}",
                log_event(
                    events::AREA_START,
                    json!({"area_code": area_code, "area_name": result.area_name}),
                )
            );

            if let Some(api_error) = &result.error {
                let code = api_error.kind.code();
                let text = self.redactor.redact(&api_error.message);
                error!(
                    "{}",
                    log_event(
                        events::AREA_FAILED,
                        json!({
                            "area_code": area_code,
                            "error_code": code,
                            "error": text,
                        }),
                    )
                );
                report.record_area_failure(&code, text);
                continue;
            }

            // Phase 2: track.
            let alerts = result.alerts.unwrap_or_default();
            report.alerts_fetched += alerts.len();
            let notifications: Vec<AlertNotification> =
                alerts.iter().map(build_notification).collect();
            for notification in &notifications {
                if let Some(reason) = notification.url_validation_error {
                    warn!(
                        "{}",
                        log_event(
                            events::NOTIFICATION_URL_ATTACHMENT_BLOCKED,
                            json!({
                                "event_id": notification.event_id,
                                "area_code": notification.area_code,
                                "reason": reason,
                            }),
                        )
                    );
                }
            }
            report.newly_tracked += self.store.upsert(&notifications).await?;

            // Phase 3: dispatch, unless shutdown fired first.
            if self.cancel.is_cancelled() {
                continue;
            }
            self.dispatch_area(area_code, &mut report, &mut successful_sends)
                .await?;
        }

        // Phase 4: settle.
        if !successful_sends.is_empty() {
            let event_ids: Vec<String> =
                successful_sends.iter().map(|(id, _, _)| id.clone()).collect();
            report.sent_count += self.store.mark_sent(&event_ids).await?;
            for (event_id, area_code, attempts) in &successful_sends {
                info!(
                    "{}",
                    log_event(
                        events::NOTIFICATION_SENT,
                        json!({
                            "event_id": event_id,
                            "area_code": area_code,
                            "attempts": attempts,
                        }),
                    )
                );
            }
        }

        report.pending_total = self.store.pending_count().await?;
        Ok(report)
    }

    /// Rotate the area order so dispatch starts from a different region
    /// each cycle.
    fn area_codes_for_cycle(&self) -> Vec<String> {
        let area_codes = &self.settings.areas.codes;
        if area_codes.len() <= 1 {
            return area_codes.clone();
        }
        let start = self.dispatch_start.fetch_add(1, Ordering::Relaxed) % area_codes.len();
        let mut ordered = Vec::with_capacity(area_codes.len());
        ordered.extend_from_slice(&area_codes[start..]);
        ordered.extend_from_slice(&area_codes[..start]);
        ordered
    }

    async fn fetch_all_areas(
        &self,
        start_date: &str,
        end_date: &str,
    ) -> HashMap<String, AreaFetchResult> {
        let area_codes = &self.settings.areas.codes;
        let max_workers = self.settings.cycle.max_workers.max(1);

        if max_workers <= 1 || area_codes.len() <= 1 {
            return self.fetch_sequential(start_date, end_date).await;
        }

        info!(
            "{}",
            log_event(
                events::CYCLE_PARALLEL_FETCH,
                json!({"workers": max_workers.min(area_codes.len()), "area_count": area_codes.len()}),
            )
        );
        if self.settings.cycle.area_interval_sec > 0 {
            info!(
                "{}",
                log_event(
                    events::CYCLE_AREA_INTERVAL_IGNORED,
                    json!({
                        "reason": "parallel_fetch_enabled",
                        "area_interval_sec": self.settings.cycle.area_interval_sec,
                    }),
                )
            );
        }

        let results: Vec<(String, String, std::result::Result<Vec<_>, ApiError>)> =
            stream::iter(area_codes.clone())
                .map(|area_code| {
                    let area_name = self.settings.areas.name_for(&area_code);
                    let worker = self.source.worker_client();
                    let start_date = start_date.to_string();
                    let end_date = end_date.to_string();
                    async move {
                        let outcome = worker
                            .fetch_alerts(&area_code, &start_date, &end_date, &area_name)
                            .await;
                        (area_code, area_name, outcome)
                    }
                })
                .buffer_unordered(max_workers)
                .collect()
                .await;

        results
            .into_iter()
            .map(|(area_code, area_name, outcome)| {
                let result = match outcome {
                    Ok(alerts) => AreaFetchResult {
                        area_name,
                        alerts: Some(alerts),
                        error: None,
                    },
                    Err(error) => AreaFetchResult {
                        area_name,
                        alerts: None,
                        error: Some(error),
                    },
                };
                (area_code, result)
            })
            .collect()
    }

    async fn fetch_sequential(
        &self,
        start_date: &str,
        end_date: &str,
    ) -> HashMap<String, AreaFetchResult> {
        let area_codes = &self.settings.areas.codes;
        let delay = Duration::from_secs(self.settings.cycle.area_interval_sec);
        let mut results = HashMap::new();

        for (index, area_code) in area_codes.iter().enumerate() {
            let area_name = self.settings.areas.name_for(area_code);
            let outcome = self
                .source
                .fetch_alerts(area_code, start_date, end_date, &area_name)
                .await;
            let result = match outcome {
                Ok(alerts) => AreaFetchResult {
                    area_name,
                    alerts: Some(alerts),
                    error: None,
                },
                Err(error) => AreaFetchResult {
                    area_name,
                    alerts: None,
                    error: Some(error),
                },
            };
            results.insert(area_code.clone(), result);

            let is_last = index + 1 == area_codes.len();
            if !is_last && !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.cancel.cancelled() => break,
                }
            }
        }
        results
    }

    /// Send pending notifications for one area under the shared budget.
    async fn dispatch_area(
        &self,
        area_code: &str,
        report: &mut CycleReport,
        successful_sends: &mut Vec<(String, String, u32)>,
    ) -> Result<()> {
        let pending = self.store.pending(Some(area_code)).await?;
        let budget = self.settings.webhook.max_attempts_per_cycle;

        for (index, row) in pending.iter().enumerate() {
            if budget > 0 && report.notification_attempts >= budget {
                let skipped = pending.len() - index;
                report.backpressure_skips += skipped;
                warn!(
                    "{}",
                    log_event(
                        events::NOTIFICATION_BACKPRESSURE_APPLIED,
                        json!({
                            "area_code": area_code,
                            "max_attempts_per_cycle": budget,
                            "skipped": skipped,
                        }),
                    )
                );
                break;
            }

            if self.settings.runtime.dry_run {
                report.dry_run_skips += 1;
                info!(
                    "{}",
                    log_event(
                        events::NOTIFICATION_DRY_RUN,
                        json!({"event_id": row.event_id, "area_code": row.area_code}),
                    )
                );
                continue;
            }

            report.notification_attempts += 1;
            match self
                .notifier
                .send(&row.message, row.report_url.as_deref())
                .await
            {
                Ok(send_report) => {
                    successful_sends.push((
                        row.event_id.clone(),
                        row.area_code.clone(),
                        send_report.attempts,
                    ));
                }
                Err(AppError::Cancelled) => return Ok(()),
                Err(send_error) => {
                    report.send_failures += 1;
                    let (attempts, message) = match &send_error {
                        AppError::Notification { attempts, message } => {
                            (*attempts, message.clone())
                        }
                        other => (0, self.redactor.redact(&other.to_string())),
                    };
                    error!(
                        "{}",
                        log_event(
                            events::NOTIFICATION_FINAL_FAILURE,
                            json!({
                                "event_id": row.event_id,
                                "area_code": row.area_code,
                                "attempts": attempts,
                                "error": message,
                            }),
                        )
                    );
                }
            }
        }
        Ok(())
    }
}
