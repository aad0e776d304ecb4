// src/pipeline/service_loop.rs

//! The long-running driver: cycles at the monitor-adjusted interval,
//! daily cleanup, health notifications, recovery backfill, and error
//! routing.
//!
//! Per-iteration failures are classified: configuration and programming
//! errors stop the loop with a non-zero exit; everything else logs
//! `cycle.iteration.failed` and retries after a wait clamped to at least
//! one second so a persistent error can never spin hot.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Settings;
use crate::error::Result;
use crate::events;
use crate::logging::log_event;
use crate::models::{CycleReport, HealthDecision, HealthEvent};
use crate::pipeline::backfill::{
    merge_windows, plan_recovery_window, sanitize_window, split_into_windows,
};
use crate::pipeline::CycleRunner;
use crate::services::messages::build_health_message;
use crate::services::{HealthMonitor, Notifier};
use crate::storage::{JsonHealthStore, StateStore};
use crate::utils::time::local_date;
use crate::utils::Redactor;

const MIN_ITERATION_BACKOFF_SEC: u64 = 1;

/// Everything the service loop drives; built once at startup.
pub struct ServiceRuntime {
    pub settings: Arc<Settings>,
    pub store: Arc<dyn StateStore>,
    pub notifier: Arc<Notifier>,
    pub runner: Arc<CycleRunner>,
    pub monitor: HealthMonitor,
    pub health_store: JsonHealthStore,
    pub redactor: Arc<Redactor>,
    pub cancel: CancellationToken,
}

/// Drive cycles until shutdown or a fatal error. Returns the exit code.
pub async fn run_loop(mut runtime: ServiceRuntime) -> i32 {
    let mut last_cleanup_date: Option<NaiveDate> = None;

    loop {
        if runtime.cancel.is_cancelled() {
            return 0;
        }

        match run_iteration(&mut runtime, &mut last_cleanup_date).await {
            Ok(report) => {
                info!(
                    "{}",
                    log_event(
                        events::CYCLE_COMPLETE,
                        serde_json::to_value(&report).unwrap_or_default(),
                    )
                );
                info!(
                    "{}",
                    log_event(
                        events::CYCLE_COST_METRICS,
                        json!({
                            "api_fetch_calls": report.api_fetch_calls,
                            "alerts_fetched": report.alerts_fetched,
                            "notification_attempts": report.notification_attempts,
                            "notification_sent": report.sent_count,
                            "notification_failures": report.send_failures,
                            "notification_dry_run_skips": report.dry_run_skips,
                            "notification_backpressure_skips": report.backpressure_skips,
                            "pending_total": report.pending_total,
                        }),
                    )
                );

                if runtime.settings.runtime.run_once {
                    info!("{}", log_event(events::SHUTDOWN_RUN_ONCE_COMPLETE, json!({})));
                    return 0;
                }
                if !sleep_until_next_cycle(&runtime).await {
                    return 0;
                }
            }
            Err(iteration_error) => {
                let redacted = runtime.redactor.redact(&iteration_error.to_string());
                if iteration_error.is_fatal() || runtime.settings.runtime.run_once {
                    error!(
                        "{}",
                        log_event(events::CYCLE_FATAL_ERROR, json!({"error": redacted}))
                    );
                    return 1;
                }
                error!(
                    "{}",
                    log_event(events::CYCLE_ITERATION_FAILED, json!({"error": redacted}))
                );
                let backoff = runtime
                    .settings
                    .cycle
                    .interval_sec
                    .max(MIN_ITERATION_BACKOFF_SEC);
                if !sleep_racing_cancel(&runtime.cancel, backoff).await {
                    return 0;
                }
            }
        }
    }
}

/// One full iteration: cleanup, cycle, health, notification, backfill.
async fn run_iteration(
    runtime: &mut ServiceRuntime,
    last_cleanup_date: &mut Option<NaiveDate>,
) -> Result<CycleReport> {
    maybe_auto_cleanup(runtime, last_cleanup_date).await?;

    let report = runtime.runner.run_once(Utc::now(), None).await?;
    let decision = evaluate_health(runtime, &report).await?;
    maybe_send_health_notification(runtime, &decision).await;
    maybe_run_recovery_backfill(runtime, &decision).await;

    Ok(report)
}

/// Once per local calendar day, sweep stale rows from the state store.
async fn maybe_auto_cleanup(
    runtime: &ServiceRuntime,
    last_cleanup_date: &mut Option<NaiveDate>,
) -> Result<()> {
    let settings = &runtime.settings;
    if !settings.cleanup.enabled || settings.runtime.dry_run {
        return Ok(());
    }
    let current_date = local_date(Utc::now(), settings.cycle.timezone_offset_hours);
    if *last_cleanup_date == Some(current_date) {
        return Ok(());
    }

    let removed = runtime
        .store
        .cleanup_stale(
            settings.cleanup.retention_days,
            settings.cleanup.include_unsent,
            false,
            Utc::now(),
        )
        .await?;
    info!(
        "{}",
        log_event(
            events::STATE_CLEANUP_AUTO,
            json!({
                "date": current_date.to_string(),
                "days": settings.cleanup.retention_days,
                "include_unsent": settings.cleanup.include_unsent,
                "removed": removed,
                "total": runtime.store.total_count().await?,
                "pending": runtime.store.pending_count().await?,
            }),
        )
    );
    *last_cleanup_date = Some(current_date);
    Ok(())
}

/// Feed the cycle outcome to the monitor and persist its state.
async fn evaluate_health(
    runtime: &mut ServiceRuntime,
    report: &CycleReport,
) -> Result<HealthDecision> {
    let decision = runtime.monitor.observe_cycle(
        Utc::now(),
        report.area_count,
        report.area_failures,
        &report.api_error_counts,
        report.last_api_error.as_deref(),
    );
    runtime.health_store.save(runtime.monitor.state()).await?;

    info!(
        "{}",
        log_event(
            events::HEALTH_EVALUATE,
            json!({
                "incident_open": decision.incident_open,
                "health_event": decision.event.map(|e| e.as_str()),
                "outage_window_fail_ratio":
                    (decision.outage_window_fail_ratio * 10_000.0).round() / 10_000.0,
                "recovery_window_fail_ratio":
                    (decision.recovery_window_fail_ratio * 10_000.0).round() / 10_000.0,
                "consecutive_severe_failures": decision.consecutive_severe_failures,
                "consecutive_stable_successes": decision.consecutive_stable_successes,
            }),
        )
    );
    Ok(decision)
}

/// Send the transition notification, throttled upstream by the monitor.
async fn maybe_send_health_notification(runtime: &ServiceRuntime, decision: &HealthDecision) {
    let settings = &runtime.settings;
    if !settings.health.alert_enabled || settings.runtime.dry_run {
        return;
    }
    let Some(message) = build_health_message(decision) else {
        return;
    };
    let health_event = decision.event.map(|e| e.as_str());

    match runtime.notifier.send(&message, None).await {
        Ok(_) => {
            info!(
                "{}",
                log_event(
                    events::HEALTH_NOTIFICATION_SENT,
                    json!({
                        "health_event": health_event,
                        "incident_duration_sec": decision.incident_duration_sec,
                        "incident_failed_cycles": decision.incident_failed_cycles,
                    }),
                )
            );
        }
        Err(send_error) => {
            error!(
                "{}",
                log_event(
                    events::HEALTH_NOTIFICATION_FAILED,
                    json!({
                        "health_event": health_event,
                        "error": runtime.redactor.redact(&send_error.to_string()),
                    }),
                )
            );
        }
    }
}

/// Consume pending backfill segments, planning new ones on recovery.
///
/// Backfill failures never fail the iteration; the unconsumed cursor is
/// persisted so the next cycle (or the next process) picks it up.
pub(crate) async fn maybe_run_recovery_backfill(
    runtime: &mut ServiceRuntime,
    decision: &HealthDecision,
) {
    let settings = Arc::clone(&runtime.settings);
    let today = local_date(Utc::now(), settings.cycle.timezone_offset_hours);

    let mut pending = sanitize_window(runtime.monitor.backfill_window());
    if decision.event == Some(HealthEvent::Recovered) {
        let planned = plan_recovery_window(
            today,
            settings.cycle.lookback_days,
            settings.health.backfill_max_days,
            decision.incident_duration_sec,
        );
        pending = merge_windows(pending, planned);
        set_backfill_cursor(runtime, pending.clone()).await;
    }
    let Some((pending_start, pending_end)) = pending else {
        return;
    };

    let window_days = settings.health.backfill_window_days.max(1);
    let max_windows = settings.health.backfill_max_windows_per_cycle.max(1);
    let windows = split_into_windows(&pending_start, &pending_end, window_days);
    if windows.is_empty() {
        set_backfill_cursor(runtime, None).await;
        return;
    }
    let total_days: u32 = windows.iter().map(|w| w.days).sum();

    info!(
        "{}",
        log_event(
            events::HEALTH_BACKFILL_START,
            json!({
                "start_date": pending_start,
                "end_date": pending_end,
                "backfill_extra_days": total_days,
                "window_days": window_days,
                "max_windows": max_windows,
                "incident_duration_sec": decision.incident_duration_sec,
            }),
        )
    );

    let mut processed_windows = 0usize;
    let mut processed_days = 0u32;
    let mut sent_count = 0usize;
    let mut pending_total = 0usize;
    let mut cursor = pending_start.clone();
    let runner = Arc::clone(&runtime.runner);

    for window in windows.iter().take(max_windows) {
        if runtime.cancel.is_cancelled() {
            break;
        }
        match runner
            .run_date_range(&window.start_date, &window.end_date)
            .await
        {
            Ok(report) => {
                processed_windows += 1;
                processed_days += window.days;
                sent_count += report.sent_count;
                pending_total = report.pending_total;
                cursor = window.end_date.clone();
            }
            Err(backfill_error) => {
                let remaining = (cursor.as_str() < pending_end.as_str())
                    .then(|| (cursor.clone(), pending_end.clone()));
                set_backfill_cursor(runtime, remaining).await;
                error!(
                    "{}",
                    log_event(
                        events::HEALTH_BACKFILL_FAILED,
                        json!({
                            "start_date": pending_start,
                            "end_date": pending_end,
                            "processed_windows": processed_windows,
                            "processed_days": processed_days,
                            "error": runtime.redactor.redact(&backfill_error.to_string()),
                        }),
                    )
                );
                return;
            }
        }
    }

    let remaining = (cursor.as_str() < pending_end.as_str())
        .then(|| (cursor.clone(), pending_end.clone()));
    let remaining_days = remaining
        .as_ref()
        .and_then(|(start, end)| {
            let windows = split_into_windows(start, end, window_days);
            Some(windows.iter().map(|w| w.days).sum::<u32>())
        })
        .unwrap_or(0);
    set_backfill_cursor(runtime, remaining).await;

    info!(
        "{}",
        log_event(
            events::HEALTH_BACKFILL_COMPLETE,
            json!({
                "start_date": pending_start,
                "end_date": pending_end,
                "processed_windows": processed_windows,
                "processed_days": processed_days,
                "remaining_days": remaining_days,
                "sent_count": sent_count,
                "pending_total": pending_total,
                "window_days": window_days,
                "max_windows": max_windows,
            }),
        )
    );
}

async fn set_backfill_cursor(runtime: &mut ServiceRuntime, window: Option<(String, String)>) {
    runtime.monitor.set_backfill_window(window);
    // Persist failures are already logged by the store; the cursor will
    // be rebuilt from the in-memory monitor on the next save.
    let _ = runtime.health_store.save(runtime.monitor.state()).await;
}

/// Sleep for the monitor-suggested interval; `false` means shutdown.
async fn sleep_until_next_cycle(runtime: &ServiceRuntime) -> bool {
    let base = runtime.settings.cycle.interval_sec;
    let suggested = runtime.monitor.suggested_interval_sec(base);
    if suggested == 0 {
        return !runtime.cancel.is_cancelled();
    }
    if suggested != base {
        info!(
            "{}",
            log_event(
                events::CYCLE_INTERVAL_ADJUSTED,
                json!({
                    "base_interval_sec": base,
                    "adjusted_interval_sec": suggested,
                    "incident_open": runtime.monitor.incident_open(),
                }),
            )
        );
    }
    sleep_racing_cancel(&runtime.cancel, suggested).await
}

/// `false` means the cancellation token fired during the wait.
async fn sleep_racing_cancel(cancel: &CancellationToken, seconds: u64) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(seconds)) => true,
        _ = cancel.cancelled() => false,
    }
}
