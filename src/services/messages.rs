// src/services/messages.rs

//! Message assembly for warning and health notifications.

use crate::models::codes::{CANCEL_NORMAL, COMMAND_PUBLISH};
use crate::models::{AlertEvent, AlertNotification, HealthDecision, HealthEvent};

const FALLBACK_TIME: &str = "특정 시간";

/// Fill a template's named placeholders from an alert.
fn render(template: &str, time: &str, alert: &AlertEvent) -> String {
    template
        .replace("{time}", time)
        .replace("{area_name}", &alert.area_name)
        .replace("{warn_kind}", &alert.warn_kind)
        .replace("{warn_level}", &alert.warn_level)
        .replace("{command}", &alert.command)
}

const PUBLISH_TEMPLATE: &str =
    "[기상특보] {time} {area_name}에 {warn_kind} {warn_level}이(가) {command}되었습니다.";
const RELEASE_TEMPLATE: &str =
    "[기상특보] {time} {area_name}의 {warn_kind} {warn_level}이(가) {command}되었습니다.";
const CANCELLED_TEMPLATE: &str =
    "[기상특보] {time} {area_name}의 {warn_kind} {warn_level}이(가) 취소되었습니다.";

/// Render the outbound text for one warning event.
pub fn build_alert_message(alert: &AlertEvent) -> String {
    if alert.cancel != CANCEL_NORMAL {
        let time = alert
            .end_time
            .as_deref()
            .or(alert.start_time.as_deref())
            .unwrap_or(FALLBACK_TIME);
        return render(CANCELLED_TEMPLATE, time, alert);
    }
    if alert.command == COMMAND_PUBLISH {
        let time = alert.start_time.as_deref().unwrap_or(FALLBACK_TIME);
        return render(PUBLISH_TEMPLATE, time, alert);
    }
    let time = alert
        .end_time
        .as_deref()
        .or(alert.start_time.as_deref())
        .unwrap_or(FALLBACK_TIME);
    render(RELEASE_TEMPLATE, time, alert)
}

/// Build the trackable notification for one warning event.
pub fn build_notification(alert: &AlertEvent) -> AlertNotification {
    let url_validation_error = alert.validate_report_params();
    AlertNotification {
        event_id: alert.event_id(),
        area_code: alert.area_code.clone(),
        message: build_alert_message(alert),
        report_url: alert.report_url(),
        url_validation_error,
    }
}

/// Render the text for a health transition; `None` when the decision
/// carries no notifiable event.
pub fn build_health_message(decision: &HealthDecision) -> Option<String> {
    match decision.event? {
        HealthEvent::OutageDetected => Some(format!(
            "[API 장애 감지]\n\
             - 관측 구간 장애비율: {}\n\
             - 실패 사이클: {}/{}\n\
             - 연속 심각 실패: {}회\n\
             - 대표 오류: {}\n\
             - 알림 정책에 따라 장애 상태를 지속 추적합니다.",
            ratio_percent(decision.outage_window_fail_ratio),
            decision.outage_window_failed_cycles,
            decision.outage_window_cycles,
            decision.consecutive_severe_failures,
            decision.representative_error.as_deref().unwrap_or("N/A"),
        )),
        HealthEvent::OutageHeartbeat => Some(format!(
            "[API 장애 지속]\n\
             - 장애 지속 시간: {}\n\
             - 누적 실패/전체 사이클: {}/{}\n\
             - 관측 구간 장애비율: {}\n\
             - 대표 오류: {}",
            format_duration(decision.incident_duration_sec),
            decision.incident_failed_cycles,
            decision.incident_total_cycles,
            ratio_percent(decision.outage_window_fail_ratio),
            decision.representative_error.as_deref().unwrap_or("N/A"),
        )),
        HealthEvent::Recovered => Some(format!(
            "[API 복구]\n\
             - 장애 지속 시간: {}\n\
             - 최근 안정 구간 실패비율: {}\n\
             - 연속 안정 사이클: {}회\n\
             - 기준 충족으로 장애 상태를 종료했습니다.",
            format_duration(decision.incident_duration_sec),
            ratio_percent(decision.recovery_window_fail_ratio),
            decision.consecutive_stable_successes,
        )),
    }
}

fn ratio_percent(value: f64) -> String {
    format!("{:.1}%", value * 100.0)
}

fn format_duration(total_seconds: u64) -> String {
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    if hours > 0 {
        format!("{hours}시간 {minutes}분")
    } else {
        format!("{minutes}분")
    }
}
