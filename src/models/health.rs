// src/models/health.rs

//! Health-monitor state, policy thresholds, and per-cycle decisions.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// One observed cycle outcome in the rolling window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleSample {
    pub recorded_at: DateTime<Utc>,
    pub total_areas: usize,
    pub failed_areas: usize,
    #[serde(default)]
    pub error_counts: BTreeMap<String, u64>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl CycleSample {
    pub fn fail_ratio(&self) -> f64 {
        if self.total_areas == 0 {
            return 0.0;
        }
        self.failed_areas as f64 / self.total_areas as f64
    }
}

/// Thresholds governing outage detection and recovery.
#[derive(Debug, Clone, Copy)]
pub struct HealthPolicy {
    pub outage_window_sec: u64,
    pub outage_fail_ratio: f64,
    pub outage_min_failed_cycles: usize,
    pub outage_consecutive_failures: usize,
    pub recovery_window_sec: u64,
    pub recovery_max_fail_ratio: f64,
    pub recovery_consecutive_successes: usize,
    pub heartbeat_interval_sec: u64,
    pub backoff_max_sec: u64,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            outage_window_sec: 600,
            outage_fail_ratio: 0.7,
            outage_min_failed_cycles: 6,
            outage_consecutive_failures: 4,
            recovery_window_sec: 900,
            recovery_max_fail_ratio: 0.1,
            recovery_consecutive_successes: 8,
            heartbeat_interval_sec: 3600,
            backoff_max_sec: 900,
        }
    }
}

impl HealthPolicy {
    /// Retention needed to answer both window queries plus the heartbeat.
    pub fn retention_sec(&self) -> u64 {
        self.outage_window_sec.max(self.recovery_window_sec) + self.heartbeat_interval_sec
    }
}

/// Durable monitor state; reloaded on startup, persisted after every
/// mutation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthState {
    pub incident_open: bool,
    pub incident_started_at: Option<DateTime<Utc>>,
    pub incident_notified_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub last_recovered_at: Option<DateTime<Utc>>,
    pub consecutive_severe_failures: usize,
    pub consecutive_stable_successes: usize,
    pub incident_total_cycles: usize,
    pub incident_failed_cycles: usize,
    pub incident_error_counts: BTreeMap<String, u64>,
    /// Remaining recovery-backfill range (compact dates), consumed in
    /// bounded windows across cycles.
    pub backfill_pending_start_date: Option<String>,
    pub backfill_pending_end_date: Option<String>,
    pub recent_cycles: Vec<CycleSample>,
}

impl HealthState {
    pub fn append_cycle(&mut self, sample: CycleSample) {
        self.recent_cycles.push(sample);
    }

    pub fn trim_recent_cycles(&mut self, now: DateTime<Utc>, retention_sec: u64) {
        if retention_sec == 0 {
            self.recent_cycles.clear();
            return;
        }
        let threshold = now - Duration::seconds(retention_sec as i64);
        self.recent_cycles
            .retain(|sample| sample.recorded_at >= threshold);
    }

    pub fn cycles_in_window(&self, now: DateTime<Utc>, window_sec: u64) -> Vec<&CycleSample> {
        if window_sec == 0 {
            return Vec::new();
        }
        let threshold = now - Duration::seconds(window_sec as i64);
        self.recent_cycles
            .iter()
            .filter(|sample| sample.recorded_at >= threshold)
            .collect()
    }
}

/// A state-machine transition worth notifying about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthEvent {
    OutageDetected,
    OutageHeartbeat,
    Recovered,
}

impl HealthEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OutageDetected => "outage_detected",
            Self::OutageHeartbeat => "outage_heartbeat",
            Self::Recovered => "recovered",
        }
    }
}

/// Snapshot returned from each `observe_cycle` call.
#[derive(Debug, Clone)]
pub struct HealthDecision {
    pub incident_open: bool,
    pub event: Option<HealthEvent>,
    pub outage_window_cycles: usize,
    pub outage_window_failed_cycles: usize,
    pub outage_window_fail_ratio: f64,
    pub recovery_window_cycles: usize,
    pub recovery_window_fail_ratio: f64,
    pub consecutive_severe_failures: usize,
    pub consecutive_stable_successes: usize,
    pub incident_duration_sec: u64,
    pub incident_total_cycles: usize,
    pub incident_failed_cycles: usize,
    pub incident_error_counts: BTreeMap<String, u64>,
    pub representative_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(at: DateTime<Utc>, failed: usize) -> CycleSample {
        CycleSample {
            recorded_at: at,
            total_areas: 4,
            failed_areas: failed,
            error_counts: BTreeMap::new(),
            last_error: None,
        }
    }

    #[test]
    fn test_fail_ratio() {
        let now = Utc::now();
        assert_eq!(sample(now, 0).fail_ratio(), 0.0);
        assert_eq!(sample(now, 2).fail_ratio(), 0.5);
        let empty = CycleSample {
            recorded_at: now,
            total_areas: 0,
            failed_areas: 0,
            error_counts: BTreeMap::new(),
            last_error: None,
        };
        assert_eq!(empty.fail_ratio(), 0.0);
    }

    #[test]
    fn test_trim_keeps_only_retention_window() {
        let now = Utc.with_ymd_and_hms(2026, 8, 2, 12, 0, 0).unwrap();
        let mut state = HealthState::default();
        state.append_cycle(sample(now - Duration::seconds(500), 1));
        state.append_cycle(sample(now - Duration::seconds(100), 1));
        state.trim_recent_cycles(now, 300);
        assert_eq!(state.recent_cycles.len(), 1);
    }

    #[test]
    fn test_cycles_in_window() {
        let now = Utc.with_ymd_and_hms(2026, 8, 2, 12, 0, 0).unwrap();
        let mut state = HealthState::default();
        state.append_cycle(sample(now - Duration::seconds(700), 4));
        state.append_cycle(sample(now - Duration::seconds(50), 4));
        assert_eq!(state.cycles_in_window(now, 600).len(), 1);
        assert_eq!(state.cycles_in_window(now, 0).len(), 0);
    }

    #[test]
    fn test_state_round_trips_through_json() {
        let now = Utc.with_ymd_and_hms(2026, 8, 2, 12, 0, 0).unwrap();
        let mut state = HealthState {
            incident_open: true,
            incident_started_at: Some(now),
            consecutive_severe_failures: 5,
            backfill_pending_start_date: Some("20260720".into()),
            backfill_pending_end_date: Some("20260801".into()),
            ..Default::default()
        };
        state.append_cycle(sample(now, 4));

        let text = serde_json::to_string(&state).unwrap();
        let loaded: HealthState = serde_json::from_str(&text).unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_unknown_fields_are_defaulted() {
        let loaded: HealthState = serde_json::from_str("{}").unwrap();
        assert!(!loaded.incident_open);
        assert!(loaded.recent_cycles.is_empty());
    }
}
