// src/services/health_monitor.rs

//! Upstream health state machine.
//!
//! Pure by construction: the monitor mutates only its owned
//! [`HealthState`] and performs no I/O. The service loop feeds it one
//! cycle outcome at a time and persists the state afterwards through the
//! health store; that split is what makes outage scenarios unit-testable
//! with a synthetic clock.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::models::{CycleSample, HealthDecision, HealthEvent, HealthPolicy, HealthState};

pub struct HealthMonitor {
    policy: HealthPolicy,
    state: HealthState,
}

impl HealthMonitor {
    pub fn new(policy: HealthPolicy, state: HealthState) -> Self {
        Self { policy, state }
    }

    pub fn state(&self) -> &HealthState {
        &self.state
    }

    pub fn incident_open(&self) -> bool {
        self.state.incident_open
    }

    /// Consume one cycle outcome and decide whether a transition fired.
    pub fn observe_cycle(
        &mut self,
        now: DateTime<Utc>,
        total_areas: usize,
        failed_areas: usize,
        error_counts: &BTreeMap<String, u64>,
        representative_error: Option<&str>,
    ) -> HealthDecision {
        let sample = CycleSample {
            recorded_at: now,
            total_areas,
            failed_areas: failed_areas.min(total_areas),
            error_counts: error_counts.clone(),
            last_error: representative_error.map(str::to_string),
        };
        let severe = sample.fail_ratio() >= self.policy.outage_fail_ratio;

        self.state.append_cycle(sample);
        self.state.trim_recent_cycles(now, self.policy.retention_sec());
        self.update_consecutive_counters(severe);

        if self.state.incident_open {
            self.state.incident_total_cycles += 1;
            if failed_areas > 0 {
                self.state.incident_failed_cycles += 1;
                for (code, count) in error_counts {
                    *self
                        .state
                        .incident_error_counts
                        .entry(code.clone())
                        .or_insert(0) += count;
                }
            }
        }

        let outage_window = self.state.cycles_in_window(now, self.policy.outage_window_sec);
        let recovery_window = self
            .state
            .cycles_in_window(now, self.policy.recovery_window_sec);
        let outage_failed = outage_window
            .iter()
            .filter(|sample| sample.fail_ratio() >= self.policy.outage_fail_ratio)
            .count();

        let mut decision = HealthDecision {
            incident_open: self.state.incident_open,
            event: None,
            outage_window_cycles: outage_window.len(),
            outage_window_failed_cycles: outage_failed,
            outage_window_fail_ratio: window_fail_ratio(&outage_window),
            recovery_window_cycles: recovery_window.len(),
            recovery_window_fail_ratio: window_fail_ratio(&recovery_window),
            consecutive_severe_failures: self.state.consecutive_severe_failures,
            consecutive_stable_successes: self.state.consecutive_stable_successes,
            incident_duration_sec: self.incident_duration_sec(now),
            incident_total_cycles: self.state.incident_total_cycles,
            incident_failed_cycles: self.state.incident_failed_cycles,
            incident_error_counts: self.state.incident_error_counts.clone(),
            representative_error: representative_error.map(str::to_string),
        };

        if !self.state.incident_open && self.is_outage(outage_window.len(), outage_failed) {
            self.open_incident(now);
            decision.event = Some(HealthEvent::OutageDetected);
            decision.incident_open = true;
        } else if self.state.incident_open && self.is_recovered(&recovery_window) {
            // Capture the duration before close resets incident_started_at.
            decision.incident_duration_sec = self.incident_duration_sec(now);
            self.close_incident(now);
            decision.event = Some(HealthEvent::Recovered);
            decision.incident_open = false;
        } else if self.state.incident_open && self.should_send_heartbeat(now) {
            self.state.last_heartbeat_at = Some(now);
            decision.event = Some(HealthEvent::OutageHeartbeat);
        }

        decision
    }

    /// Cycle interval while an incident is open: exponential ladder over
    /// the consecutive-failure threshold, clamped to the configured cap.
    pub fn suggested_interval_sec(&self, base_interval_sec: u64) -> u64 {
        if base_interval_sec == 0 || !self.state.incident_open {
            return base_interval_sec;
        }

        let threshold = self.policy.outage_consecutive_failures.max(1);
        let failures = self.state.consecutive_severe_failures;
        let multiplier = if failures >= threshold * 3 {
            8
        } else if failures >= threshold * 2 {
            4
        } else if failures >= threshold {
            2
        } else {
            1
        };

        (base_interval_sec * multiplier).min(self.policy.backoff_max_sec.max(base_interval_sec))
    }

    /// Pending recovery-backfill range, if any.
    pub fn backfill_window(&self) -> Option<(String, String)> {
        let start = self.state.backfill_pending_start_date.clone()?;
        let end = self.state.backfill_pending_end_date.clone()?;
        (start < end).then_some((start, end))
    }

    /// Replace (or clear) the pending backfill range.
    pub fn set_backfill_window(&mut self, window: Option<(String, String)>) {
        match window {
            Some((start, end)) if start < end => {
                self.state.backfill_pending_start_date = Some(start);
                self.state.backfill_pending_end_date = Some(end);
            }
            _ => {
                self.state.backfill_pending_start_date = None;
                self.state.backfill_pending_end_date = None;
            }
        }
    }

    fn update_consecutive_counters(&mut self, severe: bool) {
        if severe {
            self.state.consecutive_severe_failures += 1;
            self.state.consecutive_stable_successes = 0;
            return;
        }
        self.state.consecutive_severe_failures = 0;
        let last_ratio = self
            .state
            .recent_cycles
            .last()
            .map(CycleSample::fail_ratio)
            .unwrap_or(0.0);
        if last_ratio <= self.policy.recovery_max_fail_ratio {
            self.state.consecutive_stable_successes += 1;
        } else {
            self.state.consecutive_stable_successes = 0;
        }
    }

    fn is_outage(&self, window_len: usize, severe_failed: usize) -> bool {
        window_len > 0
            && severe_failed >= self.policy.outage_min_failed_cycles
            && self.state.consecutive_severe_failures >= self.policy.outage_consecutive_failures
    }

    fn is_recovered(&self, window: &[&CycleSample]) -> bool {
        self.state.consecutive_stable_successes >= self.policy.recovery_consecutive_successes
            && window.len() >= self.policy.recovery_consecutive_successes
            && window_fail_ratio(window) <= self.policy.recovery_max_fail_ratio
    }

    fn should_send_heartbeat(&self, now: DateTime<Utc>) -> bool {
        match self.state.last_heartbeat_at {
            None => true,
            Some(last) => {
                (now - last).num_seconds() >= self.policy.heartbeat_interval_sec as i64
            }
        }
    }

    fn open_incident(&mut self, now: DateTime<Utc>) {
        self.state.incident_open = true;
        self.state.incident_started_at = Some(now);
        self.state.incident_notified_at = Some(now);
        self.state.last_heartbeat_at = Some(now);
        self.state.consecutive_stable_successes = 0;
        self.state.incident_total_cycles = 0;
        self.state.incident_failed_cycles = 0;
        self.state.incident_error_counts.clear();
    }

    fn close_incident(&mut self, now: DateTime<Utc>) {
        self.state.incident_open = false;
        self.state.last_recovered_at = Some(now);
        self.state.last_heartbeat_at = None;
        self.state.incident_notified_at = None;
        self.state.incident_started_at = None;
        self.state.incident_total_cycles = 0;
        self.state.incident_failed_cycles = 0;
        self.state.incident_error_counts.clear();
        self.state.consecutive_severe_failures = 0;
    }

    fn incident_duration_sec(&self, now: DateTime<Utc>) -> u64 {
        self.state
            .incident_started_at
            .map(|started| (now - started).num_seconds().max(0) as u64)
            .unwrap_or(0)
    }
}

fn window_fail_ratio(window: &[&CycleSample]) -> f64 {
    let total: usize = window.iter().map(|sample| sample.total_areas).sum();
    if total == 0 {
        return 0.0;
    }
    let failed: usize = window.iter().map(|sample| sample.failed_areas).sum();
    failed as f64 / total as f64
}
