// src/models/report.rs

//! Per-cycle rollup fed to logging and the health monitor.

use std::collections::BTreeMap;

use serde::Serialize;

/// Aggregated outcome of one reconciliation cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub start_date: String,
    pub end_date: String,
    pub area_count: usize,
    pub areas_processed: usize,
    pub area_failures: usize,
    pub alerts_fetched: usize,
    pub api_fetch_calls: usize,
    pub newly_tracked: usize,
    pub notification_attempts: usize,
    pub sent_count: usize,
    pub send_failures: usize,
    pub dry_run_skips: usize,
    pub backpressure_skips: usize,
    pub pending_total: usize,
    pub api_error_counts: BTreeMap<String, u64>,
    pub last_api_error: Option<String>,
}

impl CycleReport {
    pub fn new(start_date: &str, end_date: &str, area_count: usize) -> Self {
        Self {
            start_date: start_date.to_string(),
            end_date: end_date.to_string(),
            area_count,
            areas_processed: 0,
            area_failures: 0,
            alerts_fetched: 0,
            api_fetch_calls: 0,
            newly_tracked: 0,
            notification_attempts: 0,
            sent_count: 0,
            send_failures: 0,
            dry_run_skips: 0,
            backpressure_skips: 0,
            pending_total: 0,
            api_error_counts: BTreeMap::new(),
            last_api_error: None,
        }
    }

    /// Record one failed area fetch under its stable error code.
    pub fn record_area_failure(&mut self, error_code: &str, error_text: String) {
        self.area_failures += 1;
        *self
            .api_error_counts
            .entry(error_code.to_string())
            .or_insert(0) += 1;
        self.last_api_error = Some(error_text);
    }
}
