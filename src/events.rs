// src/events.rs

//! Stable structured-event names.
//!
//! Every log line that carries operational meaning is a single JSON object
//! with a mandatory `event` field drawn from this list. Dashboards and
//! alarm rules key on these names; treat them as a public contract.

// Runtime lifecycle
pub const STARTUP_READY: &str = "startup.ready";
pub const STARTUP_INVALID_CONFIG: &str = "startup.invalid_config";
pub const SHUTDOWN_INTERRUPT: &str = "shutdown.interrupt";
pub const SHUTDOWN_RUN_ONCE_COMPLETE: &str = "shutdown.run_once_complete";
pub const SHUTDOWN_FORCED: &str = "shutdown.forced";
pub const SHUTDOWN_UNEXPECTED_ERROR: &str = "shutdown.unexpected_error";

// Cycle
pub const CYCLE_START: &str = "cycle.start";
pub const CYCLE_COMPLETE: &str = "cycle.complete";
pub const CYCLE_COST_METRICS: &str = "cycle.cost.metrics";
pub const CYCLE_PARALLEL_FETCH: &str = "cycle.parallel_fetch";
pub const CYCLE_AREA_INTERVAL_IGNORED: &str = "cycle.area_interval_ignored";
pub const CYCLE_INTERVAL_ADJUSTED: &str = "cycle.interval.adjusted";
pub const CYCLE_ITERATION_FAILED: &str = "cycle.iteration.failed";
pub const CYCLE_FATAL_ERROR: &str = "cycle.fatal_error";

// Area processing
pub const AREA_START: &str = "area.start";
pub const AREA_FAILED: &str = "area.failed";
pub const AREA_FETCH_SUMMARY: &str = "area.fetch.summary";
pub const AREA_FETCH_RETRY: &str = "area.fetch.retry";
pub const AREA_CODE_UNMAPPED: &str = "area.code_unmapped";
pub const AREA_NAME_MAPPING_WARNING: &str = "area.name_mapping_warning";

// Notifications
pub const NOTIFICATION_SENT: &str = "notification.sent";
pub const NOTIFICATION_DRY_RUN: &str = "notification.dry_run";
pub const NOTIFICATION_RETRY: &str = "notification.retry";
pub const NOTIFICATION_FINAL_FAILURE: &str = "notification.final_failure";
pub const NOTIFICATION_URL_ATTACHMENT_BLOCKED: &str = "notification.url_attachment_blocked";
pub const NOTIFICATION_BACKPRESSURE_APPLIED: &str = "notification.backpressure.applied";
pub const NOTIFICATION_CIRCUIT_OPENED: &str = "notification.circuit.opened";
pub const NOTIFICATION_CIRCUIT_BLOCKED: &str = "notification.circuit.blocked";
pub const NOTIFICATION_CIRCUIT_CLOSED: &str = "notification.circuit.closed";

// Health
pub const HEALTH_EVALUATE: &str = "health.evaluate";
pub const HEALTH_NOTIFICATION_SENT: &str = "health.notification.sent";
pub const HEALTH_NOTIFICATION_FAILED: &str = "health.notification.failed";
pub const HEALTH_BACKFILL_START: &str = "health.backfill.start";
pub const HEALTH_BACKFILL_COMPLETE: &str = "health.backfill.complete";
pub const HEALTH_BACKFILL_FAILED: &str = "health.backfill.failed";
pub const HEALTH_STATE_INVALID_JSON: &str = "health_state.invalid_json";
pub const HEALTH_STATE_READ_FAILED: &str = "health_state.read_failed";
pub const HEALTH_STATE_BACKUP_FAILED: &str = "health_state.backup_failed";
pub const HEALTH_STATE_PERSIST_FAILED: &str = "health_state.persist_failed";

// State store
pub const STATE_INVALID_JSON: &str = "state.invalid_json";
pub const STATE_READ_FAILED: &str = "state.read_failed";
pub const STATE_BACKUP_FAILED: &str = "state.backup_failed";
pub const STATE_PERSIST_FAILED: &str = "state.persist_failed";
pub const STATE_CLEANUP_AUTO: &str = "state.cleanup.auto";
pub const STATE_CLEANUP_COMPLETE: &str = "state.cleanup.complete";
pub const STATE_CLEANUP_FAILED: &str = "state.cleanup.failed";
pub const STATE_MIGRATION_COMPLETE: &str = "state.migration.complete";
pub const STATE_MIGRATION_FAILED: &str = "state.migration.failed";
pub const STATE_VERIFY_COMPLETE: &str = "state.verify.complete";
pub const STATE_VERIFY_FAILED: &str = "state.verify.failed";
