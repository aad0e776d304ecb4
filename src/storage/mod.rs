// src/storage/mod.rs

//! Durable state persistence.
//!
//! Two interchangeable backends implement the same [`StateStore`]
//! contract: an append-safe JSON file for small deployments and an
//! embedded SQLite database for larger ones. A one-shot migration copies
//! the former into the latter, and a verifier cross-checks both.

pub mod health;
pub mod json;
pub mod migrate;
pub mod sqlite;
pub mod verify;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{AlertNotification, TrackedRecord};

pub use health::JsonHealthStore;
pub use json::JsonStateStore;
pub use sqlite::SqliteStateStore;

/// Backend-agnostic contract for tracked-notification persistence.
///
/// Cross-process concurrent writers are not supported; within one process
/// each backend serializes its writers internally. Every write survives a
/// crash mid-operation: the artifact on disk is always either the old or
/// the new version.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Insert or refresh a batch of notifications.
    ///
    /// Existing fingerprints keep their `first_seen_at`, `sent`, and
    /// `last_sent_at`; payload fields and `updated_at` change only when a
    /// field actually differs. Returns the number of newly inserted rows.
    async fn upsert(&self, notifications: &[AlertNotification]) -> Result<usize>;

    /// Not-yet-sent rows, optionally filtered by area, ordered by
    /// `first_seen_at`.
    async fn pending(&self, area_code: Option<&str>) -> Result<Vec<TrackedRecord>>;

    /// Every tracked row, ordered by `first_seen_at`.
    async fn all_records(&self) -> Result<Vec<TrackedRecord>>;

    /// Mark rows as delivered. Already-sent and unknown ids are ignored;
    /// returns the number of rows actually transitioned.
    async fn mark_sent(&self, event_ids: &[String]) -> Result<usize>;

    /// Delete rows whose reference timestamp is older than `days` days.
    ///
    /// Pending rows are kept unless `include_unsent` is set. With
    /// `dry_run` the removable count is returned without deleting.
    async fn cleanup_stale(
        &self,
        days: u32,
        include_unsent: bool,
        dry_run: bool,
        now: DateTime<Utc>,
    ) -> Result<usize>;

    async fn total_count(&self) -> Result<usize>;

    async fn pending_count(&self) -> Result<usize>;
}

/// Reference timestamp for staleness decisions: last update, else last
/// send, else first sighting. Unparseable rows never expire.
pub(crate) fn cleanup_reference(record: &TrackedRecord) -> Option<DateTime<Utc>> {
    crate::utils::time::parse_utc_iso(&record.updated_at)
        .or_else(|| {
            record
                .last_sent_at
                .as_deref()
                .and_then(crate::utils::time::parse_utc_iso)
        })
        .or_else(|| crate::utils::time::parse_utc_iso(&record.first_seen_at))
}
