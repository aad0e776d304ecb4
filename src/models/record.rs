// src/models/record.rs

//! Tracked notification rows as persisted by the state stores.

use serde::{Deserialize, Serialize};

/// One tracked notification, keyed by event fingerprint.
///
/// Invariants maintained by every store backend:
/// - `sent == true` implies `last_sent_at` is set
/// - `updated_at >= first_seen_at`
/// - re-upserting an existing fingerprint never regresses `first_seen_at`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedRecord {
    pub event_id: String,
    pub area_code: String,
    pub message: String,
    pub report_url: Option<String>,
    pub sent: bool,
    pub first_seen_at: String,
    pub updated_at: String,
    pub last_sent_at: Option<String>,
}
