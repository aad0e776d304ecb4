// src/storage/json.rs

//! File-backed state store.
//!
//! The whole state is one JSON document; writes go through a `.tmp`
//! sibling and an atomic rename, so a crash never leaves a torn file. A
//! corrupted document is moved aside as `<name>.broken-<timestamp>` and
//! the store restarts empty rather than taking the service down.
//!
//! Reads accept the two layouts earlier releases persisted (a
//! schema-versioned `{version, events}` document and a plain
//! message-to-sent-flag map) and rewrite them in the current
//! `sent_messages` shape on open; only unparseable JSON counts as
//! corruption.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::error;

use crate::error::Result;
use crate::events;
use crate::logging::log_event;
use crate::models::{AlertNotification, TrackedRecord};
use crate::storage::{cleanup_reference, StateStore};
use crate::utils::time::utc_now_iso;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    area_code: String,
    message: String,
    report_url: Option<String>,
    sent: bool,
    first_seen_at: String,
    updated_at: String,
    last_sent_at: Option<String>,
}

#[derive(Debug, Serialize)]
struct StateDocument {
    sent_messages: BTreeMap<String, StoredRecord>,
}

struct Inner {
    events: BTreeMap<String, StoredRecord>,
    /// Cached so `pending_count` stays O(1) no matter the state size.
    pending: usize,
}

/// JSON-file backend of the [`StateStore`] contract.
pub struct JsonStateStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl JsonStateStore {
    /// Open (or initialize) the store at `path`.
    ///
    /// Documents in an older layout are normalized and rewritten in the
    /// current shape before the store is handed out.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let (events, migrated) = Self::load(&path).await;
        let pending = events.values().filter(|r| !r.sent).count();
        let store = Self {
            path,
            inner: Mutex::new(Inner { events, pending }),
        };
        if migrated {
            let inner = store.inner.lock().await;
            store.persist(&inner).await?;
        }
        Ok(store)
    }

    /// Returns the loaded records plus whether the artifact needs to be
    /// rewritten (older layout, dropped records, or corruption reset).
    async fn load(path: &Path) -> (BTreeMap<String, StoredRecord>, bool) {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return (BTreeMap::new(), false);
            }
            Err(e) => {
                error!(
                    "{}",
                    log_event(
                        events::STATE_READ_FAILED,
                        json!({"file": path.display().to_string(), "error": e.to_string()}),
                    )
                );
                return (BTreeMap::new(), false);
            }
        };

        match serde_json::from_slice::<Value>(&bytes) {
            Ok(raw) => normalize_state(raw, &utc_now_iso()),
            Err(parse_error) => {
                let backup = backup_corrupted_file(path, events::STATE_BACKUP_FAILED).await;
                error!(
                    "{}",
                    log_event(
                        events::STATE_INVALID_JSON,
                        json!({
                            "file": path.display().to_string(),
                            "backup": backup,
                            "error": parse_error.to_string(),
                        }),
                    )
                );
                (BTreeMap::new(), true)
            }
        }
    }

    async fn persist(&self, inner: &Inner) -> Result<()> {
        let document = StateDocument {
            sent_messages: inner.events.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&document)?;

        if let Err(e) = write_atomic(&self.path, &bytes).await {
            error!(
                "{}",
                log_event(
                    events::STATE_PERSIST_FAILED,
                    json!({"file": self.path.display().to_string(), "error": e.to_string()}),
                )
            );
            return Err(e);
        }
        Ok(())
    }

    fn to_tracked(event_id: &str, record: &StoredRecord) -> TrackedRecord {
        TrackedRecord {
            event_id: event_id.to_string(),
            area_code: record.area_code.clone(),
            message: record.message.clone(),
            report_url: record.report_url.clone(),
            sent: record.sent,
            first_seen_at: record.first_seen_at.clone(),
            updated_at: record.updated_at.clone(),
            last_sent_at: record.last_sent_at.clone(),
        }
    }
}

/// Write bytes atomically (write to temp, then rename).
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Move a corrupted artifact aside; returns the backup path on success.
/// A failed rename is reported under `failure_event` but never stops the
/// service.
pub(crate) async fn backup_corrupted_file(path: &Path, failure_event: &str) -> Option<String> {
    let timestamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    let name = path.file_name()?.to_string_lossy();
    let backup = path.with_file_name(format!("{name}.broken-{timestamp}"));
    match tokio::fs::rename(path, &backup).await {
        Ok(()) => Some(backup.display().to_string()),
        Err(e) => {
            error!(
                "{}",
                log_event(
                    failure_event,
                    json!({"file": path.display().to_string(), "error": e.to_string()}),
                )
            );
            None
        }
    }
}

/// Normalize a parsed document into the current record map.
///
/// Accepted layouts, newest first: `{"sent_messages": {id: record}}`,
/// the schema-versioned `{"version": _, "events": {id: record}}`, a bare
/// `{id: record}` map, and the oldest `{message: sent-flag}` map whose
/// entries get synthetic `legacy:<digest>` ids. The flag reports whether
/// the artifact must be rewritten.
fn normalize_state(raw: Value, now: &str) -> (BTreeMap<String, StoredRecord>, bool) {
    let Value::Object(mut root) = raw else {
        return (BTreeMap::new(), true);
    };

    let (records, mut migrated) = if let Some(current) = root.remove("sent_messages") {
        match current {
            Value::Object(map) => (map, false),
            _ => return (BTreeMap::new(), true),
        }
    } else if let Some(versioned) = root.remove("events") {
        match versioned {
            Value::Object(map) => (map, true),
            _ => return (BTreeMap::new(), true),
        }
    } else {
        (root, true)
    };

    let is_legacy_flag_map = !records.is_empty()
        && records
            .values()
            .all(|value| value.is_boolean() || value.is_i64() || value.is_u64());
    if is_legacy_flag_map {
        let mut normalized = BTreeMap::new();
        for (message, status) in records {
            let sent = match status {
                Value::Bool(flag) => flag,
                Value::Number(number) => number.as_i64().unwrap_or(0) != 0,
                _ => false,
            };
            normalized.insert(legacy_event_id(&message), legacy_record(message, sent, now));
        }
        return (normalized, true);
    }

    let mut normalized = BTreeMap::new();
    for (event_id, value) in records {
        match record_from_value(&value, now) {
            Some(record) => {
                normalized.insert(event_id, record);
            }
            None => migrated = true,
        }
    }
    (normalized, migrated)
}

/// Lenient per-record read; `None` drops a non-object entry.
fn record_from_value(value: &Value, now: &str) -> Option<StoredRecord> {
    let object = value.as_object()?;
    let text = |key: &str, default: &str| {
        object
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or(default)
            .to_string()
    };

    let sent = object.get("sent").and_then(Value::as_bool).unwrap_or(false);
    let updated_at = text("updated_at", now);
    let mut last_sent_at = object
        .get("last_sent_at")
        .and_then(Value::as_str)
        .map(str::to_string);
    if sent && last_sent_at.is_none() {
        last_sent_at = Some(updated_at.clone());
    }

    Some(StoredRecord {
        area_code: text("area_code", "UNKNOWN"),
        message: text("message", ""),
        report_url: object
            .get("report_url")
            .and_then(Value::as_str)
            .map(str::to_string),
        sent,
        first_seen_at: text("first_seen_at", now),
        updated_at,
        last_sent_at,
    })
}

fn legacy_event_id(message: &str) -> String {
    let digest = Sha256::digest(message.as_bytes());
    format!("legacy:{}", &hex::encode(digest)[..20])
}

fn legacy_record(message: String, sent: bool, now: &str) -> StoredRecord {
    StoredRecord {
        area_code: "UNKNOWN".to_string(),
        message,
        report_url: None,
        sent,
        first_seen_at: now.to_string(),
        updated_at: now.to_string(),
        last_sent_at: sent.then(|| now.to_string()),
    }
}

#[async_trait]
impl StateStore for JsonStateStore {
    async fn upsert(&self, notifications: &[AlertNotification]) -> Result<usize> {
        let now = utc_now_iso();
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let mut changed = false;
        let mut new_count = 0;

        for notification in notifications {
            match inner.events.get_mut(&notification.event_id) {
                None => {
                    inner.events.insert(
                        notification.event_id.clone(),
                        StoredRecord {
                            area_code: notification.area_code.clone(),
                            message: notification.message.clone(),
                            report_url: notification.report_url.clone(),
                            sent: false,
                            first_seen_at: now.clone(),
                            updated_at: now.clone(),
                            last_sent_at: None,
                        },
                    );
                    inner.pending += 1;
                    new_count += 1;
                    changed = true;
                }
                Some(existing) => {
                    let mut record_changed = false;
                    if existing.area_code != notification.area_code {
                        existing.area_code = notification.area_code.clone();
                        record_changed = true;
                    }
                    if existing.message != notification.message {
                        existing.message = notification.message.clone();
                        record_changed = true;
                    }
                    if existing.report_url != notification.report_url {
                        existing.report_url = notification.report_url.clone();
                        record_changed = true;
                    }
                    if record_changed {
                        existing.updated_at = now.clone();
                        changed = true;
                    }
                }
            }
        }

        if changed {
            self.persist(&inner).await?;
        }
        Ok(new_count)
    }

    async fn pending(&self, area_code: Option<&str>) -> Result<Vec<TrackedRecord>> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<TrackedRecord> = inner
            .events
            .iter()
            .filter(|(_, record)| !record.sent)
            .filter(|(_, record)| area_code.map_or(true, |code| record.area_code == code))
            .map(|(event_id, record)| Self::to_tracked(event_id, record))
            .collect();
        rows.sort_by(|a, b| a.first_seen_at.cmp(&b.first_seen_at));
        Ok(rows)
    }

    async fn all_records(&self) -> Result<Vec<TrackedRecord>> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<TrackedRecord> = inner
            .events
            .iter()
            .map(|(event_id, record)| Self::to_tracked(event_id, record))
            .collect();
        rows.sort_by(|a, b| a.first_seen_at.cmp(&b.first_seen_at));
        Ok(rows)
    }

    async fn mark_sent(&self, event_ids: &[String]) -> Result<usize> {
        let now = utc_now_iso();
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let mut marked = 0;

        for event_id in event_ids {
            if let Some(record) = inner.events.get_mut(event_id) {
                if !record.sent {
                    record.sent = true;
                    record.updated_at = now.clone();
                    record.last_sent_at = Some(now.clone());
                    inner.pending -= 1;
                    marked += 1;
                }
            }
        }

        if marked > 0 {
            self.persist(&inner).await?;
        }
        Ok(marked)
    }

    async fn cleanup_stale(
        &self,
        days: u32,
        include_unsent: bool,
        dry_run: bool,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let threshold = now - Duration::days(i64::from(days));
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        let removable: Vec<String> = inner
            .events
            .iter()
            .filter(|(_, record)| include_unsent || record.sent)
            .filter_map(|(event_id, record)| {
                let tracked = Self::to_tracked(event_id, record);
                let reference = cleanup_reference(&tracked)?;
                (reference <= threshold).then(|| event_id.clone())
            })
            .collect();

        if dry_run || removable.is_empty() {
            return Ok(removable.len());
        }

        for event_id in &removable {
            if let Some(record) = inner.events.remove(event_id) {
                if !record.sent {
                    inner.pending -= 1;
                }
            }
        }
        self.persist(&inner).await?;
        Ok(removable.len())
    }

    async fn total_count(&self) -> Result<usize> {
        Ok(self.inner.lock().await.events.len())
    }

    async fn pending_count(&self) -> Result<usize> {
        Ok(self.inner.lock().await.pending)
    }
}
