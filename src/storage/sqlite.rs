// src/storage/sqlite.rs

//! Embedded SQLite state store.
//!
//! WAL journal mode plus a generous busy timeout tolerate transient lock
//! contention; upserts and send-marking run as batched prepared statements
//! inside one transaction, and staleness cleanup is a single filtered
//! DELETE so it scales to large tables. Stored timestamps are fixed-width
//! RFC 3339 strings, so SQL string comparison is chronological comparison.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OpenFlags};

use crate::error::{AppError, Result};
use crate::models::{AlertNotification, TrackedRecord};
use crate::storage::StateStore;
use crate::utils::time::{to_utc_iso, utc_now_iso};

const BUSY_TIMEOUT_MS: u64 = 30_000;
const EXISTING_LOOKUP_CHUNK: usize = 500;

/// SQLite backend of the [`StateStore`] contract.
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteStateStore {
    /// Open (or initialize) the database at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        Self::init_connection(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Open an existing database read-only (used by the verifier).
    pub fn open_read_only(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn init_connection(conn: &Connection) -> Result<()> {
        conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS notifications (
               event_id      TEXT PRIMARY KEY,
               area_code     TEXT NOT NULL,
               message       TEXT NOT NULL,
               report_url    TEXT,
               sent          INTEGER NOT NULL DEFAULT 0,
               first_seen_at TEXT NOT NULL,
               updated_at    TEXT NOT NULL,
               last_sent_at  TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_notifications_sent_area
               ON notifications(sent, area_code, first_seen_at);",
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::state("sqlite connection mutex poisoned"))
    }

    fn fetch_existing(
        conn: &Connection,
        event_ids: &[&str],
    ) -> Result<std::collections::HashMap<String, (String, String, Option<String>)>> {
        let mut existing = std::collections::HashMap::new();
        for chunk in event_ids.chunks(EXISTING_LOOKUP_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let sql = format!(
                "SELECT event_id, area_code, message, report_url
                 FROM notifications WHERE event_id IN ({placeholders})"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(chunk.iter()), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    (row.get(1)?, row.get(2)?, row.get(3)?),
                ))
            })?;
            for row in rows {
                let (event_id, fields) = row?;
                existing.insert(event_id, fields);
            }
        }
        Ok(existing)
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<TrackedRecord> {
        Ok(TrackedRecord {
            event_id: row.get(0)?,
            area_code: row.get(1)?,
            message: row.get(2)?,
            report_url: row.get(3)?,
            sent: row.get::<_, i64>(4)? != 0,
            first_seen_at: row.get(5)?,
            updated_at: row.get(6)?,
            last_sent_at: row.get(7)?,
        })
    }

    fn select_records(&self, where_clause: &str, area_code: Option<&str>) -> Result<Vec<TrackedRecord>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT event_id, area_code, message, report_url, sent,
                    first_seen_at, updated_at, last_sent_at
             FROM notifications {where_clause}
             ORDER BY first_seen_at ASC, event_id ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = match area_code {
            Some(code) => stmt.query_map(params![code], Self::row_to_record)?,
            None => stmt.query_map([], Self::row_to_record)?,
        };
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    fn count_where(&self, where_clause: &str) -> Result<usize> {
        let conn = self.lock()?;
        let sql = format!("SELECT COUNT(*) FROM notifications {where_clause}");
        let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Bulk-import rows preserving every timestamp and the `sent` flag;
    /// used by the JSON → SQLite migration. Returns the number of rows
    /// that did not exist before.
    pub fn import_records(&self, records: &[TrackedRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let ids: Vec<&str> = records.iter().map(|r| r.event_id.as_str()).collect();

        let mut conn = self.lock()?;
        let existing = Self::fetch_existing(&conn, &ids)?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO notifications (
                   event_id, area_code, message, report_url, sent,
                   first_seen_at, updated_at, last_sent_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(event_id) DO UPDATE SET
                   area_code = excluded.area_code,
                   message = excluded.message,
                   report_url = excluded.report_url,
                   sent = excluded.sent,
                   first_seen_at = excluded.first_seen_at,
                   updated_at = excluded.updated_at,
                   last_sent_at = excluded.last_sent_at",
            )?;
            for record in records {
                stmt.execute(params![
                    record.event_id,
                    record.area_code,
                    record.message,
                    record.report_url,
                    record.sent as i64,
                    record.first_seen_at,
                    record.updated_at,
                    record.last_sent_at,
                ])?;
            }
        }
        tx.commit()?;

        Ok(records
            .iter()
            .filter(|r| !existing.contains_key(&r.event_id))
            .count())
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn upsert(&self, notifications: &[AlertNotification]) -> Result<usize> {
        if notifications.is_empty() {
            return Ok(0);
        }
        // Last write wins within one batch, matching the file backend.
        let mut by_id: std::collections::HashMap<&str, &AlertNotification> =
            std::collections::HashMap::new();
        for notification in notifications {
            by_id.insert(notification.event_id.as_str(), notification);
        }
        let ids: Vec<&str> = by_id.keys().copied().collect();
        let now = utc_now_iso();

        let mut conn = self.lock()?;
        let existing = Self::fetch_existing(&conn, &ids)?;
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut insert = tx.prepare(
                "INSERT INTO notifications (
                   event_id, area_code, message, report_url, sent,
                   first_seen_at, updated_at, last_sent_at
                 ) VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5, NULL)",
            )?;
            let mut update = tx.prepare(
                "UPDATE notifications
                 SET area_code = ?1, message = ?2, report_url = ?3, updated_at = ?4
                 WHERE event_id = ?5",
            )?;

            for (event_id, notification) in &by_id {
                match existing.get(*event_id) {
                    None => {
                        insert.execute(params![
                            notification.event_id,
                            notification.area_code,
                            notification.message,
                            notification.report_url,
                            now,
                        ])?;
                        inserted += 1;
                    }
                    Some((area_code, message, report_url)) => {
                        let unchanged = *area_code == notification.area_code
                            && *message == notification.message
                            && *report_url == notification.report_url;
                        if !unchanged {
                            update.execute(params![
                                notification.area_code,
                                notification.message,
                                notification.report_url,
                                now,
                                notification.event_id,
                            ])?;
                        }
                    }
                }
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    async fn pending(&self, area_code: Option<&str>) -> Result<Vec<TrackedRecord>> {
        match area_code {
            Some(code) => self.select_records("WHERE sent = 0 AND area_code = ?1", Some(code)),
            None => self.select_records("WHERE sent = 0", None),
        }
    }

    async fn all_records(&self) -> Result<Vec<TrackedRecord>> {
        self.select_records("", None)
    }

    async fn mark_sent(&self, event_ids: &[String]) -> Result<usize> {
        if event_ids.is_empty() {
            return Ok(0);
        }
        let now = utc_now_iso();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut marked = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE notifications
                 SET sent = 1, updated_at = ?1, last_sent_at = ?1
                 WHERE sent = 0 AND event_id = ?2",
            )?;
            for event_id in event_ids {
                marked += stmt.execute(params![now, event_id])?;
            }
        }
        tx.commit()?;
        Ok(marked)
    }

    async fn cleanup_stale(
        &self,
        days: u32,
        include_unsent: bool,
        dry_run: bool,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let threshold = to_utc_iso(now - Duration::days(i64::from(days)));
        let predicate = "(?1 = 1 OR sent = 1)
             AND COALESCE(updated_at, last_sent_at, first_seen_at) <= ?2";

        let conn = self.lock()?;
        if dry_run {
            let sql =
                format!("SELECT COUNT(*) FROM notifications WHERE {predicate}");
            let count: i64 = conn.query_row(&sql, params![include_unsent as i64, threshold], |row| {
                row.get(0)
            })?;
            return Ok(count as usize);
        }

        let sql = format!("DELETE FROM notifications WHERE {predicate}");
        let removed = conn.execute(&sql, params![include_unsent as i64, threshold])?;
        Ok(removed)
    }

    async fn total_count(&self) -> Result<usize> {
        self.count_where("")
    }

    async fn pending_count(&self) -> Result<usize> {
        self.count_where("WHERE sent = 0")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn notification(event_id: &str, area: &str, message: &str) -> AlertNotification {
        AlertNotification {
            event_id: event_id.into(),
            area_code: area.into(),
            message: message.into(),
            report_url: None,
            url_validation_error: None,
        }
    }

    fn open_store(dir: &TempDir) -> SqliteStateStore {
        SqliteStateStore::open(dir.path().join("sent_messages.db")).unwrap()
    }

    #[tokio::test]
    async fn test_upsert_and_mark_sent() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);

        let new = store
            .upsert(&[notification("e1", "A", "m1"), notification("e2", "B", "m2")])
            .await
            .unwrap();
        assert_eq!(new, 2);
        assert_eq!(store.pending_count().await.unwrap(), 2);

        let marked = store.mark_sent(&["e1".to_string()]).await.unwrap();
        assert_eq!(marked, 1);
        assert_eq!(store.pending_count().await.unwrap(), 1);
        assert_eq!(store.mark_sent(&["e1".to_string()]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reupsert_preserves_timestamps_and_flag() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);

        store.upsert(&[notification("e1", "A", "m1")]).await.unwrap();
        store.mark_sent(&["e1".to_string()]).await.unwrap();
        let before = store.all_records().await.unwrap().remove(0);

        let new = store.upsert(&[notification("e1", "A", "m1")]).await.unwrap();
        assert_eq!(new, 0);
        assert_eq!(store.all_records().await.unwrap().remove(0), before);

        store.upsert(&[notification("e1", "A", "m2")]).await.unwrap();
        let after = store.all_records().await.unwrap().remove(0);
        assert_eq!(after.first_seen_at, before.first_seen_at);
        assert!(after.sent);
        assert_eq!(after.last_sent_at, before.last_sent_at);
        assert_eq!(after.message, "m2");
    }

    #[tokio::test]
    async fn test_duplicate_ids_within_batch_insert_once() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        let new = store
            .upsert(&[notification("e1", "A", "m1"), notification("e1", "A", "m1")])
            .await
            .unwrap();
        assert_eq!(new, 1);
        assert_eq!(store.total_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_pending_filters_and_orders() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        store
            .upsert(&[
                notification("e1", "A", "m1"),
                notification("e2", "B", "m2"),
                notification("e3", "A", "m3"),
            ])
            .await
            .unwrap();
        store.mark_sent(&["e1".to_string()]).await.unwrap();

        let rows = store.pending(Some("A")).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].event_id, "e3");
        assert_eq!(store.pending(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_cleanup_single_delete_and_dry_run() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        store
            .upsert(&[notification("sent", "A", "m"), notification("pending", "A", "m")])
            .await
            .unwrap();
        store.mark_sent(&["sent".to_string()]).await.unwrap();

        let future = Utc::now() + Duration::days(40);
        assert_eq!(store.cleanup_stale(30, false, true, future).await.unwrap(), 1);
        assert_eq!(store.total_count().await.unwrap(), 2);

        assert_eq!(store.cleanup_stale(30, false, false, future).await.unwrap(), 1);
        assert_eq!(store.total_count().await.unwrap(), 1);
        assert_eq!(store.pending_count().await.unwrap(), 1);

        assert_eq!(store.cleanup_stale(30, true, false, future).await.unwrap(), 1);
        assert_eq!(store.total_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_import_preserves_fields_exactly() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);

        let record = TrackedRecord {
            event_id: "e1".into(),
            area_code: "A".into(),
            message: "m".into(),
            report_url: Some("https://example.com".into()),
            sent: true,
            first_seen_at: "2026-07-01T00:00:00Z".into(),
            updated_at: "2026-07-02T00:00:00Z".into(),
            last_sent_at: Some("2026-07-02T00:00:00Z".into()),
        };
        assert_eq!(store.import_records(&[record.clone()]).unwrap(), 1);
        assert_eq!(store.all_records().await.unwrap().remove(0), record);

        // Re-import counts zero new rows.
        assert_eq!(store.import_records(&[record]).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reopen_persists_rows() {
        let tmp = TempDir::new().unwrap();
        {
            let store = open_store(&tmp);
            store.upsert(&[notification("e1", "A", "m")]).await.unwrap();
        }
        let store = open_store(&tmp);
        assert_eq!(store.total_count().await.unwrap(), 1);
    }
}
