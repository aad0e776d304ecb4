// src/storage/migrate.rs

//! One-shot migration from the JSON file backend to SQLite.

use std::path::Path;

use serde::Serialize;

use crate::error::Result;
use crate::storage::{JsonStateStore, SqliteStateStore, StateStore};

/// Outcome summary of a migration run.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationResult {
    pub total_records: usize,
    pub inserted_records: usize,
    pub sent_records: usize,
}

/// Copy every record from the JSON store into the SQLite store.
///
/// `first_seen_at`, `updated_at`, `last_sent_at`, and `sent` are carried
/// over exactly; re-running the migration is safe and reports zero
/// inserts.
pub async fn migrate_json_to_sqlite(
    json_state_file: &Path,
    sqlite_state_file: &Path,
) -> Result<MigrationResult> {
    let source = JsonStateStore::open(json_state_file).await?;
    let target = SqliteStateStore::open(sqlite_state_file)?;

    let records = source.all_records().await?;
    let inserted_records = target.import_records(&records)?;
    let sent_records = records.iter().filter(|r| r.sent).count();

    Ok(MigrationResult {
        total_records: records.len(),
        inserted_records,
        sent_records,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AlertNotification;
    use tempfile::TempDir;

    fn notification(event_id: &str) -> AlertNotification {
        AlertNotification {
            event_id: event_id.into(),
            area_code: "A".into(),
            message: "m".into(),
            report_url: None,
            url_validation_error: None,
        }
    }

    #[tokio::test]
    async fn test_migration_preserves_rows() {
        let tmp = TempDir::new().unwrap();
        let json_path = tmp.path().join("sent_messages.json");
        let sqlite_path = tmp.path().join("sent_messages.db");

        let source = JsonStateStore::open(&json_path).await.unwrap();
        source
            .upsert(&[notification("e1"), notification("e2")])
            .await
            .unwrap();
        source.mark_sent(&["e1".to_string()]).await.unwrap();
        let source_records = source.all_records().await.unwrap();
        drop(source);

        let result = migrate_json_to_sqlite(&json_path, &sqlite_path)
            .await
            .unwrap();
        assert_eq!(result.total_records, 2);
        assert_eq!(result.inserted_records, 2);
        assert_eq!(result.sent_records, 1);

        let target = SqliteStateStore::open(&sqlite_path).unwrap();
        assert_eq!(target.all_records().await.unwrap(), source_records);
    }

    #[tokio::test]
    async fn test_rerun_inserts_nothing() {
        let tmp = TempDir::new().unwrap();
        let json_path = tmp.path().join("sent_messages.json");
        let sqlite_path = tmp.path().join("sent_messages.db");

        let source = JsonStateStore::open(&json_path).await.unwrap();
        source.upsert(&[notification("e1")]).await.unwrap();
        drop(source);

        migrate_json_to_sqlite(&json_path, &sqlite_path).await.unwrap();
        let second = migrate_json_to_sqlite(&json_path, &sqlite_path)
            .await
            .unwrap();
        assert_eq!(second.total_records, 1);
        assert_eq!(second.inserted_records, 0);
    }
}
