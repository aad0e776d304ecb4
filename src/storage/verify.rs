// src/storage/verify.rs

//! Integrity verification across the two state backends.
//!
//! Reads both artifacts without mutating them (the JSON file is parsed
//! raw so a corrupt file is reported, not backed up and reset), checks
//! each store's internal invariants, and cross-compares the rows the two
//! backends have in common. Severity is two-level: errors always fail
//! verification, warnings fail only in strict mode.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;

use crate::error::Result;
use crate::models::TrackedRecord;
use crate::storage::{SqliteStateStore, StateStore};
use crate::utils::time::parse_utc_iso;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

/// One finding from verification.
#[derive(Debug, Clone, Serialize)]
pub struct VerificationIssue {
    pub repository: String,
    pub severity: Severity,
    pub code: String,
    pub detail: String,
}

/// Per-backend headline numbers.
#[derive(Debug, Clone, Serialize)]
pub struct RepositorySummary {
    pub repository: String,
    pub file_path: String,
    pub exists: bool,
    pub records: usize,
    pub sent: usize,
    pub pending: usize,
}

/// Full verification report.
#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub strict: bool,
    pub summaries: Vec<RepositorySummary>,
    pub issues: Vec<VerificationIssue>,
}

impl VerificationReport {
    pub fn error_count(&self) -> usize {
        self.issues
            .iter()
            .filter(|i| i.severity == Severity::Error)
            .count()
    }

    pub fn warning_count(&self) -> usize {
        self.issues
            .iter()
            .filter(|i| i.severity == Severity::Warning)
            .count()
    }

    pub fn passed(&self) -> bool {
        if self.strict {
            self.issues.is_empty()
        } else {
            self.error_count() == 0
        }
    }
}

struct BackendReadout {
    summary: RepositorySummary,
    records: Option<BTreeMap<String, TrackedRecord>>,
}

fn issue(repository: &str, severity: Severity, code: &str, detail: impl Into<String>) -> VerificationIssue {
    VerificationIssue {
        repository: repository.to_string(),
        severity,
        code: code.to_string(),
        detail: detail.into(),
    }
}

fn empty_summary(repository: &str, path: &Path, exists: bool) -> RepositorySummary {
    RepositorySummary {
        repository: repository.to_string(),
        file_path: path.display().to_string(),
        exists,
        records: 0,
        sent: 0,
        pending: 0,
    }
}

fn summarize(
    repository: &str,
    path: &Path,
    records: &BTreeMap<String, TrackedRecord>,
) -> RepositorySummary {
    let sent = records.values().filter(|r| r.sent).count();
    RepositorySummary {
        repository: repository.to_string(),
        file_path: path.display().to_string(),
        exists: true,
        records: records.len(),
        sent,
        pending: records.len() - sent,
    }
}

/// Check the invariants every stored row must satisfy.
fn check_record_invariants(
    repository: &str,
    records: &BTreeMap<String, TrackedRecord>,
    issues: &mut Vec<VerificationIssue>,
) {
    for (event_id, record) in records {
        if event_id.trim().is_empty() {
            issues.push(issue(
                repository,
                Severity::Error,
                "empty_event_id",
                format!("{event_id:?}"),
            ));
        }
        if parse_utc_iso(&record.first_seen_at).is_none()
            || parse_utc_iso(&record.updated_at).is_none()
        {
            issues.push(issue(
                repository,
                Severity::Error,
                "invalid_timestamp",
                format!("event_id={event_id}"),
            ));
            continue;
        }
        if let Some(last_sent_at) = &record.last_sent_at {
            if parse_utc_iso(last_sent_at).is_none() {
                issues.push(issue(
                    repository,
                    Severity::Error,
                    "invalid_timestamp",
                    format!("event_id={event_id} key=last_sent_at"),
                ));
                continue;
            }
        }
        if record.sent && record.last_sent_at.is_none() {
            issues.push(issue(
                repository,
                Severity::Error,
                "sent_without_last_sent_at",
                format!("event_id={event_id}"),
            ));
        }
        if record.updated_at < record.first_seen_at {
            issues.push(issue(
                repository,
                Severity::Error,
                "updated_before_first_seen",
                format!("event_id={event_id}"),
            ));
        }
    }
}

fn read_json_backend(path: &Path, strict: bool, issues: &mut Vec<VerificationIssue>) -> BackendReadout {
    const REPO: &str = "json";
    if !path.exists() {
        issues.push(issue(
            REPO,
            if strict { Severity::Error } else { Severity::Warning },
            "file_missing",
            path.display().to_string(),
        ));
        return BackendReadout {
            summary: empty_summary(REPO, path, false),
            records: None,
        };
    }

    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            issues.push(issue(REPO, Severity::Error, "read_failed", e.to_string()));
            return BackendReadout {
                summary: empty_summary(REPO, path, true),
                records: None,
            };
        }
    };

    let raw: serde_json::Value = match serde_json::from_str(&text) {
        Ok(raw) => raw,
        Err(e) => {
            issues.push(issue(REPO, Severity::Error, "invalid_json", e.to_string()));
            return BackendReadout {
                summary: empty_summary(REPO, path, true),
                records: None,
            };
        }
    };

    let Some(events) = raw.get("sent_messages").and_then(|v| v.as_object()) else {
        issues.push(issue(
            REPO,
            Severity::Error,
            "invalid_document_shape",
            "top-level 'sent_messages' object missing",
        ));
        return BackendReadout {
            summary: empty_summary(REPO, path, true),
            records: None,
        };
    };

    let mut records = BTreeMap::new();
    for (event_id, value) in events {
        let Some(object) = value.as_object() else {
            issues.push(issue(
                REPO,
                Severity::Error,
                "invalid_record_type",
                format!("event_id={event_id}"),
            ));
            continue;
        };
        let text_field = |key: &str| {
            object
                .get(key)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        records.insert(
            event_id.clone(),
            TrackedRecord {
                event_id: event_id.clone(),
                area_code: text_field("area_code"),
                message: text_field("message"),
                report_url: object
                    .get("report_url")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                sent: object.get("sent").and_then(|v| v.as_bool()).unwrap_or(false),
                first_seen_at: text_field("first_seen_at"),
                updated_at: text_field("updated_at"),
                last_sent_at: object
                    .get("last_sent_at")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
            },
        );
    }

    check_record_invariants(REPO, &records, issues);
    BackendReadout {
        summary: summarize(REPO, path, &records),
        records: Some(records),
    }
}

async fn read_sqlite_backend(
    path: &Path,
    strict: bool,
    issues: &mut Vec<VerificationIssue>,
) -> BackendReadout {
    const REPO: &str = "sqlite";
    if !path.exists() {
        issues.push(issue(
            REPO,
            if strict { Severity::Error } else { Severity::Warning },
            "file_missing",
            path.display().to_string(),
        ));
        return BackendReadout {
            summary: empty_summary(REPO, path, false),
            records: None,
        };
    }

    let store = match SqliteStateStore::open_read_only(path) {
        Ok(store) => store,
        Err(e) => {
            issues.push(issue(REPO, Severity::Error, "open_failed", e.to_string()));
            return BackendReadout {
                summary: empty_summary(REPO, path, true),
                records: None,
            };
        }
    };

    let rows = match store.all_records().await {
        Ok(rows) => rows,
        Err(e) => {
            issues.push(issue(REPO, Severity::Error, "query_failed", e.to_string()));
            return BackendReadout {
                summary: empty_summary(REPO, path, true),
                records: None,
            };
        }
    };

    let records: BTreeMap<String, TrackedRecord> = rows
        .into_iter()
        .map(|record| (record.event_id.clone(), record))
        .collect();

    check_record_invariants(REPO, &records, issues);
    BackendReadout {
        summary: summarize(REPO, path, &records),
        records: Some(records),
    }
}

/// Cross-compare the backends: row counts and per-row dedup state.
fn compare_backends(
    json: &BTreeMap<String, TrackedRecord>,
    sqlite: &BTreeMap<String, TrackedRecord>,
    issues: &mut Vec<VerificationIssue>,
) {
    const REPO: &str = "cross";
    if json.len() != sqlite.len() {
        issues.push(issue(
            REPO,
            Severity::Warning,
            "record_count_mismatch",
            format!("json={} sqlite={}", json.len(), sqlite.len()),
        ));
    }

    for (event_id, json_record) in json {
        let Some(sqlite_record) = sqlite.get(event_id) else {
            issues.push(issue(
                REPO,
                Severity::Warning,
                "missing_in_sqlite",
                format!("event_id={event_id}"),
            ));
            continue;
        };
        if json_record.sent != sqlite_record.sent {
            issues.push(issue(
                REPO,
                Severity::Error,
                "sent_flag_mismatch",
                format!("event_id={event_id}"),
            ));
        }
        if json_record.first_seen_at != sqlite_record.first_seen_at
            || json_record.updated_at != sqlite_record.updated_at
            || json_record.last_sent_at != sqlite_record.last_sent_at
        {
            issues.push(issue(
                REPO,
                Severity::Error,
                "timestamp_mismatch",
                format!("event_id={event_id}"),
            ));
        }
    }
    for event_id in sqlite.keys() {
        if !json.contains_key(event_id) {
            issues.push(issue(
                REPO,
                Severity::Warning,
                "missing_in_json",
                format!("event_id={event_id}"),
            ));
        }
    }
}

/// Verify both state artifacts and cross-check them.
pub async fn verify_state_files(
    json_state_file: &Path,
    sqlite_state_file: &Path,
    strict: bool,
) -> Result<VerificationReport> {
    let mut issues = Vec::new();
    let json = read_json_backend(json_state_file, strict, &mut issues);
    let sqlite = read_sqlite_backend(sqlite_state_file, strict, &mut issues).await;

    if let (Some(json_records), Some(sqlite_records)) = (&json.records, &sqlite.records) {
        compare_backends(json_records, sqlite_records, &mut issues);
    }

    Ok(VerificationReport {
        strict,
        summaries: vec![json.summary, sqlite.summary],
        issues,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AlertNotification;
    use crate::storage::{JsonStateStore, SqliteStateStore};
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
    async fn test_matching_backends_pass_strict() {
        let tmp = TempDir::new().unwrap();
        let json_path = tmp.path().join("sent_messages.json");
        let sqlite_path = tmp.path().join("sent_messages.db");

        let json = JsonStateStore::open(&json_path).await.unwrap();
        json.upsert(&[notification("e1")]).await.unwrap();
        let records = json.all_records().await.unwrap();
        drop(json);

        let sqlite = SqliteStateStore::open(&sqlite_path).unwrap();
        sqlite.import_records(&records).unwrap();
        drop(sqlite);

        let report = verify_state_files(&json_path, &sqlite_path, true)
            .await
            .unwrap();
        assert!(report.passed(), "issues: {:?}", report.issues);
        assert_eq!(report.summaries.len(), 2);
        assert_eq!(report.summaries[0].records, 1);
        assert_eq!(report.summaries[1].records, 1);
    }

    #[tokio::test]
    async fn test_missing_file_warns_then_errors_in_strict() {
        let tmp = TempDir::new().unwrap();
        let json_path = tmp.path().join("sent_messages.json");
        let sqlite_path = tmp.path().join("sent_messages.db");

        let relaxed = verify_state_files(&json_path, &sqlite_path, false)
            .await
            .unwrap();
        assert!(relaxed.passed());
        assert_eq!(relaxed.warning_count(), 2);

        let strict = verify_state_files(&json_path, &sqlite_path, true)
            .await
            .unwrap();
        assert!(!strict.passed());
        assert_eq!(strict.error_count(), 2);
    }

    #[tokio::test]
    async fn test_sent_flag_drift_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let json_path = tmp.path().join("sent_messages.json");
        let sqlite_path = tmp.path().join("sent_messages.db");

        let json = JsonStateStore::open(&json_path).await.unwrap();
        json.upsert(&[notification("e1")]).await.unwrap();
        let records = json.all_records().await.unwrap();
        json.mark_sent(&["e1".to_string()]).await.unwrap();
        drop(json);

        // SQLite keeps the pre-send snapshot: sent flags now differ.
        let sqlite = SqliteStateStore::open(&sqlite_path).unwrap();
        sqlite.import_records(&records).unwrap();
        drop(sqlite);

        let report = verify_state_files(&json_path, &sqlite_path, false)
            .await
            .unwrap();
        assert!(!report.passed());
        assert!(report
            .issues
            .iter()
            .any(|i| i.code == "sent_flag_mismatch"));
    }

    #[tokio::test]
    async fn test_corrupt_json_reported_not_reset() {
        let tmp = TempDir::new().unwrap();
        let json_path = tmp.path().join("sent_messages.json");
        let sqlite_path = tmp.path().join("sent_messages.db");
        std::fs::write(&json_path, "{nope").unwrap();
        drop(SqliteStateStore::open(&sqlite_path).unwrap());

        let report = verify_state_files(&json_path, &sqlite_path, false)
            .await
            .unwrap();
        assert!(!report.passed());
        assert!(report.issues.iter().any(|i| i.code == "invalid_json"));
        // Verification must not move the artifact aside.
        assert!(json_path.exists());
        assert_eq!(std::fs::read_to_string(&json_path).unwrap(), "{nope");
    }
}
