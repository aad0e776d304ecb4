// src/storage/health.rs

//! Durable persistence for the health monitor.
//!
//! Same artifact discipline as the JSON state store: atomic tmp+rename
//! writes, corrupted files moved aside as `.broken-*` siblings, and a
//! fresh default state on any read failure. The monitor itself never
//! touches disk; the service loop saves through this store after each
//! mutation.

use std::path::{Path, PathBuf};

use serde_json::json;
use tokio::io::AsyncWriteExt;
use tracing::error;

use crate::error::Result;
use crate::events;
use crate::logging::log_event;
use crate::models::HealthState;
use crate::storage::json::backup_corrupted_file;

/// JSON-file store for [`HealthState`].
pub struct JsonHealthStore {
    path: PathBuf,
}

impl JsonHealthStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted state, falling back to defaults on any failure.
    pub async fn load(&self) -> Result<HealthState> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(HealthState::default());
            }
            Err(e) => {
                error!(
                    "{}",
                    log_event(
                        events::HEALTH_STATE_READ_FAILED,
                        json!({"file": self.path.display().to_string(), "error": e.to_string()}),
                    )
                );
                return Ok(HealthState::default());
            }
        };

        match serde_json::from_slice::<HealthState>(&bytes) {
            Ok(state) => Ok(state),
            Err(parse_error) => {
                let backup =
                    backup_corrupted_file(&self.path, events::HEALTH_STATE_BACKUP_FAILED).await;
                error!(
                    "{}",
                    log_event(
                        events::HEALTH_STATE_INVALID_JSON,
                        json!({
                            "file": self.path.display().to_string(),
                            "backup": backup,
                            "error": parse_error.to_string(),
                        }),
                    )
                );
                Ok(HealthState::default())
            }
        }
    }

    /// Persist the state atomically.
    pub async fn save(&self, state: &HealthState) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(state)?;

        let write = async {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let tmp = self.path.with_extension("tmp");
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(&bytes).await?;
            file.flush().await?;
            drop(file);
            tokio::fs::rename(&tmp, &self.path).await?;
            Ok(())
        };

        if let Err(e) = write.await {
            let e: crate::error::AppError = e;
            error!(
                "{}",
                log_event(
                    events::HEALTH_STATE_PERSIST_FAILED,
                    json!({"file": self.path.display().to_string(), "error": e.to_string()}),
                )
            );
            return Err(e);
        }
        Ok(())
    }
}
