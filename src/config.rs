// src/config.rs

//! Service configuration.
//!
//! Loaded once from a TOML file at startup and never mutated afterwards.
//! Secrets and run modes can be overridden from the environment
//! (`SERVICE_API_KEY`, `SERVICE_HOOK_URL`, `DRY_RUN`, `RUN_ONCE`) so
//! containers do not need credentials baked into the config file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use url::Url;

use crate::error::{AppError, Result};

pub const UNKNOWN_AREA_NAME: &str = "알 수 없는 지역";

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub api: ApiSettings,
    pub webhook: WebhookSettings,
    pub areas: AreaSettings,
    pub cycle: CycleSettings,
    pub cleanup: CleanupSettings,
    pub state: StateSettings,
    pub health: HealthSettings,
    pub runtime: RuntimeSettings,
}

/// Upstream warning API.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApiSettings {
    pub url: String,
    /// Hosts the API URL is allowed to point at.
    pub allowed_hosts: Vec<String>,
    /// Raw (un-encoded) service key; keys containing `%` are rejected
    /// because double-encoding breaks authentication silently.
    pub service_key: String,
    pub warning_type: Option<String>,
    pub station_id: Option<String>,
    pub page_size: u32,
    pub connect_timeout_sec: u64,
    pub read_timeout_sec: u64,
    pub max_retries: u32,
    pub retry_delay_sec: u64,
    /// Soft request rate across all fetch workers; 0 disables pacing.
    pub rate_limit_per_sec: f64,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            url: "http://apis.data.go.kr/1360000/WthrWrnInfoService/getPwnCd".into(),
            allowed_hosts: vec!["apis.data.go.kr".into()],
            service_key: String::new(),
            warning_type: None,
            station_id: None,
            page_size: 100,
            connect_timeout_sec: 5,
            read_timeout_sec: 5,
            max_retries: 3,
            retry_delay_sec: 5,
            rate_limit_per_sec: 0.0,
        }
    }
}

/// Outbound webhook.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WebhookSettings {
    pub url: String,
    pub bot_name: String,
    pub connect_timeout_sec: u64,
    pub read_timeout_sec: u64,
    pub max_retries: u32,
    pub retry_delay_sec: u64,
    /// Global send rate; 0 disables pacing.
    pub rate_limit_per_sec: f64,
    /// Per-cycle send attempt budget; 0 disables backpressure.
    pub max_attempts_per_cycle: usize,
    pub circuit_breaker_enabled: bool,
    pub circuit_failure_threshold: u32,
    pub circuit_reset_sec: u64,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            bot_name: "기상특보알림".into(),
            connect_timeout_sec: 5,
            read_timeout_sec: 5,
            max_retries: 3,
            retry_delay_sec: 1,
            rate_limit_per_sec: 0.0,
            max_attempts_per_cycle: 0,
            circuit_breaker_enabled: true,
            circuit_failure_threshold: 5,
            circuit_reset_sec: 60,
        }
    }
}

/// Monitored administrative regions.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AreaSettings {
    pub codes: Vec<String>,
    /// Code → display name. Unmapped codes fall back to the upstream
    /// name, then the raw code.
    pub names: HashMap<String, String>,
}

impl AreaSettings {
    pub fn name_for(&self, code: &str) -> String {
        self.names
            .get(code)
            .cloned()
            .unwrap_or_else(|| UNKNOWN_AREA_NAME.to_string())
    }
}

/// Cycle cadence and fetch parallelism.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CycleSettings {
    pub interval_sec: u64,
    /// Delay between areas in sequential mode; ignored when parallel.
    pub area_interval_sec: u64,
    pub lookback_days: u32,
    pub max_workers: usize,
    /// Fixed UTC offset used for daily boundaries and date windows.
    pub timezone_offset_hours: i32,
}

impl Default for CycleSettings {
    fn default() -> Self {
        Self {
            interval_sec: 60,
            area_interval_sec: 5,
            lookback_days: 0,
            max_workers: 1,
            timezone_offset_hours: 9,
        }
    }
}

/// Daily state cleanup.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CleanupSettings {
    pub enabled: bool,
    pub retention_days: u32,
    /// Keep pending rows by default so retries survive long outages.
    pub include_unsent: bool,
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: 30,
            include_unsent: false,
        }
    }
}

/// State store selection and artifact paths.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StateSettings {
    pub backend: StateBackend,
    pub json_file: PathBuf,
    pub sqlite_file: PathBuf,
    pub health_file: PathBuf,
}

impl Default for StateSettings {
    fn default() -> Self {
        Self {
            backend: StateBackend::Json,
            json_file: PathBuf::from("./data/sent_messages.json"),
            sqlite_file: PathBuf::from("./data/sent_messages.db"),
            health_file: PathBuf::from("./data/health_state.json"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    Json,
    Sqlite,
}

/// Health monitor thresholds and recovery backfill budget.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthSettings {
    pub alert_enabled: bool,
    pub outage_window_sec: u64,
    pub outage_fail_ratio: f64,
    pub outage_min_failed_cycles: usize,
    pub outage_consecutive_failures: usize,
    pub recovery_window_sec: u64,
    pub recovery_max_fail_ratio: f64,
    pub recovery_consecutive_successes: usize,
    pub heartbeat_interval_sec: u64,
    pub backoff_max_sec: u64,
    pub backfill_max_days: u32,
    pub backfill_window_days: u32,
    pub backfill_max_windows_per_cycle: usize,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            alert_enabled: true,
            outage_window_sec: 600,
            outage_fail_ratio: 0.7,
            outage_min_failed_cycles: 6,
            outage_consecutive_failures: 4,
            recovery_window_sec: 900,
            recovery_max_fail_ratio: 0.1,
            recovery_consecutive_successes: 8,
            heartbeat_interval_sec: 3600,
            backoff_max_sec: 900,
            backfill_max_days: 7,
            backfill_window_days: 2,
            backfill_max_windows_per_cycle: 2,
        }
    }
}

/// Process-level run modes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeSettings {
    pub log_level: String,
    pub dry_run: bool,
    pub run_once: bool,
    pub shutdown_grace_sec: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            dry_run: false,
            run_once: false,
            shutdown_grace_sec: 30,
        }
    }
}

impl Settings {
    /// Load from a TOML file, apply environment overrides, and validate.
    ///
    /// A missing file is not an error; defaults plus environment overrides
    /// may still form a valid configuration.
    pub fn load(path: &Path) -> Result<Self> {
        let mut settings = if path.exists() {
            let text = std::fs::read_to_string(path)?;
            toml::from_str(&text)?
        } else {
            Settings::default()
        };
        settings.apply_env_overrides();
        settings.validate()?;
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("SERVICE_API_KEY") {
            if !key.trim().is_empty() {
                self.api.service_key = key.trim().to_string();
            }
        }
        if let Ok(url) = std::env::var("SERVICE_HOOK_URL") {
            if !url.trim().is_empty() {
                self.webhook.url = url.trim().to_string();
            }
        }
        if let Some(flag) = env_bool("DRY_RUN") {
            self.runtime.dry_run = flag;
        }
        if let Some(flag) = env_bool("RUN_ONCE") {
            self.runtime.run_once = flag;
        }
    }

    /// Validate everything that would otherwise fail mid-cycle.
    pub fn validate(&self) -> Result<()> {
        if self.api.service_key.is_empty() {
            return Err(AppError::config("api.service_key is required"));
        }
        if self.api.service_key.contains('%') {
            return Err(AppError::config(
                "api.service_key looks URL-encoded ('%' present); supply the raw key",
            ));
        }
        if self.webhook.url.is_empty() {
            return Err(AppError::config("webhook.url is required"));
        }

        let hook = Url::parse(&self.webhook.url)
            .map_err(|e| AppError::config(format!("webhook.url is invalid: {e}")))?;
        if hook.scheme() != "https" {
            return Err(AppError::config("webhook.url must use https"));
        }

        let api = Url::parse(&self.api.url)
            .map_err(|e| AppError::config(format!("api.url is invalid: {e}")))?;
        if !matches!(api.scheme(), "http" | "https") {
            return Err(AppError::config("api.url must use http or https"));
        }
        let host = api.host_str().unwrap_or_default();
        if !self.allowed_host(host) {
            return Err(AppError::config(format!(
                "api.url host '{host}' is not in api.allowed_hosts"
            )));
        }

        if self.areas.codes.is_empty() {
            return Err(AppError::config(
                "areas.codes must include at least one area code",
            ));
        }
        if self.api.page_size == 0 {
            return Err(AppError::config("api.page_size must be >= 1"));
        }
        if self.api.max_retries == 0 || self.webhook.max_retries == 0 {
            return Err(AppError::config("max_retries must be >= 1"));
        }
        if !(0.0..=1.0).contains(&self.health.outage_fail_ratio)
            || !(0.0..=1.0).contains(&self.health.recovery_max_fail_ratio)
        {
            return Err(AppError::config(
                "health fail ratios must be within 0.0..=1.0",
            ));
        }
        Ok(())
    }

    fn allowed_host(&self, host: &str) -> bool {
        self.api
            .allowed_hosts
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(host))
    }
}

fn env_bool(name: &str) -> Option<bool> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn valid_settings() -> Settings {
        let mut settings = Settings::default();
        settings.api.service_key = "raw-key".into();
        settings.webhook.url = "https://hook.dooray.com/services/1/2/token".into();
        settings.areas.codes = vec!["L1070000".into()];
        settings
    }

    #[test]
    fn test_valid_settings_pass() {
        assert!(valid_settings().validate().is_ok());
    }

    #[test]
    fn test_missing_service_key_rejected() {
        let mut settings = valid_settings();
        settings.api.service_key.clear();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_encoded_service_key_rejected() {
        let mut settings = valid_settings();
        settings.api.service_key = "abc%3Ddef".into();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("URL-encoded"));
    }

    #[test]
    fn test_plain_http_webhook_rejected() {
        let mut settings = valid_settings();
        settings.webhook.url = "http://hook.dooray.com/services/1/2/token".into();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_api_host_must_be_allowlisted() {
        let mut settings = valid_settings();
        settings.api.url = "http://evil.example.com/getPwnCd".into();
        assert!(settings.validate().is_err());

        settings.api.allowed_hosts.push("evil.example.com".into());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_empty_area_codes_rejected() {
        let mut settings = valid_settings();
        settings.areas.codes.clear();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_toml_parsing_with_partial_sections() {
        let text = r#"
            [api]
            service_key = "raw-key"
            rate_limit_per_sec = 2.5

            [webhook]
            url = "https://hook.dooray.com/services/1/2/token"

            [areas]
            codes = ["L1070000", "L1080000"]

            [areas.names]
            L1070000 = "경기도"
        "#;
        let settings: Settings = toml::from_str(text).unwrap();
        assert_eq!(settings.api.rate_limit_per_sec, 2.5);
        assert_eq!(settings.cycle.interval_sec, 60);
        assert_eq!(settings.areas.name_for("L1070000"), "경기도");
        assert_eq!(settings.areas.name_for("L9999999"), UNKNOWN_AREA_NAME);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let text = r#"
            [api]
            servicekey = "typo"
        "#;
        assert!(toml::from_str::<Settings>(text).is_err());
    }

    #[test]
    fn test_cleanup_defaults_preserve_unsent() {
        assert!(!CleanupSettings::default().include_unsent);
    }
}
