// src/main.rs

//! warnbridge CLI entry point.
//!
//! Default command runs the service loop; the state maintenance commands
//! (`cleanup-state`, `migrate-state`, `verify-state`) are one-shot and
//! exit with 0 on success, 1 on runtime failure, 2 on invalid
//! configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use warnbridge::config::{Settings, StateBackend};
use warnbridge::error::{AppError, Result};
use warnbridge::events;
use warnbridge::logging::{self, log_event};
use warnbridge::models::HealthPolicy;
use warnbridge::pipeline::{run_loop, CycleRunner, ServiceRuntime};
use warnbridge::services::notifier::HttpWebhookTransport;
use warnbridge::services::{HealthMonitor, Notifier, WeatherApi};
use warnbridge::storage::migrate::migrate_json_to_sqlite;
use warnbridge::storage::verify::verify_state_files;
use warnbridge::storage::{JsonHealthStore, JsonStateStore, SqliteStateStore, StateStore};
use warnbridge::utils::{RateLimiter, Redactor};

const EXIT_OK: i32 = 0;
const EXIT_RUNTIME_FAILURE: i32 = 1;
const EXIT_INVALID_CONFIG: i32 = 2;

#[derive(Parser, Debug)]
#[command(name = "warnbridge", version, about = "Weather special-report alert bridge")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the alert bridge service loop (default)
    Run,
    /// Delete stale entries from the state store
    CleanupState {
        /// Delete entries older than this many days
        #[arg(long, default_value_t = 30)]
        days: u32,
        /// Include unsent entries in cleanup
        #[arg(long)]
        include_unsent: bool,
        /// Preview the removal count without persisting
        #[arg(long)]
        dry_run: bool,
        /// Override the configured state backend
        #[arg(long = "state-repository-type", value_enum)]
        state_backend: Option<StateBackend>,
    },
    /// Migrate JSON state records into the SQLite state DB
    MigrateState {
        /// Source JSON state file (defaults to the configured path)
        #[arg(long)]
        json_state_file: Option<PathBuf>,
        /// Target SQLite state file (defaults to the configured path)
        #[arg(long)]
        sqlite_state_file: Option<PathBuf>,
    },
    /// Verify JSON/SQLite state repository integrity
    VerifyState {
        /// Treat warnings (missing files, count drift) as errors
        #[arg(long)]
        strict: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let settings = match Settings::load(&cli.config) {
        Ok(settings) => Arc::new(settings),
        Err(config_error) => {
            logging::init("info");
            error!(
                "{}",
                log_event(
                    events::STARTUP_INVALID_CONFIG,
                    json!({"error": config_error.to_string()}),
                )
            );
            std::process::exit(EXIT_INVALID_CONFIG);
        }
    };
    logging::init(&settings.runtime.log_level);

    let runtime = tokio::runtime::Runtime::new().expect("failed to start tokio runtime");
    let code = runtime.block_on(async {
        match cli.command.unwrap_or(Command::Run) {
            Command::Run => run_service(settings).await,
            Command::CleanupState {
                days,
                include_unsent,
                dry_run,
                state_backend,
            } => cleanup_state(&settings, days, include_unsent, dry_run, state_backend).await,
            Command::MigrateState {
                json_state_file,
                sqlite_state_file,
            } => {
                migrate_state(
                    json_state_file.unwrap_or_else(|| settings.state.json_file.clone()),
                    sqlite_state_file.unwrap_or_else(|| settings.state.sqlite_file.clone()),
                )
                .await
            }
            Command::VerifyState { strict } => verify_state(&settings, strict).await,
        }
    });
    std::process::exit(code);
}

async fn build_state_store(settings: &Settings) -> Result<Arc<dyn StateStore>> {
    match settings.state.backend {
        StateBackend::Json => Ok(Arc::new(
            JsonStateStore::open(&settings.state.json_file).await?,
        )),
        StateBackend::Sqlite => Ok(Arc::new(SqliteStateStore::open(
            &settings.state.sqlite_file,
        )?)),
    }
}

async fn run_service(settings: Arc<Settings>) -> i32 {
    let cancel = CancellationToken::new();
    install_signal_handlers(cancel.clone());

    let redactor = Arc::new(Redactor::new(
        &settings.api.service_key,
        &settings.webhook.url,
    ));

    let runtime = match build_runtime(&settings, &cancel, &redactor).await {
        Ok(runtime) => runtime,
        Err(build_error) => {
            error!(
                "{}",
                log_event(
                    events::SHUTDOWN_UNEXPECTED_ERROR,
                    json!({"error": redactor.redact(&build_error.to_string())}),
                )
            );
            return EXIT_RUNTIME_FAILURE;
        }
    };

    info!(
        "{}",
        log_event(
            events::STARTUP_READY,
            json!({
                "state_backend": format!("{:?}", settings.state.backend).to_lowercase(),
                "state_file": settings.state.json_file.display().to_string(),
                "sqlite_state_file": settings.state.sqlite_file.display().to_string(),
                "health_state_file": settings.state.health_file.display().to_string(),
                "area_count": settings.areas.codes.len(),
                "max_workers": settings.cycle.max_workers,
                "lookback_days": settings.cycle.lookback_days,
                "dry_run": settings.runtime.dry_run,
                "run_once": settings.runtime.run_once,
                "health_alert_enabled": settings.health.alert_enabled,
                "backfill_max_days": settings.health.backfill_max_days,
                "cleanup_enabled": settings.cleanup.enabled,
                "cleanup_retention_days": settings.cleanup.retention_days,
                "cleanup_include_unsent": settings.cleanup.include_unsent,
            }),
        )
    );

    // Race the loop against shutdown: after cancellation the loop gets
    // the grace period to finish its cycle, then shutdown is forced.
    let grace = Duration::from_secs(settings.runtime.shutdown_grace_sec.max(1));
    let mut loop_task = tokio::spawn(run_loop(runtime));
    tokio::select! {
        finished = &mut loop_task => finished.unwrap_or(EXIT_RUNTIME_FAILURE),
        _ = cancel.cancelled() => {
            match tokio::time::timeout(grace, &mut loop_task).await {
                Ok(finished) => finished.unwrap_or(EXIT_RUNTIME_FAILURE),
                Err(_) => {
                    error!(
                        "{}",
                        log_event(
                            events::SHUTDOWN_FORCED,
                            json!({"grace_sec": grace.as_secs()}),
                        )
                    );
                    loop_task.abort();
                    EXIT_OK
                }
            }
        }
    }
}

async fn build_runtime(
    settings: &Arc<Settings>,
    cancel: &CancellationToken,
    redactor: &Arc<Redactor>,
) -> Result<ServiceRuntime> {
    let store = build_state_store(settings).await?;

    let api_limiter = Arc::new(RateLimiter::new(settings.api.rate_limit_per_sec));
    let source = Arc::new(WeatherApi::new(
        Arc::clone(settings),
        api_limiter,
        Arc::clone(redactor),
        cancel.clone(),
    )?);

    let webhook_limiter = Arc::new(RateLimiter::new(settings.webhook.rate_limit_per_sec));
    let notifier = Arc::new(Notifier::new(
        Arc::new(HttpWebhookTransport::new(&settings.webhook)?),
        settings.webhook.clone(),
        webhook_limiter,
        Arc::clone(redactor),
        cancel.clone(),
    ));

    let runner = Arc::new(CycleRunner::new(
        Arc::clone(settings),
        source,
        Arc::clone(&notifier),
        Arc::clone(&store),
        Arc::clone(redactor),
        cancel.clone(),
    ));

    let health_store = JsonHealthStore::new(&settings.state.health_file);
    let health_state = health_store.load().await?;
    let monitor = HealthMonitor::new(
        HealthPolicy {
            outage_window_sec: settings.health.outage_window_sec,
            outage_fail_ratio: settings.health.outage_fail_ratio,
            outage_min_failed_cycles: settings.health.outage_min_failed_cycles,
            outage_consecutive_failures: settings.health.outage_consecutive_failures,
            recovery_window_sec: settings.health.recovery_window_sec,
            recovery_max_fail_ratio: settings.health.recovery_max_fail_ratio,
            recovery_consecutive_successes: settings.health.recovery_consecutive_successes,
            heartbeat_interval_sec: settings.health.heartbeat_interval_sec,
            backoff_max_sec: settings.health.backoff_max_sec,
        },
        health_state,
    );

    Ok(ServiceRuntime {
        settings: Arc::clone(settings),
        store,
        notifier,
        runner,
        monitor,
        health_store,
        redactor: Arc::clone(redactor),
        cancel: cancel.clone(),
    })
}

/// SIGINT/SIGTERM set the cancellation token; every suspension point in
/// the pipeline observes it cooperatively.
fn install_signal_handlers(cancel: CancellationToken) {
    tokio::spawn(async move {
        let terminate = async {
            #[cfg(unix)]
            {
                let mut sigterm =
                    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                        .expect("failed to install SIGTERM handler");
                sigterm.recv().await;
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate => {}
        }
        info!("{}", log_event(events::SHUTDOWN_INTERRUPT, json!({})));
        cancel.cancel();
    });
}

async fn cleanup_state(
    settings: &Settings,
    days: u32,
    include_unsent: bool,
    dry_run: bool,
    state_backend: Option<StateBackend>,
) -> i32 {
    let backend = state_backend.unwrap_or(settings.state.backend);
    let state_file = match backend {
        StateBackend::Json => settings.state.json_file.display().to_string(),
        StateBackend::Sqlite => settings.state.sqlite_file.display().to_string(),
    };

    let outcome = async {
        let store: Arc<dyn StateStore> = match backend {
            StateBackend::Json => Arc::new(JsonStateStore::open(&settings.state.json_file).await?),
            StateBackend::Sqlite => {
                Arc::new(SqliteStateStore::open(&settings.state.sqlite_file)?)
            }
        };
        let removed = store
            .cleanup_stale(days, include_unsent, dry_run, Utc::now())
            .await?;
        Ok::<_, AppError>((removed, store.total_count().await?, store.pending_count().await?))
    }
    .await;

    match outcome {
        Ok((removed, total, pending)) => {
            info!(
                "{}",
                log_event(
                    events::STATE_CLEANUP_COMPLETE,
                    json!({
                        "state_file": state_file,
                        "days": days,
                        "include_unsent": include_unsent,
                        "dry_run": dry_run,
                        "removed": removed,
                        "total": total,
                        "pending": pending,
                    }),
                )
            );
            EXIT_OK
        }
        Err(cleanup_error) => {
            error!(
                "{}",
                log_event(
                    events::STATE_CLEANUP_FAILED,
                    json!({
                        "state_file": state_file,
                        "days": days,
                        "include_unsent": include_unsent,
                        "dry_run": dry_run,
                        "error": cleanup_error.to_string(),
                    }),
                )
            );
            EXIT_RUNTIME_FAILURE
        }
    }
}

async fn migrate_state(json_state_file: PathBuf, sqlite_state_file: PathBuf) -> i32 {
    match migrate_json_to_sqlite(&json_state_file, &sqlite_state_file).await {
        Ok(result) => {
            info!(
                "{}",
                log_event(
                    events::STATE_MIGRATION_COMPLETE,
                    json!({
                        "json_state_file": json_state_file.display().to_string(),
                        "sqlite_state_file": sqlite_state_file.display().to_string(),
                        "total_records": result.total_records,
                        "inserted_records": result.inserted_records,
                        "sent_records": result.sent_records,
                    }),
                )
            );
            EXIT_OK
        }
        Err(migration_error) => {
            error!(
                "{}",
                log_event(
                    events::STATE_MIGRATION_FAILED,
                    json!({
                        "json_state_file": json_state_file.display().to_string(),
                        "sqlite_state_file": sqlite_state_file.display().to_string(),
                        "error": migration_error.to_string(),
                    }),
                )
            );
            EXIT_RUNTIME_FAILURE
        }
    }
}

async fn verify_state(settings: &Settings, strict: bool) -> i32 {
    let report = match verify_state_files(
        &settings.state.json_file,
        &settings.state.sqlite_file,
        strict,
    )
    .await
    {
        Ok(report) => report,
        Err(verify_error) => {
            error!(
                "{}",
                log_event(
                    events::STATE_VERIFY_FAILED,
                    json!({"strict": strict, "error": verify_error.to_string()}),
                )
            );
            return EXIT_RUNTIME_FAILURE;
        }
    };

    let payload = json!({
        "strict": strict,
        "passed": report.passed(),
        "error_count": report.error_count(),
        "warning_count": report.warning_count(),
        "summaries": serde_json::to_value(&report.summaries).unwrap_or_default(),
        "issues": serde_json::to_value(&report.issues).unwrap_or_default(),
    });
    if report.passed() {
        info!("{}", log_event(events::STATE_VERIFY_COMPLETE, payload));
        EXIT_OK
    } else {
        error!("{}", log_event(events::STATE_VERIFY_FAILED, payload));
        EXIT_RUNTIME_FAILURE
    }
}
