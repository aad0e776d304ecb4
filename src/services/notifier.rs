// src/services/notifier.rs

//! Webhook sender: retries, global send pacing, and a circuit breaker.
//!
//! All sends, warning notifications and health notifications alike,
//! funnel through one `Notifier` so the global rate limit and circuit
//! state apply uniformly. The circuit mutex guards counters only; it is
//! never held across network I/O or sleeps.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::WebhookSettings;
use crate::error::{AppError, Result};
use crate::events;
use crate::logging::log_event;
use crate::utils::http::create_client;
use crate::utils::{RateLimiter, Redactor};

/// Result of a successful delivery.
#[derive(Debug, Clone, Copy)]
pub struct SendReport {
    /// HTTP attempts performed, including the successful one.
    pub attempts: u32,
}

/// Raw webhook response; the notifier owns success judgment.
#[derive(Debug, Clone)]
pub struct WebhookResponse {
    pub status: u16,
    pub body: String,
}

/// Transport seam so delivery policy is testable without a network.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn post(&self, payload: &serde_json::Value) -> Result<WebhookResponse>;
}

/// reqwest-backed production transport.
pub struct HttpWebhookTransport {
    client: reqwest::Client,
    hook_url: String,
}

impl HttpWebhookTransport {
    pub fn new(settings: &WebhookSettings) -> Result<Self> {
        Ok(Self {
            client: create_client(settings.connect_timeout_sec, settings.read_timeout_sec)?,
            hook_url: settings.url.clone(),
        })
    }
}

#[async_trait]
impl WebhookTransport for HttpWebhookTransport {
    async fn post(&self, payload: &serde_json::Value) -> Result<WebhookResponse> {
        let response = self.client.post(&self.hook_url).json(payload).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Ok(WebhookResponse { status, body })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitPhase {
    Closed,
    Open,
    HalfOpen,
}

struct CircuitState {
    phase: CircuitPhase,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

enum Judgment {
    Success,
    Retriable(String),
    Fatal(String),
}

/// Dooray-style webhook sender.
pub struct Notifier {
    transport: Arc<dyn WebhookTransport>,
    settings: WebhookSettings,
    limiter: Arc<RateLimiter>,
    redactor: Arc<Redactor>,
    cancel: CancellationToken,
    circuit: Mutex<CircuitState>,
}

impl Notifier {
    pub fn new(
        transport: Arc<dyn WebhookTransport>,
        settings: WebhookSettings,
        limiter: Arc<RateLimiter>,
        redactor: Arc<Redactor>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            settings,
            limiter,
            redactor,
            cancel,
            circuit: Mutex::new(CircuitState {
                phase: CircuitPhase::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    /// Deliver one message; `report_url` becomes a link attachment.
    ///
    /// Returns `AppError::CircuitOpen` without network I/O while the
    /// circuit is open, or `AppError::Notification` once every attempt is
    /// exhausted. Error strings are redacted before they leave this
    /// module.
    pub async fn send(&self, message: &str, report_url: Option<&str>) -> Result<SendReport> {
        self.check_circuit()?;

        let mut payload = json!({
            "botName": self.settings.bot_name,
            "text": message,
        });
        if let Some(url) = report_url {
            payload["attachments"] = json!([{
                "title": "> 해당 특보 통보문 바로가기",
                "titleLink": url,
                "color": "blue",
            }]);
        }

        let max_retries = self.settings.max_retries;
        let mut backoff_sec = self.settings.retry_delay_sec;
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=max_retries {
            if !self.limiter.acquire(&self.cancel).await {
                return Err(AppError::Cancelled);
            }

            match self.attempt(&payload).await {
                Judgment::Success => {
                    self.record_success();
                    return Ok(SendReport { attempts: attempt });
                }
                Judgment::Fatal(error) => {
                    self.record_failure();
                    return Err(AppError::Notification {
                        attempts: attempt,
                        message: self.redactor.redact(&error),
                    });
                }
                Judgment::Retriable(error) => {
                    let redacted = self.redactor.redact(&error);
                    if attempt == max_retries {
                        self.record_failure();
                        return Err(AppError::Notification {
                            attempts: attempt,
                            message: redacted,
                        });
                    }
                    warn!(
                        "{}",
                        log_event(
                            events::NOTIFICATION_RETRY,
                            json!({
                                "attempt": attempt,
                                "max_retries": max_retries,
                                "backoff_sec": backoff_sec,
                                "error": redacted,
                            }),
                        )
                    );
                    last_error = redacted;
                }
            }

            // retry_delay_sec = 0 intentionally yields zero-delay retries.
            if backoff_sec > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(backoff_sec)) => {}
                    _ = self.cancel.cancelled() => return Err(AppError::Cancelled),
                }
            }
            backoff_sec = backoff_sec.saturating_mul(2);
        }

        self.record_failure();
        Err(AppError::Notification {
            attempts: max_retries,
            message: last_error,
        })
    }

    async fn attempt(&self, payload: &serde_json::Value) -> Judgment {
        let response = match self.transport.post(payload).await {
            Ok(response) => response,
            Err(AppError::Http(error)) => {
                let text = format!("webhook request failed: {error}");
                return if error.is_timeout() || error.is_connect() || error.is_request() {
                    Judgment::Retriable(text)
                } else {
                    Judgment::Fatal(text)
                };
            }
            Err(other) => return Judgment::Retriable(format!("webhook transport error: {other}")),
        };

        match response.status {
            200..=299 => {
                // An explicit isSuccessful=false in a well-formed body is
                // a business failure; an unparseable body with 2xx stays
                // a success to avoid duplicate re-sends.
                if let Ok(body) = serde_json::from_str::<serde_json::Value>(&response.body) {
                    if body.get("isSuccessful").and_then(|v| v.as_bool()) == Some(false) {
                        let reason = body
                            .get("resultMessage")
                            .and_then(|v| v.as_str())
                            .unwrap_or("isSuccessful=false");
                        return Judgment::Fatal(format!("webhook business failure: {reason}"));
                    }
                }
                Judgment::Success
            }
            400..=499 => Judgment::Fatal(format!(
                "webhook rejected request: HTTP {}",
                response.status
            )),
            status => Judgment::Retriable(format!("webhook server error: HTTP {status}")),
        }
    }

    fn check_circuit(&self) -> Result<()> {
        if !self.settings.circuit_breaker_enabled {
            return Ok(());
        }
        let mut circuit = self.lock_circuit();
        match circuit.phase {
            CircuitPhase::Closed | CircuitPhase::HalfOpen => Ok(()),
            CircuitPhase::Open => {
                let elapsed = circuit
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or_default();
                if elapsed >= Duration::from_secs(self.settings.circuit_reset_sec) {
                    circuit.phase = CircuitPhase::HalfOpen;
                    return Ok(());
                }
                info!(
                    "{}",
                    log_event(
                        events::NOTIFICATION_CIRCUIT_BLOCKED,
                        json!({
                            "consecutive_failures": circuit.consecutive_failures,
                            "reset_sec": self.settings.circuit_reset_sec,
                        }),
                    )
                );
                Err(AppError::CircuitOpen)
            }
        }
    }

    fn record_success(&self) {
        if !self.settings.circuit_breaker_enabled {
            return;
        }
        let mut circuit = self.lock_circuit();
        if circuit.phase != CircuitPhase::Closed {
            info!(
                "{}",
                log_event(
                    events::NOTIFICATION_CIRCUIT_CLOSED,
                    json!({"recovered_from_failures": circuit.consecutive_failures}),
                )
            );
        }
        circuit.phase = CircuitPhase::Closed;
        circuit.consecutive_failures = 0;
        circuit.opened_at = None;
    }

    fn record_failure(&self) {
        if !self.settings.circuit_breaker_enabled {
            return;
        }
        let mut circuit = self.lock_circuit();
        circuit.consecutive_failures += 1;
        let threshold = self.settings.circuit_failure_threshold.max(1);
        let should_open = circuit.phase == CircuitPhase::HalfOpen
            || (circuit.phase == CircuitPhase::Closed
                && circuit.consecutive_failures >= threshold);
        if should_open {
            circuit.phase = CircuitPhase::Open;
            circuit.opened_at = Some(Instant::now());
            warn!(
                "{}",
                log_event(
                    events::NOTIFICATION_CIRCUIT_OPENED,
                    json!({
                        "consecutive_failures": circuit.consecutive_failures,
                        "reset_sec": self.settings.circuit_reset_sec,
                    }),
                )
            );
        }
    }

    fn lock_circuit(&self) -> std::sync::MutexGuard<'_, CircuitState> {
        self.circuit
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted transport: pops one canned response per call.
    struct ScriptedTransport {
        responses: Mutex<Vec<Result<WebhookResponse>>>,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(mut responses: Vec<Result<WebhookResponse>>) -> Arc<Self> {
            responses.reverse();
            Arc::new(Self {
                responses: Mutex::new(responses),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl WebhookTransport for ScriptedTransport {
        async fn post(&self, _payload: &serde_json::Value) -> Result<WebhookResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(Ok(WebhookResponse {
                    status: 200,
                    body: String::new(),
                }))
        }
    }

    fn ok() -> Result<WebhookResponse> {
        Ok(WebhookResponse {
            status: 200,
            body: r#"{"isSuccessful": true}"#.into(),
        })
    }

    fn status(code: u16) -> Result<WebhookResponse> {
        Ok(WebhookResponse {
            status: code,
            body: String::new(),
        })
    }

    fn notifier(transport: Arc<ScriptedTransport>, settings: WebhookSettings) -> Notifier {
        Notifier::new(
            transport,
            settings,
            Arc::new(RateLimiter::new(0.0)),
            Arc::new(Redactor::passthrough()),
            CancellationToken::new(),
        )
    }

    fn settings() -> WebhookSettings {
        WebhookSettings {
            url: "https://hook.example.com/services/1/2/tok".into(),
            retry_delay_sec: 0,
            ..WebhookSettings::default()
        }
    }

    #[tokio::test]
    async fn test_send_succeeds_first_try() {
        let transport = ScriptedTransport::new(vec![ok()]);
        let notifier = notifier(Arc::clone(&transport), settings());
        let report = notifier.send("msg", None).await.unwrap();
        assert_eq!(report.attempts, 1);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success() {
        let transport = ScriptedTransport::new(vec![status(500), ok()]);
        let notifier = notifier(Arc::clone(&transport), settings());
        let report = notifier.send("msg", None).await.unwrap();
        assert_eq!(report.attempts, 2);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retry_delay_waits_zero() {
        let transport = ScriptedTransport::new(vec![status(500), status(502), ok()]);
        let notifier = notifier(Arc::clone(&transport), settings());
        let start = Instant::now();
        notifier.send("msg", None).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles() {
        let mut cfg = settings();
        cfg.retry_delay_sec = 1;
        let transport = ScriptedTransport::new(vec![status(500), status(500), ok()]);
        let notifier = notifier(Arc::clone(&transport), cfg);
        let start = Instant::now();
        notifier.send("msg", None).await.unwrap();
        // 1s after attempt 1, 2s after attempt 2.
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_4xx_is_not_retried() {
        let transport = ScriptedTransport::new(vec![status(400)]);
        let notifier = notifier(Arc::clone(&transport), settings());
        let error = notifier.send("msg", None).await.unwrap_err();
        assert!(matches!(error, AppError::Notification { attempts: 1, .. }));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_business_failure_is_fatal() {
        let transport = ScriptedTransport::new(vec![Ok(WebhookResponse {
            status: 200,
            body: r#"{"isSuccessful": false, "resultMessage": "quota"}"#.into(),
        })]);
        let notifier = notifier(Arc::clone(&transport), settings());
        let error = notifier.send("msg", None).await.unwrap_err();
        match error {
            AppError::Notification { attempts, message } => {
                assert_eq!(attempts, 1);
                assert!(message.contains("quota"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unparseable_2xx_body_is_success() {
        let transport = ScriptedTransport::new(vec![Ok(WebhookResponse {
            status: 200,
            body: "<html>ok</html>".into(),
        })]);
        let notifier = notifier(Arc::clone(&transport), settings());
        assert!(notifier.send("msg", None).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fail() {
        let transport = ScriptedTransport::new(vec![status(500), status(500), status(500)]);
        let notifier = notifier(Arc::clone(&transport), settings());
        let error = notifier.send("msg", None).await.unwrap_err();
        assert!(matches!(error, AppError::Notification { attempts: 3, .. }));
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opens_after_threshold() {
        let mut cfg = settings();
        cfg.max_retries = 1;
        cfg.circuit_failure_threshold = 3;
        // 3 final failures open the circuit.
        let transport =
            ScriptedTransport::new(vec![status(500), status(500), status(500), ok()]);
        let notifier = notifier(Arc::clone(&transport), cfg);

        for _ in 0..3 {
            assert!(notifier.send("msg", None).await.is_err());
        }
        assert_eq!(transport.calls(), 3);

        // Blocked sends perform no HTTP.
        for _ in 0..3 {
            let error = notifier.send("msg", None).await.unwrap_err();
            assert!(matches!(error, AppError::CircuitOpen));
        }
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_half_open_closes_on_success() {
        let mut cfg = settings();
        cfg.max_retries = 1;
        cfg.circuit_failure_threshold = 2;
        cfg.circuit_reset_sec = 60;
        let transport = ScriptedTransport::new(vec![status(500), status(500), ok(), ok()]);
        let notifier = notifier(Arc::clone(&transport), cfg);

        assert!(notifier.send("msg", None).await.is_err());
        assert!(notifier.send("msg", None).await.is_err());
        assert!(matches!(
            notifier.send("msg", None).await.unwrap_err(),
            AppError::CircuitOpen
        ));

        tokio::time::sleep(Duration::from_secs(61)).await;

        // Half-open probe succeeds and the circuit closes.
        assert!(notifier.send("msg", None).await.is_ok());
        assert!(notifier.send("msg", None).await.is_ok());
        assert_eq!(transport.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_half_open_reopens_on_failure() {
        let mut cfg = settings();
        cfg.max_retries = 1;
        cfg.circuit_failure_threshold = 2;
        cfg.circuit_reset_sec = 30;
        let transport = ScriptedTransport::new(vec![status(500), status(500), status(500)]);
        let notifier = notifier(Arc::clone(&transport), cfg);

        assert!(notifier.send("msg", None).await.is_err());
        assert!(notifier.send("msg", None).await.is_err());
        tokio::time::sleep(Duration::from_secs(31)).await;

        // Probe fails: straight back to open without a second attempt.
        assert!(matches!(
            notifier.send("msg", None).await.unwrap_err(),
            AppError::Notification { .. }
        ));
        assert!(matches!(
            notifier.send("msg", None).await.unwrap_err(),
            AppError::CircuitOpen
        ));
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn test_disabled_circuit_never_blocks() {
        let mut cfg = settings();
        cfg.max_retries = 1;
        cfg.circuit_breaker_enabled = false;
        cfg.circuit_failure_threshold = 1;
        let transport = ScriptedTransport::new(vec![status(500), status(500), ok()]);
        let notifier = notifier(Arc::clone(&transport), cfg);

        assert!(notifier.send("msg", None).await.is_err());
        assert!(notifier.send("msg", None).await.is_err());
        assert!(notifier.send("msg", None).await.is_ok());
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn test_error_strings_are_redacted() {
        let redactor = Arc::new(Redactor::new(
            "supersecret",
            "https://hook.example.com/services/1/2/tok",
        ));
        let transport = ScriptedTransport::new(vec![Ok(WebhookResponse {
            status: 200,
            body: r#"{"isSuccessful": false, "resultMessage": "bad key supersecret"}"#.into(),
        })]);
        let notifier = Notifier::new(
            transport,
            WebhookSettings {
                url: "https://hook.example.com/services/1/2/tok".into(),
                retry_delay_sec: 0,
                ..WebhookSettings::default()
            },
            Arc::new(RateLimiter::new(0.0)),
            redactor,
            CancellationToken::new(),
        );
        let error = notifier.send("msg", None).await.unwrap_err();
        assert!(!error.to_string().contains("supersecret"));
    }
}
