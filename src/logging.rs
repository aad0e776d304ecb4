// src/logging.rs

//! Tracing initialization and structured event rendering.

use serde_json::{Map, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level so operators can
/// raise verbosity without touching the config file.
pub fn init(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level.to_lowercase()));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

/// Render a structured event as a single JSON line.
///
/// The `event` field is mandatory and always present; `fields` must be a
/// JSON object. serde_json's default map keeps keys sorted, so output is
/// deterministic for log-diffing and contract tests.
pub fn log_event(event: &str, fields: Value) -> String {
    let mut payload = Map::new();
    payload.insert("event".to_string(), Value::String(event.to_string()));
    if let Value::Object(map) = fields {
        for (key, value) in map {
            payload.insert(key, value);
        }
    }
    Value::Object(payload).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_log_event_includes_event_field() {
        let line = log_event("cycle.start", json!({"area_count": 3}));
        let parsed: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["event"], "cycle.start");
        assert_eq!(parsed["area_count"], 3);
    }

    #[test]
    fn test_log_event_without_fields() {
        let line = log_event("shutdown.interrupt", json!({}));
        assert_eq!(line, r#"{"event":"shutdown.interrupt"}"#);
    }

    #[test]
    fn test_log_event_keys_are_sorted() {
        let line = log_event("cycle.complete", json!({"zeta": 1, "alpha": 2}));
        let alpha = line.find("alpha").unwrap();
        let zeta = line.find("zeta").unwrap();
        assert!(alpha < zeta);
    }
}
