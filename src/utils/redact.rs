// src/utils/redact.rs

//! Masking of credentials in error strings before they reach logs or
//! outbound events.
//!
//! Everything that can carry an upstream error message through a log line
//! must pass it through [`Redactor::redact`] first. The masked values are
//! the raw service API key (which appears inside request URLs echoed by
//! reqwest errors), the webhook token path, and generic `key=`/`token=`
//! style query parameters.

use regex::Regex;
use url::Url;

const MASK: &str = "***";

/// Redacts known-sensitive substrings from arbitrary text.
pub struct Redactor {
    service_key: Option<String>,
    hook_token_path: Option<String>,
    query_secret: Regex,
}

impl Redactor {
    /// Build a redactor from the configured secrets.
    ///
    /// The webhook token is the URL path after the host; Dooray hook URLs
    /// embed the credential there rather than in a header.
    pub fn new(service_key: &str, hook_url: &str) -> Self {
        let hook_token_path = Url::parse(hook_url)
            .ok()
            .map(|url| url.path().to_string())
            .filter(|path| path.len() > 1);

        Self {
            service_key: (!service_key.is_empty()).then(|| service_key.to_string()),
            hook_token_path,
            query_secret: Regex::new(
                r#"(?i)(serviceKey|api[_-]?key|token|secret|password)=([^&\s"']+)"#,
            )
            .expect("static regex"),
        }
    }

    /// A redactor that only masks generic secret-shaped query parameters.
    pub fn passthrough() -> Self {
        Self::new("", "")
    }

    /// Return `text` with every known credential replaced by `***`.
    pub fn redact(&self, text: &str) -> String {
        let mut out = self
            .query_secret
            .replace_all(text, format!("${{1}}={MASK}"))
            .into_owned();
        if let Some(key) = &self.service_key {
            out = out.replace(key, MASK);
        }
        if let Some(path) = &self.hook_token_path {
            out = out.replace(path, &format!("/{MASK}"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn redactor() -> Redactor {
        Redactor::new(
            "rawApiKey==12345",
            "https://hook.dooray.com/services/111/222/secrettoken",
        )
    }

    #[test]
    fn test_masks_raw_api_key() {
        let out = redactor().redact("request failed for key rawApiKey==12345 at host");
        assert!(!out.contains("rawApiKey==12345"));
        assert!(out.contains("***"));
    }

    #[test]
    fn test_masks_service_key_query_param() {
        let out = redactor()
            .redact("GET http://apis.example/getPwnCd?serviceKey=abc123&pageNo=1 timed out");
        assert!(!out.contains("abc123"));
        assert!(out.contains("serviceKey=***"));
        assert!(out.contains("pageNo=1"));
    }

    #[test]
    fn test_masks_hook_token_path() {
        let out = redactor()
            .redact("POST https://hook.dooray.com/services/111/222/secrettoken returned 500");
        assert!(!out.contains("secrettoken"));
        assert!(out.contains("hook.dooray.com"));
    }

    #[test]
    fn test_masks_generic_secret_params() {
        let out = Redactor::passthrough().redact("connect error: token=deadbeef&user=bob");
        assert_eq!(out, "connect error: token=***&user=bob");
    }

    #[test]
    fn test_plain_text_unchanged() {
        let text = "HTTP 503 from upstream";
        assert_eq!(redactor().redact(text), text);
    }
}
