// src/utils/mod.rs

//! Shared utilities (HTTP clients, pacing, redaction, time handling).

pub mod http;
pub mod rate_limit;
pub mod redact;
pub mod time;

pub use rate_limit::RateLimiter;
pub use redact::Redactor;
