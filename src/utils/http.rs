// src/utils/http.rs

//! HTTP client construction.

use std::time::Duration;

use crate::error::Result;

const USER_AGENT: &str = concat!("warnbridge/", env!("CARGO_PKG_VERSION"));

/// Create a client with separate connect and total-request timeouts.
///
/// Each parallel fetch worker gets its own client so workers never share
/// connection-pool state; the webhook sender keeps a single long-lived
/// client.
pub fn create_client(connect_timeout_sec: u64, read_timeout_sec: u64) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(Duration::from_secs(connect_timeout_sec))
        .timeout(Duration::from_secs(connect_timeout_sec + read_timeout_sec))
        .build()?;
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_client() {
        assert!(create_client(5, 5).is_ok());
    }
}
