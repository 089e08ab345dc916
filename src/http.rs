//! Shared blocking HTTP client construction.

use std::time::Duration;

/// User-Agent sent with every request. Nominatim's usage policy rejects
/// anonymous clients.
pub const USER_AGENT: &str = concat!(
    "photo-manifest/",
    env!("CARGO_PKG_VERSION"),
    " (+https://github.com/photo-manifest/photo-manifest)"
);

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Build a blocking client with the crate's User-Agent and a request timeout.
pub fn client(timeout: Duration) -> Result<reqwest::blocking::Client, reqwest::Error> {
    reqwest::blocking::Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
}

/// Whether an HTTP status is worth retrying (rate limits and server errors).
pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}
