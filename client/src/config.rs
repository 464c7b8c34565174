//! Configuration management for the client.

use std::env;
use std::time::Duration;

use crate::error::ConfigError;

/// Default timeout for remote store requests.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Client configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Base URL of the REST API
    pub api_url: String,
    /// WebSocket URL of the change feed
    pub feed_url: String,
    /// Per-request timeout for remote store calls
    pub request_timeout: Duration,
}

impl ClientConfig {
    /// Build a configuration for `api_url`, deriving the feed URL from it.
    pub fn new(api_url: impl Into<String>) -> Self {
        let api_url = api_url.into().trim_end_matches('/').to_string();
        Self {
            feed_url: derive_feed_url(&api_url),
            api_url,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
        }
    }

    /// Load configuration from environment variables (and a `.env` file if present).
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let api_url = env::var("REBOUND_API_URL").map_err(|_| ConfigError::MissingApiUrl)?;
        let mut config = Self::new(api_url);

        if let Ok(feed_url) = env::var("REBOUND_FEED_URL") {
            config.feed_url = feed_url;
        }

        if let Ok(timeout) = env::var("REBOUND_REQUEST_TIMEOUT_MS") {
            let millis: u64 = timeout.parse().map_err(|_| ConfigError::InvalidTimeout)?;
            config.request_timeout = Duration::from_millis(millis);
        }

        Ok(config)
    }

    pub fn with_feed_url(mut self, feed_url: impl Into<String>) -> Self {
        self.feed_url = feed_url.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Build the HTTP client used by the remote stores.
    pub fn http_client(&self) -> Result<reqwest::Client, ConfigError> {
        Ok(reqwest::Client::builder()
            .connect_timeout(self.request_timeout)
            .timeout(self.request_timeout)
            .build()?)
    }
}

fn derive_feed_url(api_url: &str) -> String {
    let base = if let Some(rest) = api_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = api_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        api_url.to_string()
    };
    format!("{}/ws", base)
}
