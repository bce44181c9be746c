use std::{env, time::Duration};

use chat_core::config::{ConfigError, optional_trimmed, parse_or};
use url::Url;

const DEFAULT_BASE_URL: &str = "http://localhost:8080/api/v1";
const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Where and how to reach the chat backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpBackendConfig {
    /// API root; routes are appended as path segments.
    pub base_url: Url,
    /// Optional bearer token sent with every request.
    pub token: Option<String>,
    /// Per-request timeout for REST calls. Push streams are not subject to it.
    pub timeout: Duration,
}

impl HttpBackendConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let raw_base = optional_trimmed("CHAT_SYNC_API_BASE_URL", &mut lookup)
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_owned());
        let base_url = parse_base_url(&raw_base)?;
        let token = optional_trimmed("CHAT_SYNC_API_TOKEN", &mut lookup);
        let timeout_ms = parse_or("CHAT_SYNC_HTTP_TIMEOUT_MS", DEFAULT_TIMEOUT_MS, &mut lookup)?;
        if timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CHAT_SYNC_HTTP_TIMEOUT_MS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }

        Ok(Self {
            base_url,
            token,
            timeout: Duration::from_millis(timeout_ms),
        })
    }
}

fn parse_base_url(raw: &str) -> Result<Url, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidValue {
        key: "CHAT_SYNC_API_BASE_URL",
        value: raw.to_owned(),
        reason,
    };
    let url = Url::parse(raw).map_err(|err| invalid(err.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("scheme must be http or https".to_owned()));
    }
    if url.cannot_be_a_base() {
        return Err(invalid("url cannot carry a path".to_owned()));
    }
    Ok(url)
}
