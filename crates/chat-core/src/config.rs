//! Environment-backed engine tuning.

use std::{env, time::Duration};

use thiserror::Error;

use crate::wait::BoundedWait;

const DEFAULT_ROOM_PAGE_LIMIT: u16 = 20;
const DEFAULT_MESSAGE_PAGE_LIMIT: u16 = 30;
const DEFAULT_CONTACT_WAIT_POLL_MS: u64 = 100;
const DEFAULT_CONTACT_WAIT_MAX_MS: u64 = 5_000;
const DEFAULT_EVENT_BUFFER: usize = 256;

/// Runtime knobs for [`crate::engine::ChatEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Rooms requested per directory page.
    pub room_page_limit: u16,
    /// Messages requested per timeline page.
    pub message_page_limit: u16,
    /// Poll interval while waiting for the first directory load.
    pub contact_wait_poll_ms: u64,
    /// Upper bound on that wait before the room is flagged as timed out.
    pub contact_wait_max_ms: u64,
    /// Capacity of the engine event broadcast channel.
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            room_page_limit: DEFAULT_ROOM_PAGE_LIMIT,
            message_page_limit: DEFAULT_MESSAGE_PAGE_LIMIT,
            contact_wait_poll_ms: DEFAULT_CONTACT_WAIT_POLL_MS,
            contact_wait_max_ms: DEFAULT_CONTACT_WAIT_MAX_MS,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl EngineConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Parse configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let room_page_limit = parse_u16_or(
            "CHAT_SYNC_ROOM_PAGE_LIMIT",
            DEFAULT_ROOM_PAGE_LIMIT,
            &mut lookup,
        )?;
        let message_page_limit = parse_u16_or(
            "CHAT_SYNC_MESSAGE_PAGE_LIMIT",
            DEFAULT_MESSAGE_PAGE_LIMIT,
            &mut lookup,
        )?;
        let contact_wait_poll_ms = parse_u64_or(
            "CHAT_SYNC_CONTACT_WAIT_POLL_MS",
            DEFAULT_CONTACT_WAIT_POLL_MS,
            &mut lookup,
        )?;
        let contact_wait_max_ms = parse_u64_or(
            "CHAT_SYNC_CONTACT_WAIT_MAX_MS",
            DEFAULT_CONTACT_WAIT_MAX_MS,
            &mut lookup,
        )?;
        let event_buffer =
            parse_usize_or("CHAT_SYNC_EVENT_BUFFER", DEFAULT_EVENT_BUFFER, &mut lookup)?;

        for (key, value) in [
            ("CHAT_SYNC_ROOM_PAGE_LIMIT", u64::from(room_page_limit)),
            ("CHAT_SYNC_MESSAGE_PAGE_LIMIT", u64::from(message_page_limit)),
            ("CHAT_SYNC_CONTACT_WAIT_POLL_MS", contact_wait_poll_ms),
            ("CHAT_SYNC_EVENT_BUFFER", event_buffer as u64),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key,
                    value: "0".to_owned(),
                    reason: "must be at least 1".to_owned(),
                });
            }
        }
        if room_page_limit > 100 || message_page_limit > 100 {
            let (key, value) = if room_page_limit > 100 {
                ("CHAT_SYNC_ROOM_PAGE_LIMIT", room_page_limit)
            } else {
                ("CHAT_SYNC_MESSAGE_PAGE_LIMIT", message_page_limit)
            };
            return Err(ConfigError::InvalidValue {
                key,
                value: value.to_string(),
                reason: "must be at most 100".to_owned(),
            });
        }

        Ok(Self {
            room_page_limit,
            message_page_limit,
            contact_wait_poll_ms,
            contact_wait_max_ms,
            event_buffer,
        })
    }

    /// Wait policy used while resolving a contact before the directory loads.
    pub fn contact_wait(&self) -> BoundedWait {
        BoundedWait::new(
            Duration::from_millis(self.contact_wait_poll_ms),
            Duration::from_millis(self.contact_wait_max_ms),
        )
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
    /// A required variable is missing or blank.
    #[error("missing required {key}")]
    Missing { key: &'static str },
}

/// Trimmed value for `key`, or `None` when unset or blank.
pub fn optional_trimmed<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

/// Parse `key` with `FromStr`, falling back to `default` when unset or blank.
pub fn parse_or<T, F>(key: &'static str, default: T, lookup: &mut F) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed(key, lookup) else {
        return Ok(default);
    };
    value.parse::<T>().map_err(|err| ConfigError::InvalidValue {
        key,
        value,
        reason: err.to_string(),
    })
}

fn parse_u16_or<F>(key: &'static str, default: u16, lookup: &mut F) -> Result<u16, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    parse_or(key, default, lookup)
}

fn parse_u64_or<F>(key: &'static str, default: u64, lookup: &mut F) -> Result<u64, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    parse_or(key, default, lookup)
}

fn parse_usize_or<F>(key: &'static str, default: usize, lookup: &mut F) -> Result<usize, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    parse_or(key, default, lookup)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from_pairs(pairs: &[(&str, &str)]) -> Result<EngineConfig, ConfigError> {
        let map = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<HashMap<_, _>>();
        EngineConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let cfg = config_from_pairs(&[]).expect("config should parse");
        assert_eq!(cfg, EngineConfig::default());
        assert_eq!(cfg.room_page_limit, 20);
        assert_eq!(cfg.message_page_limit, 30);
        assert_eq!(cfg.contact_wait().max_wait(), Duration::from_secs(5));
    }

    #[test]
    fn parses_overrides() {
        let cfg = config_from_pairs(&[
            ("CHAT_SYNC_ROOM_PAGE_LIMIT", "50"),
            ("CHAT_SYNC_MESSAGE_PAGE_LIMIT", " 40 "),
            ("CHAT_SYNC_CONTACT_WAIT_POLL_MS", "25"),
            ("CHAT_SYNC_CONTACT_WAIT_MAX_MS", "0"),
            ("CHAT_SYNC_EVENT_BUFFER", "8"),
        ])
        .expect("config should parse");

        assert_eq!(cfg.room_page_limit, 50);
        assert_eq!(cfg.message_page_limit, 40);
        assert_eq!(cfg.contact_wait().poll_interval(), Duration::from_millis(25));
        assert_eq!(cfg.contact_wait_max_ms, 0);
        assert_eq!(cfg.event_buffer, 8);
    }

    #[test]
    fn rejects_unparseable_values() {
        let err = config_from_pairs(&[("CHAT_SYNC_ROOM_PAGE_LIMIT", "lots")])
            .expect_err("non-numeric limit must fail");
        match err {
            ConfigError::InvalidValue { key, value, .. } => {
                assert_eq!(key, "CHAT_SYNC_ROOM_PAGE_LIMIT");
                assert_eq!(value, "lots");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn rejects_zero_and_oversized_limits() {
        assert!(config_from_pairs(&[("CHAT_SYNC_MESSAGE_PAGE_LIMIT", "0")]).is_err());
        assert!(config_from_pairs(&[("CHAT_SYNC_EVENT_BUFFER", "0")]).is_err());
        let err = config_from_pairs(&[("CHAT_SYNC_ROOM_PAGE_LIMIT", "101")])
            .expect_err("limit above 100 must fail");
        assert_eq!(
            err.to_string(),
            "invalid CHAT_SYNC_ROOM_PAGE_LIMIT='101': must be at most 100"
        );
    }
}
