//! Tracing bootstrap for the smoke binary.

use std::env;

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,chat_smoke=debug,chat_core=debug,chat_http=debug";

/// Install the global subscriber.
///
/// Precedence:
/// 1) `RUST_LOG`
/// 2) `CHAT_SYNC_LOG`
/// 3) internal default filter
pub fn init() {
    let directives = directives_from_lookup(|key| env::var(key).ok());
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_env_filter(EnvFilter::new(directives))
        .try_init();
}

/// First non-blank, parseable filter in precedence order.
fn directives_from_lookup<F>(lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    for key in ["RUST_LOG", "CHAT_SYNC_LOG"] {
        if let Some(value) = lookup(key).filter(|v| !v.trim().is_empty())
            && EnvFilter::try_new(&value).is_ok()
        {
            return value;
        }
    }

    DEFAULT_FILTER.to_owned()
}
