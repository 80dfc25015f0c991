//! Client configuration.
//!
//! Defaults can be overridden from the environment:
//!
//! | Variable                        | Meaning                                |
//! |---------------------------------|----------------------------------------|
//! | `NOSTR_RELAYS`                  | comma separated relay URLs             |
//! | `NOSTR_CONNECT_TIMEOUT_MS`      | relay connect timeout                  |
//! | `NOSTR_SUBSCRIPTION_TIMEOUT_MS` | EOSE window, `0` disables it           |
//! | `NOSTR_RETRY_ATTEMPTS`          | REQ retries per relay                  |
//! | `NOSTR_RETRY_DELAY_MS`          | base delay between REQ retries         |

use crate::manager::ManagerConfig;
use crate::pool::PoolConfig;
use std::time::Duration;
use tracing::warn;

/// Default relays.
pub const DEFAULT_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.nostr.band",
    "wss://nostr.wine",
];

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub relays: Vec<String>,
    pub pool: PoolConfig,
    pub manager: ManagerConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relays: DEFAULT_RELAYS.iter().map(|s| s.to_string()).collect(),
            pool: PoolConfig::default(),
            manager: ManagerConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`ClientConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(relays) = lookup("NOSTR_RELAYS") {
            let relays: Vec<String> = relays
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect();
            if !relays.is_empty() {
                config.relays = relays;
            }
        }

        if let Some(ms) = parse_number(&lookup, "NOSTR_CONNECT_TIMEOUT_MS") {
            config.pool.relay.connect_timeout = Duration::from_millis(ms);
        }

        if let Some(ms) = parse_number(&lookup, "NOSTR_SUBSCRIPTION_TIMEOUT_MS") {
            config.manager.default_options.timeout =
                (ms > 0).then(|| Duration::from_millis(ms));
        }

        if let Some(attempts) = parse_number(&lookup, "NOSTR_RETRY_ATTEMPTS") {
            config.manager.default_options.retry.max_attempts =
                u32::try_from(attempts).unwrap_or(u32::MAX);
        }

        if let Some(ms) = parse_number(&lookup, "NOSTR_RETRY_DELAY_MS") {
            config.manager.default_options.retry.base_delay = Duration::from_millis(ms);
        }

        config
    }

    pub fn with_relays(mut self, relays: Vec<String>) -> Self {
        self.relays = relays;
        self
    }
}

fn parse_number<F>(lookup: &F, key: &str) -> Option<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Ignoring {}={:?}: {}", key, raw, e);
            None
        }
    }
}
