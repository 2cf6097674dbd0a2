use serde::Deserialize;
use serde::Serialize;
use std::env;
use std::time::Duration;

use crate::error::MemoError;
use crate::error::Result;

pub const ENV_TAG: &str = "MEMO_CACHE_TAG";
pub const ENV_LOCK_TIMEOUT: &str = "MEMO_CACHE_LOCK_TIMEOUT";
pub const ENV_WAIT_TIMEOUT: &str = "MEMO_CACHE_WAIT_TIMEOUT";

/// Deserializable settings of a [`MemoCache`](crate::MemoCache).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemoConfig {
    /// Namespace prefix for all keys and channels.
    pub resource_tag:      String,
    /// Lease of the computation lock, seconds.
    pub lock_timeout_secs: u64,
    /// How long a caller waits for somebody else's computation by default, seconds.
    pub wait_timeout_secs: u64,
}

impl Default for MemoConfig {
    fn default() -> Self {
        Self {
            resource_tag:      "memo".to_string(),
            lock_timeout_secs: 10,
            wait_timeout_secs: 30,
        }
    }
}

impl MemoConfig {
    /// Defaults overridden by `MEMO_CACHE_TAG`, `MEMO_CACHE_LOCK_TIMEOUT`, and `MEMO_CACHE_WAIT_TIMEOUT`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(tag) = lookup(ENV_TAG) {
            config.resource_tag = tag;
        }
        if let Some(secs) = lookup(ENV_LOCK_TIMEOUT) {
            config.lock_timeout_secs = parse_secs(ENV_LOCK_TIMEOUT, &secs)?;
        }
        if let Some(secs) = lookup(ENV_WAIT_TIMEOUT) {
            config.wait_timeout_secs = parse_secs(ENV_WAIT_TIMEOUT, &secs)?;
        }
        Ok(config)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }
}

fn parse_secs(name: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|err| MemoError::Configuration(format!("{name}='{value}' is not a number of seconds: {err}")))
}
