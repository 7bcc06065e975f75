//! Tunables for polling, timeouts and the bridge.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Config load error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Sync and bridge settings. Every field has a default, so an empty
/// TOML document is a valid config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Poll interval while a reply is awaited.
    pub fast_poll_ms: u64,
    /// Poll interval otherwise.
    pub idle_poll_ms: u64,
    /// Deadline after a send before an extra poll is forced.
    pub safety_timeout_ms: u64,
    /// Messages requested per history fetch.
    pub history_limit: usize,
    /// Lifetime of a user-visible error notice.
    pub notice_ttl_ms: u64,
    /// Bound on the `chat.send` RPC.
    pub send_timeout_ms: u64,
    /// Bound on other gateway RPCs.
    pub rpc_timeout_ms: u64,
    pub reconnect_min_ms: u64,
    pub reconnect_max_ms: u64,
    /// Total attempts for a config patch, counting the first.
    pub config_patch_attempts: usize,
    /// Sends allowed per client within `rate_window_ms`.
    pub rate_limit: usize,
    pub rate_window_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            fast_poll_ms: 1_000,
            idle_poll_ms: 5_000,
            safety_timeout_ms: 45_000,
            history_limit: 200,
            notice_ttl_ms: 8_000,
            send_timeout_ms: 30_000,
            rpc_timeout_ms: 30_000,
            reconnect_min_ms: 500,
            reconnect_max_ms: 30_000,
            config_patch_attempts: 2,
            rate_limit: 30,
            rate_window_ms: 60_000,
        }
    }
}

impl SyncConfig {
    /// Parse from a TOML string.
    ///
    /// # Errors
    /// Returns error if the document is not valid TOML for this shape.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Load from a TOML file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    #[must_use]
    pub const fn fast_poll(&self) -> Duration {
        Duration::from_millis(self.fast_poll_ms)
    }

    #[must_use]
    pub const fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    #[must_use]
    pub const fn safety_timeout(&self) -> Duration {
        Duration::from_millis(self.safety_timeout_ms)
    }

    #[must_use]
    pub const fn notice_ttl(&self) -> Duration {
        Duration::from_millis(self.notice_ttl_ms)
    }

    #[must_use]
    pub const fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    #[must_use]
    pub const fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    #[must_use]
    pub const fn reconnect_min(&self) -> Duration {
        Duration::from_millis(self.reconnect_min_ms)
    }

    #[must_use]
    pub const fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    #[must_use]
    pub const fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms)
    }
}
