//! Service configuration loading.
//!
//! Configuration is a small YAML file; every section and field has a
//! default so an empty (or missing) file yields a working setup.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Fallback encryption key used when no key is configured. Deployments
/// are expected to override this.
pub const DEFAULT_ENCRYPT_KEY: &str = "default-encryption-key-change-in-production";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub timeouts: Timeouts,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Key material for host secret encryption; padded/truncated to the
    /// AES-256 key size. Empty means [`DEFAULT_ENCRYPT_KEY`].
    #[serde(default)]
    pub encrypt_key: String,
}

impl SecurityConfig {
    pub fn effective_key(&self) -> &str {
        if self.encrypt_key.is_empty() {
            DEFAULT_ENCRYPT_KEY
        } else {
            &self.encrypt_key
        }
    }
}

/// Behavioral timing constants for the tunnel engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeouts {
    /// SSH dial timeout in seconds
    #[serde(default = "default_ssh_dial_secs")]
    pub ssh_dial_secs: u64,
    /// Local service health probe timeout in seconds
    #[serde(default = "default_health_check_secs")]
    pub health_check_secs: u64,
    /// Accept re-arm cadence for cancellation probing, in milliseconds
    #[serde(default = "default_accept_poll_ms")]
    pub accept_poll_ms: u64,
    /// Pause after stop before declaring the port released, in milliseconds
    #[serde(default = "default_stop_settle_ms")]
    pub stop_settle_ms: u64,
    /// Pause between stop and start during restart, in milliseconds
    #[serde(default = "default_restart_pause_ms")]
    pub restart_pause_ms: u64,
}

fn default_ssh_dial_secs() -> u64 {
    30
}

fn default_health_check_secs() -> u64 {
    5
}

fn default_accept_poll_ms() -> u64 {
    1000
}

fn default_stop_settle_ms() -> u64 {
    200
}

fn default_restart_pause_ms() -> u64 {
    1000
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            ssh_dial_secs: default_ssh_dial_secs(),
            health_check_secs: default_health_check_secs(),
            accept_poll_ms: default_accept_poll_ms(),
            stop_settle_ms: default_stop_settle_ms(),
            restart_pause_ms: default_restart_pause_ms(),
        }
    }
}

impl Timeouts {
    pub fn ssh_dial(&self) -> Duration {
        Duration::from_secs(self.ssh_dial_secs)
    }

    pub fn health_check(&self) -> Duration {
        Duration::from_secs(self.health_check_secs)
    }

    pub fn accept_poll(&self) -> Duration {
        Duration::from_millis(self.accept_poll_ms)
    }

    pub fn stop_settle(&self) -> Duration {
        Duration::from_millis(self.stop_settle_ms)
    }

    pub fn restart_pause(&self) -> Duration {
        Duration::from_millis(self.restart_pause_ms)
    }
}

impl Config {
    /// Load configuration from a YAML file, falling back to defaults when
    /// the file does not exist.
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;

        serde_yaml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.security.effective_key(), DEFAULT_ENCRYPT_KEY);
        assert_eq!(config.timeouts.ssh_dial(), Duration::from_secs(30));
        assert_eq!(config.timeouts.stop_settle(), Duration::from_millis(200));
        assert_eq!(config.timeouts.accept_poll(), Duration::from_millis(1000));
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let config: Config = serde_yaml::from_str("security:\n  encrypt_key: hunter2\n").unwrap();
        assert_eq!(config.security.effective_key(), "hunter2");
        assert_eq!(config.timeouts.restart_pause(), Duration::from_millis(1000));
    }

    #[test]
    fn test_timeout_overrides() {
        let config: Config =
            serde_yaml::from_str("timeouts:\n  ssh_dial_secs: 5\n  stop_settle_ms: 50\n").unwrap();
        assert_eq!(config.timeouts.ssh_dial(), Duration::from_secs(5));
        assert_eq!(config.timeouts.stop_settle(), Duration::from_millis(50));
        assert_eq!(config.timeouts.health_check(), Duration::from_secs(5));
    }
}
