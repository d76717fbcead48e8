//! Agent configuration
//!
//! Loaded from TOML. Every field has a default so an empty file is valid.

use crate::channel::DEFAULT_MAX_MESSAGE_SIZE;
use crate::error::{Error, Result};
use crate::logging::LogConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the config file read by [`AgentConfig::from_env`].
pub const CONFIG_ENV_VAR: &str = "HANDS_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub logging: LogConfig,
}

/// Channel naming and framing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Command channel name prefix, followed by the process id
    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,
    /// Data channel name prefix, followed by the process id
    #[serde(default = "default_data_prefix")]
    pub data_prefix: String,
    /// Directory holding the channel endpoints
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// How often the data service probes its peer
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
}

/// Inbound call bridge
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Bound on the wait for a `RemoteCallResponse`. Unset blocks forever.
    #[serde(default)]
    pub remote_call_timeout_ms: Option<u64>,
}

fn default_command_prefix() -> String {
    "mbam-".to_string()
}

fn default_data_prefix() -> String {
    "mbamd-".to_string()
}

fn default_socket_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_probe_interval_ms() -> u64 {
    50
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            command_prefix: default_command_prefix(),
            data_prefix: default_data_prefix(),
            socket_dir: default_socket_dir(),
            max_message_size: default_max_message_size(),
            probe_interval_ms: default_probe_interval_ms(),
        }
    }
}

impl ChannelConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms.max(1))
    }
}

impl BridgeConfig {
    pub fn remote_call_timeout(&self) -> Option<Duration> {
        self.remote_call_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

impl AgentConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Config file named by `HANDS_CONFIG`, or defaults when unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) if !path.is_empty() => Self::load(PathBuf::from(path)),
            _ => Ok(Self::default()),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.channel.command_prefix == self.channel.data_prefix {
            return Err(Error::Config(format!(
                "command and data prefixes must differ (both {:?})",
                self.channel.command_prefix
            )));
        }
        if self.channel.max_message_size < 64 {
            return Err(Error::Config(format!(
                "max_message_size {} is too small",
                self.channel.max_message_size
            )));
        }
        Ok(())
    }
}
