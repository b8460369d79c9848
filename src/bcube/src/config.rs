use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::topology::AddressPlan;
use crate::transport::fabric::FabricTransportConfig;
use crate::transport::tcp::TcpTransportConfig;
use crate::transport::DEFAULT_LISTEN_PORT;

pub const RANK_ENV: &str = "BCUBE_RANK";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Rank is not given, set {} or pass --rank", RANK_ENV)]
    MissingRank,
    #[error("Invalid rank {0:?}")]
    InvalidRank(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    pub group_size: usize,
    pub level_count: usize,
    pub addresses: AddressPlan,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        TopologyConfig {
            group_size: 3,
            level_count: 2,
            addresses: AddressPlan::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectiveConfig {
    // bound on one pipeline step
    pub step_timeout_ms: u64,
    // bound on waiting for the fragments of one step
    pub recv_timeout_ms: u64,
}

impl Default for CollectiveConfig {
    fn default() -> Self {
        CollectiveConfig {
            step_timeout_ms: 60_000,
            recv_timeout_ms: 600_000,
        }
    }
}

impl CollectiveConfig {
    #[inline]
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    #[inline]
    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }
}

/// Transport the node runs the collective over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    #[default]
    Tcp,
    Fabric,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub backend: Backend,
    pub topology: TopologyConfig,
    pub listen_port: u16,
    pub tcp: TcpTransportConfig,
    pub fabric: FabricTransportConfig,
    pub collective: CollectiveConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            backend: Backend::default(),
            topology: TopologyConfig::default(),
            listen_port: DEFAULT_LISTEN_PORT,
            tcp: TcpTransportConfig::default(),
            fabric: FabricTransportConfig::default(),
            collective: CollectiveConfig::default(),
        }
    }
}

impl Config {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }
}

pub fn parse_rank(value: &str) -> Result<usize, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidRank(value.to_string()))
}

/// Reads the local rank from `BCUBE_RANK`.
pub fn rank_from_env() -> Result<usize, ConfigError> {
    match std::env::var(RANK_ENV) {
        Ok(value) => parse_rank(&value),
        Err(_) => Err(ConfigError::MissingRank),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::BindMode;

    #[test]
    fn defaults_from_empty_file() {
        let config = Config::from_str("").unwrap();
        assert_eq!(config.listen_port, 9610);
        assert_eq!(config.topology.group_size, 3);
        assert_eq!(config.topology.level_count, 2);
        assert_eq!(config.fabric.reject_backoff_ms, 100);
        assert_eq!(config.fabric.max_connect_attempts, 6000);
        assert_eq!(config.tcp.bind, BindMode::Wildcard);
        assert_eq!(config.backend, Backend::Tcp);
    }

    #[test]
    fn partial_sections() {
        let config = Config::from_str(
            r#"
            listen_port = 9700
            backend = "fabric"

            [topology]
            group_size = 2
            addresses = { prefix = [127, 0] }

            [tcp]
            bind = "per_level"
            "#,
        )
        .unwrap();
        assert_eq!(config.listen_port, 9700);
        assert_eq!(config.backend, Backend::Fabric);
        assert_eq!(config.topology.group_size, 2);
        assert_eq!(config.topology.level_count, 2);
        assert_eq!(config.topology.addresses.prefix, [127, 0]);
        assert_eq!(config.topology.addresses.level_base, 10);
        assert_eq!(config.tcp.bind, BindMode::PerLevel);
        assert!(matches!(
            Config::from_str("unknown = 1"),
            Err(ConfigError::Toml(_))
        ));
        assert!(matches!(
            Config::from_str("backend = \"verbs\""),
            Err(ConfigError::Toml(_))
        ));
    }

    #[test]
    fn rank_parsing() {
        assert_eq!(parse_rank(" 4\n").unwrap(), 4);
        assert!(matches!(parse_rank("four"), Err(ConfigError::InvalidRank(_))));
    }
}
