//! Broker configuration.
//!
//! A flat JSON file pointed at by `OVERLORD_CONFIG_PATH` (all fields
//! optional), with built-in defaults matching the wire contract. CLI
//! flags override the bind addresses on top.

use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::conn::ConnPolicy;

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "OVERLORD_CONFIG_PATH";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct BrokerConfig {
    /// Address the ghost TCP listener binds to.
    pub ghost_bind: SocketAddr,
    /// Address the operator HTTP/WS front-end binds to.
    pub http_bind: SocketAddr,
    /// Default deadline for broker-to-ghost requests, seconds.
    pub rpc_timeout_secs: u64,
    /// Supervisor tick interval, seconds.
    pub timeout_check_secs: u64,
    /// Expected ghost ping cadence, seconds.
    pub ping_timeout_secs: u64,
    /// Inclusive target SSH forwarding port range.
    pub target_ssh_port_start: u16,
    pub target_ssh_port_end: u16,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            ghost_bind: "0.0.0.0:4455".parse().expect("static address"),
            http_bind: "127.0.0.1:9000".parse().expect("static address"),
            rpc_timeout_secs: 5,
            timeout_check_secs: 3,
            ping_timeout_secs: 10,
            target_ssh_port_start: 50000,
            target_ssh_port_end: 50999,
        }
    }
}

impl BrokerConfig {
    /// Load from `OVERLORD_CONFIG_PATH` if set, defaults otherwise.
    pub fn load() -> Result<BrokerConfig, ConfigError> {
        match env::var(CONFIG_PATH_ENV) {
            Ok(path) => BrokerConfig::from_file(Path::new(&path)),
            Err(_) => Ok(BrokerConfig::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<BrokerConfig, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: BrokerConfig =
            serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target_ssh_port_start > self.target_ssh_port_end {
            return Err(ConfigError::Invalid(format!(
                "targetSshPortStart ({}) must not exceed targetSshPortEnd ({})",
                self.target_ssh_port_start, self.target_ssh_port_end
            )));
        }
        if self.rpc_timeout_secs == 0 || self.timeout_check_secs == 0 || self.ping_timeout_secs == 0
        {
            return Err(ConfigError::Invalid(
                "timeouts must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// The per-connection policy derived from this config.
    pub fn conn_policy(&self) -> ConnPolicy {
        ConnPolicy {
            rpc_timeout: Duration::from_secs(self.rpc_timeout_secs),
            timeout_check_interval: Duration::from_secs(self.timeout_check_secs),
            ping_timeout: Duration::from_secs(self.ping_timeout_secs),
            ssh_port_start: self.target_ssh_port_start,
            ssh_port_end: self.target_ssh_port_end,
        }
    }
}
