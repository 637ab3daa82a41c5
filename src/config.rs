//! Configuration for the signaling server
//!
//! Loaded from a TOML file; every key is optional and falls back to its default:
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0"
//! port = 3479
//! ws_path = "/ws"
//!
//! [ws]
//! heartbeat_secs = 10
//! write_timeout_secs = 10
//!
//! [log]
//! level = "info"
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::connection::ConnectionOptions;
use crate::signaling::DEFAULT_SIGNALING_PORT;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub ws: WsConfig,
    pub log: LogConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Loaded config from {:?}", path);
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.server.ws_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "ws_path must start with '/': {:?}",
                self.server.ws_path
            )));
        }
        if self.ws.heartbeat_secs == 0 {
            return Err(ConfigError::Invalid("heartbeat_secs must be positive".into()));
        }
        if self.ws.write_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "write_timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Listener settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    /// Only upgrade requests for this path are accepted
    pub ws_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_SIGNALING_PORT,
            ws_path: "/ws".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

/// Per-connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WsConfig {
    pub heartbeat_secs: u64,
    pub write_timeout_secs: u64,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: 10,
            write_timeout_secs: 10,
        }
    }
}

impl WsConfig {
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
            write_timeout: Duration::from_secs(self.write_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default `tracing` filter directive; `RUST_LOG` takes precedence
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
