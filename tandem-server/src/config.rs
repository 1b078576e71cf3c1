//! Configuration file for tandem-server.
//!
//! Every key is optional; missing keys take the defaults below.
//!
//! ```toml
//! [server]
//! bind_addr = "0.0.0.0:9090"
//! heartbeat_interval_secs = 30
//!
//! [documents]
//! max_clients = 100
//! broadcast_capacity = 256
//! session_mailbox = 64
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tandem_collab::ServerConfig;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0} must be greater than zero")]
    Zero(&'static str),
}

/// Root of the configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub documents: DocumentSection,
}

/// Listener settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// WebSocket ping interval (default: 30).
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
}

/// Per-document limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DocumentSection {
    /// Clients joined to one document (default: 100).
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Revisions a connection may fall behind before it is dropped
    /// (default: 256).
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    /// Queued commands per document (default: 64).
    #[serde(default = "default_session_mailbox")]
    pub session_mailbox: usize,
}

fn default_bind_addr() -> String {
    ServerConfig::default().bind_addr
}

fn default_heartbeat_interval_secs() -> u64 {
    ServerConfig::default().heartbeat_interval_secs
}

fn default_max_clients() -> usize {
    ServerConfig::default().max_clients_per_document
}

fn default_broadcast_capacity() -> usize {
    ServerConfig::default().broadcast_capacity
}

fn default_session_mailbox() -> usize {
    ServerConfig::default().session_mailbox
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
        }
    }
}

impl Default for DocumentSection {
    fn default() -> Self {
        Self {
            max_clients: default_max_clients(),
            broadcast_capacity: default_broadcast_capacity(),
            session_mailbox: default_session_mailbox(),
        }
    }
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Channel sizes of zero are rejected here rather than at the first join.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("documents.max_clients", self.documents.max_clients),
            ("documents.broadcast_capacity", self.documents.broadcast_capacity),
            ("documents.session_mailbox", self.documents.session_mailbox),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.server.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Zero("server.heartbeat_interval_secs"));
        }
        Ok(())
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.server.bind_addr.clone(),
            max_clients_per_document: self.documents.max_clients,
            broadcast_capacity: self.documents.broadcast_capacity,
            heartbeat_interval_secs: self.server.heartbeat_interval_secs,
            session_mailbox: self.documents.session_mailbox,
        }
    }
}
