//! Server Configuration
//!
//! [`Cli`] is what the binary parses from the command line; [`ServerConfig`]
//! is what the library runs on. Tests build a `ServerConfig` directly.

use crate::replication::{MasterAddr, ReplicationConfig, Role};
use crate::storage::ExpiryConfig;
use clap::Parser;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("expected \"<host> <port>\" or \"<host>:<port>\", got {0:?}")]
    InvalidReplicaOf(String),

    #[error("invalid master port {0:?}")]
    InvalidPort(String),
}

/// Command-line options.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "In-memory key-value server with master/replica replication")]
pub struct Cli {
    /// Port to listen on
    #[arg(short, long, default_value_t = crate::DEFAULT_PORT)]
    pub port: u16,

    /// Host to bind to
    #[arg(long, default_value = crate::DEFAULT_HOST)]
    pub host: String,

    /// Follow a master, e.g. "localhost 6379"
    #[arg(long, value_name = "HOST PORT", value_parser = parse_replicaof)]
    pub replicaof: Option<MasterAddr>,

    /// Period of the background expiry reaper
    #[arg(long, default_value_t = 100)]
    pub expiry_interval_ms: u64,

    /// Delay before a replica reconnects to its master
    #[arg(long, default_value_t = 2000)]
    pub replica_retry_ms: u64,

    /// Timeout for connecting and for each handshake reply
    #[arg(long, default_value_t = 5000)]
    pub handshake_timeout_ms: u64,

    /// Frames a replica may lag behind before the master drops it
    #[arg(long, default_value_t = 1024)]
    pub replica_queue: usize,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Everything a [`Server`](crate::server::Server) needs to start.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub role: Role,
    pub expiry: ExpiryConfig,
    pub replication: ReplicationConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: crate::DEFAULT_HOST.to_string(),
            port: crate::DEFAULT_PORT,
            role: Role::Master,
            expiry: ExpiryConfig::default(),
            replication: ReplicationConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Returns the bind address as a string
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl From<Cli> for ServerConfig {
    fn from(cli: Cli) -> Self {
        Self {
            host: cli.host,
            port: cli.port,
            role: cli.replicaof.map_or(Role::Master, Role::Replica),
            expiry: ExpiryConfig {
                interval: Duration::from_millis(cli.expiry_interval_ms.max(1)),
            },
            replication: ReplicationConfig {
                replica_queue_capacity: cli.replica_queue.max(1),
                retry_backoff: Duration::from_millis(cli.replica_retry_ms),
                handshake_timeout: Duration::from_millis(cli.handshake_timeout_ms),
            },
        }
    }
}

/// Parses `--replicaof` as `"host port"` or `host:port`.
pub fn parse_replicaof(value: &str) -> Result<MasterAddr, ConfigError> {
    let value = value.trim();
    let parts: Vec<&str> = value.split_whitespace().collect();

    let (host, port) = match parts.as_slice() {
        [host, port] => (*host, *port),
        [single] => single
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::InvalidReplicaOf(value.to_string()))?,
        _ => return Err(ConfigError::InvalidReplicaOf(value.to_string())),
    };

    if host.is_empty() {
        return Err(ConfigError::InvalidReplicaOf(value.to_string()));
    }
    let port = port
        .parse::<u16>()
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| ConfigError::InvalidPort(port.to_string()))?;

    Ok(MasterAddr {
        host: host.to_string(),
        port,
    })
}
