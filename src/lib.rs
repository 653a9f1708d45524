//! # RelayKV - In-Memory Key-Value Server with Replication
//!
//! RelayKV speaks the Redis serialization protocol (RESP) over TCP, keeps
//! string keys in memory with optional millisecond expiry, and replicates
//! writes from one master to any number of replicas.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              RelayKV                                    │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │ TCP Server  │───>│ Connection  │───>│  Command    │                  │
//! │  │ (Listener)  │    │  Handler    │    │  Handler    │                  │
//! │  └─────────────┘    └──────┬──────┘    └──────┬──────┘                  │
//! │                            │                  │                         │
//! │                 replica    │                  ▼                         │
//! │                 stream  ◄──┘  ┌──────────────────────────────────────┐  │
//! │                    ▲          │            StorageEngine             │  │
//! │                    │          │  64 shards, RwLock<HashMap> each     │  │
//! │  ┌─────────────────┴──────┐   └──────────────────────────────────────┘  │
//! │  │ ReplicationCoordinator │                   ▲                         │
//! │  │ role, replid, offset,  │                   │                         │
//! │  │ per-replica queues     │   ┌───────────────┴──────────────────────┐  │
//! │  └────────────────────────┘   │ ExpirySweeper (background task)      │  │
//! │                               └──────────────────────────────────────┘  │
//! │  ┌────────────────────────┐                                             │
//! │  │ ReplicaSync (replica)  │  handshake ─► snapshot ─► apply stream      │
//! │  └────────────────────────┘                                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use relaykv::config::ServerConfig;
//! use relaykv::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let server = Server::bind(ServerConfig::default()).await?;
//!     server.run_until_ctrl_c().await
//! }
//! ```
//!
//! ## Supported Commands
//!
//! - `PING`
//! - `ECHO message`
//! - `SET key value [PX milliseconds | EX seconds]`
//! - `GET key`
//! - `INFO [section]`
//! - `REPLCONF option value`
//! - `PSYNC replid offset`
//!
//! ## Module Overview
//!
//! - [`protocol`]: RESP values, incremental parser, typed commands
//! - [`storage`]: sharded keyspace with TTLs and the expiry reaper
//! - [`commands`]: command execution
//! - [`replication`]: master-side propagation and the replica worker
//! - [`connection`]: per-client connection tasks
//! - [`config`] and [`server`]: startup and the accept loop
//!
//! ## Expiry
//!
//! Keys with a TTL are expired in two ways:
//! 1. **Lazy**: a read of an expired key removes it and reports it missing
//! 2. **Active**: a background task sweeps the keyspace on a fixed period

pub mod commands;
pub mod config;
pub mod connection;
pub mod protocol;
pub mod replication;
pub mod server;
pub mod storage;

pub use commands::CommandHandler;
pub use config::{Cli, ServerConfig};
pub use connection::{handle_connection, ConnectionStats};
pub use protocol::{Command, ParseError, RespParser, RespValue};
pub use replication::{ReplicationCoordinator, Role};
pub use server::Server;
pub use storage::{ExpiryConfig, ExpirySweeper, StorageEngine};

/// The default port (same as Redis)
pub const DEFAULT_PORT: u16 = 6379;

/// The default host to bind to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of RelayKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
