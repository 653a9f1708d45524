//! Command Handler Module
//!
//! Executes decoded commands against the storage engine and produces the
//! reply for the client.
//!
//! ## Supported Commands
//!
//! - `PING` - Test connection
//! - `ECHO message` - Echo message
//! - `SET key value [PX milliseconds | EX seconds]` - Set a key
//! - `GET key` - Get a key's value
//! - `INFO [section]` - Server information
//! - `REPLCONF <option> <value>` - Replica handshake bookkeeping
//! - `PSYNC replid offset` - Start replication on this connection
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     CommandHandler                          │
//! │                                                             │
//! │  ┌──────────────┐   ┌─────────────┐   ┌──────────────┐      │
//! │  │ from_frame() │──>│ dispatch()  │──>│  cmd_*()     │      │
//! │  └──────────────┘   └─────────────┘   └──────┬───────┘      │
//! │                                              │              │
//! │                          ┌───────────────────┼─────────┐    │
//! │                          ▼                   ▼         │    │
//! │                   StorageEngine   ReplicationCoordinator    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Writes on a master go through [`ReplicationCoordinator::propagate_write`]
//! with the exact bytes the client sent, so replicas replay the same frame.

use crate::connection::ConnectionStats;
use crate::protocol::{Command, RespValue};
use crate::replication::{empty_snapshot, ReplicaStream, ReplicationCoordinator};
use crate::storage::StorageEngine;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// INFO sections in the order they are rendered.
const INFO_SECTIONS: [&str; 5] = ["server", "clients", "stats", "replication", "keyspace"];

/// Per-connection state that commands may read or update.
#[derive(Debug, Clone)]
pub struct ClientContext {
    /// Peer address of the connection
    pub addr: SocketAddr,
    /// Port announced with `REPLCONF listening-port`
    pub listening_port: Option<u16>,
    /// Capabilities announced with `REPLCONF capa`
    pub capabilities: Vec<String>,
}

impl ClientContext {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            listening_port: None,
            capabilities: Vec::new(),
        }
    }
}

/// What the connection should do after a command ran.
#[derive(Debug)]
pub enum Outcome {
    /// Write this reply and keep serving requests.
    Reply(RespValue),
    /// Write `replies` (FULLRESYNC line, then the snapshot) and turn the
    /// connection into a push-only feed of `stream`.
    FullResync {
        replies: Vec<RespValue>,
        stream: ReplicaStream,
    },
}

/// Dispatches commands to their handlers.
///
/// Cheap to clone; every connection gets its own copy.
#[derive(Clone)]
pub struct CommandHandler {
    storage: Arc<StorageEngine>,
    replication: Arc<ReplicationCoordinator>,
    stats: Arc<ConnectionStats>,
    start_time: Instant,
}

impl CommandHandler {
    /// Creates a command handler over the given store and replication state.
    pub fn new(storage: Arc<StorageEngine>, replication: Arc<ReplicationCoordinator>) -> Self {
        Self {
            storage,
            replication,
            stats: Arc::new(ConnectionStats::new()),
            start_time: Instant::now(),
        }
    }

    /// Uses shared connection statistics for INFO.
    pub fn with_stats(mut self, stats: Arc<ConnectionStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn storage(&self) -> &Arc<StorageEngine> {
        &self.storage
    }

    pub fn replication(&self) -> &Arc<ReplicationCoordinator> {
        &self.replication
    }

    /// Decodes and executes one request frame.
    ///
    /// `raw` is the frame exactly as received; it is what gets propagated to
    /// replicas when the command is a write.
    pub fn execute(&self, frame: RespValue, raw: &Bytes, ctx: &mut ClientContext) -> Outcome {
        match Command::from_frame(frame) {
            Ok(command) => self.dispatch(command, raw, ctx),
            Err(e) => {
                debug!(client = %ctx.addr, error = %e, "Rejected command");
                Outcome::Reply(RespValue::error(e.to_string()))
            }
        }
    }

    /// Executes a decoded command.
    pub fn dispatch(&self, command: Command, raw: &Bytes, ctx: &mut ClientContext) -> Outcome {
        trace!(client = %ctx.addr, command = command.name(), "Dispatching");

        let reply = match command {
            Command::Ping => RespValue::pong(),
            Command::Echo(message) => RespValue::bulk_string(message),
            Command::Get(key) => self.cmd_get(&key),
            Command::Set { key, value, ttl_ms } => self.cmd_set(key, value, ttl_ms, raw),
            Command::Info(section) => self.cmd_info(section.as_deref()),
            Command::ReplConf { kind, value } => self.cmd_replconf(&kind, &value, ctx),
            Command::Psync { replid, offset } => return self.cmd_psync(&replid, offset, ctx),
        };

        Outcome::Reply(reply)
    }

    /// Applies a command received on the replication stream.
    ///
    /// Data commands change the store exactly as if a client had sent them;
    /// nothing is replied and nothing is propagated further.
    pub fn apply(&self, command: Command, raw: &Bytes) {
        match command {
            Command::Set { key, value, ttl_ms } => {
                self.cmd_set(key, value, ttl_ms, raw);
            }
            Command::Ping
            | Command::Echo(_)
            | Command::Get(_)
            | Command::Info(_)
            | Command::ReplConf { .. } => {
                trace!(command = command.name(), "No-op on replication stream");
            }
            Command::Psync { .. } => {
                warn!("Ignoring PSYNC received on the replication stream");
            }
        }
    }

    // ========================================================================
    // Keyspace Commands
    // ========================================================================

    /// GET key
    fn cmd_get(&self, key: &Bytes) -> RespValue {
        match self.storage.get(key) {
            Some(value) => RespValue::bulk_string(value),
            None => RespValue::null(),
        }
    }

    /// SET key value [PX milliseconds]
    ///
    /// A non-positive TTL stores an already expired entry.
    fn cmd_set(&self, key: Bytes, value: Bytes, ttl_ms: Option<i64>, raw: &Bytes) -> RespValue {
        let storage = &self.storage;
        self.replication.propagate_write(raw, || match ttl_ms {
            Some(ms) => {
                let ttl = Duration::from_millis(ms.max(0) as u64);
                storage.set_with_ttl(key, value, ttl)
            }
            None => storage.set(key, value),
        });
        RespValue::ok()
    }

    // ========================================================================
    // Replication Commands
    // ========================================================================

    /// REPLCONF listening-port <port> | capa <capability> | ...
    fn cmd_replconf(&self, kind: &str, value: &Bytes, ctx: &mut ClientContext) -> RespValue {
        let value = String::from_utf8_lossy(value);
        match kind.to_ascii_lowercase().as_str() {
            "listening-port" => match value.parse::<u16>() {
                Ok(port) => ctx.listening_port = Some(port),
                Err(_) => warn!(client = %ctx.addr, port = %value, "Ignoring invalid listening-port"),
            },
            "capa" => ctx.capabilities.push(value.into_owned()),
            other => trace!(client = %ctx.addr, option = other, "Ignoring REPLCONF option"),
        }
        RespValue::ok()
    }

    /// PSYNC replid offset
    ///
    /// Only full resynchronization is supported, whatever the arguments.
    fn cmd_psync(&self, replid: &str, offset: i64, ctx: &mut ClientContext) -> Outcome {
        if !self.replication.is_master() {
            return Outcome::Reply(RespValue::error(
                "ERR PSYNC is only served by a master",
            ));
        }

        let snapshot = match empty_snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(error = %e, "Failed to build snapshot payload");
                return Outcome::Reply(RespValue::error("ERR snapshot unavailable"));
            }
        };

        if replid != "?" || offset != -1 {
            debug!(
                client = %ctx.addr,
                replid,
                offset,
                "Partial resync not supported, sending full resync"
            );
        }

        let (stream, start_offset) = self
            .replication
            .register_replica(ctx.addr, ctx.listening_port);

        Outcome::FullResync {
            replies: vec![
                RespValue::simple_string(format!(
                    "FULLRESYNC {} {}",
                    self.replication.replid(),
                    start_offset
                )),
                RespValue::raw_bytes(snapshot),
            ],
            stream,
        }
    }

    // ========================================================================
    // Server Commands
    // ========================================================================

    /// INFO [section]
    fn cmd_info(&self, section: Option<&str>) -> RespValue {
        let requested = section.map(|s| s.to_ascii_lowercase());
        let sections: Vec<&str> = match requested.as_deref() {
            None | Some("all") | Some("everything") | Some("default") => INFO_SECTIONS.to_vec(),
            Some(name) => INFO_SECTIONS
                .iter()
                .copied()
                .filter(|candidate| *candidate == name)
                .collect(),
        };

        let body = sections
            .into_iter()
            .map(|name| self.info_section(name))
            .collect::<Vec<_>>()
            .join("\r\n");

        RespValue::bulk_string(Bytes::from(body))
    }

    fn info_section(&self, name: &str) -> String {
        match name {
            "server" => format!(
                "# Server\r\n\
                 relaykv_version:{}\r\n\
                 os:{}\r\n\
                 process_id:{}\r\n\
                 uptime_in_seconds:{}\r\n",
                crate::VERSION,
                std::env::consts::OS,
                std::process::id(),
                self.start_time.elapsed().as_secs(),
            ),
            "clients" => format!(
                "# Clients\r\nconnected_clients:{}\r\n",
                self.stats.active_connections.load(Ordering::Relaxed),
            ),
            "stats" => {
                let storage = self.storage.stats();
                format!(
                    "# Stats\r\n\
                     total_connections_received:{}\r\n\
                     total_commands_processed:{}\r\n\
                     total_net_input_bytes:{}\r\n\
                     total_net_output_bytes:{}\r\n\
                     expired_keys:{}\r\n\
                     keyspace_get_ops:{}\r\n\
                     keyspace_set_ops:{}\r\n",
                    self.stats.connections_accepted.load(Ordering::Relaxed),
                    self.stats.commands_processed.load(Ordering::Relaxed),
                    self.stats.bytes_read.load(Ordering::Relaxed),
                    self.stats.bytes_written.load(Ordering::Relaxed),
                    storage.expired,
                    storage.get_ops,
                    storage.set_ops,
                )
            }
            "replication" => self.replication.info_section(),
            "keyspace" => {
                let mut out = String::from("# Keyspace\r\n");
                let keys = self.storage.len();
                if keys > 0 {
                    out.push_str(&format!(
                        "db0:keys={},expires={}\r\n",
                        keys,
                        self.storage.expiring_len()
                    ));
                }
                out
            }
            _ => String::new(),
        }
    }
}
