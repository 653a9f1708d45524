//! Replica Side of Replication
//!
//! A replica keeps one outbound connection to its master. Each attempt walks
//! the handshake, loads the snapshot and then applies the master's write
//! stream until the link breaks, after which the worker waits and retries.
//!
//! ```text
//!  replica                                   master
//!     │ ── PING ───────────────────────────────► │
//!     │ ◄──────────────────────────────── +PONG ─ │
//!     │ ── REPLCONF listening-port <port> ─────► │
//!     │ ◄────────────────────────────────── +OK ─ │
//!     │ ── REPLCONF capa psync2 ───────────────► │
//!     │ ◄────────────────────────────────── +OK ─ │
//!     │ ── PSYNC ? -1 ─────────────────────────► │
//!     │ ◄────────────── +FULLRESYNC <id> <off> ─ │
//!     │ ◄──────────────────── $<len>\r\n<rdb> ── │
//!     │ ◄──────────────── *3 SET k v ... (stream) │
//! ```
//!
//! Every handshake reply is bounded by the handshake timeout; the stream
//! itself may stay idle indefinitely.

use crate::commands::CommandHandler;
use crate::protocol::{Command, ParseError, RespParser, RespValue};
use crate::replication::{LinkState, MasterAddr};
use bytes::{Buf, Bytes, BytesMut};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

/// Initial read buffer for the master link.
const LINK_BUFFER_SIZE: usize = 16 * 1024;

/// Errors that end one attempt to follow the master.
#[derive(Error, Debug)]
pub enum ReplicaError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("unexpected reply to {step}: {got}")]
    UnexpectedReply { step: &'static str, got: String },

    #[error("malformed FULLRESYNC reply: {0}")]
    InvalidFullResync(String),

    #[error("replication stream desynchronized: {0}")]
    Parse(#[from] ParseError),

    #[error("master closed the connection")]
    Disconnected,
}

/// Buffered, framed connection to the master.
struct MasterLink<S> {
    stream: S,
    buffer: BytesMut,
    parser: RespParser,
}

impl<S> MasterLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(LINK_BUFFER_SIZE),
            parser: RespParser::new(),
        }
    }

    async fn send(&mut self, command: &Command) -> Result<(), ReplicaError> {
        self.stream
            .write_all(&command.to_frame().serialize())
            .await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Reads the next complete frame together with its raw bytes.
    ///
    /// Cancel safe: bytes already read stay in the buffer.
    async fn read_frame(&mut self) -> Result<(RespValue, Bytes), ReplicaError> {
        loop {
            if let Some((value, consumed)) = self.parser.parse(&self.buffer)? {
                let raw = self.buffer.split_to(consumed).freeze();
                return Ok((value, raw));
            }
            self.fill().await?;
        }
    }

    async fn read_snapshot(&mut self) -> Result<Bytes, ReplicaError> {
        loop {
            if let Some((payload, consumed)) = self.parser.parse_snapshot(&self.buffer)? {
                self.buffer.advance(consumed);
                return Ok(payload);
            }
            self.fill().await?;
        }
    }

    async fn fill(&mut self) -> Result<(), ReplicaError> {
        let n = self.stream.read_buf(&mut self.buffer).await?;
        if n == 0 {
            return Err(ReplicaError::Disconnected);
        }
        trace!(bytes = n, "Read from master");
        Ok(())
    }

    /// Sends `command` and waits for a simple-string reply.
    async fn request(
        &mut self,
        command: Command,
        step: &'static str,
        limit: Duration,
    ) -> Result<String, ReplicaError> {
        self.send(&command).await?;
        let (reply, _) = bounded(limit, step, self.read_frame()).await?;
        match reply {
            RespValue::SimpleString(text) => Ok(text),
            other => Err(ReplicaError::UnexpectedReply {
                step,
                got: other.to_string(),
            }),
        }
    }
}

async fn bounded<T>(
    limit: Duration,
    step: &'static str,
    fut: impl Future<Output = Result<T, ReplicaError>>,
) -> Result<T, ReplicaError> {
    timeout(limit, fut)
        .await
        .map_err(|_| ReplicaError::Timeout(step))?
}

fn expect_reply(step: &'static str, got: String, expected: &str) -> Result<(), ReplicaError> {
    if got.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(ReplicaError::UnexpectedReply { step, got })
    }
}

/// Parses `FULLRESYNC <replid> <offset>`.
fn parse_fullresync(line: &str) -> Result<(String, u64), ReplicaError> {
    let mut parts = line.split_whitespace();
    let invalid = || ReplicaError::InvalidFullResync(line.to_string());

    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(keyword), Some(replid), Some(offset), None)
            if keyword.eq_ignore_ascii_case("FULLRESYNC") =>
        {
            let offset = offset.parse::<u64>().map_err(|_| invalid())?;
            Ok((replid.to_string(), offset))
        }
        _ => Err(invalid()),
    }
}

/// Runs one replication session over an established connection.
///
/// Performs the handshake, consumes the snapshot and then applies the write
/// stream through `handler`. Returns `Ok(())` only when `shutdown` fires;
/// every other exit is an error and the caller decides whether to retry.
pub async fn sync_with_master<S>(
    stream: S,
    handler: &CommandHandler,
    listening_port: u16,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), ReplicaError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let replication = handler.replication();
    let limit = replication.config().handshake_timeout;
    let mut link = MasterLink::new(stream);

    replication.set_link_state(LinkState::AwaitPong);
    let reply = link.request(Command::Ping, "PING", limit).await?;
    expect_reply("PING", reply, "PONG")?;

    replication.set_link_state(LinkState::AwaitReplconfPort);
    let reply = link
        .request(
            Command::ReplConf {
                kind: "listening-port".to_string(),
                value: Bytes::from(listening_port.to_string()),
            },
            "REPLCONF listening-port",
            limit,
        )
        .await?;
    expect_reply("REPLCONF listening-port", reply, "OK")?;

    replication.set_link_state(LinkState::AwaitReplconfCapa);
    let reply = link
        .request(
            Command::ReplConf {
                kind: "capa".to_string(),
                value: Bytes::from_static(b"psync2"),
            },
            "REPLCONF capa",
            limit,
        )
        .await?;
    expect_reply("REPLCONF capa", reply, "OK")?;

    replication.set_link_state(LinkState::AwaitFullresync);
    let reply = link
        .request(
            Command::Psync {
                replid: "?".to_string(),
                offset: -1,
            },
            "PSYNC",
            limit,
        )
        .await?;
    let (master_replid, offset) = parse_fullresync(&reply)?;
    replication.reset_offset(offset);

    replication.set_link_state(LinkState::StreamingSnapshot);
    let snapshot = bounded(limit, "snapshot", link.read_snapshot()).await?;
    debug!(bytes = snapshot.len(), "Snapshot received");

    replication.set_link_state(LinkState::Streaming);
    info!(master_replid = %master_replid, offset, "Replication stream established");

    loop {
        tokio::select! {
            frame = link.read_frame() => {
                let (value, raw) = frame?;
                match Command::from_frame(value) {
                    Ok(command) => handler.apply(command, &raw),
                    Err(e) => warn!(error = %e, "Skipping malformed replicated command"),
                }
                replication.record_processed(raw.len());
            }
            result = shutdown.changed() => {
                if result.is_err() || *shutdown.borrow() {
                    debug!("Replication stream stopped by shutdown");
                    return Ok(());
                }
            }
        }
    }
}

/// Handle to the background task following a master.
///
/// When this handle is dropped, the task is stopped.
#[derive(Debug)]
pub struct ReplicaSync {
    shutdown_tx: watch::Sender<bool>,
}

impl ReplicaSync {
    /// Starts following `master` in a background task.
    ///
    /// `listening_port` is the port this server accepts clients on and is
    /// announced during the handshake. Must be called from within a Tokio
    /// runtime.
    pub fn start(handler: CommandHandler, master: MasterAddr, listening_port: u16) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(master = %master, "Replication worker started");
        tokio::spawn(sync_loop(handler, master, listening_port, shutdown_rx));

        Self { shutdown_tx }
    }

    /// Stops the worker. Called automatically on drop.
    pub fn stop(&self) {
        if !*self.shutdown_tx.borrow() {
            let _ = self.shutdown_tx.send(true);
            debug!("Replication worker stopped");
        }
    }
}

impl Drop for ReplicaSync {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn sync_loop(
    handler: CommandHandler,
    master: MasterAddr,
    listening_port: u16,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let replication = handler.replication().clone();
    let backoff = replication.config().retry_backoff;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let result = connect_and_sync(&handler, &master, listening_port, &mut shutdown_rx).await;
        replication.set_link_state(LinkState::Disconnected);

        match result {
            Ok(()) => break,
            Err(e) => warn!(
                master = %master,
                error = %e,
                retry_ms = backoff.as_millis() as u64,
                "Replication link lost"
            ),
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    trace!("Replication worker exiting");
}

async fn connect_and_sync(
    handler: &CommandHandler,
    master: &MasterAddr,
    listening_port: u16,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), ReplicaError> {
    let replication = handler.replication();
    replication.set_link_state(LinkState::Connecting);
    debug!(master = %master, "Connecting to master");

    let stream = bounded(replication.config().handshake_timeout, "connect", async {
        Ok::<_, ReplicaError>(TcpStream::connect((master.host.as_str(), master.port)).await?)
    })
    .await?;
    stream.set_nodelay(true)?;

    sync_with_master(stream, handler, listening_port, shutdown).await
}
