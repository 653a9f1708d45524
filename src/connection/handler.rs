//! Connection Handler Module
//!
//! Each accepted socket gets its own handler task that reads requests and
//! writes replies until the client leaves or the server shuts down.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! 1. Client connects (TCP handshake)
//!        │
//!        ▼
//! 2. ConnectionHandler spawned
//!        │
//!        ▼
//! 3. ┌──────────────────────────────┐
//!    │      Request Loop            │
//!    │                              │
//!    │  Read bytes ─► Parse frame   │
//!    │       ▲            │         │
//!    │       │            ▼         │
//!    │  Send reply ◄─ Execute       │
//!    └──────────────┬───────────────┘
//!                   │ PSYNC
//!                   ▼
//! 4. ┌──────────────────────────────┐
//!    │   Replica Stream (optional)  │
//!    │  queue ─► socket, no replies │
//!    └──────────────────────────────┘
//!        │
//!        ▼
//! 5. Client disconnects / protocol error / shutdown
//! ```
//!
//! ## Buffer Management
//!
//! Incoming bytes accumulate in a `BytesMut`. TCP may deliver half a frame
//! or several frames at once; frames are split off the front as soon as they
//! are complete and answered in arrival order.

use crate::commands::{ClientContext, CommandHandler, Outcome};
use crate::protocol::{ParseError, RespParser, RespValue};
use crate::replication::ReplicaStream;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

/// A single request larger than this closes the connection (64 MB).
const MAX_BUFFER_SIZE: usize = 64 * 1024 * 1024;

/// Initial buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Statistics for connection handling
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub active_connections: AtomicU64,
    /// Total commands processed
    pub commands_processed: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn command_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written
            .fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Handles a single client connection.
pub struct ConnectionHandler {
    /// The TCP stream for this connection
    stream: BufWriter<TcpStream>,

    /// Client's address (for logging)
    addr: SocketAddr,

    /// Buffer for incoming data
    buffer: BytesMut,

    /// The command handler (shared across connections)
    command_handler: CommandHandler,

    /// RESP parser
    parser: RespParser,

    /// State commands keep per connection (REPLCONF data)
    context: ClientContext,

    /// Connection statistics (shared)
    stats: Arc<ConnectionStats>,
}

impl ConnectionHandler {
    /// Creates a new connection handler.
    ///
    /// # Arguments
    ///
    /// * `stream` - The TCP stream for this connection
    /// * `addr` - The client's socket address
    /// * `command_handler` - The command handler for executing commands
    /// * `stats` - Shared connection statistics
    pub fn new(
        stream: TcpStream,
        addr: SocketAddr,
        command_handler: CommandHandler,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        stats.connection_opened();

        Self {
            stream: BufWriter::new(stream),
            addr,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            command_handler,
            parser: RespParser::new(),
            context: ClientContext::new(addr),
            stats,
        }
    }

    /// Runs the connection until the client leaves, a protocol error
    /// occurs, or `shutdown` fires.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), ConnectionError> {
        info!(client = %self.addr, "Client connected");

        let result = self.main_loop(&mut shutdown).await;

        match &result {
            Ok(()) => info!(client = %self.addr, "Client disconnected gracefully"),
            Err(e) => match e {
                ConnectionError::ClientDisconnected => {
                    debug!(client = %self.addr, "Client disconnected")
                }
                ConnectionError::IoError(io_err)
                    if io_err.kind() == std::io::ErrorKind::ConnectionReset =>
                {
                    debug!(client = %self.addr, "Connection reset by client")
                }
                _ => warn!(client = %self.addr, error = %e, "Connection error"),
            },
        }

        self.stats.connection_closed();
        result
    }

    /// The main read-execute-respond loop.
    async fn main_loop(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), ConnectionError> {
        loop {
            while let Some((frame, raw)) = self.next_frame().await? {
                self.stats.command_processed();

                match self
                    .command_handler
                    .execute(frame, &raw, &mut self.context)
                {
                    Outcome::Reply(response) => self.send_response(&response).await?,
                    Outcome::FullResync { replies, stream } => {
                        for reply in &replies {
                            self.send_response(reply).await?;
                        }
                        return self.stream_to_replica(stream, shutdown).await;
                    }
                }
            }

            if *shutdown.borrow() {
                return Ok(());
            }

            tokio::select! {
                result = self.read_more_data() => result?,
                _ = shutdown.changed() => {
                    debug!(client = %self.addr, "Closing connection for shutdown");
                    return Ok(());
                }
            }
        }
    }

    /// Splits the next complete frame off the buffer.
    ///
    /// A malformed frame is answered with a protocol error, after which the
    /// connection is closed since the stream can no longer be framed.
    async fn next_frame(&mut self) -> Result<Option<(RespValue, Bytes)>, ConnectionError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        match self.parser.parse(&self.buffer) {
            Ok(Some((value, consumed))) => {
                let raw = self.buffer.split_to(consumed).freeze();
                trace!(
                    client = %self.addr,
                    consumed = consumed,
                    remaining = self.buffer.len(),
                    "Parsed command"
                );
                Ok(Some((value, raw)))
            }
            Ok(None) => {
                trace!(
                    client = %self.addr,
                    buffered = self.buffer.len(),
                    "Incomplete command, need more data"
                );
                Ok(None)
            }
            Err(e) => {
                warn!(client = %self.addr, error = %e, "Parse error");
                let reply = RespValue::error(format!("ERR Protocol error: {}", e));
                self.send_response(&reply).await?;
                Err(ConnectionError::ParseError(e))
            }
        }
    }

    /// Reads more data from the socket into the buffer.
    async fn read_more_data(&mut self) -> Result<(), ConnectionError> {
        if self.buffer.len() >= MAX_BUFFER_SIZE {
            error!(
                client = %self.addr,
                size = self.buffer.len(),
                "Buffer size limit exceeded"
            );
            return Err(ConnectionError::BufferFull);
        }

        if self.buffer.capacity() - self.buffer.len() < 1024 {
            self.buffer.reserve(4096);
        }

        let n = self.stream.get_mut().read_buf(&mut self.buffer).await?;

        if n == 0 {
            if self.buffer.is_empty() {
                return Err(ConnectionError::ClientDisconnected);
            } else {
                return Err(ConnectionError::UnexpectedEof);
            }
        }

        self.stats.bytes_read(n);
        trace!(client = %self.addr, bytes = n, "Read data");

        Ok(())
    }

    /// Sends a response to the client.
    async fn send_response(&mut self, response: &RespValue) -> Result<(), ConnectionError> {
        let bytes = response.serialize();
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        self.stats.bytes_written(bytes.len());
        trace!(
            client = %self.addr,
            bytes = bytes.len(),
            "Sent response"
        );
        Ok(())
    }

    /// Serves this connection as a replica: forwards every propagated frame
    /// and ignores whatever the replica sends back.
    async fn stream_to_replica(
        &mut self,
        mut replica: ReplicaStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), ConnectionError> {
        let replica_id = replica.id();
        info!(client = %self.addr, replica_id, "Connection is now a replication stream");

        let result = self.forward_frames(&mut replica, shutdown).await;

        self.command_handler
            .replication()
            .unregister_replica(replica_id);
        result
    }

    async fn forward_frames(
        &mut self,
        replica: &mut ReplicaStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), ConnectionError> {
        let mut discard = [0u8; 1024];
        let (mut reader, mut writer) = self.stream.get_mut().split();

        loop {
            tokio::select! {
                frame = replica.recv() => match frame {
                    // A replica that stops reading blocks the write, so the
                    // drop and shutdown signals must stay live while it runs.
                    Some(frame) => tokio::select! {
                        written = writer.write_all(&frame) => {
                            written?;
                            self.stats.bytes_written(frame.len());
                        }
                        _ = replica.detached() => {
                            warn!(client = %self.addr, "Replica dropped by master, closing");
                            return Ok(());
                        }
                        _ = shutdown.changed() => return Ok(()),
                    },
                    None => {
                        warn!(client = %self.addr, "Replica dropped by master");
                        return Ok(());
                    }
                },
                read = reader.read(&mut discard) => {
                    let n = read?;
                    if n == 0 {
                        return Err(ConnectionError::ClientDisconnected);
                    }
                    self.stats.bytes_read(n);
                    trace!(client = %self.addr, bytes = n, "Ignoring data from replica");
                }
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }
}

/// Errors that can occur while handling a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// RESP parse error
    #[error("Parse error: {0}")]
    ParseError(#[from] ParseError),

    /// Client disconnected normally
    #[error("Client disconnected")]
    ClientDisconnected,

    /// Unexpected end of stream (partial command)
    #[error("Unexpected end of stream")]
    UnexpectedEof,

    /// Buffer size limit exceeded
    #[error("Buffer size limit exceeded")]
    BufferFull,
}

/// Creates a [`ConnectionHandler`] and runs it to completion.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    command_handler: CommandHandler,
    stats: Arc<ConnectionStats>,
    shutdown: watch::Receiver<bool>,
) {
    let handler = ConnectionHandler::new(stream, addr, command_handler, stats);
    if let Err(e) = handler.run(shutdown).await {
        match e {
            ConnectionError::ClientDisconnected => {}
            ConnectionError::IoError(ref io_err)
                if io_err.kind() == std::io::ErrorKind::ConnectionReset => {}
            _ => {
                debug!(client = %addr, error = %e, "Connection ended with error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::{ReplicationConfig, ReplicationCoordinator, Role};
    use crate::storage::StorageEngine;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct TestServer {
        addr: SocketAddr,
        handler: CommandHandler,
        stats: Arc<ConnectionStats>,
        shutdown_tx: watch::Sender<bool>,
    }

    async fn create_test_server() -> TestServer {
        create_test_server_with(ReplicationCoordinator::master()).await
    }

    async fn create_test_server_with(replication: ReplicationCoordinator) -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stats = Arc::new(ConnectionStats::new());
        let handler = CommandHandler::new(
            Arc::new(StorageEngine::new()),
            Arc::new(replication),
        )
        .with_stats(Arc::clone(&stats));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let accept_handler = handler.clone();
        let accept_stats = Arc::clone(&stats);
        tokio::spawn(async move {
            while let Ok((stream, client_addr)) = listener.accept().await {
                tokio::spawn(handle_connection(
                    stream,
                    client_addr,
                    accept_handler.clone(),
                    Arc::clone(&accept_stats),
                    shutdown_rx.clone(),
                ));
            }
        });

        TestServer {
            addr,
            handler,
            stats,
            shutdown_tx,
        }
    }

    async fn read_exactly(client: &mut TcpStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut buf))
            .await
            .expect("timed out waiting for reply")
            .unwrap();
        buf
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    /// Connects and sends PSYNC, consuming FULLRESYNC and the snapshot.
    async fn attach_replica(server: &TestServer) -> TcpStream {
        let mut replica = TcpStream::connect(server.addr).await.unwrap();
        replica
            .write_all(b"*3\r\n$5\r\nPSYNC\r\n$1\r\n?\r\n$2\r\n-1\r\n")
            .await
            .unwrap();

        let replid = server.handler.replication().replid().to_string();
        let header = format!("+FULLRESYNC {} 0\r\n$88\r\n", replid);
        let reply = read_exactly(&mut replica, header.len() + 88).await;
        assert_eq!(&reply[..header.len()], header.as_bytes());

        let replication = Arc::clone(server.handler.replication());
        assert!(wait_for(|| replication.replica_count() == 1).await);
        replica
    }

    fn big_set(key: &str, size: usize) -> Vec<u8> {
        let mut frame =
            format!("*3\r\n$3\r\nSET\r\n${}\r\n{}\r\n${}\r\n", key.len(), key, size).into_bytes();
        frame.resize(frame.len() + size, b'x');
        frame.extend_from_slice(b"\r\n");
        frame
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let server = create_test_server().await;

        let mut client = TcpStream::connect(server.addr).await.unwrap();
        client.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();

        assert_eq!(read_exactly(&mut client, 7).await, b"+PONG\r\n");
    }

    #[tokio::test]
    async fn test_set_get() {
        let server = create_test_server().await;

        let mut client = TcpStream::connect(server.addr).await.unwrap();

        client
            .write_all(b"*3\r\n$3\r\nSET\r\n$4\r\nname\r\n$4\r\nAriz\r\n")
            .await
            .unwrap();
        assert_eq!(read_exactly(&mut client, 5).await, b"+OK\r\n");

        client
            .write_all(b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n")
            .await
            .unwrap();
        assert_eq!(read_exactly(&mut client, 10).await, b"$4\r\nAriz\r\n");

        client
            .write_all(b"*2\r\n$3\r\nGET\r\n$7\r\nmissing\r\n")
            .await
            .unwrap();
        assert_eq!(read_exactly(&mut client, 5).await, b"$-1\r\n");
    }

    #[tokio::test]
    async fn test_pipelined_commands_answered_in_order() {
        let server = create_test_server().await;

        let mut client = TcpStream::connect(server.addr).await.unwrap();
        client
            .write_all(b"*3\r\n$3\r\nSET\r\n$2\r\nk1\r\n$2\r\nv1\r\n*3\r\n$3\r\nSET\r\n$2\r\nk2\r\n$2\r\nv2\r\n*2\r\n$3\r\nGET\r\n$2\r\nk1\r\n*2\r\n$3\r\nGET\r\n$2\r\nk2\r\n")
            .await
            .unwrap();

        let expected = b"+OK\r\n+OK\r\n$2\r\nv1\r\n$2\r\nv2\r\n";
        assert_eq!(read_exactly(&mut client, expected.len()).await, expected);
    }

    #[tokio::test]
    async fn test_frame_split_across_writes() {
        let server = create_test_server().await;

        let mut client = TcpStream::connect(server.addr).await.unwrap();
        client.write_all(b"*2\r\n$4\r\nEC").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.write_all(b"HO\r\n$5\r\nhel").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.write_all(b"lo\r\n").await.unwrap();

        assert_eq!(read_exactly(&mut client, 11).await, b"$5\r\nhello\r\n");
    }

    #[tokio::test]
    async fn test_command_error_keeps_connection_open() {
        let server = create_test_server().await;

        let mut client = TcpStream::connect(server.addr).await.unwrap();
        client.write_all(b"*1\r\n$4\r\nFROB\r\n").await.unwrap();

        let expected = b"-ERR unknown command 'FROB'\r\n";
        assert_eq!(read_exactly(&mut client, expected.len()).await, expected);

        client.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
        assert_eq!(read_exactly(&mut client, 7).await, b"+PONG\r\n");
    }

    #[tokio::test]
    async fn test_protocol_error_closes_connection() {
        let server = create_test_server().await;

        let mut client = TcpStream::connect(server.addr).await.unwrap();
        client.write_all(b"?what\r\n").await.unwrap();

        let mut reply = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut reply))
            .await
            .unwrap()
            .unwrap();

        assert!(reply.starts_with(b"-ERR Protocol error"));
        assert!(reply.ends_with(b"\r\n"));
    }

    #[tokio::test]
    async fn test_psync_turns_connection_into_stream() {
        let server = create_test_server().await;
        let replid = server.handler.replication().replid().to_string();

        let mut replica = TcpStream::connect(server.addr).await.unwrap();
        replica
            .write_all(b"*3\r\n$8\r\nREPLCONF\r\n$14\r\nlistening-port\r\n$4\r\n6380\r\n")
            .await
            .unwrap();
        assert_eq!(read_exactly(&mut replica, 5).await, b"+OK\r\n");

        replica
            .write_all(b"*3\r\n$5\r\nPSYNC\r\n$1\r\n?\r\n$2\r\n-1\r\n")
            .await
            .unwrap();

        let line = format!("+FULLRESYNC {} 0\r\n", replid);
        assert_eq!(read_exactly(&mut replica, line.len()).await, line.as_bytes());
        assert_eq!(read_exactly(&mut replica, 5).await, b"$88\r\n");
        let snapshot = read_exactly(&mut replica, 88).await;
        assert!(snapshot.starts_with(b"REDIS"));

        // A write from another client is forwarded verbatim.
        let set = b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n";
        let mut client = TcpStream::connect(server.addr).await.unwrap();
        client.write_all(set).await.unwrap();
        assert_eq!(read_exactly(&mut client, 5).await, b"+OK\r\n");

        assert_eq!(read_exactly(&mut replica, set.len()).await, set);

        // Closing the replica socket unregisters it.
        drop(replica);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.handler.replication().replica_count(), 0);
    }

    #[tokio::test]
    async fn test_replica_that_stops_reading_is_disconnected() {
        let server = create_test_server_with(ReplicationCoordinator::new(
            Role::Master,
            ReplicationConfig {
                replica_queue_capacity: 4,
                ..Default::default()
            },
        ))
        .await;
        let mut replica = attach_replica(&server).await;

        // The replica reads nothing from here on. Once the socket buffers
        // and its queue are full, the next write drops it.
        let mut client = TcpStream::connect(server.addr).await.unwrap();
        let set = big_set("big", 1024 * 1024);
        let mut writes = 0;
        while server.handler.replication().replica_count() > 0 {
            assert!(writes < 256, "replica was never dropped");
            client.write_all(&set).await.unwrap();
            assert_eq!(read_exactly(&mut client, 5).await, b"+OK\r\n");
            writes += 1;
        }

        // Only the writing client is still connected.
        let stats = Arc::clone(&server.stats);
        assert!(wait_for(|| stats.active_connections.load(Ordering::Relaxed) == 1).await);

        // The replica receives what was already flushed, then end-of-stream.
        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), replica.read_to_end(&mut rest))
            .await
            .expect("replica socket was not closed")
            .unwrap();

        client.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
        assert_eq!(read_exactly(&mut client, 7).await, b"+PONG\r\n");
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_blocked_replica_write() {
        let server = create_test_server().await;
        let _replica = attach_replica(&server).await;

        // Far more than the socket buffers hold, well under the queue limit.
        let mut client = TcpStream::connect(server.addr).await.unwrap();
        let set = big_set("big", 1024 * 1024);
        for _ in 0..24 {
            client.write_all(&set).await.unwrap();
            assert_eq!(read_exactly(&mut client, 5).await, b"+OK\r\n");
        }
        assert_eq!(server.handler.replication().replica_count(), 1);

        server.shutdown_tx.send(true).unwrap();

        let stats = Arc::clone(&server.stats);
        assert!(wait_for(|| stats.active_connections.load(Ordering::Relaxed) == 0).await);
        assert_eq!(server.handler.replication().replica_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_idle_connection() {
        let server = create_test_server().await;

        let mut client = TcpStream::connect(server.addr).await.unwrap();
        client.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
        assert_eq!(read_exactly(&mut client, 7).await, b"+PONG\r\n");

        server.shutdown_tx.send(true).unwrap();

        let mut rest = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_connection_stats() {
        let server = create_test_server().await;
        let stats = &server.stats;

        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);

        let mut client = TcpStream::connect(server.addr).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 1);
        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 1);

        client.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
        let _ = read_exactly(&mut client, 7).await;

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(stats.commands_processed.load(Ordering::Relaxed) >= 1);
        assert!(stats.bytes_read.load(Ordering::Relaxed) > 0);
        assert!(stats.bytes_written.load(Ordering::Relaxed) > 0);

        drop(client);

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);
    }
}
