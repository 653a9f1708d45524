//! TCP Server
//!
//! Owns the listener and the process-wide state, accepts connections and
//! starts the background tasks the configured role needs:
//!
//! - the expiry reaper, always,
//! - the replication worker, when following a master.
//!
//! Shutdown stops accepting, signals every connection through a `watch`
//! channel and waits for the connection tasks to finish.

use crate::commands::CommandHandler;
use crate::config::ServerConfig;
use crate::connection::{handle_connection, ConnectionStats};
use crate::replication::{ReplicaSync, ReplicationCoordinator, Role};
use crate::storage::{ExpirySweeper, StorageEngine};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

pub struct Server {
    listener: TcpListener,
    config: ServerConfig,
    handler: CommandHandler,
    stats: Arc<ConnectionStats>,
}

impl Server {
    /// Binds the listener and builds the shared state. Nothing runs until
    /// [`Server::run_until`] is called.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let addr = config.bind_address();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;

        let storage = Arc::new(StorageEngine::new());
        let replication = Arc::new(ReplicationCoordinator::new(
            config.role.clone(),
            config.replication.clone(),
        ));
        let stats = Arc::new(ConnectionStats::new());
        let handler = CommandHandler::new(storage, replication).with_stats(Arc::clone(&stats));

        info!(addr = %addr, role = ?config.role, "Listening");

        Ok(Self {
            listener,
            config,
            handler,
            stats,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handler(&self) -> &CommandHandler {
        &self.handler
    }

    pub fn storage(&self) -> &Arc<StorageEngine> {
        self.handler.storage()
    }

    pub fn replication(&self) -> &Arc<ReplicationCoordinator> {
        self.handler.replication()
    }

    /// Serves clients until `shutdown` completes.
    pub async fn run_until<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            config,
            handler,
            stats,
        } = self;
        let local_addr = listener.local_addr()?;

        let sweeper = ExpirySweeper::start(Arc::clone(handler.storage()), config.expiry.clone());
        let replica_sync = match &config.role {
            Role::Master => None,
            Role::Replica(master) => Some(ReplicaSync::start(
                handler.clone(),
                master.clone(),
                local_addr.port(),
            )),
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut workers = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        spawn_connection(&mut workers, stream, addr, &handler, &stats, &shutdown_rx);
                    }
                    Err(e) => error!(error = %e, "Failed to accept connection"),
                },
            }

            while workers.try_join_next().is_some() {}
        }

        info!(connections = workers.len(), "Shutting down");
        drop(listener);
        let _ = shutdown_tx.send(true);
        if let Some(replica_sync) = replica_sync {
            replica_sync.stop();
        }

        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Connection task failed");
            }
        }
        sweeper.stop();

        info!("Server shutdown complete");
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> anyhow::Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
            info!("Shutdown signal received");
        })
        .await
    }
}

fn spawn_connection(
    workers: &mut JoinSet<()>,
    stream: TcpStream,
    addr: SocketAddr,
    handler: &CommandHandler,
    stats: &Arc<ConnectionStats>,
    shutdown: &watch::Receiver<bool>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(client = %addr, error = %e, "Failed to set TCP_NODELAY");
    }
    workers.spawn(handle_connection(
        stream,
        addr,
        handler.clone(),
        Arc::clone(stats),
        shutdown.clone(),
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Command, RespParser, RespValue};
    use crate::replication::{LinkState, MasterAddr, ReplicationConfig};
    use bytes::{Buf, Bytes, BytesMut};
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    fn local_config(role: Role) -> ServerConfig {
        ServerConfig {
            port: 0,
            role,
            replication: ReplicationConfig {
                retry_backoff: Duration::from_millis(100),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    struct Running {
        addr: SocketAddr,
        handler: CommandHandler,
        stop: oneshot::Sender<()>,
        task: JoinHandle<anyhow::Result<()>>,
    }

    async fn start(config: ServerConfig) -> Running {
        let server = Server::bind(config).await.unwrap();
        let addr = server.local_addr().unwrap();
        let handler = server.handler().clone();
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run_until(async {
            let _ = stopped.await;
        }));
        Running {
            addr,
            handler,
            stop,
            task,
        }
    }

    async fn request(client: &mut TcpStream, frame: &[u8]) -> Vec<u8> {
        client.write_all(frame).await.unwrap();
        let mut buf = vec![0u8; 4096];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        buf.truncate(n);
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

    /// Sends PSYNC on a raw socket and consumes FULLRESYNC plus the snapshot.
    async fn attach_raw_replica(master: &Running) -> TcpStream {
        let mut replica = TcpStream::connect(master.addr).await.unwrap();
        replica
            .write_all(b"*3\r\n$5\r\nPSYNC\r\n$1\r\n?\r\n$2\r\n-1\r\n")
            .await
            .unwrap();

        let replid = master.handler.replication().replid().to_string();
        let header = format!("+FULLRESYNC {} 0\r\n$88\r\n", replid);
        let mut reply = vec![0u8; header.len() + 88];
        tokio::time::timeout(Duration::from_secs(2), replica.read_exact(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&reply[..header.len()], header.as_bytes());
        replica
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let result = Server::bind(ServerConfig {
            port,
            ..Default::default()
        })
        .await;

        assert!(matches!(result, Err(ServerError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_shutdown_with_connected_client() {
        let server = start(local_config(Role::Master)).await;

        let mut client = TcpStream::connect(server.addr).await.unwrap();
        assert_eq!(request(&mut client, b"*1\r\n$4\r\nPING\r\n").await, b"+PONG\r\n");

        server.stop.send(()).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), server.task)
            .await
            .expect("server did not stop")
            .unwrap();
        assert!(result.is_ok());

        let mut rest = Vec::new();
        assert_eq!(client.read_to_end(&mut rest).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_raw_replication_handshake() {
        let master = start(local_config(Role::Master)).await;
        let replid = master.handler.replication().replid().to_string();

        let mut replica = TcpStream::connect(master.addr).await.unwrap();
        assert_eq!(request(&mut replica, b"*1\r\n$4\r\nPING\r\n").await, b"+PONG\r\n");
        assert_eq!(
            request(
                &mut replica,
                b"*3\r\n$8\r\nREPLCONF\r\n$14\r\nlistening-port\r\n$4\r\n6380\r\n"
            )
            .await,
            b"+OK\r\n"
        );
        assert_eq!(
            request(&mut replica, b"*3\r\n$8\r\nREPLCONF\r\n$4\r\ncapa\r\n$6\r\npsync2\r\n").await,
            b"+OK\r\n"
        );

        replica
            .write_all(b"*3\r\n$5\r\nPSYNC\r\n$1\r\n?\r\n$2\r\n-1\r\n")
            .await
            .unwrap();
        let header = format!("+FULLRESYNC {} 0\r\n$88\r\n", replid);
        let mut reply = vec![0u8; header.len() + 88];
        tokio::time::timeout(Duration::from_secs(2), replica.read_exact(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&reply[..header.len()], header.as_bytes());
        assert!(reply[header.len()..].starts_with(b"REDIS"));

        assert_eq!(master.handler.replication().replica_count(), 1);
        let _ = master.stop.send(());
    }

    #[tokio::test]
    async fn test_master_to_replica_end_to_end() {
        let master = start(local_config(Role::Master)).await;
        let replica = start(local_config(Role::Replica(MasterAddr {
            host: "127.0.0.1".to_string(),
            port: master.addr.port(),
        })))
        .await;

        let replication = Arc::clone(replica.handler.replication());
        assert!(wait_for(|| replication.link_state() == LinkState::Streaming).await);
        assert_eq!(master.handler.replication().replica_count(), 1);

        let mut client = TcpStream::connect(master.addr).await.unwrap();
        let set = b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n";
        assert_eq!(request(&mut client, set).await, b"+OK\r\n");
        assert_eq!(
            request(
                &mut client,
                b"*5\r\n$3\r\nSET\r\n$3\r\ntmp\r\n$1\r\nx\r\n$2\r\nPX\r\n$2\r\n50\r\n"
            )
            .await,
            b"+OK\r\n"
        );

        let storage = Arc::clone(replica.handler.storage());
        assert!(wait_for(|| storage.get(&Bytes::from("foo")) == Some(Bytes::from("bar"))).await);

        // The replica applies the TTL too.
        assert!(wait_for(|| storage.get(&Bytes::from("tmp")).is_none()).await);

        let master_offset = master.handler.replication().offset();
        assert!(master_offset > 0);
        assert!(wait_for(|| replication.offset() == master_offset).await);

        // Clients of the replica read the replicated value.
        let mut reader = TcpStream::connect(replica.addr).await.unwrap();
        assert_eq!(
            request(&mut reader, b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n").await,
            b"$3\r\nbar\r\n"
        );

        let info = request(&mut reader, b"*2\r\n$4\r\nINFO\r\n$11\r\nreplication\r\n").await;
        let info = String::from_utf8_lossy(&info);
        assert!(info.contains("role:slave"));
        assert!(info.contains("master_link_status:up"));

        let _ = replica.stop.send(());
        let _ = master.stop.send(());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_reach_replica_whole_and_in_order() {
        const CLIENTS: usize = 8;
        const WRITES: usize = 60;

        let master = start(local_config(Role::Master)).await;
        let mut replica = attach_raw_replica(&master).await;

        let mut writers = JoinSet::new();
        for c in 0..CLIENTS {
            let addr = master.addr;
            writers.spawn(async move {
                let mut client = TcpStream::connect(addr).await.unwrap();
                let key = format!("client:{}", c);
                for i in 0..WRITES {
                    // Values of varying size, some spanning several packets.
                    let value = format!("{}:{}", i, "v".repeat((i * 397) % 5000));
                    let set = RespValue::command([
                        Bytes::from_static(b"SET"),
                        Bytes::from(key.clone()),
                        Bytes::from(value),
                    ]);
                    client.write_all(&set.serialize()).await.unwrap();

                    let mut reply = [0u8; 5];
                    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut reply))
                        .await
                        .unwrap()
                        .unwrap();
                    assert_eq!(&reply, b"+OK\r\n");
                }
            });
        }

        let mut parser = RespParser::new();
        let mut buffer = BytesMut::new();
        let mut stream_bytes = 0usize;
        let mut applied: HashMap<Bytes, Vec<usize>> = HashMap::new();
        let mut final_values: HashMap<Bytes, Bytes> = HashMap::new();
        let mut frames = 0;

        while frames < CLIENTS * WRITES {
            while let Some((frame, consumed)) = parser.parse(&buffer).unwrap() {
                buffer.advance(consumed);
                stream_bytes += consumed;
                frames += 1;

                match Command::from_frame(frame).unwrap() {
                    Command::Set { key, value, ttl_ms } => {
                        assert_eq!(ttl_ms, None);
                        let seq = std::str::from_utf8(&value)
                            .unwrap()
                            .split(':')
                            .next()
                            .unwrap()
                            .parse::<usize>()
                            .unwrap();
                        applied.entry(key.clone()).or_default().push(seq);
                        final_values.insert(key, value);
                    }
                    other => panic!("unexpected command in replication stream: {:?}", other),
                }
            }
            if frames == CLIENTS * WRITES {
                break;
            }

            let n = tokio::time::timeout(Duration::from_secs(5), replica.read_buf(&mut buffer))
                .await
                .expect("replication stream stalled")
                .unwrap();
            assert!(n > 0, "master closed the replication stream");
        }

        while let Some(result) = writers.join_next().await {
            result.unwrap();
        }

        // Nothing beyond the writes, each client's writes in issue order.
        assert!(buffer.is_empty());
        assert_eq!(frames, CLIENTS * WRITES);
        assert_eq!(applied.len(), CLIENTS);
        for seqs in applied.values() {
            assert_eq!(*seqs, (0..WRITES).collect::<Vec<_>>());
        }

        // Replaying the stream reproduces the master's keyspace and offset.
        let storage = master.handler.storage();
        for (key, value) in &final_values {
            assert_eq!(storage.get(key).as_ref(), Some(value));
        }
        assert_eq!(master.handler.replication().offset(), stream_bytes as u64);

        let _ = master.stop.send(());
    }

    #[tokio::test]
    async fn test_shutdown_completes_with_stalled_replica() {
        let master = start(local_config(Role::Master)).await;
        let _replica = attach_raw_replica(&master).await;

        let set = RespValue::command([
            Bytes::from_static(b"SET"),
            Bytes::from_static(b"big"),
            Bytes::from(vec![b'x'; 1024 * 1024]),
        ])
        .serialize();

        let mut client = TcpStream::connect(master.addr).await.unwrap();
        for _ in 0..24 {
            client.write_all(&set).await.unwrap();
            let mut reply = [0u8; 5];
            tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut reply))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&reply, b"+OK\r\n");
        }
        assert_eq!(master.handler.replication().replica_count(), 1);

        master.stop.send(()).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(3), master.task)
            .await
            .expect("server did not stop with a stalled replica")
            .unwrap();
        assert!(result.is_ok());
    }
}
