//! Replication State and Propagation
//!
//! One [`ReplicationCoordinator`] exists per server process. It owns:
//!
//! - the **role** (master, or replica of some upstream address),
//! - the **replication id**, generated once at startup,
//! - the **replication offset**: on a master, the number of write-command
//!   bytes produced; on a replica, the number of stream bytes consumed,
//! - on a master, the **registry of replicas** that completed `PSYNC`,
//! - on a replica, the current **link state** of the upstream handshake.
//!
//! ## Write Path on a Master
//!
//! ```text
//!   SET (client A) ─┐
//!                   ├─► lock ─► store.set ─► enqueue frame to every replica ─► offset += len ─► unlock
//!   SET (client B) ─┘
//!
//!   replica queue (bounded) ─► replica's connection task ─► socket
//! ```
//!
//! Store mutation, enqueue and offset update happen in one critical section,
//! so every replica sees writes in the order the master applied them. The
//! enqueue never waits: a replica whose queue is full is dropped instead of
//! stalling client commands.

use bytes::Bytes;
use rand::RngCore;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Identifier of a registered replica, unique for the process lifetime.
pub type ReplicaId = u64;

/// Address of the master a replica follows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterAddr {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for MasterAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// The role this server plays in replication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Master,
    Replica(MasterAddr),
}

/// Replica-side handshake and streaming state.
///
/// ```text
/// Disconnected → Connecting → AwaitPong → AwaitReplconfPort → AwaitReplconfCapa
///              → AwaitFullresync → StreamingSnapshot → Streaming
/// ```
///
/// Any failure returns to `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    AwaitPong,
    AwaitReplconfPort,
    AwaitReplconfCapa,
    AwaitFullresync,
    StreamingSnapshot,
    Streaming,
}

/// Tunables for both sides of replication.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Frames a replica may lag behind before it is dropped
    pub replica_queue_capacity: usize,
    /// Delay before a replica retries after losing its master
    pub retry_backoff: Duration,
    /// Upper bound for connecting and for each handshake reply
    pub handshake_timeout: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            replica_queue_capacity: 1024,
            retry_backoff: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

/// Snapshot of a registered replica, for INFO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaInfo {
    pub id: ReplicaId,
    pub addr: SocketAddr,
    pub listening_port: Option<u16>,
    pub offset: u64,
}

/// Receiving end of a replica's propagation queue.
///
/// Owned by the connection task of the replica's socket, which is the only
/// writer to that socket once the stream starts.
#[derive(Debug)]
pub struct ReplicaStream {
    id: ReplicaId,
    receiver: mpsc::Receiver<Bytes>,
    detach: oneshot::Receiver<()>,
    detached: bool,
}

impl ReplicaStream {
    pub fn id(&self) -> ReplicaId {
        self.id
    }

    /// Waits for the next propagated frame.
    ///
    /// Returns `None` once the master has dropped this replica.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.receiver.recv().await
    }

    /// Resolves once the master has removed this replica from its registry,
    /// even while frames are still queued. Cancel safe.
    pub async fn detached(&mut self) {
        if !self.detached {
            let _ = (&mut self.detach).await;
            self.detached = true;
        }
    }
}

#[derive(Debug)]
struct ReplicaHandle {
    addr: SocketAddr,
    listening_port: Option<u16>,
    /// Offset at which this replica joined; no ACKs are processed.
    acked_offset: u64,
    sender: mpsc::Sender<Bytes>,
    detach: oneshot::Sender<()>,
}

impl ReplicaHandle {
    /// Tells the replica's connection task to stop and close its socket.
    fn detach(self) {
        let _ = self.detach.send(());
    }
}

#[derive(Debug, Default)]
struct Backlog {
    offset: u64,
    replicas: HashMap<ReplicaId, ReplicaHandle>,
}

/// Process-wide replication state.
#[derive(Debug)]
pub struct ReplicationCoordinator {
    role: Role,
    replid: String,
    config: ReplicationConfig,
    next_replica_id: AtomicU64,
    backlog: Mutex<Backlog>,
    link: RwLock<LinkState>,
}

impl ReplicationCoordinator {
    /// Creates the replication state with a freshly generated id.
    pub fn new(role: Role, config: ReplicationConfig) -> Self {
        Self {
            role,
            replid: generate_replid(),
            config,
            next_replica_id: AtomicU64::new(1),
            backlog: Mutex::new(Backlog::default()),
            link: RwLock::new(LinkState::Disconnected),
        }
    }

    /// Shorthand for a master with default settings.
    pub fn master() -> Self {
        Self::new(Role::Master, ReplicationConfig::default())
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn is_master(&self) -> bool {
        matches!(self.role, Role::Master)
    }

    pub fn replid(&self) -> &str {
        &self.replid
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Current replication offset.
    pub fn offset(&self) -> u64 {
        self.backlog.lock().unwrap().offset
    }

    /// Runs a keyspace mutation and, on a master, propagates `frame` to every
    /// replica in the same critical section.
    pub fn propagate_write<T>(&self, frame: &Bytes, apply: impl FnOnce() -> T) -> T {
        let mut backlog = self.backlog.lock().unwrap();
        let result = apply();

        if !self.is_master() {
            return result;
        }

        let mut dropped = Vec::new();
        for (id, replica) in backlog.replicas.iter() {
            match replica.sender.try_send(frame.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        replica_id = id,
                        replica = %replica.addr,
                        capacity = self.config.replica_queue_capacity,
                        "Replica queue full, dropping replica"
                    );
                    dropped.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dropped.push(*id),
            }
        }
        for id in dropped {
            if let Some(replica) = backlog.replicas.remove(&id) {
                replica.detach();
            }
        }

        backlog.offset += frame.len() as u64;
        result
    }

    /// Registers a connection that completed `PSYNC` as a replica.
    ///
    /// Returns the queue the connection must drain and the offset the
    /// replica starts from. Every write propagated after this call is
    /// delivered to the new replica.
    pub fn register_replica(
        &self,
        addr: SocketAddr,
        listening_port: Option<u16>,
    ) -> (ReplicaStream, u64) {
        let id = self.next_replica_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.config.replica_queue_capacity.max(1));
        let (detach_tx, detach_rx) = oneshot::channel();

        let mut backlog = self.backlog.lock().unwrap();
        let offset = backlog.offset;
        backlog.replicas.insert(
            id,
            ReplicaHandle {
                addr,
                listening_port,
                acked_offset: offset,
                sender,
                detach: detach_tx,
            },
        );

        info!(replica_id = id, replica = %addr, offset, "Replica registered");
        (
            ReplicaStream {
                id,
                receiver,
                detach: detach_rx,
                detached: false,
            },
            offset,
        )
    }

    /// Removes a replica. Unknown ids are ignored.
    pub fn unregister_replica(&self, id: ReplicaId) {
        let removed = self.backlog.lock().unwrap().replicas.remove(&id);
        if let Some(replica) = removed {
            info!(replica_id = id, replica = %replica.addr, "Replica unregistered");
            replica.detach();
        }
    }

    pub fn replica_count(&self) -> usize {
        self.backlog.lock().unwrap().replicas.len()
    }

    /// Registered replicas ordered by id.
    pub fn replicas(&self) -> Vec<ReplicaInfo> {
        let backlog = self.backlog.lock().unwrap();
        let mut replicas: Vec<ReplicaInfo> = backlog
            .replicas
            .iter()
            .map(|(id, replica)| ReplicaInfo {
                id: *id,
                addr: replica.addr,
                listening_port: replica.listening_port,
                offset: replica.acked_offset,
            })
            .collect();
        replicas.sort_by_key(|replica| replica.id);
        replicas
    }

    pub fn link_state(&self) -> LinkState {
        *self.link.read().unwrap()
    }

    pub fn set_link_state(&self, state: LinkState) {
        let mut link = self.link.write().unwrap();
        if *link != state {
            debug!(from = ?*link, to = ?state, "Replication link state changed");
            *link = state;
        }
    }

    /// Replica side: adopt the offset announced by `+FULLRESYNC`.
    pub fn reset_offset(&self, offset: u64) {
        self.backlog.lock().unwrap().offset = offset;
    }

    /// Replica side: account for `bytes` of replication stream consumed.
    pub fn record_processed(&self, bytes: usize) {
        self.backlog.lock().unwrap().offset += bytes as u64;
    }

    /// Renders the `# Replication` INFO section.
    pub fn info_section(&self) -> String {
        let mut out = String::from("# Replication\r\n");

        match &self.role {
            Role::Master => {
                let replicas = self.replicas();
                out.push_str("role:master\r\n");
                out.push_str(&format!("connected_slaves:{}\r\n", replicas.len()));
                for (index, replica) in replicas.iter().enumerate() {
                    let port = replica.listening_port.unwrap_or(replica.addr.port());
                    out.push_str(&format!(
                        "slave{}:ip={},port={},state=online,offset={}\r\n",
                        index,
                        replica.addr.ip(),
                        port,
                        replica.offset
                    ));
                }
            }
            Role::Replica(master) => {
                let link = if self.link_state() == LinkState::Streaming {
                    "up"
                } else {
                    "down"
                };
                out.push_str("role:slave\r\n");
                out.push_str(&format!("master_host:{}\r\n", master.host));
                out.push_str(&format!("master_port:{}\r\n", master.port));
                out.push_str(&format!("master_link_status:{}\r\n", link));
            }
        }

        out.push_str(&format!("master_replid:{}\r\n", self.replid));
        out.push_str(&format!("master_repl_offset:{}\r\n", self.offset()));
        out
    }
}

/// 40 lowercase hex characters.
fn generate_replid() -> String {
    let mut raw = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut raw);
    hex::encode(raw)
}
