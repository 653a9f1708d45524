//! Replication Module
//!
//! Master/replica replication over the client protocol.
//!
//! ```text
//!            master                                  replica
//! ┌──────────────────────────┐            ┌──────────────────────────┐
//! │ CommandHandler (SET)     │            │ ReplicaSync (worker)     │
//! │        │                 │            │   handshake ─► snapshot  │
//! │        ▼                 │   TCP      │        │                 │
//! │ ReplicationCoordinator ──┼──────────► │        ▼                 │
//! │  per-replica queues      │  stream    │ CommandHandler::apply    │
//! └──────────────────────────┘            └──────────────────────────┘
//! ```
//!
//! - [`coordinator`]: role, replication id, offset, replica registry
//! - [`replica`]: the replica's handshake and streaming worker
//! - [`snapshot`]: the payload sent on full resync

pub mod coordinator;
pub mod replica;
pub mod snapshot;

pub use coordinator::{
    LinkState, MasterAddr, ReplicaId, ReplicaInfo, ReplicaStream, ReplicationConfig,
    ReplicationCoordinator, Role,
};
pub use replica::{sync_with_master, ReplicaError, ReplicaSync};
pub use snapshot::empty_snapshot;
