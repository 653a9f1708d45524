//! Command Handler Module
//!
//! This module sits between the protocol layer and the storage engine.
//!
//! ```text
//! Client Request / Replication Stream
//!       │
//!       ▼
//! ┌─────────────────┐
//! │  RESP Parser    │  (protocol module)
//! └────────┬────────┘
//!          │ Command
//!          ▼
//! ┌─────────────────┐
//! │ CommandHandler  │  (this module)
//! │                 │
//! │  - Dispatch     │
//! │  - Execute      │
//! │  - Propagate    │
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐      ┌────────────────────────┐
//! │ StorageEngine   │      │ ReplicationCoordinator │
//! └─────────────────┘      └────────────────────────┘
//! ```

pub mod handler;

pub use handler::{ClientContext, CommandHandler, Outcome};
