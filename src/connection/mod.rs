//! Connection Handler Module
//!
//! This module manages individual client connections. Each connection is
//! handled by its own async task.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     TCP Listener                            │
//! │                    (server.rs)                              │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │ accept()
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 ConnectionHandler                           │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐      │
//! │  │ Read bytes  │───>│ Parse RESP  │───>│ Execute cmd │      │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘      │
//! │                                               │             │
//! │                        ┌──────────────────────┴──────┐      │
//! │                        ▼                             ▼      │
//! │                 ┌─────────────┐           ┌──────────────┐  │
//! │                 │ Send reply  │           │ Replica feed │  │
//! │                 └─────────────┘           └──────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Pipelining**: several requests in one TCP packet are answered in order
//! - **Replica streams**: a connection that sends `PSYNC` becomes a push-only
//!   feed of the master's writes
//! - **Graceful shutdown**: every connection watches the server's shutdown signal
//! - **Statistics**: connection, command and byte counters

pub mod handler;

pub use handler::{handle_connection, ConnectionError, ConnectionHandler, ConnectionStats};
