//! Snapshot payload sent during a full resync.
//!
//! The payload is opaque to both sides: the master always sends an empty RDB
//! file and the replica only checks that the declared number of bytes
//! arrives. It does not reflect the master's keyspace.

use bytes::Bytes;

/// An RDB file (version 11) describing an empty dataset.
const EMPTY_RDB_HEX: &str = "524544495330303131fa0972656469732d76657205372e322e30fa0a72656469732d62697473c040fa056374696d65c26d08bc65fa08757365642d6d656dc2b0c41000fa08616f662d62617365c000fff06e3bfec0ff5aa2";

/// Returns the placeholder snapshot bytes.
pub fn empty_snapshot() -> Result<Bytes, hex::FromHexError> {
    hex::decode(EMPTY_RDB_HEX).map(Bytes::from)
}
