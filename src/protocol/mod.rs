//! RESP Protocol Implementation
//!
//! This module is the codec between sockets and the rest of the server.
//!
//! ## Modules
//!
//! - `types`: the `RespValue` enum and its wire serialization
//! - `parser`: incremental, length-prefix driven parser for incoming bytes
//! - `command`: typed `Command`s decoded from request frames
//!
//! ## Example
//!
//! ```
//! use relaykv::protocol::{parse_message, Command, RespValue};
//! use bytes::Bytes;
//!
//! // Decoding a request
//! let data = b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n";
//! let (frame, consumed) = parse_message(data).unwrap().unwrap();
//! assert_eq!(consumed, data.len());
//! assert_eq!(Command::from_frame(frame), Ok(Command::Get(Bytes::from("name"))));
//!
//! // Encoding a reply
//! let reply = RespValue::bulk_string(Bytes::from("Ariz"));
//! assert_eq!(reply.serialize(), b"$4\r\nAriz\r\n");
//! ```

pub mod command;
pub mod parser;
pub mod types;

// Re-export commonly used types for convenience
pub use command::{Command, CommandError};
pub use parser::{parse_message, ParseError, ParseResult, RespParser};
pub use types::RespValue;
