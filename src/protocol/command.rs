//! Typed Commands
//!
//! A request frame is an array of bulk strings. [`Command::from_frame`] turns
//! such a frame into a typed [`Command`], checking the command name, the
//! argument count and the argument types. Anything that does not fit is a
//! [`CommandError`], whose `Display` text is exactly what goes back to the
//! client after the `-` prefix.
//!
//! [`Command::to_frame`] goes the other way and is used whenever this server
//! acts as a client itself (the replica handshake).

use crate::protocol::types::RespValue;
use bytes::Bytes;
use thiserror::Error;

/// Errors produced while turning a frame into a [`Command`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The frame is well-formed RESP but not an array of bulk strings
    #[error("ERR Protocol error: expected an array of bulk strings")]
    InvalidFrame,

    /// `*0\r\n`
    #[error("ERR Protocol error: empty command")]
    EmptyCommand,

    #[error("ERR unknown command '{0}'")]
    UnknownCommand(String),

    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongArity(&'static str),

    #[error("ERR value is not an integer or out of range")]
    NotAnInteger,

    #[error("ERR syntax error")]
    Syntax,
}

/// A decoded client (or replication stream) command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `PING`
    Ping,
    /// `ECHO <message>`
    Echo(Bytes),
    /// `GET <key>`
    Get(Bytes),
    /// `SET <key> <value> [PX <millis> | EX <seconds>]`
    ///
    /// `ttl_ms` may be zero or negative; such a key is expired on arrival.
    Set {
        key: Bytes,
        value: Bytes,
        ttl_ms: Option<i64>,
    },
    /// `INFO [section]`
    Info(Option<String>),
    /// `REPLCONF <kind> <value>`, e.g. `listening-port 6380` or `capa psync2`
    ReplConf { kind: String, value: Bytes },
    /// `PSYNC <replid> <offset>`; `? -1` asks for a full resync
    Psync { replid: String, offset: i64 },
}

impl Command {
    /// Decodes a request frame into a command.
    ///
    /// # Example
    ///
    /// ```
    /// use relaykv::protocol::{Command, RespValue};
    /// use bytes::Bytes;
    ///
    /// let frame = RespValue::command(["GET", "name"]);
    /// assert_eq!(Command::from_frame(frame), Ok(Command::Get(Bytes::from("name"))));
    /// ```
    pub fn from_frame(frame: RespValue) -> Result<Self, CommandError> {
        let parts = frame.into_array().ok_or(CommandError::InvalidFrame)?;
        let mut args = Vec::with_capacity(parts.len());
        for part in parts {
            match part {
                RespValue::BulkString(bytes) => args.push(bytes),
                _ => return Err(CommandError::InvalidFrame),
            }
        }

        if args.is_empty() {
            return Err(CommandError::EmptyCommand);
        }
        let name = args.remove(0);
        let name = String::from_utf8_lossy(&name).to_ascii_uppercase();

        match name.as_str() {
            "PING" => {
                expect_arity(&args, 0, "ping")?;
                Ok(Command::Ping)
            }
            "ECHO" => {
                expect_arity(&args, 1, "echo")?;
                Ok(Command::Echo(args.remove(0)))
            }
            "GET" => {
                expect_arity(&args, 1, "get")?;
                Ok(Command::Get(args.remove(0)))
            }
            "SET" => parse_set(args),
            "INFO" => match args.len() {
                0 => Ok(Command::Info(None)),
                1 => Ok(Command::Info(Some(lossy(&args[0])))),
                _ => Err(CommandError::WrongArity("info")),
            },
            "REPLCONF" => {
                let mut args = args.into_iter();
                let kind = args.next().map(|k| lossy(&k)).unwrap_or_default();
                let value = args.next().unwrap_or_default();
                Ok(Command::ReplConf { kind, value })
            }
            "PSYNC" => {
                expect_arity(&args, 2, "psync")?;
                Ok(Command::Psync {
                    replid: lossy(&args[0]),
                    offset: parse_integer(&args[1])?,
                })
            }
            _ => Err(CommandError::UnknownCommand(name)),
        }
    }

    /// Encodes the command as a request frame.
    pub fn to_frame(&self) -> RespValue {
        let parts: Vec<Bytes> = match self {
            Command::Ping => vec![Bytes::from_static(b"PING")],
            Command::Echo(message) => vec![Bytes::from_static(b"ECHO"), message.clone()],
            Command::Get(key) => vec![Bytes::from_static(b"GET"), key.clone()],
            Command::Set { key, value, ttl_ms } => {
                let mut parts = vec![Bytes::from_static(b"SET"), key.clone(), value.clone()];
                if let Some(ms) = ttl_ms {
                    parts.push(Bytes::from_static(b"PX"));
                    parts.push(Bytes::from(ms.to_string()));
                }
                parts
            }
            Command::Info(section) => {
                let mut parts = vec![Bytes::from_static(b"INFO")];
                parts.extend(section.iter().map(|s| Bytes::from(s.clone())));
                parts
            }
            Command::ReplConf { kind, value } => {
                let mut parts = vec![Bytes::from_static(b"REPLCONF")];
                if !kind.is_empty() || !value.is_empty() {
                    parts.push(Bytes::from(kind.clone()));
                }
                if !value.is_empty() {
                    parts.push(value.clone());
                }
                parts
            }
            Command::Psync { replid, offset } => vec![
                Bytes::from_static(b"PSYNC"),
                Bytes::from(replid.clone()),
                Bytes::from(offset.to_string()),
            ],
        };
        RespValue::command(parts)
    }

    /// Lowercase command name, used in logs and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Ping => "ping",
            Command::Echo(_) => "echo",
            Command::Get(_) => "get",
            Command::Set { .. } => "set",
            Command::Info(_) => "info",
            Command::ReplConf { .. } => "replconf",
            Command::Psync { .. } => "psync",
        }
    }
}

/// SET key value [PX milliseconds | EX seconds]
fn parse_set(args: Vec<Bytes>) -> Result<Command, CommandError> {
    if args.len() < 2 {
        return Err(CommandError::WrongArity("set"));
    }

    let mut args = args.into_iter();
    let key = args.next().unwrap_or_default();
    let value = args.next().unwrap_or_default();

    let mut ttl_ms = None;
    while let Some(option) = args.next() {
        let option = lossy(&option).to_ascii_uppercase();
        let scale = match option.as_str() {
            "PX" => 1,
            "EX" => 1000,
            _ => return Err(CommandError::Syntax),
        };
        if ttl_ms.is_some() {
            return Err(CommandError::Syntax);
        }
        let amount = args.next().ok_or(CommandError::Syntax)?;
        let amount = parse_integer(&amount)?;
        ttl_ms = Some(
            amount
                .checked_mul(scale)
                .ok_or(CommandError::NotAnInteger)?,
        );
    }

    Ok(Command::Set { key, value, ttl_ms })
}

fn expect_arity(args: &[Bytes], expected: usize, name: &'static str) -> Result<(), CommandError> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(CommandError::WrongArity(name))
    }
}

fn parse_integer(raw: &[u8]) -> Result<i64, CommandError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(CommandError::NotAnInteger)
}

fn lossy(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}
