//! Incremental RESP Protocol Parser
//!
//! TCP is a byte stream: one `read()` may return half a command, or three
//! commands at once. The parser therefore never assumes that a frame is
//! complete. It works on the caller's buffer and reports one of:
//!
//! - `Ok(Some((value, consumed)))` - a complete value, `consumed` bytes used
//! - `Ok(None)` - the frame is incomplete, read more and try again
//! - `Err(ParseError)` - the bytes can never form a valid frame
//!
//! ## Length Prefixes Are Authoritative
//!
//! A bulk string `$<len>\r\n<data>\r\n` is read by counting exactly `len`
//! bytes, never by scanning for the next CRLF. Values may contain `\r\n`,
//! `*`, `$` or NUL bytes and still parse correctly. Only the header lines
//! (`*3`, `$5`, `+OK`, ...) are CRLF-delimited.
//!
//! ## Usage
//!
//! 1. Append incoming network data to a `BytesMut`
//! 2. Call `parse()` on it
//! 3. On success, split `consumed` bytes off the front
//! 4. If incomplete, wait for more data
//! 5. On error the stream is desynchronized: report and disconnect

use crate::protocol::types::{prefix, RespValue, CRLF};
use bytes::Bytes;
use thiserror::Error;

/// Errors that can occur during RESP parsing.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    /// Unknown type prefix byte
    #[error("unknown type prefix: {0:#04x}")]
    UnknownPrefix(u8),

    /// Invalid integer format in a header line
    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    /// Invalid UTF-8 in a simple string or header line
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(String),

    /// Bulk string length is negative (but not -1 for null)
    #[error("invalid bulk string length: {0}")]
    InvalidBulkLength(i64),

    /// Array length is negative (but not -1 for null)
    #[error("invalid multibulk length: {0}")]
    InvalidArrayLength(i64),

    /// Protocol violation (missing CRLF, etc.)
    #[error("{0}")]
    ProtocolError(String),

    /// The message exceeds maximum allowed size
    #[error("message too large: {size} (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Maximum size for a single bulk string (512 MB, same as Redis)
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Maximum number of elements in a single array
pub const MAX_ARRAY_LEN: usize = 1024 * 1024;

/// Maximum array nesting depth (prevent stack overflow)
pub const MAX_NESTING_DEPTH: usize = 32;

/// An incremental RESP protocol parser.
///
/// # Example
///
/// ```
/// use relaykv::protocol::RespParser;
/// use bytes::BytesMut;
///
/// let mut parser = RespParser::new();
/// let mut buffer = BytesMut::from(&b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n"[..]);
///
/// if let Some((value, consumed)) = parser.parse(&buffer).unwrap() {
///     let _frame = buffer.split_to(consumed);
///     assert!(value.into_array().is_some());
/// }
/// ```
#[derive(Debug, Default)]
pub struct RespParser {
    /// Current nesting depth (for array parsing)
    depth: usize,
}

impl RespParser {
    /// Creates a new parser instance.
    pub fn new() -> Self {
        Self { depth: 0 }
    }

    /// Attempts to parse one RESP value from the front of `buf`.
    ///
    /// Nothing is copied out of `buf` until the whole frame has arrived, so
    /// a large request trickling in costs a header scan per read.
    pub fn parse(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        let len = match frame_len(buf, 0)? {
            Some(len) => len,
            None => return Ok(None),
        };
        self.depth = 0;
        self.parse_value(&buf[..len])
    }

    /// Attempts to parse a snapshot payload: `$<len>\r\n<len raw bytes>`.
    ///
    /// Unlike a bulk string there is no trailing CRLF; whatever follows the
    /// payload already belongs to the next frame.
    pub fn parse_snapshot(&mut self, buf: &[u8]) -> ParseResult<Option<(Bytes, usize)>> {
        if buf.is_empty() {
            return Ok(None);
        }
        if buf[0] != prefix::BULK_STRING {
            return Err(ParseError::ProtocolError(format!(
                "expected snapshot payload, found prefix {:#04x}",
                buf[0]
            )));
        }

        let (length, data_start) = match read_length(buf)? {
            Some(header) => header,
            None => return Ok(None),
        };
        let length = checked_bulk_length(length)?;

        if buf.len() < data_start + length {
            return Ok(None);
        }

        let data = Bytes::copy_from_slice(&buf[data_start..data_start + length]);
        Ok(Some((data, data_start + length)))
    }

    fn parse_value(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        if buf.is_empty() {
            return Ok(None);
        }

        if self.depth > MAX_NESTING_DEPTH {
            return Err(ParseError::ProtocolError(format!(
                "maximum nesting depth exceeded: {}",
                MAX_NESTING_DEPTH
            )));
        }

        match buf[0] {
            prefix::SIMPLE_STRING => {
                Ok(read_line(buf)?.map(|(s, n)| (RespValue::SimpleString(s.to_string()), n)))
            }
            prefix::ERROR => Ok(read_line(buf)?.map(|(s, n)| (RespValue::Error(s.to_string()), n))),
            prefix::INTEGER => match read_length(buf)? {
                Some((value, consumed)) => Ok(Some((RespValue::Integer(value), consumed))),
                None => Ok(None),
            },
            prefix::BULK_STRING => self.parse_bulk_string(buf),
            prefix::ARRAY => self.parse_array(buf),
            other => Err(ParseError::UnknownPrefix(other)),
        }
    }

    /// Parses a bulk string: `$<length>\r\n<data>\r\n`
    fn parse_bulk_string(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        let (length, data_start) = match read_length(buf)? {
            Some(header) => header,
            None => return Ok(None),
        };

        if length == -1 {
            return Ok(Some((RespValue::Null, data_start)));
        }
        let length = checked_bulk_length(length)?;

        let total_needed = data_start + length + 2;
        if buf.len() < total_needed {
            return Ok(None);
        }

        if &buf[data_start + length..total_needed] != CRLF {
            return Err(ParseError::ProtocolError(
                "bulk string missing trailing CRLF".to_string(),
            ));
        }

        let data = Bytes::copy_from_slice(&buf[data_start..data_start + length]);
        Ok(Some((RespValue::BulkString(data), total_needed)))
    }

    /// Parses an array: `*<count>\r\n<elements...>`
    fn parse_array(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        let (count, mut consumed) = match read_length(buf)? {
            Some(header) => header,
            None => return Ok(None),
        };

        if count == -1 {
            return Ok(Some((RespValue::Null, consumed)));
        }
        let count = checked_array_length(count)?;

        // The declared count is untrusted until the elements arrive.
        let mut elements = Vec::with_capacity(count.min(64));

        self.depth += 1;
        for _ in 0..count {
            match self.parse_value(&buf[consumed..])? {
                Some((value, element_consumed)) => {
                    elements.push(value);
                    consumed += element_consumed;
                }
                None => return Ok(None),
            }
        }
        self.depth -= 1;

        Ok(Some((RespValue::Array(elements), consumed)))
    }
}

/// Length of the complete value at the front of `buf`, or `None` while
/// bytes are missing. Validates like the full parser but builds nothing.
fn frame_len(buf: &[u8], depth: usize) -> ParseResult<Option<usize>> {
    if buf.is_empty() {
        return Ok(None);
    }
    if depth > MAX_NESTING_DEPTH {
        return Err(ParseError::ProtocolError(format!(
            "maximum nesting depth exceeded: {}",
            MAX_NESTING_DEPTH
        )));
    }

    match buf[0] {
        prefix::SIMPLE_STRING | prefix::ERROR => Ok(read_line(buf)?.map(|(_, n)| n)),
        prefix::INTEGER => Ok(read_length(buf)?.map(|(_, n)| n)),
        prefix::BULK_STRING => {
            let (length, data_start) = match read_length(buf)? {
                Some(header) => header,
                None => return Ok(None),
            };
            if length == -1 {
                return Ok(Some(data_start));
            }
            let end = data_start + checked_bulk_length(length)?;
            if buf.len() < end + 2 {
                return Ok(None);
            }
            if &buf[end..end + 2] != CRLF {
                return Err(ParseError::ProtocolError(
                    "bulk string missing trailing CRLF".to_string(),
                ));
            }
            Ok(Some(end + 2))
        }
        prefix::ARRAY => {
            let (count, mut consumed) = match read_length(buf)? {
                Some(header) => header,
                None => return Ok(None),
            };
            if count == -1 {
                return Ok(Some(consumed));
            }
            for _ in 0..checked_array_length(count)? {
                match frame_len(&buf[consumed..], depth + 1)? {
                    Some(n) => consumed += n,
                    None => return Ok(None),
                }
            }
            Ok(Some(consumed))
        }
        other => Err(ParseError::UnknownPrefix(other)),
    }
}

/// Reads a CRLF-terminated header line after the prefix byte.
///
/// Returns the line content and the number of bytes consumed including the
/// prefix and CRLF.
fn read_line(buf: &[u8]) -> ParseResult<Option<(&str, usize)>> {
    match find_crlf(&buf[1..]) {
        Some(pos) => {
            let line = std::str::from_utf8(&buf[1..1 + pos])
                .map_err(|e| ParseError::InvalidUtf8(e.to_string()))?;
            Ok(Some((line, 1 + pos + 2)))
        }
        None => Ok(None),
    }
}

/// Reads a header line and interprets it as a signed integer.
fn read_length(buf: &[u8]) -> ParseResult<Option<(i64, usize)>> {
    match read_line(buf)? {
        Some((line, consumed)) => {
            let value = line
                .parse::<i64>()
                .map_err(|_| ParseError::InvalidInteger(line.to_string()))?;
            Ok(Some((value, consumed)))
        }
        None => Ok(None),
    }
}

fn checked_bulk_length(length: i64) -> ParseResult<usize> {
    if length < 0 {
        return Err(ParseError::InvalidBulkLength(length));
    }
    let length = length as usize;
    if length > MAX_BULK_SIZE {
        return Err(ParseError::MessageTooLarge {
            size: length,
            max: MAX_BULK_SIZE,
        });
    }
    Ok(length)
}

fn checked_array_length(count: i64) -> ParseResult<usize> {
    if count < 0 {
        return Err(ParseError::InvalidArrayLength(count));
    }
    let count = count as usize;
    if count > MAX_ARRAY_LEN {
        return Err(ParseError::MessageTooLarge {
            size: count,
            max: MAX_ARRAY_LEN,
        });
    }
    Ok(count)
}

/// Finds the position of CRLF in the buffer.
///
/// Returns the position of `\r` if found, or None if CRLF is not present.
#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|window| window == CRLF)
}

/// Helper function to parse a single RESP message from bytes.
pub fn parse_message(buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
    RespParser::new().parse(buf)
}
