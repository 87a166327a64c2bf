//! Builds outgoing cache-protocol responses in memory.
//!
//! A [Response] accumulates the complete RESP reply in a single buffer which is then
//! pushed onto the socket with one write call. Replies are expected to be small (an
//! item plus a few framing bytes), so buffering them fully is the right trade.
//!
//! The builder tracks the nesting of arrays and refuses to complete a response whose
//! element counts do not line up: producing *no* response is recoverable for the
//! peer (it drops the connection), while a silently truncated array would desync the
//! stream.
//!
//! # Example
//!
//! ```
//! # use ganymede::response::{OutputError, Response};
//! # fn main() -> Result<(), OutputError> {
//! let mut response = Response::new();
//! response.ok()?;
//! assert_eq!(response.complete_string()?, "+OK\r\n");
//! # Ok(())
//! # }
//! ```
use std::error::Error as StdError;
use std::fmt::{Display, Formatter, Write};

use anyhow::anyhow;
use bytes::BytesMut;

use crate::item::Item;

/// Enumerates the failures which can occur while emitting a response.
#[derive(Debug)]
pub enum OutputError {
    /// A formatting failure while writing into the buffer.
    IoError(std::fmt::Error),

    /// A nesting violation (wrong number of array elements) or another protocol
    /// level inconsistency. The connection should be closed.
    ProtocolError(anyhow::Error),
}

impl From<std::fmt::Error> for OutputError {
    fn from(err: std::fmt::Error) -> OutputError {
        OutputError::IoError(err)
    }
}

impl From<anyhow::Error> for OutputError {
    fn from(err: anyhow::Error) -> OutputError {
        OutputError::ProtocolError(err)
    }
}

impl Display for OutputError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            OutputError::IoError(err) => write!(f, "IO error: {:?}", err),
            OutputError::ProtocolError(err) => write!(f, "Protocol error: {:?}", err),
        }
    }
}

impl StdError for OutputError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            OutputError::IoError(err) => Some(err),
            OutputError::ProtocolError(_) => None,
        }
    }
}

/// The result type of all output operations.
pub type OutputResult = std::result::Result<(), OutputError>;

/// Separator line used by the textual diagnostic reports.
pub static SEPARATOR: &str =
    "-------------------------------------------------------------------------------\n";

/// A response being assembled.
#[derive(Default)]
pub struct Response {
    buffer: BytesMut,
    nesting: Vec<i32>,
}

impl Response {
    /// Creates a response expecting exactly one top-level element.
    pub fn new() -> Self {
        Response {
            buffer: BytesMut::with_capacity(8192),
            nesting: vec![1],
        }
    }

    /// Accounts one emitted element against the current nesting level.
    fn track_element(&mut self) -> OutputResult {
        let level = match self.nesting.last_mut() {
            Some(level) => level,
            None => return Err(OutputError::ProtocolError(anyhow!("Excess result data!"))),
        };

        *level -= 1;
        if *level == 0 {
            let _ = self.nesting.pop();
        } else if *level < 0 {
            return Err(OutputError::ProtocolError(anyhow!("Excess result data!")));
        }

        Ok(())
    }

    /// Finishes the response and hands out the serialized bytes.
    ///
    /// Fails if announced array elements are still missing.
    pub fn complete(self) -> Result<BytesMut, OutputError> {
        if !self.nesting.is_empty() {
            return Err(OutputError::ProtocolError(anyhow!(
                "Result data is incomplete!"
            )));
        }

        Ok(self.buffer)
    }

    /// Completes the response and returns it as a string; intended for tests.
    pub fn complete_string(self) -> Result<String, OutputError> {
        let buffer = self.complete()?;
        match std::str::from_utf8(&buffer[..]) {
            Ok(string) => Ok(string.to_owned()),
            Err(_) => Err(OutputError::ProtocolError(anyhow!("Non UTF-8 data found"))),
        }
    }

    /// Starts an array of `items` elements, which must all be emitted afterwards.
    pub fn array(&mut self, items: i32) -> OutputResult {
        self.track_element()?;
        if items > 0 {
            self.nesting.push(items);
        }
        write!(self.buffer, "*{}\r\n", items)?;
        Ok(())
    }

    /// Emits "OK" as a simple string.
    pub fn ok(&mut self) -> OutputResult {
        self.track_element()?;
        self.buffer.write_str("+OK\r\n")?;
        Ok(())
    }

    /// Emits the given number.
    pub fn number(&mut self, number: i64) -> OutputResult {
        self.track_element()?;
        write!(self.buffer, ":{}\r\n", number)?;
        Ok(())
    }

    /// Emits 1 for **true** and 0 for **false**.
    pub fn boolean(&mut self, value: bool) -> OutputResult {
        self.number(if value { 1 } else { 0 })
    }

    /// Emits a simple string, which must not contain line breaks.
    pub fn simple(&mut self, string: impl AsRef<str>) -> OutputResult {
        self.track_element()?;
        write!(self.buffer, "+{}\r\n", string.as_ref())?;
        Ok(())
    }

    /// Emits a string as bulk data (binary safe on the wire, UTF-8 in, see
    /// [Response::bulk_bytes] for raw bytes).
    pub fn bulk(&mut self, string: impl AsRef<str>) -> OutputResult {
        self.bulk_bytes(string.as_ref().as_bytes())
    }

    /// Emits raw bytes as bulk data.
    pub fn bulk_bytes(&mut self, bytes: &[u8]) -> OutputResult {
        self.track_element()?;
        write!(self.buffer, "${}\r\n", bytes.len())?;
        self.buffer.extend_from_slice(bytes);
        self.buffer.write_str("\r\n")?;
        Ok(())
    }

    /// Emits an error reply.
    ///
    /// Line breaks are flattened to spaces so that an error message can never desync
    /// the protocol stream.
    pub fn error(&mut self, message: impl AsRef<str>) -> OutputResult {
        self.track_element()?;
        write!(
            self.buffer,
            "-{}\r\n",
            message.as_ref().replace(['\r', '\n'], " ")
        )?;
        Ok(())
    }

    /// Emits an item as the three element array `[key, value, expire]`.
    pub fn item(&mut self, item: &Item) -> OutputResult {
        self.array(3)?;
        self.bulk(&item.key)?;
        self.bulk_bytes(&item.value)?;
        self.number(item.expire)?;
        Ok(())
    }

    /// Emits an item plus its hit flag as the four element array
    /// `[key, value, expire, hit]`, the reply shape of a get.
    pub fn item_with_hit(&mut self, item: &Item, hit: bool) -> OutputResult {
        self.array(4)?;
        self.bulk(&item.key)?;
        self.bulk_bytes(&item.value)?;
        self.number(item.expire)?;
        self.boolean(hit)?;
        Ok(())
    }
}
