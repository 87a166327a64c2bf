//! Parses incoming cache-protocol requests.
//!
//! Requests use the RESP wire format as defined by Redis: an array of bulk strings,
//! where the first element names the command and the rest are its parameters. A
//! request for a key lookup therefore looks like:
//!
//! ```text
//! *3\r\n$9\r\nCACHE.GET\r\n$8\r\nsessions\r\n$5\r\nalice\r\n
//! ```
//!
//! Requests arrive over a network socket and may be partial at any byte position, so
//! the parser has to distinguish three outcomes: a full request, "keep reading", and
//! malformed input. Parsing is allocation free apart from the parameter offset list:
//! the parser records byte ranges into the receive buffer instead of copying any
//! data, and parameters are later handed out as cheap slices of the frozen buffer.
//!
//! # Examples
//!
//! Parsing a complete request:
//! ```
//! # use bytes::BytesMut;
//! # use ganymede::request::Request;
//! let buffer = BytesMut::from("*2\r\n$4\r\nPING\r\n$4\r\ntest\r\n");
//! let request = Request::parse(&buffer).unwrap().unwrap();
//!
//! assert_eq!(request.command(), "PING");
//! assert_eq!(request.parameter_count(), 1);
//! ```
//!
//! A partial request yields `None` so the caller keeps reading:
//! ```
//! # use bytes::BytesMut;
//! # use ganymede::request::Request;
//! let buffer = BytesMut::from("*2\r\n$9\r\nCACHE.GET\r\n$20\r\nsess");
//! assert_eq!(Request::parse(&buffer).unwrap().is_none(), true);
//! ```
use std::fmt::{Display, Formatter};

use anyhow::{anyhow, Context, Result};
use bytes::{Bytes, BytesMut};

/// A byte range into the request buffer, marking one parameter.
#[derive(Copy, Clone, Debug)]
struct Range {
    start: usize,
    end: usize,
}

impl Range {
    /// Start of the element following this range, skipping the trailing CRLF.
    fn next_offset(&self) -> usize {
        self.end + 3
    }
}

impl Display for Range {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// A fully parsed request.
///
/// The first array element is exposed as [Request::command]; the remaining elements
/// are parameters, re-numbered from zero. `CACHE.GET sessions alice` therefore has
/// command `CACHE.GET`, parameter 0 `sessions` and parameter 1 `alice`.
pub struct Request {
    len: usize,
    data: Bytes,
    command: Range,
    parameters: Vec<Range>,
}

const ASTERISK: u8 = b'*';
const DOLLAR: u8 = b'$';
const CR: u8 = b'\r';

impl Request {
    /// Tries to parse a request from the given buffer.
    ///
    /// Returns `Ok(None)` while the buffer only holds a partial request and an `Err`
    /// once the buffer cannot become a valid request anymore (in which case the
    /// connection should be dropped, as the stream is out of sync).
    pub fn parse(data: &BytesMut) -> Result<Option<Request>> {
        // The shortest possible request is "*1\r\n..." and every complete request
        // ends in CRLF, so most partial reads are rejected without any real parsing.
        if data.len() < 4 || data[data.len() - 2] != CR {
            return Ok(None);
        }

        Request::parse_inner(data)
    }

    fn parse_inner(data: &BytesMut) -> Result<Option<Request>> {
        if data[0] != ASTERISK {
            return Err(anyhow!("A request must be an array of bulk strings!"));
        }

        let (element_count, range) = match Request::read_int(data, 1)? {
            Some(parsed) => parsed,
            None => return Ok(None),
        };
        if element_count < 1 {
            return Err(anyhow!("A request must contain at least a command!"));
        }

        let mut offset = range.next_offset();

        let command = match Request::read_bulk_string(data, offset)? {
            Some(range) => range,
            None => return Ok(None),
        };
        offset = command.next_offset();

        let mut parameters = Vec::with_capacity(element_count as usize - 1);
        for _ in 1..element_count {
            match Request::read_bulk_string(data, offset)? {
                Some(range) => {
                    parameters.push(range);
                    offset = range.next_offset();
                }
                None => return Ok(None),
            }
        }

        Ok(Some(Request {
            len: offset,
            data: data.clone().freeze(),
            command,
            parameters,
        }))
    }

    /// Reads a decimal integer up to the next CR.
    ///
    /// Returns `Ok(None)` if the buffer ends before the CR was seen (partial data)
    /// and an `Err` for anything which isn't a digit.
    fn read_int(buffer: &BytesMut, offset: usize) -> Result<Option<(i32, Range)>> {
        let mut value: i32 = 0;
        let mut index = offset;

        while index < buffer.len() {
            let byte = buffer[index];
            if byte == CR {
                return Ok(Some((
                    value,
                    Range {
                        start: offset,
                        end: index - 1,
                    },
                )));
            }
            if !byte.is_ascii_digit() {
                return Err(anyhow!("Malformed integer at position {}", index));
            }

            value = value * 10 + (byte - b'0') as i32;
            index += 1;
        }

        Ok(None)
    }

    fn read_bulk_string(buffer: &BytesMut, offset: usize) -> Result<Option<Range>> {
        if offset >= buffer.len() {
            return Ok(None);
        }
        if buffer[offset] != DOLLAR {
            return Err(anyhow!("Expected a bulk string at {}", offset));
        }

        if let Some((length, range)) = Request::read_int(buffer, offset + 1)? {
            let start = range.next_offset();
            if buffer.len() >= start + length as usize + 2 {
                return Ok(Some(Range {
                    start,
                    end: start + length as usize - 1,
                }));
            }
        }

        Ok(None)
    }

    /// Builds a request from plain strings; intended for tests and examples.
    ///
    /// # Example
    /// ```
    /// # use ganymede::request::Request;
    /// let request = Request::example(vec!["CACHE.GET", "sessions", "alice"]);
    /// assert_eq!(request.command(), "CACHE.GET");
    /// assert_eq!(request.str_parameter(1).unwrap(), "alice");
    /// ```
    pub fn example(parts: Vec<&str>) -> Request {
        let mut input = format!("*{}\r\n", parts.len());
        for part in parts {
            input.push_str(&format!("${}\r\n{}\r\n", part.len(), part));
        }

        match Request::parse(&BytesMut::from(input.as_str())) {
            Ok(Some(request)) => request,
            _ => unreachable!("example requests are always well-formed"),
        }
    }

    /// Returns the command name (the first array element).
    pub fn command(&self) -> &str {
        std::str::from_utf8(&self.data[self.command.start..=self.command.end]).unwrap_or("")
    }

    /// Returns the number of parameters, not counting the command.
    pub fn parameter_count(&self) -> usize {
        self.parameters.len()
    }

    /// Returns the n-th parameter as raw bytes.
    ///
    /// This is the accessor for binary-safe parameters like values and procedure
    /// arguments. Fails if the index is out of range.
    pub fn parameter(&self, index: usize) -> Result<Bytes> {
        match self.parameters.get(index) {
            Some(range) => Ok(self.data.slice(range.start..=range.end)),
            None => Err(anyhow!(
                "Invalid parameter index {} (only {} are present)",
                index,
                self.parameters.len()
            )),
        }
    }

    /// Returns the n-th parameter as an UTF-8 string.
    pub fn str_parameter(&self, index: usize) -> Result<&str> {
        match self.parameters.get(index) {
            Some(range) => std::str::from_utf8(&self.data[range.start..=range.end])
                .with_context(|| {
                    format!("Failed to parse parameter {} (range {}) as UTF-8!", index, range)
                }),
            None => Err(anyhow!(
                "Invalid parameter index {} (only {} are present)",
                index,
                self.parameters.len()
            )),
        }
    }

    /// Returns the n-th parameter as a signed integer.
    pub fn int_parameter(&self, index: usize) -> Result<i64> {
        let string = self.str_parameter(index)?;
        string
            .parse()
            .with_context(|| format!("Failed to parse parameter {} ('{}') as integer!", index, string))
    }

    /// Returns the total request length in bytes, so the connection loop can drop
    /// the consumed prefix from its receive buffer.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Determines if the request occupies no bytes (it never does; this exists for
    /// API symmetry with `len`).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_command_with_parameters_is_parsed() {
        let request = Request::parse(&BytesMut::from(
            "*4\r\n$9\r\nCACHE.PUT\r\n$8\r\nsessions\r\n$5\r\nalice\r\n$2\r\n42\r\n",
        ))
        .unwrap()
        .unwrap();

        assert_eq!(request.command(), "CACHE.PUT");
        assert_eq!(request.parameter_count(), 3);
        assert_eq!(request.str_parameter(0).unwrap(), "sessions");
        assert_eq!(request.str_parameter(1).unwrap(), "alice");
        assert_eq!(request.int_parameter(2).unwrap(), 42);
        assert_eq!(request.parameter(1).unwrap().as_ref(), b"alice");

        assert_eq!(request.str_parameter(3).is_err(), true);
        assert_eq!(request.parameter(3).is_err(), true);
    }

    #[test]
    fn binary_parameters_survive() {
        let mut buffer = BytesMut::from("*2\r\n$4\r\nPING\r\n$4\r\n");
        buffer.extend_from_slice(&[0u8, 159, 146, 150]);
        buffer.extend_from_slice(b"\r\n");

        let request = Request::parse(&buffer).unwrap().unwrap();
        assert_eq!(request.parameter(0).unwrap().as_ref(), &[0u8, 159, 146, 150]);
        assert_eq!(request.str_parameter(0).is_err(), true);
    }

    #[test]
    fn malformed_requests_are_rejected() {
        assert_eq!(Request::parse(&BytesMut::from("+GET\r\n")).is_err(), true);
        assert_eq!(
            Request::parse(&BytesMut::from("*1\r\n+GET\r\n")).is_err(),
            true
        );
        assert_eq!(Request::parse(&BytesMut::from("*GET\r\n")).is_err(), true);
    }

    #[test]
    fn partial_requests_ask_for_more_data() {
        for partial in [
            "",
            "*",
            "*1",
            "*1\r",
            "*1\r\n",
            "*2\r\n$9\r\nCACHE.G",
            "*2\r\n$9\r\nCACHE.GET\r\n",
            "*2\r\n$9\r\nCACHE.GET\r\n$5\r\nali",
        ] {
            let result = Request::parse(&BytesMut::from(partial)).unwrap();
            assert_eq!(result.is_none(), true, "'{}' should be partial", partial);
        }
    }

    #[test]
    fn the_consumed_length_is_reported() {
        let wire = "*1\r\n$4\r\nPING\r\n";
        let request = Request::parse(&BytesMut::from(wire)).unwrap().unwrap();
        assert_eq!(request.len(), wire.len());
    }
}
