//! The client half of the peer-to-peer cache protocol.
//!
//! Each remote member gets one [Client]. A client lazily opens a single TCP
//! connection on first use and keeps it pooled behind an async mutex. Calls to the
//! same peer serialize on that connection, which is acceptable because requests are
//! tiny and the server answers in arrival order anyway.
//!
//! Every call is bounded by the cache's configured deadline. On a timeout or any IO
//! error the pooled connection is discarded, as the stream may carry a half-read
//! reply; the next call reconnects transparently. Cancellation therefore simply
//! costs a reconnect, never a desynced protocol stream.
//!
//! Requests are arrays of bulk strings (written with the same machinery the server
//! uses for its replies); replies are parsed by a small recursive RESP reader.
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::cache::Error;
use crate::item::Item;
use crate::response::Response;

/// A single parsed reply element.
#[derive(Debug)]
pub(crate) enum Reply {
    Simple(String),
    Error(String),
    Number(i64),
    Bulk(Bytes),
    Array(Vec<Reply>),
}

/// A connection to one peer, with lazy connect and per-call deadlines.
pub(crate) struct Client {
    addr: String,
    timeout: Duration,
    conn: Mutex<Option<TcpStream>>,
}

impl Client {
    /// Creates a client for the given address. No connection is opened yet.
    pub fn new(addr: String, timeout: Duration) -> Client {
        Client {
            addr,
            timeout,
            conn: Mutex::new(None),
        }
    }

    /// Fetches an item from the peer. Returns the item and the owner's hit flag.
    pub async fn get(&self, table: &str, key: &str) -> Result<(Item, bool), Error> {
        let reply = self
            .exchange(&[b"CACHE.GET", table.as_bytes(), key.as_bytes()])
            .await?;

        match reply {
            Reply::Array(elements) => {
                let (item, hit) = decode_item_with_hit(elements).map_err(Error::internal)?;
                Ok((item, hit))
            }
            other => Err(unexpected(other)),
        }
    }

    /// Stores an already encoded item on the peer.
    pub async fn put(&self, table: &str, item: &Item) -> Result<(), Error> {
        let expire = item.expire.to_string();
        let reply = self
            .exchange(&[
                b"CACHE.PUT",
                table.as_bytes(),
                item.key.as_bytes(),
                &item.value,
                expire.as_bytes(),
            ])
            .await?;

        expect_ok(reply)
    }

    /// Evicts a key on the peer.
    pub async fn evict(&self, table: &str, key: &str) -> Result<(), Error> {
        let reply = self
            .exchange(&[b"CACHE.EVICT", table.as_bytes(), key.as_bytes()])
            .await?;

        expect_ok(reply)
    }

    /// Evicts a batch of keys on the peer.
    pub async fn evict_all(&self, table: &str, keys: &[String]) -> Result<(), Error> {
        let mut parts: Vec<&[u8]> = Vec::with_capacity(keys.len() + 2);
        parts.push(b"CACHE.EVICTALL");
        parts.push(table.as_bytes());
        for key in keys {
            parts.push(key.as_bytes());
        }

        let reply = self.exchange(&parts).await?;
        expect_ok(reply)
    }

    /// Invokes a procedure on the peer and returns the mutated item.
    pub async fn call(
        &self,
        table: &str,
        key: &str,
        procedure: &str,
        args: &[u8],
    ) -> Result<Item, Error> {
        let reply = self
            .exchange(&[
                b"CACHE.CALL",
                table.as_bytes(),
                key.as_bytes(),
                procedure.as_bytes(),
                args,
            ])
            .await?;

        match reply {
            Reply::Array(elements) => decode_item(elements).map_err(Error::internal),
            other => Err(unexpected(other)),
        }
    }

    /// Checks whether the peer is up and speaking the protocol.
    pub async fn ping(&self) -> Result<(), Error> {
        match self.exchange(&[b"PING"]).await? {
            Reply::Simple(answer) if answer == "PONG" => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Drops the pooled connection, if any.
    pub fn close(&self) {
        if let Ok(mut conn) = self.conn.try_lock() {
            *conn = None;
        }
    }

    /// Sends one request and reads one reply, all within the configured deadline.
    async fn exchange(&self, parts: &[&[u8]]) -> Result<Reply, Error> {
        let payload = encode_request(parts).map_err(Error::internal)?;

        let mut conn = self.conn.lock().await;
        let outcome = tokio::time::timeout(
            self.timeout,
            Self::exchange_locked(&mut *conn, &self.addr, payload),
        )
        .await;

        match outcome {
            Ok(Ok(Reply::Error(message))) => {
                // An error reply leaves the stream in sync; keep the connection.
                Err(Error::from_wire(&message))
            }
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(err)) => {
                // The stream may be torn mid-frame; reconnect next time.
                *conn = None;
                Err(Error::internal(err))
            }
            Err(_elapsed) => {
                *conn = None;
                Err(Error::internal(anyhow!(
                    "request to peer {} timed out after {:?}",
                    self.addr,
                    self.timeout
                )))
            }
        }
    }

    async fn exchange_locked(
        conn: &mut Option<TcpStream>,
        addr: &str,
        payload: BytesMut,
    ) -> Result<Reply> {
        if conn.is_none() {
            let stream = TcpStream::connect(addr)
                .await
                .with_context(|| format!("unable to connect to peer {}", addr))?;
            let _ = stream.set_nodelay(true);
            *conn = Some(stream);
        }

        let stream = match conn.as_mut() {
            Some(stream) => stream,
            None => unreachable!("connection was just established"),
        };

        stream.write_all(&payload).await?;
        stream.flush().await?;

        let mut buffer = BytesMut::with_capacity(8192);
        loop {
            if let Some((reply, consumed)) = parse_reply(&buffer)? {
                if consumed != buffer.len() {
                    return Err(anyhow!("trailing bytes after reply from {}", addr));
                }
                return Ok(reply);
            }

            let read = stream.read_buf(&mut buffer).await?;
            if read == 0 {
                return Err(anyhow!("peer {} closed the connection mid-reply", addr));
            }
        }
    }
}

/// Serializes a request as an array of bulk strings.
fn encode_request(parts: &[&[u8]]) -> Result<BytesMut> {
    let mut request = Response::new();
    request
        .array(parts.len() as i32)
        .map_err(|err| anyhow!("{}", err))?;
    for part in parts {
        request.bulk_bytes(part).map_err(|err| anyhow!("{}", err))?;
    }
    request.complete().map_err(|err| anyhow!("{}", err))
}

/// Tries to parse one complete reply from the start of `buffer`.
///
/// Returns `Ok(None)` while the buffer holds only a partial reply.
fn parse_reply(buffer: &[u8]) -> Result<Option<(Reply, usize)>> {
    let (line, after_line) = match read_line(buffer, 0) {
        Some(parsed) => parsed,
        None => return Ok(None),
    };
    if line.is_empty() {
        return Err(anyhow!("empty reply line"));
    }

    let body = &line[1..];
    match line[0] {
        b'+' => Ok(Some((
            Reply::Simple(String::from_utf8_lossy(body).into_owned()),
            after_line,
        ))),
        b'-' => Ok(Some((
            Reply::Error(String::from_utf8_lossy(body).into_owned()),
            after_line,
        ))),
        b':' => Ok(Some((Reply::Number(parse_int(body)?), after_line))),
        b'$' => {
            let length = parse_int(body)?;
            if length < 0 {
                // A null bulk string; represented as an empty value.
                return Ok(Some((Reply::Bulk(Bytes::new()), after_line)));
            }
            let length = length as usize;
            if buffer.len() < after_line + length + 2 {
                return Ok(None);
            }
            let value = Bytes::copy_from_slice(&buffer[after_line..after_line + length]);
            Ok(Some((Reply::Bulk(value), after_line + length + 2)))
        }
        b'*' => {
            let count = parse_int(body)?;
            if count < 0 {
                return Ok(Some((Reply::Array(Vec::new()), after_line)));
            }

            let mut elements = Vec::with_capacity(count as usize);
            let mut offset = after_line;
            for _ in 0..count {
                match parse_reply(&buffer[offset..])? {
                    Some((element, consumed)) => {
                        elements.push(element);
                        offset += consumed;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((Reply::Array(elements), offset)))
        }
        other => Err(anyhow!("unexpected reply type marker '{}'", other as char)),
    }
}

/// Reads one CRLF terminated line starting at `offset`.
fn read_line(buffer: &[u8], offset: usize) -> Option<(&[u8], usize)> {
    let mut index = offset;
    while index + 1 < buffer.len() {
        if buffer[index] == b'\r' && buffer[index + 1] == b'\n' {
            return Some((&buffer[offset..index], index + 2));
        }
        index += 1;
    }
    None
}

fn parse_int(bytes: &[u8]) -> Result<i64> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|string| string.parse().ok())
        .ok_or_else(|| anyhow!("malformed integer in reply"))
}

fn decode_item(elements: Vec<Reply>) -> Result<Item> {
    let mut elements = elements.into_iter();
    match (elements.next(), elements.next(), elements.next()) {
        (Some(Reply::Bulk(key)), Some(Reply::Bulk(value)), Some(Reply::Number(expire))) => {
            Ok(Item {
                key: String::from_utf8_lossy(&key).into_owned(),
                value,
                expire,
            })
        }
        _ => Err(anyhow!("malformed item reply")),
    }
}

fn decode_item_with_hit(elements: Vec<Reply>) -> Result<(Item, bool)> {
    let mut elements = elements.into_iter();
    match (
        elements.next(),
        elements.next(),
        elements.next(),
        elements.next(),
    ) {
        (
            Some(Reply::Bulk(key)),
            Some(Reply::Bulk(value)),
            Some(Reply::Number(expire)),
            Some(Reply::Number(hit)),
        ) => Ok((
            Item {
                key: String::from_utf8_lossy(&key).into_owned(),
                value,
                expire,
            },
            hit != 0,
        )),
        _ => Err(anyhow!("malformed get reply")),
    }
}

fn expect_ok(reply: Reply) -> Result<(), Error> {
    match reply {
        Reply::Simple(answer) if answer == "OK" => Ok(()),
        other => Err(unexpected(other)),
    }
}

fn unexpected(reply: Reply) -> Error {
    Error::internal(anyhow!("unexpected reply: {:?}", reply))
}
