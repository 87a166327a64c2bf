//! Serves the cache protocol to remote peers.
//!
//! Binds a server socket on the local member's address and runs one lightweight task
//! per client connection. Each connection reads requests into a recycled buffer,
//! dispatches them onto the byte-level surface of the addressed table and writes the
//! buffered reply back with a single call.
//!
//! All waits are bounded (500 ms) so that the loops observe a tear-down promptly
//! without any dedicated shutdown channel: the accept loop re-checks its liveness
//! between accepts, the read loop between reads. If the socket cannot be bound, the
//! server keeps retrying every 500 ms, so that a replacement node can start while
//! its predecessor still bleeds out, and the port "hands over" with minimal downtime.
//!
//! The command dispatch resolves the command name to a numeric token once per
//! connection and then matches on the token enum, keeping the per-request path free
//! of string comparisons beyond the initial lookup.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use bytes::{BufMut, BytesMut};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::WriteHalf;
use tokio::net::{TcpListener, TcpStream};

use crate::average::Average;
use crate::cache::{Cache, Error};
use crate::fmt::format_short_duration;
use crate::item::Item;
use crate::request::Request;
use crate::response::{OutputError, OutputResult, Response, SEPARATOR};
use crate::spawn;
use crate::table::LocalTable;

/// Timeout for a single read on a client connection.
///
/// Reads are interrupted this often to re-check whether the cache is being torn
/// down or the connection was asked to quit.
const READ_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Timeout when waiting for a new incoming connection, for the same reason.
const CONNECT_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Pre-allocated receive buffer per connection. Requests larger than this grow the
/// buffer temporarily; it shrinks back afterwards.
const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Represents one client connection.
pub struct Connection {
    peer_address: String,
    active: AtomicBool,
    commands: Average,
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.peer_address == other.peer_address
    }
}

impl Connection {
    /// Determines if the connection is still active.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Asks the connection loop to terminate.
    pub fn quit(&self) {
        self.active.store(false, Ordering::Release);
    }
}

/// Metadata describing one open connection, as reported by `SYS.CONNECTIONS`.
pub struct ConnectionInfo {
    /// The peer address of the connected client.
    pub peer_address: String,

    /// Number of handled commands along with their average runtime.
    pub commands: Average,
}

/// The protocol server of a cache node.
pub(crate) struct Server {
    running: AtomicBool,
    cache: Weak<Cache>,
    addr: String,
    connections: Mutex<Vec<Arc<Connection>>>,
}

impl Server {
    pub fn new(cache: Weak<Cache>, addr: String) -> Server {
        Server {
            running: AtomicBool::new(false),
            cache,
            addr,
            connections: Mutex::new(Vec::new()),
        }
    }

    /// Determines if the server should keep accepting and serving.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
            && self
                .cache
                .upgrade()
                .map(|cache| !cache.is_destroyed())
                .unwrap_or(false)
    }

    /// Stops the accept loop and all connection loops.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Lists all currently open connections.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .map(|connection| ConnectionInfo {
                peer_address: connection.peer_address.clone(),
                commands: connection.commands.clone(),
            })
            .collect()
    }

    fn add_connection(&self, connection: Arc<Connection>) {
        self.connections.lock().unwrap().push(connection);
    }

    fn remove_connection(&self, connection: Arc<Connection>) {
        let mut connections = self.connections.lock().unwrap();
        if let Some(index) = connections.iter().position(|other| **other == *connection) {
            let _ = connections.remove(index);
        }
    }

    /// Binds the server socket and serves until the cache is torn down.
    pub async fn event_loop(&self) {
        self.running.store(true, Ordering::Release);
        let mut last_bind_error_reported = Instant::now();
        let mut first_attempt = true;

        while self.is_running() {
            match TcpListener::bind(&self.addr).await {
                Ok(listener) => {
                    log::info!("Opened server socket on {}...", &self.addr);
                    self.server_loop(&listener).await;
                    log::info!("Closing server socket on {}.", &self.addr);
                }
                Err(error) => {
                    // Only log every 5s, as we retry every 500ms and would
                    // otherwise jam the log...
                    if first_attempt
                        || Instant::now()
                            .duration_since(last_bind_error_reported)
                            .as_secs()
                            > 5
                    {
                        log::error!(
                            "Cannot bind server address {}: {}. Retrying every 500ms...",
                            &self.addr,
                            error
                        );
                        last_bind_error_reported = Instant::now();
                    }
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
            first_attempt = false;
        }
    }

    /// Accepts incoming connections until the server is stopped.
    async fn server_loop(&self, listener: &TcpListener) {
        while self.is_running() {
            // The timeout makes the while condition effective even when no client
            // ever connects...
            match tokio::time::timeout(CONNECT_WAIT_TIMEOUT, listener.accept()).await {
                Ok(Ok((stream, _))) => self.handle_new_connection(stream),
                Ok(Err(_)) => {
                    // The socket itself failed; return so the event loop can
                    // re-create it (or exit if we're shutting down).
                    return;
                }
                Err(_) => (),
            }
        }
    }

    /// Registers the new connection and forks its protocol loop.
    fn handle_new_connection(&self, stream: TcpStream) {
        let cache = match self.cache.upgrade() {
            Some(cache) => cache,
            None => return,
        };

        spawn!(async move {
            let _ = stream.set_nodelay(true);

            let connection = Arc::new(Connection {
                peer_address: stream
                    .peer_addr()
                    .map(|addr| addr.to_string())
                    .unwrap_or_else(|_| "<unknown>".to_owned()),
                active: AtomicBool::new(true),
                commands: Average::new(),
            });
            log::debug!("Opened connection from {}...", connection.peer_address);
            cache.server().add_connection(connection.clone());

            if let Err(error) = protocol_loop(cache.clone(), connection.clone(), stream).await {
                log::debug!(
                    "An IO error occurred in connection {}: {}",
                    connection.peer_address,
                    error
                );
            }

            log::debug!("Closing connection to {}...", connection.peer_address);
            cache.server().remove_connection(connection);
        });
    }
}

/// Enumerates the commands of the cache protocol.
#[derive(FromPrimitive)]
enum Commands {
    Get,
    Put,
    Evict,
    EvictAll,
    Call,
    Ping,
    Metrics,
    Connections,
    Quit,
}

/// Resolves command names and dispatches requests onto the local tables.
struct Dispatcher {
    cache: Arc<Cache>,
    tokens: HashMap<&'static str, usize>,
}

impl Dispatcher {
    fn new(cache: Arc<Cache>) -> Dispatcher {
        let mut tokens = HashMap::new();
        let _ = tokens.insert("CACHE.GET", Commands::Get as usize);
        let _ = tokens.insert("CACHE.PUT", Commands::Put as usize);
        let _ = tokens.insert("CACHE.EVICT", Commands::Evict as usize);
        let _ = tokens.insert("CACHE.EVICTALL", Commands::EvictAll as usize);
        let _ = tokens.insert("CACHE.CALL", Commands::Call as usize);
        let _ = tokens.insert("PING", Commands::Ping as usize);
        let _ = tokens.insert("SYS.METRICS", Commands::Metrics as usize);
        let _ = tokens.insert("SYS.CONNECTIONS", Commands::Connections as usize);
        let _ = tokens.insert("QUIT", Commands::Quit as usize);

        Dispatcher { cache, tokens }
    }

    async fn dispatch(
        &self,
        request: Request,
        connection: &Arc<Connection>,
    ) -> Result<BytesMut, OutputError> {
        let mut response = Response::new();
        let command = request.command().to_uppercase();

        match self
            .tokens
            .get(command.as_str())
            .and_then(|token| Commands::from_usize(*token))
        {
            Some(Commands::Get) => match self.get(&request).await {
                Ok((item, hit)) => response.item_with_hit(&item, hit)?,
                Err(error) => write_error(&mut response, &error)?,
            },
            Some(Commands::Put) => match self.put(&request).await {
                Ok(()) => response.ok()?,
                Err(error) => write_error(&mut response, &error)?,
            },
            Some(Commands::Evict) => match self.evict(&request).await {
                Ok(()) => response.ok()?,
                Err(error) => write_error(&mut response, &error)?,
            },
            Some(Commands::EvictAll) => match self.evict_all(&request).await {
                Ok(()) => response.ok()?,
                Err(error) => write_error(&mut response, &error)?,
            },
            Some(Commands::Call) => match self.call(&request).await {
                Ok(item) => response.item(&item)?,
                Err(error) => write_error(&mut response, &error)?,
            },
            Some(Commands::Ping) => response.simple("PONG")?,
            Some(Commands::Metrics) => match self.metrics(&request) {
                Ok(report) => response.bulk(report)?,
                Err(error) => write_error(&mut response, &error)?,
            },
            Some(Commands::Connections) => {
                response.bulk(self.connections_report())?;
            }
            Some(Commands::Quit) => {
                connection.quit();
                response.ok()?;
            }
            None => {
                response.error(format!("CLIENT Unknown command: {}", request.command()))?;
            }
        }

        response.complete()
    }

    async fn get(&self, request: &Request) -> Result<(Item, bool), Error> {
        let table = self
            .cache
            .get_table(request.str_parameter(0).map_err(Error::internal)?)?;
        let key = request.str_parameter(1).map_err(Error::internal)?;

        let item = table.get_locally(key).await?;
        let hit = !item.is_zero();
        Ok((item, hit))
    }

    async fn put(&self, request: &Request) -> Result<(), Error> {
        let table = self
            .cache
            .get_table(request.str_parameter(0).map_err(Error::internal)?)?;
        let key = request.str_parameter(1).map_err(Error::internal)?;
        let value = request.parameter(2).map_err(Error::internal)?;
        let expire = request.int_parameter(3).map_err(Error::internal)?;

        table
            .put_locally(Item {
                key: key.to_owned(),
                value,
                expire,
            })
            .await;
        Ok(())
    }

    async fn evict(&self, request: &Request) -> Result<(), Error> {
        let table = self
            .cache
            .get_table(request.str_parameter(0).map_err(Error::internal)?)?;
        let key = request.str_parameter(1).map_err(Error::internal)?;

        table.evict_locally(key).await;
        Ok(())
    }

    async fn evict_all(&self, request: &Request) -> Result<(), Error> {
        let table = self
            .cache
            .get_table(request.str_parameter(0).map_err(Error::internal)?)?;

        let mut keys = Vec::with_capacity(request.parameter_count().saturating_sub(1));
        for index in 1..request.parameter_count() {
            keys.push(request.str_parameter(index).map_err(Error::internal)?.to_owned());
        }

        table.evict_all_locally(keys).await;
        Ok(())
    }

    async fn call(&self, request: &Request) -> Result<Item, Error> {
        let table = self
            .cache
            .get_table(request.str_parameter(0).map_err(Error::internal)?)?;
        let key = request.str_parameter(1).map_err(Error::internal)?;
        let procedure = request.str_parameter(2).map_err(Error::internal)?;
        let args = request.parameter(3).map_err(Error::internal)?;

        table.call_locally(key, procedure, args).await
    }

    /// Renders the metrics report: all tables plus the aggregate, or the
    /// per-procedure details of a single table if one is named.
    fn metrics(&self, request: &Request) -> Result<String, Error> {
        if request.parameter_count() > 0 {
            let name = request.str_parameter(0).map_err(Error::internal)?;
            let table = self.cache.get_table(name)?;
            let metrics = table.metrics();

            let mut report = format!("Table: {}\n\n", name);
            report += format!("{:<20} {:>12}\n", "Procedure", "Calls").as_str();
            report += SEPARATOR;
            for (procedure, count) in &metrics.calls {
                report += format!("{:<20} {:>12}\n", procedure, count).as_str();
            }
            report += SEPARATOR;
            return Ok(report);
        }

        let mut report = format!(
            "{:<20} {:>9} {:>9} {:>9} {:>9} {:>9}\n",
            "Table", "Gets", "Misses", "Puts", "Evicts", "Calls"
        );
        report += SEPARATOR;
        for table in self.cache.tables() {
            let metrics = table.metrics();
            report += format!(
                "{:<20} {:>9} {:>9} {:>9} {:>9} {:>9}\n",
                table.name(),
                metrics.get,
                metrics.miss,
                metrics.put,
                metrics.evict,
                metrics.calls.values().sum::<i64>()
            )
            .as_str();
        }
        report += SEPARATOR;

        let total = self.cache.metrics()?;
        report += format!(
            "{:<20} {:>9} {:>9} {:>9} {:>9} {:>9}\n",
            "(aggregate)",
            total.get,
            total.miss,
            total.put,
            total.evict,
            total.calls.values().sum::<i64>()
        )
        .as_str();

        Ok(report)
    }

    fn connections_report(&self) -> String {
        let connections = self.cache.server().connections();

        let mut report = format!("Open connections: {}\n\n", connections.len());
        report += format!(
            "{:<24} {:>10} {:>15}\n",
            "Remote Address", "Calls", "Avg. Duration"
        )
        .as_str();
        report += SEPARATOR;
        for connection in connections {
            report += format!(
                "{:<24} {:>10} {:>15}\n",
                connection.peer_address,
                connection.commands.count(),
                format_short_duration(connection.commands.avg())
            )
            .as_str();
        }
        report += SEPARATOR;

        report
    }
}

fn write_error(response: &mut Response, error: &Error) -> OutputResult {
    response.error(format!("{} {}", error.wire_code(), error))
}

/// Executed per client connection to process incoming requests.
async fn protocol_loop(
    cache: Arc<Cache>,
    connection: Arc<Connection>,
    mut stream: TcpStream,
) -> anyhow::Result<()> {
    let dispatcher = Dispatcher::new(cache.clone());
    let mut input_buffer = BytesMut::with_capacity(DEFAULT_BUFFER_SIZE);
    let (mut reader, mut writer) = stream.split();

    while cache.server().is_running() && connection.is_active() {
        match tokio::time::timeout(READ_WAIT_TIMEOUT, reader.read_buf(&mut input_buffer)).await {
            Ok(Ok(bytes_read)) if bytes_read > 0 => match Request::parse(&input_buffer) {
                Ok(Some(request)) => {
                    log::debug!("Received {}", request.command());

                    let request_len = request.len();
                    let watch = Instant::now();
                    match dispatcher.dispatch(request, &connection).await {
                        Ok(response_data) => {
                            connection.commands.add(watch.elapsed().as_micros() as i32);
                            writer.write_all(response_data.as_ref()).await?;
                            writer.flush().await?;
                        }
                        Err(error) => {
                            // Output errors leave the stream in an unknown state;
                            // report once and drop the connection.
                            handle_output_error(error, &mut writer).await?;
                            return Ok(());
                        }
                    }

                    input_buffer = recycle_buffer(input_buffer, request_len);
                }
                Err(error) => {
                    writer
                        .write_all(
                            format!("-CLIENT A malformed request was received: {}\r\n", error)
                                .as_bytes(),
                        )
                        .await?;
                    writer.flush().await?;
                    return Ok(());
                }
                // Partial request; keep reading...
                Ok(None) => (),
            },

            // A zero length read means the client closed the connection.
            Ok(Ok(_)) => return Ok(()),

            Ok(Err(error)) => {
                return Err(anyhow::anyhow!(
                    "An error occurred while reading from the client: {}",
                    error
                ));
            }

            // Read timeout; loop around so the while condition is re-evaluated.
            Err(_) => (),
        }
    }

    Ok(())
}

async fn handle_output_error(error: OutputError, writer: &mut WriteHalf<'_>) -> anyhow::Result<()> {
    // For a protocol level problem we still try to deliver an error message; for an
    // IO problem another write would fail just the same, so we only close.
    if let OutputError::ProtocolError(error) = error {
        let message = error.to_string().replace(['\r', '\n'], " ");
        writer
            .write_all(format!("-SERVER {}\r\n", message).as_bytes())
            .await?;
        writer.flush().await?;
    }

    Ok(())
}

/// Shrinks an oversized receive buffer and carries over any bytes beyond the
/// consumed request (pipelined follow-up requests).
fn recycle_buffer(mut input_buffer: BytesMut, request_len: usize) -> BytesMut {
    if input_buffer.capacity() > DEFAULT_BUFFER_SIZE || input_buffer.len() > request_len {
        let previous_buffer = input_buffer;
        input_buffer = BytesMut::with_capacity(DEFAULT_BUFFER_SIZE);

        if previous_buffer.len() > request_len {
            input_buffer.put_slice(&previous_buffer[request_len..]);
        }
    } else {
        input_buffer.truncate(0);
    }

    input_buffer
}

#[cfg(test)]
mod tests {
    use crate::cache::{Cache, CacheOptions};
    use crate::member::Member;
    use crate::table::TableBuilder;
    use crate::testing::{query_redis_async, test_async, SHARED_TEST_RESOURCES, TEST_SERVER_ADDR};
    use std::time::Duration;

    #[test]
    fn integration_test() {
        // The wire test binds the shared test port, so it needs exclusive access...
        let _guard = SHARED_TEST_RESOURCES.lock().unwrap();

        test_async(async {
            let this = Member::new("1", TEST_SERVER_ADDR);
            let cache = Cache::new(this.clone(), vec![this], CacheOptions::default()).unwrap();

            let _table = TableBuilder::<String>::new("sessions")
                .with_codec(crate::codec::StringCodec)
                .with_procedure("append", |value: String, args: bytes::Bytes| async move {
                    let suffix = String::from_utf8_lossy(&args).into_owned();
                    Ok((value + &suffix, Duration::ZERO))
                })
                .build(&cache)
                .unwrap();

            let server = cache.clone();
            crate::spawn!(async move {
                let _ = server.serve().await;
            });
            crate::testing::wait_for_server(&cache).await;

            // The server answers health checks...
            let pong = query_redis_async(|con| redis::cmd("PING").query::<String>(con))
                .await
                .unwrap();
            assert_eq!(pong, "PONG");

            // ...stores and returns items...
            let ok = query_redis_async(|con| {
                redis::cmd("CACHE.PUT")
                    .arg("sessions")
                    .arg("alice")
                    .arg("logged-in")
                    .arg(0i64)
                    .query::<String>(con)
            })
            .await
            .unwrap();
            assert_eq!(ok, "OK");

            let (key, value, expire, hit) = query_redis_async(|con| {
                redis::cmd("CACHE.GET")
                    .arg("sessions")
                    .arg("alice")
                    .query::<(String, String, i64, i64)>(con)
            })
            .await
            .unwrap();
            assert_eq!(key, "alice");
            assert_eq!(value, "logged-in");
            assert_eq!(expire, 0);
            assert_eq!(hit, 1);

            // ...a miss comes back as the zero item...
            let (key, value, _, hit) = query_redis_async(|con| {
                redis::cmd("CACHE.GET")
                    .arg("sessions")
                    .arg("nobody")
                    .query::<(String, String, i64, i64)>(con)
            })
            .await
            .unwrap();
            assert_eq!(key, "");
            assert_eq!(value, "");
            assert_eq!(hit, 0);

            // ...procedures run on the stored value...
            let (_, value, _) = query_redis_async(|con| {
                redis::cmd("CACHE.CALL")
                    .arg("sessions")
                    .arg("alice")
                    .arg("append")
                    .arg("!")
                    .query::<(String, String, i64)>(con)
            })
            .await
            .unwrap();
            assert_eq!(value, "logged-in!");

            // ...unknown tables produce the typed error code...
            let err = query_redis_async(|con| {
                redis::cmd("CACHE.GET")
                    .arg("nope")
                    .arg("key")
                    .query::<(String, String, i64, i64)>(con)
            })
            .await;
            assert_eq!(err.is_none(), true);

            // ...and the diagnostic reports render.
            let report = query_redis_async(|con| redis::cmd("SYS.METRICS").query::<String>(con))
                .await
                .unwrap();
            assert_eq!(report.contains("sessions"), true);

            let report =
                query_redis_async(|con| redis::cmd("SYS.CONNECTIONS").query::<String>(con))
                    .await
                    .unwrap();
            assert_eq!(report.contains("Open connections"), true);

            cache.tear_down().unwrap();
        });
    }
}
