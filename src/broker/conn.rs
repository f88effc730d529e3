//! TCP connections to a Redis-compatible broker.
//!
//! A [`Connection`] performs the `AUTH`/`SELECT` handshake on dial and offers
//! request/response round-trips. Pub/sub sessions split it into a
//! [`ConnectionReader`] and a [`ConnectionWriter`] so that receiving and
//! sending can run on different tasks.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;
use url::Url;

use crate::broker::resp::{self, FrameError, Value};
use crate::retry::with_timeout;

/// Port used when a URL or address omits one.
pub const DEFAULT_PORT: u16 = 6379;

const READ_CHUNK: usize = 4096;

/// Errors produced by broker transport, protocol, and discovery.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Socket level failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Bytes on the wire did not form a valid frame.
    #[error("malformed frame: {0}")]
    Frame(#[from] FrameError),

    /// Well-formed reply that does not match what the command expects.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Broker answered with an error reply.
    #[error("server error: {0}")]
    Server(String),

    /// Peer closed the connection.
    #[error("connection closed by peer")]
    Closed,

    /// A bounded operation did not finish in time.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// Connection URL could not be parsed or uses an unsupported form.
    #[error("invalid redis url: {0}")]
    InvalidUrl(String),

    /// Every sentinel failed to report the master address.
    #[error("no sentinel could resolve master {master_name:?}: {last_error}")]
    NoSentinelAvailable {
        master_name: String,
        last_error: String,
    },

    /// Connection is not serving the expected replication role.
    #[error("role check failed: expected {expected}, got {actual}")]
    RoleMismatch { expected: String, actual: String },

    /// Pool was closed before or while waiting for a connection.
    #[error("connection pool is closed")]
    PoolClosed,

    /// Pool hit its active limit and is configured not to wait.
    #[error("connection pool exhausted")]
    PoolExhausted,
}

/// Parsed `redis://[username][:password@]host[:port][/database]` URL.
#[derive(Clone, Debug)]
pub struct RedisUrl {
    host: String,
    port: u16,
    username: Option<String>,
    password: Option<SecretString>,
    database: i64,
}

impl RedisUrl {
    /// Parses and validates a connection URL.
    pub fn parse(input: &str) -> Result<Self, BrokerError> {
        let url = Url::parse(input)
            .map_err(|err| BrokerError::InvalidUrl(format!("{input:?}: {err}")))?;

        match url.scheme() {
            "redis" => {}
            "rediss" => {
                return Err(BrokerError::InvalidUrl(
                    "TLS connections (rediss://) are not supported".to_string(),
                ))
            }
            other => {
                return Err(BrokerError::InvalidUrl(format!(
                    "unsupported scheme {other:?}"
                )))
            }
        }

        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .unwrap_or("localhost")
            .to_string();
        let username = (!url.username().is_empty()).then(|| url.username().to_string());
        let password = url
            .password()
            .map(|password| SecretString::new(password.to_string()));
        let database = match url.path().trim_matches('/') {
            "" => 0,
            db => db.parse::<i64>().map_err(|_| {
                BrokerError::InvalidUrl(format!("invalid database number {db:?}"))
            })?,
        };

        Ok(Self {
            host,
            port: url.port().unwrap_or(DEFAULT_PORT),
            username,
            password,
            database,
        })
    }

    /// Returns the `host:port` address to dial.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Returns the database index selected after connecting.
    pub fn database(&self) -> i64 {
        self.database
    }

    /// Dial options carrying the URL's credentials and database.
    pub fn dial_options(&self) -> DialOptions {
        DialOptions {
            username: self.username.clone(),
            password: self.password.clone(),
            database: self.database,
            ..DialOptions::default()
        }
    }
}

/// Options applied when opening a connection.
#[derive(Clone, Debug, Default)]
pub struct DialOptions {
    /// Upper bound for establishing the TCP connection.
    pub connect_timeout: Option<Duration>,
    /// Upper bound for each reply read.
    pub read_timeout: Option<Duration>,
    /// Upper bound for each command write.
    pub write_timeout: Option<Duration>,
    /// ACL username sent with `AUTH`.
    pub username: Option<String>,
    /// Password sent with `AUTH`.
    pub password: Option<SecretString>,
    /// Database selected after authentication when non-zero.
    pub database: i64,
}

impl DialOptions {
    /// Applies the same bound to connect, read, and write.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self.read_timeout = Some(timeout);
        self.write_timeout = Some(timeout);
        self
    }

    /// Sets the password used for `AUTH`.
    pub fn with_password(mut self, password: Option<SecretString>) -> Self {
        self.password = password;
        self
    }
}

/// Buffered RESP frame reader over any async byte source.
#[derive(Debug)]
pub(crate) struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(READ_CHUNK),
        }
    }

    /// Reads the next complete value.
    ///
    /// Dropping the returned future never loses buffered bytes, so the read
    /// can be raced against timers.
    pub(crate) async fn next_value(&mut self) -> Result<Value, BrokerError> {
        loop {
            if let Some((value, used)) = resp::decode(&self.buf)? {
                self.buf.drain(..used);
                return Ok(value);
            }

            let mut chunk = [0u8; READ_CHUNK];
            let read = self.inner.read(&mut chunk).await?;
            if read == 0 {
                return Err(BrokerError::Closed);
            }
            self.buf.extend_from_slice(&chunk[..read]);
        }
    }
}

/// Receiving half of a connection.
#[derive(Debug)]
pub struct ConnectionReader {
    frames: FrameReader<OwnedReadHalf>,
    read_timeout: Option<Duration>,
}

impl ConnectionReader {
    /// Reads the next reply, honoring the configured read timeout.
    pub async fn read_value(&mut self) -> Result<Value, BrokerError> {
        let read_timeout = self.read_timeout;
        match read_timeout {
            Some(timeout) => with_timeout(timeout, self.frames.next_value())
                .await
                .map_err(|_| BrokerError::Timeout {
                    operation: "read",
                    timeout,
                })?,
            None => self.frames.next_value().await,
        }
    }
}

/// Sending half of a connection.
#[derive(Debug)]
pub struct ConnectionWriter {
    stream: OwnedWriteHalf,
    write_timeout: Option<Duration>,
}

impl ConnectionWriter {
    /// Encodes and flushes one command.
    pub async fn send<A: AsRef<[u8]> + Sync>(&mut self, args: &[A]) -> Result<(), BrokerError> {
        let frame = resp::encode_command(args);
        let write_timeout = self.write_timeout;
        let stream = &mut self.stream;
        let write = async {
            stream.write_all(&frame).await?;
            stream.flush().await?;
            Ok::<(), BrokerError>(())
        };
        match write_timeout {
            Some(timeout) => with_timeout(timeout, write)
                .await
                .map_err(|_| BrokerError::Timeout {
                    operation: "write",
                    timeout,
                })?,
            None => write.await,
        }
    }
}

/// An established, authenticated broker connection.
#[derive(Debug)]
pub struct Connection {
    reader: ConnectionReader,
    writer: ConnectionWriter,
    peer: String,
}

impl Connection {
    /// Opens a connection to `addr` and runs the `AUTH`/`SELECT` handshake.
    pub async fn dial(addr: &str, options: &DialOptions) -> Result<Self, BrokerError> {
        let stream = match options.connect_timeout {
            Some(timeout) => with_timeout(timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| BrokerError::Timeout {
                    operation: "connect",
                    timeout,
                })??,
            None => TcpStream::connect(addr).await?,
        };
        stream.set_nodelay(true)?;

        let mut conn = Self::from_stream(stream, addr.to_string(), options);

        if let Some(password) = &options.password {
            let secret = password.expose_secret();
            let reply = match &options.username {
                Some(username) => {
                    conn.command(&["AUTH", username.as_str(), secret.as_str()])
                        .await?
                }
                None => conn.command(&["AUTH", secret.as_str()]).await?,
            };
            expect_ok("AUTH", &reply)?;
        }

        if options.database != 0 {
            let database = options.database.to_string();
            let reply = conn.command(&["SELECT", database.as_str()]).await?;
            expect_ok("SELECT", &reply)?;
        }

        debug!(event = "broker_connected", peer = %addr);
        Ok(conn)
    }

    /// Opens a connection described by a parsed URL.
    pub async fn dial_url(url: &RedisUrl) -> Result<Self, BrokerError> {
        Self::dial(&url.addr(), &url.dial_options()).await
    }

    fn from_stream(stream: TcpStream, peer: String, options: &DialOptions) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: ConnectionReader {
                frames: FrameReader::new(read_half),
                read_timeout: options.read_timeout,
            },
            writer: ConnectionWriter {
                stream: write_half,
                write_timeout: options.write_timeout,
            },
            peer,
        }
    }

    /// Sends a command and returns its reply; error replies become
    /// [`BrokerError::Server`].
    pub async fn command<A: AsRef<[u8]> + Sync>(
        &mut self,
        args: &[A],
    ) -> Result<Value, BrokerError> {
        self.writer.send(args).await?;
        match self.reader.read_value().await? {
            Value::Error(message) => Err(BrokerError::Server(message)),
            reply => Ok(reply),
        }
    }

    /// Address this connection was dialed with.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Splits into independently owned receive and send halves.
    pub fn into_split(self) -> (ConnectionReader, ConnectionWriter) {
        (self.reader, self.writer)
    }
}

fn expect_ok(command: &str, reply: &Value) -> Result<(), BrokerError> {
    match reply {
        Value::Simple(status) if status == "OK" => Ok(()),
        other => Err(BrokerError::Protocol(format!(
            "unexpected {command} reply: {other:?}"
        ))),
    }
}
