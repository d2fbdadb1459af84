//! Connection management.
//!
//! A [`Connection`] owns one duplex byte stream to the server. Its write half
//! sits behind a single fair lock; its read half is handed to exactly one
//! read loop (see [`crate::dispatcher`]).

use crate::error::ClientError;
use crate::stream::ClientStream;
use crate::tls::build_connector;
use muxis_protocol::{Command, Decoder, Encoder, Frame, DEFAULT_PORT};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Default number of pooled connections.
pub const DEFAULT_POOL_SIZE: usize = 4;

/// TLS configuration for client connections.
#[derive(Debug, Clone, Default)]
pub struct TlsClientConfig {
    /// Enable TLS for the connection.
    pub enabled: bool,
    /// Path to PEM-encoded CA certificate(s) for server verification.
    /// If None, the bundled webpki roots are used.
    pub ca_cert_path: Option<PathBuf>,
    /// Path to PEM-encoded client certificate (for mTLS).
    pub client_cert_path: Option<PathBuf>,
    /// Path to PEM-encoded client private key (for mTLS).
    pub client_key_path: Option<PathBuf>,
    /// Skip server certificate verification (INSECURE - development only).
    pub insecure: bool,
    /// Server name for SNI (defaults to the endpoint host).
    pub server_name: Option<String>,
}

impl TlsClientConfig {
    pub fn new() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    pub fn with_ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    pub fn with_client_cert(
        mut self,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        self.client_cert_path = Some(cert_path.into());
        self.client_key_path = Some(key_path.into());
        self
    }

    pub fn with_insecure(mut self) -> Self {
        self.insecure = true;
        self
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }
}

/// Where the server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl Endpoint {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Endpoint::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Parses an endpoint and an optional database index.
    ///
    /// Accepted forms: `host`, `host:port`, `[::1]:port`, `unix:/path`,
    /// `/path`, `redis://host:port/db`.
    pub fn parse_with_db(s: &str) -> Result<(Self, Option<u32>), ClientError> {
        let s = s.trim();
        if let Some(path) = s.strip_prefix("unix:") {
            return Ok((Endpoint::Unix(PathBuf::from(path)), None));
        }
        if s.starts_with('/') {
            return Ok((Endpoint::Unix(PathBuf::from(s)), None));
        }

        let (authority, db) = match s.strip_prefix("redis://") {
            Some(rest) => match rest.split_once('/') {
                Some((authority, "")) => (authority, None),
                Some((authority, db)) => {
                    let db = db
                        .parse()
                        .map_err(|_| ClientError::Config(format!("invalid database: {}", db)))?;
                    (authority, Some(db))
                }
                None => (rest, None),
            },
            None => (s, None),
        };

        if authority.is_empty() {
            return Err(ClientError::Config("empty server address".to_string()));
        }

        let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
            // bracketed IPv6 literal
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| ClientError::Config(format!("invalid address: {}", authority)))?;
            match tail.strip_prefix(':') {
                Some(port) => (host, parse_port(port)?),
                None => (host, DEFAULT_PORT),
            }
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, parse_port(port)?),
                None => (authority, DEFAULT_PORT),
            }
        };

        Ok((Endpoint::tcp(host, port), db))
    }

    fn host(&self) -> &str {
        match self {
            Endpoint::Tcp { host, .. } => host,
            Endpoint::Unix(_) => "localhost",
        }
    }
}

fn parse_port(port: &str) -> Result<u16, ClientError> {
    port.parse()
        .map_err(|_| ClientError::Config(format!("invalid port: {}", port)))
}

impl FromStr for Endpoint {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Endpoint::parse_with_db(s).map(|(endpoint, _)| endpoint)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } if host.contains(':') => write!(f, "[{}]:{}", host, port),
            Endpoint::Tcp { host, port } => write!(f, "{}:{}", host, port),
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

impl From<std::net::SocketAddr> for Endpoint {
    fn from(addr: std::net::SocketAddr) -> Self {
        Endpoint::tcp(addr.ip().to_string(), addr.port())
    }
}

/// Wire protocol version negotiated at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolVersion {
    #[default]
    Resp2,
    Resp3,
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server address.
    pub endpoint: Endpoint,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// How long a caller waits for a reply before giving up on it.
    pub request_timeout: Duration,
    /// How long a partially received frame may stay incomplete; also bounds
    /// handshake reads.
    pub read_timeout: Duration,
    /// Write timeout for one logical operation.
    pub write_timeout: Duration,
    /// Client name announced with `CLIENT SETNAME`.
    pub client_name: Option<String>,
    /// ACL username (optional).
    pub username: Option<String>,
    /// Password (optional).
    pub password: Option<String>,
    /// Logical database selected after connecting.
    pub database: u32,
    /// Wire protocol version.
    pub protocol: ProtocolVersion,
    /// Number of connections held by a pool.
    pub pool_size: usize,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
    /// TLS configuration (optional).
    pub tls: Option<TlsClientConfig>,
}

impl ConnectionConfig {
    pub fn new(endpoint: impl Into<Endpoint>) -> Self {
        Self {
            endpoint: endpoint.into(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(10),
            client_name: None,
            username: None,
            password: None,
            database: 0,
            protocol: ProtocolVersion::Resp2,
            pool_size: DEFAULT_POOL_SIZE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            tls: None,
        }
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_database(mut self, database: u32) -> Self {
        self.database = database;
        self
    }

    pub fn with_protocol(mut self, protocol: ProtocolVersion) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size.max(1);
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    pub fn with_tls(mut self, tls_config: TlsClientConfig) -> Self {
        self.tls = Some(tls_config);
        self
    }

    /// Commands sent before the connection is handed to a dispatcher.
    pub(crate) fn handshake_commands(&self) -> Vec<Command> {
        let mut commands = Vec::new();
        match self.protocol {
            ProtocolVersion::Resp3 => {
                let mut hello = Command::new("HELLO").arg(3);
                if let Some(ref password) = self.password {
                    let user = self.username.as_deref().unwrap_or("default");
                    hello = hello.arg("AUTH").arg(user).arg(password);
                }
                if let Some(ref name) = self.client_name {
                    hello = hello.arg("SETNAME").arg(name);
                }
                commands.push(hello);
            }
            ProtocolVersion::Resp2 => {
                if let Some(ref password) = self.password {
                    let mut auth = Command::new("AUTH");
                    if let Some(ref user) = self.username {
                        auth = auth.arg(user);
                    }
                    commands.push(auth.arg(password));
                }
                if let Some(ref name) = self.client_name {
                    commands.push(Command::new("CLIENT").arg("SETNAME").arg(name));
                }
            }
        }
        if self.database != 0 {
            commands.push(Command::new("SELECT").arg(self.database));
        }
        commands
    }
}

/// Exclusive hold on the write half of a connection.
///
/// Whoever holds the guard owns the wire: a pipeline or transaction writes
/// its whole block before releasing it.
pub struct WriteGuard {
    inner: OwnedMutexGuard<Option<WriteHalf<ClientStream>>>,
    write_timeout: Duration,
}

impl WriteGuard {
    /// Writes and flushes `bytes`.
    pub async fn write_all(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        let writer = self
            .inner
            .as_mut()
            .ok_or_else(|| ClientError::ConnectionLost("connection closed".to_string()))?;
        tokio::time::timeout(self.write_timeout, async {
            writer.write_all(bytes).await?;
            writer.flush().await
        })
        .await
        .map_err(|_| ClientError::Timeout)?
        .map_err(ClientError::Io)
    }
}

/// A connection to a RESP server.
pub struct Connection {
    config: ConnectionConfig,
    /// Write half of the stream, behind the write lock.
    writer: Arc<Mutex<Option<WriteHalf<ClientStream>>>>,
    /// Read half plus any bytes read past the handshake, taken once by the read loop.
    reader: parking_lot::Mutex<Option<(ReadHalf<ClientStream>, Decoder)>>,
    transport: &'static str,
}

impl Connection {
    /// Connects to the server and performs the handshake.
    pub async fn open(config: ConnectionConfig) -> Result<Self, ClientError> {
        tracing::debug!("Connecting to {}...", config.endpoint);

        let stream = tokio::time::timeout(config.connect_timeout, Self::dial(&config))
            .await
            .map_err(|_| {
                tracing::debug!("Connection to {} timed out", config.endpoint);
                ClientError::Timeout
            })??;
        let transport = stream.transport();

        let (read_half, write_half) = tokio::io::split(stream);
        let conn = Self {
            config,
            writer: Arc::new(Mutex::new(Some(write_half))),
            reader: parking_lot::Mutex::new(Some((read_half, Decoder::new()))),
            transport,
        };

        conn.handshake().await?;
        tracing::debug!("Connected to {} over {}", conn.config.endpoint, transport);
        Ok(conn)
    }

    async fn dial(config: &ConnectionConfig) -> Result<ClientStream, ClientError> {
        let tcp_stream = match config.endpoint {
            Endpoint::Tcp { ref host, port } => {
                TcpStream::connect((host.as_str(), port)).await.map_err(|e| {
                    tracing::debug!("Connection failed: {}", e);
                    ClientError::Io(e)
                })?
            }
            #[cfg(unix)]
            Endpoint::Unix(ref path) => {
                let stream = tokio::net::UnixStream::connect(path).await?;
                return Ok(ClientStream::Unix(stream));
            }
            #[cfg(not(unix))]
            Endpoint::Unix(_) => {
                return Err(ClientError::Config(
                    "unix sockets are not supported on this platform".to_string(),
                ))
            }
        };

        tcp_stream.set_nodelay(true).ok();

        match config.tls {
            Some(ref tls) if tls.enabled => {
                let (connector, server_name) = build_connector(tls, config.endpoint.host())?;
                tracing::debug!("Performing TLS handshake...");
                let tls_stream = connector
                    .connect(server_name, tcp_stream)
                    .await
                    .map_err(|e| ClientError::TlsHandshake(e.to_string()))?;
                Ok(ClientStream::Tls(Box::new(tls_stream)))
            }
            _ => Ok(ClientStream::Plain(tcp_stream)),
        }
    }

    /// Sends the handshake commands as one block and checks every reply.
    /// Runs before any read loop exists, so replies are read directly.
    async fn handshake(&self) -> Result<(), ClientError> {
        let commands = self.config.handshake_commands();
        if commands.is_empty() {
            return Ok(());
        }

        let encoded = Encoder::encode_batch(&commands);
        self.lock_writer().await.write_all(&encoded).await?;

        let (mut reader, mut decoder) = self
            .take_reader()
            .ok_or_else(|| ClientError::Handshake("reader already taken".to_string()))?;
        let mut buf = vec![0u8; self.config.read_buffer_size];

        for command in &commands {
            let frame = loop {
                if let Some(frame) = decoder.decode_frame()? {
                    break frame;
                }
                let n = tokio::time::timeout(self.config.read_timeout, reader.read(&mut buf))
                    .await
                    .map_err(|_| ClientError::Timeout)??;
                if n == 0 {
                    return Err(ClientError::ConnectionLost(
                        "closed during handshake".to_string(),
                    ));
                }
                decoder.extend(&buf[..n]);
            };

            if let Frame::Error(line) = frame {
                tracing::debug!("{} rejected during handshake: {}", command.name(), line);
                return Err(ClientError::Handshake(format!("{}: {}", command.name(), line)));
            }
        }

        *self.reader.lock() = Some((reader, decoder));
        Ok(())
    }

    /// Waits for exclusive use of the write half.
    pub async fn lock_writer(&self) -> WriteGuard {
        WriteGuard {
            inner: self.writer.clone().lock_owned().await,
            write_timeout: self.config.write_timeout,
        }
    }

    /// Hands the read half (and any already-buffered bytes) to the read loop.
    /// Returns `None` after the first call.
    pub(crate) fn take_reader(&self) -> Option<(ReadHalf<ClientStream>, Decoder)> {
        self.reader.lock().take()
    }

    /// Shuts the write half down. The read loop sees EOF afterwards.
    pub async fn close(&self) -> Result<(), ClientError> {
        if let Some(mut writer) = self.writer.lock().await.take() {
            tracing::debug!("Shutting down writer for {}", self.config.endpoint);
            let _ = writer.shutdown().await;
        }
        Ok(())
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Returns the transport in use (`tcp`, `tls` or `unix`).
    pub fn transport(&self) -> &'static str {
        self.transport
    }
}
