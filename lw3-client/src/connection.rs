//! Reconnecting transport.
//!
//! A [`Connection`] owns a background task that keeps one socket to the
//! server alive: it connects, splits incoming bytes into lines, writes
//! queued messages and, after a drop, waits a fixed retry interval before
//! connecting again. Everything it observes is reported as a
//! [`ConnectionEvent`].
//!
//! The socket is plain TCP or TLS, optionally upgraded to a WebSocket that
//! carries the same lines in text frames.

use crate::error::ClientError;
use crate::stream::{ServerLink, Socket};
use crate::tls::{create_insecure_tls_connector, create_tls_connector};
use lw3_protocol::{Credentials, LineDecoder, Transport};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Notify};

/// Default delay between reconnection attempts.
pub const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default number of messages queued while the socket is busy.
pub const DEFAULT_OUTBOUND_BUFFER: usize = 1024;

/// TLS configuration for client connections.
#[derive(Debug, Clone, Default)]
pub struct TlsClientConfig {
    /// Enable TLS for the connection.
    pub enabled: bool,
    /// PEM CA certificate(s) for server verification. Bundled roots if None.
    pub ca_cert_path: Option<PathBuf>,
    /// PEM client certificate (for mTLS).
    pub client_cert_path: Option<PathBuf>,
    /// PEM client private key (for mTLS).
    pub client_key_path: Option<PathBuf>,
    /// Skip server certificate verification (development only).
    pub insecure: bool,
    /// Server name for SNI (defaults to the host).
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
        self.enabled = true;
        self
    }

    pub fn with_client_cert(
        mut self,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        self.client_cert_path = Some(cert_path.into());
        self.client_key_path = Some(key_path.into());
        self.enabled = true;
        self
    }

    pub fn with_insecure(mut self) -> Self {
        self.insecure = true;
        self.enabled = true;
        self
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server host name or address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Timeout of a single connection attempt.
    pub connect_timeout: Duration,
    /// Delay before reconnecting after a drop.
    pub retry_timeout: Duration,
    /// Line delimiter of incoming frames.
    pub frame_delimiter: String,
    /// Longest accepted incoming line in bytes.
    pub max_line_length: usize,
    /// Messages queued for writing before writes fail.
    pub outbound_buffer: usize,
    /// TLS configuration (optional).
    pub tls: Option<TlsClientConfig>,
    /// Plain lines or WebSocket frames.
    pub transport: Transport,
    /// Basic authentication sent with the WebSocket upgrade.
    pub credentials: Option<Credentials>,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: Duration::from_secs(10),
            retry_timeout: DEFAULT_RETRY_TIMEOUT,
            frame_delimiter: "\n".to_string(),
            max_line_length: lw3_protocol::MAX_LINE_LENGTH,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            tls: None,
            transport: Transport::Tcp,
            credentials: None,
        }
    }

    /// Parses `[scheme://]host[:port]`, using the default LW3 port when none
    /// is given.
    ///
    /// `ws://` selects the WebSocket transport and `wss://` additionally
    /// enables TLS. `tcp://` and no scheme mean plain lines.
    pub fn parse(server: &str) -> Result<Self, ClientError> {
        let (transport, tls, address) = if let Some(rest) = server.strip_prefix("wss://") {
            (Transport::WebSocket, true, rest)
        } else if let Some(rest) = server.strip_prefix("ws://") {
            (Transport::WebSocket, false, rest)
        } else if let Some(rest) = server.strip_prefix("tcp://") {
            (Transport::Tcp, false, rest)
        } else if server.contains("://") {
            return Err(ClientError::InvalidAddress(format!(
                "unsupported scheme in {}",
                server
            )));
        } else {
            (Transport::Tcp, false, server)
        };
        let address = address.trim_end_matches('/');

        let mut config = match address.rsplit_once(':') {
            _ if address.is_empty() => {
                return Err(ClientError::InvalidAddress("empty server address".into()))
            }
            Some((host, port)) if !host.is_empty() && !host.ends_with(':') => {
                let port = port.parse().map_err(|_| {
                    ClientError::InvalidAddress(format!("invalid port in {}", server))
                })?;
                Self::new(host.trim_matches(|c| c == '[' || c == ']'), port)
            }
            _ => Self::new(address, lw3_protocol::DEFAULT_PORT),
        };
        config.transport = transport;
        if tls {
            config.tls = Some(TlsClientConfig::new());
        }
        Ok(config)
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_retry_timeout(mut self, timeout: Duration) -> Self {
        self.retry_timeout = timeout;
        self
    }

    pub fn with_frame_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.frame_delimiter = delimiter.into();
        self
    }

    pub fn with_outbound_buffer(mut self, size: usize) -> Self {
        self.outbound_buffer = size.max(1);
        self
    }

    pub fn with_tls(mut self, tls_config: TlsClientConfig) -> Self {
        self.tls = Some(tls_config);
        self
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    /// Sets the upgrade credentials. Only used by the WebSocket transport.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    fn is_tls(&self) -> bool {
        self.tls.as_ref().is_some_and(|tls| tls.enabled)
    }

    /// Target of the WebSocket upgrade request.
    fn websocket_url(&self) -> String {
        let scheme = if self.is_tls() { "wss" } else { "ws" };
        if self.host.contains(':') {
            format!("{}://[{}]:{}/", scheme, self.host, self.port)
        } else {
            format!("{}://{}:{}/", scheme, self.host, self.port)
        }
    }
}

/// Transport state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Something the transport observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    /// One delimiter-terminated frame, without the delimiter.
    Line(String),
    Error(String),
}

struct Shared {
    config: ConnectionConfig,
    /// Outbound queue of the live socket, if any.
    writer: Mutex<Option<mpsc::Sender<String>>>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    retry_timeout_ms: AtomicU64,
    frame_delimiter: Mutex<String>,
    /// Set by `close()`: no reconnection until `reopen()`.
    shutdown: AtomicBool,
    /// Set when the handle is dropped: the task exits.
    terminated: AtomicBool,
    wake: Notify,
}

impl Shared {
    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    fn retry_timeout(&self) -> Duration {
        Duration::from_millis(self.retry_timeout_ms.load(Ordering::Relaxed))
    }
}

/// Handle to a reconnecting connection. Dropping it stops the background task.
pub struct Connection {
    shared: Arc<Shared>,
    state: watch::Receiver<ConnectionState>,
}

impl Connection {
    /// Starts connecting in the background.
    ///
    /// Returns the handle and the receiver of transport events.
    pub fn spawn(config: ConnectionConfig) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(Shared {
            retry_timeout_ms: AtomicU64::new(config.retry_timeout.as_millis() as u64),
            frame_delimiter: Mutex::new(config.frame_delimiter.clone()),
            config,
            writer: Mutex::new(None),
            events: events_tx,
            shutdown: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            wake: Notify::new(),
        });

        tokio::spawn(run(shared.clone(), state_tx));
        (
            Self {
                shared,
                state: state_rx,
            },
            events_rx,
        )
    }

    /// Queues a message for the socket.
    ///
    /// Messages written while not connected are silently dropped. A full
    /// outbound queue drops the message, reports an `Error` event and fails
    /// with [`ClientError::BufferFull`].
    pub fn write(&self, message: impl Into<String>) -> Result<(), ClientError> {
        let writer = self.shared.writer.lock();
        let Some(tx) = writer.as_ref() else {
            tracing::debug!("Not connected, dropping outgoing message");
            return Ok(());
        };
        match tx.try_send(message.into()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                tracing::warn!("Outgoing buffer is stalled, message has been dropped");
                self.shared
                    .emit(ConnectionEvent::Error(ClientError::BufferFull.to_string()));
                Err(ClientError::BufferFull)
            }
            Err(TrySendError::Closed(_)) => Ok(()),
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.state.borrow() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Returns a receiver following the transport state.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Closes the socket and stops reconnecting.
    pub fn close(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
    }

    /// Resumes connecting after [`close`](Self::close).
    pub fn reopen(&self) {
        if self.shared.shutdown.swap(false, Ordering::SeqCst) {
            self.shared.wake.notify_one();
        }
    }

    pub fn set_retry_timeout(&self, timeout: Duration) {
        self.shared
            .retry_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    /// Changes the incoming line delimiter. Takes effect on the next
    /// connection.
    pub fn set_frame_delimiter(&self, delimiter: &str) {
        *self.shared.frame_delimiter.lock() = delimiter.to_string();
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.terminated.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
    }
}

async fn run(shared: Arc<Shared>, state: watch::Sender<ConnectionState>) {
    let addr = format!("{}:{}", shared.config.host, shared.config.port);
    loop {
        if shared.is_terminated() {
            break;
        }
        if shared.is_shutdown() {
            shared.wake.notified().await;
            continue;
        }

        state.send_replace(ConnectionState::Connecting);
        tracing::debug!("Connecting to {}...", addr);
        match connect(&shared.config).await {
            Ok(link) => {
                tracing::info!("Connected to {} ({})", addr, link.describe());
                let delimiter = shared.frame_delimiter.lock().clone();
                let (tx, rx) = mpsc::channel(shared.config.outbound_buffer.max(1));
                *shared.writer.lock() = Some(tx);
                state.send_replace(ConnectionState::Connected);
                shared.emit(ConnectionEvent::Connected);

                let result = serve(&shared, link, rx, &delimiter).await;

                *shared.writer.lock() = None;
                state.send_replace(ConnectionState::Disconnected);
                if let Err(e) = result {
                    tracing::debug!("[{}] Connection error: {}", addr, e);
                    shared.emit(ConnectionEvent::Error(e.to_string()));
                }
                tracing::info!("Connection to {} was closed", addr);
                shared.emit(ConnectionEvent::Disconnected);
            }
            Err(e) => {
                state.send_replace(ConnectionState::Disconnected);
                match e {
                    ClientError::TlsConfig(_)
                    | ClientError::TlsHandshake(_)
                    | ClientError::WebSocket(_)
                    | ClientError::Unauthorized => {
                        tracing::warn!("Connection to {} failed: {}", addr, e);
                        shared.emit(ConnectionEvent::Error(e.to_string()));
                    }
                    _ => tracing::debug!("Connection to {} failed: {}", addr, e),
                }
            }
        }

        if shared.is_terminated() {
            break;
        }
        if shared.is_shutdown() {
            continue;
        }
        tokio::select! {
            _ = tokio::time::sleep(shared.retry_timeout()) => {}
            _ = shared.wake.notified() => {}
        }
    }
    tracing::debug!("Connection task for {} finished", addr);
}

async fn connect(config: &ConnectionConfig) -> Result<ServerLink, ClientError> {
    let tcp_stream = tokio::time::timeout(
        config.connect_timeout,
        TcpStream::connect((config.host.as_str(), config.port)),
    )
    .await
    .map_err(|_| ClientError::Timeout)??;
    tcp_stream.set_nodelay(true).ok();

    match config.tls {
        Some(ref tls_config) if tls_config.enabled => {
            let (connector, server_name) = if tls_config.insecure {
                tracing::warn!("Using insecure TLS (certificate verification disabled)");
                create_insecure_tls_connector(tls_config, &config.host)?
            } else {
                create_tls_connector(tls_config, &config.host)?
            };
            let inner = connector
                .connect(server_name, tcp_stream)
                .await
                .map_err(|e| ClientError::TlsHandshake(e.to_string()))?;
            upgrade(config, Socket::Tls { inner }).await
        }
        _ => upgrade(config, Socket::Plain { inner: tcp_stream }).await,
    }
}

/// Performs the WebSocket handshake when the transport asks for one.
async fn upgrade(config: &ConnectionConfig, socket: Socket) -> Result<ServerLink, ClientError> {
    if config.transport != Transport::WebSocket {
        return Ok(ServerLink::Lines(socket));
    }
    let mut request = config
        .websocket_url()
        .into_client_request()
        .map_err(|e| ClientError::InvalidAddress(e.to_string()))?;
    if let Some(ref credentials) = config.credentials {
        let value = HeaderValue::from_str(&credentials.to_header())
            .map_err(|e| ClientError::WebSocket(e.to_string()))?;
        request.headers_mut().insert(header::AUTHORIZATION, value);
    }

    let handshake = tokio_tungstenite::client_async(request, socket);
    match tokio::time::timeout(config.connect_timeout, handshake).await {
        Err(_) => Err(ClientError::Timeout),
        Ok(Ok((ws, _response))) => Ok(ServerLink::WebSocket(ws)),
        Ok(Err(WsError::Http(response))) if response.status() == StatusCode::UNAUTHORIZED => {
            Err(ClientError::Unauthorized)
        }
        Ok(Err(WsError::Io(e))) => Err(ClientError::Io(e)),
        Ok(Err(e)) => Err(ClientError::WebSocket(e.to_string())),
    }
}

/// Pumps one live socket until it closes or the handle asks to stop.
async fn serve(
    shared: &Shared,
    link: ServerLink,
    mut outbound: mpsc::Receiver<String>,
    delimiter: &str,
) -> Result<(), ClientError> {
    let (mut source, mut sink) = link.split();
    let mut decoder =
        LineDecoder::with_delimiter(delimiter).with_max_length(shared.config.max_line_length);
    let mut buf = Vec::with_capacity(8192);

    loop {
        tokio::select! {
            Some(message) = outbound.recv() => {
                tracing::debug!("> {}", message.trim_end());
                sink.send(&message).await?;
            }
            result = source.next_chunk(&mut buf) => {
                let n = result?;
                if n == 0 {
                    return Ok(());
                }
                if let Err(e) = decoder.extend(&buf) {
                    tracing::warn!("Incoming data dropped: {}", e);
                    shared.emit(ConnectionEvent::Error(e.to_string()));
                }
                while let Some(line) = decoder.next_line() {
                    tracing::debug!("< {}", line);
                    shared.emit(ConnectionEvent::Line(line));
                }
            }
            _ = shared.wake.notified() => {
                if shared.is_shutdown() || shared.is_terminated() {
                    sink.close().await;
                    return Ok(());
                }
            }
        }
    }
}
