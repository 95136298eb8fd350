//! Server implementation: accept loop and per-connection sessions.

use crate::config::NetworkConfig;
use crate::error::ServerError;
use crate::handler::CommandHandler;
use crate::metrics::Metrics;
use crate::registry::{ConnectionRegistry, Outbox};
use crate::session::Session;
use crate::stream::{LineReader, LineWriter, PeerStream, Socket};
use crate::websocket;
use lw3_protocol::{Credentials, LineDecoder, Transport};
use lw3_tree::Tree;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_rustls::TlsAcceptor;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Idle connection timeout. Zero disables it.
    pub idle_timeout: Duration,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Request line delimiter.
    pub frame_delimiter: String,
    /// Longest accepted request line in bytes.
    pub max_line_length: usize,
    /// Outbound messages queued per connection.
    pub outbound_buffer: usize,
    /// Raw lines or WebSocket text frames.
    pub transport: Transport,
    /// Credentials required for WebSocket upgrades.
    pub credentials: Option<Credentials>,
    /// TLS acceptor (if TLS is enabled).
    pub tls_acceptor: Option<Arc<TlsAcceptor>>,
    /// Metrics instance (if metrics are enabled).
    pub metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_connections", &self.max_connections)
            .field("frame_delimiter", &self.frame_delimiter)
            .field("max_line_length", &self.max_line_length)
            .field("outbound_buffer", &self.outbound_buffer)
            .field("transport", &self.transport)
            .field("auth_enabled", &self.credentials.is_some())
            .field("tls_enabled", &self.tls_acceptor.is_some())
            .field("metrics_enabled", &self.metrics.is_some())
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_network(&NetworkConfig {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, lw3_protocol::DEFAULT_PORT)),
            ..NetworkConfig::default()
        })
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Builds the runtime configuration from the `network` config section.
    pub fn from_network(network: &NetworkConfig) -> Self {
        Self {
            bind_addr: network.bind_addr,
            idle_timeout: network.idle_timeout(),
            max_connections: network.max_connections,
            frame_delimiter: network.frame_delimiter.clone(),
            max_line_length: network.max_line_length,
            outbound_buffer: network.outbound_buffer.max(1),
            transport: network.transport,
            credentials: None,
            tls_acceptor: None,
            metrics: None,
        }
    }

    /// Sets the TLS acceptor.
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(Arc::new(acceptor));
        self
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    /// Requires Basic credentials on WebSocket upgrades.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Returns whether TLS is enabled.
    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub errors_total: AtomicU64,
}

/// LW3 server: accepts connections and dispatches their request lines
/// against a shared [`Tree`].
pub struct Server {
    config: ServerConfig,
    handler: Arc<CommandHandler>,
    registry: Arc<ConnectionRegistry>,
    stats: Arc<ServerStats>,
    next_socket_id: AtomicU64,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    /// Creates a new server serving `tree`.
    pub fn new(config: ServerConfig, tree: Tree) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let mut handler = CommandHandler::new(tree);
        if let Some(ref metrics) = config.metrics {
            handler = handler.with_metrics(metrics.clone());
        }
        Self {
            config,
            handler: Arc::new(handler),
            registry: Arc::new(ConnectionRegistry::new()),
            stats: Arc::new(ServerStats::default()),
            next_socket_id: AtomicU64::new(1),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Binds the configured address and runs the server until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Runs the accept loop on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        // Subscribe before flagging as running so a shutdown issued right
        // after `is_running()` turns true is not missed.
        let mut shutdown_rx = self.shutdown.subscribe();
        self.running.store(true, Ordering::SeqCst);

        let tls_mode = if self.config.tls_enabled() {
            "TLS"
        } else {
            "plain"
        };
        tracing::info!(
            "Server listening on {} ({}, {})",
            listener.local_addr()?,
            self.config.transport,
            tls_mode
        );

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((tcp_stream, addr)) => self.accept(tcp_stream, addr),
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn accept(&self, tcp_stream: TcpStream, addr: SocketAddr) {
        if self.stats.connections_active.load(Ordering::Relaxed)
            >= self.config.max_connections as u64
        {
            tracing::warn!("Connection limit reached, rejecting {}", addr);
            self.stats
                .connections_rejected
                .fetch_add(1, Ordering::Relaxed);
            return;
        }

        let socket_id = self.next_socket_id.fetch_add(1, Ordering::Relaxed);
        self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
        self.stats.connections_active.fetch_add(1, Ordering::Relaxed);
        if let Some(ref metrics) = self.config.metrics {
            metrics.connections_total.inc();
            metrics.connections_active.inc();
        }

        let handler = self.handler.clone();
        let registry = self.registry.clone();
        let stats = self.stats.clone();
        let config = self.config.clone();
        let mut conn_shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            match Self::establish(tcp_stream, &config, addr).await {
                Ok(stream) => {
                    let result = Self::handle_connection(
                        stream,
                        addr,
                        socket_id,
                        handler,
                        registry,
                        &config,
                        &mut conn_shutdown,
                    )
                    .await;

                    if let Err(e) = result {
                        tracing::debug!("[{}] Connection error: {}", addr, e);
                        stats.errors_total.fetch_add(1, Ordering::Relaxed);
                    }
                    tracing::info!("[{}] Client disconnected (socket {})", addr, socket_id);
                }
                Err(e) => {
                    tracing::warn!("[{}] Handshake failed: {}", addr, e);
                    stats.errors_total.fetch_add(1, Ordering::Relaxed);
                }
            }

            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
            if let Some(ref metrics) = config.metrics {
                metrics.connections_active.dec();
            }
        });
    }

    /// Performs the TLS handshake and the WebSocket upgrade, as configured.
    async fn establish(
        tcp_stream: TcpStream,
        config: &ServerConfig,
        addr: SocketAddr,
    ) -> Result<PeerStream, ServerError> {
        let socket: Socket = match config.tls_acceptor.as_deref() {
            Some(acceptor) => {
                tracing::debug!("[{}] Performing TLS handshake", addr);
                let tls_stream = acceptor
                    .accept(tcp_stream)
                    .await
                    .map_err(|e| ServerError::TlsHandshake(e.to_string()))?;
                tracing::debug!("[{}] TLS handshake complete", addr);
                tls_stream.into()
            }
            None => tcp_stream.into(),
        };

        match config.transport {
            Transport::Tcp => Ok(PeerStream::Lines(socket)),
            Transport::WebSocket => {
                let ws = websocket::accept(socket, config.credentials.as_ref()).await?;
                tracing::debug!("[{}] WebSocket upgrade complete", addr);
                Ok(PeerStream::WebSocket(ws))
            }
        }
    }

    /// Handles a single connection until the peer leaves, idles out or the
    /// server shuts down.
    async fn handle_connection(
        stream: PeerStream,
        addr: SocketAddr,
        socket_id: u64,
        handler: Arc<CommandHandler>,
        registry: Arc<ConnectionRegistry>,
        config: &ServerConfig,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let tls_status = if stream.is_tls() { " (TLS)" } else { "" };
        let ws_status = if stream.is_websocket() { " (WebSocket)" } else { "" };
        tracing::info!(
            "[{}] Client connected as socket {}{}{}",
            addr,
            socket_id,
            ws_status,
            tls_status
        );

        let (tx, mut outbound) = mpsc::channel::<String>(config.outbound_buffer);
        let outbox = Outbox::new(socket_id, tx, config.metrics.clone());
        registry.register(outbox.clone());

        let session = Session::new(socket_id, addr, outbox).with_metrics(config.metrics.clone());
        let result =
            Self::run_session(stream, session, &mut outbound, &handler, config, shutdown).await;

        registry.unregister(socket_id);
        result
    }

    async fn run_session(
        stream: PeerStream,
        mut session: Session,
        outbound: &mut mpsc::Receiver<String>,
        handler: &CommandHandler,
        config: &ServerConfig,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let addr = session.remote_addr;
        let (mut reader, mut writer) = stream.split();
        let mut decoder = LineDecoder::with_delimiter(&config.frame_delimiter)
            .with_max_length(config.max_line_length);
        let mut buf = Vec::with_capacity(8192);
        let idle_enabled = !config.idle_timeout.is_zero();

        loop {
            let mut overflow = None;
            tokio::select! {
                biased;

                Some(message) = outbound.recv() => {
                    writer.send(&message).await?;
                    writer.flush().await?;
                }

                result = Self::read_chunk(&mut reader, &mut buf) => {
                    match result {
                        Ok(0) => {
                            tracing::debug!("[{}] Connection closed by client", addr);
                            return Ok(());
                        }
                        Ok(n) => {
                            tracing::debug!("[{}] Received {} bytes", addr, n);
                            overflow = decoder.extend(&buf).err();
                        }
                        Err(e) => {
                            tracing::debug!("[{}] Read error: {}", addr, e);
                            return Err(ServerError::Io(e));
                        }
                    }
                }

                _ = tokio::time::sleep(config.idle_timeout), if idle_enabled => {
                    if session.idle_duration() >= config.idle_timeout {
                        tracing::info!("[{}] Idle timeout", addr);
                        return Ok(());
                    }
                }

                _ = shutdown.recv() => {
                    tracing::debug!("[{}] Shutdown signal received", addr);
                    return Err(ServerError::ShuttingDown);
                }
            }

            // Lines completed before an over-long one are answered first.
            while let Some(line) = decoder.next_line() {
                tracing::debug!("[{}] Request: {}", addr, line);
                let response = handler.handle_line(&mut session, &line).await;
                Self::write_response(&mut writer, outbound, &response).await?;
            }
            if let Some(e) = overflow {
                tracing::warn!("[{}] {}", addr, e);
                let response = handler.line_too_long(&e);
                Self::write_response(&mut writer, outbound, &response).await?;
            }
        }
    }

    async fn read_chunk(reader: &mut LineReader, buf: &mut Vec<u8>) -> std::io::Result<usize> {
        buf.clear();
        buf.reserve(8192);
        reader.read_chunk(buf).await
    }

    /// Writes a response after every message queued before it, so CHG lines
    /// caused by a request precede its answer.
    async fn write_response(
        writer: &mut LineWriter,
        outbound: &mut mpsc::Receiver<String>,
        response: &str,
    ) -> Result<(), ServerError> {
        while let Ok(message) = outbound.try_recv() {
            writer.send(&message).await?;
        }
        if !response.is_empty() {
            writer.send(response).await?;
        }
        writer.flush().await?;
        Ok(())
    }

    /// Initiates server shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns a receiver notified when the server shuts down.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns the served tree.
    pub fn tree(&self) -> &Tree {
        self.handler.tree()
    }

    /// Returns the registry of connected sockets, for writing to one socket
    /// or broadcasting to all of them.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
    use tokio_tungstenite::tungstenite::Message;

    async fn start(config: ServerConfig) -> (Arc<Server>, SocketAddr) {
        let tree = Tree::new();
        tree.node("/A").unwrap().set("x", 1).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(Server::new(config, tree));
        let running = server.clone();
        tokio::spawn(async move { running.serve(listener).await });
        (server, addr)
    }

    #[test]
    fn test_config_from_network() {
        let network = NetworkConfig {
            idle_timeout_secs: 30,
            outbound_buffer: 0,
            ..NetworkConfig::default()
        };
        let config = ServerConfig::from_network(&network);
        assert_eq!(config.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.outbound_buffer, 1);
        assert!(!config.tls_enabled());
        assert_eq!(ServerConfig::default().bind_addr.port(), 6107);
    }

    #[tokio::test]
    async fn test_request_response() {
        let (server, addr) = start(ServerConfig::default()).await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        write.write_all(b"0001#GET /A.x\r\n").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "{0001");
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "pw /A.x=1");
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "}");

        assert_eq!(server.registry().len(), 1);
        assert_eq!(server.stats().connections_total.load(Ordering::Relaxed), 1);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_overlong_line_answered_after_complete_lines() {
        let mut config = ServerConfig::default();
        config.max_line_length = 16;
        let (server, addr) = start(config).await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        let mut chunk = b"GET /A.x\n".to_vec();
        chunk.extend_from_slice(&[b'x'; 20]);
        write.write_all(&chunk).await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "pw /A.x=1");
        assert_eq!(
            lines.next_line().await.unwrap().unwrap(),
            "-E  %E009:Command too long"
        );

        // The rest of the rejected line is skipped, not executed.
        write.write_all(b"SET /A.x=2\nGET /A.x\n").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "pw /A.x=1");
        server.shutdown();
    }

    #[tokio::test]
    async fn test_websocket_session_with_auth() {
        let credentials = Credentials::new("user", "pass");
        let config = ServerConfig::default()
            .with_transport(Transport::WebSocket)
            .with_credentials(credentials.clone());
        let (server, addr) = start(config).await;
        let url = format!("ws://{}/", addr);

        // Upgrades without or with wrong credentials are refused.
        assert!(tokio_tungstenite::connect_async(url.as_str()).await.is_err());
        let mut request = url.as_str().into_client_request().unwrap();
        request.headers_mut().insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&Credentials::new("user", "wrong").to_header()).unwrap(),
        );
        assert!(tokio_tungstenite::connect_async(request).await.is_err());

        let mut request = url.as_str().into_client_request().unwrap();
        request.headers_mut().insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&credentials.to_header()).unwrap(),
        );
        let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();

        // Lines may be split across frames.
        ws.send(Message::Text("0001#GET /A.x\nGET ".into()))
            .await
            .unwrap();
        ws.send(Message::Text("/\n".into())).await.unwrap();

        let mut text = String::new();
        while text.matches('\n').count() < 4 {
            let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Text(chunk) = frame {
                text.push_str(&chunk);
            }
        }
        assert_eq!(text, "{0001\npw /A.x=1\n}\nn- /A\n");
        server.shutdown();
    }

    #[tokio::test]
    async fn test_broadcast_reaches_client() {
        let (server, addr) = start(ServerConfig::default()).await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        // A round trip guarantees the socket is registered.
        write.write_all(b"GET /\n").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "n- /A");

        assert_eq!(server.registry().broadcast("hello\n"), 1);
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "hello");
        server.shutdown();
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let (server, addr) = start(ServerConfig::default().with_max_connections(0)).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 16];
        // The server drops the socket without answering.
        let n = stream.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
        assert_eq!(server.stats().connections_rejected.load(Ordering::Relaxed), 1);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let config = ServerConfig::default().with_idle_timeout(Duration::from_millis(100));
        let (server, addr) = start(config).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown() {
        let (server, _addr) = start(ServerConfig::default()).await;
        for _ in 0..100 {
            if server.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(server.is_running());

        server.shutdown();
        for _ in 0..100 {
            if !server.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!server.is_running());
    }
}
