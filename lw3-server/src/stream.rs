//! Connection transports.
//!
//! An accepted [`Socket`] is plain TCP or TLS. A [`PeerStream`] is a socket
//! ready to carry protocol lines, either directly or as WebSocket text
//! frames. Sessions only deal with the [`LineReader`] and [`LineWriter`]
//! halves, so the dispatch loop is the same for every transport.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

pin_project! {
    /// An accepted socket, encrypted or not.
    #[project = SocketProj]
    pub enum Socket {
        Plain { #[pin] inner: TcpStream },
        Tls { #[pin] inner: TlsStream<TcpStream> },
    }
}

impl Socket {
    pub fn is_tls(&self) -> bool {
        matches!(self, Socket::Tls { .. })
    }
}

impl From<TcpStream> for Socket {
    fn from(inner: TcpStream) -> Self {
        Socket::Plain { inner }
    }
}

impl From<TlsStream<TcpStream>> for Socket {
    fn from(inner: TlsStream<TcpStream>) -> Self {
        Socket::Tls { inner }
    }
}

impl AsyncRead for Socket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            SocketProj::Plain { inner } => inner.poll_read(cx, buf),
            SocketProj::Tls { inner } => inner.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Socket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            SocketProj::Plain { inner } => inner.poll_write(cx, buf),
            SocketProj::Tls { inner } => inner.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            SocketProj::Plain { inner } => inner.poll_flush(cx),
            SocketProj::Tls { inner } => inner.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            SocketProj::Plain { inner } => inner.poll_shutdown(cx),
            SocketProj::Tls { inner } => inner.poll_shutdown(cx),
        }
    }
}

/// A socket after the WebSocket handshake.
pub type WebSocket = WebSocketStream<Socket>;

/// A connection ready to exchange protocol lines.
pub enum PeerStream {
    /// Lines written directly to the socket.
    Lines(Socket),
    /// Lines carried in WebSocket text frames.
    WebSocket(WebSocket),
}

impl PeerStream {
    pub fn is_tls(&self) -> bool {
        match self {
            PeerStream::Lines(socket) => socket.is_tls(),
            PeerStream::WebSocket(ws) => ws.get_ref().is_tls(),
        }
    }

    pub fn is_websocket(&self) -> bool {
        matches!(self, PeerStream::WebSocket(_))
    }

    /// Splits the connection into independently usable halves.
    pub fn split(self) -> (LineReader, LineWriter) {
        match self {
            PeerStream::Lines(socket) => {
                let (reader, writer) = tokio::io::split(socket);
                (LineReader::Lines(reader), LineWriter::Lines(writer))
            }
            PeerStream::WebSocket(ws) => {
                let (sink, stream) = ws.split();
                (LineReader::WebSocket(stream), LineWriter::WebSocket(sink))
            }
        }
    }
}

/// Receiving half of a [`PeerStream`].
pub enum LineReader {
    Lines(ReadHalf<Socket>),
    WebSocket(SplitStream<WebSocket>),
}

impl LineReader {
    /// Appends the next chunk of received text to `buf` and returns its
    /// length. Zero means the peer has gone.
    ///
    /// Binary, ping and pong frames carry no protocol data and are skipped.
    pub async fn read_chunk(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        match self {
            LineReader::Lines(reader) => reader.read_buf(buf).await,
            LineReader::WebSocket(stream) => loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) if !text.is_empty() => {
                        buf.extend_from_slice(text.as_bytes());
                        return Ok(text.len());
                    }
                    Some(Ok(Message::Binary(_))) => {
                        tracing::debug!("Binary WebSocket frame discarded");
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(0),
                    Some(Ok(_)) => {}
                    Some(Err(
                        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed,
                    )) => return Ok(0),
                    Some(Err(e)) => return Err(websocket_error(e)),
                }
            },
        }
    }
}

/// Sending half of a [`PeerStream`].
pub enum LineWriter {
    Lines(WriteHalf<Socket>),
    WebSocket(SplitSink<WebSocket, Message>),
}

impl LineWriter {
    /// Queues `text`. Over WebSocket each call becomes one text frame.
    pub async fn send(&mut self, text: &str) -> io::Result<()> {
        match self {
            LineWriter::Lines(writer) => writer.write_all(text.as_bytes()).await,
            LineWriter::WebSocket(sink) => sink
                .feed(Message::Text(text.to_string()))
                .await
                .map_err(websocket_error),
        }
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        match self {
            LineWriter::Lines(writer) => writer.flush().await,
            LineWriter::WebSocket(sink) => sink.flush().await.map_err(websocket_error),
        }
    }
}

fn websocket_error(e: tungstenite::Error) -> io::Error {
    match e {
        tungstenite::Error::Io(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}
