//! Client side of a connection: the socket, optionally wrapped in a
//! WebSocket, split into a frame source and a frame sink.

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
use tokio_rustls::client::TlsStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

pin_project! {
    /// The socket of one connection attempt.
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

/// An established connection to the server.
pub enum ServerLink {
    Lines(Socket),
    WebSocket(WebSocketStream<Socket>),
}

impl ServerLink {
    pub fn is_tls(&self) -> bool {
        match self {
            ServerLink::Lines(socket) => socket.is_tls(),
            ServerLink::WebSocket(ws) => ws.get_ref().is_tls(),
        }
    }

    pub fn describe(&self) -> &'static str {
        match (self, self.is_tls()) {
            (ServerLink::Lines(_), false) => "tcp",
            (ServerLink::Lines(_), true) => "tcp, TLS",
            (ServerLink::WebSocket(_), false) => "ws",
            (ServerLink::WebSocket(_), true) => "wss",
        }
    }

    pub fn split(self) -> (FrameSource, FrameSink) {
        match self {
            ServerLink::Lines(socket) => {
                let (reader, writer) = tokio::io::split(socket);
                (FrameSource::Lines(reader), FrameSink::Lines(writer))
            }
            ServerLink::WebSocket(ws) => {
                let (sink, stream) = ws.split();
                (FrameSource::WebSocket(stream), FrameSink::WebSocket(sink))
            }
        }
    }
}

/// Incoming bytes of a [`ServerLink`].
pub enum FrameSource {
    Lines(ReadHalf<Socket>),
    WebSocket(SplitStream<WebSocketStream<Socket>>),
}

impl FrameSource {
    /// Reads the next chunk into `buf`, replacing its contents. An empty
    /// chunk means the server closed the connection.
    pub async fn next_chunk(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        buf.clear();
        match self {
            FrameSource::Lines(reader) => {
                buf.reserve(8192);
                reader.read_buf(buf).await
            }
            FrameSource::WebSocket(stream) => loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) if !text.is_empty() => {
                        buf.extend_from_slice(text.as_bytes());
                        return Ok(buf.len());
                    }
                    Some(Ok(Message::Binary(_))) => {
                        tracing::debug!("Binary data received, discarding");
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(0),
                    Some(Ok(_)) => {}
                    Some(Err(
                        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed,
                    )) => return Ok(0),
                    Some(Err(e)) => return Err(into_io(e)),
                }
            },
        }
    }
}

/// Outgoing side of a [`ServerLink`].
pub enum FrameSink {
    Lines(WriteHalf<Socket>),
    WebSocket(SplitSink<WebSocketStream<Socket>, Message>),
}

impl FrameSink {
    /// Sends one message and flushes it.
    pub async fn send(&mut self, message: &str) -> io::Result<()> {
        match self {
            FrameSink::Lines(writer) => {
                writer.write_all(message.as_bytes()).await?;
                writer.flush().await
            }
            FrameSink::WebSocket(sink) => sink
                .send(Message::Text(message.to_string()))
                .await
                .map_err(into_io),
        }
    }

    pub async fn close(&mut self) {
        let _ = match self {
            FrameSink::Lines(writer) => writer.shutdown().await,
            FrameSink::WebSocket(sink) => sink.close().await.map_err(into_io),
        };
    }
}

fn into_io(e: tungstenite::Error) -> io::Error {
    match e {
        tungstenite::Error::Io(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}
