//! # lw3-server
//!
//! TCP and WebSocket server for the LW3 protocol.
//!
//! This crate provides:
//! - TCP or WebSocket connection handling with async I/O and optional TLS
//! - Optional Basic authentication of WebSocket upgrades
//! - Line framing and command dispatch against an [`lw3_tree::Tree`]
//! - Per-connection sessions owning their OPEN subscriptions
//! - A registry of connected sockets for targeted writes and broadcast
//! - Prometheus metrics

pub mod config;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod session;
pub mod stream;
pub mod tls;
pub mod websocket;

pub use config::{
    AuthConfig, Config, ConfigError, MetricsConfig, NetworkConfig, TlsConfig, TreeConfig,
};
pub use error::ServerError;
pub use handler::CommandHandler;
pub use metrics::{run_metrics_server, Metrics};
pub use registry::{ConnectionRegistry, Outbox};
pub use server::{Server, ServerConfig, ServerStats};
pub use session::Session;
pub use tls::create_tls_acceptor;
pub use lw3_protocol::{Credentials, Transport};
