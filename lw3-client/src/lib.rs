//! # lw3-client
//!
//! Client library for LW3.
//!
//! This crate provides:
//! - Reconnecting TCP or WebSocket transport with fixed-interval retry
//! - Signature correlation of concurrent requests
//! - GET/SET/CALL/MAN requests and reference-counted OPEN/CLOSE subscriptions
//! - A property cache and live node views for open nodes
//! - Optional TLS and WebSocket Basic authentication

pub mod client;
pub mod connection;
pub mod error;
pub mod stream;
pub mod tls;
pub mod view;

pub use client::{ChangeCallback, Client, ClientEvent, ClientOptions};
pub use connection::{
    Connection, ConnectionConfig, ConnectionEvent, ConnectionState, TlsClientConfig,
};
pub use error::ClientError;
pub use lw3_protocol::{Credentials, Transport, Value};
pub use view::NodeView;
