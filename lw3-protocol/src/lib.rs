//! # lw3-protocol
//!
//! Wire protocol implementation for the LW3 text protocol.
//!
//! This crate provides:
//! - Escaping of reserved characters and typed value conversion
//! - Request parsing and formatting for GET/SET/CALL/MAN/OPEN/CLOSE
//! - Response line formatting, `{SIG ... }` blocks and `CHG` notifications
//! - Error codes and the `%Ennn:text` header format
//! - Line framing for byte streams
//! - Transport selection and Basic credentials for WebSocket upgrades

pub mod codec;
pub mod command;
pub mod error;
pub mod escape;
pub mod response;
pub mod signature;
pub mod transport;
pub mod value;

pub use codec::{encode_line, LineDecoder};
pub use command::{Command, ManTarget, Request, Selector};
pub use error::{ErrorCode, ProtocolError};
pub use escape::{escape, unescape};
pub use response::{frame_response, line_value, BlockAssembler, Change, Incoming, ResponseLine};
pub use signature::{split_signature, Signature, SignatureCounter};
pub use transport::{Credentials, Transport};
pub use value::{convert_value, Value};

/// Default TCP port of an LW3 server.
pub const DEFAULT_PORT: u16 = 6107;

/// Maximum number of bytes buffered for a single unterminated line.
pub const MAX_LINE_LENGTH: usize = 1_000_000;
