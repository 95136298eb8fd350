//! Client error types.

use lw3_protocol::ErrorCode;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] lw3_protocol::ProtocolError),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("no answer, timeout")]
    Timeout,

    #[error("outgoing buffer is stalled, message has been dropped")]
    BufferFull,

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// An error line (`-E`, `oE`, `cE`) answering the request.
    #[error("server error {code}: {message}")]
    Protocol { code: ErrorCode, message: String },

    /// A `mE` line answering a CALL.
    #[error("method failed ({code}): {message}")]
    Method { code: ErrorCode, message: String },

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid server address: {0}")]
    InvalidAddress(String),

    #[error("unknown subscription: {0}")]
    UnknownSubscription(u64),

    /// Reported to `sync()` waiters when any request fails while they wait.
    #[error("sync interrupted: {0}")]
    SyncInterrupted(String),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("WebSocket handshake failed: {0}")]
    WebSocket(String),

    /// The server refused the WebSocket upgrade credentials.
    #[error("unauthorized")]
    Unauthorized,
}

impl ClientError {
    /// Returns the wire error code carried by a server response, if any.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Protocol { code, .. } | ClientError::Method { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Returns whether retrying the request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_)
                | ClientError::NotConnected
                | ClientError::ConnectionClosed
                | ClientError::Timeout
                | ClientError::BufferFull
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        let err = ClientError::Protocol {
            code: ErrorCode::AccessDenied,
            message: "-E SET /A.x=1 %E007:Access denied".into(),
        };
        assert_eq!(err.error_code(), Some(ErrorCode::AccessDenied));
        assert!(!err.is_retryable());
        assert!(ClientError::Timeout.is_retryable());
        assert_eq!(ClientError::Timeout.to_string(), "no answer, timeout");
        assert!(!ClientError::Unauthorized.is_retryable());
        assert_eq!(
            ClientError::InvalidAddress("host:x".into()).to_string(),
            "invalid server address: host:x"
        );
    }
}
