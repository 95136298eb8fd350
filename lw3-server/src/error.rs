//! Server error types.

use lw3_protocol::ErrorCode;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] lw3_protocol::ProtocolError),

    #[error("tree error: {0}")]
    Tree(#[from] lw3_tree::TreeError),

    #[error("node already opened: {path}")]
    AlreadyOpened { path: String },

    #[error("node not opened: {path}")]
    NotOpened { path: String },

    #[error("server shutting down")]
    ShuttingDown,

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("WebSocket handshake failed: {0}")]
    WebSocket(String),
}

impl ServerError {
    /// Converts to the wire error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ServerError::Protocol(e) => e.error_code(),
            ServerError::Tree(e) => e.error_code(),
            ServerError::AlreadyOpened { .. } => ErrorCode::AlreadyExists,
            ServerError::NotOpened { .. } => ErrorCode::NotExists,
            ServerError::Io(_)
            | ServerError::ShuttingDown
            | ServerError::TlsConfig(_)
            | ServerError::TlsHandshake(_)
            | ServerError::WebSocket(_) => ErrorCode::InternalError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lw3_protocol::ProtocolError;
    use lw3_tree::TreeError;

    #[test]
    fn test_error_codes() {
        let err: ServerError = ProtocolError::UnknownCommand("FOO".into()).into();
        assert_eq!(err.error_code(), ErrorCode::SyntaxError);

        let err: ServerError = ProtocolError::LineTooLong { size: 10, max: 5 }.into();
        assert_eq!(err.error_code(), ErrorCode::CommandTooLong);

        let err: ServerError = TreeError::AccessDenied { path: "/A.x".into() }.into();
        assert_eq!(err.error_code(), ErrorCode::AccessDenied);

        let err = ServerError::AlreadyOpened { path: "/A".into() };
        assert_eq!(err.error_code(), ErrorCode::AlreadyExists);
        assert_eq!(err.to_string(), "node already opened: /A");

        assert_eq!(
            ServerError::NotOpened { path: "/A".into() }.error_code(),
            ErrorCode::NotExists
        );
    }
}
