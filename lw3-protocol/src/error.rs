//! Protocol error types and wire error codes.

use std::fmt;
use thiserror::Error;

/// Errors raised while framing or parsing protocol text.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("invalid signature: {0:?}")]
    InvalidSignature(String),

    #[error("line too long: {size} bytes (max {max})")]
    LineTooLong { size: usize, max: usize },

    #[error("invalid error header: {0:?}")]
    InvalidErrorHeader(String),
}

impl ProtocolError {
    /// Returns the wire error code this failure is reported with.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ProtocolError::LineTooLong { .. } => ErrorCode::CommandTooLong,
            _ => ErrorCode::SyntaxError,
        }
    }
}

/// Numeric error codes carried in `%Ennn:text` headers.
///
/// The numeric ids are part of the wire contract and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    SyntaxError,
    NotExists,
    AlreadyExists,
    InvalidValue,
    IllegalParameterCount,
    IllegalOperation,
    AccessDenied,
    Timeout,
    CommandTooLong,
    InternalError,
    NotImplemented,
    NodeDisabled,
    /// Any code outside the known table.
    Other(u16),
}

impl ErrorCode {
    /// Maps a numeric code to its variant.
    pub fn from_code(code: u16) -> Self {
        match code {
            1 => ErrorCode::SyntaxError,
            2 => ErrorCode::NotExists,
            3 => ErrorCode::AlreadyExists,
            4 => ErrorCode::InvalidValue,
            5 => ErrorCode::IllegalParameterCount,
            6 => ErrorCode::IllegalOperation,
            7 => ErrorCode::AccessDenied,
            8 => ErrorCode::Timeout,
            9 => ErrorCode::CommandTooLong,
            10 => ErrorCode::InternalError,
            11 => ErrorCode::NotImplemented,
            12 => ErrorCode::NodeDisabled,
            other => ErrorCode::Other(other),
        }
    }

    /// Returns the numeric code.
    pub fn code(&self) -> u16 {
        match self {
            ErrorCode::SyntaxError => 1,
            ErrorCode::NotExists => 2,
            ErrorCode::AlreadyExists => 3,
            ErrorCode::InvalidValue => 4,
            ErrorCode::IllegalParameterCount => 5,
            ErrorCode::IllegalOperation => 6,
            ErrorCode::AccessDenied => 7,
            ErrorCode::Timeout => 8,
            ErrorCode::CommandTooLong => 9,
            ErrorCode::InternalError => 10,
            ErrorCode::NotImplemented => 11,
            ErrorCode::NodeDisabled => 12,
            ErrorCode::Other(code) => *code,
        }
    }

    /// Returns the human readable text of the header.
    pub fn description(&self) -> &'static str {
        match self {
            ErrorCode::SyntaxError => "Syntax error",
            ErrorCode::NotExists => "Not exists",
            ErrorCode::AlreadyExists => "Already exists",
            ErrorCode::InvalidValue => "Invalid value",
            ErrorCode::IllegalParameterCount => "Illegal parameter count",
            ErrorCode::IllegalOperation => "Illegal operation",
            ErrorCode::AccessDenied => "Access denied",
            ErrorCode::Timeout => "Timeout",
            ErrorCode::CommandTooLong => "Command too long",
            ErrorCode::InternalError => "Internal error",
            ErrorCode::NotImplemented => "Not implemented",
            ErrorCode::NodeDisabled => "Node disabled or standby mode active",
            ErrorCode::Other(_) => "Unknown error",
        }
    }

    /// Finds the first `%Ennn` marker in a response line and returns its code.
    ///
    /// The text after the digits is not checked, so both `%E007:Access denied`
    /// and the looser `%E007 Access denied` are accepted.
    pub fn from_header(text: &str) -> Result<Self, ProtocolError> {
        let start = text
            .find("%E")
            .ok_or_else(|| ProtocolError::InvalidErrorHeader(text.to_string()))?;
        let digits: String = text[start + 2..]
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        if digits.is_empty() {
            return Err(ProtocolError::InvalidErrorHeader(text.to_string()));
        }
        digits
            .parse::<u16>()
            .map(ErrorCode::from_code)
            .map_err(|_| ProtocolError::InvalidErrorHeader(text.to_string()))
    }
}

/// Renders the wire header, e.g. `%E002:Not exists`.
impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%E{:03}:{}", self.code(), self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_headers() {
        assert_eq!(ErrorCode::SyntaxError.to_string(), "%E001:Syntax error");
        assert_eq!(ErrorCode::NotExists.to_string(), "%E002:Not exists");
        assert_eq!(ErrorCode::AccessDenied.to_string(), "%E007:Access denied");
        assert_eq!(ErrorCode::InternalError.to_string(), "%E010:Internal error");
        assert_eq!(
            ErrorCode::NodeDisabled.to_string(),
            "%E012:Node disabled or standby mode active"
        );
    }

    #[test]
    fn test_unknown_code_renders_unknown_error() {
        assert_eq!(ErrorCode::from_code(42).to_string(), "%E042:Unknown error");
        assert_eq!(ErrorCode::from_code(1234).to_string(), "%E1234:Unknown error");
    }

    #[test]
    fn test_code_table_is_stable() {
        for code in 1..=12u16 {
            let parsed = ErrorCode::from_code(code);
            assert!(!matches!(parsed, ErrorCode::Other(_)));
            assert_eq!(parsed.code(), code);
        }
        assert_eq!(ErrorCode::from_code(0), ErrorCode::Other(0));
    }

    #[test]
    fn test_from_header() {
        assert_eq!(
            ErrorCode::from_header("-E GET /A %E002:Not exists").unwrap(),
            ErrorCode::NotExists
        );
        assert_eq!(
            ErrorCode::from_header("%E007 Access denied").unwrap(),
            ErrorCode::AccessDenied
        );
        assert!(ErrorCode::from_header("mE /A:b=oops").is_err());
        assert!(ErrorCode::from_header("%Exyz").is_err());
    }

    #[test]
    fn test_protocol_error_codes() {
        let err = ProtocolError::LineTooLong { size: 10, max: 5 };
        assert_eq!(err.error_code(), ErrorCode::CommandTooLong);
        assert!(err.to_string().contains("10"));

        let err = ProtocolError::Syntax("GET".to_string());
        assert_eq!(err.error_code(), ErrorCode::SyntaxError);
    }
}
