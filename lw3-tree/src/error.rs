//! Tree error types.

use lw3_protocol::ErrorCode;
use std::fmt;
use thiserror::Error;

/// The three kinds of entry a node can hold under a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Node,
    Property,
    Method,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryKind::Node => write!(f, "node"),
            EntryKind::Property => write!(f, "property"),
            EntryKind::Method => write!(f, "method"),
        }
    }
}

/// Errors from tree operations.
#[derive(Debug, Error)]
pub enum TreeError {
    #[error("not exists: {path}")]
    NotFound { path: String },

    #[error("access denied: {path} is read-only")]
    AccessDenied { path: String },

    #[error("{path} already exists as a {kind}")]
    NameTaken { path: String, kind: EntryKind },

    #[error("invalid path: {0:?}")]
    InvalidPath(String),

    #[error("invalid name: {0:?}")]
    InvalidName(String),

    #[error("write to {path} rejected: {code}")]
    Rejected { path: String, code: ErrorCode },

    #[error("invalid JSON document: {0}")]
    InvalidJson(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TreeError {
    /// Returns the wire error code for this failure.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            TreeError::NotFound { .. } => ErrorCode::NotExists,
            TreeError::InvalidPath(_) => ErrorCode::NotExists,
            TreeError::AccessDenied { .. } => ErrorCode::AccessDenied,
            TreeError::NameTaken { .. } => ErrorCode::AlreadyExists,
            TreeError::InvalidName(_) => ErrorCode::SyntaxError,
            TreeError::Rejected { code, .. } => *code,
            TreeError::InvalidJson(_) | TreeError::Json(_) => ErrorCode::InvalidValue,
            TreeError::Io(_) => ErrorCode::InternalError,
        }
    }
}
