//! Response lines, `{SIG ... }` blocks and `CHG` notifications.

use crate::error::{ErrorCode, ProtocolError};
use crate::escape::{escape, unescape};
use crate::signature::Signature;
use crate::value::{convert_value, Value};
use std::fmt;

/// One tagged response line.
///
/// Paths are the full addressed name (`/A/B`, `/A/B.Prop` or `/A/B:method`).
/// Values, manuals and messages are held unescaped and escaped on output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseLine {
    /// `n- /A/B`
    Node { path: String },
    /// `pw /A.x=v` or `pr /A.x=v`
    Property {
        path: String,
        rw: bool,
        value: String,
    },
    /// `m- /A:m`
    Method { path: String },
    /// `pm /A.x=manual`
    PropertyManual { path: String, manual: String },
    /// `mm /A:m=manual`
    MethodManual { path: String, manual: String },
    /// `mO /A:m` or `mO /A:m=result`
    MethodOk {
        path: String,
        result: Option<String>,
    },
    /// `mE /A:m %Ennn:text`
    MethodError { path: String, code: ErrorCode },
    /// `mE /A:m=message %E010:Internal error`
    MethodFailure { path: String, message: String },
    /// `o- /A`
    Opened { path: String },
    /// `oE /A %Ennn:text`
    OpenError { path: String, code: ErrorCode },
    /// `c- /A`
    Closed { path: String },
    /// `cE /A %Ennn:text`
    CloseError { path: String, code: ErrorCode },
    /// `-E <request> %Ennn:text`
    Error { request: String, code: ErrorCode },
}

impl ResponseLine {
    /// Returns true for the error variants.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            ResponseLine::MethodError { .. }
                | ResponseLine::MethodFailure { .. }
                | ResponseLine::OpenError { .. }
                | ResponseLine::CloseError { .. }
                | ResponseLine::Error { .. }
        )
    }

    /// Returns the wire error code carried by an error line.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            ResponseLine::MethodError { code, .. }
            | ResponseLine::OpenError { code, .. }
            | ResponseLine::CloseError { code, .. }
            | ResponseLine::Error { code, .. } => Some(*code),
            ResponseLine::MethodFailure { .. } => Some(ErrorCode::InternalError),
            _ => None,
        }
    }
}

impl fmt::Display for ResponseLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseLine::Node { path } => write!(f, "n- {path}"),
            ResponseLine::Property { path, rw, value } => {
                let tag = if *rw { "pw" } else { "pr" };
                write!(f, "{tag} {path}={}", escape(value))
            }
            ResponseLine::Method { path } => write!(f, "m- {path}"),
            ResponseLine::PropertyManual { path, manual } => {
                write!(f, "pm {path}={}", escape(manual))
            }
            ResponseLine::MethodManual { path, manual } => {
                write!(f, "mm {path}={}", escape(manual))
            }
            ResponseLine::MethodOk { path, result: None } => write!(f, "mO {path}"),
            ResponseLine::MethodOk {
                path,
                result: Some(result),
            } => write!(f, "mO {path}={}", escape(result)),
            ResponseLine::MethodError { path, code } => write!(f, "mE {path} {code}"),
            ResponseLine::MethodFailure { path, message } => write!(
                f,
                "mE {path}={} {}",
                escape(message),
                ErrorCode::InternalError
            ),
            ResponseLine::Opened { path } => write!(f, "o- {path}"),
            ResponseLine::OpenError { path, code } => write!(f, "oE {path} {code}"),
            ResponseLine::Closed { path } => write!(f, "c- {path}"),
            ResponseLine::CloseError { path, code } => write!(f, "cE {path} {code}"),
            ResponseLine::Error { request, code } => write!(f, "-E {request} {code}"),
        }
    }
}

/// Renders the reply to one request.
///
/// Signed requests get their lines wrapped in `{SIG` / `}`; unsigned requests
/// get the bare lines. Every line, including the last, ends with `\n`.
pub fn frame_response(signature: Option<Signature>, lines: &[ResponseLine]) -> String {
    let mut out = String::new();
    if let Some(sig) = signature {
        out.push('{');
        out.push_str(&sig.to_string());
        out.push('\n');
    }
    for line in lines {
        out.push_str(&line.to_string());
        out.push('\n');
    }
    if signature.is_some() {
        out.push_str("}\n");
    }
    out
}

/// A `CHG /PATH.Prop=value` push notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    /// Node path.
    pub path: String,
    /// Property name.
    pub property: String,
    raw_value: String,
}

impl Change {
    /// Creates a notification for an unescaped property value.
    pub fn new(path: impl Into<String>, property: impl Into<String>, value: &str) -> Self {
        Self {
            path: path.into(),
            property: property.into(),
            raw_value: escape(value),
        }
    }

    /// Parses a `CHG` line.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let body = line
            .strip_prefix("CHG ")
            .ok_or_else(|| ProtocolError::Syntax(line.to_string()))?;
        let eq = body
            .find('=')
            .ok_or_else(|| ProtocolError::Syntax(line.to_string()))?;
        let target = &body[..eq];
        let dot = target
            .find('.')
            .ok_or_else(|| ProtocolError::Syntax(line.to_string()))?;
        Ok(Self {
            path: target[..dot].to_string(),
            property: target[dot + 1..].to_string(),
            raw_value: body[eq + 1..].to_string(),
        })
    }

    /// The value exactly as it appears on the wire (escaped).
    pub fn raw_value(&self) -> &str {
        &self.raw_value
    }

    /// The unescaped value.
    pub fn value(&self) -> String {
        unescape(&self.raw_value)
    }

    /// The unescaped value run through [`convert_value`].
    pub fn converted(&self) -> Value {
        convert_value(&self.value())
    }

    /// Returns the wire line including the terminating newline.
    pub fn to_line(&self) -> String {
        format!("{}\n", self)
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CHG {}.{}={}", self.path, self.property, self.raw_value)
    }
}

/// A classified inbound line on the client side.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// An asynchronous change notification.
    Change(Change),
    /// A complete `{SIG ... }` block.
    Block {
        signature: Signature,
        lines: Vec<String>,
    },
    /// A line that belongs to no block and is not a notification.
    Stray(String),
}

/// Groups inbound lines into notifications and response blocks.
#[derive(Debug, Default)]
pub struct BlockAssembler {
    open: Option<(Signature, Vec<String>)>,
}

impl BlockAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one line (without terminator). Returns an item once one is
    /// complete.
    pub fn push(&mut self, line: &str) -> Option<Incoming> {
        if line.starts_with("CHG ") {
            return Some(match Change::parse(line) {
                Ok(change) => Incoming::Change(change),
                Err(_) => Incoming::Stray(line.to_string()),
            });
        }

        if let Some((signature, lines)) = self.open.as_mut() {
            if line == "}" {
                let signature = *signature;
                let lines = std::mem::take(lines);
                self.open = None;
                return Some(Incoming::Block { signature, lines });
            }
            lines.push(line.to_string());
            return None;
        }

        if let Some(tag) = line.strip_prefix('{') {
            if let Ok(signature) = tag.get(..4).unwrap_or(tag).parse::<Signature>() {
                self.open = Some((signature, Vec::new()));
                return None;
            }
        }
        if line.is_empty() {
            return None;
        }
        Some(Incoming::Stray(line.to_string()))
    }

    /// Returns true while a block is open.
    pub fn in_block(&self) -> bool {
        self.open.is_some()
    }

    /// Discards a partially received block.
    pub fn reset(&mut self) {
        self.open = None;
    }
}

/// Returns the text after the first `=` of a response line, if any.
pub fn line_value(line: &str) -> Option<&str> {
    line.find('=').map(|eq| &line[eq + 1..])
}
