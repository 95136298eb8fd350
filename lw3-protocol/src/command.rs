//! Request lines: the five command verbs and their optional signature.

use crate::error::ProtocolError;
use crate::escape::unescape;
use crate::signature::{split_signature, Signature};
use crate::value::{convert_value, Value};
use std::fmt;

/// What a `GET` addresses on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// `GET /PATH` - the child nodes.
    Children,
    /// `GET /PATH.*` - every property and method.
    All,
    /// `GET /PATH.Prop` - one property.
    Property(String),
}

/// What a `MAN` addresses on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManTarget {
    All,
    Property(String),
    Method(String),
}

/// A parsed request command.
///
/// Values and arguments are kept in their escaped wire form; decoding happens
/// at the point of use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Get {
        path: String,
        selector: Selector,
    },
    Set {
        path: String,
        property: String,
        value: String,
    },
    Call {
        path: String,
        method: String,
        args: String,
    },
    Man {
        path: String,
        target: ManTarget,
    },
    /// `OPEN` without a path lists the opened nodes of the connection.
    Open {
        path: Option<String>,
    },
    Close {
        path: String,
    },
}

impl Command {
    /// Parses a request line that has already had its signature removed.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let (verb, args) = match text.find(' ') {
            Some(pos) => (&text[..pos], &text[pos + 1..]),
            None => (text, ""),
        };

        match verb {
            "GET" => {
                require_path(args)?;
                let (path, selector) = match args.find('.') {
                    None => (args, Selector::Children),
                    Some(dot) if &args[dot + 1..] == "*" => (&args[..dot], Selector::All),
                    Some(dot) => (
                        &args[..dot],
                        Selector::Property(args[dot + 1..].to_string()),
                    ),
                };
                Ok(Command::Get {
                    path: path.to_string(),
                    selector,
                })
            }
            "SET" => {
                require_path(args)?;
                let (dot, eq) = match (args.find('.'), args.find('=')) {
                    (Some(dot), Some(eq)) if dot < eq => (dot, eq),
                    _ => return Err(syntax(text)),
                };
                Ok(Command::Set {
                    path: args[..dot].to_string(),
                    property: args[dot + 1..eq].to_string(),
                    value: args[eq + 1..].to_string(),
                })
            }
            "CALL" => {
                require_path(args)?;
                let colon = args.find(':').ok_or_else(|| syntax(text))?;
                let bracket = args.find('(').ok_or_else(|| syntax(text))?;
                if bracket <= colon || !args.ends_with(')') {
                    return Err(syntax(text));
                }
                Ok(Command::Call {
                    path: args[..colon].to_string(),
                    method: args[colon + 1..bracket].to_string(),
                    args: args[bracket + 1..args.len() - 1].to_string(),
                })
            }
            "MAN" => {
                require_path(args)?;
                if let Some(dot) = args.find('.') {
                    let name = &args[dot + 1..];
                    let target = if name == "*" {
                        ManTarget::All
                    } else {
                        ManTarget::Property(name.to_string())
                    };
                    Ok(Command::Man {
                        path: args[..dot].to_string(),
                        target,
                    })
                } else if let Some(colon) = args.find(':') {
                    Ok(Command::Man {
                        path: args[..colon].to_string(),
                        target: ManTarget::Method(args[colon + 1..].to_string()),
                    })
                } else {
                    Err(syntax(text))
                }
            }
            "OPEN" => {
                if args.is_empty() {
                    return Ok(Command::Open { path: None });
                }
                require_path(args)?;
                Ok(Command::Open {
                    path: Some(args.to_string()),
                })
            }
            "CLOSE" => Ok(Command::Close {
                path: args.to_string(),
            }),
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }

    /// Returns the command verb.
    pub fn verb(&self) -> &'static str {
        match self {
            Command::Get { .. } => "GET",
            Command::Set { .. } => "SET",
            Command::Call { .. } => "CALL",
            Command::Man { .. } => "MAN",
            Command::Open { .. } => "OPEN",
            Command::Close { .. } => "CLOSE",
        }
    }

    /// Splits, unescapes and converts the arguments of a `CALL`.
    ///
    /// Every comma separated field is one argument, so `m()` passes a single
    /// empty string and `m(a,)` passes `a` and an empty string. Other
    /// commands have none.
    pub fn call_arguments(&self) -> Vec<Value> {
        match self {
            Command::Call { args, .. } => args
                .split(',')
                .map(|arg| convert_value(&unescape(arg)))
                .collect(),
            _ => Vec::new(),
        }
    }
}

fn require_path(args: &str) -> Result<(), ProtocolError> {
    if args.starts_with('/') {
        Ok(())
    } else {
        Err(ProtocolError::Syntax(format!("path must start with '/': {args:?}")))
    }
}

fn syntax(text: &str) -> ProtocolError {
    ProtocolError::Syntax(text.to_string())
}

/// Formats the command as it appears on the wire, without signature or
/// line terminator.
impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Get { path, selector } => match selector {
                Selector::Children => write!(f, "GET {path}"),
                Selector::All => write!(f, "GET {path}.*"),
                Selector::Property(name) => write!(f, "GET {path}.{name}"),
            },
            Command::Set {
                path,
                property,
                value,
            } => write!(f, "SET {path}.{property}={value}"),
            Command::Call { path, method, args } => write!(f, "CALL {path}:{method}({args})"),
            Command::Man { path, target } => match target {
                ManTarget::All => write!(f, "MAN {path}.*"),
                ManTarget::Property(name) => write!(f, "MAN {path}.{name}"),
                ManTarget::Method(name) => write!(f, "MAN {path}:{name}"),
            },
            Command::Open { path: None } => f.write_str("OPEN"),
            Command::Open { path: Some(path) } => write!(f, "OPEN {path}"),
            Command::Close { path } => write!(f, "CLOSE {path}"),
        }
    }
}

/// A command together with its optional signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub signature: Option<Signature>,
    pub command: Command,
}

impl Request {
    pub fn new(command: Command) -> Self {
        Self {
            signature: None,
            command,
        }
    }

    pub fn signed(signature: Signature, command: Command) -> Self {
        Self {
            signature: Some(signature),
            command,
        }
    }

    /// Parses a full request line.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let (signature, text) = split_signature(line);
        Ok(Self {
            signature,
            command: Command::parse(text)?,
        })
    }

    /// Returns the wire line including the terminating newline.
    pub fn to_line(&self) -> String {
        format!("{}\n", self)
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.signature {
            Some(sig) => write!(f, "{}#{}", sig, self.command),
            None => write!(f, "{}", self.command),
        }
    }
}
