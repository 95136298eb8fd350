//! Methods: named, possibly asynchronous operations on a node.

use lw3_protocol::{ErrorCode, Value};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Failure of a method invocation.
#[derive(Debug, Clone, Error)]
pub enum MethodError {
    /// A structured protocol error, reported with its own code.
    #[error("{0}")]
    Protocol(ErrorCode),

    /// Any other failure, reported as an internal error with this message.
    #[error("{0}")]
    Internal(String),
}

impl From<ErrorCode> for MethodError {
    fn from(code: ErrorCode) -> Self {
        MethodError::Protocol(code)
    }
}

/// Result of a method invocation. `None` means no return value.
pub type MethodResult = Result<Option<Value>, MethodError>;

/// Boxed future returned by a method handler.
pub type MethodFuture = Pin<Box<dyn Future<Output = MethodResult> + Send>>;

/// Invocable body of a method.
pub type MethodHandler = Arc<dyn Fn(Vec<Value>) -> MethodFuture + Send + Sync>;

/// A named operation on a node.
#[derive(Clone, Default)]
pub struct Method {
    pub(crate) manual: String,
    pub(crate) handler: Option<MethodHandler>,
}

impl Method {
    /// Creates a method without a body. Calling it succeeds with no result.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a method from a synchronous function.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> MethodResult + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self {
            manual: String::new(),
            handler: Some(Arc::new(move |args: Vec<Value>| -> MethodFuture {
                let f = f.clone();
                Box::pin(async move { f(args) })
            })),
        }
    }

    /// Creates a method from an async function.
    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResult> + Send + 'static,
    {
        Self {
            manual: String::new(),
            handler: Some(Arc::new(move |args: Vec<Value>| -> MethodFuture {
                Box::pin(f(args))
            })),
        }
    }

    pub fn manual(mut self, manual: impl Into<String>) -> Self {
        self.manual = manual.into();
        self
    }

    pub fn manual_text(&self) -> &str {
        &self.manual
    }

    /// Starts an invocation. The returned future holds no tree locks.
    pub fn invoke(&self, args: Vec<Value>) -> MethodFuture {
        match &self.handler {
            Some(handler) => handler(args),
            None => Box::pin(async { Ok(None) }),
        }
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("manual", &self.manual)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

/// Name and manual of a method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    pub name: String,
    pub manual: String,
}
