//! Command handlers.
//!
//! Every request line is answered, even when it cannot be parsed: failures
//! become error response lines and never reach the connection task.

use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::session::Session;
use lw3_protocol::{
    frame_response, split_signature, unescape, Command, ManTarget, ProtocolError, ResponseLine,
    Selector,
};
use lw3_tree::path::child_path;
use lw3_tree::{MethodError, Node, Tree, TreeError};
use std::any::Any;
use std::sync::Arc;
use tokio::task::JoinError;

/// Command handler.
pub struct CommandHandler {
    tree: Tree,
    /// Metrics for request tracking.
    metrics: Option<Arc<Metrics>>,
}

impl CommandHandler {
    /// Creates a new command handler serving `tree`.
    pub fn new(tree: Tree) -> Self {
        Self {
            tree,
            metrics: None,
        }
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Handles one request line and returns the framed response text.
    ///
    /// Blank lines are ignored and produce an empty string.
    pub async fn handle_line(&self, session: &mut Session, line: &str) -> String {
        if line.trim().is_empty() {
            return String::new();
        }
        session.record_request();

        let (signature, text) = split_signature(line);
        let (verb, lines) = match Command::parse(text) {
            Ok(command) => {
                let verb = command.verb();
                let timer = self.metrics.as_ref().map(|m| {
                    m.command_duration
                        .with_label_values(&[verb])
                        .start_timer()
                });
                let lines = self.dispatch(session, &command, text).await;
                drop(timer); // Observation happens on drop
                (verb, lines)
            }
            Err(e) => {
                tracing::debug!("[socket {}] Rejected {:?}: {}", session.id, text, e);
                (
                    "INVALID",
                    vec![ResponseLine::Error {
                        request: text.to_string(),
                        code: e.error_code(),
                    }],
                )
            }
        };

        self.record(verb, &lines);
        frame_response(signature, &lines)
    }

    /// Response to a line that exceeded the length limit and was discarded.
    pub fn line_too_long(&self, error: &ProtocolError) -> String {
        let lines = [ResponseLine::Error {
            request: String::new(),
            code: error.error_code(),
        }];
        self.record("INVALID", &lines);
        frame_response(None, &lines)
    }

    fn record(&self, verb: &str, lines: &[ResponseLine]) {
        if let Some(ref metrics) = self.metrics {
            metrics.commands_total.with_label_values(&[verb]).inc();
            for code in lines.iter().filter_map(ResponseLine::error_code) {
                let label = format!("{:03}", code.code());
                metrics.errors_total.with_label_values(&[&label]).inc();
            }
        }
    }

    async fn dispatch(
        &self,
        session: &mut Session,
        command: &Command,
        text: &str,
    ) -> Vec<ResponseLine> {
        let result = match command {
            Command::Get { path, selector } => self.handle_get(path, selector),
            Command::Set {
                path,
                property,
                value,
            } => self.handle_set(path, property, value),
            Command::Call { path, method, .. } => {
                self.handle_call(path, method, command.call_arguments())
                    .await
            }
            Command::Man { path, target } => self.handle_man(path, target),
            Command::Open { path: None } => Ok(session
                .opened_paths()
                .into_iter()
                .map(|path| ResponseLine::Opened { path })
                .collect()),
            Command::Open { path: Some(path) } => Ok(vec![self.handle_open(session, path)]),
            Command::Close { path } => Ok(vec![Self::handle_close(session, path)]),
        };

        result.unwrap_or_else(|e| {
            tracing::debug!("[socket {}] {} failed: {}", session.id, text, e);
            vec![ResponseLine::Error {
                request: text.to_string(),
                code: e.error_code(),
            }]
        })
    }

    fn resolve(&self, path: &str) -> Result<Node, ServerError> {
        self.tree.resolve(path).ok_or_else(|| {
            ServerError::Tree(TreeError::NotFound {
                path: path.to_string(),
            })
        })
    }

    fn handle_get(&self, path: &str, selector: &Selector) -> Result<Vec<ResponseLine>, ServerError> {
        let node = self.resolve(path)?;
        let lines = match selector {
            Selector::Children => node
                .children()
                .into_iter()
                .map(|name| ResponseLine::Node {
                    path: child_path(path, &name),
                })
                .collect(),
            Selector::All => {
                let mut lines: Vec<ResponseLine> = node
                    .properties()
                    .into_iter()
                    .map(|info| ResponseLine::Property {
                        path: format!("{}.{}", path, info.name),
                        rw: info.rw,
                        value: info.value,
                    })
                    .collect();
                lines.extend(node.methods().into_iter().map(|info| ResponseLine::Method {
                    path: format!("{}:{}", path, info.name),
                }));
                lines
            }
            Selector::Property(name) => {
                let info = node.property(name).ok_or_else(|| TreeError::NotFound {
                    path: format!("{}.{}", path, name),
                })?;
                vec![ResponseLine::Property {
                    path: format!("{}.{}", path, name),
                    rw: info.rw,
                    value: info.value,
                }]
            }
        };
        Ok(lines)
    }

    fn handle_set(
        &self,
        path: &str,
        property: &str,
        value: &str,
    ) -> Result<Vec<ResponseLine>, ServerError> {
        let node = self.resolve(path)?;
        let info = node.write_property(property, &unescape(value))?;
        Ok(vec![ResponseLine::Property {
            path: format!("{}.{}", path, property),
            rw: info.rw,
            value: info.value,
        }])
    }

    async fn handle_call(
        &self,
        path: &str,
        method: &str,
        args: Vec<lw3_protocol::Value>,
    ) -> Result<Vec<ResponseLine>, ServerError> {
        let node = self.resolve(path)?;
        let target = format!("{}:{}", path, method);
        if node.method(method).is_none() {
            return Err(TreeError::NotFound { path: target }.into());
        }

        // The handler runs in its own task so a panic surfaces as a JoinError.
        let name = method.to_string();
        let outcome = tokio::spawn(async move {
            match node.call(&name, args) {
                Ok(future) => future.await,
                Err(e) => Err(MethodError::Internal(e.to_string())),
            }
        })
        .await;

        let line = match outcome {
            Ok(Ok(result)) => ResponseLine::MethodOk {
                path: target,
                result: result.filter(|v| !v.is_falsy()).map(|v| v.to_string()),
            },
            Ok(Err(MethodError::Protocol(code))) => ResponseLine::MethodError { path: target, code },
            Ok(Err(MethodError::Internal(message))) => ResponseLine::MethodFailure {
                path: target,
                message,
            },
            Err(e) => {
                let message = join_error_message(e);
                tracing::warn!("Method {} failed: {}", target, message);
                ResponseLine::MethodFailure {
                    path: target,
                    message,
                }
            }
        };
        Ok(vec![line])
    }

    fn handle_man(&self, path: &str, target: &ManTarget) -> Result<Vec<ResponseLine>, ServerError> {
        let node = self.resolve(path)?;
        let lines = match target {
            ManTarget::All => {
                let mut lines: Vec<ResponseLine> = node
                    .properties()
                    .into_iter()
                    .map(|info| ResponseLine::PropertyManual {
                        path: format!("{}.{}", path, info.name),
                        manual: info.manual,
                    })
                    .collect();
                lines.extend(
                    node.methods()
                        .into_iter()
                        .map(|info| ResponseLine::MethodManual {
                            path: format!("{}:{}", path, info.name),
                            manual: info.manual,
                        }),
                );
                lines
            }
            ManTarget::Property(name) => {
                let target = format!("{}.{}", path, name);
                let info = node
                    .property(name)
                    .ok_or_else(|| TreeError::NotFound { path: target.clone() })?;
                vec![ResponseLine::PropertyManual {
                    path: target,
                    manual: info.manual,
                }]
            }
            ManTarget::Method(name) => {
                let target = format!("{}:{}", path, name);
                let info = node
                    .method(name)
                    .ok_or_else(|| TreeError::NotFound { path: target.clone() })?;
                vec![ResponseLine::MethodManual {
                    path: target,
                    manual: info.manual,
                }]
            }
        };
        Ok(lines)
    }

    fn handle_open(&self, session: &mut Session, path: &str) -> ResponseLine {
        let result = self
            .resolve(path)
            .and_then(|node| session.open(node, path));
        match result {
            Ok(()) => ResponseLine::Opened {
                path: path.to_string(),
            },
            Err(e) => ResponseLine::OpenError {
                path: path.to_string(),
                code: e.error_code(),
            },
        }
    }

    fn handle_close(session: &mut Session, path: &str) -> ResponseLine {
        match session.close(path) {
            Ok(()) => ResponseLine::Closed {
                path: path.to_string(),
            },
            Err(e) => ResponseLine::CloseError {
                path: path.to_string(),
                code: e.error_code(),
            },
        }
    }
}

fn join_error_message(error: JoinError) -> String {
    if !error.is_panic() {
        return error.to_string();
    }
    panic_message(error.into_panic())
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "method panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Outbox;
    use lw3_protocol::{ErrorCode, Value};
    use lw3_tree::Method;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use tokio::sync::mpsc;

    fn test_handler() -> (CommandHandler, Session, mpsc::Receiver<String>) {
        let tree = Tree::new();
        let node = tree.node("/PATH/TO/MY/NODE").unwrap();
        node.set("TestProperty", "").unwrap();

        let (tx, rx) = mpsc::channel(16);
        let session = Session::new(
            1,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 12345),
            Outbox::new(1, tx, None),
        );
        (CommandHandler::new(tree), session, rx)
    }

    fn subtract_node(tree: &Tree) -> Node {
        let node = tree.node("/P").unwrap();
        node.define_method(
            "subtract",
            Method::from_fn(|args| match (args[0].as_f64(), args[1].as_f64()) {
                (Some(a), Some(b)) => Ok(Some(Value::Number(a - b))),
                _ => Err(MethodError::Protocol(ErrorCode::InvalidValue)),
            })
            .manual("Subtracts two numbers"),
        )
        .unwrap();
        node
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let (handler, mut session, _rx) = test_handler();
        assert_eq!(
            handler.handle_line(&mut session, "Unknown").await,
            "-E Unknown %E001:Syntax error\n"
        );
        assert_eq!(
            handler.handle_line(&mut session, "0001#GETTER /").await,
            "{0001\n-E GETTER / %E001:Syntax error\n}\n"
        );
        assert_eq!(handler.handle_line(&mut session, "").await, "");
        assert_eq!(session.request_count(), 2);
    }

    #[tokio::test]
    async fn test_syntax_errors() {
        let (handler, mut session, _rx) = test_handler();
        for line in ["GET PATH", "SET /A.b", "CALL /A:m(1", "MAN /A", "OPEN A"] {
            let response = handler.handle_line(&mut session, line).await;
            assert_eq!(response, format!("-E {} %E001:Syntax error\n", line));
        }
    }

    #[tokio::test]
    async fn test_set_property() {
        let (handler, mut session, _rx) = test_handler();
        let response = handler
            .handle_line(
                &mut session,
                "SET /PATH/TO/MY/NODE.TestProperty=sample\\nvalue",
            )
            .await;
        assert_eq!(response, "pw /PATH/TO/MY/NODE.TestProperty=sample\\nvalue\n");

        let node = handler.tree().resolve("/PATH/TO/MY/NODE").unwrap();
        assert_eq!(node.property("TestProperty").unwrap().value, "sample\nvalue");
    }

    #[tokio::test]
    async fn test_set_access_denied() {
        let (handler, mut session, _rx) = test_handler();
        let node = handler.tree().resolve("/PATH/TO/MY/NODE").unwrap();
        node.set("TestProperty", "original").unwrap();
        node.set_writable("TestProperty", false).unwrap();

        let response = handler
            .handle_line(&mut session, "0007#SET /PATH/TO/MY/NODE.TestProperty=x")
            .await;
        assert_eq!(
            response,
            "{0007\n-E SET /PATH/TO/MY/NODE.TestProperty=x %E007:Access denied\n}\n"
        );
        assert_eq!(node.property("TestProperty").unwrap().value, "original");
    }

    #[tokio::test]
    async fn test_set_missing() {
        let (handler, mut session, _rx) = test_handler();
        assert_eq!(
            handler.handle_line(&mut session, "SET /PATH/TO/MY/NODE.Other=1").await,
            "-E SET /PATH/TO/MY/NODE.Other=1 %E002:Not exists\n"
        );
        assert_eq!(
            handler.handle_line(&mut session, "SET /NOWHERE.x=1").await,
            "-E SET /NOWHERE.x=1 %E002:Not exists\n"
        );
        assert!(handler.tree().resolve("/NOWHERE").is_none());
    }

    #[tokio::test]
    async fn test_get_variants() {
        let (handler, mut session, _rx) = test_handler();
        let node = handler.tree().node("/PATH/TO/MY/NODE").unwrap();
        handler.tree().node("/PATH/TO/MY/NODE/B").unwrap();
        handler.tree().node("/PATH/TO/MY/NODE/A").unwrap();
        node.set("Count", 3).unwrap();
        node.set_writable("Count", false).unwrap();
        node.define_method("reset", Method::new()).unwrap();

        assert_eq!(
            handler.handle_line(&mut session, "GET /PATH/TO/MY/NODE").await,
            "n- /PATH/TO/MY/NODE/A\nn- /PATH/TO/MY/NODE/B\n"
        );
        assert_eq!(
            handler.handle_line(&mut session, "0002#GET /PATH/TO/MY/NODE.*").await,
            "{0002\npr /PATH/TO/MY/NODE.Count=3\npw /PATH/TO/MY/NODE.TestProperty=\nm- /PATH/TO/MY/NODE:reset\n}\n"
        );
        assert_eq!(
            handler.handle_line(&mut session, "GET /PATH/TO/MY/NODE.Count").await,
            "pr /PATH/TO/MY/NODE.Count=3\n"
        );
        assert_eq!(
            handler.handle_line(&mut session, "GET /PATH/TO/MY/NODE.Nope").await,
            "-E GET /PATH/TO/MY/NODE.Nope %E002:Not exists\n"
        );
        // An empty node answers with an empty block.
        assert_eq!(
            handler.handle_line(&mut session, "0003#GET /PATH/TO/MY/NODE/A").await,
            "{0003\n}\n"
        );
    }

    #[tokio::test]
    async fn test_get_root() {
        let (handler, mut session, _rx) = test_handler();
        assert_eq!(
            handler.handle_line(&mut session, "GET /").await,
            "n- /PATH\n"
        );
    }

    #[tokio::test]
    async fn test_call() {
        let (handler, mut session, _rx) = test_handler();
        subtract_node(handler.tree());

        assert_eq!(
            handler.handle_line(&mut session, "CALL /P:subtract(10,2)").await,
            "mO /P:subtract=8\n"
        );
        assert_eq!(
            handler.handle_line(&mut session, "CALL /P:subtract(2,2)").await,
            "mO /P:subtract\n"
        );
        assert_eq!(
            handler.handle_line(&mut session, "CALL /P:subtract(a,2)").await,
            "mE /P:subtract %E004:Invalid value\n"
        );
        assert_eq!(
            handler.handle_line(&mut session, "CALL /P:missing()").await,
            "-E CALL /P:missing() %E002:Not exists\n"
        );
    }

    #[tokio::test]
    async fn test_call_internal_error() {
        let (handler, mut session, _rx) = test_handler();
        let node = handler.tree().node("/P").unwrap();
        node.define_method(
            "subtract",
            Method::from_fn(|_| Err(MethodError::Internal("Invalid argument".into()))),
        )
        .unwrap();
        node.define_method(
            "explode",
            Method::from_fn(|_| panic!("boom")),
        )
        .unwrap();

        assert_eq!(
            handler.handle_line(&mut session, "CALL /P:subtract(10,2)").await,
            "mE /P:subtract=Invalid argument %E010:Internal error\n"
        );
        assert_eq!(
            handler.handle_line(&mut session, "0001#CALL /P:explode()").await,
            "{0001\nmE /P:explode=boom %E010:Internal error\n}\n"
        );
    }

    #[tokio::test]
    async fn test_call_async_method() {
        let (handler, mut session, _rx) = test_handler();
        handler
            .tree()
            .node("/P")
            .unwrap()
            .define_method(
                "echo",
                Method::from_async(|args| async move {
                    tokio::task::yield_now().await;
                    Ok(args.into_iter().next())
                }),
            )
            .unwrap();

        assert_eq!(
            handler.handle_line(&mut session, "CALL /P:echo(a\\(b\\))").await,
            "mO /P:echo=a\\(b\\)\n"
        );
    }

    #[tokio::test]
    async fn test_man() {
        let (handler, mut session, _rx) = test_handler();
        let p = subtract_node(handler.tree());
        p.define_property(
            "Mode",
            lw3_tree::Property::new("auto").manual("Operating mode"),
        )
        .unwrap();

        assert_eq!(
            handler.handle_line(&mut session, "MAN /P.*").await,
            "pm /P.Mode=Operating mode\nmm /P:subtract=Subtracts two numbers\n"
        );
        assert_eq!(
            handler.handle_line(&mut session, "MAN /P.Mode").await,
            "pm /P.Mode=Operating mode\n"
        );
        assert_eq!(
            handler.handle_line(&mut session, "MAN /P:subtract").await,
            "mm /P:subtract=Subtracts two numbers\n"
        );
        assert_eq!(
            handler.handle_line(&mut session, "MAN /P:nothing").await,
            "-E MAN /P:nothing %E002:Not exists\n"
        );
    }

    #[tokio::test]
    async fn test_open_close() {
        let (handler, mut session, mut rx) = test_handler();
        let path = "/PATH/TO/MY/NODE";

        assert_eq!(
            handler.handle_line(&mut session, "OPEN /PATH/TO/MY/NODE").await,
            "o- /PATH/TO/MY/NODE\n"
        );
        assert_eq!(
            handler.handle_line(&mut session, "OPEN /PATH/TO/MY/NODE").await,
            "oE /PATH/TO/MY/NODE %E003:Already exists\n"
        );
        assert_eq!(
            handler.handle_line(&mut session, "OPEN /NOPE").await,
            "oE /NOPE %E002:Not exists\n"
        );
        assert_eq!(
            handler.handle_line(&mut session, "0001#OPEN").await,
            "{0001\no- /PATH/TO/MY/NODE\n}\n"
        );

        handler
            .handle_line(&mut session, "SET /PATH/TO/MY/NODE.TestProperty=on")
            .await;
        assert_eq!(
            rx.try_recv().unwrap(),
            format!("CHG {}.TestProperty=on\n", path)
        );

        assert_eq!(
            handler.handle_line(&mut session, "CLOSE /PATH/TO/MY/NODE").await,
            "c- /PATH/TO/MY/NODE\n"
        );
        assert_eq!(
            handler.handle_line(&mut session, "CLOSE /PATH/TO/MY/NODE").await,
            "cE /PATH/TO/MY/NODE %E002:Not exists\n"
        );
        handler
            .handle_line(&mut session, "SET /PATH/TO/MY/NODE.TestProperty=off")
            .await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_metrics_recorded() {
        let (handler, mut session, _rx) = test_handler();
        let metrics = Arc::new(Metrics::new().unwrap());
        let handler = CommandHandler::new(handler.tree().clone()).with_metrics(metrics.clone());

        handler.handle_line(&mut session, "GET /PATH").await;
        handler.handle_line(&mut session, "GET /NOPE").await;
        handler.handle_line(&mut session, "BOGUS").await;

        assert_eq!(metrics.commands_total.with_label_values(&["GET"]).get(), 2.0);
        assert_eq!(metrics.commands_total.with_label_values(&["INVALID"]).get(), 1.0);
        assert_eq!(metrics.errors_total.with_label_values(&["002"]).get(), 1.0);
        assert_eq!(metrics.errors_total.with_label_values(&["001"]).get(), 1.0);
    }

    #[test]
    fn test_line_too_long() {
        let (handler, _session, _rx) = test_handler();
        let err = ProtocolError::LineTooLong { size: 10, max: 5 };
        assert_eq!(handler.line_too_long(&err), "-E  %E009:Command too long\n");
    }
}
