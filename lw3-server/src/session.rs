//! Session management.

use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::registry::Outbox;
use lw3_protocol::Change;
use lw3_tree::{ListenerRule, Node};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A node opened by the session, with the listener feeding its CHG lines.
struct OpenedNode {
    node: Node,
    path: String,
    listener_id: u64,
}

/// A client session.
///
/// Dropping the session removes every listener it registered on the tree.
pub struct Session {
    /// Process-wide socket id.
    pub id: u64,

    /// Remote address.
    pub remote_addr: SocketAddr,

    outbox: Outbox,

    /// Opened nodes in the order they were opened.
    opened: Vec<OpenedNode>,

    request_count: u64,

    created_at: Instant,

    last_activity: Instant,

    metrics: Option<Arc<Metrics>>,
}

impl Session {
    /// Creates a new session.
    pub fn new(id: u64, remote_addr: SocketAddr, outbox: Outbox) -> Self {
        Self {
            id,
            remote_addr,
            outbox,
            opened: Vec::new(),
            request_count: 0,
            created_at: Instant::now(),
            last_activity: Instant::now(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Option<Arc<Metrics>>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Records a request.
    pub fn record_request(&mut self) {
        self.request_count += 1;
        self.last_activity = Instant::now();
    }

    /// Returns the request count.
    pub fn request_count(&self) -> u64 {
        self.request_count
    }

    /// Returns the time since last activity.
    pub fn idle_duration(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Returns the session age.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Subscribes the session to changes of `node`.
    ///
    /// Every change is queued to this session's socket as a `CHG` line.
    pub fn open(&mut self, node: Node, path: &str) -> Result<(), ServerError> {
        if self.is_open(path) {
            return Err(ServerError::AlreadyOpened {
                path: path.to_string(),
            });
        }

        let outbox = self.outbox.clone();
        let metrics = self.metrics.clone();
        let listener_id = node.add_listener(
            ListenerRule::any(),
            Arc::new(move |change: &Change| {
                if outbox.send(change.to_line()) {
                    if let Some(ref metrics) = metrics {
                        metrics.changes_sent_total.inc();
                    }
                }
            }),
            -1,
        );

        tracing::debug!("[socket {}] Opened {}", self.id, path);
        self.opened.push(OpenedNode {
            node,
            path: path.to_string(),
            listener_id,
        });
        if let Some(ref metrics) = self.metrics {
            metrics.subscriptions_active.inc();
        }
        Ok(())
    }

    /// Removes the subscription on `path`.
    pub fn close(&mut self, path: &str) -> Result<(), ServerError> {
        let index = self
            .opened
            .iter()
            .position(|o| o.path == path)
            .ok_or_else(|| ServerError::NotOpened {
                path: path.to_string(),
            })?;
        let opened = self.opened.remove(index);
        self.release(&opened);
        tracing::debug!("[socket {}] Closed {}", self.id, path);
        Ok(())
    }

    pub fn is_open(&self, path: &str) -> bool {
        self.opened.iter().any(|o| o.path == path)
    }

    /// Returns the opened paths in the order they were opened.
    pub fn opened_paths(&self) -> Vec<String> {
        self.opened.iter().map(|o| o.path.clone()).collect()
    }

    /// Closes every subscription of the session.
    pub fn close_all(&mut self) {
        for opened in std::mem::take(&mut self.opened) {
            self.release(&opened);
        }
    }

    fn release(&self, opened: &OpenedNode) {
        opened.node.remove_listener(opened.listener_id);
        if let Some(ref metrics) = self.metrics {
            metrics.subscriptions_active.dec();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close_all();
    }
}
