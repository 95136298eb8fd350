//! Outbound queues of the connected sockets.
//!
//! Every connection owns a bounded channel drained by its connection task,
//! which is the only writer of the socket. Anything else that wants to reach
//! a client (tree listeners pushing `CHG` lines, the embedding application
//! broadcasting) goes through an [`Outbox`].

use crate::metrics::Metrics;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Sending half of one connection's outbound queue.
#[derive(Clone)]
pub struct Outbox {
    socket_id: u64,
    tx: mpsc::Sender<String>,
    metrics: Option<Arc<Metrics>>,
}

impl Outbox {
    pub fn new(socket_id: u64, tx: mpsc::Sender<String>, metrics: Option<Arc<Metrics>>) -> Self {
        Self {
            socket_id,
            tx,
            metrics,
        }
    }

    pub fn socket_id(&self) -> u64 {
        self.socket_id
    }

    /// Queues a message without waiting.
    ///
    /// Returns false if the message was dropped because the queue is full or
    /// the connection is gone.
    pub fn send(&self, message: String) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    "[socket {}] Outbound buffer full, dropping message",
                    self.socket_id
                );
                if let Some(ref metrics) = self.metrics {
                    metrics.outbound_dropped_total.inc();
                }
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Maps socket ids to their outbound queues.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<u64, Outbox>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, outbox: Outbox) {
        self.connections.insert(outbox.socket_id(), outbox);
    }

    pub fn unregister(&self, socket_id: u64) {
        self.connections.remove(&socket_id);
    }

    /// Writes a message to one socket. Returns false if the socket is unknown
    /// or its queue is full.
    pub fn write(&self, socket_id: u64, message: impl Into<String>) -> bool {
        match self.connections.get(&socket_id) {
            Some(outbox) => outbox.send(message.into()),
            None => false,
        }
    }

    /// Writes a message to every connected socket. Returns how many queued it.
    pub fn broadcast(&self, message: impl Into<String>) -> usize {
        let message = message.into();
        // Collect first so no shard lock is held while sending.
        let outboxes: Vec<Outbox> = self.connections.iter().map(|e| e.value().clone()).collect();
        outboxes
            .into_iter()
            .filter(|outbox| outbox.send(message.clone()))
            .count()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Returns the connected socket ids in ascending order.
    pub fn socket_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.connections.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbox(id: u64, capacity: usize) -> (Outbox, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Outbox::new(id, tx, None), rx)
    }

    #[test]
    fn test_write_to_socket() {
        let registry = ConnectionRegistry::new();
        let (a, mut rx_a) = outbox(1, 4);
        let (b, mut rx_b) = outbox(2, 4);
        registry.register(a);
        registry.register(b);

        assert!(registry.write(2, "CHG /A.x=1\n"));
        assert!(!registry.write(3, "nobody"));
        assert_eq!(rx_b.try_recv().unwrap(), "CHG /A.x=1\n");
        assert!(rx_a.try_recv().is_err());
        assert_eq!(registry.socket_ids(), vec![1, 2]);
    }

    #[test]
    fn test_broadcast() {
        let registry = ConnectionRegistry::new();
        let (a, mut rx_a) = outbox(1, 4);
        let (b, mut rx_b) = outbox(2, 4);
        registry.register(a);
        registry.register(b);

        assert_eq!(registry.broadcast("hello\n"), 2);
        assert_eq!(rx_a.try_recv().unwrap(), "hello\n");
        assert_eq!(rx_b.try_recv().unwrap(), "hello\n");

        registry.unregister(1);
        assert_eq!(registry.broadcast("again\n"), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_full_queue_drops_and_counts() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let (tx, mut rx) = mpsc::channel(1);
        let outbox = Outbox::new(7, tx, Some(metrics.clone()));

        assert!(outbox.send("first".into()));
        assert!(!outbox.send("second".into()));
        assert_eq!(metrics.outbound_dropped_total.get(), 1.0);
        assert_eq!(rx.try_recv().unwrap(), "first");

        drop(rx);
        assert!(outbox.is_closed());
        assert!(!outbox.send("third".into()));
    }
}
