//! Live property view of one node.

use crate::client::Client;
use crate::error::ClientError;
use lw3_protocol::Value;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Property values of an open node, kept current by change notifications.
///
/// Created by [`Client::view`]. The subscription stays open until
/// [`close`](Self::close) is called.
pub struct NodeView {
    client: Client,
    path: String,
    subscription: u64,
    values: Arc<RwLock<BTreeMap<String, Value>>>,
}

impl NodeView {
    pub(crate) fn new(
        client: Client,
        path: String,
        subscription: u64,
        values: Arc<RwLock<BTreeMap<String, Value>>>,
    ) -> Self {
        Self {
            client,
            path,
            subscription,
            values,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn subscription_id(&self) -> u64 {
        self.subscription
    }

    /// Returns the latest known value of a property.
    pub fn get(&self, property: &str) -> Option<Value> {
        self.values.read().get(property).cloned()
    }

    /// Returns a copy of all known properties.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.values.read().clone()
    }

    /// Drops the view's subscription.
    pub async fn close(self) -> Result<(), ClientError> {
        self.client.close(self.subscription).await
    }
}

impl std::fmt::Debug for NodeView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeView")
            .field("path", &self.path)
            .field("subscription", &self.subscription)
            .field("properties", &self.values.read().len())
            .finish()
    }
}
