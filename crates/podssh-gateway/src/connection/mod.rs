//! Per-connection state

mod context;

pub use context::ConnectionContext;

use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

/// Live connections, indexed by connection id
pub struct ConnectionRegistry {
    connections: DashMap<Uuid, Arc<ConnectionContext>>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Track a new connection
    pub fn insert(&self, context: Arc<ConnectionContext>) {
        self.connections.insert(context.conn_id, context);
    }

    /// Stop tracking a connection
    pub fn remove(&self, conn_id: &Uuid) -> Option<Arc<ConnectionContext>> {
        self.connections.remove(conn_id).map(|(_, context)| context)
    }

    /// Number of live connections
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if no connection is live
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
