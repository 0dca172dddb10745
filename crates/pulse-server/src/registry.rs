use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use pulse_core::{ConnectionId, HubError};

use crate::connection::{ClientConnection, FrameSink};

/// Registry of active subscriber connections for one channel.
///
/// Every entry is Active: whoever removes an entry also closes it, inside
/// the same call. The lock is never held across an await.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<ClientConnection>>>,
    max_connections: Option<usize>,
}

impl ConnectionRegistry {
    pub fn new(max_connections: Option<usize>) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            max_connections,
        }
    }

    pub fn unbounded() -> Self {
        Self::new(None)
    }

    /// Register a new Active connection around `writer` and return its ID.
    pub fn register(&self, writer: impl FrameSink + 'static) -> Result<ConnectionId, HubError> {
        let mut connections = self.connections.write();

        if let Some(capacity) = self.max_connections {
            if connections.len() >= capacity {
                tracing::warn!(capacity = capacity, "Registry full, rejecting connection");
                return Err(HubError::RegistryFull { capacity });
            }
        }

        let mut id = ConnectionId::new();
        while connections.contains_key(&id) {
            id = ConnectionId::new();
        }

        let connection = Arc::new(ClientConnection::new(id.clone(), writer));
        connections.insert(id.clone(), connection);

        tracing::debug!(
            connection_id = %id,
            connections = connections.len(),
            "Connection registered"
        );
        Ok(id)
    }

    /// Remove a connection and mark it Closed. Unknown IDs are a no-op.
    ///
    /// Returns whether an entry was removed.
    pub fn unregister(&self, id: &ConnectionId) -> bool {
        let removed = self.connections.write().remove(id);
        match removed {
            Some(connection) => {
                connection.close();
                tracing::debug!(
                    connection_id = %id,
                    connected_ms = connection.connected_for().as_millis() as u64,
                    "Connection unregistered"
                );
                true
            }
            None => false,
        }
    }

    /// Point-in-time copy of every Active connection.
    pub fn snapshot(&self) -> Vec<Arc<ClientConnection>> {
        self.connections.read().values().cloned().collect()
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        self.connections.read().get(id).cloned()
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.read().contains_key(id)
    }

    /// Number of connected clients.
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Close and remove every connection. Returns how many were removed.
    pub fn drain(&self) -> usize {
        let drained: Vec<Arc<ClientConnection>> = self
            .connections
            .write()
            .drain()
            .map(|(_, connection)| connection)
            .collect();
        for connection in &drained {
            connection.close();
        }
        drained.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::unbounded()
    }
}
