//! Registry of identified connections keyed by node identifier

use super::connection::{Connection, ConnectionInfo};
use super::error::NetError;
use super::protocol::NetEvent;
use super::types::{EVENT_CHANNEL_CAPACITY, NodeId};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Live connections by remote node identifier.
///
/// Safe to share between every connection task; no operation needs an
/// external lock. Lifecycle events go to a broadcast channel.
pub struct ConnectionRegistry {
    connections: DashMap<NodeId, Arc<Connection>>,
    events: broadcast::Sender<NetEvent>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self::with_events(events)
    }

    pub fn with_events(events: broadcast::Sender<NetEvent>) -> Self {
        Self {
            connections: DashMap::new(),
            events,
        }
    }

    /// Register an identified connection.
    ///
    /// Fails if the connection has no identifier yet or the identifier is
    /// already taken by another connection.
    pub fn register(&self, conn: Arc<Connection>) -> Result<(), NetError> {
        let identity = conn
            .identity()
            .cloned()
            .ok_or_else(|| NetError::invalid("cannot register an unidentified connection"))?;

        match self.connections.entry(identity.node) {
            Entry::Occupied(_) => return Err(NetError::DuplicateNode(identity.node)),
            Entry::Vacant(slot) => {
                slot.insert(conn.clone());
            }
        }

        info!(
            "Registered node {} ({}) at {}",
            identity.node,
            identity.kind,
            conn.peer_addr()
        );

        self.emit(NetEvent::NodeAdded {
            node: identity.node,
            kind: identity.kind,
        });
        self.emit(NetEvent::LinkAdded {
            node: identity.node,
            addr: conn.peer_addr(),
            inbound: conn.is_inbound(),
        });
        Ok(())
    }

    /// Remove and close the connection of `node`. Idempotent.
    pub fn unregister(&self, node: NodeId) -> Option<Arc<Connection>> {
        let (_, conn) = self.connections.remove(&node)?;
        self.removed(node, &conn);
        Some(conn)
    }

    /// Remove `conn` only if it is the connection registered for its node.
    pub fn unregister_connection(&self, conn: &Arc<Connection>) -> bool {
        let node = match conn.remote_node() {
            Some(node) => node,
            None => return false,
        };

        match self
            .connections
            .remove_if(&node, |_, current| Arc::ptr_eq(current, conn))
        {
            Some((_, removed)) => {
                self.removed(node, &removed);
                true
            }
            None => false,
        }
    }

    fn removed(&self, node: NodeId, conn: &Arc<Connection>) {
        conn.close();
        info!("Unregistered node {} at {}", node, conn.peer_addr());
        self.emit(NetEvent::NodeRemoved { node });
    }

    pub fn lookup(&self, node: NodeId) -> Option<Arc<Connection>> {
        self.connections.get(&node).map(|e| e.value().clone())
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.connections.contains_key(&node)
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        self.connections.iter().map(|e| *e.key()).collect()
    }

    /// Some connection to a routing server, if any.
    pub fn server_connection(&self) -> Option<Arc<Connection>> {
        self.connections
            .iter()
            .find(|e| e.value().remote_kind().is_some_and(|k| k.is_server()))
            .map(|e| e.value().clone())
    }

    pub fn infos(&self) -> Vec<ConnectionInfo> {
        self.connections.iter().map(|e| e.value().info()).collect()
    }

    /// Unregister and close every connection.
    pub fn close_all(&self) {
        for node in self.nodes() {
            self.unregister(node);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: NetEvent) {
        // No subscribers is fine
        if self.events.send(event).is_err() {
            debug!("No event subscribers");
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
