//! Header-only routing between connections

use super::connection::Connection;
use super::error::NetError;
use super::handshake::LocalId;
use super::header::WireHeaderReader;
use super::message::Message;
use super::registry::ConnectionRegistry;
use super::types::NodeId;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, warn};

/// What happened to one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Addressed to this node (or unaddressed); the untouched frame goes on to
    /// full decode and dispatch.
    Local(Bytes),
    /// Raw frame queued on the destination's connection.
    Forwarded { to: NodeId },
    /// Destination not registered, closed, or too slow to take the frame;
    /// the sender was sent an endpoint-closed
    /// notification carrying the frame's correlation id.
    Unreachable { to: NodeId },
}

/// Decides per frame between local delivery and forwarding, reading only the
/// `to`/`from` header fields.
pub struct RoutingProxy {
    local: Arc<LocalId>,
    registry: Arc<ConnectionRegistry>,
}

impl RoutingProxy {
    pub fn new(local: Arc<LocalId>, registry: Arc<ConnectionRegistry>) -> Self {
        Self { local, registry }
    }

    pub fn local_id(&self) -> Option<NodeId> {
        self.local.get()
    }

    /// Route one frame received on `conn`.
    ///
    /// The `from` field is checked against the identity pinned on `conn`
    /// before the destination is looked up, so a spoofed frame is rejected
    /// even when its destination exists.
    pub async fn route(&self, conn: &Connection, frame: Bytes) -> Result<RouteOutcome, NetError> {
        let mut reader = WireHeaderReader::new(&frame);

        let to = match reader.read_to()? {
            Some(to) => to,
            None => return Ok(RouteOutcome::Local(frame)),
        };
        if self.local_id() == Some(to) {
            return Ok(RouteOutcome::Local(frame));
        }

        let from = reader
            .read_from()?
            .ok_or_else(|| NetError::invalid("to without from"))?;
        let id = reader.read_id()?.unwrap_or(0);

        match conn.remote_node() {
            Some(node) if node == from => {}
            Some(node) => {
                return Err(NetError::invalid(format!(
                    "from {} does not match connection identity {}",
                    from, node
                )));
            }
            None => {
                return Err(NetError::invalid(format!(
                    "routed frame from {} on an unidentified connection",
                    from
                )));
            }
        }

        if !conn.is_authenticated() {
            return Err(NetError::invalid("routing before authentication"));
        }

        // Never wait on the destination's queue; a stalled peer must not
        // hold up the sender's reader
        if let Some(dest) = self.registry.lookup(to) {
            match dest.try_send_frame(frame) {
                Ok(()) => {
                    debug!("Forwarded frame {} -> {}", from, to);
                    return Ok(RouteOutcome::Forwarded { to });
                }
                Err(NetError::QueueFull) => {
                    warn!("Outbound queue of node {} is full, dropping its connection", to);
                    self.registry.unregister(to);
                }
                Err(_) => debug!("Destination {} closed while forwarding", to),
            }
        }

        // Correlated so a pending request on the sender fails fast
        conn.send(&Message::endpoint_closed(to).with_id(id)).await?;
        debug!("Node {} unreachable for {}", to, from);
        Ok(RouteOutcome::Unreachable { to })
    }
}
