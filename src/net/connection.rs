//! One live transport to a remote instance

use super::correlator::{PendingResponse, ResponseCorrelator};
use super::error::NetError;
use super::handshake::HandshakeState;
use super::message::Message;
use super::types::{InstanceKind, NodeId};
use crate::types::now;
use bytes::Bytes;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::debug;

/// Identity the remote proved during the handshake. Set exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteIdentity {
    pub node: NodeId,
    pub kind: InstanceKind,
    pub uuid: String,
}

/// Connection state shared between its reader, writer, registry entry and
/// any task sending on it.
pub struct Connection {
    conn_id: u64,
    peer_addr: SocketAddr,
    inbound: bool,
    connected_at: u64,

    identity: OnceLock<RemoteIdentity>,
    state: AtomicU8,

    // Outbound frame queue drained by the writer task
    outbound: mpsc::Sender<Bytes>,
    correlator: ResponseCorrelator,
    cancel: CancellationToken,

    // Traffic
    bytes_recv: AtomicU64,
    bytes_sent: AtomicU64,
    messages_recv: AtomicU64,
    messages_sent: AtomicU64,
    last_recv: AtomicU64,

    // Misbehavior
    violations: AtomicU32,
}

impl Connection {
    pub fn new(
        conn_id: u64,
        peer_addr: SocketAddr,
        inbound: bool,
        outbound: mpsc::Sender<Bytes>,
    ) -> Self {
        Self {
            conn_id,
            peer_addr,
            inbound,
            connected_at: now(),
            identity: OnceLock::new(),
            state: AtomicU8::new(HandshakeState::Connected as u8),
            outbound,
            correlator: ResponseCorrelator::new(),
            cancel: CancellationToken::new(),
            bytes_recv: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            messages_recv: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            last_recv: AtomicU64::new(0),
            violations: AtomicU32::new(0),
        }
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_inbound(&self) -> bool {
        self.inbound
    }

    // =========================================================================
    // Identity and handshake state
    // =========================================================================

    /// Node identifier of the remote, once the handshake assigned one.
    pub fn remote_node(&self) -> Option<NodeId> {
        self.identity.get().map(|id| id.node)
    }

    pub fn remote_kind(&self) -> Option<InstanceKind> {
        self.identity.get().map(|id| id.kind)
    }

    pub fn identity(&self) -> Option<&RemoteIdentity> {
        self.identity.get()
    }

    /// Pin the remote identity. A second call fails.
    pub fn set_identity(&self, identity: RemoteIdentity) -> Result<(), NetError> {
        self.identity
            .set(identity)
            .map_err(|_| NetError::invalid("connection identity already assigned"))
    }

    pub fn handshake_state(&self) -> HandshakeState {
        HandshakeState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`; false if the connection was not in `from`.
    pub fn transition(&self, from: HandshakeState, to: HandshakeState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Mark the connection failed, whatever state it was in.
    pub fn fail(&self) {
        self.state.store(HandshakeState::Failed as u8, Ordering::Release);
    }

    pub fn is_authenticated(&self) -> bool {
        self.handshake_state() == HandshakeState::Authenticated
    }

    /// Open the authentication gate for an identified connection.
    pub fn authenticate(&self) -> bool {
        self.transition(HandshakeState::IdentifierAssigned, HandshakeState::Authenticated)
    }

    /// Drop back to identified-but-unauthenticated.
    pub fn deauthenticate(&self) -> bool {
        self.transition(HandshakeState::Authenticated, HandshakeState::IdentifierAssigned)
    }

    // =========================================================================
    // Sending
    // =========================================================================

    /// Queue an already encoded frame (without length prefix) for the writer.
    pub async fn send_frame(&self, frame: Bytes) -> Result<(), NetError> {
        if self.cancel.is_cancelled() {
            return Err(NetError::ConnectionClosed);
        }

        let len = frame.len() as u64;
        self.outbound
            .send(frame)
            .await
            .map_err(|_| NetError::ConnectionClosed)?;

        self.bytes_sent.fetch_add(len, Ordering::Relaxed);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Queue a frame without waiting for room in the outbound queue.
    pub fn try_send_frame(&self, frame: Bytes) -> Result<(), NetError> {
        if self.cancel.is_cancelled() {
            return Err(NetError::ConnectionClosed);
        }

        let len = frame.len() as u64;
        self.outbound.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => NetError::QueueFull,
            TrySendError::Closed(_) => NetError::ConnectionClosed,
        })?;

        self.bytes_sent.fetch_add(len, Ordering::Relaxed);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub async fn send(&self, msg: &Message) -> Result<(), NetError> {
        self.send_frame(msg.encode()?).await
    }

    /// Send `msg` with a fresh correlation id and return the response handle.
    pub async fn request(&self, msg: Message, timeout: Duration) -> Result<PendingResponse, NetError> {
        let id = self.correlator.next_id();
        let pending = self.correlator.register(id, timeout)?;
        self.send(&msg.with_id(id)).await?;
        Ok(pending)
    }

    pub fn correlator(&self) -> &ResponseCorrelator {
        &self.correlator
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Close the connection: stops its reader and writer and fails every
    /// pending request. Idempotent.
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            debug!("Closing connection {} to {}", self.conn_id, self.peer_addr);
            self.cancel.cancel();
        }
        if self.handshake_state() == HandshakeState::Connected {
            self.fail();
        }
        self.correlator.fail_all();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the connection is closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    pub fn record_recv(&self, len: usize) {
        self.bytes_recv.fetch_add(len as u64, Ordering::Relaxed);
        self.messages_recv.fetch_add(1, Ordering::Relaxed);
        self.last_recv.store(now(), Ordering::Relaxed);
    }

    /// Count a policy violation; returns the new total.
    pub fn record_violation(&self) -> u32 {
        self.violations.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn violations(&self) -> u32 {
        self.violations.load(Ordering::Relaxed)
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            conn_id: self.conn_id,
            node: self.remote_node(),
            kind: self.remote_kind(),
            addr: self.peer_addr,
            inbound: self.inbound,
            state: self.handshake_state(),
            connected_at: self.connected_at,
            last_recv: self.last_recv.load(Ordering::Relaxed),
            bytes_recv: self.bytes_recv.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            messages_recv: self.messages_recv.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            violations: self.violations(),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("conn_id", &self.conn_id)
            .field("peer_addr", &self.peer_addr)
            .field("node", &self.remote_node())
            .field("state", &self.handshake_state())
            .finish()
    }
}

/// Snapshot of a connection for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub conn_id: u64,
    pub node: Option<NodeId>,
    pub kind: Option<InstanceKind>,
    pub addr: SocketAddr,
    pub inbound: bool,
    pub state: HandshakeState,
    pub connected_at: u64,
    pub last_recv: u64,
    pub bytes_recv: u64,
    pub bytes_sent: u64,
    pub messages_recv: u64,
    pub messages_sent: u64,
    pub violations: u32,
}

#[cfg(test)]
pub(crate) fn test_connection(conn_id: u64) -> (Connection, mpsc::Receiver<Bytes>) {
    let (tx, rx) = mpsc::channel(16);
    let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
    (Connection::new(conn_id, addr, true, tx), rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::message::Payload;

    #[tokio::test]
    async fn test_send_counts_traffic() {
        let (conn, mut rx) = test_connection(1);
        conn.send(&Message::new(Payload::Ping(3))).await.unwrap();

        let frame = rx.recv().await.unwrap();
        let info = conn.info();
        assert_eq!(info.messages_sent, 1);
        assert_eq!(info.bytes_sent, frame.len() as u64);
    }

    #[tokio::test]
    async fn test_closed_connection_rejects_sends() {
        let (conn, _rx) = test_connection(1);
        conn.close();
        assert!(conn.is_closed());
        assert_eq!(conn.handshake_state(), HandshakeState::Failed);
        assert!(matches!(
            conn.send(&Message::new(Payload::Ping(1))).await,
            Err(NetError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_try_send_reports_full_queue() {
        let (conn, _rx) = test_connection(1);
        for _ in 0..16 {
            conn.try_send_frame(Bytes::from_static(b"x")).unwrap();
        }
        assert!(matches!(
            conn.try_send_frame(Bytes::from_static(b"x")),
            Err(NetError::QueueFull)
        ));
        assert_eq!(conn.info().messages_sent, 16);

        conn.close();
        assert!(matches!(
            conn.try_send_frame(Bytes::from_static(b"x")),
            Err(NetError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_fails_pending_request() {
        let (conn, mut rx) = test_connection(1);
        let pending = conn
            .request(Message::new(Payload::Ping(1)), Duration::from_secs(30))
            .await
            .unwrap();

        let sent = Message::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(sent.id, pending.id());

        conn.close();
        assert!(matches!(pending.await, Err(NetError::ConnectionClosed)));
    }

    #[test]
    fn test_identity_is_set_once() {
        let (conn, _rx) = test_connection(1);
        let identity = RemoteIdentity {
            node: 5,
            kind: InstanceKind::Agent,
            uuid: "u".to_string(),
        };
        conn.set_identity(identity.clone()).unwrap();
        assert!(conn.set_identity(identity).is_err());
        assert_eq!(conn.remote_node(), Some(5));
    }

    #[test]
    fn test_auth_transitions() {
        let (conn, _rx) = test_connection(1);
        assert!(!conn.authenticate());
        assert!(conn.transition(HandshakeState::Connected, HandshakeState::IdentifierAssigned));
        assert!(conn.authenticate());
        assert!(conn.is_authenticated());
        assert!(conn.deauthenticate());
        assert!(!conn.is_authenticated());
    }
}
