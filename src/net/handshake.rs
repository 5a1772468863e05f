//! Identifier-assignment handshake and the authentication gate
//!
//! Every dialer sends an identity request on a fresh connection. A server
//! assigns an identifier; any other node validates the identifier the dialer
//! presents. Until the exchange completes only handshake traffic is accepted.

use super::connection::{Connection, RemoteIdentity};
use super::error::NetError;
use super::message::{IdentityRequest, IdentityResponse, Message, Payload, PayloadKind};
use super::registry::ConnectionRegistry;
use super::types::{InstanceKind, MAX_NODE_ID, NodeId};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use rand::Rng;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Random draws before giving up on finding a free identifier.
const ALLOCATION_ATTEMPTS: usize = 64;

// =============================================================================
// STATE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum HandshakeState {
    /// Transport open, no identifier.
    Connected = 0,
    /// Identifier assigned or validated; only handlers without an
    /// authentication requirement run.
    IdentifierAssigned = 1,
    /// Dispatch fully open.
    Authenticated = 2,
    /// Terminal; the transport is closed.
    Failed = 3,
}

impl HandshakeState {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => HandshakeState::Connected,
            1 => HandshakeState::IdentifierAssigned,
            2 => HandshakeState::Authenticated,
            _ => HandshakeState::Failed,
        }
    }

    pub fn is_identified(&self) -> bool {
        matches!(
            self,
            HandshakeState::IdentifierAssigned | HandshakeState::Authenticated
        )
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HandshakeState::Connected => "connected",
            HandshakeState::IdentifierAssigned => "identified",
            HandshakeState::Authenticated => "authenticated",
            HandshakeState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// This node's own identifier. Fixed for servers, learned from the server
/// by everyone else.
#[derive(Debug, Default)]
pub struct LocalId(AtomicU64);

impl LocalId {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fixed(id: NodeId) -> Self {
        let local = Self::new();
        local.set(id);
        local
    }

    pub fn get(&self) -> Option<NodeId> {
        match self.0.load(Ordering::Acquire) {
            0 => None,
            stored => Some((stored - 1) as NodeId),
        }
    }

    /// Store `id`, returning the previous value.
    pub fn set(&self, id: NodeId) -> Option<NodeId> {
        match self.0.swap(id as u64 + 1, Ordering::AcqRel) {
            0 => None,
            stored => Some((stored - 1) as NodeId),
        }
    }
}

/// What the pipeline does with a decoded message given the handshake state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Identity request for this responder.
    Handshake,
    /// Past the gate; hand to the dispatch table.
    Dispatch,
}

// =============================================================================
// SESSION
// =============================================================================

/// Handshake logic of one node, shared by all of its connections.
pub struct HandshakeSession {
    local: Arc<LocalId>,
    kind: InstanceKind,
    uuid: String,
    registry: Arc<ConnectionRegistry>,
    auto_authenticate: bool,
    timeout: Duration,
}

impl HandshakeSession {
    pub fn new(
        local: Arc<LocalId>,
        kind: InstanceKind,
        uuid: String,
        registry: Arc<ConnectionRegistry>,
        auto_authenticate: bool,
        timeout: Duration,
    ) -> Self {
        Self {
            local,
            kind,
            uuid,
            registry,
            auto_authenticate,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Classify a message (already past correlation) on `conn`.
    ///
    /// Before the handshake only an identity request passes; anything else
    /// is an error that closes the connection. After it, a repeated identity
    /// request is an error too.
    pub fn gate(&self, conn: &Connection, kind: Option<PayloadKind>) -> Result<Gate, NetError> {
        let state = conn.handshake_state();
        match (state, kind) {
            (HandshakeState::Failed, _) => Err(NetError::ConnectionClosed),
            (HandshakeState::Connected, Some(PayloadKind::IdentityRequest)) => Ok(Gate::Handshake),
            (HandshakeState::Connected, kind) => Err(NetError::invalid(format!(
                "{} before handshake",
                kind.map(|k| k.to_string()).unwrap_or_else(|| "empty message".to_string())
            ))),
            (_, Some(PayloadKind::IdentityRequest)) => {
                Err(NetError::invalid("repeated identity request"))
            }
            _ => Ok(Gate::Dispatch),
        }
    }

    /// Answer an identity request received on `conn`.
    pub async fn respond(&self, conn: &Arc<Connection>, request: &Message) -> Result<(), NetError> {
        let req = match &request.payload {
            Payload::IdentityRequest(req) => req,
            _ => return Err(NetError::invalid("expected identity request")),
        };
        if conn.handshake_state() != HandshakeState::Connected {
            return Err(NetError::invalid("repeated identity request"));
        }

        let responder = match self.local.get() {
            Some(id) => id,
            None => return self.reject(conn, request, "responder has no identifier").await,
        };

        let assigned = if self.kind.is_server() {
            self.allocate()
        } else {
            self.validate(req.presented)
        };
        let assigned = match assigned {
            Ok(id) => id,
            Err(reason) => return self.reject(conn, request, reason).await,
        };

        conn.set_identity(RemoteIdentity {
            node: assigned,
            kind: req.kind,
            uuid: req.uuid.clone(),
        })?;
        if let Err(e) = self.registry.register(conn.clone()) {
            return self.reject(conn, request, &e.to_string()).await;
        }
        conn.transition(HandshakeState::Connected, HandshakeState::IdentifierAssigned);

        let response = IdentityResponse {
            assigned,
            responder,
            responder_kind: self.kind,
            responder_uuid: self.uuid.clone(),
        };
        conn.send(&Message::new(Payload::IdentityResponse(response)).with_id(request.id))
            .await?;

        if self.auto_authenticate {
            conn.authenticate();
        }
        info!(
            "Handshake with {} complete: {} {} is node {}",
            conn.peer_addr(),
            req.kind,
            req.uuid,
            assigned
        );
        Ok(())
    }

    async fn reject(&self, conn: &Connection, request: &Message, reason: &str) -> Result<(), NetError> {
        warn!("Rejecting handshake from {}: {}", conn.peer_addr(), reason);
        let rejection = Message::new(Payload::IdentityRejected(reason.to_string())).with_id(request.id);
        // Best effort; the connection is going away either way
        let _ = conn.send(&rejection).await;
        conn.fail();
        Err(NetError::HandshakeRejected(reason.to_string()))
    }

    /// Run the requester side on a freshly dialed `conn`.
    ///
    /// `frames` is the connection's inbound frame stream; the reply is read
    /// from it directly, before any reader task is started, so nothing the
    /// responder sends afterwards can reach the gate ahead of the new state.
    /// `presented` is only meaningful to a non-server responder, which
    /// validates it; servers always allocate a fresh identifier. The wait
    /// ends early when `conn` is closed.
    pub async fn initiate<R>(
        &self,
        conn: &Arc<Connection>,
        presented: Option<NodeId>,
        frames: &mut R,
    ) -> Result<IdentityResponse, NetError>
    where
        R: Stream<Item = Result<Bytes, NetError>> + Unpin,
    {
        let request = IdentityRequest {
            kind: self.kind,
            uuid: self.uuid.clone(),
            presented,
        };
        let id = conn.correlator().next_id();
        conn.send(&Message::new(Payload::IdentityRequest(request)).with_id(id))
            .await?;

        let reply = tokio::select! {
            _ = conn.closed() => Err(NetError::ConnectionClosed),
            reply = tokio::time::timeout(self.timeout, Self::read_reply(conn, id, frames)) => match reply {
                Ok(reply) => reply,
                Err(_) => Err(NetError::HandshakeTimeout),
            },
        };

        let response = match reply {
            Ok(Message { payload: Payload::IdentityResponse(resp), .. }) => resp,
            Ok(Message { payload: Payload::IdentityRejected(reason), .. }) => {
                conn.fail();
                return Err(NetError::HandshakeRejected(reason));
            }
            Ok(other) => {
                conn.fail();
                return Err(NetError::invalid(format!(
                    "unexpected {:?} during handshake",
                    other.kind()
                )));
            }
            Err(e) => {
                conn.fail();
                return Err(e);
            }
        };

        if let Err(e) = self.accept_response(conn, presented, &response) {
            conn.fail();
            return Err(e);
        }
        Ok(response)
    }

    async fn read_reply<R>(conn: &Connection, id: u32, frames: &mut R) -> Result<Message, NetError>
    where
        R: Stream<Item = Result<Bytes, NetError>> + Unpin,
    {
        let frame = frames.next().await.ok_or(NetError::ConnectionClosed)??;
        conn.record_recv(frame.len());

        let reply = Message::decode(&frame)?;
        if reply.id != id {
            return Err(NetError::invalid("handshake reply does not match request"));
        }
        Ok(reply)
    }

    fn accept_response(
        &self,
        conn: &Arc<Connection>,
        presented: Option<NodeId>,
        response: &IdentityResponse,
    ) -> Result<(), NetError> {
        if response.assigned > MAX_NODE_ID || response.responder > MAX_NODE_ID {
            return Err(NetError::invalid("identifier out of range"));
        }
        if response.assigned == response.responder {
            return Err(NetError::invalid("assigned identifier equals responder"));
        }
        if !response.responder_kind.is_server() && presented != Some(response.assigned) {
            return Err(NetError::HandshakeRejected(
                "peer assigned a different identifier".to_string(),
            ));
        }

        if response.responder_kind.is_server() {
            match self.local.set(response.assigned) {
                Some(previous) if previous != response.assigned => {
                    warn!("Node identifier changed from {} to {}", previous, response.assigned);
                }
                None => info!("Assigned node identifier {}", response.assigned),
                _ => {}
            }
        }

        conn.set_identity(RemoteIdentity {
            node: response.responder,
            kind: response.responder_kind,
            uuid: response.responder_uuid.clone(),
        })?;
        self.registry.register(conn.clone())?;
        conn.transition(HandshakeState::Connected, HandshakeState::IdentifierAssigned);
        conn.authenticate();

        debug!(
            "Connected to {} {} (node {})",
            response.responder_kind, response.responder_uuid, response.responder
        );
        Ok(())
    }

    /// Pick a fresh identifier that is neither ours nor registered.
    ///
    /// A presented identifier is never reused; only non-server responders
    /// look at it.
    pub fn allocate(&self) -> Result<NodeId, &'static str> {
        let own = self.local.get();
        let mut rng = rand::thread_rng();
        for _ in 0..ALLOCATION_ATTEMPTS {
            let id = rng.gen_range(1..=MAX_NODE_ID);
            if Some(id) != own && !self.registry.contains(id) {
                return Ok(id);
            }
        }
        Err("no free identifier")
    }

    /// Check an identifier presented to a non-server responder.
    pub fn validate(&self, presented: Option<NodeId>) -> Result<NodeId, &'static str> {
        let id = presented.ok_or("no identifier presented")?;
        if id > MAX_NODE_ID {
            return Err("identifier out of range");
        }
        if Some(id) == self.local.get() {
            return Err("identifier collides with responder");
        }
        if self.registry.contains(id) {
            return Err("identifier already connected");
        }
        Ok(id)
    }

    /// Fail and close `conn` if it is still unidentified after the timeout.
    pub fn spawn_deadline(&self, conn: Arc<Connection>) -> JoinHandle<()> {
        let timeout = self.timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = conn.closed() => {}
                _ = tokio::time::sleep(timeout) => {
                    if conn.transition(HandshakeState::Connected, HandshakeState::Failed) {
                        warn!("Handshake with {} timed out", conn.peer_addr());
                        conn.close();
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::test_connection;
    use tokio::sync::mpsc;

    const SERVER_ID: NodeId = 0;

    fn session(kind: InstanceKind, local: Option<NodeId>, auto: bool) -> (HandshakeSession, Arc<ConnectionRegistry>) {
        let registry = Arc::new(ConnectionRegistry::new());
        let local = Arc::new(match local {
            Some(id) => LocalId::fixed(id),
            None => LocalId::new(),
        });
        let session = HandshakeSession::new(
            local,
            kind,
            format!("{}-uuid", kind),
            registry.clone(),
            auto,
            Duration::from_secs(10),
        );
        (session, registry)
    }

    fn identity_request(presented: Option<NodeId>) -> Message {
        Message::new(Payload::IdentityRequest(IdentityRequest {
            kind: InstanceKind::Agent,
            uuid: "agent-uuid".to_string(),
            presented,
        }))
        .with_id(1)
    }

    async fn reply_payload(rx: &mut mpsc::Receiver<Bytes>) -> Payload {
        Message::decode(&rx.recv().await.unwrap()).unwrap().payload
    }

    #[test]
    fn test_local_id() {
        let local = LocalId::new();
        assert_eq!(local.get(), None);
        assert_eq!(local.set(0), None);
        assert_eq!(local.get(), Some(0));
        assert_eq!(local.set(MAX_NODE_ID), Some(0));
        assert_eq!(local.get(), Some(MAX_NODE_ID));
    }

    #[tokio::test]
    async fn test_server_assigns_identifier() {
        let (session, registry) = session(InstanceKind::Server, Some(SERVER_ID), true);
        let (conn, mut rx) = test_connection(1);
        let conn = Arc::new(conn);

        session.respond(&conn, &identity_request(None)).await.unwrap();

        let assigned = match reply_payload(&mut rx).await {
            Payload::IdentityResponse(resp) => {
                assert_eq!(resp.responder, SERVER_ID);
                resp.assigned
            }
            other => panic!("unexpected {:?}", other),
        };
        assert_ne!(assigned, SERVER_ID);
        assert!(assigned <= MAX_NODE_ID);
        assert!(conn.is_authenticated());
        assert!(registry.contains(assigned));
    }

    #[tokio::test]
    async fn test_server_ignores_presented_identifier() {
        let (session, registry) = session(InstanceKind::Server, Some(SERVER_ID), true);
        let (conn, mut rx) = test_connection(1);

        session.respond(&Arc::new(conn), &identity_request(Some(4321))).await.unwrap();
        let assigned = match reply_payload(&mut rx).await {
            Payload::IdentityResponse(resp) => resp.assigned,
            other => panic!("unexpected {:?}", other),
        };
        // 1 in MAX_NODE_ID chance of a legitimate collision
        assert_ne!(assigned, 4321);
        assert!(registry.contains(assigned));
        assert!(!registry.contains(4321));
    }

    #[test]
    fn test_allocate_skips_own_and_registered() {
        let (session, registry) = session(InstanceKind::Server, Some(SERVER_ID), true);
        let (conn, _rx) = test_connection(1);
        conn.set_identity(RemoteIdentity {
            node: 5,
            kind: InstanceKind::Agent,
            uuid: "a".to_string(),
        })
        .unwrap();
        registry.register(Arc::new(conn)).unwrap();

        for _ in 0..1000 {
            let id = session.allocate().unwrap();
            assert!(id != SERVER_ID && id != 5 && id <= MAX_NODE_ID);
        }
    }

    #[tokio::test]
    async fn test_peer_rejects_missing_identifier() {
        let (session, registry) = session(InstanceKind::Agent, Some(55), true);
        let (conn, mut rx) = test_connection(1);
        let conn = Arc::new(conn);

        let result = session.respond(&conn, &identity_request(None)).await;
        assert!(matches!(result, Err(NetError::HandshakeRejected(_))));
        assert!(matches!(reply_payload(&mut rx).await, Payload::IdentityRejected(_)));
        assert_eq!(conn.handshake_state(), HandshakeState::Failed);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_peer_validation() {
        let (session, _registry) = session(InstanceKind::Agent, Some(55), true);
        assert_eq!(session.validate(Some(7)), Ok(7));
        assert!(session.validate(Some(55)).is_err());
        assert!(session.validate(None).is_err());
    }

    #[tokio::test]
    async fn test_manual_authentication_leaves_gate_half_open() {
        let (session, _registry) = session(InstanceKind::Server, Some(SERVER_ID), false);
        let (conn, _rx) = test_connection(1);
        let conn = Arc::new(conn);

        session.respond(&conn, &identity_request(None)).await.unwrap();
        assert_eq!(conn.handshake_state(), HandshakeState::IdentifierAssigned);
        assert!(!conn.is_authenticated());
    }

    #[test]
    fn test_gate() {
        let (session, _registry) = session(InstanceKind::Server, Some(SERVER_ID), true);
        let (conn, _rx) = test_connection(1);

        assert_eq!(
            session.gate(&conn, Some(PayloadKind::IdentityRequest)).unwrap(),
            Gate::Handshake
        );
        assert!(session.gate(&conn, Some(PayloadKind::Ping)).is_err());
        assert!(session.gate(&conn, None).is_err());

        conn.transition(HandshakeState::Connected, HandshakeState::IdentifierAssigned);
        assert_eq!(session.gate(&conn, Some(PayloadKind::Ping)).unwrap(), Gate::Dispatch);
        assert!(session.gate(&conn, Some(PayloadKind::IdentityRequest)).is_err());
    }

    #[tokio::test]
    async fn test_initiate_against_server() {
        let (session, registry) = session(InstanceKind::Agent, None, true);
        let (conn, mut rx) = test_connection(1);
        let conn = Arc::new(conn);
        let (inbound_tx, mut inbound) = futures::channel::mpsc::unbounded();

        tokio::spawn(async move {
            let request = Message::decode(&rx.recv().await.unwrap()).unwrap();
            let response = IdentityResponse {
                assigned: 99,
                responder: SERVER_ID,
                responder_kind: InstanceKind::Server,
                responder_uuid: "server-uuid".to_string(),
            };
            let reply = Message::new(Payload::IdentityResponse(response)).with_id(request.id);
            inbound_tx.unbounded_send(Ok(reply.encode().unwrap())).unwrap();
        });

        let response = session.initiate(&conn, None, &mut inbound).await.unwrap();
        assert_eq!(response.assigned, 99);
        assert_eq!(session.local.get(), Some(99));
        assert_eq!(conn.remote_node(), Some(SERVER_ID));
        assert!(conn.is_authenticated());
        assert!(registry.contains(SERVER_ID));
    }

    #[tokio::test]
    async fn test_initiate_rejected() {
        let (session, registry) = session(InstanceKind::Agent, Some(3), true);
        let (conn, _rx) = test_connection(1);
        let conn = Arc::new(conn);

        // First request id of a fresh connection is 1
        let rejection = Message::new(Payload::IdentityRejected("identifier already connected".into()))
            .with_id(1)
            .encode()
            .unwrap();
        let mut inbound = futures::stream::iter(vec![Ok(rejection)]);

        let result = session.initiate(&conn, Some(3), &mut inbound).await;
        assert!(matches!(result, Err(NetError::HandshakeRejected(_))));
        assert_eq!(conn.handshake_state(), HandshakeState::Failed);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_initiate_times_out() {
        let (session, _registry) = session(InstanceKind::Client, None, true);
        let (conn, _rx) = test_connection(1);
        let conn = Arc::new(conn);
        let mut silent = futures::stream::pending::<Result<Bytes, NetError>>();

        let result = session.initiate(&conn, None, &mut silent).await;
        assert!(matches!(result, Err(NetError::HandshakeTimeout)));
        assert_eq!(conn.handshake_state(), HandshakeState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initiate_returns_when_connection_closes() {
        let (session, registry) = session(InstanceKind::Agent, None, true);
        let (conn, _rx) = test_connection(1);
        let conn = Arc::new(conn);
        let mut silent = futures::stream::pending::<Result<Bytes, NetError>>();

        let closer = conn.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            closer.close();
        });

        let started = tokio::time::Instant::now();
        let result = session.initiate(&conn, None, &mut silent).await;
        assert!(matches!(result, Err(NetError::ConnectionClosed)));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(session.local.get(), None);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_responder_deadline_closes_connection() {
        let (session, _registry) = session(InstanceKind::Server, Some(SERVER_ID), true);
        let (conn, _rx) = test_connection(1);
        let conn = Arc::new(conn);

        session.spawn_deadline(conn.clone()).await.unwrap();
        assert!(conn.is_closed());
        assert_eq!(conn.handshake_state(), HandshakeState::Failed);
    }
}
