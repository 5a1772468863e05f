//! Mesh node: listening, dialing and the per-connection pipeline
//!
//! Every inbound frame runs through the same steps, in order:
//! decode frame → route (header only) → full decode → correlate → gate →
//! dispatch. Each connection has one reader task and one writer task; the
//! reader handles frames strictly in receipt order.

use super::connection::{Connection, ConnectionInfo};
use super::dispatch::{DispatchOutcome, DispatchTable, HandlerContext, HandlerGroup};
use super::error::NetError;
use super::frame::FrameCodec;
use super::handshake::{Gate, HandshakeSession, LocalId};
use super::message::{Message, Payload, PayloadKind};
use super::proxy::{RouteOutcome, RoutingProxy};
use super::reconnect::{ReconnectConfig, ReconnectHandle, ReconnectScheduler, Target};
use super::registry::ConnectionRegistry;
use super::transport::{BoxedStream, NoTraversal, PlainTransport, TransportWrapper, TraversalHook};
use super::correlator::PendingResponse;
use super::types::{
    DEFAULT_PORT, DEFAULT_SERVER_ID, EVENT_CHANNEL_CAPACITY, HANDSHAKE_TIMEOUT_SECS, InstanceKind,
    MAX_CONNECTIONS, MAX_FRAME_SIZE, MAX_NODE_ID, NodeId, OUTBOUND_QUEUE_DEPTH,
    REQUEST_TIMEOUT_SECS,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bytes of a rejected frame included in debug logs.
const LOGGED_FRAME_PREFIX: usize = 32;

/// Time allowed to flush queued frames when a connection closes.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

type FrameReader = FramedRead<ReadHalf<BoxedStream>, FrameCodec>;
type FrameWriter = FramedWrite<WriteHalf<BoxedStream>, FrameCodec>;

// =============================================================================
// CONFIGURATION
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub kind: InstanceKind,
    /// Own identifier. Servers default to 0; other nodes learn theirs from
    /// the server unless one is given here.
    pub node_id: Option<NodeId>,
    pub listen_addr: SocketAddr,
    pub max_connections: usize,
    pub max_frame_size: usize,
    pub handshake_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub outbound_queue_depth: usize,
    /// Open the authentication gate as soon as the handshake completes.
    /// When off, a handler without an auth requirement must open it.
    pub auto_authenticate: bool,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            kind: InstanceKind::Agent,
            node_id: None,
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            max_connections: MAX_CONNECTIONS,
            max_frame_size: MAX_FRAME_SIZE,
            handshake_timeout_secs: HANDSHAKE_TIMEOUT_SECS,
            request_timeout_secs: REQUEST_TIMEOUT_SECS,
            outbound_queue_depth: OUTBOUND_QUEUE_DEPTH,
            auto_authenticate: true,
        }
    }
}

impl MeshConfig {
    pub fn server() -> Self {
        Self {
            kind: InstanceKind::Server,
            node_id: Some(DEFAULT_SERVER_ID),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), NetError> {
        if let Some(id) = self.node_id {
            if id > MAX_NODE_ID {
                return Err(NetError::Config(format!("node id {} out of range", id)));
            }
        }
        if self.max_connections == 0 {
            return Err(NetError::Config("max_connections must be positive".into()));
        }
        if self.max_frame_size == 0 || self.max_frame_size > u32::MAX as usize {
            return Err(NetError::Config(format!(
                "max_frame_size {} out of range",
                self.max_frame_size
            )));
        }
        if self.handshake_timeout_secs == 0 || self.request_timeout_secs == 0 {
            return Err(NetError::Config("timeouts must be positive".into()));
        }
        if self.outbound_queue_depth == 0 {
            return Err(NetError::Config("outbound_queue_depth must be positive".into()));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// =============================================================================
// EVENTS
// =============================================================================

/// Lifecycle events for observers outside the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetEvent {
    /// A node completed its handshake with this one.
    NodeAdded { node: NodeId, kind: InstanceKind },
    /// Transport behind a newly added node.
    LinkAdded {
        node: NodeId,
        addr: SocketAddr,
        inbound: bool,
    },
    /// A registered node's connection went away.
    NodeRemoved { node: NodeId },
    /// A server reported `node` unreachable.
    EndpointClosed { node: NodeId },
    HandshakeFailed { addr: SocketAddr, reason: String },
}

// =============================================================================
// NODE
// =============================================================================

struct Inner {
    config: MeshConfig,
    uuid: String,
    local: Arc<LocalId>,
    registry: Arc<ConnectionRegistry>,
    proxy: RoutingProxy,
    handshake: HandshakeSession,
    dispatch: DispatchTable,
    transport: Arc<dyn TransportWrapper>,
    traversal: Arc<dyn TraversalHook>,
    limiter: Arc<Semaphore>,
    shutdown: CancellationToken,
    next_conn_id: AtomicU64,
}

/// One participant of the mesh. Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct MeshNode {
    inner: Arc<Inner>,
}

pub struct MeshNodeBuilder {
    config: MeshConfig,
    groups: Vec<HandlerGroup>,
    transport: Arc<dyn TransportWrapper>,
    traversal: Arc<dyn TraversalHook>,
}

impl MeshNodeBuilder {
    pub fn handlers(mut self, group: HandlerGroup) -> Self {
        self.groups.push(group);
        self
    }

    pub fn transport(mut self, transport: impl TransportWrapper) -> Self {
        self.transport = Arc::new(transport);
        self
    }

    pub fn traversal(mut self, traversal: impl TraversalHook) -> Self {
        self.traversal = Arc::new(traversal);
        self
    }

    /// Validate the configuration and build the dispatch table. Fails on a
    /// payload kind claimed by two handlers.
    pub fn build(self) -> Result<MeshNode, NetError> {
        let config = self.config;
        config.validate()?;

        let mut table = DispatchTable::builder().group(core_handlers())?;
        for group in self.groups {
            table = table.group(group)?;
        }
        let dispatch = table.build();

        let uuid = hex::encode(rand::random::<[u8; 16]>());
        let local = Arc::new(match (config.kind, config.node_id) {
            (_, Some(id)) => LocalId::fixed(id),
            (InstanceKind::Server, None) => LocalId::fixed(DEFAULT_SERVER_ID),
            (_, None) => LocalId::new(),
        });

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let registry = Arc::new(ConnectionRegistry::with_events(events));
        let proxy = RoutingProxy::new(local.clone(), registry.clone());
        let handshake = HandshakeSession::new(
            local.clone(),
            config.kind,
            uuid.clone(),
            registry.clone(),
            config.auto_authenticate,
            config.handshake_timeout(),
        );

        info!(
            "Mesh node {} ({}) with {} handlers",
            uuid,
            config.kind,
            dispatch.len()
        );

        Ok(MeshNode {
            inner: Arc::new(Inner {
                limiter: Arc::new(Semaphore::new(config.max_connections)),
                config,
                uuid,
                local,
                registry,
                proxy,
                handshake,
                dispatch,
                transport: self.transport,
                traversal: self.traversal,
                shutdown: CancellationToken::new(),
                next_conn_id: AtomicU64::new(1),
            }),
        })
    }
}

/// Handlers every node carries.
fn core_handlers() -> HandlerGroup {
    HandlerGroup::new("core").unauth(PayloadKind::Ping, |ctx| async move {
        match ctx.payload() {
            Payload::Ping(nonce) => Ok(vec![Payload::Pong(*nonce)]),
            _ => Ok(vec![]),
        }
    })
}

impl MeshNode {
    pub fn builder(config: MeshConfig) -> MeshNodeBuilder {
        MeshNodeBuilder {
            config,
            groups: Vec::new(),
            transport: Arc::new(PlainTransport),
            traversal: Arc::new(NoTraversal),
        }
    }

    pub fn config(&self) -> &MeshConfig {
        &self.inner.config
    }

    pub fn kind(&self) -> InstanceKind {
        self.inner.config.kind
    }

    pub fn uuid(&self) -> &str {
        &self.inner.uuid
    }

    pub fn local_id(&self) -> Option<NodeId> {
        self.inner.local.get()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.inner.registry
    }

    pub fn connection_count(&self) -> usize {
        self.inner.registry.count()
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.inner.registry.infos()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetEvent> {
        self.inner.registry.subscribe()
    }

    // =========================================================================
    // Accepting
    // =========================================================================

    /// Bind the configured address and serve inbound connections in the
    /// background. Returns the bound address.
    pub async fn listen(&self) -> Result<SocketAddr, NetError> {
        let listener = TcpListener::bind(self.inner.config.listen_addr).await?;
        let addr = listener.local_addr()?;
        info!("Listening on {}", addr);

        let node = self.clone();
        tokio::spawn(async move { node.accept_loop(listener).await });
        Ok(addr)
    }

    async fn accept_loop(self, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.inner.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    if !accept_backoff(&self.inner.shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            let permit = match self.inner.limiter.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(
                        "Connection limit {} reached, refusing {}",
                        self.inner.config.max_connections, peer
                    );
                    continue;
                }
            };

            let node = self.clone();
            tokio::spawn(async move {
                if let Err(e) = node.serve_inbound(stream, peer, permit).await {
                    debug!("Inbound connection {} ended: {}", peer, e);
                }
            });
        }
        debug!("Accept loop stopped");
    }

    async fn serve_inbound(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        _permit: OwnedSemaphorePermit,
    ) -> Result<(), NetError> {
        stream.set_nodelay(true)?;
        let stream = self.inner.transport.wrap(Box::new(stream), peer, true).await?;

        debug!("Inbound connection from {}", peer);
        let (conn, reader) = self.start_connection(stream, peer, true);
        self.inner.handshake.spawn_deadline(conn.clone());
        self.read_loop(conn, reader).await;
        Ok(())
    }

    // =========================================================================
    // Dialing
    // =========================================================================

    /// Dial `target`, run the handshake and start serving the connection.
    pub async fn connect(&self, target: &Target) -> Result<Arc<Connection>, NetError> {
        self.dial(&target.address(), None).await
    }

    /// `presented` is only sent to non-server peers; servers always assign a
    /// fresh identifier.
    async fn dial(&self, address: &str, presented: Option<NodeId>) -> Result<Arc<Connection>, NetError> {
        let connect_failed = |e: std::io::Error| NetError::ConnectFailed {
            target: address.to_string(),
            reason: e.to_string(),
        };

        let stream = TcpStream::connect(address).await.map_err(connect_failed)?;
        let peer = stream.peer_addr().map_err(connect_failed)?;
        stream.set_nodelay(true)?;
        let stream = self.inner.transport.wrap(Box::new(stream), peer, false).await?;

        let (conn, mut reader) = self.start_connection(stream, peer, false);
        let handshake = tokio::select! {
            _ = self.inner.shutdown.cancelled() => Err(NetError::ConnectionClosed),
            result = self.inner.handshake.initiate(&conn, presented, &mut reader) => result,
        };
        if let Err(e) = handshake {
            warn!("Handshake with {} failed: {}", peer, e);
            self.inner.registry.emit(NetEvent::HandshakeFailed {
                addr: peer,
                reason: e.to_string(),
            });
            conn.close();
            return Err(e);
        }
        if self.inner.shutdown.is_cancelled() {
            self.inner.registry.unregister_connection(&conn);
            conn.close();
            return Err(NetError::ConnectionClosed);
        }

        let node = self.clone();
        let reading = conn.clone();
        tokio::spawn(async move { node.read_loop(reading, reader).await });
        Ok(conn)
    }

    /// Dial the configured targets until one connects, the iteration cap is
    /// hit, or the node shuts down.
    pub async fn connect_loop(&self, config: ReconnectConfig) -> Result<Option<Arc<Connection>>, NetError> {
        let scheduler = self.scheduler(config)?;
        Ok(scheduler
            .run(|target| {
                let node = self.clone();
                async move { node.connect(&target).await }
            })
            .await)
    }

    /// Run `connect_loop` in the background.
    pub fn spawn_reconnect(&self, config: ReconnectConfig) -> Result<ReconnectHandle<Arc<Connection>>, NetError> {
        let scheduler = self.scheduler(config)?;
        let node = self.clone();
        Ok(scheduler.spawn(move |target| {
            let node = node.clone();
            async move { node.connect(&target).await }
        }))
    }

    fn scheduler(&self, config: ReconnectConfig) -> Result<ReconnectScheduler, NetError> {
        Ok(ReconnectScheduler::new(config)?.with_cancel_token(self.inner.shutdown.child_token()))
    }

    /// Keep a connection to one of the targets up: reconnect whenever it
    /// drops, until shutdown or the scheduler gives up.
    pub fn maintain(&self, config: ReconnectConfig) -> Result<JoinHandle<()>, NetError> {
        config.validate()?;
        let node = self.clone();

        Ok(tokio::spawn(async move {
            loop {
                let conn = match node.connect_loop(config.clone()).await {
                    Ok(Some(conn)) => conn,
                    Ok(None) => {
                        info!("Reconnect loop ended without a connection");
                        break;
                    }
                    Err(e) => {
                        warn!("Reconnect loop failed: {}", e);
                        break;
                    }
                };

                tokio::select! {
                    _ = node.inner.shutdown.cancelled() => break,
                    _ = conn.closed() => {}
                }
                if node.inner.shutdown.is_cancelled() {
                    break;
                }
                warn!("Lost connection to {}, reconnecting", conn.peer_addr());
            }
        }))
    }

    /// Connect straight to `node` at the address the traversal hook knows,
    /// presenting this node's identifier.
    pub async fn dial_direct(&self, node: NodeId) -> Result<Arc<Connection>, NetError> {
        if let Some(conn) = self.inner.registry.lookup(node) {
            return Ok(conn);
        }
        if self.local_id().is_none() {
            return Err(NetError::invalid("local identifier not assigned"));
        }

        let addr = self
            .inner
            .traversal
            .resolve(node)
            .await
            .ok_or(NetError::NoRoute(node))?;
        let conn = self.dial(&addr.to_string(), self.local_id()).await?;

        if conn.remote_node() != Some(node) {
            self.inner.registry.unregister_connection(&conn);
            conn.close();
            return Err(NetError::HandshakeRejected(format!(
                "{} answered as node {:?}, expected {}",
                addr,
                conn.remote_node(),
                node
            )));
        }
        Ok(conn)
    }

    // =========================================================================
    // Sending
    // =========================================================================

    /// Send a request on `conn` and return the handle to its response.
    pub async fn send(&self, conn: &Connection, msg: Message) -> Result<PendingResponse, NetError> {
        conn.request(msg, self.inner.config.request_timeout()).await
    }

    /// Send without waiting for a response.
    pub async fn send_oneway(&self, conn: &Connection, msg: Message) -> Result<(), NetError> {
        conn.send(&msg).await
    }

    /// Send a request to `node`: directly if connected to it, otherwise
    /// through a server connection.
    pub async fn send_to(&self, node: NodeId, payload: Payload) -> Result<PendingResponse, NetError> {
        let local = self
            .local_id()
            .ok_or_else(|| NetError::invalid("local identifier not assigned"))?;
        let conn = self.route_to(node)?;
        self.send(&conn, Message::new(payload).to(node).from(local)).await
    }

    fn route_to(&self, node: NodeId) -> Result<Arc<Connection>, NetError> {
        self.inner
            .registry
            .lookup(node)
            .or_else(|| self.inner.registry.server_connection())
            .ok_or(NetError::NoRoute(node))
    }

    /// Round-trip time of a ping to `node`.
    pub async fn ping(&self, node: NodeId) -> Result<Duration, NetError> {
        let nonce = rand::random::<u64>();
        let started = Instant::now();
        let reply = self.send_to(node, Payload::Ping(nonce)).await?.await?;

        match reply.payload {
            Payload::Pong(n) if n == nonce => {
                let rtt = started.elapsed();
                debug!("Ping {} in {:?}", node, rtt);
                Ok(rtt)
            }
            Payload::EndpointClosed(n) => Err(NetError::NoRoute(n)),
            other => Err(NetError::invalid(format!("unexpected ping reply {:?}", other.kind()))),
        }
    }

    // =========================================================================
    // Pipeline
    // =========================================================================

    fn start_connection(&self, stream: BoxedStream, peer: SocketAddr, inbound: bool) -> (Arc<Connection>, FrameReader) {
        let codec = FrameCodec::with_max_frame_size(self.inner.config.max_frame_size);
        let (read, write) = tokio::io::split(stream);
        let reader = FramedRead::new(read, codec);
        let writer = FramedWrite::new(write, codec);

        let (tx, rx) = mpsc::channel(self.inner.config.outbound_queue_depth);
        let conn_id = self.inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(Connection::new(conn_id, peer, inbound, tx));

        tokio::spawn(write_loop(conn.cancel_token(), rx, writer));
        (conn, reader)
    }

    async fn read_loop(&self, conn: Arc<Connection>, mut reader: FrameReader) {
        loop {
            let next = tokio::select! {
                biased;
                _ = conn.closed() => break,
                _ = self.inner.shutdown.cancelled() => break,
                next = reader.next() => next,
            };

            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    warn!("Closing {}: {}", conn.peer_addr(), e);
                    break;
                }
                None => {
                    debug!("Connection {} closed by peer", conn.peer_addr());
                    break;
                }
            };

            conn.record_recv(frame.len());
            if let Err(e) = self.process(&conn, frame).await {
                if e.closes_connection() {
                    warn!("Closing {}: {}", conn.peer_addr(), e);
                    break;
                }
                debug!("Frame from {} dropped: {}", conn.peer_addr(), e);
            }
        }

        self.inner.registry.unregister_connection(&conn);
        conn.close();
    }

    async fn process(&self, conn: &Arc<Connection>, frame: Bytes) -> Result<(), NetError> {
        let head = frame.slice(..frame.len().min(LOGGED_FRAME_PREFIX));

        let result = self.process_frame(conn, frame).await;
        if let Err(e) = &result {
            if e.closes_connection() {
                debug!("Rejected frame from {}: {}", conn.peer_addr(), hex::encode(&head));
            }
        }
        result
    }

    async fn process_frame(&self, conn: &Arc<Connection>, frame: Bytes) -> Result<(), NetError> {
        let frame = match self.inner.proxy.route(conn, frame).await? {
            RouteOutcome::Local(frame) => frame,
            RouteOutcome::Forwarded { .. } | RouteOutcome::Unreachable { .. } => return Ok(()),
        };

        let msg = Message::decode(&frame)?;
        if let Payload::EndpointClosed(node) = msg.payload {
            if conn.handshake_state().is_identified() {
                self.inner.registry.emit(NetEvent::EndpointClosed { node });
            }
        }

        let msg = match conn.correlator().resolve(msg) {
            Some(msg) => msg,
            None => return Ok(()),
        };

        match self.inner.handshake.gate(conn, msg.kind())? {
            Gate::Handshake => self.inner.handshake.respond(conn, &msg).await,
            Gate::Dispatch => {
                let kind = msg.kind();
                let ctx = HandlerContext::new(conn.clone(), msg, self.inner.local.clone());
                if let DispatchOutcome::Ignored = self.inner.dispatch.dispatch(ctx) {
                    debug!("Ignored {:?} from {}", kind, conn.peer_addr());
                }
                Ok(())
            }
        }
    }

    /// Stop accepting, stop every reconnect loop and close every connection.
    pub fn shutdown(&self) {
        info!("Shutting down mesh node {}", self.inner.uuid);
        self.inner.shutdown.cancel();
        self.inner.registry.close_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

/// Wait out `ACCEPT_ERROR_BACKOFF`. Returns false if the node shut down
/// meanwhile.
async fn accept_backoff(shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => true,
    }
}

/// Drain the outbound queue into the socket. Frames queued before a close
/// are flushed before the write half shuts down.
async fn write_loop(cancel: CancellationToken, mut rx: mpsc::Receiver<Bytes>, mut writer: FrameWriter) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                while let Ok(frame) = rx.try_recv() {
                    if writer.feed(frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = writer.send(frame).await {
                        debug!("Write failed: {}", e);
                        break;
                    }
                }
                None => break,
            },
        }
    }

    cancel.cancel();
    let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, writer.close()).await;
}
