//! Handler registration and authenticated dispatch
//!
//! Handlers are registered explicitly, in groups, under a payload kind. The
//! table is built once at startup; a kind claimed twice is a configuration
//! error at build time.

use super::connection::Connection;
use super::error::NetError;
use super::handshake::LocalId;
use super::message::{FailureCode, Message, Payload, PayloadKind};
use super::types::{InstanceKind, NodeId};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Replies a handler produces; each becomes a response correlated with the
/// request.
pub type HandlerResult = anyhow::Result<Vec<Payload>>;

type HandlerFn = Arc<dyn Fn(HandlerContext) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

#[derive(Clone)]
pub struct Handler {
    pub kind: PayloadKind,
    pub requires_auth: bool,
    /// Remote instance kinds allowed to invoke it; empty means any.
    pub allowed_kinds: Vec<InstanceKind>,
    func: HandlerFn,
}

impl Handler {
    fn permits(&self, remote: Option<InstanceKind>) -> bool {
        self.allowed_kinds.is_empty() || remote.is_some_and(|k| self.allowed_kinds.contains(&k))
    }
}

/// Handlers contributed by one feature.
pub struct HandlerGroup {
    name: String,
    handlers: Vec<Handler>,
}

impl HandlerGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handlers: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle<F, Fut>(
        mut self,
        kind: PayloadKind,
        requires_auth: bool,
        allowed_kinds: &[InstanceKind],
        f: F,
    ) -> Self
    where
        F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handlers.push(Handler {
            kind,
            requires_auth,
            allowed_kinds: allowed_kinds.to_vec(),
            func: Arc::new(move |ctx: HandlerContext| f(ctx).boxed()),
        });
        self
    }

    /// Handler that requires an authenticated connection.
    pub fn auth<F, Fut>(self, kind: PayloadKind, f: F) -> Self
    where
        F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handle(kind, true, &[], f)
    }

    /// Handler reachable on any identified connection.
    pub fn unauth<F, Fut>(self, kind: PayloadKind, f: F) -> Self
    where
        F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handle(kind, false, &[], f)
    }
}

/// Everything a handler gets to see about one inbound message.
#[derive(Clone)]
pub struct HandlerContext {
    conn: Arc<Connection>,
    message: Message,
    local: Arc<LocalId>,
}

impl HandlerContext {
    pub fn new(conn: Arc<Connection>, message: Message, local: Arc<LocalId>) -> Self {
        Self { conn, message, local }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn payload(&self) -> &Payload {
        &self.message.payload
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Node the message came from: its `from` field, or the connection's
    /// remote identity for unrouted messages.
    pub fn sender(&self) -> Option<NodeId> {
        self.message.from.or_else(|| self.conn.remote_node())
    }

    pub fn local_id(&self) -> Option<NodeId> {
        self.local.get()
    }

    /// Send one reply now, correlated with the request.
    pub async fn reply(&self, payload: Payload) -> Result<(), NetError> {
        self.conn
            .send(&self.message.reply(self.local.get(), payload))
            .await
    }

    /// Open the authentication gate of the originating connection.
    pub fn authenticate(&self) -> bool {
        self.conn.authenticate()
    }

    pub fn deauthenticate(&self) -> bool {
        self.conn.deauthenticate()
    }
}

/// What dispatch did with one message.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// No payload, or no handler for its kind.
    Ignored,
    /// Handler requires authentication; message dropped.
    Unauthenticated,
    /// Remote instance kind not allowed; message dropped.
    Denied,
    Spawned(JoinHandle<()>),
}

#[derive(Default)]
pub struct DispatchTableBuilder {
    handlers: HashMap<PayloadKind, (String, Handler)>,
}

impl DispatchTableBuilder {
    pub fn group(mut self, group: HandlerGroup) -> Result<Self, NetError> {
        for handler in group.handlers {
            if let Some((owner, _)) = self.handlers.get(&handler.kind) {
                error!(
                    "Handler for {} in group {} already registered by group {}",
                    handler.kind, group.name, owner
                );
                return Err(NetError::DuplicateHandler(handler.kind));
            }
            self.handlers.insert(handler.kind, (group.name.clone(), handler));
        }
        Ok(self)
    }

    pub fn build(self) -> DispatchTable {
        DispatchTable {
            handlers: self
                .handlers
                .into_iter()
                .map(|(kind, (_, handler))| (kind, handler))
                .collect(),
        }
    }
}

/// Immutable map from payload kind to handler.
pub struct DispatchTable {
    handlers: HashMap<PayloadKind, Handler>,
}

impl DispatchTable {
    pub fn builder() -> DispatchTableBuilder {
        DispatchTableBuilder::default()
    }

    pub fn lookup(&self, kind: PayloadKind) -> Option<&Handler> {
        self.handlers.get(&kind)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run the handler for `ctx`'s message on its own task.
    ///
    /// Auth and kind violations drop the message and count against the
    /// connection; they do not close it.
    pub fn dispatch(&self, ctx: HandlerContext) -> DispatchOutcome {
        let kind = match ctx.message.kind() {
            Some(kind) => kind,
            None => return DispatchOutcome::Ignored,
        };
        let handler = match self.handlers.get(&kind) {
            Some(handler) => handler,
            None => {
                debug!("No handler for {}", kind);
                return DispatchOutcome::Ignored;
            }
        };

        if handler.requires_auth && !ctx.conn.is_authenticated() {
            let count = ctx.conn.record_violation();
            warn!(
                "Dropped {} from unauthenticated {} ({} violations)",
                kind,
                ctx.conn.peer_addr(),
                count
            );
            return DispatchOutcome::Unauthenticated;
        }
        if !handler.permits(ctx.conn.remote_kind()) {
            let count = ctx.conn.record_violation();
            warn!(
                "Dropped {} from disallowed {:?} at {} ({} violations)",
                kind,
                ctx.conn.remote_kind(),
                ctx.conn.peer_addr(),
                count
            );
            return DispatchOutcome::Denied;
        }

        let func = handler.func.clone();
        DispatchOutcome::Spawned(tokio::spawn(run_handler(func, kind, ctx)))
    }
}

async fn run_handler(func: HandlerFn, kind: PayloadKind, ctx: HandlerContext) {
    let conn = ctx.conn.clone();
    let local = ctx.local.clone();
    let request = ctx.message.clone();

    let result = AssertUnwindSafe(async move { func(ctx).await })
        .catch_unwind()
        .await;

    let replies = match result {
        Ok(Ok(replies)) => replies,
        Ok(Err(e)) => {
            error!("Handler for {} failed: {:#}", kind, e);
            vec![Payload::Failure(FailureCode::HandlerFailed)]
        }
        Err(_) => {
            error!("Handler for {} panicked", kind);
            vec![Payload::Failure(FailureCode::HandlerFailed)]
        }
    };

    for payload in replies {
        if let Err(e) = conn.send(&request.reply(local.get(), payload)).await {
            debug!("Dropping reply to {}: {}", conn.peer_addr(), e);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::{RemoteIdentity, test_connection};
    use crate::net::handshake::HandshakeState;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    const FEATURE_ECHO: PayloadKind = PayloadKind::Feature(100);
    const FEATURE_LOGIN: PayloadKind = PayloadKind::Feature(101);

    fn connection(
        kind: InstanceKind,
        state: HandshakeState,
    ) -> (Arc<Connection>, mpsc::Receiver<Bytes>) {
        let (conn, rx) = test_connection(1);
        conn.set_identity(RemoteIdentity {
            node: 1234,
            kind,
            uuid: String::new(),
        })
        .unwrap();
        conn.transition(HandshakeState::Connected, HandshakeState::IdentifierAssigned);
        if state == HandshakeState::Authenticated {
            conn.authenticate();
        }
        (Arc::new(conn), rx)
    }

    fn ctx(conn: &Arc<Connection>, payload: Payload) -> HandlerContext {
        let message = Message::new(payload).to(2000).from(1234).with_id(42);
        HandlerContext::new(conn.clone(), message, Arc::new(LocalId::fixed(2000)))
    }

    fn echo_table() -> DispatchTable {
        let group = HandlerGroup::new("echo")
            .auth(FEATURE_ECHO, |ctx| async move { Ok(vec![ctx.payload().clone()]) })
            .unauth(FEATURE_LOGIN, |ctx| async move {
                ctx.authenticate();
                Ok(vec![])
            });
        DispatchTable::builder().group(group).unwrap().build()
    }

    async fn spawned(outcome: DispatchOutcome) {
        match outcome {
            DispatchOutcome::Spawned(handle) => handle.await.unwrap(),
            other => panic!("expected spawn, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_kind_rejected_at_build() {
        let a = HandlerGroup::new("a").unauth(FEATURE_ECHO, |_| async { Ok(vec![]) });
        let b = HandlerGroup::new("b").auth(FEATURE_ECHO, |_| async { Ok(vec![]) });

        let result = DispatchTable::builder().group(a).unwrap().group(b);
        assert!(matches!(result, Err(NetError::DuplicateHandler(k)) if k == FEATURE_ECHO));
    }

    #[tokio::test]
    async fn test_reply_is_correlated() {
        let table = echo_table();
        let (conn, mut rx) = connection(InstanceKind::Client, HandshakeState::Authenticated);

        let payload = Payload::feature(100, Bytes::from_static(b"hi"));
        spawned(table.dispatch(ctx(&conn, payload.clone()))).await;

        let reply = Message::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(reply.id, 42);
        assert_eq!(reply.to, Some(1234));
        assert_eq!(reply.from, Some(2000));
        assert_eq!(reply.payload, payload);
    }

    #[tokio::test]
    async fn test_unknown_kind_ignored() {
        let table = echo_table();
        let (conn, _rx) = connection(InstanceKind::Client, HandshakeState::Authenticated);

        let outcome = table.dispatch(ctx(&conn, Payload::feature(999, Bytes::new())));
        assert!(matches!(outcome, DispatchOutcome::Ignored));
        assert!(matches!(table.dispatch(ctx(&conn, Payload::Empty)), DispatchOutcome::Ignored));
        assert_eq!(conn.violations(), 0);
    }

    #[tokio::test]
    async fn test_unauthenticated_dropped_and_counted() {
        let table = echo_table();
        let (conn, mut rx) = connection(InstanceKind::Client, HandshakeState::IdentifierAssigned);

        let outcome = table.dispatch(ctx(&conn, Payload::feature(100, Bytes::new())));
        assert!(matches!(outcome, DispatchOutcome::Unauthenticated));
        assert_eq!(conn.violations(), 1);
        assert!(rx.try_recv().is_err());
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_login_handler_opens_gate() {
        let table = echo_table();
        let (conn, _rx) = connection(InstanceKind::Client, HandshakeState::IdentifierAssigned);

        spawned(table.dispatch(ctx(&conn, Payload::feature(101, Bytes::new())))).await;
        assert!(conn.is_authenticated());
    }

    #[tokio::test]
    async fn test_disallowed_instance_kind() {
        let group = HandlerGroup::new("agent-only").handle(
            FEATURE_ECHO,
            false,
            &[InstanceKind::Agent],
            |_| async { Ok(vec![]) },
        );
        let table = DispatchTable::builder().group(group).unwrap().build();
        let (conn, _rx) = connection(InstanceKind::Client, HandshakeState::Authenticated);

        let outcome = table.dispatch(ctx(&conn, Payload::feature(100, Bytes::new())));
        assert!(matches!(outcome, DispatchOutcome::Denied));
        assert_eq!(conn.violations(), 1);
    }

    #[tokio::test]
    async fn test_failing_handler_sends_generic_failure() {
        let group = HandlerGroup::new("broken")
            .unauth(FEATURE_ECHO, |_| async { Err(anyhow::anyhow!("disk on fire")) })
            .unauth(FEATURE_LOGIN, |_| async {
                let replies: Vec<Payload> = Vec::new();
                assert!(!replies.is_empty(), "handler bug");
                Ok(replies)
            });
        let table = DispatchTable::builder().group(group).unwrap().build();
        let (conn, mut rx) = connection(InstanceKind::Client, HandshakeState::Authenticated);

        for kind in [100, 101] {
            spawned(table.dispatch(ctx(&conn, Payload::feature(kind, Bytes::new())))).await;
            let reply = Message::decode(&rx.recv().await.unwrap()).unwrap();
            assert_eq!(reply.payload, Payload::Failure(FailureCode::HandlerFailed));
            assert_eq!(reply.id, 42);
        }
    }
}
