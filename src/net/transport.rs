//! Hook points around the raw transport
//!
//! A `TransportWrapper` sees every accepted or dialed stream once, before
//! framing attaches, and may replace it (e.g. with an encrypted stream). A
//! `TraversalHook` resolves where a node can be dialed directly.

use super::error::NetError;
use super::types::NodeId;
use futures::future::BoxFuture;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};

/// Byte stream the framing layer can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedStream = Box<dyn AsyncStream>;

pub trait TransportWrapper: Send + Sync + 'static {
    /// Wrap `stream` for the connection with `peer`. An error drops the
    /// connection before any frame is read.
    fn wrap(
        &self,
        stream: BoxedStream,
        peer: SocketAddr,
        inbound: bool,
    ) -> BoxFuture<'static, Result<BoxedStream, NetError>>;
}

/// Leaves the stream untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTransport;

impl TransportWrapper for PlainTransport {
    fn wrap(
        &self,
        stream: BoxedStream,
        _peer: SocketAddr,
        _inbound: bool,
    ) -> BoxFuture<'static, Result<BoxedStream, NetError>> {
        Box::pin(async move { Ok(stream) })
    }
}

pub trait TraversalHook: Send + Sync + 'static {
    /// Address at which `node` accepts direct connections, if known.
    fn resolve(&self, node: NodeId) -> BoxFuture<'static, Option<SocketAddr>>;
}

/// Knows no direct routes; everything goes through a server.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTraversal;

impl TraversalHook for NoTraversal {
    fn resolve(&self, _node: NodeId) -> BoxFuture<'static, Option<SocketAddr>> {
        Box::pin(async { None })
    }
}
