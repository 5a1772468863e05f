//! Network error kinds

use super::message::PayloadKind;
use super::types::NodeId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetError {
    /// Malformed length prefix or header varint. Always closes the connection.
    #[error("corrupted frame: {0}")]
    CorruptedFrame(String),

    /// Routing rule violation (missing or spoofed `from`, traffic before handshake).
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    /// A correlated request expired. The connection stays open.
    #[error("request {0} timed out")]
    DispatchTimeout(u32),

    #[error("connect to {target} failed: {reason}")]
    ConnectFailed { target: String, reason: String },

    #[error("connection closed")]
    ConnectionClosed,

    /// The writer fell behind and the outbound queue is full.
    #[error("outbound queue full")]
    QueueFull,

    /// No connection leads to the node.
    #[error("no route to node {0}")]
    NoRoute(NodeId),

    #[error("node {0} is already registered")]
    DuplicateNode(NodeId),

    #[error("handler already registered for {0}")]
    DuplicateHandler(PayloadKind),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("payload codec error: {0}")]
    Codec(#[from] postcard::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetError {
    /// Whether this error must tear down the connection it occurred on.
    pub fn closes_connection(&self) -> bool {
        !matches!(
            self,
            NetError::DispatchTimeout(_)
                | NetError::ConnectFailed { .. }
                | NetError::NoRoute(_)
                | NetError::Config(_)
        )
    }

    pub fn corrupted(reason: impl Into<String>) -> Self {
        NetError::CorruptedFrame(reason.into())
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        NetError::InvalidMessage(reason.into())
    }
}
