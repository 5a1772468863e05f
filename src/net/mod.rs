//! Mesh networking layer

pub mod connection;
pub mod correlator;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod header;
pub mod message;
pub mod protocol;
pub mod proxy;
pub mod reconnect;
pub mod registry;
pub mod transport;
pub mod types;

// Re-exports
pub use connection::{Connection, ConnectionInfo, RemoteIdentity};
pub use correlator::{PendingResponse, ResponseCorrelator};
pub use dispatch::{
    DispatchOutcome, DispatchTable, DispatchTableBuilder, HandlerContext, HandlerGroup,
    HandlerResult,
};
pub use error::NetError;
pub use frame::{FrameCodec, encode_frame};
pub use handshake::{Gate, HandshakeSession, HandshakeState, LocalId};
pub use header::{RoutingHeader, WireHeaderReader, peek_routing_header};
pub use message::{
    FailureCode, IdentityRequest, IdentityResponse, Message, Payload, PayloadKind,
};
pub use protocol::{MeshConfig, MeshNode, MeshNodeBuilder, NetEvent};
pub use proxy::{RouteOutcome, RoutingProxy};
pub use reconnect::{Cycle, ReconnectConfig, ReconnectHandle, ReconnectScheduler, Target};
pub use registry::ConnectionRegistry;
pub use transport::{
    AsyncStream, BoxedStream, NoTraversal, PlainTransport, TransportWrapper, TraversalHook,
};
pub use types::{DEFAULT_PORT, DEFAULT_SERVER_ID, InstanceKind, MAX_FRAME_SIZE, MAX_NODE_ID, NodeId};
