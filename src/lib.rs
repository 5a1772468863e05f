pub mod net;
pub mod types;

pub use net::{
    HandlerContext, HandlerGroup, MeshConfig, MeshNode, Message, NetError, NetEvent, Payload,
    PayloadKind, ReconnectConfig, Target,
};
pub use types::*;
