//! Network constants and types for the relaymesh wire protocol.
//!
//! # Design Goals
//!
//! 1. **Bounded memory usage**: every frame has an explicit size limit and every
//!    queue has a fixed depth. A hostile peer cannot exhaust memory by declaring
//!    huge frames.
//!
//! 2. **Header-only routing**: the server forwards frames between instances by
//!    reading the first two protobuf fields (`to`, `from`) and nothing else.
//!
//! 3. **Identity pinned at handshake**: a connection's node identifier is set
//!    once and every routed frame must carry it in `from`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// =============================================================================
// NODE IDENTIFIERS
// =============================================================================

/// Identifier of one live mesh participant. Valid values are `0..=MAX_NODE_ID`;
/// on the wire it is an int32 varint and negative values are rejected.
pub type NodeId = u32;

/// Largest identifier that encodes as a non-negative int32.
pub const MAX_NODE_ID: NodeId = i32::MAX as NodeId;

/// Identifier held by a routing server unless configured otherwise.
pub const DEFAULT_SERVER_ID: NodeId = 0;

// =============================================================================
// WIRE FIELD NUMBERS
// =============================================================================
// Compatibility contract: these values never change.

/// Destination node identifier (varint).
pub const FIELD_TO: u32 = 1;

/// Source node identifier (varint).
pub const FIELD_FROM: u32 = 2;

/// Request correlation id (varint, 0 = no correlation).
pub const FIELD_ID: u32 = 3;

/// Payload kind code (varint).
pub const FIELD_KIND: u32 = 4;

/// Payload body (length-delimited).
pub const FIELD_BODY: u32 = 5;

pub const WIRE_VARINT: u8 = 0;
pub const WIRE_FIXED64: u8 = 1;
pub const WIRE_LEN: u8 = 2;
pub const WIRE_FIXED32: u8 = 5;

/// Build a single-byte field tag (`field << 3 | wire_type`).
pub const fn field_tag(field: u32, wire_type: u8) -> u8 {
    ((field << 3) as u8) | wire_type
}

/// Tag byte of the `to` field (0x08).
pub const TAG_TO: u8 = field_tag(FIELD_TO, WIRE_VARINT);

/// Tag byte of the `from` field (0x10).
pub const TAG_FROM: u8 = field_tag(FIELD_FROM, WIRE_VARINT);

/// Tag byte of the `id` field (0x18).
pub const TAG_ID: u8 = field_tag(FIELD_ID, WIRE_VARINT);

pub const TAG_KIND: u8 = field_tag(FIELD_KIND, WIRE_VARINT);
pub const TAG_BODY: u8 = field_tag(FIELD_BODY, WIRE_LEN);

// =============================================================================
// PORTS AND LIMITS
// =============================================================================

/// Default server port.
pub const DEFAULT_PORT: u16 = 8768;

/// Maximum size of one frame (2 MB), excluding its length prefix.
/// Frames declaring more than this are treated as corrupted and close the
/// connection before any buffer is allocated.
pub const MAX_FRAME_SIZE: usize = 2 * 1024 * 1024;

/// Maximum bytes of a varint32 length prefix or header field.
pub const MAX_VARINT32_BYTES: usize = 5;

/// Maximum concurrently served inbound connections.
pub const MAX_CONNECTIONS: usize = 1024;

/// Depth of each connection's outbound frame queue.
pub const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// Capacity of the lifecycle event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

// =============================================================================
// TIMEOUTS
// =============================================================================

/// Handshake timeout in seconds. A connection still unidentified after this
/// long is failed and closed.
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Default timeout for correlated requests.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Initial reconnect cycle timeout in milliseconds.
pub const RECONNECT_TIMEOUT_MS: u64 = 1_000;

/// Upper bound of the reconnect cycle timeout in milliseconds.
pub const RECONNECT_MAX_TIMEOUT_MS: u64 = 60_000;

// =============================================================================
// INSTANCE KINDS
// =============================================================================

/// Role an instance plays in the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceKind {
    /// Routing server; assigns node identifiers.
    Server,
    /// Managed agent.
    Agent,
    /// Operator-facing client.
    Client,
}

impl InstanceKind {
    pub fn is_server(&self) -> bool {
        matches!(self, InstanceKind::Server)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceKind::Server => "server",
            InstanceKind::Agent => "agent",
            InstanceKind::Client => "client",
        }
    }
}

impl fmt::Display for InstanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server" => Ok(InstanceKind::Server),
            "agent" => Ok(InstanceKind::Agent),
            "client" => Ok(InstanceKind::Client),
            other => Err(format!("unknown instance kind: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_field_numbers() {
        assert_eq!(FIELD_TO, 1);
        assert_eq!(FIELD_FROM, 2);
        assert_eq!(FIELD_ID, 3);
    }

    #[test]
    fn test_tag_bytes() {
        assert_eq!(TAG_TO, 0x08);
        assert_eq!(TAG_FROM, 0x10);
        assert_eq!(TAG_ID, 0x18);
        assert_eq!(TAG_KIND, 0x20);
        assert_eq!(TAG_BODY, 0x2a);
    }

    #[test]
    fn test_instance_kind_parse() {
        assert_eq!("agent".parse::<InstanceKind>().unwrap(), InstanceKind::Agent);
        assert_eq!(InstanceKind::Server.to_string(), "server");
        assert!("viewer".parse::<InstanceKind>().is_err());
    }
}
