//! Message envelope and core payload kinds
//!
//! The envelope is protobuf-wire encoded so that the routing fields can be
//! read without a full decode (see `header`). Core payload bodies are postcard;
//! feature payload bodies are opaque bytes owned by their handlers.

use super::error::NetError;
use super::header::{decode_varint32, decode_varint64, encode_varint, varint_len};
use super::types::{
    FIELD_BODY, FIELD_FROM, FIELD_ID, FIELD_KIND, FIELD_TO, InstanceKind, MAX_NODE_ID, NodeId,
    TAG_BODY, TAG_FROM, TAG_ID, TAG_KIND, TAG_TO, WIRE_FIXED32, WIRE_FIXED64, WIRE_LEN,
    WIRE_VARINT,
};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// PAYLOAD KINDS
// =============================================================================

const KIND_IDENTITY_REQUEST: u32 = 1;
const KIND_IDENTITY_RESPONSE: u32 = 2;
const KIND_IDENTITY_REJECTED: u32 = 3;
const KIND_ENDPOINT_CLOSED: u32 = 4;
const KIND_PING: u32 = 5;
const KIND_PONG: u32 = 6;
const KIND_FAILURE: u32 = 7;

/// Key a handler is registered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    IdentityRequest,
    IdentityResponse,
    IdentityRejected,
    EndpointClosed,
    Ping,
    Pong,
    Failure,
    /// Any code not owned by the core.
    Feature(u32),
}

impl PayloadKind {
    pub fn code(&self) -> u32 {
        match self {
            PayloadKind::IdentityRequest => KIND_IDENTITY_REQUEST,
            PayloadKind::IdentityResponse => KIND_IDENTITY_RESPONSE,
            PayloadKind::IdentityRejected => KIND_IDENTITY_REJECTED,
            PayloadKind::EndpointClosed => KIND_ENDPOINT_CLOSED,
            PayloadKind::Ping => KIND_PING,
            PayloadKind::Pong => KIND_PONG,
            PayloadKind::Failure => KIND_FAILURE,
            PayloadKind::Feature(code) => *code,
        }
    }

    /// Map a wire code to a kind. Code 0 means "no payload".
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => None,
            KIND_IDENTITY_REQUEST => Some(PayloadKind::IdentityRequest),
            KIND_IDENTITY_RESPONSE => Some(PayloadKind::IdentityResponse),
            KIND_IDENTITY_REJECTED => Some(PayloadKind::IdentityRejected),
            KIND_ENDPOINT_CLOSED => Some(PayloadKind::EndpointClosed),
            KIND_PING => Some(PayloadKind::Ping),
            KIND_PONG => Some(PayloadKind::Pong),
            KIND_FAILURE => Some(PayloadKind::Failure),
            other => Some(PayloadKind::Feature(other)),
        }
    }

    /// Kinds exchanged while a connection is still unidentified.
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            PayloadKind::IdentityRequest
                | PayloadKind::IdentityResponse
                | PayloadKind::IdentityRejected
        )
    }

    pub fn is_core(&self) -> bool {
        !matches!(self, PayloadKind::Feature(_))
    }
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadKind::IdentityRequest => f.write_str("identity-request"),
            PayloadKind::IdentityResponse => f.write_str("identity-response"),
            PayloadKind::IdentityRejected => f.write_str("identity-rejected"),
            PayloadKind::EndpointClosed => f.write_str("endpoint-closed"),
            PayloadKind::Ping => f.write_str("ping"),
            PayloadKind::Pong => f.write_str("pong"),
            PayloadKind::Failure => f.write_str("failure"),
            PayloadKind::Feature(code) => write!(f, "feature:{}", code),
        }
    }
}

// =============================================================================
// CORE BODIES
// =============================================================================

/// Sent by the dialing side to obtain (or confirm) its node identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRequest {
    pub kind: InstanceKind,
    pub uuid: String,
    /// Identifier the requester already holds; required by non-server
    /// responders, ignored by servers.
    pub presented: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityResponse {
    pub assigned: NodeId,
    pub responder: NodeId,
    pub responder_kind: InstanceKind,
    pub responder_uuid: String,
}

/// Generic failure reported to a peer. Carries no internal detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureCode {
    HandlerFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// No kind field on the wire. Ignored by dispatch.
    Empty,
    IdentityRequest(IdentityRequest),
    IdentityResponse(IdentityResponse),
    IdentityRejected(String),
    /// The named node is not reachable through the receiving server.
    EndpointClosed(NodeId),
    Ping(u64),
    Pong(u64),
    Failure(FailureCode),
    Feature { kind: u32, body: Bytes },
}

impl Payload {
    /// Opaque feature payload. `kind` must not collide with a core code.
    pub fn feature(kind: u32, body: impl Into<Bytes>) -> Self {
        debug_assert!(
            matches!(PayloadKind::from_code(kind), Some(PayloadKind::Feature(_))),
            "feature kind {} collides with a core kind",
            kind
        );
        Payload::Feature { kind, body: body.into() }
    }

    pub fn kind(&self) -> Option<PayloadKind> {
        match self {
            Payload::Empty => None,
            Payload::IdentityRequest(_) => Some(PayloadKind::IdentityRequest),
            Payload::IdentityResponse(_) => Some(PayloadKind::IdentityResponse),
            Payload::IdentityRejected(_) => Some(PayloadKind::IdentityRejected),
            Payload::EndpointClosed(_) => Some(PayloadKind::EndpointClosed),
            Payload::Ping(_) => Some(PayloadKind::Ping),
            Payload::Pong(_) => Some(PayloadKind::Pong),
            Payload::Failure(_) => Some(PayloadKind::Failure),
            Payload::Feature { kind, .. } => Some(PayloadKind::Feature(*kind)),
        }
    }

    fn encode_body(&self) -> Result<Bytes, NetError> {
        let body = match self {
            Payload::Empty => return Ok(Bytes::new()),
            Payload::Feature { body, .. } => return Ok(body.clone()),
            Payload::IdentityRequest(req) => postcard::to_allocvec(req)?,
            Payload::IdentityResponse(resp) => postcard::to_allocvec(resp)?,
            Payload::IdentityRejected(reason) => postcard::to_allocvec(reason)?,
            Payload::EndpointClosed(node) => postcard::to_allocvec(node)?,
            Payload::Ping(nonce) | Payload::Pong(nonce) => postcard::to_allocvec(nonce)?,
            Payload::Failure(code) => postcard::to_allocvec(code)?,
        };
        Ok(Bytes::from(body))
    }

    fn decode_body(kind: Option<PayloadKind>, body: &[u8]) -> Result<Self, NetError> {
        let kind = match kind {
            Some(kind) => kind,
            None => return Ok(Payload::Empty),
        };

        Ok(match kind {
            PayloadKind::IdentityRequest => Payload::IdentityRequest(postcard::from_bytes(body)?),
            PayloadKind::IdentityResponse => Payload::IdentityResponse(postcard::from_bytes(body)?),
            PayloadKind::IdentityRejected => Payload::IdentityRejected(postcard::from_bytes(body)?),
            PayloadKind::EndpointClosed => Payload::EndpointClosed(postcard::from_bytes(body)?),
            PayloadKind::Ping => Payload::Ping(postcard::from_bytes(body)?),
            PayloadKind::Pong => Payload::Pong(postcard::from_bytes(body)?),
            PayloadKind::Failure => Payload::Failure(postcard::from_bytes(body)?),
            PayloadKind::Feature(kind) => Payload::Feature {
                kind,
                body: Bytes::copy_from_slice(body),
            },
        })
    }
}

// =============================================================================
// ENVELOPE
// =============================================================================

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub to: Option<NodeId>,
    pub from: Option<NodeId>,
    /// Correlation id; 0 when no response is awaited.
    pub id: u32,
    pub payload: Payload,
}

impl Message {
    pub fn new(payload: Payload) -> Self {
        Self { to: None, from: None, id: 0, payload }
    }

    pub fn to(mut self, node: NodeId) -> Self {
        self.to = Some(node);
        self
    }

    pub fn from(mut self, node: NodeId) -> Self {
        self.from = Some(node);
        self
    }

    pub fn with_id(mut self, id: u32) -> Self {
        self.id = id;
        self
    }

    /// Build a reply correlated with this message and addressed to its sender.
    /// `local` is the replying node's identifier.
    pub fn reply(&self, local: Option<NodeId>, payload: Payload) -> Message {
        let mut reply = Message::new(payload).with_id(self.id);
        if let Some(sender) = self.from {
            if let Some(me) = local.or(self.to) {
                reply = reply.to(sender).from(me);
            }
        }
        reply
    }

    /// Notification that `node` could not be reached.
    pub fn endpoint_closed(node: NodeId) -> Self {
        Message::new(Payload::EndpointClosed(node))
    }

    pub fn kind(&self) -> Option<PayloadKind> {
        self.payload.kind()
    }

    pub fn encode(&self) -> Result<Bytes, NetError> {
        for node in [self.to, self.from].into_iter().flatten() {
            if node > MAX_NODE_ID {
                return Err(NetError::invalid(format!("node identifier {} out of range", node)));
            }
        }
        if self.to.is_some() && self.from.is_none() {
            return Err(NetError::invalid("to without from"));
        }

        let body = self.payload.encode_body()?;
        let mut out = BytesMut::with_capacity(32 + body.len());

        if let Some(to) = self.to {
            out.put_u8(TAG_TO);
            encode_varint(to as u64, &mut out);
        }
        if let Some(from) = self.from {
            out.put_u8(TAG_FROM);
            encode_varint(from as u64, &mut out);
        }
        if self.id != 0 {
            out.put_u8(TAG_ID);
            encode_varint(self.id as u64, &mut out);
        }
        if let Some(kind) = self.kind() {
            out.put_u8(TAG_KIND);
            encode_varint(kind.code() as u64, &mut out);
        }
        if !body.is_empty() {
            out.put_u8(TAG_BODY);
            out.reserve(varint_len(body.len() as u64) + body.len());
            encode_varint(body.len() as u64, &mut out);
            out.put_slice(&body);
        }

        Ok(out.freeze())
    }

    /// Fully decode a frame.
    pub fn decode(frame: &[u8]) -> Result<Message, NetError> {
        let mut cursor = FieldCursor { frame, pos: 0 };
        let mut to = None;
        let mut from = None;
        let mut id = 0u32;
        let mut kind = None;
        let mut body: &[u8] = &[];

        while !cursor.done() {
            let key = cursor.varint64()?;
            let field = key >> 3;
            let wire = (key & 0x7) as u8;

            match (field as u32, wire) {
                _ if field > u32::MAX as u64 || field == 0 => {
                    return Err(NetError::corrupted(format!("invalid field number {}", field)));
                }
                (FIELD_TO, WIRE_VARINT) => to = Some(cursor.node_id()?),
                (FIELD_FROM, WIRE_VARINT) => from = Some(cursor.node_id()?),
                (FIELD_ID, WIRE_VARINT) => id = cursor.varint64()? as u32,
                (FIELD_KIND, WIRE_VARINT) => {
                    let code = cursor.varint64()?;
                    let code = u32::try_from(code)
                        .map_err(|_| NetError::corrupted(format!("payload kind {} out of range", code)))?;
                    kind = PayloadKind::from_code(code);
                }
                (FIELD_BODY, WIRE_LEN) => body = cursor.length_delimited()?,
                (FIELD_TO..=FIELD_BODY, _) => {
                    return Err(NetError::corrupted(format!(
                        "field {} has wire type {}",
                        field, wire
                    )));
                }
                (_, WIRE_VARINT) => {
                    cursor.varint64()?;
                }
                (_, WIRE_FIXED64) => cursor.skip(8)?,
                (_, WIRE_LEN) => {
                    cursor.length_delimited()?;
                }
                (_, WIRE_FIXED32) => cursor.skip(4)?,
                (_, other) => {
                    return Err(NetError::corrupted(format!("unsupported wire type {}", other)));
                }
            }
        }

        if to.is_some() && from.is_none() {
            return Err(NetError::invalid("to without from"));
        }

        Ok(Message {
            to,
            from,
            id,
            payload: Payload::decode_body(kind, body)?,
        })
    }
}

struct FieldCursor<'a> {
    frame: &'a [u8],
    pos: usize,
}

impl<'a> FieldCursor<'a> {
    fn done(&self) -> bool {
        self.pos >= self.frame.len()
    }

    fn varint64(&mut self) -> Result<u64, NetError> {
        let (value, len) = decode_varint64(&self.frame[self.pos..])?
            .ok_or_else(|| NetError::corrupted("truncated varint"))?;
        self.pos += len;
        Ok(value)
    }

    fn node_id(&mut self) -> Result<NodeId, NetError> {
        let (value, len) = decode_varint32(&self.frame[self.pos..], "identifier")?
            .ok_or_else(|| NetError::corrupted("truncated identifier"))?;
        self.pos += len;
        Ok(value)
    }

    fn skip(&mut self, n: usize) -> Result<(), NetError> {
        if self.frame.len() - self.pos < n {
            return Err(NetError::corrupted("truncated fixed-width field"));
        }
        self.pos += n;
        Ok(())
    }

    fn length_delimited(&mut self) -> Result<&'a [u8], NetError> {
        let len = self.varint64()?;
        let remaining = (self.frame.len() - self.pos) as u64;
        if len > remaining {
            return Err(NetError::corrupted(format!(
                "length-delimited field of {} bytes with {} remaining",
                len, remaining
            )));
        }
        let start = self.pos;
        self.pos += len as usize;
        Ok(&self.frame[start..self.pos])
    }
}
