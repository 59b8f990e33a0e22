//! Frame codec: the envelope shared by all six frame kinds and their bodies.
//!
//! Wire layout of one frame:
//!
//! ```text
//! [4 bytes: big-endian u32 payload length]
//! [1 byte : frame kind]
//! [1 byte : flags]
//! [varint : stream_id]
//! [varint : frame_id]
//! [kind-specific body]
//! ```
//!
//! The length prefix is the only multi-byte integer that is not a varint.

use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};

use crate::action::Action;
use crate::error::{ProtocolError, Result};
use crate::message::Message;
use crate::varint;

bitflags! {
    /// Frame flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FrameFlags: u8 {
        /// Frame is one piece of a fragmented payload.
        const FRAGMENTED = 0x01;
        /// Sender aborts the fragmented payload in flight.
        const ABORT = 0x02;
    }
}

impl Default for FrameFlags {
    fn default() -> Self {
        Self::empty()
    }
}

impl FrameFlags {
    /// Parse a flags byte. Unknown bits are preserved but never checked.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Self {
        Self::from_bits_retain(byte)
    }

    /// Raw flags byte.
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        self.bits()
    }
}

/// The six frame kinds and their on-wire type bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// First frame on a connection, sent by the load balancer.
    HaproxyHello = 1,
    /// Load balancer closes the connection or replies to AGENT-DISCONNECT.
    HaproxyDisconnect = 2,
    /// Per-transaction messages for the agent to process.
    Notify = 3,
    /// Agent's reply finishing the HELLO handshake.
    AgentHello = 101,
    /// Agent closes the connection, with a status and a description.
    AgentDisconnect = 102,
    /// Agent acknowledges one NOTIFY, carrying the resulting actions.
    Ack = 103,
}

impl FrameKind {
    /// Raw frame type byte.
    #[must_use]
    pub const fn to_u8(self) -> u8 {
        self as u8
    }

    /// Parse a frame type byte. Returns `None` for unknown kinds.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::HaproxyHello),
            2 => Some(Self::HaproxyDisconnect),
            3 => Some(Self::Notify),
            101 => Some(Self::AgentHello),
            102 => Some(Self::AgentDisconnect),
            103 => Some(Self::Ack),
            _ => None,
        }
    }
}

/// Envelope fields shared by every frame.
///
/// `stream_id` and `frame_id` are zero for HELLO and DISCONNECT frames; for
/// NOTIFY they identify the transaction in flight, and the matching ACK must
/// echo them exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Metadata {
    /// Frame flags.
    pub flags: FrameFlags,
    /// Stream the frame belongs to.
    pub stream_id: u64,
    /// Frame counter within the stream.
    pub frame_id: u64,
}

/// Well-known disconnect status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DisconnectStatus {
    /// Normal shutdown.
    Ok = 0,
    /// Transient failure, the peer may reconnect.
    Retry = 1,
    /// Permanent condition, the peer should not retry.
    Stop = 2,
    /// Protocol violation.
    Abort = 3,
}

impl DisconnectStatus {
    /// Raw status code.
    #[must_use]
    pub const fn to_u32(self) -> u32 {
        self as u32
    }

    /// Parse a status code. Returns `None` for codes outside the known set.
    #[must_use]
    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            1 => Some(Self::Retry),
            2 => Some(Self::Stop),
            3 => Some(Self::Abort),
            _ => None,
        }
    }
}

/// HAPROXY-HELLO body.
///
/// Decoded from a key-value list; the recognised keys are
/// `supported-versions`, `max-frame-size`, `capabilities`, `healthcheck` and
/// `engine-id`. Values are encoded per key, without type tags, so an
/// unrecognised key makes the frame undecodable and is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HaproxyHello {
    /// SPOP versions the load balancer can speak, in preference order.
    pub supported_versions: Vec<String>,
    /// Largest frame payload the load balancer accepts.
    pub max_frame_size: u32,
    /// Capabilities the load balancer offers.
    pub capabilities: Vec<String>,
    /// Set when this HELLO belongs to a health check; the agent replies and
    /// the peer closes without entering the NOTIFY loop.
    pub healthcheck: bool,
    /// Identifier of the offload engine on the load balancer side.
    pub engine_id: Option<String>,
}

const KEY_SUPPORTED_VERSIONS: &str = "supported-versions";
const KEY_MAX_FRAME_SIZE: &str = "max-frame-size";
const KEY_CAPABILITIES: &str = "capabilities";
const KEY_HEALTHCHECK: &str = "healthcheck";
const KEY_ENGINE_ID: &str = "engine-id";
const KEY_VERSION: &str = "version";

impl HaproxyHello {
    fn encode(&self, dst: &mut impl BufMut) {
        varint::put_str(dst, KEY_SUPPORTED_VERSIONS);
        put_string_list(dst, &self.supported_versions);
        varint::put_str(dst, KEY_MAX_FRAME_SIZE);
        varint::put_u32(dst, self.max_frame_size);
        varint::put_str(dst, KEY_CAPABILITIES);
        put_string_list(dst, &self.capabilities);
        if self.healthcheck {
            varint::put_str(dst, KEY_HEALTHCHECK);
            dst.put_u8(1);
        }
        if let Some(engine_id) = &self.engine_id {
            varint::put_str(dst, KEY_ENGINE_ID);
            varint::put_str(dst, engine_id);
        }
    }

    fn decode(src: &mut impl Buf) -> Result<Self> {
        let mut hello = Self::default();
        while src.has_remaining() {
            let key = varint::get_str(src)?;
            match key.as_str() {
                KEY_SUPPORTED_VERSIONS => hello.supported_versions = get_string_list(src)?,
                KEY_MAX_FRAME_SIZE => hello.max_frame_size = varint::get_u32(src)?,
                KEY_CAPABILITIES => hello.capabilities = get_string_list(src)?,
                KEY_HEALTHCHECK => {
                    if !src.has_remaining() {
                        return Err(ProtocolError::UnexpectedEof {
                            context: "healthcheck value",
                            needed: 1,
                        });
                    }
                    hello.healthcheck = src.get_u8() != 0;
                }
                KEY_ENGINE_ID => hello.engine_id = Some(varint::get_str(src)?),
                _ => return Err(ProtocolError::UnknownHelloKey(key)),
            }
        }
        Ok(hello)
    }
}

/// AGENT-HELLO body, in the keyed form the load balancer expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentHello {
    /// The one SPOP version negotiated for this connection.
    pub version: String,
    /// Largest frame payload the agent accepts.
    pub max_frame_size: u32,
    /// Capabilities both sides will use.
    pub capabilities: Vec<String>,
}

impl AgentHello {
    fn encode(&self, dst: &mut impl BufMut) {
        varint::put_str(dst, KEY_VERSION);
        varint::put_str(dst, &self.version);
        varint::put_str(dst, KEY_MAX_FRAME_SIZE);
        varint::put_u32(dst, self.max_frame_size);
        varint::put_str(dst, KEY_CAPABILITIES);
        put_string_list(dst, &self.capabilities);
    }

    fn decode(src: &mut impl Buf) -> Result<Self> {
        let mut version = String::new();
        let mut max_frame_size = 0;
        let mut capabilities = Vec::new();
        while src.has_remaining() {
            let key = varint::get_str(src)?;
            match key.as_str() {
                KEY_VERSION => version = varint::get_str(src)?,
                KEY_MAX_FRAME_SIZE => max_frame_size = varint::get_u32(src)?,
                KEY_CAPABILITIES => capabilities = get_string_list(src)?,
                _ => return Err(ProtocolError::UnknownHelloKey(key)),
            }
        }
        Ok(Self {
            version,
            max_frame_size,
            capabilities,
        })
    }
}

/// DISCONNECT body, shared by both directions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    /// Status code; see [`DisconnectStatus`] for the known values.
    pub status: u32,
    /// Human-readable description.
    pub message: String,
}

impl Disconnect {
    /// Build a disconnect body from a well-known status.
    pub fn new(status: DisconnectStatus, message: impl Into<String>) -> Self {
        Self {
            status: status.to_u32(),
            message: message.into(),
        }
    }

    /// The well-known status, when the code is in the defined set.
    #[must_use]
    pub fn status_kind(&self) -> Option<DisconnectStatus> {
        DisconnectStatus::from_u32(self.status)
    }

    fn encode(&self, dst: &mut impl BufMut) {
        varint::put_u32(dst, self.status);
        varint::put_str(dst, &self.message);
    }

    fn decode(src: &mut impl Buf) -> Result<Self> {
        Ok(Self {
            status: varint::get_u32(src)?,
            message: varint::get_str(src)?,
        })
    }
}

/// NOTIFY body: the messages of one in-flight transaction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Notify {
    /// Messages in dispatch order.
    pub messages: Vec<Message>,
}

impl Notify {
    fn encode(&self, dst: &mut impl BufMut) {
        varint::put_u64(dst, self.messages.len() as u64);
        for message in &self.messages {
            message.encode(dst);
        }
    }

    fn decode(src: &mut impl Buf) -> Result<Self> {
        let count = varint::get_u64(src)?;
        let mut messages = Vec::new();
        for _ in 0..count {
            messages.push(Message::decode(src)?);
        }
        Ok(Self { messages })
    }
}

/// ACK body: the actions produced for one NOTIFY.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Ack {
    /// Actions in the order the handler produced them.
    pub actions: Vec<Action>,
}

impl Ack {
    fn encode(&self, dst: &mut impl BufMut) {
        varint::put_u64(dst, self.actions.len() as u64);
        for action in &self.actions {
            action.encode(dst);
        }
    }

    fn decode(src: &mut impl Buf) -> Result<Self> {
        let count = varint::get_u64(src)?;
        let mut actions = Vec::new();
        for _ in 0..count {
            actions.push(Action::decode(src)?);
        }
        Ok(Self { actions })
    }
}

/// Decoded frame body, one variant per kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameBody {
    /// See [`HaproxyHello`].
    HaproxyHello(HaproxyHello),
    /// See [`Disconnect`].
    HaproxyDisconnect(Disconnect),
    /// See [`Notify`].
    Notify(Notify),
    /// See [`AgentHello`].
    AgentHello(AgentHello),
    /// See [`Disconnect`].
    AgentDisconnect(Disconnect),
    /// See [`Ack`].
    Ack(Ack),
}

impl FrameBody {
    /// The frame kind this body belongs to.
    #[must_use]
    pub fn kind(&self) -> FrameKind {
        match self {
            FrameBody::HaproxyHello(_) => FrameKind::HaproxyHello,
            FrameBody::HaproxyDisconnect(_) => FrameKind::HaproxyDisconnect,
            FrameBody::Notify(_) => FrameKind::Notify,
            FrameBody::AgentHello(_) => FrameKind::AgentHello,
            FrameBody::AgentDisconnect(_) => FrameKind::AgentDisconnect,
            FrameBody::Ack(_) => FrameKind::Ack,
        }
    }
}

/// One logical frame: envelope metadata plus a decoded body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Envelope fields.
    pub metadata: Metadata,
    /// Kind-specific body.
    pub body: FrameBody,
}

impl Frame {
    /// Assemble a frame from its parts.
    #[must_use]
    pub fn new(metadata: Metadata, body: FrameBody) -> Self {
        Self { metadata, body }
    }

    /// AGENT-HELLO reply; stream and frame ids are zero for the handshake.
    #[must_use]
    pub fn agent_hello(hello: AgentHello) -> Self {
        Self::new(Metadata::default(), FrameBody::AgentHello(hello))
    }

    /// ACK for the NOTIFY identified by `stream_id`/`frame_id`.
    #[must_use]
    pub fn ack(stream_id: u64, frame_id: u64, actions: Vec<Action>) -> Self {
        Self::new(
            Metadata {
                flags: FrameFlags::empty(),
                stream_id,
                frame_id,
            },
            FrameBody::Ack(Ack { actions }),
        )
    }

    /// AGENT-DISCONNECT with a well-known status.
    #[must_use]
    pub fn agent_disconnect(status: DisconnectStatus, message: impl Into<String>) -> Self {
        Self::new(
            Metadata::default(),
            FrameBody::AgentDisconnect(Disconnect::new(status, message)),
        )
    }

    /// Serialize the frame payload (everything after the length prefix).
    pub fn encode_payload(&self, dst: &mut impl BufMut) {
        dst.put_u8(self.body.kind().to_u8());
        dst.put_u8(self.metadata.flags.to_byte());
        varint::put_u64(dst, self.metadata.stream_id);
        varint::put_u64(dst, self.metadata.frame_id);
        match &self.body {
            FrameBody::HaproxyHello(body) => body.encode(dst),
            FrameBody::HaproxyDisconnect(body) | FrameBody::AgentDisconnect(body) => {
                body.encode(dst)
            }
            FrameBody::Notify(body) => body.encode(dst),
            FrameBody::AgentHello(body) => body.encode(dst),
            FrameBody::Ack(body) => body.encode(dst),
        }
    }

    /// Serialize the full envelope, length prefix included.
    pub fn encode(&self, dst: &mut BytesMut) {
        let mut payload = BytesMut::new();
        self.encode_payload(&mut payload);
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
    }

    /// Parse a frame payload (everything after the length prefix).
    ///
    /// # Errors
    ///
    /// Fails on an unknown frame kind, any body decode error, or bytes left
    /// over after the body.
    pub fn decode_payload(bytes: &[u8]) -> Result<Self> {
        let mut src = bytes;
        if src.remaining() < 2 {
            return Err(ProtocolError::UnexpectedEof {
                context: "frame header",
                needed: 2 - src.remaining(),
            });
        }
        let kind_byte = src.get_u8();
        let kind =
            FrameKind::from_u8(kind_byte).ok_or(ProtocolError::UnknownFrameKind(kind_byte))?;
        let flags = FrameFlags::from_byte(src.get_u8());
        let stream_id = varint::get_u64(&mut src)?;
        let frame_id = varint::get_u64(&mut src)?;

        let body = match kind {
            FrameKind::HaproxyHello => FrameBody::HaproxyHello(HaproxyHello::decode(&mut src)?),
            FrameKind::HaproxyDisconnect => {
                FrameBody::HaproxyDisconnect(Disconnect::decode(&mut src)?)
            }
            FrameKind::Notify => FrameBody::Notify(Notify::decode(&mut src)?),
            FrameKind::AgentHello => FrameBody::AgentHello(AgentHello::decode(&mut src)?),
            FrameKind::AgentDisconnect => {
                FrameBody::AgentDisconnect(Disconnect::decode(&mut src)?)
            }
            FrameKind::Ack => FrameBody::Ack(Ack::decode(&mut src)?),
        };

        if src.has_remaining() {
            return Err(ProtocolError::TrailingBytes(src.remaining()));
        }

        Ok(Self {
            metadata: Metadata {
                flags,
                stream_id,
                frame_id,
            },
            body,
        })
    }

    /// Parse a full envelope. The slice must contain exactly one frame.
    ///
    /// # Errors
    ///
    /// Fails when the length prefix disagrees with the slice length, and on
    /// every [`Frame::decode_payload`] error.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(ProtocolError::UnexpectedEof {
                context: "frame length prefix",
                needed: 4 - bytes.len(),
            });
        }
        let declared = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let payload = &bytes[4..];
        if payload.len() < declared {
            return Err(ProtocolError::UnexpectedEof {
                context: "frame payload",
                needed: declared - payload.len(),
            });
        }
        if payload.len() > declared {
            return Err(ProtocolError::TrailingBytes(payload.len() - declared));
        }
        Self::decode_payload(payload)
    }
}

fn put_string_list(dst: &mut impl BufMut, items: &[String]) {
    varint::put_u64(dst, items.len() as u64);
    for item in items {
        varint::put_str(dst, item);
    }
}

fn get_string_list(src: &mut impl Buf) -> Result<Vec<String>> {
    let count = varint::get_u64(src)?;
    let mut items = Vec::new();
    for _ in 0..count {
        items.push(varint::get_str(src)?);
    }
    Ok(items)
}
