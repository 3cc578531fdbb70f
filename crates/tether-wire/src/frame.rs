//! Frame layout and the handshake block.
//!
//! A frame on the wire is a u32 little-endian length prefix (counting every
//! byte after itself) followed by the body encoded here. Call frames carry a
//! [`CallHeader`] between the kind byte and the payload; every other kind
//! goes straight from kind byte to payload.
//!
//! The handshake block is exchanged raw, before any framing, when the byte
//! stream opens.

use std::fmt;

use crate::kind::MessageKind;
use crate::payload::{PayloadReader, PayloadWriter, WireError};
use crate::{GrainId, RpcId};

/// Byte-length cap for interface and method names on the wire.
pub const MAX_WIRE_NAME_LEN: usize = 1024;

/// Magic bytes opening the handshake block.
pub const HANDSHAKE_MAGIC: [u8; 16] = *b"SharpRemote\0\0\0\0\0";

/// Protocol version sent in the handshake block.
pub const PROTOCOL_VERSION: u16 = 1;

/// Byte-length cap for the endpoint name in the handshake block.
pub const MAX_NAME_LEN: usize = 128;

/// Routing fields present on call frames only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallHeader {
    /// Grain the call targets.
    pub servant_id: GrainId,
    /// Declared interface of the target.
    pub interface: String,
    /// Method within the interface.
    pub method: String,
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Call/response correlation id. [`RpcId::NONE`] on Goodbye frames.
    pub rpc_id: RpcId,
    /// What the frame is.
    pub kind: MessageKind,
    /// Routing header; present exactly when `kind` contains CALL.
    pub call: Option<CallHeader>,
    /// Opaque payload; its format is the serializer's business.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a call frame.
    pub fn call(
        rpc_id: RpcId,
        servant_id: GrainId,
        interface: impl Into<String>,
        method: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            rpc_id,
            kind: MessageKind::CALL,
            call: Some(CallHeader {
                servant_id,
                interface: interface.into(),
                method: method.into(),
            }),
            payload,
        }
    }

    /// Build a plain return frame.
    pub fn ret(rpc_id: RpcId, payload: Vec<u8>) -> Self {
        Self {
            rpc_id,
            kind: MessageKind::RETURN,
            call: None,
            payload,
        }
    }

    /// Build an exceptional return frame.
    pub fn exception(rpc_id: RpcId, payload: Vec<u8>) -> Self {
        Self {
            rpc_id,
            kind: MessageKind::RETURN | MessageKind::EXCEPTION,
            call: None,
            payload,
        }
    }

    /// Build a heartbeat probe or probe reply.
    pub fn heartbeat(rpc_id: RpcId) -> Self {
        Self {
            rpc_id,
            kind: MessageKind::HEARTBEAT,
            call: None,
            payload: Vec::new(),
        }
    }

    /// Build a goodbye frame with an optional reason.
    pub fn goodbye(reason: Option<&str>) -> Self {
        let mut w = PayloadWriter::new();
        // Reasons are caller-supplied and short; a reason that somehow
        // exceeds the u16 prefix is dropped rather than failing shutdown.
        if w.write_nullable_str(reason).is_err() {
            w = PayloadWriter::new();
            let _ = w.write_nullable_str(None);
        }
        Self {
            rpc_id: RpcId::NONE,
            kind: MessageKind::GOODBYE,
            call: None,
            payload: w.into_bytes(),
        }
    }

    /// Read the reason out of a goodbye frame's payload.
    pub fn goodbye_reason(&self) -> Option<String> {
        let mut r = PayloadReader::new(&self.payload);
        r.read_nullable_str().ok().flatten().map(str::to_owned)
    }

    /// Whether this is a response to a pending call.
    pub fn is_response(&self) -> bool {
        self.kind.is_response()
    }

    /// Whether the response payload is a fault.
    pub fn is_exception(&self) -> bool {
        self.kind.contains(MessageKind::EXCEPTION)
    }

    /// Encode the frame body (everything after the length prefix) into a
    /// recycled buffer.
    pub fn encode_into(&self, buf: Vec<u8>) -> Result<Vec<u8>, WireError> {
        let mut w = PayloadWriter::with_buffer(buf);
        w.write_i64(self.rpc_id.raw());
        w.write_u8(self.kind.bits());
        if self.kind.has_call_header() {
            let header = self.call.as_ref().ok_or(WireError::Truncated)?;
            if header.interface.len() > MAX_WIRE_NAME_LEN {
                return Err(WireError::StringTooLong {
                    len: header.interface.len(),
                    max: MAX_WIRE_NAME_LEN,
                });
            }
            if header.method.len() > MAX_WIRE_NAME_LEN {
                return Err(WireError::StringTooLong {
                    len: header.method.len(),
                    max: MAX_WIRE_NAME_LEN,
                });
            }
            w.write_u64(header.servant_id.raw());
            w.write_str(&header.interface)?;
            w.write_str(&header.method)?;
        }
        w.write_raw(&self.payload);
        Ok(w.into_bytes())
    }

    /// Encode the frame body into a fresh buffer.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        self.encode_into(Vec::new())
    }

    /// Decode a frame body (everything after the length prefix).
    pub fn decode(body: &[u8]) -> Result<Self, WireError> {
        let mut r = PayloadReader::new(body);
        let rpc_id = RpcId::new(r.read_i64()?);
        let kind_byte = r.read_u8()?;
        let kind =
            MessageKind::from_bits(kind_byte).ok_or(WireError::InvalidKind(kind_byte))?;
        if !kind.is_valid_wire_kind() {
            return Err(WireError::InvalidKind(kind_byte));
        }
        let call = if kind.has_call_header() {
            let servant_id = GrainId::new(r.read_u64()?);
            let interface = r.read_str_capped(MAX_WIRE_NAME_LEN)?.to_owned();
            let method = r.read_str_capped(MAX_WIRE_NAME_LEN)?.to_owned();
            Some(CallHeader {
                servant_id,
                interface,
                method,
            })
        } else {
            None
        };
        Ok(Self {
            rpc_id,
            kind,
            call,
            payload: r.rest().to_vec(),
        })
    }
}

/// Why a handshake block was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// The 16 magic bytes did not match.
    BadMagic,
    /// The peer speaks a different protocol version.
    UnsupportedVersion(u16),
    /// The block was structurally broken (bad length, bad UTF-8).
    Malformed(WireError),
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::BadMagic => write!(f, "handshake magic mismatch"),
            HandshakeError::UnsupportedVersion(v) => {
                write!(f, "unsupported protocol version {v} (expected {PROTOCOL_VERSION})")
            }
            HandshakeError::Malformed(e) => write!(f, "malformed handshake block: {e}"),
        }
    }
}

impl std::error::Error for HandshakeError {}

/// The block each side sends as soon as the byte stream opens.
///
/// Layout: 16 magic bytes, `version: u16 LE`, u16-length-prefixed UTF-8
/// endpoint name of at most [`MAX_NAME_LEN`] bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Self-reported endpoint name, surfaced to the peer for diagnostics.
    pub name: String,
}

impl Handshake {
    /// Fixed-size prefix: magic, version and the name length.
    pub const PREFIX_LEN: usize = 16 + 2 + 2;

    /// Create a handshake block, truncating the name to [`MAX_NAME_LEN`]
    /// bytes on a character boundary.
    pub fn new(name: impl Into<String>) -> Self {
        let mut name: String = name.into();
        if name.len() > MAX_NAME_LEN {
            let mut cut = MAX_NAME_LEN;
            while !name.is_char_boundary(cut) {
                cut -= 1;
            }
            name.truncate(cut);
        }
        Self { name }
    }

    /// Encode the full block.
    pub fn encode(&self) -> Vec<u8> {
        // Constructors cap the name, but the field is public; re-cap here
        // so a hand-built block cannot emit something the peer rejects.
        let mut cut = self.name.len().min(MAX_NAME_LEN);
        while !self.name.is_char_boundary(cut) {
            cut -= 1;
        }
        let mut w = PayloadWriter::new();
        w.write_raw(&HANDSHAKE_MAGIC);
        w.write_u16(PROTOCOL_VERSION);
        w.write_str(&self.name[..cut])
            .expect("name capped to MAX_NAME_LEN");
        w.into_bytes()
    }

    /// Validate the fixed prefix and return the peer name length that
    /// follows it.
    pub fn parse_prefix(prefix: &[u8; Self::PREFIX_LEN]) -> Result<usize, HandshakeError> {
        if prefix[..16] != HANDSHAKE_MAGIC {
            return Err(HandshakeError::BadMagic);
        }
        let version = u16::from_le_bytes([prefix[16], prefix[17]]);
        if version != PROTOCOL_VERSION {
            return Err(HandshakeError::UnsupportedVersion(version));
        }
        let name_len = u16::from_le_bytes([prefix[18], prefix[19]]) as usize;
        if name_len > MAX_NAME_LEN {
            return Err(HandshakeError::Malformed(WireError::StringTooLong {
                len: name_len,
                max: MAX_NAME_LEN,
            }));
        }
        Ok(name_len)
    }

    /// Build the handshake from the name bytes following the prefix.
    pub fn from_name_bytes(name: &[u8]) -> Result<Self, HandshakeError> {
        let name = std::str::from_utf8(name)
            .map_err(|_| HandshakeError::Malformed(WireError::InvalidUtf8))?;
        Ok(Self {
            name: name.to_owned(),
        })
    }
}
