#![deny(unsafe_code)]

//! Wire-level types for the tether remoting runtime.
//!
//! This crate defines everything two endpoints must agree on byte-for-byte:
//! - Grain and RPC identifiers ([`GrainId`], [`RpcId`])
//! - Message kind flags ([`MessageKind`])
//! - Frame layout ([`Frame`], [`CallHeader`])
//! - Payload primitives ([`PayloadWriter`], [`PayloadReader`])
//! - The handshake block ([`Handshake`])
//!
//! The session runtime lives in `tether-session`; byte-stream framing lives
//! in `tether-stream`. Nothing here performs I/O.

mod frame;
mod kind;
mod payload;
mod value;

pub use frame::{
    CallHeader, Frame, Handshake, HandshakeError, HANDSHAKE_MAGIC, MAX_NAME_LEN,
    MAX_WIRE_NAME_LEN, PROTOCOL_VERSION,
};
pub use kind::MessageKind;
pub use payload::{ByRefHint, Decimal, PayloadReader, PayloadWriter, WireError};
pub use value::{decode_value, encode_value, MaterializeHooks, WireValue};

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Identifies one remotely addressable object (a grain).
///
/// The top of the id space is reserved for runtime-internal grains; user
/// allocation starts just above [`GrainId::SUBJECT_HOST`] and counts up.
/// Ids are opaque to the peer but must match on both sides for a given
/// logical object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct GrainId(pub u64);

impl GrainId {
    /// The subject host, a built-in servant that instantiates further
    /// servants on request.
    pub const SUBJECT_HOST: Self = Self(u64::MAX);

    /// The liveness probe target.
    pub const HEARTBEAT: Self = Self(u64::MAX - 1);

    /// First id handed out to user registrations.
    pub const FIRST_USER: Self = Self(1);

    /// Create a grain id from its raw value.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw u64 value.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Whether this id is one of the runtime-reserved grains.
    pub const fn is_reserved(self) -> bool {
        self.0 >= Self::HEARTBEAT.0
    }
}

impl From<u64> for GrainId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for GrainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::SUBJECT_HOST => write!(f, "grain:subject-host"),
            Self::HEARTBEAT => write!(f, "grain:heartbeat"),
            Self(id) => write!(f, "grain:{id}"),
        }
    }
}

/// Allocates grain ids for user registrations.
///
/// Monotonic per endpoint, starting at [`GrainId::FIRST_USER`]. The reserved
/// band at the top of the space is unreachable in practice; exhausting u64
/// allocations is treated as a defect rather than an error path.
#[derive(Debug)]
pub struct GrainIdAllocator {
    next: AtomicU64,
}

impl GrainIdAllocator {
    /// Create an allocator starting at the first user id.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(GrainId::FIRST_USER.raw()),
        }
    }

    /// Hand out the next grain id.
    pub fn next(&self) -> GrainId {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        debug_assert!(id < GrainId::HEARTBEAT.raw(), "grain id space exhausted");
        GrainId(id)
    }
}

impl Default for GrainIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Identifies one outstanding RPC.
///
/// Strictly increasing per endpoint; a call and its response carry the same
/// id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct RpcId(pub i64);

impl RpcId {
    /// Id carried by frames that are not part of a call/response exchange
    /// (the Goodbye frame).
    pub const NONE: Self = Self(0);

    /// Create an rpc id from its raw value.
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the raw i64 value.
    pub const fn raw(self) -> i64 {
        self.0
    }
}

impl fmt::Display for RpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rpc:{}", self.0)
    }
}

/// Generates unique rpc ids for an endpoint.
///
/// Monotonically increasing counter starting at 1.
pub struct RpcIdGenerator {
    next: AtomicI64,
}

impl RpcIdGenerator {
    /// Create a new generator starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicI64::new(1),
        }
    }

    /// Generate the next unique rpc id.
    pub fn next(&self) -> RpcId {
        RpcId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for RpcIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
