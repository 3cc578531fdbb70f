#![deny(unsafe_code)]

//! The tether endpoint runtime.
//!
//! An [`Endpoint`] is one bidirectional remoting channel: it moves typed
//! method calls between two processes over a reliable byte stream and keeps
//! the proxy/servant registry that gives those calls their identity.
//!
//! The pieces, bottom up:
//! - [`transport`]: the reader/writer contract the pumps run against, plus
//!   an in-memory pair for tests and in-process hosting.
//! - [`PendingCalls`]: the send-side multiplexer and response-waiter table.
//! - [`Registry`]: servant and proxy tables keyed by grain id.
//! - [`Endpoint`]: the connection state machine and its two pump tasks.
//! - [`HeartbeatMonitor`]: periodic peer liveness supervision.
//! - [`SubjectHost`]: the built-in servant that instantiates subjects for
//!   the peer.
//!
//! Byte-stream transports (TCP and the handshake bytes) live in
//! `tether-stream`; out-of-process hosting lives in `tether-silo`.

mod dispatch;
mod endpoint;
mod errors;
mod heartbeat;
mod pending;
mod proxy;
mod registry;
mod subject_host;
pub mod transport;

pub use dispatch::SubjectStub;
pub use endpoint::{
    Endpoint, EndpointConfig, EndpointState, FailureCallback, InvalidTransition, WeakEndpoint,
};
pub use errors::{
    CallError, DisconnectReason, Fault, FaultKind, InvokeFault, RegistryError,
};
pub use heartbeat::{
    DebuggerProbe, HeartbeatCallback, HeartbeatConfig, HeartbeatFault, HeartbeatMonitor,
    NoDebugger,
};
pub use pending::{BufferPool, OutboundSender, PendingCall, PendingCalls, Response, ResponseKind};
pub use proxy::ProxyHandle;
pub use registry::{Registry, ResolvedRef, Servant};
pub use subject_host::{
    SubjectFactory, SubjectHost, SubjectHostClient, SUBJECT_HOST_INTERFACE,
};
