#![deny(unsafe_code)]

//! Byte-stream transport for tether.
//!
//! Wraps any `AsyncRead + AsyncWrite` pair (TCP sockets, duplex pipes) in
//! 4-byte little-endian length-prefix framing, runs the raw handshake
//! exchange, and hands the split halves to a `tether-session` endpoint.

mod framing;
mod net;

pub use framing::{FrameRead, FrameWrite};
pub use net::{connect, establish, exchange_handshake, ConnectError, Listener};
