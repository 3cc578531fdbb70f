//! Error taxonomy of the endpoint runtime.
//!
//! Three families live here:
//! - [`DisconnectReason`]: why a connection ended, attached to every
//!   cancelled call and surfaced through the failure callback.
//! - [`Fault`]: the marshallable descriptor a failed servant invocation
//!   travels as. The runtime never swallows a servant error; what cannot be
//!   encoded is substituted by a descriptor that still names the original.
//! - [`CallError`]: everything a caller awaiting an RPC can observe.

use std::fmt;

use tether_wire::{GrainId, PayloadReader, PayloadWriter, WireError, WireValue};

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// I/O error reading a frame.
    ReadFailure,
    /// A structurally invalid frame arrived (bad length, unknown kind,
    /// payload shorter than declared).
    RpcInvalidResponse,
    /// Clean shutdown initiated by this endpoint.
    RequestedByEndPoint,
    /// Clean shutdown initiated by the peer.
    RequestedByRemoteEndPoint,
    /// A failure escaped the runtime itself; the catch-all class.
    UnhandledException,
}

impl DisconnectReason {
    /// Whether this reason represents a clean, requested shutdown.
    pub fn is_requested(self) -> bool {
        matches!(
            self,
            DisconnectReason::RequestedByEndPoint | DisconnectReason::RequestedByRemoteEndPoint
        )
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DisconnectReason::ReadFailure => "read failure",
            DisconnectReason::RpcInvalidResponse => "invalid frame from peer",
            DisconnectReason::RequestedByEndPoint => "requested by this endpoint",
            DisconnectReason::RequestedByRemoteEndPoint => "requested by remote endpoint",
            DisconnectReason::UnhandledException => "unhandled exception",
        };
        f.write_str(s)
    }
}

/// Discriminates what a [`Fault`] descriptor stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FaultKind {
    /// The servant failed and its error marshalled cleanly; the caller can
    /// reconstruct it.
    Remote = 0,
    /// The servant failed but its error could not be marshalled; the
    /// descriptor substitutes for it, carrying the original names.
    Unserializable = 1,
    /// The call targeted a grain id with no live servant.
    NoSuchServant = 2,
    /// The servant exists but does not implement the named method.
    NoSuchMethod = 3,
}

impl FaultKind {
    fn from_byte(b: u8) -> Result<Self, WireError> {
        match b {
            0 => Ok(FaultKind::Remote),
            1 => Ok(FaultKind::Unserializable),
            2 => Ok(FaultKind::NoSuchServant),
            3 => Ok(FaultKind::NoSuchMethod),
            other => Err(WireError::InvalidDiscriminant(other)),
        }
    }
}

/// Marshallable descriptor of a failed invocation.
///
/// Carried as the payload of a `RETURN | EXCEPTION` frame. The optional
/// members keep whatever the origin could provide: stack, source, the
/// failing member name and an HResult-style status code.
#[derive(Debug, Clone, PartialEq)]
pub struct Fault {
    /// What the descriptor stands for.
    pub kind: FaultKind,
    /// Human-readable message from the origin.
    pub message: String,
    /// Fully-qualified name of the original error type.
    pub type_name: String,
    /// Stack trace at the origin, if captured.
    pub stack: Option<String>,
    /// Component the error originated in.
    pub source: Option<String>,
    /// Name of the member that failed.
    pub target_site: Option<String>,
    /// Numeric status code from the origin.
    pub hresult: i32,
}

impl Fault {
    /// Descriptor for a marshallable servant error.
    pub fn remote(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::Remote,
            message: message.into(),
            type_name: type_name.into(),
            stack: None,
            source: None,
            target_site: None,
            hresult: 0,
        }
    }

    /// Substitute descriptor for an error the serializer could not marshal.
    ///
    /// Keeps the original type name and message so the caller still sees
    /// something actionable.
    pub fn unserializable(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::Unserializable,
            ..Self::remote(type_name, message)
        }
    }

    /// Descriptor for a call that targeted a grain with no live servant.
    pub fn no_such_servant(id: GrainId) -> Self {
        Self {
            kind: FaultKind::NoSuchServant,
            ..Self::remote("tether::NoSuchServant", format!("no servant registered for {id}"))
        }
    }

    /// Descriptor for a method the servant does not implement.
    pub fn no_such_method(interface: &str, method: &str) -> Self {
        Self {
            kind: FaultKind::NoSuchMethod,
            ..Self::remote(
                "tether::NoSuchMethod",
                format!("{interface} has no method named {method:?}"),
            )
        }
    }

    /// Attach a stack trace.
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Attach the originating component.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Attach the failing member name.
    pub fn with_target_site(mut self, site: impl Into<String>) -> Self {
        self.target_site = Some(site.into());
        self
    }

    /// Attach a status code.
    pub fn with_hresult(mut self, hresult: i32) -> Self {
        self.hresult = hresult;
        self
    }
}

impl WireValue for Fault {
    fn emit(&self, w: &mut PayloadWriter) {
        w.write_u8(self.kind as u8);
        self.message.emit(w);
        self.type_name.emit(w);
        let _ = w.write_nullable_str(self.stack.as_deref());
        let _ = w.write_nullable_str(self.source.as_deref());
        let _ = w.write_nullable_str(self.target_site.as_deref());
        w.write_i32(self.hresult);
    }

    fn parse(r: &mut PayloadReader<'_>) -> Result<Self, WireError> {
        let kind = FaultKind::from_byte(r.read_u8()?)?;
        let message = String::parse(r)?;
        let type_name = String::parse(r)?;
        let stack = r.read_nullable_str()?.map(str::to_owned);
        let source = r.read_nullable_str()?.map(str::to_owned);
        let target_site = r.read_nullable_str()?.map(str::to_owned);
        let hresult = r.read_i32()?;
        Ok(Self {
            kind,
            message,
            type_name,
            stack,
            source,
            target_site,
            hresult,
        })
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

impl std::error::Error for Fault {}

/// What a servant invocation can fail with.
///
/// This is the error half of the stub contract: a stub either produces a
/// return payload or one of these.
#[derive(Debug)]
pub enum InvokeFault {
    /// The stub does not implement the named method.
    NoSuchMethod,
    /// Argument decoding failed.
    BadArguments(WireError),
    /// The subject failed with a marshallable descriptor.
    Fault(Fault),
    /// The subject failed with something the serializer cannot carry; the
    /// runtime substitutes a descriptor built from these names.
    Unserializable {
        /// Fully-qualified name of the original error type.
        type_name: String,
        /// Original error message.
        message: String,
    },
}

impl InvokeFault {
    /// Convert into the descriptor that goes on the wire.
    pub fn into_fault(self, interface: &str, method: &str) -> Fault {
        match self {
            InvokeFault::NoSuchMethod => Fault::no_such_method(interface, method),
            InvokeFault::BadArguments(e) => Fault::remote(
                "tether::BadArguments",
                format!("malformed arguments for {interface}.{method}: {e}"),
            ),
            InvokeFault::Fault(fault) => fault,
            InvokeFault::Unserializable { type_name, message } => {
                Fault::unserializable(type_name, message)
            }
        }
    }
}

impl From<Fault> for InvokeFault {
    fn from(fault: Fault) -> Self {
        InvokeFault::Fault(fault)
    }
}

/// Everything a caller awaiting an RPC can observe.
#[derive(Debug)]
pub enum CallError {
    /// The proxy was invoked while the endpoint was not connected.
    NotConnected,
    /// The call was pending when the connection failed.
    ConnectionLost(DisconnectReason),
    /// A caller-imposed deadline elapsed before the response arrived.
    TimedOut,
    /// The peer has no servant for the targeted grain.
    NoSuchServant(Fault),
    /// The servant failed; the descriptor marshalled cleanly.
    Remote(Fault),
    /// The servant failed with something unmarshallable; this is the
    /// substitute descriptor (original type name and message preserved).
    Unserializable(Fault),
    /// Encoding the request or decoding the response failed locally.
    Wire(WireError),
}

impl CallError {
    /// Sort a decoded fault descriptor into the caller-facing family.
    pub fn from_fault(fault: Fault) -> Self {
        match fault.kind {
            FaultKind::Unserializable => CallError::Unserializable(fault),
            FaultKind::NoSuchServant => CallError::NoSuchServant(fault),
            FaultKind::Remote | FaultKind::NoSuchMethod => CallError::Remote(fault),
        }
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::NotConnected => write!(f, "endpoint is not connected"),
            CallError::ConnectionLost(reason) => {
                write!(f, "connection lost while call was pending: {reason}")
            }
            CallError::TimedOut => write!(f, "call timed out"),
            CallError::NoSuchServant(fault) => write!(f, "{}", fault.message),
            CallError::Remote(fault) => write!(f, "remote fault: {fault}"),
            CallError::Unserializable(fault) => {
                write!(f, "remote fault (unserializable original): {fault}")
            }
            CallError::Wire(e) => write!(f, "wire error: {e}"),
        }
    }
}

impl std::error::Error for CallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CallError::Wire(e) => Some(e),
            _ => None,
        }
    }
}

impl From<WireError> for CallError {
    fn from(e: WireError) -> Self {
        CallError::Wire(e)
    }
}

/// Errors from registry operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The grain id is already taken by a servant or a proxy.
    DuplicateId(GrainId),
    /// No servant is registered under the grain id.
    NoSuchServant(GrainId),
    /// No subject is registered under the grain id (by-reference decode).
    NoSuchSubject(GrainId),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::DuplicateId(id) => write!(f, "{id} is already registered"),
            RegistryError::NoSuchServant(id) => write!(f, "no servant registered for {id}"),
            RegistryError::NoSuchSubject(id) => write!(f, "no subject registered for {id}"),
        }
    }
}

impl std::error::Error for RegistryError {}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_wire::{decode_value, encode_value};

    #[test]
    fn fault_roundtrips_with_optional_members() {
        let fault = Fault::remote("acme::DivideByZero", "denominator was zero")
            .with_stack("at acme::div\nat main")
            .with_target_site("div")
            .with_hresult(-2147);
        let back: Fault = decode_value(&encode_value(&fault)).unwrap();
        assert_eq!(back, fault);
    }

    #[test]
    fn unserializable_keeps_original_names() {
        let fault = Fault::unserializable("acme::OpaqueError", "cannot cross");
        let back: Fault = decode_value(&encode_value(&fault)).unwrap();
        assert_eq!(back.kind, FaultKind::Unserializable);
        assert_eq!(back.type_name, "acme::OpaqueError");
        assert_eq!(back.message, "cannot cross");
        assert!(matches!(
            CallError::from_fault(back),
            CallError::Unserializable(_)
        ));
    }

    #[test]
    fn fault_kind_sorting() {
        assert!(matches!(
            CallError::from_fault(Fault::no_such_servant(GrainId::new(9))),
            CallError::NoSuchServant(_)
        ));
        assert!(matches!(
            CallError::from_fault(Fault::no_such_method("ICalc", "Sub")),
            CallError::Remote(_)
        ));
    }

    #[test]
    fn requested_reasons_are_clean() {
        assert!(DisconnectReason::RequestedByEndPoint.is_requested());
        assert!(DisconnectReason::RequestedByRemoteEndPoint.is_requested());
        assert!(!DisconnectReason::ReadFailure.is_requested());
        assert!(!DisconnectReason::UnhandledException.is_requested());
    }
}
