//! Remote-facing grain handles.
//!
//! A proxy forwards method calls to the peer as RPCs. It holds only a weak
//! back-reference to its endpoint: a proxy that outlives the endpoint (or
//! is used before the endpoint connects) fails with `NotConnected` instead
//! of dereferencing stale state.
//!
//! A grain that turns out to be local (a servant on this endpoint) is
//! handed out as a pass-through handle that invokes the subject directly,
//! skipping the wire entirely.

use std::sync::{Arc, Weak};

use tether_wire::{decode_value, encode_value, GrainId, PayloadReader, WireValue};

use crate::endpoint::{EndpointInner, EndpointState};
use crate::errors::{CallError, Fault};
use crate::pending::{Response, ResponseKind};
use crate::registry::Servant;

enum ProxyTarget {
    /// Grain lives on the peer; calls become frames.
    Remote(Weak<EndpointInner>),
    /// Grain lives here; calls go straight to the subject.
    Local(Arc<Servant>),
}

/// Handle for calling methods on a grain.
pub struct ProxyHandle {
    grain_id: GrainId,
    interface: Box<str>,
    target: ProxyTarget,
}

impl ProxyHandle {
    pub(crate) fn remote(grain_id: GrainId, interface: &str, endpoint: Weak<EndpointInner>) -> Self {
        Self {
            grain_id,
            interface: interface.into(),
            target: ProxyTarget::Remote(endpoint),
        }
    }

    pub(crate) fn local(servant: Arc<Servant>) -> Self {
        Self {
            grain_id: servant.grain_id(),
            interface: servant.interface_name().into(),
            target: ProxyTarget::Local(servant),
        }
    }

    /// The grain this proxy stands for.
    pub fn grain_id(&self) -> GrainId {
        self.grain_id
    }

    /// Declared interface of the grain.
    pub fn interface_name(&self) -> &str {
        &self.interface
    }

    /// Whether this handle bypasses the wire.
    pub fn is_local(&self) -> bool {
        matches!(self.target, ProxyTarget::Local(_))
    }

    /// Invoke a method with pre-encoded arguments, returning the raw
    /// response payload.
    pub async fn invoke_raw(&self, method: &str, args: &[u8]) -> Result<Vec<u8>, CallError> {
        match &self.target {
            ProxyTarget::Local(servant) => {
                let result = servant
                    .stub()
                    .invoke(method, PayloadReader::new(args))
                    .await;
                result.map_err(|fault| {
                    CallError::from_fault(fault.into_fault(&self.interface, method))
                })
            }
            ProxyTarget::Remote(endpoint) => {
                let endpoint = endpoint.upgrade().ok_or(CallError::NotConnected)?;
                if endpoint.state() != EndpointState::Connected {
                    return Err(CallError::NotConnected);
                }
                let pending = endpoint
                    .pending()
                    .enqueue_call(self.grain_id, &self.interface, method, args)
                    .await?;
                let Response { kind, payload } = pending.wait().await?;
                match kind {
                    ResponseKind::Return => Ok(payload),
                    ResponseKind::Fault => {
                        let fault: Fault = decode_value(&payload)?;
                        Err(CallError::from_fault(fault))
                    }
                    ResponseKind::ConnectionLost(reason) => {
                        Err(CallError::ConnectionLost(reason))
                    }
                }
            }
        }
    }

    /// Invoke a method with typed arguments and result.
    pub async fn call<A, R>(&self, method: &str, args: &A) -> Result<R, CallError>
    where
        A: WireValue,
        R: WireValue,
    {
        let payload = self.invoke_raw(method, &encode_value(args)).await?;
        Ok(decode_value(&payload)?)
    }
}

impl std::fmt::Debug for ProxyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyHandle")
            .field("grain_id", &self.grain_id)
            .field("interface", &self.interface)
            .field("local", &self.is_local())
            .finish()
    }
}
