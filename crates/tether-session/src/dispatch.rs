//! The stub contract.
//!
//! Runtime code generation is out of scope for this runtime; instead, any
//! stub (hand-written or generated ahead of time) satisfies
//! [`SubjectStub`] and the dispatch path treats them all alike. A stub owns
//! its subject, decodes arguments off the payload reader, invokes the
//! subject, and encodes the result.

use std::any::Any;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use tether_wire::PayloadReader;

use crate::errors::InvokeFault;

/// Servant-side stub wrapping one subject.
///
/// `invoke` runs on the dispatch pool; a slow subject blocks its own call,
/// never the read pump. The runtime does not serialize calls per subject,
/// so concurrent dispatch to the same subject is the subject's problem to
/// make safe.
pub trait SubjectStub: Send + Sync + 'static {
    /// Declared interface this stub implements.
    fn interface_name(&self) -> &str;

    /// The wrapped subject, for local pass-through access.
    fn subject(&self) -> Arc<dyn Any + Send + Sync>;

    /// Decode arguments, invoke the subject, encode the result.
    ///
    /// The returned payload is the encoded return value; a failure becomes
    /// a fault descriptor on the wire.
    fn invoke<'a>(
        &'a self,
        method: &'a str,
        args: PayloadReader<'a>,
    ) -> BoxFuture<'a, Result<Vec<u8>, InvokeFault>>;
}
