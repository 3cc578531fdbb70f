//! The subject host: a built-in servant that instantiates further servants
//! on request from the peer.
//!
//! Registered at the reserved grain id [`GrainId::SUBJECT_HOST`]. Because
//! there is no instantiate-by-type-name reflection to lean on, the host
//! application registers a factory per creatable type; the peer addresses
//! them by name.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use futures_util::future::BoxFuture;
use tracing::{debug, warn};

use tether_wire::{encode_value, GrainId, PayloadReader, WireValue};

use crate::dispatch::SubjectStub;
use crate::endpoint::Endpoint;
use crate::errors::{CallError, Fault, InvokeFault, RegistryError};
use crate::proxy::ProxyHandle;
use crate::registry::Registry;

/// Interface name the subject host is addressed under.
pub const SUBJECT_HOST_INTERFACE: &str = "tether.ISubjectHost";

const METHOD_CREATE_SUBJECT: &str = "CreateSubject";
const METHOD_REMOVE_SUBJECT: &str = "RemoveSubject";

/// Builds a fresh stub for one creatable subject type.
pub type SubjectFactory = Arc<dyn Fn() -> Arc<dyn SubjectStub> + Send + Sync>;

/// The servant behind the reserved subject-host grain.
pub struct SubjectHost {
    factories: HashMap<String, SubjectFactory>,
    registry: Weak<Registry>,
    // Stand-in subject; the host has no user-level state to expose.
    marker: Arc<()>,
}

impl SubjectHost {
    /// Register the subject host on an endpoint with the given factory
    /// table.
    ///
    /// Fails with `DuplicateId` if the reserved grain is already taken.
    pub fn install(
        endpoint: &Endpoint,
        factories: HashMap<String, SubjectFactory>,
    ) -> Result<(), RegistryError> {
        let registry = endpoint.registry();
        let host = Arc::new(Self {
            factories,
            registry: Arc::downgrade(registry),
            marker: Arc::new(()),
        });
        registry.create_servant(GrainId::SUBJECT_HOST, host)?;
        Ok(())
    }

    fn create_subject(&self, type_name: &str) -> Result<GrainId, Fault> {
        let registry = self
            .registry
            .upgrade()
            .ok_or_else(|| Fault::remote("tether::HostGone", "registry is gone"))?;
        let factory = self.factories.get(type_name).ok_or_else(|| {
            Fault::remote(
                "tether::UnknownSubjectType",
                format!("no factory registered for type {type_name:?}"),
            )
        })?;
        let servant = registry.get_or_create_servant(factory());
        debug!(type_name, grain_id = %servant.grain_id(), "subject created");
        Ok(servant.grain_id())
    }

    fn remove_subject(&self, id: GrainId) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.remove_servant(id),
            None => false,
        }
    }
}

impl SubjectStub for SubjectHost {
    fn interface_name(&self) -> &str {
        SUBJECT_HOST_INTERFACE
    }

    fn subject(&self) -> Arc<dyn std::any::Any + Send + Sync> {
        Arc::clone(&self.marker) as Arc<dyn std::any::Any + Send + Sync>
    }

    fn invoke<'a>(
        &'a self,
        method: &'a str,
        mut args: PayloadReader<'a>,
    ) -> BoxFuture<'a, Result<Vec<u8>, InvokeFault>> {
        Box::pin(async move {
            match method {
                METHOD_CREATE_SUBJECT => {
                    let type_name = String::parse(&mut args).map_err(InvokeFault::BadArguments)?;
                    let id = self.create_subject(&type_name)?;
                    Ok(encode_value(&id.raw()))
                }
                METHOD_REMOVE_SUBJECT => {
                    let id = GrainId::new(
                        u64::parse(&mut args).map_err(InvokeFault::BadArguments)?,
                    );
                    Ok(encode_value(&self.remove_subject(id)))
                }
                other => {
                    warn!(method = other, "subject host: unknown method");
                    Err(InvokeFault::NoSuchMethod)
                }
            }
        })
    }
}

/// Caller-side wrapper over the peer's subject host.
pub struct SubjectHostClient {
    proxy: Arc<ProxyHandle>,
}

impl SubjectHostClient {
    /// Get a client for the peer's subject host.
    pub fn new(endpoint: &Endpoint) -> Self {
        Self {
            proxy: endpoint
                .registry()
                .get_or_create_proxy(GrainId::SUBJECT_HOST, SUBJECT_HOST_INTERFACE),
        }
    }

    /// Ask the peer to instantiate a subject by registered type name.
    pub async fn create_subject(&self, type_name: &str) -> Result<GrainId, CallError> {
        let id: u64 = self
            .proxy
            .call(METHOD_CREATE_SUBJECT, &type_name.to_owned())
            .await?;
        Ok(GrainId::new(id))
    }

    /// Ask the peer to deregister a subject.
    pub async fn remove_subject(&self, id: GrainId) -> Result<bool, CallError> {
        self.proxy.call(METHOD_REMOVE_SUBJECT, &id.raw()).await
    }
}
