//! The object registry: servant and proxy tables keyed by grain id.
//!
//! One read-write lock guards both tables plus the subject identity index
//! and the grain-id allocator. Lookups clone an `Arc` out under the read
//! lock and drop the lock before anything else happens, so the dispatch hot
//! path never holds it across an invocation.
//!
//! At any instant a grain id lives in at most one of the two tables; the
//! create paths refuse ids the other table holds.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::RwLock;
use tracing::debug;

use tether_wire::{ByRefHint, GrainId, GrainIdAllocator};

use crate::dispatch::SubjectStub;
use crate::endpoint::EndpointInner;
use crate::errors::RegistryError;
use crate::proxy::ProxyHandle;

/// Local side of a grain: holds the subject through its stub.
///
/// The registry's `Arc` is the owning reference; a servant is destroyed
/// only after its id has left the table, and dispatches that already hold
/// the `Arc` finish against a live servant.
pub struct Servant {
    grain_id: GrainId,
    stub: Arc<dyn SubjectStub>,
}

impl Servant {
    /// The grain id this servant is registered under.
    pub fn grain_id(&self) -> GrainId {
        self.grain_id
    }

    /// Declared interface of the stub.
    pub fn interface_name(&self) -> &str {
        self.stub.interface_name()
    }

    /// The stub, for dispatch.
    pub fn stub(&self) -> &Arc<dyn SubjectStub> {
        &self.stub
    }

    /// The wrapped subject.
    pub fn subject(&self) -> Arc<dyn Any + Send + Sync> {
        self.stub.subject()
    }
}

impl std::fmt::Debug for Servant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Servant")
            .field("grain_id", &self.grain_id)
            .field("interface", &self.stub.interface_name())
            .finish()
    }
}

/// What a by-reference decode resolves to.
pub enum ResolvedRef {
    /// The grain lives on the peer; calls go through this proxy.
    Proxy(Arc<ProxyHandle>),
    /// The grain lives here; this is the raw subject.
    Subject(Arc<dyn Any + Send + Sync>),
}

struct Tables {
    servants: HashMap<GrainId, Arc<Servant>>,
    proxies: HashMap<GrainId, Arc<ProxyHandle>>,
    /// Subject identity (stub pointer) to grain id, for get-or-create.
    by_subject: HashMap<usize, GrainId>,
}

impl Tables {
    fn id_taken(&self, id: GrainId) -> bool {
        self.servants.contains_key(&id) || self.proxies.contains_key(&id)
    }
}

/// Proxy and servant tables of one endpoint.
pub struct Registry {
    tables: RwLock<Tables>,
    grain_ids: GrainIdAllocator,
    /// Back-reference handed to remote proxies; set once by the endpoint.
    endpoint: OnceLock<Weak<EndpointInner>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            tables: RwLock::new(Tables {
                servants: HashMap::new(),
                proxies: HashMap::new(),
                by_subject: HashMap::new(),
            }),
            grain_ids: GrainIdAllocator::new(),
            endpoint: OnceLock::new(),
        }
    }

    pub(crate) fn bind_endpoint(&self, endpoint: Weak<EndpointInner>) {
        let _ = self.endpoint.set(endpoint);
    }

    fn endpoint_ref(&self) -> Weak<EndpointInner> {
        self.endpoint.get().cloned().unwrap_or_default()
    }

    fn stub_identity(stub: &Arc<dyn SubjectStub>) -> usize {
        Arc::as_ptr(stub) as *const () as usize
    }

    /// Register a servant under an explicit grain id.
    ///
    /// Fails with `DuplicateId` if the id is taken by either table.
    pub fn create_servant(
        &self,
        id: GrainId,
        stub: Arc<dyn SubjectStub>,
    ) -> Result<Arc<Servant>, RegistryError> {
        let mut tables = self.tables.write();
        if tables.id_taken(id) {
            return Err(RegistryError::DuplicateId(id));
        }
        let servant = Arc::new(Servant {
            grain_id: id,
            stub: Arc::clone(&stub),
        });
        tables.servants.insert(id, Arc::clone(&servant));
        tables.by_subject.insert(Self::stub_identity(&stub), id);
        debug!(grain_id = %id, interface = servant.interface_name(), "servant registered");
        Ok(servant)
    }

    /// Register a servant for a subject, allocating a grain id on first
    /// registration.
    ///
    /// Identity-keyed: the same stub instance maps to the same servant, no
    /// matter how often it is registered.
    pub fn get_or_create_servant(&self, stub: Arc<dyn SubjectStub>) -> Arc<Servant> {
        let key = Self::stub_identity(&stub);
        {
            let tables = self.tables.read();
            if let Some(id) = tables.by_subject.get(&key) {
                if let Some(servant) = tables.servants.get(id) {
                    return Arc::clone(servant);
                }
            }
        }
        let mut tables = self.tables.write();
        // Re-check under the write lock; another thread may have won.
        if let Some(id) = tables.by_subject.get(&key) {
            if let Some(servant) = tables.servants.get(id) {
                return Arc::clone(servant);
            }
        }
        let mut id = self.grain_ids.next();
        while tables.id_taken(id) {
            id = self.grain_ids.next();
        }
        let servant = Arc::new(Servant {
            grain_id: id,
            stub: Arc::clone(&stub),
        });
        tables.servants.insert(id, Arc::clone(&servant));
        tables.by_subject.insert(key, id);
        debug!(grain_id = %id, interface = servant.interface_name(), "servant registered");
        servant
    }

    /// Register a proxy under an explicit grain id.
    ///
    /// Fails with `DuplicateId` if the id is taken by either table.
    pub fn create_proxy(
        &self,
        id: GrainId,
        interface: &str,
    ) -> Result<Arc<ProxyHandle>, RegistryError> {
        let mut tables = self.tables.write();
        if tables.id_taken(id) {
            return Err(RegistryError::DuplicateId(id));
        }
        let proxy = Arc::new(ProxyHandle::remote(id, interface, self.endpoint_ref()));
        tables.proxies.insert(id, Arc::clone(&proxy));
        debug!(grain_id = %id, interface, "proxy registered");
        Ok(proxy)
    }

    /// Return the proxy for a grain id, creating one if none exists.
    ///
    /// If a servant holds the id, the grain is local: the returned handle
    /// passes calls straight through to the subject and no wire proxy is
    /// allocated. Wire proxies are cached, so repeated calls return the
    /// same instance.
    pub fn get_or_create_proxy(&self, id: GrainId, interface: &str) -> Arc<ProxyHandle> {
        {
            let tables = self.tables.read();
            if let Some(proxy) = tables.proxies.get(&id) {
                return Arc::clone(proxy);
            }
            if let Some(servant) = tables.servants.get(&id) {
                return Arc::new(ProxyHandle::local(Arc::clone(servant)));
            }
        }
        let mut tables = self.tables.write();
        if let Some(proxy) = tables.proxies.get(&id) {
            return Arc::clone(proxy);
        }
        if let Some(servant) = tables.servants.get(&id) {
            return Arc::new(ProxyHandle::local(Arc::clone(servant)));
        }
        let proxy = Arc::new(ProxyHandle::remote(id, interface, self.endpoint_ref()));
        tables.proxies.insert(id, Arc::clone(&proxy));
        debug!(grain_id = %id, interface, "proxy created");
        proxy
    }

    /// Look up a servant for incoming dispatch.
    pub fn lookup_servant(&self, id: GrainId) -> Result<Arc<Servant>, RegistryError> {
        self.tables
            .read()
            .servants
            .get(&id)
            .cloned()
            .ok_or(RegistryError::NoSuchServant(id))
    }

    /// Return the raw subject for local use.
    ///
    /// This is the `RetrieveSubject` side of a by-reference decode.
    pub fn retrieve_subject(&self, id: GrainId) -> Result<Arc<dyn Any + Send + Sync>, RegistryError> {
        self.tables
            .read()
            .servants
            .get(&id)
            .map(|s| s.subject())
            .ok_or(RegistryError::NoSuchSubject(id))
    }

    /// Resolve a decoded by-reference pair against the tables.
    pub fn resolve_reference(
        &self,
        hint: ByRefHint,
        id: GrainId,
        interface: &str,
    ) -> Result<ResolvedRef, RegistryError> {
        match hint {
            ByRefHint::CreateProxy => Ok(ResolvedRef::Proxy(self.get_or_create_proxy(id, interface))),
            ByRefHint::RetrieveSubject => Ok(ResolvedRef::Subject(self.retrieve_subject(id)?)),
        }
    }

    /// Deregister a servant. Returns whether one was registered.
    pub fn remove_servant(&self, id: GrainId) -> bool {
        let mut tables = self.tables.write();
        match tables.servants.remove(&id) {
            Some(servant) => {
                let key = Self::stub_identity(servant.stub());
                tables.by_subject.remove(&key);
                debug!(grain_id = %id, "servant removed");
                true
            }
            None => false,
        }
    }

    /// Number of registered servants.
    pub fn servant_count(&self) -> usize {
        self.tables.read().servants.len()
    }

    /// Number of registered wire proxies.
    pub fn proxy_count(&self) -> usize {
        self.tables.read().proxies.len()
    }

    /// Check the table-disjointness invariant. Test support.
    pub fn tables_are_disjoint(&self) -> bool {
        let tables = self.tables.read();
        tables
            .servants
            .keys()
            .all(|id| !tables.proxies.contains_key(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::InvokeFault;
    use futures_util::future::BoxFuture;
    use tether_wire::PayloadReader;

    struct NullStub {
        interface: &'static str,
        subject: Arc<()>,
    }

    impl NullStub {
        fn new(interface: &'static str) -> Arc<dyn SubjectStub> {
            Arc::new(Self {
                interface,
                subject: Arc::new(()),
            })
        }
    }

    impl SubjectStub for NullStub {
        fn interface_name(&self) -> &str {
            self.interface
        }

        fn subject(&self) -> Arc<dyn Any + Send + Sync> {
            Arc::clone(&self.subject) as Arc<dyn Any + Send + Sync>
        }

        fn invoke<'a>(
            &'a self,
            _method: &'a str,
            _args: PayloadReader<'a>,
        ) -> BoxFuture<'a, Result<Vec<u8>, InvokeFault>> {
            Box::pin(async { Ok(Vec::new()) })
        }
    }

    #[test]
    fn duplicate_ids_are_refused_across_both_tables() {
        let registry = Registry::new();
        let id = GrainId::new(100);
        registry.create_servant(id, NullStub::new("IFoo")).unwrap();
        assert_eq!(
            registry.create_servant(id, NullStub::new("IFoo")).unwrap_err(),
            RegistryError::DuplicateId(id)
        );
        assert_eq!(
            registry.create_proxy(id, "IFoo").unwrap_err(),
            RegistryError::DuplicateId(id)
        );

        let proxy_id = GrainId::new(200);
        registry.create_proxy(proxy_id, "IBar").unwrap();
        assert_eq!(
            registry
                .create_servant(proxy_id, NullStub::new("IBar"))
                .unwrap_err(),
            RegistryError::DuplicateId(proxy_id)
        );
        assert!(registry.tables_are_disjoint());
    }

    #[test]
    fn get_or_create_servant_is_identity_keyed() {
        let registry = Registry::new();
        let stub = NullStub::new("IFoo");
        let a = registry.get_or_create_servant(Arc::clone(&stub));
        let b = registry.get_or_create_servant(Arc::clone(&stub));
        assert_eq!(a.grain_id(), b.grain_id());
        assert_eq!(registry.servant_count(), 1);

        // A distinct stub instance gets its own grain, even for the same
        // interface.
        let c = registry.get_or_create_servant(NullStub::new("IFoo"));
        assert_ne!(a.grain_id(), c.grain_id());
        assert_eq!(registry.servant_count(), 2);
    }

    #[test]
    fn get_or_create_proxy_preserves_identity() {
        let registry = Registry::new();
        let id = GrainId::new(7);
        let a = registry.get_or_create_proxy(id, "IFoo");
        let b = registry.get_or_create_proxy(id, "IFoo");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.proxy_count(), 1);
    }

    #[test]
    fn proxy_over_local_servant_is_a_passthrough() {
        let registry = Registry::new();
        let id = GrainId::new(9);
        registry.create_servant(id, NullStub::new("IFoo")).unwrap();
        let proxy = registry.get_or_create_proxy(id, "IFoo");
        assert!(proxy.is_local());
        // No wire proxy was allocated for the local grain.
        assert_eq!(registry.proxy_count(), 0);
        assert!(registry.tables_are_disjoint());
    }

    #[test]
    fn remove_servant_clears_identity_index() {
        let registry = Registry::new();
        let stub = NullStub::new("IFoo");
        let servant = registry.get_or_create_servant(Arc::clone(&stub));
        assert!(registry.remove_servant(servant.grain_id()));
        assert!(!registry.remove_servant(servant.grain_id()));
        assert!(registry.lookup_servant(servant.grain_id()).is_err());

        // Re-registering the same subject allocates a fresh grain.
        let again = registry.get_or_create_servant(stub);
        assert_ne!(again.grain_id(), servant.grain_id());
    }

    #[test]
    fn retrieve_subject_returns_the_wrapped_subject() {
        let registry = Registry::new();
        let id = GrainId::new(3);
        registry.create_servant(id, NullStub::new("IFoo")).unwrap();
        let subject = registry.retrieve_subject(id).unwrap();
        assert!(subject.downcast::<()>().is_ok());
        assert_eq!(
            registry.retrieve_subject(GrainId::new(4)).unwrap_err(),
            RegistryError::NoSuchSubject(GrainId::new(4))
        );
    }
}
