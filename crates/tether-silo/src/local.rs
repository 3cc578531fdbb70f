//! In-process silo: the hosting surface without the child process.
//!
//! Useful in tests and for callers that want silo semantics (subject host,
//! endpoint lifecycle) while keeping everything in one process. Runs over
//! the in-memory transport; there is no boot protocol and no watchdog.

use std::collections::HashMap;

use tether_session::transport::memory_pair;
use tether_session::{
    Endpoint, EndpointConfig, RegistryError, SubjectFactory, SubjectHost, SubjectHostClient,
};

/// Both sides of an in-process silo.
pub struct LocalProcessSilo {
    silo: Endpoint,
    host: Endpoint,
}

impl LocalProcessSilo {
    /// Stand up a connected silo/host endpoint pair with the given subject
    /// factories on the host side.
    pub fn start(
        factories: HashMap<String, SubjectFactory>,
    ) -> Result<Self, RegistryError> {
        let ((silo_r, silo_w), (host_r, host_w)) = memory_pair(256);

        let silo = Endpoint::new(EndpointConfig::default().with_name("local-silo"));
        let host = Endpoint::new(EndpointConfig::default().with_name("local-host"));
        SubjectHost::install(&host, factories)?;

        silo.attach(silo_r, silo_w, Some(host.name().to_owned()))
            .expect("fresh endpoint accepts its first attach");
        host.attach(host_r, host_w, Some(silo.name().to_owned()))
            .expect("fresh endpoint accepts its first attach");
        Ok(Self { silo, host })
    }

    /// The silo-side endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.silo
    }

    /// The host-side endpoint (where subjects live).
    pub fn host_endpoint(&self) -> &Endpoint {
        &self.host
    }

    /// Client for the host's subject host.
    pub fn subjects(&self) -> SubjectHostClient {
        SubjectHostClient::new(&self.silo)
    }

    /// Tear both sides down.
    pub async fn stop(&self) {
        self.silo.disconnect().await;
    }
}
