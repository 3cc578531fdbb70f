//! The child-side host runtime.
//!
//! A hosted process binds a loopback listener, walks the stdout boot
//! protocol, serves exactly one endpoint connection from its parent, and
//! says goodbye. It arms the parent-death watch first thing, so a dying
//! parent takes the host down cleanly at any phase.

use std::collections::HashMap;
use std::fmt;

use tracing::{info, warn};

use tether_session::{
    Endpoint, EndpointConfig, EndpointState, RegistryError, SubjectFactory, SubjectHost,
};
use tether_stream::{ConnectError, Listener};

use crate::stdout::{LINE_BOOTING, LINE_GOODBYE, LINE_READY};
use crate::watchdog;

/// Host-side configuration.
pub struct HostConfig {
    /// Endpoint settings for the single connection the host serves.
    pub endpoint: EndpointConfig,
    /// Subject types the parent may instantiate, by name.
    pub factories: HashMap<String, SubjectFactory>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointConfig::default().with_name("tether-host"),
            factories: HashMap::new(),
        }
    }
}

/// Why the host runtime stopped abnormally.
#[derive(Debug)]
pub enum HostError {
    /// Binding the loopback listener failed.
    Bind(std::io::Error),
    /// Registering the subject host failed.
    Registry(RegistryError),
    /// Accepting or handshaking the parent connection failed.
    Accept(ConnectError),
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostError::Bind(e) => write!(f, "binding loopback listener: {e}"),
            HostError::Registry(e) => write!(f, "installing subject host: {e}"),
            HostError::Accept(e) => write!(f, "accepting parent connection: {e}"),
        }
    }
}

impl std::error::Error for HostError {}

/// Run the host until the parent disconnects or dies.
///
/// `parent_pid` is the sole command-line argument a hosted binary
/// receives. Returns cleanly (after printing `goodbye`) in every ordinary
/// shutdown: parent said goodbye, parent died, connection fell over.
pub async fn run_host(parent_pid: u32, config: HostConfig) -> Result<(), HostError> {
    let parent_gone = watchdog::watch_parent(parent_pid);

    let listener = Listener::bind("127.0.0.1:0").await.map_err(HostError::Bind)?;
    let port = listener.local_addr().map_err(HostError::Bind)?.port();

    let endpoint = Endpoint::new(config.endpoint);
    SubjectHost::install(&endpoint, config.factories).map_err(HostError::Registry)?;

    println!("{LINE_BOOTING}");
    println!("{port}");
    println!("{LINE_READY}");
    info!(parent_pid, port, "host ready, waiting for parent");

    tokio::select! {
        accepted = listener.accept(&endpoint) => {
            if let Err(e) = accepted {
                println!("{LINE_GOODBYE}");
                return Err(HostError::Accept(e));
            }
        }
        _ = parent_gone.cancelled() => {
            println!("{LINE_GOODBYE}");
            return Ok(());
        }
    }
    info!(peer = endpoint.peer_name().as_deref().unwrap_or("unknown"), "parent connected");

    // Serve until the connection ends, or until the parent dies under us.
    let mut states = endpoint.state_changes();
    tokio::select! {
        result = states.wait_for(|s| {
            matches!(s, EndpointState::Disconnected | EndpointState::Faulted)
        }) => {
            match result {
                Ok(state) => info!(state = %*state, "connection over"),
                Err(_) => warn!("endpoint state channel closed"),
            }
        }
        _ = parent_gone.cancelled() => {
            endpoint.disconnect().await;
        }
    }

    println!("{LINE_GOODBYE}");
    Ok(())
}
