//! Parent-side hosting: spawn a child host, boot it over stdout, connect,
//! supervise, and aggregate faults.
//!
//! Fault flow: the endpoint's failure callback and the heartbeat monitor
//! both feed [`SiloInner::fault`]. The first report wins and triggers the
//! one cleanup pass (kill child, dispose endpoint, flag the failure); every
//! later report is an echo of the same collapse. The endpoint is not
//! disconnected a second time when the fault came from its own pumps, so
//! the original disconnect reason survives.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{info, warn};

use tether_session::{
    DisconnectReason, Endpoint, EndpointConfig, HeartbeatConfig, HeartbeatMonitor, NoDebugger,
    SubjectHostClient,
};
use tether_stream::ConnectError;

use crate::stdout::{read_boot_handshake, BootError, LINE_GOODBYE};

/// Why a hosted process is considered failed, as surfaced to silo users.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiloFaultReason {
    /// The connection to the child broke (read failure or protocol
    /// violation).
    ConnectionFailure,
    /// The connection was closed on request, ours or the child's.
    ConnectionClosed,
    /// Something escaped the runtime; the catch-all class.
    UnhandledException,
    /// The child stopped answering heartbeats.
    HeartbeatFailure,
}

impl fmt::Display for SiloFaultReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SiloFaultReason::ConnectionFailure => "connection failure",
            SiloFaultReason::ConnectionClosed => "connection closed",
            SiloFaultReason::UnhandledException => "unhandled exception",
            SiloFaultReason::HeartbeatFailure => "heartbeat failure",
        };
        f.write_str(s)
    }
}

/// Map an endpoint disconnect reason onto the silo fault taxonomy.
pub fn map_disconnect_reason(reason: DisconnectReason) -> SiloFaultReason {
    match reason {
        DisconnectReason::ReadFailure | DisconnectReason::RpcInvalidResponse => {
            SiloFaultReason::ConnectionFailure
        }
        DisconnectReason::RequestedByEndPoint | DisconnectReason::RequestedByRemoteEndPoint => {
            SiloFaultReason::ConnectionClosed
        }
        DisconnectReason::UnhandledException => SiloFaultReason::UnhandledException,
    }
}

/// What the silo did about a fault. Currently the only cleanup is a full
/// shutdown of the hosted process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultHandling {
    /// Child killed, endpoint disposed.
    Shutdown,
}

/// Fired once, when the endpoint or the heartbeat reports failure.
pub type FaultDetectedCallback = Arc<dyn Fn(SiloFaultReason) + Send + Sync>;
/// Fired after cleanup for a detected fault.
pub type FaultHandledCallback = Arc<dyn Fn(SiloFaultReason, FaultHandling) + Send + Sync>;
/// Receives every stdout line the child prints after `ready`.
pub type HostOutputCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Silo configuration.
#[derive(Clone)]
pub struct SiloConfig {
    /// The host executable to spawn.
    pub host_binary: PathBuf,
    /// Extra arguments placed before the parent pid.
    pub host_args: Vec<String>,
    /// How long the child has to finish the stdout boot handshake.
    pub ready_timeout: Duration,
    /// How long the socket connect to the child may take.
    pub connect_timeout: Duration,
    /// Endpoint settings for the connection to the child.
    pub endpoint: EndpointConfig,
    /// Heartbeat supervision settings.
    pub heartbeat: HeartbeatConfig,
}

impl SiloConfig {
    /// Config for the given host binary, with protocol-default timeouts.
    pub fn new(host_binary: impl Into<PathBuf>) -> Self {
        Self {
            host_binary: host_binary.into(),
            host_args: Vec::new(),
            ready_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(1),
            endpoint: EndpointConfig::default().with_name("tether-silo"),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

/// Why starting the silo failed.
#[derive(Debug)]
pub enum SiloError {
    /// Spawning the child process failed.
    Spawn(std::io::Error),
    /// The stdout boot handshake was rejected or timed out.
    Handshake(BootError),
    /// The boot handshake did not complete inside `ready_timeout`.
    HandshakeTimeout,
    /// Connecting to the child's port failed.
    Connect(ConnectError),
}

impl fmt::Display for SiloError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SiloError::Spawn(e) => write!(f, "spawning host process: {e}"),
            SiloError::Handshake(e) => write!(f, "boot handshake: {e}"),
            SiloError::HandshakeTimeout => write!(f, "boot handshake timed out"),
            SiloError::Connect(e) => write!(f, "connecting to host: {e}"),
        }
    }
}

impl std::error::Error for SiloError {}

impl SiloError {
    /// Whether the failure was the child not completing its handshake.
    pub fn is_handshake_failure(&self) -> bool {
        matches!(self, SiloError::Handshake(_) | SiloError::HandshakeTimeout)
    }
}

struct SiloInner {
    endpoint: Endpoint,
    child: Mutex<Option<Child>>,
    monitor: Mutex<Option<HeartbeatMonitor>>,
    has_failed: AtomicBool,
    fault_seen: AtomicBool,
    on_fault_detected: Mutex<Option<FaultDetectedCallback>>,
    on_fault_handled: Mutex<Option<FaultHandledCallback>>,
    on_host_output: Mutex<Option<HostOutputCallback>>,
}

impl SiloInner {
    /// First fault wins; runs cleanup once and fires both events.
    ///
    /// `endpoint_initiated` marks faults originating in the endpoint's own
    /// pumps, which have already torn the connection down.
    fn fault(self: &Arc<Self>, reason: SiloFaultReason, endpoint_initiated: bool) {
        if self.fault_seen.swap(true, Ordering::SeqCst) {
            return;
        }
        self.has_failed.store(true, Ordering::SeqCst);
        warn!(%reason, "hosted process failed");
        if let Some(callback) = self.on_fault_detected.lock().clone() {
            callback(reason);
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.shutdown_hosted(endpoint_initiated).await;
            if let Some(callback) = inner.on_fault_handled.lock().clone() {
                callback(reason, FaultHandling::Shutdown);
            }
        });
    }

    async fn shutdown_hosted(&self, endpoint_initiated: bool) {
        if let Some(monitor) = self.monitor.lock().take() {
            monitor.stop();
        }
        let child = self.child.lock().take();
        if let Some(mut child) = child {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "killing hosted process");
            }
        }
        if !endpoint_initiated {
            self.endpoint.disconnect().await;
        }
    }
}

/// A hosted child process driven over one endpoint connection.
pub struct ProcessSilo {
    inner: Arc<SiloInner>,
}

impl ProcessSilo {
    /// Spawn the host, boot it, connect, and start supervision.
    ///
    /// On any failure the child is killed before the error returns.
    pub async fn start(config: SiloConfig) -> Result<Self, SiloError> {
        let mut command = Command::new(&config.host_binary);
        command
            .args(&config.host_args)
            .arg(std::process::id().to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        let mut child = command.spawn().map_err(SiloError::Spawn)?;
        info!(binary = %config.host_binary.display(), pid = child.id(), "host spawned");

        let stdout = child.stdout.take().expect("stdout piped above");
        let mut lines = BufReader::new(stdout).lines();

        let port = match tokio::time::timeout(
            config.ready_timeout,
            read_boot_handshake(&mut lines),
        )
        .await
        {
            Ok(Ok(port)) => port,
            Ok(Err(e)) => {
                let _ = child.kill().await;
                return Err(SiloError::Handshake(e));
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(SiloError::HandshakeTimeout);
            }
        };
        info!(port, "host ready");

        let endpoint = Endpoint::new(config.endpoint.clone());
        if let Err(e) = tether_stream::connect(
            &endpoint,
            ("127.0.0.1", port),
            config.connect_timeout,
        )
        .await
        {
            let _ = child.kill().await;
            return Err(SiloError::Connect(e));
        }

        let inner = Arc::new(SiloInner {
            endpoint: endpoint.clone(),
            child: Mutex::new(Some(child)),
            monitor: Mutex::new(None),
            has_failed: AtomicBool::new(false),
            fault_seen: AtomicBool::new(false),
            on_fault_detected: Mutex::new(None),
            on_fault_handled: Mutex::new(None),
            on_host_output: Mutex::new(None),
        });

        // Forward the child's post-ready stdout until goodbye or EOF.
        {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                while let Ok(Some(line)) = lines.next_line().await {
                    if line == LINE_GOODBYE {
                        info!("host said goodbye");
                        break;
                    }
                    match inner.on_host_output.lock().clone() {
                        Some(callback) => callback(&line),
                        None => info!(host_output = %line),
                    }
                }
            });
        }

        // Endpoint failures feed the fault aggregator. The endpoint has
        // already torn itself down in this path.
        {
            let inner = Arc::clone(&inner);
            endpoint.on_failure(Arc::new(move |reason| {
                inner.fault(map_disconnect_reason(reason), true);
            }));
        }

        // Heartbeat supervision.
        let monitor = {
            let inner_for_fault = Arc::clone(&inner);
            HeartbeatMonitor::start(
                endpoint.downgrade(),
                config.heartbeat.clone(),
                Arc::new(NoDebugger),
                Arc::new(move |_fault| {
                    inner_for_fault.fault(SiloFaultReason::HeartbeatFailure, false);
                }),
            )
        };
        *inner.monitor.lock() = Some(monitor);

        Ok(Self { inner })
    }

    /// The endpoint connected to the hosted process.
    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    /// Client for the child's subject host.
    pub fn subjects(&self) -> SubjectHostClient {
        SubjectHostClient::new(&self.inner.endpoint)
    }

    /// OS pid of the child, while it is running.
    pub fn child_pid(&self) -> Option<u32> {
        self.inner.child.lock().as_ref().and_then(|child| child.id())
    }

    /// Whether the hosted process has been declared failed.
    pub fn has_process_failed(&self) -> bool {
        self.inner.has_failed.load(Ordering::SeqCst)
    }

    /// Whether the child process is still running.
    pub fn is_process_running(&self) -> bool {
        let mut slot = self.inner.child.lock();
        match slot.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(None) => true,
                Ok(Some(_)) | Err(_) => false,
            },
            None => false,
        }
    }

    /// Install the fault-detected callback.
    pub fn on_fault_detected(&self, callback: FaultDetectedCallback) {
        *self.inner.on_fault_detected.lock() = Some(callback);
    }

    /// Install the fault-handled callback.
    pub fn on_fault_handled(&self, callback: FaultHandledCallback) {
        *self.inner.on_fault_handled.lock() = Some(callback);
    }

    /// Install the host stdout forwarding callback.
    pub fn on_host_output(&self, callback: HostOutputCallback) {
        *self.inner.on_host_output.lock() = Some(callback);
    }

    /// Stop the hosted process cleanly.
    ///
    /// Suppresses fault events for the shutdown itself, disconnects the
    /// endpoint (the child sees a Goodbye and exits on its own), and reaps
    /// the child, killing it if it lingers.
    pub async fn stop(&self) {
        // A requested stop is not a fault.
        self.inner.fault_seen.store(true, Ordering::SeqCst);
        if let Some(monitor) = self.inner.monitor.lock().take() {
            monitor.stop();
        }
        self.inner.endpoint.disconnect().await;

        let child = self.inner.child.lock().take();
        if let Some(mut child) = child {
            match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
                Ok(Ok(status)) => info!(?status, "host exited"),
                Ok(Err(e)) => warn!(error = %e, "waiting for host"),
                Err(_) => {
                    warn!("host did not exit after goodbye, killing it");
                    let _ = child.kill().await;
                }
            }
        }
    }
}

impl fmt::Debug for ProcessSilo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSilo")
            .field("failed", &self.has_process_failed())
            .finish()
    }
}
