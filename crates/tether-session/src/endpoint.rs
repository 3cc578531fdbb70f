//! The endpoint: connection state machine, read and write pumps, dispatch.
//!
//! An endpoint is one bidirectional remoting channel with at most one peer.
//! The transport integration (TCP connect/accept, handshake bytes) lives in
//! `tether-stream`; this module owns everything after the byte stream
//! exists: state transitions, the two pump tasks, dispatch of incoming
//! frames, and failure classification.
//!
//! Pump ownership is strict. The read pump is the only reader, the write
//! pump the only writer, and both park on the endpoint's cancellation token.
//! Once the state leaves `Connected`, the only frame the write half may
//! still emit is the final Goodbye.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_wire::{encode_value, Frame, MessageKind, PayloadReader};

use crate::errors::{DisconnectReason, Fault};
use crate::pending::{OutboundSender, PendingCalls, ResponseKind};
use crate::registry::Registry;
use crate::transport::{FrameReader, FrameWriter};

/// Where the endpoint currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// No connection; the initial and final state.
    Disconnected,
    /// Byte stream being established.
    Connecting,
    /// Stream up, handshake blocks in flight.
    Handshaking,
    /// Fully operational.
    Connected,
    /// Shutdown in progress.
    Disconnecting,
    /// A pump failed; the endpoint is spent.
    Faulted,
}

impl std::fmt::Display for EndpointState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// An illegal state transition was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    /// State the endpoint was in.
    pub from: EndpointState,
    /// State that was requested.
    pub to: EndpointState,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cannot transition endpoint from {} to {}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}

/// Invoked when the connection ends for any reason other than a local
/// `disconnect()` call.
pub type FailureCallback = Arc<dyn Fn(DisconnectReason) + Send + Sync>;

/// Endpoint tunables. Defaults match the protocol's documented values.
#[derive(Clone, Debug)]
pub struct EndpointConfig {
    /// Name sent to the peer during the handshake.
    pub name: String,
    /// Largest frame either pump will accept or emit.
    pub max_frame_size: u32,
    /// How long the handshake block exchange may take.
    pub handshake_timeout: Duration,
    /// Concurrent servant invocations.
    pub dispatch_workers: usize,
    /// Soft cap on concurrent outgoing calls; callers beyond it block.
    pub max_in_flight: usize,
    /// Depth of the outbound frame queue.
    pub outbound_depth: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            name: "tether-endpoint".to_owned(),
            max_frame_size: 64 * 1024 * 1024,
            handshake_timeout: Duration::from_secs(5),
            dispatch_workers: 16,
            max_in_flight: 1000,
            outbound_depth: 256,
        }
    }
}

impl EndpointConfig {
    /// Set the endpoint name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the frame size cap.
    pub fn with_max_frame_size(mut self, bytes: u32) -> Self {
        self.max_frame_size = bytes;
        self
    }
}

#[derive(Default)]
struct GoodbyePlan {
    send: bool,
    reason: Option<String>,
}

pub(crate) struct EndpointInner {
    config: EndpointConfig,
    registry: Arc<Registry>,
    pending: PendingCalls,
    outbound: OutboundSender,
    outbound_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    state: watch::Sender<EndpointState>,
    cancel: CancellationToken,
    goodbye: Mutex<GoodbyePlan>,
    peer_name: Mutex<Option<String>>,
    disconnect_reason: Mutex<Option<DisconnectReason>>,
    on_failure: Mutex<Option<FailureCallback>>,
    dispatch_permits: Arc<Semaphore>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
    attached: AtomicBool,
    frames_read: AtomicU64,
    frames_written: AtomicU64,
}

impl EndpointInner {
    pub(crate) fn state(&self) -> EndpointState {
        *self.state.borrow()
    }

    pub(crate) fn pending(&self) -> &PendingCalls {
        &self.pending
    }

    fn set_state(&self, next: EndpointState) {
        let prior = self.state.send_replace(next);
        if prior != next {
            debug!(endpoint = %self.config.name, from = %prior, to = %next, "state transition");
        }
    }

    fn try_transition(
        &self,
        allowed_from: &[EndpointState],
        to: EndpointState,
    ) -> Result<(), InvalidTransition> {
        let mut result = Ok(());
        self.state.send_if_modified(|state| {
            if allowed_from.contains(state) {
                debug!(endpoint = %self.config.name, from = %*state, to = %to, "state transition");
                *state = to;
                true
            } else {
                result = Err(InvalidTransition { from: *state, to });
                false
            }
        });
        result
    }

    fn notify_failure(&self, reason: DisconnectReason) {
        let callback = self.on_failure.lock().clone();
        if let Some(callback) = callback {
            callback(reason);
        }
    }

    /// A pump failed. First classification wins; later ones are echoes of
    /// the same collapse and must not overwrite the reason.
    fn fault(&self, reason: DisconnectReason) {
        {
            let mut slot = self.disconnect_reason.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(reason);
        }
        warn!(endpoint = %self.config.name, %reason, "endpoint faulted");
        self.set_state(EndpointState::Faulted);
        *self.goodbye.lock() = GoodbyePlan {
            send: true,
            reason: Some(reason.to_string()),
        };
        self.pending.cancel_all(reason);
        self.cancel.cancel();
        self.notify_failure(reason);
    }

    /// The peer announced a clean shutdown.
    fn remote_goodbye(&self, reason: Option<String>) {
        {
            let mut slot = self.disconnect_reason.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(DisconnectReason::RequestedByRemoteEndPoint);
        }
        info!(
            endpoint = %self.config.name,
            reason = reason.as_deref().unwrap_or("none given"),
            "peer requested disconnect"
        );
        self.set_state(EndpointState::Disconnecting);
        // The peer is gone; answering its Goodbye would only race the close.
        *self.goodbye.lock() = GoodbyePlan::default();
        self.pending
            .cancel_all(DisconnectReason::RequestedByRemoteEndPoint);
        self.cancel.cancel();
        self.notify_failure(DisconnectReason::RequestedByRemoteEndPoint);
        self.set_state(EndpointState::Disconnected);
    }
}

impl Drop for EndpointInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// One bidirectional remoting channel.
///
/// Cheap to clone; all clones share the same connection. Construct, wire a
/// transport through the `begin_connect`/`begin_handshake`/`attach`
/// plumbing (or let `tether-stream` do it), make calls through proxies,
/// then [`disconnect`](Endpoint::disconnect). The endpoint is a one-shot
/// resource: once disconnected or faulted it cannot be reattached.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

/// Weak endpoint handle; upgrade fails once the endpoint is dropped.
#[derive(Clone)]
pub struct WeakEndpoint {
    inner: Weak<EndpointInner>,
}

impl WeakEndpoint {
    /// Try to get the endpoint back.
    pub fn upgrade(&self) -> Option<Endpoint> {
        self.inner.upgrade().map(|inner| Endpoint { inner })
    }
}

impl Endpoint {
    /// Create a disconnected endpoint.
    pub fn new(config: EndpointConfig) -> Self {
        let (pending, outbound_rx) =
            PendingCalls::new(config.max_in_flight, config.outbound_depth);
        let outbound = pending.outbound_sender();
        let dispatch_permits = Arc::new(Semaphore::new(config.dispatch_workers));
        let (state, _) = watch::channel(EndpointState::Disconnected);
        let inner = Arc::new(EndpointInner {
            config,
            registry: Arc::new(Registry::new()),
            pending,
            outbound,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            state,
            cancel: CancellationToken::new(),
            goodbye: Mutex::new(GoodbyePlan::default()),
            peer_name: Mutex::new(None),
            disconnect_reason: Mutex::new(None),
            on_failure: Mutex::new(None),
            dispatch_permits,
            pumps: Mutex::new(Vec::new()),
            attached: AtomicBool::new(false),
            frames_read: AtomicU64::new(0),
            frames_written: AtomicU64::new(0),
        });
        inner.registry.bind_endpoint(Arc::downgrade(&inner));
        Self { inner }
    }

    /// This endpoint's object registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    /// The configuration the endpoint was built with.
    pub fn config(&self) -> &EndpointConfig {
        &self.inner.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EndpointState {
        self.inner.state()
    }

    /// Watch state transitions.
    pub fn state_changes(&self) -> watch::Receiver<EndpointState> {
        self.inner.state.subscribe()
    }

    /// Name this endpoint introduces itself with.
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// The peer's self-reported name, once connected.
    pub fn peer_name(&self) -> Option<String> {
        self.inner.peer_name.lock().clone()
    }

    /// Why the connection ended, once it has.
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        *self.inner.disconnect_reason.lock()
    }

    /// Install the failure callback. Replaces any earlier one.
    pub fn on_failure(&self, callback: FailureCallback) {
        *self.inner.on_failure.lock() = Some(callback);
    }

    /// Frames the read pump has consumed.
    pub fn frames_read(&self) -> u64 {
        self.inner.frames_read.load(Ordering::Relaxed)
    }

    /// Frames the write pump has committed.
    pub fn frames_written(&self) -> u64 {
        self.inner.frames_written.load(Ordering::Relaxed)
    }

    /// Downgrade to a weak handle.
    pub fn downgrade(&self) -> WeakEndpoint {
        WeakEndpoint {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Number of calls currently awaiting responses. Test support.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    // ------------------------------------------------------------------
    // Transport integration plumbing
    // ------------------------------------------------------------------

    /// Note that a byte stream is being established.
    pub fn begin_connect(&self) -> Result<(), InvalidTransition> {
        self.inner
            .try_transition(&[EndpointState::Disconnected], EndpointState::Connecting)
    }

    /// Note that handshake blocks are in flight.
    pub fn begin_handshake(&self) -> Result<(), InvalidTransition> {
        self.inner.try_transition(
            &[EndpointState::Disconnected, EndpointState::Connecting],
            EndpointState::Handshaking,
        )
    }

    /// A connect or handshake attempt failed; fall back to disconnected.
    pub fn connect_failed(&self) {
        let _ = self.inner.try_transition(
            &[EndpointState::Connecting, EndpointState::Handshaking],
            EndpointState::Disconnected,
        );
    }

    /// Take ownership of an established transport and go live.
    ///
    /// Spawns the read and write pumps and transitions to `Connected`. An
    /// endpoint accepts exactly one attach over its lifetime.
    pub fn attach<R, W>(
        &self,
        reader: R,
        writer: W,
        peer_name: Option<String>,
    ) -> Result<(), InvalidTransition>
    where
        R: FrameReader,
        W: FrameWriter,
    {
        if self.inner.attached.swap(true, Ordering::SeqCst)
            || self.inner.cancel.is_cancelled()
        {
            return Err(InvalidTransition {
                from: self.state(),
                to: EndpointState::Connected,
            });
        }
        self.inner.try_transition(
            &[
                EndpointState::Disconnected,
                EndpointState::Connecting,
                EndpointState::Handshaking,
            ],
            EndpointState::Connected,
        )?;

        *self.inner.peer_name.lock() = peer_name;
        let outbound_rx = self
            .inner
            .outbound_rx
            .lock()
            .take()
            .expect("attach guarded by the attached flag");

        let read_inner = Arc::clone(&self.inner);
        let write_inner = Arc::clone(&self.inner);
        let mut pumps = self.inner.pumps.lock();
        pumps.push(tokio::spawn(read_pump(read_inner, reader)));
        pumps.push(tokio::spawn(write_pump(write_inner, writer, outbound_rx)));
        info!(
            endpoint = %self.inner.config.name,
            peer = self.peer_name().as_deref().unwrap_or("unknown"),
            "endpoint connected"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    /// Send one liveness probe and wait for the reply.
    pub async fn ping(&self) -> Result<(), crate::errors::CallError> {
        use crate::errors::CallError;
        if self.state() != EndpointState::Connected {
            return Err(CallError::NotConnected);
        }
        let call = self.inner.pending.enqueue_probe().await?;
        let response = call.wait().await?;
        match response.kind {
            ResponseKind::Return => Ok(()),
            ResponseKind::Fault => {
                let fault: Fault = tether_wire::decode_value(&response.payload)?;
                Err(CallError::from_fault(fault))
            }
            ResponseKind::ConnectionLost(reason) => Err(CallError::ConnectionLost(reason)),
        }
    }

    /// Send one liveness probe, abandoning it if no reply arrives in time.
    pub async fn ping_timeout(&self, timeout: Duration) -> Result<(), crate::errors::CallError> {
        use crate::errors::CallError;
        if self.state() != EndpointState::Connected {
            return Err(CallError::NotConnected);
        }
        let call = self.inner.pending.enqueue_probe().await?;
        let rpc_id = call.rpc_id();
        match tokio::time::timeout(timeout, call.wait()).await {
            Ok(result) => {
                let response = result?;
                match response.kind {
                    ResponseKind::Return => Ok(()),
                    ResponseKind::Fault => {
                        let fault: Fault = tether_wire::decode_value(&response.payload)?;
                        Err(CallError::from_fault(fault))
                    }
                    ResponseKind::ConnectionLost(reason) => Err(CallError::ConnectionLost(reason)),
                }
            }
            Err(_) => {
                self.inner.pending.abandon(rpc_id);
                Err(CallError::TimedOut)
            }
        }
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Dispose the endpoint.
    ///
    /// Idempotent. Forces the state through `Disconnecting` to
    /// `Disconnected`, emits the final Goodbye, cancels every pending call
    /// with `RequestedByEndPoint` and joins the pumps.
    pub async fn disconnect(&self) {
        let transition = self.inner.try_transition(
            &[EndpointState::Connected],
            EndpointState::Disconnecting,
        );
        if transition.is_ok() {
            {
                let mut slot = self.inner.disconnect_reason.lock();
                if slot.is_none() {
                    *slot = Some(DisconnectReason::RequestedByEndPoint);
                }
            }
            *self.inner.goodbye.lock() = GoodbyePlan {
                send: true,
                reason: None,
            };
            self.inner
                .pending
                .cancel_all(DisconnectReason::RequestedByEndPoint);
            self.inner.cancel.cancel();
        } else {
            // Not connected: still tear down whatever is half-built.
            self.inner.cancel.cancel();
            let _ = self.inner.try_transition(
                &[EndpointState::Connecting, EndpointState::Handshaking],
                EndpointState::Disconnected,
            );
        }

        let pumps: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.pumps.lock());
        for pump in pumps {
            let _ = pump.await;
        }
        if transition.is_ok() {
            self.inner.set_state(EndpointState::Disconnected);
            info!(endpoint = %self.inner.config.name, "endpoint disconnected");
        }
    }

}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.inner.config.name)
            .field("state", &self.state())
            .finish()
    }
}

// ----------------------------------------------------------------------
// Pumps
// ----------------------------------------------------------------------

async fn read_pump<R: FrameReader>(inner: Arc<EndpointInner>, mut reader: R) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => return,
            result = reader.recv() => match result {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    // End of stream without a Goodbye: the peer vanished.
                    if !inner.cancel.is_cancelled() {
                        inner.fault(DisconnectReason::ReadFailure);
                    }
                    return;
                }
                Err(e) => {
                    if inner.cancel.is_cancelled() {
                        return;
                    }
                    let reason = if e.kind() == io::ErrorKind::InvalidData {
                        DisconnectReason::RpcInvalidResponse
                    } else {
                        DisconnectReason::ReadFailure
                    };
                    warn!(endpoint = %inner.config.name, error = %e, "read pump failed");
                    inner.fault(reason);
                    return;
                }
            },
        };
        inner.frames_read.fetch_add(1, Ordering::Relaxed);
        if !handle_frame(&inner, frame).await {
            return;
        }
    }
}

/// Dispatch one incoming frame. Returns whether the pump should keep going.
async fn handle_frame(inner: &Arc<EndpointInner>, frame: Frame) -> bool {
    if frame.kind == MessageKind::GOODBYE {
        inner.remote_goodbye(frame.goodbye_reason());
        return false;
    }

    if frame.kind == MessageKind::HEARTBEAT {
        // A reply completes our own probe; anything else is the peer
        // probing us and gets an echo.
        if !inner
            .pending
            .complete(frame.rpc_id, ResponseKind::Return, Vec::new())
        {
            inner
                .outbound
                .send_frame(&Frame::heartbeat(frame.rpc_id))
                .await;
        }
        return true;
    }

    if frame.is_response() {
        let kind = if frame.is_exception() {
            ResponseKind::Fault
        } else {
            ResponseKind::Return
        };
        if !inner.pending.complete(frame.rpc_id, kind, frame.payload) {
            // Usually a response that lost the race against cancellation.
            warn!(
                endpoint = %inner.config.name,
                rpc_id = %frame.rpc_id,
                "response did not match a pending call, discarding"
            );
        }
        return true;
    }

    debug_assert_eq!(frame.kind, MessageKind::CALL, "decode admits no other kinds");
    dispatch_call(inner, frame).await
}

async fn dispatch_call(inner: &Arc<EndpointInner>, frame: Frame) -> bool {
    let rpc_id = frame.rpc_id;
    let Some(header) = frame.call else {
        inner.fault(DisconnectReason::RpcInvalidResponse);
        return false;
    };

    let servant = match inner.registry.lookup_servant(header.servant_id) {
        Ok(servant) => servant,
        Err(_) => {
            warn!(
                endpoint = %inner.config.name,
                grain_id = %header.servant_id,
                method = %header.method,
                "call targets unknown servant"
            );
            let fault = Fault::no_such_servant(header.servant_id);
            inner
                .outbound
                .send_frame(&Frame::exception(rpc_id, encode_value(&fault)))
                .await;
            return true;
        }
    };

    if servant.interface_name() != header.interface {
        let fault = Fault::remote(
            "tether::InterfaceMismatch",
            format!(
                "grain {} implements {}, call declared {}",
                header.servant_id,
                servant.interface_name(),
                header.interface
            ),
        );
        inner
            .outbound
            .send_frame(&Frame::exception(rpc_id, encode_value(&fault)))
            .await;
        return true;
    }

    // Take a pool slot before spawning so a slow servant backs pressure up
    // to the read pump instead of piling up tasks.
    let permit = tokio::select! {
        biased;
        _ = inner.cancel.cancelled() => return false,
        permit = Arc::clone(&inner.dispatch_permits).acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return false,
        },
    };

    let outbound = inner.outbound.clone();
    let payload = frame.payload;
    tokio::spawn(async move {
        let _permit = permit;
        let result = servant
            .stub()
            .invoke(&header.method, PayloadReader::new(&payload))
            .await;
        let response = match result {
            Ok(ret) => Frame::ret(rpc_id, ret),
            Err(fault) => Frame::exception(
                rpc_id,
                encode_value(&fault.into_fault(&header.interface, &header.method)),
            ),
        };
        outbound.send_frame(&response).await;
    });
    true
}

async fn write_pump<W: FrameWriter>(
    inner: Arc<EndpointInner>,
    mut writer: W,
    mut outbound_rx: mpsc::Receiver<Vec<u8>>,
) {
    loop {
        let body = tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break,
            item = outbound_rx.recv() => match item {
                Some(body) => body,
                None => break,
            },
        };
        if let Err(e) = writer.send(&body).await {
            warn!(endpoint = %inner.config.name, error = %e, "write pump failed");
            inner.fault(DisconnectReason::UnhandledException);
            return;
        }
        inner.frames_written.fetch_add(1, Ordering::Relaxed);
        inner.pending.pool().put(body);
    }

    // The one frame still allowed after leaving Connected.
    let plan = std::mem::take(&mut *inner.goodbye.lock());
    if plan.send {
        let frame = Frame::goodbye(plan.reason.as_deref());
        if let Ok(body) = frame.encode() {
            if writer.send(&body).await.is_ok() {
                inner.frames_written.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
    let _ = writer.shutdown().await;
}
