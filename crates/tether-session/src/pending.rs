//! The pending-methods queue: send-side multiplexer and response-waiter
//! registry.
//!
//! Every outgoing call flows through here. `enqueue_call` allocates the rpc
//! id, encodes the frame into a pooled buffer, registers the caller's
//! waiter and pushes the encoded body onto the bounded outbound channel the
//! write pump drains. Responses arrive via [`PendingCalls::complete`];
//! connection loss arrives via [`PendingCalls::cancel_all`].
//!
//! Cancellation travels the same oneshot a real response would, so the race
//! between a response and `cancel_all` resolves deterministically: whichever
//! removes the table entry first wins, and the loser is logged as an
//! unmatched response and discarded.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, warn};

use tether_wire::{Frame, GrainId, RpcId, RpcIdGenerator};

use crate::errors::{CallError, DisconnectReason};

/// How many encode buffers the free list keeps around.
const BUFFER_POOL_DEPTH: usize = 64;

/// What completed a pending call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// Plain return; the payload is the method result.
    Return,
    /// Exceptional return; the payload is a fault descriptor.
    Fault,
    /// Synthesized locally when the connection went down.
    ConnectionLost(DisconnectReason),
}

/// A completed call's response.
#[derive(Debug)]
pub struct Response {
    /// How the call completed.
    pub kind: ResponseKind,
    /// Payload bytes; empty for connection loss.
    pub payload: Vec<u8>,
}

/// Caller-side handle for one in-flight call.
///
/// Await [`PendingCall::wait`] for the response. Dropping the handle
/// abandons the call; a late response is then logged and discarded.
#[derive(Debug)]
pub struct PendingCall {
    rpc_id: RpcId,
    rx: oneshot::Receiver<Response>,
}

impl PendingCall {
    /// The id this call travels under.
    pub fn rpc_id(&self) -> RpcId {
        self.rpc_id
    }

    /// Wait for the peer's response (or the synthesized cancellation).
    pub async fn wait(self) -> Result<Response, CallError> {
        self.rx
            .await
            // The sender is dropped without a value only if the runtime is
            // torn down around us; surface that as a lost connection.
            .map_err(|_| CallError::ConnectionLost(DisconnectReason::UnhandledException))
    }
}

struct Waiter {
    tx: oneshot::Sender<Response>,
    // Held so the in-flight cap releases exactly when the entry dies.
    _permit: tokio::sync::OwnedSemaphorePermit,
}

struct Table {
    waiters: HashMap<i64, Waiter>,
    /// Cleared by `cancel_all`; enqueues after that point fail fast instead
    /// of parking a waiter nobody will ever wake.
    open: bool,
}

/// Free list of encode buffers.
///
/// The write pump returns buffers here after committing them to the stream,
/// so steady-state traffic does not allocate per call.
pub struct BufferPool {
    bufs: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    fn new() -> Self {
        Self {
            bufs: Mutex::new(Vec::new()),
        }
    }

    /// Take a recycled buffer, or a fresh one.
    pub fn take(&self) -> Vec<u8> {
        self.bufs.lock().pop().unwrap_or_default()
    }

    /// Return a buffer to the pool. Excess buffers are dropped.
    pub fn put(&self, buf: Vec<u8>) {
        let mut bufs = self.bufs.lock();
        if bufs.len() < BUFFER_POOL_DEPTH {
            bufs.push(buf);
        }
    }
}

/// Cheap handle for pushing encoded frames onto the outbound channel.
///
/// Used by the dispatch path for returns and heartbeat replies; shares the
/// buffer pool with the call path.
#[derive(Clone)]
pub struct OutboundSender {
    tx: mpsc::Sender<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl OutboundSender {
    /// Encode and enqueue a frame. Fails silently once the write pump is
    /// gone; by then the connection is already down.
    pub async fn send_frame(&self, frame: &Frame) {
        let buf = self.pool.take();
        match frame.encode_into(buf) {
            Ok(body) => {
                if self.tx.send(body).await.is_err() {
                    debug!(rpc_id = %frame.rpc_id, "outbound channel closed, frame dropped");
                }
            }
            Err(e) => {
                warn!(rpc_id = %frame.rpc_id, error = %e, "failed to encode outbound frame");
            }
        }
    }
}

/// The pending table plus the outbound queue feeding the write pump.
pub struct PendingCalls {
    table: Mutex<Table>,
    rpc_ids: RpcIdGenerator,
    in_flight: Arc<Semaphore>,
    outbound_tx: mpsc::Sender<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl PendingCalls {
    /// Create the queue and the receiving end the write pump will drain.
    pub fn new(max_in_flight: usize, outbound_depth: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(outbound_depth);
        (
            Self {
                table: Mutex::new(Table {
                    waiters: HashMap::new(),
                    open: true,
                }),
                rpc_ids: RpcIdGenerator::new(),
                in_flight: Arc::new(Semaphore::new(max_in_flight)),
                outbound_tx,
                pool: Arc::new(BufferPool::new()),
            },
            outbound_rx,
        )
    }

    /// Handle for the dispatch path to push frames through the same queue.
    pub fn outbound_sender(&self) -> OutboundSender {
        OutboundSender {
            tx: self.outbound_tx.clone(),
            pool: Arc::clone(&self.pool),
        }
    }

    /// The shared encode-buffer pool.
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Number of calls currently awaiting a response.
    pub fn len(&self) -> usize {
        self.table.lock().waiters.len()
    }

    /// Whether no calls are in flight.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue an outgoing call.
    ///
    /// Blocks while the in-flight cap is reached; the permit is released
    /// when the call completes or is cancelled. The encoded frame enters
    /// the bounded outbound FIFO, which preserves per-caller ordering.
    pub async fn enqueue_call(
        &self,
        servant_id: GrainId,
        interface: &str,
        method: &str,
        args: &[u8],
    ) -> Result<PendingCall, CallError> {
        let frame = |rpc_id| {
            Frame::call(rpc_id, servant_id, interface, method, Vec::new())
        };
        self.enqueue_inner(frame, args).await
    }

    /// Enqueue a heartbeat probe.
    ///
    /// Travels the queue like any call; the reply completes the waiter.
    pub async fn enqueue_probe(&self) -> Result<PendingCall, CallError> {
        self.enqueue_inner(Frame::heartbeat, &[]).await
    }

    async fn enqueue_inner(
        &self,
        make_frame: impl FnOnce(RpcId) -> Frame,
        args: &[u8],
    ) -> Result<PendingCall, CallError> {
        let permit = Arc::clone(&self.in_flight)
            .acquire_owned()
            .await
            .map_err(|_| CallError::NotConnected)?;

        let rpc_id = self.rpc_ids.next();
        let mut frame = make_frame(rpc_id);
        frame.payload = args.to_vec();
        let body = frame.encode_into(self.pool.take())?;

        let (tx, rx) = oneshot::channel();
        {
            let mut table = self.table.lock();
            if !table.open {
                return Err(CallError::NotConnected);
            }
            let prior = table.waiters.insert(
                rpc_id.raw(),
                Waiter {
                    tx,
                    _permit: permit,
                },
            );
            debug_assert!(prior.is_none(), "rpc id reused while in flight");
        }

        if self.outbound_tx.send(body).await.is_err() {
            // Write pump is gone; take the waiter back out so the table
            // does not leak an entry nobody will complete.
            self.table.lock().waiters.remove(&rpc_id.raw());
            return Err(CallError::NotConnected);
        }

        debug!(%rpc_id, "call enqueued");
        Ok(PendingCall { rpc_id, rx })
    }

    /// Route an incoming response to its waiter.
    ///
    /// Returns whether an outstanding call matched. Unmatched responses are
    /// the caller's cue to log and move on; they typically arise from a
    /// race with cancellation and are never fatal.
    pub fn complete(&self, rpc_id: RpcId, kind: ResponseKind, payload: Vec<u8>) -> bool {
        let waiter = self.table.lock().waiters.remove(&rpc_id.raw());
        match waiter {
            Some(waiter) => {
                // A dropped receiver just means the caller gave up waiting.
                let _ = waiter.tx.send(Response { kind, payload });
                true
            }
            None => false,
        }
    }

    /// Drop the waiter for a call the caller gave up on (a local timeout
    /// raced the response). A response arriving later is then unmatched.
    pub fn abandon(&self, rpc_id: RpcId) -> bool {
        self.table.lock().waiters.remove(&rpc_id.raw()).is_some()
    }

    /// Fail every pending call with a synthesized connection-loss response
    /// and refuse new enqueues.
    pub fn cancel_all(&self, reason: DisconnectReason) {
        let drained: Vec<Waiter> = {
            let mut table = self.table.lock();
            table.open = false;
            table.waiters.drain().map(|(_, w)| w).collect()
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), %reason, "cancelling pending calls");
        }
        for waiter in drained {
            let _ = waiter.tx.send(Response {
                kind: ResponseKind::ConnectionLost(reason),
                payload: Vec::new(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> (PendingCalls, mpsc::Receiver<Vec<u8>>) {
        PendingCalls::new(1000, 64)
    }

    #[tokio::test]
    async fn enqueue_emits_encoded_call_frames_in_order() {
        let (pending, mut rx) = queue();
        let a = pending
            .enqueue_call(GrainId::new(1), "I", "first", &[1])
            .await
            .unwrap();
        let b = pending
            .enqueue_call(GrainId::new(1), "I", "second", &[2])
            .await
            .unwrap();
        assert!(a.rpc_id() < b.rpc_id());

        let first = Frame::decode(&rx.recv().await.unwrap()).unwrap();
        let second = Frame::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(first.call.as_ref().unwrap().method, "first");
        assert_eq!(second.call.as_ref().unwrap().method, "second");
        assert_eq!(first.rpc_id, a.rpc_id());
        assert_eq!(second.rpc_id, b.rpc_id());
    }

    #[tokio::test]
    async fn complete_wakes_the_matching_waiter() {
        let (pending, _rx) = queue();
        let call = pending
            .enqueue_call(GrainId::new(1), "I", "m", &[])
            .await
            .unwrap();
        let rpc_id = call.rpc_id();

        assert!(pending.complete(rpc_id, ResponseKind::Return, vec![5]));
        let response = call.wait().await.unwrap();
        assert_eq!(response.kind, ResponseKind::Return);
        assert_eq!(response.payload, vec![5]);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn unmatched_responses_report_false() {
        let (pending, _rx) = queue();
        assert!(!pending.complete(RpcId::new(99), ResponseKind::Return, vec![]));
    }

    #[tokio::test]
    async fn cancel_all_fails_every_waiter_and_empties_the_table() {
        let (pending, _rx) = queue();
        let mut calls = Vec::new();
        for _ in 0..10 {
            calls.push(
                pending
                    .enqueue_call(GrainId::new(1), "I", "m", &[])
                    .await
                    .unwrap(),
            );
        }
        pending.cancel_all(DisconnectReason::ReadFailure);
        assert!(pending.is_empty());

        for call in calls {
            let response = call.wait().await.unwrap();
            assert_eq!(
                response.kind,
                ResponseKind::ConnectionLost(DisconnectReason::ReadFailure)
            );
        }

        // The queue is closed for business afterwards.
        let err = pending
            .enqueue_call(GrainId::new(1), "I", "m", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::NotConnected));
    }

    #[tokio::test]
    async fn response_after_cancel_is_unmatched() {
        let (pending, _rx) = queue();
        let call = pending
            .enqueue_call(GrainId::new(1), "I", "m", &[])
            .await
            .unwrap();
        let rpc_id = call.rpc_id();
        pending.cancel_all(DisconnectReason::RequestedByRemoteEndPoint);

        // The real response lost the race; it must not complete anything.
        assert!(!pending.complete(rpc_id, ResponseKind::Return, vec![1]));
        let response = call.wait().await.unwrap();
        assert_eq!(
            response.kind,
            ResponseKind::ConnectionLost(DisconnectReason::RequestedByRemoteEndPoint)
        );
    }

    #[tokio::test]
    async fn in_flight_cap_blocks_the_caller_until_drain() {
        let (pending, _rx) = PendingCalls::new(2, 64);
        let _a = pending
            .enqueue_call(GrainId::new(1), "I", "m", &[])
            .await
            .unwrap();
        let b = pending
            .enqueue_call(GrainId::new(1), "I", "m", &[])
            .await
            .unwrap();

        // Third enqueue parks on the semaphore.
        let third = pending.enqueue_call(GrainId::new(1), "I", "m", &[]);
        tokio::pin!(third);
        assert!(futures_util::poll!(third.as_mut()).is_pending());

        // Completing one call frees a slot.
        assert!(pending.complete(b.rpc_id(), ResponseKind::Return, vec![]));
        let _ = b.wait().await.unwrap();
        let call = third.await.unwrap();
        assert!(call.rpc_id().raw() > 0);
    }

    #[tokio::test]
    async fn rpc_ids_are_strictly_increasing_across_concurrent_enqueues() {
        let (pending, mut rx) = PendingCalls::new(1000, 1000);
        let pending = Arc::new(pending);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pending = Arc::clone(&pending);
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    pending
                        .enqueue_call(GrainId::new(1), "I", "m", &[])
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut seen = std::collections::HashSet::new();
        while let Ok(body) = rx.try_recv() {
            let frame = Frame::decode(&body).unwrap();
            assert!(seen.insert(frame.rpc_id.raw()), "duplicate rpc id emitted");
        }
        assert_eq!(seen.len(), 400);
        assert_eq!(pending.len(), 400);
    }
}
