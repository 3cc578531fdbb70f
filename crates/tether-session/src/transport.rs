//! Transport contract the endpoint pumps run against.
//!
//! The endpoint never touches sockets directly: the read pump owns a
//! [`FrameReader`], the write pump owns a [`FrameWriter`], and nothing else
//! may use either half. `tether-stream` provides the byte-stream
//! implementation; the in-memory pair here backs tests and in-process silos.
//!
//! Writers take pre-encoded frame bodies. The pending-methods queue encodes
//! calls into pooled buffers at enqueue time, so by the time a frame reaches
//! the write pump there is nothing left to serialize.

use std::future::Future;
use std::io;

use tokio::sync::mpsc;

use tether_wire::Frame;

/// Receiving half of a connection. Owned exclusively by the read pump.
pub trait FrameReader: Send + 'static {
    /// Receive the next frame.
    ///
    /// Resolves to `Ok(None)` on clean end-of-stream at a frame boundary.
    /// A partial frame at end-of-stream is an error, never silent
    /// truncation. Structural violations (oversized frame, unknown kind)
    /// surface as `io::ErrorKind::InvalidData`.
    fn recv(&mut self) -> impl Future<Output = io::Result<Option<Frame>>> + Send;
}

/// Sending half of a connection. Owned exclusively by the write pump.
pub trait FrameWriter: Send + 'static {
    /// Write one already-encoded frame body and flush it.
    ///
    /// Atomic at frame granularity: an error means the frame cannot be
    /// assumed committed and the connection is done for.
    fn send(&mut self, body: &[u8]) -> impl Future<Output = io::Result<()>> + Send;

    /// Flush and close the sending half.
    fn shutdown(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}

/// Receiving half of an in-memory connection.
pub struct MemoryReader {
    rx: mpsc::Receiver<Vec<u8>>,
}

/// Sending half of an in-memory connection.
pub struct MemoryWriter {
    tx: Option<mpsc::Sender<Vec<u8>>>,
}

impl FrameReader for MemoryReader {
    async fn recv(&mut self) -> io::Result<Option<Frame>> {
        match self.rx.recv().await {
            None => Ok(None),
            Some(body) => Frame::decode(&body)
                .map(Some)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
        }
    }
}

impl FrameWriter for MemoryWriter {
    async fn send(&mut self, body: &[u8]) -> io::Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "writer shut down"))?;
        tx.send(body.to_vec())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer reader gone"))
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.tx = None;
        Ok(())
    }
}

/// Create a connected pair of in-memory transports.
///
/// Bodies still round-trip through [`Frame::encode`]/[`Frame::decode`], so
/// the wire contract is exercised even without a socket.
pub fn memory_pair(depth: usize) -> ((MemoryReader, MemoryWriter), (MemoryReader, MemoryWriter)) {
    let (a_tx, b_rx) = mpsc::channel(depth);
    let (b_tx, a_rx) = mpsc::channel(depth);
    (
        (MemoryReader { rx: a_rx }, MemoryWriter { tx: Some(a_tx) }),
        (MemoryReader { rx: b_rx }, MemoryWriter { tx: Some(b_tx) }),
    )
}
