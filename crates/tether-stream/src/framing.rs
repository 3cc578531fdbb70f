//! Length-prefix framing over async byte streams.
//!
//! Each frame is a u32 little-endian length prefix (counting every byte
//! after itself) followed by the frame body. The module is generic over the
//! stream type: TCP sockets, duplex pipes in tests, anything
//! `AsyncRead + AsyncWrite`.
//!
//! Guarantees, both directions:
//! - reads block until a full frame is buffered or the stream ends;
//! - a partial frame at end-of-stream is an `UnexpectedEof` error, never a
//!   silent truncation;
//! - frames above the configured cap fail with `InvalidData` before any
//!   payload is materialised;
//! - writes commit a whole frame and flush, or fail.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use tether_session::transport::{FrameReader, FrameWriter};
use tether_wire::Frame;

const LEN_PREFIX: usize = 4;

/// Receiving half: decodes length-prefixed frames off a byte stream.
pub struct FrameRead<R> {
    stream: R,
    max_frame_size: u32,
}

impl<R> FrameRead<R> {
    /// Wrap the read half of a stream.
    pub fn new(stream: R, max_frame_size: u32) -> Self {
        Self {
            stream,
            max_frame_size,
        }
    }
}

impl<R> FrameRead<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    /// Read exactly `buf.len()` bytes.
    ///
    /// `eof_ok` permits a clean end-of-stream before the first byte; an end
    /// of stream after that is always an error.
    async fn read_full(&mut self, buf: &mut [u8], eof_ok: bool) -> io::Result<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.stream.read(&mut buf[filled..]).await?;
            if n == 0 {
                if filled == 0 && eof_ok {
                    return Ok(false);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "stream ended inside a frame ({filled} of {} bytes)",
                        buf.len()
                    ),
                ));
            }
            filled += n;
        }
        Ok(true)
    }
}

impl<R> FrameReader for FrameRead<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    async fn recv(&mut self) -> io::Result<Option<Frame>> {
        let mut prefix = [0u8; LEN_PREFIX];
        if !self.read_full(&mut prefix, true).await? {
            return Ok(None);
        }
        let len = u32::from_le_bytes(prefix);
        if len > self.max_frame_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "incoming frame of {len} bytes exceeds cap of {}",
                    self.max_frame_size
                ),
            ));
        }

        let mut body = vec![0u8; len as usize];
        self.read_full(&mut body, false).await?;
        trace!(len, "frame received");
        Frame::decode(&body).map(Some).map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidData, format!("frame body: {e}"))
        })
    }
}

/// Sending half: emits length-prefixed frames onto a byte stream.
pub struct FrameWrite<W> {
    stream: W,
    max_frame_size: u32,
}

impl<W> FrameWrite<W> {
    /// Wrap the write half of a stream.
    pub fn new(stream: W, max_frame_size: u32) -> Self {
        Self {
            stream,
            max_frame_size,
        }
    }
}

impl<W> FrameWriter for FrameWrite<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, body: &[u8]) -> io::Result<()> {
        if body.len() > self.max_frame_size as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "outgoing frame of {} bytes exceeds cap of {}",
                    body.len(),
                    self.max_frame_size
                ),
            ));
        }
        self.stream
            .write_all(&(body.len() as u32).to_le_bytes())
            .await?;
        self.stream.write_all(body).await?;
        self.stream.flush().await?;
        trace!(len = body.len(), "frame sent");
        Ok(())
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}
