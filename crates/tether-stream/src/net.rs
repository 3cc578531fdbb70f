//! Connecting endpoints over byte streams: handshake exchange, TCP helpers.
//!
//! Both sides send their handshake block the instant the stream opens, then
//! read and validate the peer's. The exchange is symmetric, so the same
//! routine serves initiator and acceptor.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{debug, info};

use tether_session::{Endpoint, InvalidTransition};
use tether_wire::{Handshake, HandshakeError};

use crate::framing::{FrameRead, FrameWrite};

/// Why establishing a connection failed.
#[derive(Debug)]
pub enum ConnectError {
    /// Socket-level failure.
    Io(io::Error),
    /// The peer's handshake block was rejected.
    Handshake(HandshakeError),
    /// The handshake exchange did not complete in time.
    HandshakeTimeout,
    /// The socket connect did not complete in time.
    ConnectTimeout,
    /// The endpoint was not in a connectable state.
    Endpoint(InvalidTransition),
}

impl std::fmt::Display for ConnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectError::Io(e) => write!(f, "io error: {e}"),
            ConnectError::Handshake(e) => write!(f, "handshake failed: {e}"),
            ConnectError::HandshakeTimeout => write!(f, "handshake timed out"),
            ConnectError::ConnectTimeout => write!(f, "connect timed out"),
            ConnectError::Endpoint(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ConnectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectError::Io(e) => Some(e),
            ConnectError::Handshake(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ConnectError {
    fn from(e: io::Error) -> Self {
        ConnectError::Io(e)
    }
}

impl ConnectError {
    /// Whether the failure was a handshake rejection (magic, version or
    /// block structure) rather than plumbing.
    pub fn is_handshake_failure(&self) -> bool {
        matches!(
            self,
            ConnectError::Handshake(_) | ConnectError::HandshakeTimeout
        )
    }
}

/// Exchange handshake blocks on a fresh stream.
///
/// Sends ours, reads and validates the peer's, returns the peer's block.
/// The stream is unusable on error.
pub async fn exchange_handshake<S>(
    stream: &mut S,
    ours: &Handshake,
    timeout: Duration,
) -> Result<Handshake, ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(timeout, async {
        stream.write_all(&ours.encode()).await?;
        stream.flush().await?;

        let mut prefix = [0u8; Handshake::PREFIX_LEN];
        stream.read_exact(&mut prefix).await?;
        let name_len = Handshake::parse_prefix(&prefix).map_err(ConnectError::Handshake)?;
        let mut name = vec![0u8; name_len];
        stream.read_exact(&mut name).await?;
        let peer = Handshake::from_name_bytes(&name).map_err(ConnectError::Handshake)?;
        debug!(peer = %peer.name, "handshake complete");
        Ok(peer)
    })
    .await
    .map_err(|_| ConnectError::HandshakeTimeout)?
}

/// Run the handshake on an established stream and go live.
///
/// Works for initiator and acceptor alike, and for any byte stream. On
/// failure the endpoint falls back to `Disconnected`.
pub async fn establish<S>(endpoint: &Endpoint, mut stream: S) -> Result<(), ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    endpoint.begin_handshake().map_err(ConnectError::Endpoint)?;
    let ours = Handshake::new(endpoint.name());
    let peer = match exchange_handshake(&mut stream, &ours, endpoint.config().handshake_timeout)
        .await
    {
        Ok(peer) => peer,
        Err(e) => {
            endpoint.connect_failed();
            return Err(e);
        }
    };

    let max = endpoint.config().max_frame_size;
    let (read_half, write_half) = tokio::io::split(stream);
    endpoint
        .attach(
            FrameRead::new(read_half, max),
            FrameWrite::new(write_half, max),
            Some(peer.name),
        )
        .map_err(ConnectError::Endpoint)?;
    Ok(())
}

/// Connect an endpoint to a listening peer.
pub async fn connect<A>(
    endpoint: &Endpoint,
    addr: A,
    connect_timeout: Duration,
) -> Result<(), ConnectError>
where
    A: ToSocketAddrs,
{
    endpoint.begin_connect().map_err(ConnectError::Endpoint)?;
    let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            endpoint.connect_failed();
            return Err(ConnectError::Io(e));
        }
        Err(_) => {
            endpoint.connect_failed();
            return Err(ConnectError::ConnectTimeout);
        }
    };
    let _ = stream.set_nodelay(true);
    info!(peer_addr = ?stream.peer_addr().ok(), "stream connected");
    establish(endpoint, stream).await
}

/// A bound listener an endpoint accepts its single peer from.
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    /// Bind on the given address.
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        Ok(Self {
            inner: TcpListener::bind(addr).await?,
        })
    }

    /// The bound address (useful after binding port 0).
    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.inner.local_addr()
    }

    /// Accept one connection and bring the endpoint up on it.
    pub async fn accept(&self, endpoint: &Endpoint) -> Result<(), ConnectError> {
        let (stream, peer_addr) = self.inner.accept().await?;
        let _ = stream.set_nodelay(true);
        info!(%peer_addr, "stream accepted");
        establish(endpoint, stream).await
    }
}
