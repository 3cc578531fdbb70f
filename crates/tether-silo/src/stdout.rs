//! The child's stdout boot protocol.
//!
//! Strict and line-delimited: `booting`, then the decimal port, then
//! `ready`. The port line must immediately precede `ready`; any other line
//! in the handshake window rejects the boot, so a chatty child cannot have
//! a stray log line mistaken for its port. After `ready` the child may
//! print anything (the parent forwards it), and says `goodbye` on clean
//! shutdown.

use std::fmt;

use tokio::io::{AsyncBufRead, Lines};

/// First line a child prints.
pub const LINE_BOOTING: &str = "booting";
/// Printed once the listener is up and the port line is out.
pub const LINE_READY: &str = "ready";
/// Printed on clean shutdown.
pub const LINE_GOODBYE: &str = "goodbye";

/// Why the boot handshake was rejected.
#[derive(Debug)]
pub enum BootError {
    /// The child printed something other than the expected line.
    UnexpectedLine {
        /// What the protocol called for.
        expected: &'static str,
        /// What actually arrived.
        line: String,
    },
    /// The port line was not a usable decimal port.
    InvalidPort(String),
    /// The child's stdout ended mid-handshake.
    StreamEnded,
    /// Reading stdout failed.
    Io(std::io::Error),
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootError::UnexpectedLine { expected, line } => {
                write!(f, "expected {expected:?} on child stdout, got {line:?}")
            }
            BootError::InvalidPort(line) => write!(f, "invalid port line {line:?}"),
            BootError::StreamEnded => write!(f, "child stdout ended during boot handshake"),
            BootError::Io(e) => write!(f, "reading child stdout: {e}"),
        }
    }
}

impl std::error::Error for BootError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BootError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for BootError {
    fn from(e: std::io::Error) -> Self {
        BootError::Io(e)
    }
}

async fn next_line<R>(lines: &mut Lines<R>) -> Result<String, BootError>
where
    R: AsyncBufRead + Unpin,
{
    lines.next_line().await?.ok_or(BootError::StreamEnded)
}

/// Read the three-line boot handshake and return the child's port.
pub async fn read_boot_handshake<R>(lines: &mut Lines<R>) -> Result<u16, BootError>
where
    R: AsyncBufRead + Unpin,
{
    let first = next_line(lines).await?;
    if first != LINE_BOOTING {
        return Err(BootError::UnexpectedLine {
            expected: LINE_BOOTING,
            line: first,
        });
    }

    let port_line = next_line(lines).await?;
    let port: u16 = port_line
        .trim()
        .parse()
        .map_err(|_| BootError::InvalidPort(port_line.clone()))?;
    if port == 0 {
        return Err(BootError::InvalidPort(port_line));
    }

    let third = next_line(lines).await?;
    if third != LINE_READY {
        return Err(BootError::UnexpectedLine {
            expected: LINE_READY,
            line: third,
        });
    }
    Ok(port)
}
