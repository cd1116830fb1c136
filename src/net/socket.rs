//! Connected TCP socket with a resolved peer authority.

use crate::authority::Authority;
use crate::error::NetworkError;
use std::fmt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// A connected stream plus the peer authority it is connected to.
///
/// Produced by the [`Acceptor`](crate::net::Acceptor) and
/// [`Connector`](crate::net::Connector) and consumed by the channel, which
/// splits it into its read and write halves. TCP_NODELAY is enabled on every
/// socket: the protocol is many small messages where latency matters more
/// than bandwidth efficiency.
#[derive(Debug)]
pub struct Socket {
    stream: TcpStream,
    authority: Authority,
}

impl Socket {
    /// Wrap a connected stream, resolving the remote authority.
    pub(crate) fn new(stream: TcpStream) -> Result<Self, NetworkError> {
        stream
            .set_nodelay(true)
            .map_err(|error| NetworkError::from_io(&error))?;
        let authority = stream
            .peer_addr()
            .map_err(|error| NetworkError::from_io(&error))?
            .into();

        Ok(Socket { stream, authority })
    }

    /// The remote peer's authority.
    pub fn authority(&self) -> Authority {
        self.authority
    }

    /// Read exactly `buffer.len()` bytes.
    pub async fn read_exact(&mut self, buffer: &mut [u8]) -> Result<(), NetworkError> {
        self.stream
            .read_exact(buffer)
            .await
            .map(|_| ())
            .map_err(|error| NetworkError::from_io(&error))
    }

    /// Write all of `bytes`.
    pub async fn write_all(&mut self, bytes: &[u8]) -> Result<(), NetworkError> {
        self.stream
            .write_all(bytes)
            .await
            .map_err(|error| NetworkError::from_io(&error))
    }

    /// Close the connection, discarding any shutdown error.
    pub async fn stop(mut self) {
        let _ = self.stream.shutdown().await;
    }

    /// Split into halves for independent read and write tasks.
    pub(crate) fn into_split(self) -> (Authority, OwnedReadHalf, OwnedWriteHalf) {
        let (reader, writer) = self.stream.into_split();
        (self.authority, reader, writer)
    }
}

impl fmt::Display for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socket [{}]", self.authority)
    }
}
