//! Resolver and dialer producing sockets for outbound connections.

use crate::authority::Authority;
use crate::error::NetworkError;
use crate::net::socket::Socket;
use log::debug;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::watch;

/// Dials an endpoint, trying each resolved address in order.
pub struct Connector {
    connect_timeout: Duration,
    stop: watch::Sender<bool>,
}

impl Connector {
    /// Create a connector bounding each attempt by `connect_timeout`.
    pub fn new(connect_timeout: Duration) -> Self {
        let (stop, _) = watch::channel(false);
        Connector {
            connect_timeout,
            stop,
        }
    }

    /// Resolve `host:port` and dial the candidates in order.
    ///
    /// Resolves with the first socket that connects. Resolution failure maps
    /// to [`NetworkError::ResolveFailed`], candidate exhaustion to
    /// [`NetworkError::ConnectFailed`], and cancellation to
    /// [`NetworkError::ChannelStopped`].
    pub async fn connect(&self, endpoint: &str) -> Result<Socket, NetworkError> {
        let candidates: Vec<SocketAddr> = lookup_host(endpoint)
            .await
            .map_err(|error| {
                debug!("Failed to resolve {endpoint}: {error}");
                NetworkError::ResolveFailed
            })?
            .collect();

        if candidates.is_empty() {
            return Err(NetworkError::ResolveFailed);
        }

        self.dial(&candidates).await
    }

    /// Dial a known authority directly, skipping resolution.
    pub async fn connect_authority(&self, authority: &Authority) -> Result<Socket, NetworkError> {
        self.dial(&[authority.to_socket_addr()]).await
    }

    async fn dial(&self, candidates: &[SocketAddr]) -> Result<Socket, NetworkError> {
        let mut stopped = self.stop.subscribe();

        for candidate in candidates {
            if *stopped.borrow() {
                return Err(NetworkError::ChannelStopped);
            }

            let attempt = tokio::time::timeout(self.connect_timeout, TcpStream::connect(candidate));

            tokio::select! {
                _ = stopped.wait_for(|stop| *stop) => return Err(NetworkError::ChannelStopped),
                outcome = attempt => match outcome {
                    Ok(Ok(stream)) => return Socket::new(stream),
                    Ok(Err(error)) => {
                        debug!("Failed to connect {candidate}: {error}");
                    }
                    Err(_) => {
                        debug!("Connect attempt to {candidate} timed out");
                    }
                },
            }
        }

        Err(NetworkError::ConnectFailed)
    }

    /// Cancel any outstanding dial; idempotent.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }
}
