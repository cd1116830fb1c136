//! Listener producing sockets for inbound connections.

use crate::error::NetworkError;
use crate::net::socket::Socket;
use log::debug;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// A bound TCP listener with cancellable accept.
pub struct Acceptor {
    listener: TcpListener,
    stop: watch::Sender<bool>,
}

impl Acceptor {
    /// Bind the configured inbound port on all interfaces.
    pub async fn bind(port: u16) -> Result<Self, NetworkError> {
        let listener = TcpListener::bind(("::", port))
            .await
            .map_err(|error| {
                debug!("Failed to bind inbound port {port}: {error}");
                NetworkError::ListenFailed
            })?;

        let (stop, _) = watch::channel(false);
        Ok(Acceptor { listener, stop })
    }

    /// The locally bound port (useful when binding port zero).
    pub fn port(&self) -> u16 {
        self.listener
            .local_addr()
            .map(|address| address.port())
            .unwrap_or_default()
    }

    /// Accept one inbound connection.
    ///
    /// Resolves [`NetworkError::ChannelStopped`] when the acceptor is
    /// stopped; other failures classify as [`NetworkError::AcceptFailed`].
    pub async fn accept(&self) -> Result<Socket, NetworkError> {
        let mut stopped = self.stop.subscribe();

        tokio::select! {
            _ = stopped.wait_for(|stop| *stop) => Err(NetworkError::ChannelStopped),
            accepted = self.listener.accept() => {
                let (stream, _) = accepted.map_err(|error| {
                    debug!("Failed to accept inbound connection: {error}");
                    NetworkError::AcceptFailed
                })?;
                Socket::new(stream)
            }
        }
    }

    /// Cancel any outstanding accept; idempotent.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }
}
