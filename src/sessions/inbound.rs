//! Session accepting and vetting inbound connections.

use crate::error::NetworkError;
use crate::net::Acceptor;
use crate::p2p::NetworkInner;
use crate::sessions::{Session, SessionContext};
use log::{debug, info};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

/// Listens on the configured port, screens arrivals against the whitelist,
/// blacklist and connection cap, and drives accepted channels.
pub struct InboundSession {
    context: SessionContext,
    port: AtomicU16,
}

impl Session for InboundSession {
    fn context(&self) -> &SessionContext {
        &self.context
    }

    fn inbound(&self) -> bool {
        true
    }

    fn notify(&self) -> bool {
        true
    }
}

impl InboundSession {
    pub(crate) fn new(network: Arc<NetworkInner>) -> Arc<Self> {
        Arc::new(InboundSession {
            context: SessionContext::new(network),
            port: AtomicU16::new(0),
        })
    }

    /// The port actually bound, once listening.
    pub fn port(&self) -> Option<u16> {
        match self.port.load(Ordering::Relaxed) {
            0 => None,
            port => Some(port),
        }
    }

    /// Open the listener and begin the accept loop.
    ///
    /// Returns [`NetworkError::Bypassed`] when inbound connections are not
    /// configured.
    pub(crate) async fn start(self: Arc<Self>) -> Result<(), NetworkError> {
        let settings = self.context.settings().clone();

        if !settings.inbound_enabled || settings.inbound_connections == 0 {
            debug!("Not configured for inbound connections");
            return Err(NetworkError::Bypassed);
        }

        self.context.start()?;

        let acceptor = match Acceptor::bind(settings.inbound_port).await {
            Ok(acceptor) => acceptor,
            Err(code) => {
                self.context.stop();
                return Err(code);
            }
        };

        self.port.store(acceptor.port(), Ordering::Relaxed);
        info!(
            "Accepting up to {} connections on port {}",
            settings.inbound_connections,
            acceptor.port()
        );

        let session = self.clone();
        tokio::spawn(session.run(acceptor));
        Ok(())
    }

    /// Stop listening and stop pending channels.
    pub(crate) fn stop(&self) {
        self.context.stop();
    }

    async fn run(self: Arc<Self>, acceptor: Acceptor) {
        let mut stop = self.context.stop_signal();
        let settings = self.context.settings().clone();

        loop {
            let accepted = tokio::select! {
                _ = stop.wait_for(|stop| *stop) => break,
                accepted = acceptor.accept() => accepted,
            };

            let socket = match accepted {
                Ok(socket) => socket,
                Err(NetworkError::ChannelStopped) => break,
                Err(code) => {
                    debug!("Failed to accept inbound connection: {code}");
                    // Retry the listener after a delay.
                    if !self.context.delay(settings.connect_timeout).await {
                        break;
                    }
                    continue;
                }
            };

            // Listening resumes immediately; vetting happens per socket.
            let authority = socket.authority();

            if !settings.whitelisted(&authority) {
                debug!("Dropping not whitelisted connection [{authority}]");
                socket.stop().await;
                continue;
            }

            if settings.blacklisted(&authority) {
                debug!("Dropping blacklisted connection [{authority}]");
                socket.stop().await;
                continue;
            }

            if self.context.network().inbound_channel_count() >= settings.inbound_connections {
                debug!("Dropping oversubscribed connection [{authority}]");
                socket.stop().await;
                continue;
            }

            let channel = self.context.network().create_channel(socket, true);
            let session = self.clone();
            tokio::spawn(async move {
                match session.start_channel(&channel).await {
                    Ok(()) => {
                        let code = session.watch_channel(&channel).await;
                        debug!("Inbound channel [{}] stopped: {code}", channel.authority());
                    }
                    Err(code) => {
                        debug!("Inbound channel [{}] failed: {code}", channel.authority());
                    }
                }
            });
        }

        acceptor.stop();
        debug!("Inbound session stopped");
    }
}
