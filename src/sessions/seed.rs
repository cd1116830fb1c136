//! Session bootstrapping the address pool from configured seeds.

use crate::error::NetworkError;
use crate::net::Connector;
use crate::p2p::NetworkInner;
use crate::sessions::{Session, SessionContext};
use log::{debug, info};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Contacts each configured seed once: short handshake, `getaddr`, a bounded
/// gossip collection window, then the channel is dropped.
///
/// Runs only when the pool is low. Reports success iff at least one seed
/// contributed an address.
pub struct SeedSession {
    context: SessionContext,
}

impl Session for SeedSession {
    fn context(&self) -> &SessionContext {
        &self.context
    }

    fn inbound(&self) -> bool {
        false
    }

    fn notify(&self) -> bool {
        false
    }

    // Seeds need only gossip; demand no services of them.
    fn minimum_services(&self) -> u64 {
        0
    }
}

impl SeedSession {
    pub(crate) fn new(network: Arc<NetworkInner>) -> Arc<Self> {
        Arc::new(SeedSession {
            context: SessionContext::new(network),
        })
    }

    /// Seed the pool, returning once every seed attempt has concluded.
    ///
    /// [`NetworkError::Bypassed`] when seeding is unnecessary (outbound
    /// dialing disabled, or the pool already holds enough addresses);
    /// [`NetworkError::SeedingUnsuccessful`] when no seed contributed.
    pub(crate) async fn start(self: Arc<Self>) -> Result<(), NetworkError> {
        let settings = self.context.settings().clone();
        let pool = self.context.network().pool.clone();

        if settings.outbound_connections == 0 || settings.host_pool_capacity == 0 {
            return Err(NetworkError::Bypassed);
        }

        if pool.count() >= settings.outbound_connections {
            return Err(NetworkError::Bypassed);
        }

        if settings.seeds.is_empty() {
            return if pool.count() > 0 {
                Err(NetworkError::Bypassed)
            } else {
                Err(NetworkError::SeedingUnsuccessful)
            };
        }

        self.context.start()?;
        let before = pool.count();
        info!("Seeding address pool from {} seeds", settings.seeds.len());

        let (done_tx, mut done_rx) = mpsc::channel(settings.seeds.len());
        for seed in settings.seeds.clone() {
            let session = self.clone();
            let done = done_tx.clone();
            tokio::spawn(async move {
                session.raise(seed).await;
                let _ = done.send(()).await;
            });
        }
        drop(done_tx);

        while done_rx.recv().await.is_some() {}
        self.context.stop();

        let seeded = pool.count().saturating_sub(before);
        if seeded > 0 {
            info!("Seeded {seeded} addresses");
            Ok(())
        } else {
            Err(NetworkError::SeedingUnsuccessful)
        }
    }

    /// Abort outstanding seed channels.
    pub(crate) fn stop(&self) {
        self.context.stop();
    }

    async fn raise(self: Arc<Self>, seed: String) {
        debug!("Contacting seed {seed}");
        let settings = self.context.settings().clone();
        let connector = Connector::new(settings.connect_timeout);
        let mut stop = self.context.stop_signal();

        let connected = tokio::select! {
            _ = stop.wait_for(|stop| *stop) => return,
            connected = connector.connect(&seed) => connected,
        };

        let socket = match connected {
            Ok(socket) => socket,
            Err(code) => {
                debug!("Seed {seed} unreachable: {code}");
                return;
            }
        };

        let channel = self.context.network().create_channel(socket, false);
        if let Err(code) = self.start_channel(&channel).await {
            debug!("Seed {seed} handshake failed: {code}");
            return;
        }

        // The address protocols are attached and soliciting; allow gossip to
        // land for the germination window, then let the channel go.
        tokio::select! {
            _ = stop.wait_for(|stop| *stop) => channel.stop(NetworkError::ServiceStopped),
            _ = tokio::time::sleep(settings.channel_germination) => {
                channel.stop(NetworkError::ChannelStopped)
            }
            _ = channel.stopped() => {}
        }

        let code = self.watch_channel(&channel).await;
        debug!("Seed channel {seed} closed: {code}");
    }
}
