//! Session maintaining the outbound connection slots.

use crate::error::NetworkError;
use crate::net::{Channel, Connector};
use crate::p2p::NetworkInner;
use crate::sessions::{Session, SessionContext};
use crate::settings::Settings;
use log::debug;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Maintains `outbound_connections` live channels by batch-dialing addresses
/// drawn from the pool.
///
/// Each slot races `connect_batch_size` dial attempts; the first success
/// cancels its siblings and the channel is driven through the handshake.
/// A batch where every attempt fails reports `connect_failed` (never the
/// last attempt's incidental code) and the slot re-batches after the retry
/// delay. A stopped channel re-batches immediately.
pub struct OutboundSession {
    context: SessionContext,
}

impl Session for OutboundSession {
    fn context(&self) -> &SessionContext {
        &self.context
    }

    fn inbound(&self) -> bool {
        false
    }

    fn notify(&self) -> bool {
        true
    }
}

impl OutboundSession {
    pub(crate) fn new(network: Arc<NetworkInner>) -> Arc<Self> {
        Arc::new(OutboundSession {
            context: SessionContext::new(network),
        })
    }

    /// Spawn the dialing slots.
    ///
    /// Succeeds without acting when outbound connections or the address pool
    /// are configured away; fails with [`NetworkError::AddressNotFound`] when
    /// there is nothing to dial.
    pub(crate) async fn start(self: Arc<Self>) -> Result<(), NetworkError> {
        let settings = self.context.settings();

        if settings.outbound_connections == 0 || settings.host_pool_capacity == 0 {
            return Ok(());
        }

        if self.context.network().pool.count() == 0 {
            return Err(NetworkError::AddressNotFound);
        }

        self.context.start()?;

        for slot in 0..settings.outbound_connections {
            let session = self.clone();
            tokio::spawn(session.run_slot(slot));
        }

        Ok(())
    }

    /// Stop dialing and stop pending channels.
    pub(crate) fn stop(&self) {
        self.context.stop();
    }

    async fn run_slot(self: Arc<Self>, slot: usize) {
        let retry = self.context.settings().connect_timeout;
        debug!("Outbound slot {slot} started");

        loop {
            if self.context.stopped() {
                break;
            }

            let channel = match self.batch_connect().await {
                Ok(channel) => channel,
                Err(NetworkError::ServiceStopped) => break,
                Err(code) => {
                    debug!("Outbound slot {slot} batch failed: {code}");
                    if !self.context.delay(retry).await {
                        break;
                    }
                    continue;
                }
            };

            match self.start_channel(&channel).await {
                Ok(()) => {
                    let code = self.watch_channel(&channel).await;
                    debug!(
                        "Outbound channel [{}] stopped: {code}",
                        channel.authority()
                    );
                    // Re-batch immediately to refill the slot.
                }
                Err(NetworkError::ServiceStopped) => break,
                Err(code) => {
                    debug!(
                        "Outbound channel [{}] failed: {code}",
                        channel.authority()
                    );
                    if !self.context.delay(retry).await {
                        break;
                    }
                }
            }
        }

        debug!("Outbound slot {slot} stopped");
    }

    /// Race one batch of dial attempts; first success wins.
    async fn batch_connect(&self) -> Result<Channel, NetworkError> {
        let settings = self.context.settings().clone();
        let batch = settings.connect_batch_size.max(1);

        let (results_tx, mut results_rx) = mpsc::channel(batch);
        let mut connectors = Vec::with_capacity(batch);

        for _ in 0..batch {
            let connector = Arc::new(Connector::new(settings.connect_timeout));
            connectors.push(connector.clone());

            let network = self.context.network().clone();
            let settings = settings.clone();
            let results = results_tx.clone();
            tokio::spawn(async move {
                let _ = results
                    .send(Self::dial(network, settings, connector).await)
                    .await;
            });
        }
        drop(results_tx);

        let mut stop = self.context.stop_signal();
        let mut failures = 0;

        let outcome = loop {
            tokio::select! {
                _ = stop.wait_for(|stop| *stop) => break Err(NetworkError::ServiceStopped),
                outcome = results_rx.recv() => match outcome {
                    None => break Err(NetworkError::ConnectFailed),
                    Some(Ok(channel)) => break Ok(channel),
                    Some(Err(_)) => {
                        failures += 1;
                        // Batch finished with no success.
                        if failures == batch {
                            break Err(NetworkError::ConnectFailed);
                        }
                    }
                }
            }
        };

        // First success wins: cancel the stragglers either way.
        for connector in &connectors {
            connector.stop();
        }
        Self::discard(results_rx);

        outcome
    }

    /// One dial attempt: draw an address, vet it, connect.
    async fn dial(
        network: Arc<NetworkInner>,
        settings: Arc<Settings>,
        connector: Arc<Connector>,
    ) -> Result<Channel, NetworkError> {
        let item = network.pool.take().ok_or(NetworkError::AddressNotFound)?;
        let authority = item.authority();

        if settings.blacklisted(&authority) {
            // Blocked addresses are dropped, not restored.
            return Err(NetworkError::AddressBlocked);
        }

        if network.connected(&authority) {
            network.pool.restore(&item);
            return Err(NetworkError::AddressInUse);
        }

        match connector.connect_authority(&authority).await {
            Ok(socket) => Ok(network.create_channel(socket, false)),
            Err(code) => {
                network.pool.restore(&item);
                Err(code)
            }
        }
    }

    /// Stop channels from attempts that lost the race.
    fn discard(mut results: mpsc::Receiver<Result<Channel, NetworkError>>) {
        tokio::spawn(async move {
            while let Some(outcome) = results.recv().await {
                if let Ok(channel) = outcome {
                    channel.stop(NetworkError::ChannelStopped);
                }
            }
        });
    }
}
