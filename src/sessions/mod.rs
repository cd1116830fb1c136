//! Session family: controllers that create channels, drive their handshakes
//! and manage retry.
//!
//! The base contract lives in the [`Session`] trait as provided methods over
//! a small set of hooks. [`Session::start_channel`] carries a channel from
//! creation through nonce pending, handshake, registration and protocol
//! attachment; [`Session::watch_channel`] observes its death and deregisters
//! it. Each concrete session composes the two around its own dial or accept
//! cadence.

mod inbound;
mod manual;
mod outbound;
mod seed;

pub use inbound::InboundSession;
pub use manual::ManualSession;
pub use outbound::OutboundSession;
pub use seed::SeedSession;

use crate::error::NetworkError;
use crate::net::Channel;
use crate::p2p::NetworkInner;
use crate::protocols::{
    level, Handshake, HandshakeCompletion, ProtocolAddressIn31402, ProtocolAddressOut31402,
    ProtocolAlert311, ProtocolPing31402, ProtocolPing60001, ProtocolReject70002,
};
use crate::settings::Settings;
use bitcoin::p2p::ServiceFlags;
use log::debug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

const CREATED: u8 = 0;
const STARTED: u8 = 1;
const STOPPED: u8 = 2;

/// State shared by every session variant.
pub struct SessionContext {
    network: Arc<NetworkInner>,
    state: AtomicU8,
    stop: watch::Sender<bool>,
    pending: Mutex<HashMap<u64, Channel>>,
}

impl SessionContext {
    pub(crate) fn new(network: Arc<NetworkInner>) -> Self {
        let (stop, _) = watch::channel(false);

        SessionContext {
            network,
            state: AtomicU8::new(CREATED),
            stop,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn network(&self) -> &Arc<NetworkInner> {
        &self.network
    }

    pub(crate) fn settings(&self) -> &Arc<Settings> {
        &self.network.settings
    }

    /// Transition created -> started; started sessions cannot start twice.
    pub(crate) fn start(&self) -> Result<(), NetworkError> {
        self.state
            .compare_exchange(CREATED, STARTED, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| NetworkError::OperationFailed)
    }

    /// Whether the session is not currently running.
    pub fn stopped(&self) -> bool {
        self.state.load(Ordering::SeqCst) != STARTED
    }

    /// Stop the session: cancel waits, stop pending channels, clear them.
    pub(crate) fn stop(&self) {
        self.state.store(STOPPED, Ordering::SeqCst);
        let _ = self.stop.send(true);

        let pending = {
            let mut pending = self.pending.lock().expect("session poisoned");
            std::mem::take(&mut *pending)
        };

        for channel in pending.into_values() {
            channel.stop(NetworkError::ServiceStopped);
        }
    }

    pub(crate) fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    /// Sleep the retry delay; false when the session stopped while waiting.
    pub(crate) async fn delay(&self, duration: Duration) -> bool {
        let mut stop = self.stop_signal();

        tokio::select! {
            _ = stop.wait_for(|stop| *stop) => false,
            _ = tokio::time::sleep(duration) => !self.stopped(),
        }
    }

    fn pend_channel(&self, channel: &Channel) {
        self.pending
            .lock()
            .expect("session poisoned")
            .insert(channel.id(), channel.clone());
    }

    fn unpend_channel(&self, channel: &Channel) {
        self.pending
            .lock()
            .expect("session poisoned")
            .remove(&channel.id());
    }

    /// Number of channels currently mid-handshake.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("session poisoned").len()
    }
}

/// Base contract of the session family.
#[allow(async_fn_in_trait)]
pub trait Session: Send + Sync + Sized + 'static {
    /// The shared session state.
    fn context(&self) -> &SessionContext;

    /// Whether this session's channels are accepted rather than dialed.
    fn inbound(&self) -> bool;

    /// Whether stored channels broadcast connect/stop events.
    fn notify(&self) -> bool;

    /// Service bits demanded of the peer during the handshake.
    ///
    /// Outbound sessions require a network-serving node (plus witness when
    /// we serve witness ourselves); inbound sessions demand nothing, since
    /// zero-service listeners are commonplace.
    fn minimum_services(&self) -> u64 {
        if self.inbound() {
            0
        } else {
            let own = self.context().settings().services.to_u64();
            (own & ServiceFlags::WITNESS.to_u64()) | ServiceFlags::NETWORK.to_u64()
        }
    }

    /// Attach the version handshake protocol to a paused channel.
    fn attach_handshake(&self, channel: &Channel) -> HandshakeCompletion {
        let context = self.context();

        Handshake::attach(
            channel.clone(),
            context.settings().clone(),
            context.network().nonces.clone(),
            self.minimum_services(),
        )
    }

    /// Attach the steady-state protocols to a paused, handshaken channel.
    fn attach_protocols(&self, channel: &Channel) {
        let context = self.context();
        let settings = context.settings();
        let pool = context.network().pool.clone();
        let negotiated = channel.negotiated_version();
        let heartbeat = settings.channel_heartbeat;

        if negotiated >= level::BIP31 {
            ProtocolPing60001::new(channel.clone(), heartbeat).start();
        } else {
            ProtocolPing31402::new(channel.clone(), heartbeat).start();
        }

        // Alert is deprecated; reject arrived at bip61 and followed it.
        if settings.enable_alert {
            ProtocolAlert311::new(channel.clone()).start();
        }
        if settings.enable_reject && negotiated >= level::BIP61 {
            ProtocolReject70002::new(channel.clone()).start();
        }

        ProtocolAddressIn31402::new(channel.clone(), pool.clone(), settings.clone()).start();
        ProtocolAddressOut31402::new(channel.clone(), pool).start();
    }

    /// Drive a channel through handshake and registration.
    ///
    /// On success the channel is stored in the registry with its protocols
    /// attached and reading; pair with [`Session::watch_channel`]. On failure
    /// the channel is stopped with the returned code and never stored.
    async fn start_channel(&self, channel: &Channel) -> Result<(), NetworkError> {
        let context = self.context();

        if context.stopped() {
            channel.stop(NetworkError::ServiceStopped);
            return Err(NetworkError::ServiceStopped);
        }

        // Pend the shaking outbound nonce (unless it collides).
        if !self.inbound() && !context.network().nonces.pend(channel.nonce()) {
            channel.stop(NetworkError::ChannelConflict);
            return Err(NetworkError::ChannelConflict);
        }

        context.pend_channel(channel);

        let completion = self.attach_handshake(channel);
        // The channel is created paused; this begins the read loop.
        channel.resume();

        let result = completion.await.unwrap_or(Err(NetworkError::ChannelStopped));

        context.unpend_channel(channel);
        if !self.inbound() {
            context.network().nonces.unpend(channel.nonce());
        }

        // Prefer the channel's recorded reason over the generic close code.
        let result = result.map_err(|code| match code {
            NetworkError::ChannelStopped => {
                channel.stop_code().unwrap_or(NetworkError::ChannelStopped)
            }
            code => code,
        });

        let result = result.and_then(|()| {
            if context.stopped() {
                Err(NetworkError::ServiceStopped)
            } else {
                context
                    .network()
                    .store(channel, self.notify(), self.inbound())
            }
        });

        if let Err(code) = result {
            channel.stop(code);
            return Err(code);
        }

        // The handshake left the channel paused for protocol attachment.
        self.attach_protocols(channel);
        channel.resume();
        Ok(())
    }

    /// Await a stored channel's termination and deregister it.
    async fn watch_channel(&self, channel: &Channel) -> NetworkError {
        let code = channel.stopped().await;

        let unstored = self
            .context()
            .network()
            .unstore(channel, self.notify(), self.inbound());
        if unstored.is_err() {
            // Expected when close() drained the registry first.
            debug!(
                "Unstore failed to locate channel [{}] (ok on close)",
                channel.authority()
            );
        }

        code
    }
}
