//! The p2p orchestrator: sessions, channel registry, nonces, address pool.

use crate::authority::{AddressItem, Authority};
use crate::error::NetworkError;
use crate::net::{Channel, Socket};
use crate::nonce::generate_nonce;
use crate::pool::AddressPool;
use crate::sessions::{InboundSession, ManualSession, OutboundSession, SeedSession};
use crate::settings::Settings;
use crate::strand::Strand;
use crate::subscriber::{EventHandler, Subscriber};
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// How often the address pool is persisted while running.
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(300);

/// Outstanding outbound handshake nonces, for self-connect detection.
///
/// Every outbound handshake pends its version nonce here. A peer presenting
/// a pended nonce in *its* version message is this node talking to itself.
#[derive(Default)]
pub struct Nonces {
    pending: Mutex<HashSet<u64>>,
}

impl Nonces {
    /// Register an in-flight nonce. False on collision (or a zero nonce),
    /// which the session surfaces as a channel conflict.
    pub fn pend(&self, nonce: u64) -> bool {
        nonce != 0 && self.pending.lock().expect("nonces poisoned").insert(nonce)
    }

    /// Deregister after the handshake resolves. False when absent.
    pub fn unpend(&self, nonce: u64) -> bool {
        self.pending.lock().expect("nonces poisoned").remove(&nonce)
    }

    /// Whether the nonce is one of ours, still in flight.
    pub fn pended(&self, nonce: u64) -> bool {
        self.pending.lock().expect("nonces poisoned").contains(&nonce)
    }
}

/// Channel registration notifications broadcast to subscribers.
#[derive(Clone)]
pub enum ChannelEvent {
    /// A channel completed its handshake and entered the registry.
    Connect(Channel),
    /// A registered channel stopped and left the registry.
    Stop(Channel),
}

struct Registry {
    channels: HashMap<u64, Channel>,
    authorities: HashSet<Authority>,
    inbound: usize,
    outbound: usize,
}

/// Shared state behind the public [`P2p`] handle.
pub(crate) struct NetworkInner {
    pub(crate) settings: Arc<Settings>,
    pub(crate) pool: Arc<AddressPool>,
    pub(crate) nonces: Arc<Nonces>,
    registry: Mutex<Registry>,
    events: Subscriber<ChannelEvent>,
    ids: AtomicU64,
}

impl NetworkInner {
    fn new(settings: Settings) -> Arc<Self> {
        let settings = Arc::new(settings);
        let pool = Arc::new(AddressPool::new(
            settings.host_pool_capacity,
            settings.hosts_file.clone(),
        ));

        Arc::new(NetworkInner {
            settings,
            pool,
            nonces: Arc::new(Nonces::default()),
            registry: Mutex::new(Registry {
                channels: HashMap::new(),
                authorities: HashSet::new(),
                inbound: 0,
                outbound: 0,
            }),
            events: Subscriber::new(Strand::new()),
            ids: AtomicU64::new(1),
        })
    }

    /// Wrap a socket in a started (paused) channel with a fresh id and nonce.
    pub(crate) fn create_channel(&self, socket: Socket, inbound: bool) -> Channel {
        let id = self.ids.fetch_add(1, Ordering::Relaxed);
        let channel = Channel::new(socket, id, generate_nonce(), inbound, self.settings.clone());
        channel.start();
        channel
    }

    /// Register a handshaken channel, enforcing authority uniqueness.
    pub(crate) fn store(
        &self,
        channel: &Channel,
        notify: bool,
        inbound: bool,
    ) -> Result<(), NetworkError> {
        {
            let mut registry = self.registry.lock().expect("registry poisoned");

            if !registry.authorities.insert(channel.authority()) {
                return Err(NetworkError::AddressInUse);
            }

            registry.channels.insert(channel.id(), channel.clone());
            if inbound {
                registry.inbound += 1;
            } else {
                registry.outbound += 1;
            }
        }

        debug!("Stored channel [{}]", channel.authority());
        if notify {
            self.events.notify(ChannelEvent::Connect(channel.clone()));
        }

        Ok(())
    }

    /// Deregister a stored channel. Fails when the channel is not present,
    /// which outside of close() implies an accounting bug.
    pub(crate) fn unstore(
        &self,
        channel: &Channel,
        notify: bool,
        inbound: bool,
    ) -> Result<(), NetworkError> {
        {
            let mut registry = self.registry.lock().expect("registry poisoned");

            if registry.channels.remove(&channel.id()).is_none() {
                return Err(NetworkError::OperationFailed);
            }

            registry.authorities.remove(&channel.authority());
            if inbound {
                debug_assert!(registry.inbound > 0, "inbound counter underflow");
                registry.inbound = registry.inbound.saturating_sub(1);
            } else {
                debug_assert!(registry.outbound > 0, "outbound counter underflow");
                registry.outbound = registry.outbound.saturating_sub(1);
            }
        }

        debug!("Unstored channel [{}]", channel.authority());
        if notify {
            self.events.notify(ChannelEvent::Stop(channel.clone()));
        }

        Ok(())
    }

    /// Whether a channel to this authority is currently registered.
    pub(crate) fn connected(&self, authority: &Authority) -> bool {
        self.registry
            .lock()
            .expect("registry poisoned")
            .authorities
            .contains(authority)
    }

    pub(crate) fn channel_count(&self) -> usize {
        self.registry.lock().expect("registry poisoned").channels.len()
    }

    pub(crate) fn inbound_channel_count(&self) -> usize {
        self.registry.lock().expect("registry poisoned").inbound
    }

    pub(crate) fn outbound_channel_count(&self) -> usize {
        self.registry.lock().expect("registry poisoned").outbound
    }

    /// Empty the registry, zeroing the counters. Close-time only.
    fn drain_channels(&self) -> Vec<Channel> {
        let mut registry = self.registry.lock().expect("registry poisoned");
        registry.authorities.clear();
        registry.inbound = 0;
        registry.outbound = 0;
        registry.channels.drain().map(|(_, channel)| channel).collect()
    }
}

struct SessionSet {
    inbound: Arc<InboundSession>,
    seed: Arc<SeedSession>,
    outbound: Arc<OutboundSession>,
    manual: Arc<ManualSession>,
}

/// The peer-to-peer network service.
///
/// Owns the address pool, the channel registry and the session family.
/// Lifecycle: [`P2p::start`] brings the sessions up (inbound listener,
/// seeding, outbound dialing), [`P2p::run`] begins dialing the configured
/// manual peers, and [`P2p::close`] tears everything down in reverse order.
///
/// Must be created within a tokio runtime.
pub struct P2p {
    inner: Arc<NetworkInner>,
    sessions: Mutex<Option<SessionSet>>,
    closed: watch::Sender<bool>,
}

impl P2p {
    /// Create the service; nothing is dialed or bound until start.
    pub fn new(settings: Settings) -> Self {
        let (closed, _) = watch::channel(false);

        P2p {
            inner: NetworkInner::new(settings),
            sessions: Mutex::new(None),
            closed,
        }
    }

    /// The active configuration.
    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    /// Start the sessions: inbound, seed, outbound, manual, in that order.
    /// A session reporting [`NetworkError::Bypassed`] is not a failure; the
    /// first real failure short-circuits the sequence.
    pub async fn start(&self) -> Result<(), NetworkError> {
        if self.sessions.lock().expect("p2p poisoned").is_some() {
            return Err(NetworkError::OperationFailed);
        }

        self.inner.pool.load()?;

        let inbound = InboundSession::new(self.inner.clone());
        let seed = SeedSession::new(self.inner.clone());
        let outbound = OutboundSession::new(self.inner.clone());
        let manual = ManualSession::new(self.inner.clone());

        let started = async {
            Self::checked(inbound.clone().start().await)?;
            Self::checked(seed.clone().start().await)?;
            Self::checked(outbound.clone().start().await)?;
            Self::checked(manual.start())
        }
        .await;

        if let Err(code) = started {
            manual.stop();
            outbound.stop();
            seed.stop();
            inbound.stop();
            return Err(code);
        }

        *self.sessions.lock().expect("p2p poisoned") = Some(SessionSet {
            inbound,
            seed,
            outbound,
            manual,
        });

        self.spawn_snapshots();
        info!("Network started");
        Ok(())
    }

    fn checked(result: Result<(), NetworkError>) -> Result<(), NetworkError> {
        match result {
            Ok(()) | Err(NetworkError::Bypassed) => Ok(()),
            Err(code) => Err(code),
        }
    }

    /// Begin dialing the manual peers named in the configuration. Succeeds
    /// immediately; retries are internal to the manual session.
    pub async fn run(&self) -> Result<(), NetworkError> {
        let manual = {
            let sessions = self.sessions.lock().expect("p2p poisoned");
            match sessions.as_ref() {
                Some(sessions) => sessions.manual.clone(),
                None => return Err(NetworkError::OperationFailed),
            }
        };

        for peer in &self.inner.settings.peers {
            manual.clone().connect_detached(peer);
        }

        Ok(())
    }

    /// Dial a peer now and keep it connected, like a configured manual peer.
    /// Resolves once the first attempt lands a handshaken channel, or with
    /// [`NetworkError::ServiceStopped`] when the service stops first.
    pub async fn connect(&self, endpoint: &str) -> Result<(), NetworkError> {
        let manual = {
            let sessions = self.sessions.lock().expect("p2p poisoned");
            match sessions.as_ref() {
                Some(sessions) => sessions.manual.clone(),
                None => return Err(NetworkError::OperationFailed),
            }
        };

        manual.connect(endpoint).await
    }

    /// Subscribe to channel connect/stop events.
    pub fn subscribe(&self, handler: EventHandler<ChannelEvent>) -> Result<(), NetworkError> {
        self.inner.events.subscribe(handler)
    }

    /// The port the inbound session is listening on, when it is.
    pub fn inbound_port(&self) -> Option<u16> {
        let sessions = self.sessions.lock().expect("p2p poisoned");
        sessions.as_ref().and_then(|sessions| sessions.inbound.port())
    }

    /// Number of addresses in the pool.
    pub fn address_count(&self) -> usize {
        self.inner.pool.count()
    }

    /// Copy out up to `wanted` pool addresses.
    pub fn fetch(&self, wanted: usize) -> Vec<AddressItem> {
        self.inner.pool.fetch(wanted)
    }

    /// Remove one pool address for dialing.
    pub fn take(&self) -> Option<AddressItem> {
        self.inner.pool.take()
    }

    /// Merge addresses into the pool.
    pub fn save(&self, items: &[AddressItem]) -> usize {
        self.inner.pool.save(items)
    }

    /// Return a taken address after a failed connect.
    pub fn restore(&self, item: &AddressItem) {
        self.inner.pool.restore(item)
    }

    /// Register an outbound handshake nonce.
    pub fn pend(&self, nonce: u64) -> bool {
        self.inner.nonces.pend(nonce)
    }

    /// Deregister an outbound handshake nonce.
    pub fn unpend(&self, nonce: u64) -> bool {
        self.inner.nonces.unpend(nonce)
    }

    /// Number of registered channels.
    pub fn channel_count(&self) -> usize {
        self.inner.channel_count()
    }

    /// Number of registered inbound channels.
    pub fn inbound_channel_count(&self) -> usize {
        self.inner.inbound_channel_count()
    }

    /// Number of registered outbound channels.
    pub fn outbound_channel_count(&self) -> usize {
        self.inner.outbound_channel_count()
    }

    /// Stop the sessions (reverse start order), stop every registered
    /// channel, persist the address pool. Idempotent.
    pub async fn close(&self) {
        let sessions = self.sessions.lock().expect("p2p poisoned").take();
        let Some(sessions) = sessions else {
            return;
        };

        info!("Network closing");
        sessions.manual.stop();
        sessions.outbound.stop();
        sessions.seed.stop();
        sessions.inbound.stop();

        for channel in self.inner.drain_channels() {
            channel.stop(NetworkError::ServiceStopped);
        }

        self.inner.events.stop(NetworkError::ServiceStopped);
        let _ = self.closed.send(true);

        if let Err(error) = self.inner.pool.snapshot() {
            warn!("Failed to persist address pool on close: {error}");
        }
    }

    fn spawn_snapshots(&self) {
        let inner = self.inner.clone();
        let mut closed = self.closed.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = closed.wait_for(|closed| *closed) => return,
                    _ = tokio::time::sleep(SNAPSHOT_INTERVAL) => {
                        if let Err(error) = inner.pool.snapshot() {
                            warn!("Periodic address pool save failed: {error}");
                        }
                    }
                }
            }
        });
    }
}
