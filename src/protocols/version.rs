//! Version/verack handshake protocols.
//!
//! Three dialects share one engine, mirroring the protocol's history:
//!
//! * `version_31402` - the legacy exchange: send version, await the peer's
//!   version and verack, acknowledge.
//! * `version_70001` - adds the BIP-37 relay flag and lets the caller demand
//!   service bits of the peer (outbound sessions require `NODE_NETWORK`).
//! * `version_70002` - additionally answers an obsolete peer version with a
//!   BIP-61 reject before failing the handshake.
//!
//! The handshake completes successfully only after our version is sent and
//! the peer's version and verack have both arrived. On success the channel is
//! paused (still on the channel strand) so the owning session can attach the
//! steady-state protocols before resuming the read loop.

use crate::deadline::Deadline;
use crate::error::NetworkError;
use crate::net::Channel;
use crate::nonce::unix_timestamp;
use crate::p2p::Nonces;
use crate::protocols::level;
use crate::settings::Settings;
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::p2p::address::Address;
use bitcoin::p2p::message::NetworkMessage;
use bitcoin::p2p::message_network::{Reject, RejectReason, VersionMessage};
use bitcoin::p2p::ServiceFlags;
use log::debug;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

/// Resolves with the handshake outcome.
pub type HandshakeCompletion = oneshot::Receiver<Result<(), NetworkError>>;

struct State {
    sent_version: bool,
    received_version: bool,
    received_verack: bool,
    completion: Option<oneshot::Sender<Result<(), NetworkError>>>,
}

/// The version negotiation engine, parameterized per dialect.
pub struct Handshake {
    channel: Channel,
    settings: Arc<Settings>,
    nonces: Arc<Nonces>,
    minimum_services: u64,
    relay: bool,
    enable_reject: bool,
    state: Mutex<State>,
    deadline: Deadline,
}

impl Handshake {
    fn new(
        channel: Channel,
        settings: Arc<Settings>,
        nonces: Arc<Nonces>,
        minimum_services: u64,
        relay: bool,
        enable_reject: bool,
    ) -> Arc<Self> {
        let deadline = Deadline::new(channel.strand().clone());

        Arc::new(Handshake {
            channel,
            settings,
            nonces,
            minimum_services,
            relay,
            enable_reject,
            state: Mutex::new(State {
                sent_version: false,
                received_version: false,
                received_verack: false,
                completion: None,
            }),
            deadline,
        })
    }

    /// Attach the dialect matching the configured maximum version and run
    /// the handshake.
    pub fn attach(
        channel: Channel,
        settings: Arc<Settings>,
        nonces: Arc<Nonces>,
        minimum_services: u64,
    ) -> HandshakeCompletion {
        if settings.enable_reject && settings.protocol_maximum >= level::BIP61 {
            Handshake::version_70002(channel, settings, nonces, minimum_services).shake()
        } else if settings.protocol_maximum >= level::BIP37 {
            Handshake::version_70001(channel, settings, nonces, minimum_services).shake()
        } else {
            Handshake::version_31402(channel, settings, nonces, minimum_services).shake()
        }
    }

    /// Legacy handshake. The relay flag predates its BIP-37 definition but
    /// is carried on the wire regardless.
    pub fn version_31402(
        channel: Channel,
        settings: Arc<Settings>,
        nonces: Arc<Nonces>,
        minimum_services: u64,
    ) -> Arc<Self> {
        Handshake::new(channel, settings, nonces, minimum_services, true, false)
    }

    /// BIP-37 handshake: honors the configured relay preference.
    pub fn version_70001(
        channel: Channel,
        settings: Arc<Settings>,
        nonces: Arc<Nonces>,
        minimum_services: u64,
    ) -> Arc<Self> {
        let relay = settings.relay_transactions;
        Handshake::new(channel, settings, nonces, minimum_services, relay, false)
    }

    /// BIP-61 handshake: rejects obsolete peer versions explicitly.
    pub fn version_70002(
        channel: Channel,
        settings: Arc<Settings>,
        nonces: Arc<Nonces>,
        minimum_services: u64,
    ) -> Arc<Self> {
        let relay = settings.relay_transactions;
        Handshake::new(channel, settings, nonces, minimum_services, relay, true)
    }

    /// Run the handshake. The channel must be paused; the caller resumes it
    /// after attaching, which begins the exchange.
    pub fn shake(self: Arc<Self>) -> HandshakeCompletion {
        let (completion, receiver) = oneshot::channel();
        self.state.lock().expect("handshake poisoned").completion = Some(completion);

        if self.settings.protocol_minimum < level::MINIMUM
            || self.settings.protocol_minimum > self.settings.protocol_maximum
        {
            debug!("Invalid protocol version configuration");
            self.complete(Err(NetworkError::InvalidConfiguration));
            return receiver;
        }

        let handshake = self.clone();
        let subscribed = self.channel.subscribe(
            "version",
            Box::new(move |event| match event {
                Ok(NetworkMessage::Version(version)) => handshake.handle_version(version),
                Ok(_) => true,
                Err(code) => {
                    handshake.complete(Err(code));
                    false
                }
            }),
        );
        if subscribed.is_err() {
            self.complete(Err(NetworkError::ChannelStopped));
            return receiver;
        }

        let handshake = self.clone();
        let subscribed = self.channel.subscribe(
            "verack",
            Box::new(move |event| match event {
                Ok(NetworkMessage::Verack) => handshake.handle_verack(),
                Ok(_) => true,
                Err(code) => {
                    handshake.complete(Err(code));
                    false
                }
            }),
        );
        if subscribed.is_err() {
            self.complete(Err(NetworkError::ChannelStopped));
            return receiver;
        }

        let handshake = self.clone();
        self.channel.send_with(
            self.version_message(),
            Box::new(move |result| match result {
                Ok(()) => handshake.handle_sent_version(),
                Err(code) => handshake.complete(Err(code)),
            }),
        );

        receiver
    }

    fn version_message(&self) -> NetworkMessage {
        let peer = self.channel.authority().to_socket_addr();
        let receiver = Address::new(&peer, ServiceFlags::NONE);

        // Advertise the inbound port when listening, a null endpoint when not.
        let sender_port = if self.settings.inbound_enabled {
            self.settings.inbound_port
        } else {
            0
        };
        let local = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), sender_port);
        let sender = Address::new(&local, self.settings.services);

        NetworkMessage::Version(VersionMessage {
            version: self.settings.protocol_maximum,
            services: self.settings.services,
            timestamp: unix_timestamp(),
            receiver,
            sender,
            nonce: self.channel.nonce(),
            user_agent: self.settings.user_agent.clone(),
            start_height: self.settings.start_height,
            relay: self.relay,
        })
    }

    fn handle_sent_version(self: Arc<Self>) {
        {
            let mut state = self.state.lock().expect("handshake poisoned");
            state.sent_version = true;
        }

        let handshake = self.clone();
        self.deadline
            .start(self.settings.channel_handshake, move |result| {
                if result.is_ok() {
                    handshake.handle_timer();
                }
            });

        self.check_complete();
    }

    fn handle_timer(&self) {
        let pending = self
            .state
            .lock()
            .expect("handshake poisoned")
            .completion
            .is_some();

        if pending {
            debug!(
                "Handshake timed out on [{}]",
                self.channel.authority()
            );
            self.complete(Err(NetworkError::ChannelTimeout));
        }
    }

    fn handle_version(&self, version: &VersionMessage) -> bool {
        {
            let mut state = self.state.lock().expect("handshake poisoned");
            if state.received_version {
                drop(state);
                self.complete(Err(NetworkError::ProtocolViolation));
                return false;
            }
            state.received_version = true;
        }

        // The peer presenting one of our outstanding nonces is a loopback.
        if self.nonces.pended(version.nonce) {
            debug!(
                "Connection to self detected on [{}]",
                self.channel.authority()
            );
            self.complete(Err(NetworkError::ChannelConflict));
            return false;
        }

        let services = version.services.to_u64();
        if services & self.settings.invalid_services.to_u64() != 0 {
            self.complete(Err(NetworkError::ProtocolViolation));
            return false;
        }
        if services & self.minimum_services != self.minimum_services {
            debug!(
                "Insufficient peer services ({services:x}) on [{}]",
                self.channel.authority()
            );
            self.complete(Err(NetworkError::ProtocolViolation));
            return false;
        }

        if version.version < self.settings.protocol_minimum {
            debug!(
                "Insufficient peer version ({}) on [{}]",
                version.version,
                self.channel.authority()
            );
            if self.enable_reject {
                self.channel.send(NetworkMessage::Reject(Reject {
                    message: "version".into(),
                    ccode: RejectReason::Obsolete,
                    reason: "insufficient peer version".into(),
                    hash: sha256d::Hash::all_zeros(),
                }));
            }
            self.complete(Err(NetworkError::ProtocolViolation));
            return false;
        }

        self.channel.set_peer_version(version.version);
        self.channel.set_peer_services(services);
        self.channel
            .set_negotiated_version(self.settings.protocol_maximum.min(version.version));

        self.channel.send(NetworkMessage::Verack);
        self.check_complete();
        true
    }

    fn handle_verack(&self) -> bool {
        {
            let mut state = self.state.lock().expect("handshake poisoned");
            if !state.sent_version || state.received_verack {
                drop(state);
                self.complete(Err(NetworkError::ProtocolViolation));
                return false;
            }
            state.received_verack = true;
        }

        self.check_complete();
        true
    }

    fn check_complete(&self) {
        let done = {
            let state = self.state.lock().expect("handshake poisoned");
            state.sent_version && state.received_version && state.received_verack
        };

        if done {
            self.complete(Ok(()));
        }
    }

    // First caller gets the completion; late failures stop the channel.
    fn complete(&self, result: Result<(), NetworkError>) {
        self.deadline.stop();

        let completion = self
            .state
            .lock()
            .expect("handshake poisoned")
            .completion
            .take();

        match completion {
            Some(completion) => {
                if result.is_ok() {
                    // Hold the read loop until steady-state protocols attach.
                    self.channel.pause();
                }
                let _ = completion.send(result);
            }
            None => {
                if let Err(code) = result {
                    self.channel.stop(code);
                }
            }
        }
    }
}
