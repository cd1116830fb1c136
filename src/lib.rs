//! Peer-to-peer networking core for a bitcoin full node.
//!
//! This crate maintains a live mesh of TCP connections speaking the bitcoin
//! wire protocol: it accepts inbound connections, dials outbound peers in
//! racing batches, keeps operator-configured peers connected, and bootstraps
//! its address pool from seeds. Over each connection it multiplexes the
//! version handshake and the per-peer sub-protocols (ping/pong, address
//! gossip, reject, alert) through a typed publish/subscribe.
//!
//! [`P2p`] is the service entry point. Message (de)serialization is
//! delegated to the [`bitcoin`] crate; this crate owns framing, validation
//! and everything above it.
//!
//! # Example
//!
//! Connecting to a single peer and watching the mesh:
//!
//! ```no_run
//! use bitcoin_peers_network::{ChannelEvent, NetworkError, P2p, Settings};
//!
//! # async fn example() -> Result<(), NetworkError> {
//! let mut settings = Settings::default();
//! settings.peers.push("198.51.100.7:8333".to_string());
//!
//! let network = P2p::new(settings);
//! network.start().await?;
//!
//! network.subscribe(Box::new(|event| {
//!     match event {
//!         Ok(ChannelEvent::Connect(channel)) => println!("up: {channel}"),
//!         Ok(ChannelEvent::Stop(channel)) => println!("down: {channel}"),
//!         Err(_) => return false,
//!     }
//!     true
//! }))?;
//!
//! network.run().await?;
//! # Ok(())
//! # }
//! ```

mod authority;
mod deadline;
mod error;
mod net;
mod nonce;
mod p2p;
mod pool;
mod settings;
mod strand;
mod subscriber;
mod transport;

pub mod protocols;
pub mod sessions;

pub use authority::{AddressItem, Authority};
pub use deadline::Deadline;
pub use error::NetworkError;
pub use net::{Acceptor, Channel, Connector, MessageHandler, SendHandler, Socket, StopHandler};
pub use p2p::{ChannelEvent, Nonces, P2p};
pub use pool::AddressPool;
pub use settings::{default_user_agent, Settings};
pub use strand::Strand;
pub use subscriber::{EventHandler, Subscriber};
pub use transport::{TransportReader, TransportWriter, HEADING_SIZE};
