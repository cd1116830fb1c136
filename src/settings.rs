//! Flat runtime configuration for the networking stack.

use crate::authority::Authority;
use bitcoin::p2p::Magic;
use bitcoin::p2p::ServiceFlags;
use std::path::PathBuf;
use std::time::Duration;

/// Default user agent advertised in version messages.
///
/// Format follows Bitcoin Core's convention: "/$NAME:$VERSION/".
pub fn default_user_agent() -> String {
    format!("/{}:{}/", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

/// Configuration for the p2p service and everything it owns.
///
/// All fields are plain data so an embedding application can populate the
/// struct from any configuration source. [`Settings::default`] yields a
/// mainnet configuration that accepts no inbound connections and dials no
/// peers until told otherwise.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Port to listen on for inbound connections.
    pub inbound_port: u16,
    /// Maximum number of concurrent inbound connections.
    pub inbound_connections: usize,
    /// Whether to accept inbound connections at all.
    pub inbound_enabled: bool,
    /// Number of concurrent outbound connection slots to maintain.
    pub outbound_connections: usize,
    /// Number of concurrent dial attempts racing within one outbound slot.
    pub connect_batch_size: usize,
    /// Bound on a single connect attempt, and the session retry delay.
    pub connect_timeout: Duration,
    /// Bound on the version handshake.
    pub channel_handshake: Duration,
    /// Ping interval on a live channel.
    pub channel_heartbeat: Duration,
    /// A channel receiving no messages for this long is dropped.
    pub channel_inactivity: Duration,
    /// Absolute lifetime cap on a channel.
    pub channel_expiration: Duration,
    /// Window during which a seed channel collects address gossip.
    pub channel_germination: Duration,
    /// Bound on a channel's outgoing message queue.
    pub channel_buffer: usize,
    /// Maximum number of addresses retained in the pool.
    pub host_pool_capacity: usize,
    /// Path of the persisted address pool.
    pub hosts_file: PathBuf,
    /// Highest protocol version to negotiate.
    pub protocol_maximum: u32,
    /// Lowest peer protocol version accepted.
    pub protocol_minimum: u32,
    /// Service bits advertised by this node.
    pub services: ServiceFlags,
    /// Service bits that disqualify a peer when advertised.
    pub invalid_services: ServiceFlags,
    /// Whether to attach the (deprecated) alert protocol.
    pub enable_alert: bool,
    /// Whether to negotiate the (deprecated) reject protocol.
    pub enable_reject: bool,
    /// Whether transaction relay is serviced at all.
    pub enable_transaction: bool,
    /// Whether peers are asked to relay transactions in the version message.
    pub relay_transactions: bool,
    /// Largest accepted message payload in bytes.
    pub maximum_payload: usize,
    /// Block height advertised in version messages.
    pub start_height: i32,
    /// User agent advertised in version messages.
    pub user_agent: String,
    /// Manual peers dialed by [`run`](crate::P2p::run), as `host:port`.
    pub peers: Vec<String>,
    /// Seed endpoints used to bootstrap the address pool, as `host:port`.
    pub seeds: Vec<String>,
    /// Addresses never connected to; zero port matches any port.
    pub blacklists: Vec<Authority>,
    /// When non-empty, the only addresses accepted inbound.
    pub whitelists: Vec<Authority>,
    /// Network magic as a little-endian u32 (mainnet: 0xd9b4bef9).
    pub identifier: u32,
}

impl Settings {
    /// The configured network magic.
    pub fn magic(&self) -> Magic {
        Magic::from_bytes(self.identifier.to_le_bytes())
    }

    /// Whether the authority is barred by the blacklist.
    pub fn blacklisted(&self, authority: &Authority) -> bool {
        self.blacklists.iter().any(|entry| entry.matches(authority))
    }

    /// Whether the authority passes the whitelist (vacuously when empty).
    pub fn whitelisted(&self, authority: &Authority) -> bool {
        self.whitelists.is_empty() || self.whitelists.iter().any(|entry| entry.matches(authority))
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            inbound_port: 8333,
            inbound_connections: 32,
            inbound_enabled: false,
            outbound_connections: 8,
            connect_batch_size: 5,
            connect_timeout: Duration::from_secs(5),
            channel_handshake: Duration::from_secs(30),
            channel_heartbeat: Duration::from_secs(5 * 60),
            channel_inactivity: Duration::from_secs(10 * 60),
            channel_expiration: Duration::from_secs(60 * 60),
            channel_germination: Duration::from_secs(30),
            channel_buffer: 32,
            host_pool_capacity: 1000,
            hosts_file: PathBuf::from("hosts.cache"),
            protocol_maximum: 70013,
            protocol_minimum: 31402,
            services: ServiceFlags::NETWORK,
            invalid_services: ServiceFlags::NONE,
            enable_alert: false,
            enable_reject: false,
            enable_transaction: false,
            relay_transactions: true,
            maximum_payload: 32 * 1024 * 1024,
            start_height: 0,
            user_agent: default_user_agent(),
            peers: Vec::new(),
            seeds: Vec::new(),
            blacklists: Vec::new(),
            whitelists: Vec::new(),
            identifier: 0xd9b4_bef9,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_magic_is_mainnet() {
        let settings = Settings::default();
        assert_eq!(settings.magic(), Magic::BITCOIN);
    }

    #[test]
    fn test_blacklist_wildcard() {
        let mut settings = Settings::default();
        settings.blacklists.push("1.2.3.4".parse().unwrap());

        assert!(settings.blacklisted(&"1.2.3.4:8333".parse().unwrap()));
        assert!(settings.blacklisted(&"1.2.3.4:1".parse().unwrap()));
        assert!(!settings.blacklisted(&"1.2.3.5:8333".parse().unwrap()));
    }

    #[test]
    fn test_empty_whitelist_accepts_all() {
        let settings = Settings::default();
        assert!(settings.whitelisted(&"1.2.3.4:8333".parse().unwrap()));

        let mut restricted = Settings::default();
        restricted.whitelists.push("10.0.0.1:8333".parse().unwrap());
        assert!(restricted.whitelisted(&"10.0.0.1:8333".parse().unwrap()));
        assert!(!restricted.whitelisted(&"1.2.3.4:8333".parse().unwrap()));
    }
}
