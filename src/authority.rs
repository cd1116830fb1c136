//! Canonical peer identity and address records.
//!
//! An [`Authority`] is the unique identifier of a peer on the network: an
//! IPv6-normalized address plus port. IPv4 addresses are held in their
//! IPv4-mapped IPv6 form (`::ffff:a.b.c.d`) so storage, hashing and equality
//! are uniform across both families. The textual form is round-trippable and
//! renders mapped addresses back as dotted IPv4.
//!
//! An [`AddressItem`] is the gossip record exchanged in `addr` messages and
//! stored in the address pool; its wire form and storage form are identical.

use crate::error::NetworkError;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

/// Size in bytes of one serialized [`AddressItem`] record.
pub const ADDRESS_ITEM_SIZE: usize = 30;

/// An IPv6-normalized network address and port identifying a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Authority {
    ip: Ipv6Addr,
    port: u16,
}

impl Authority {
    /// Create an authority, mapping IPv4 addresses into IPv6.
    pub fn new(ip: IpAddr, port: u16) -> Self {
        let ip = match ip {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };

        Authority { ip, port }
    }

    /// The unspecified authority (`[::]:0`).
    pub fn unspecified() -> Self {
        Authority {
            ip: Ipv6Addr::UNSPECIFIED,
            port: 0,
        }
    }

    /// The normalized IPv6 address.
    pub fn ip(&self) -> Ipv6Addr {
        self.ip
    }

    /// The port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// An authority with a zero port is unspecified and never dialable.
    pub fn is_specified(&self) -> bool {
        self.port != 0
    }

    /// Whether the address is usable on the public network.
    ///
    /// Loopback, private, link-local and unspecified addresses are rejected
    /// from gossip so the pool only ever holds dialable peers.
    pub fn is_routable(&self) -> bool {
        if let Some(v4) = self.ip.to_ipv4_mapped() {
            return !(v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast());
        }

        // fc00::/7 unique-local, fe80::/10 link-local.
        let segments = self.ip.segments();
        !(self.ip.is_loopback()
            || self.ip.is_unspecified()
            || (segments[0] & 0xfe00) == 0xfc00
            || (segments[0] & 0xffc0) == 0xfe80)
    }

    /// Convert to a dialable socket address, unmapping IPv4 where possible.
    pub fn to_socket_addr(&self) -> SocketAddr {
        match self.ip.to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), self.port),
            None => SocketAddr::new(IpAddr::V6(self.ip), self.port),
        }
    }

    /// Policy match for black/whitelists.
    ///
    /// An entry with a zero port matches any port on the same address.
    pub fn matches(&self, other: &Authority) -> bool {
        self.ip == other.ip && (self.port == 0 || self.port == other.port)
    }
}

impl From<SocketAddr> for Authority {
    fn from(address: SocketAddr) -> Self {
        Authority::new(address.ip(), address.port())
    }
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip.to_ipv4_mapped() {
            Some(v4) => write!(f, "{v4}")?,
            None => write!(f, "[{}]", self.ip)?,
        }

        if self.port != 0 {
            write!(f, ":{}", self.port)?;
        }

        Ok(())
    }
}

impl FromStr for Authority {
    type Err = NetworkError;

    // Accepts "a.b.c.d", "a.b.c.d:port", "[v6]", "[v6]:port" and bare "v6".
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = text.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or(NetworkError::InvalidConfiguration)?;
            let ip = Ipv6Addr::from_str(host).map_err(|_| NetworkError::InvalidConfiguration)?;

            let port = match tail.strip_prefix(':') {
                Some(port) => u16::from_str(port).map_err(|_| NetworkError::InvalidConfiguration)?,
                None if tail.is_empty() => 0,
                None => return Err(NetworkError::InvalidConfiguration),
            };

            return Ok(Authority::new(IpAddr::V6(ip), port));
        }

        if let Some((host, port)) = text.rsplit_once(':') {
            if let Ok(v4) = Ipv4Addr::from_str(host) {
                let port = u16::from_str(port).map_err(|_| NetworkError::InvalidConfiguration)?;
                return Ok(Authority::new(IpAddr::V4(v4), port));
            }
        }

        if let Ok(v4) = Ipv4Addr::from_str(text) {
            return Ok(Authority::new(IpAddr::V4(v4), 0));
        }

        // Lenient: a bare IPv6 address without brackets or port.
        if let Ok(v6) = Ipv6Addr::from_str(text) {
            return Ok(Authority::new(IpAddr::V6(v6), 0));
        }

        Err(NetworkError::InvalidConfiguration)
    }
}

/// A peer address record as gossiped in `addr` messages.
///
/// The serialized layout is the bitcoin wire format for an address entry:
/// timestamp (4, LE), services (8, LE), ip (16), port (2, BE).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressItem {
    /// Last-seen unix timestamp, seconds.
    pub timestamp: u32,
    /// Advertised service bits.
    pub services: u64,
    /// IPv6 (or IPv4-mapped) address octets.
    pub ip: [u8; 16],
    /// Listening port.
    pub port: u16,
}

impl AddressItem {
    /// Build a record from an authority.
    pub fn new(authority: Authority, services: u64, timestamp: u32) -> Self {
        AddressItem {
            timestamp,
            services,
            ip: authority.ip().octets(),
            port: authority.port(),
        }
    }

    /// The authority this record describes.
    pub fn authority(&self) -> Authority {
        Authority::new(IpAddr::V6(Ipv6Addr::from(self.ip)), self.port)
    }

    /// Serialize into the 30-byte wire record.
    pub fn to_bytes(&self) -> [u8; ADDRESS_ITEM_SIZE] {
        let mut bytes = [0u8; ADDRESS_ITEM_SIZE];
        bytes[0..4].copy_from_slice(&self.timestamp.to_le_bytes());
        bytes[4..12].copy_from_slice(&self.services.to_le_bytes());
        bytes[12..28].copy_from_slice(&self.ip);
        bytes[28..30].copy_from_slice(&self.port.to_be_bytes());
        bytes
    }

    /// Deserialize from the 30-byte wire record.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, NetworkError> {
        if bytes.len() != ADDRESS_ITEM_SIZE {
            return Err(NetworkError::BadStream);
        }

        let mut ip = [0u8; 16];
        ip.copy_from_slice(&bytes[12..28]);

        Ok(AddressItem {
            timestamp: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            services: u64::from_le_bytes([
                bytes[4], bytes[5], bytes[6], bytes[7], bytes[8], bytes[9], bytes[10], bytes[11],
            ]),
            ip,
            port: u16::from_be_bytes([bytes[28], bytes[29]]),
        })
    }
}

impl fmt::Display for AddressItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (services: {:x})", self.authority(), self.services)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_round_trip() {
        let authority: Authority = "1.2.240.1:42".parse().unwrap();
        assert_eq!(authority.port(), 42);
        assert_eq!(authority.to_string(), "1.2.240.1:42");

        let reparsed: Authority = authority.to_string().parse().unwrap();
        assert_eq!(reparsed, authority);
    }

    #[test]
    fn test_mapped_ipv6_equals_ipv4() {
        let mapped: Authority = "[::ffff:1.2.240.1]:42".parse().unwrap();
        let plain: Authority = "1.2.240.1:42".parse().unwrap();

        assert_eq!(mapped, plain);
        assert_eq!(mapped.to_string(), "1.2.240.1:42");
    }

    #[test]
    fn test_ipv6_round_trip() {
        let authority: Authority = "[2001:db8::2]:8333".parse().unwrap();
        assert_eq!(authority.to_string(), "[2001:db8::2]:8333");

        let reparsed: Authority = authority.to_string().parse().unwrap();
        assert_eq!(reparsed, authority);
    }

    #[test]
    fn test_zero_port_is_unspecified() {
        let authority: Authority = "1.2.3.4".parse().unwrap();
        assert!(!authority.is_specified());
        assert_eq!(authority.to_string(), "1.2.3.4");
    }

    #[test]
    fn test_invalid_input() {
        assert!(Authority::from_str("not an address").is_err());
        assert!(Authority::from_str("[::1]:99999999").is_err());
        assert!(Authority::from_str("[::1").is_err());
    }

    #[test]
    fn test_wildcard_port_match() {
        let wildcard: Authority = "1.2.3.4".parse().unwrap();
        let exact: Authority = "1.2.3.4:8333".parse().unwrap();
        let other: Authority = "1.2.3.4:1".parse().unwrap();

        assert!(wildcard.matches(&exact));
        assert!(wildcard.matches(&other));
        assert!(!exact.matches(&other));
    }

    #[test]
    fn test_routable() {
        let public: Authority = "8.8.8.8:53".parse().unwrap();
        assert!(public.is_routable());

        let private: Authority = "192.168.1.1:8333".parse().unwrap();
        assert!(!private.is_routable());

        let loopback: Authority = "127.0.0.1:8333".parse().unwrap();
        assert!(!loopback.is_routable());

        let link_local: Authority = "[fe80::1]:8333".parse().unwrap();
        assert!(!link_local.is_routable());

        let unique_local: Authority = "[fd00::1]:8333".parse().unwrap();
        assert!(!unique_local.is_routable());
    }

    #[test]
    fn test_address_item_round_trip() {
        let authority: Authority = "1.2.240.1:42".parse().unwrap();
        let item = AddressItem::new(authority, 0x0409, 1_700_000_000);

        let decoded = AddressItem::from_bytes(&item.to_bytes()).unwrap();
        assert_eq!(decoded, item);
        assert_eq!(decoded.authority(), authority);
    }

    #[test]
    fn test_address_item_bad_length() {
        assert!(AddressItem::from_bytes(&[0u8; 29]).is_err());
        assert!(AddressItem::from_bytes(&[0u8; 31]).is_err());
    }

    #[test]
    fn test_socket_addr_round_trip() {
        let authority: Authority = "1.2.240.1:42".parse().unwrap();
        let socket = authority.to_socket_addr();
        assert!(socket.is_ipv4());
        assert_eq!(Authority::from(socket), authority);
    }
}
