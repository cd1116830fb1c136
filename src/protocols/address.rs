//! Address gossip protocols feeding and serving the address pool.

use crate::authority::{AddressItem, Authority};
use crate::error::NetworkError;
use crate::net::Channel;
use crate::pool::AddressPool;
use crate::settings::Settings;
use bitcoin::p2p::address::Address;
use bitcoin::p2p::message::NetworkMessage;
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Protocol cap on entries per `addr` message.
const MAX_ADDRESSES: usize = 1000;

/// Ingests `addr` gossip into the address pool.
///
/// Outbound channels solicit gossip with a `getaddr` on start. Incoming
/// entries are filtered down to routable, dialable peers with acceptable
/// service bits before they reach the pool.
pub struct ProtocolAddressIn31402 {
    channel: Channel,
    pool: Arc<AddressPool>,
    settings: Arc<Settings>,
}

impl ProtocolAddressIn31402 {
    pub fn new(channel: Channel, pool: Arc<AddressPool>, settings: Arc<Settings>) -> Arc<Self> {
        Arc::new(ProtocolAddressIn31402 {
            channel,
            pool,
            settings,
        })
    }

    pub fn start(self: Arc<Self>) {
        if !self.channel.inbound() {
            self.channel.send(NetworkMessage::GetAddr);
        }

        let protocol = self.clone();
        let _ = self.channel.subscribe(
            "addr",
            Box::new(move |event| match event {
                Ok(NetworkMessage::Addr(addresses)) => protocol.handle_addresses(addresses),
                Ok(_) => true,
                Err(_) => false,
            }),
        );
    }

    fn handle_addresses(&self, addresses: &[(u32, Address)]) -> bool {
        if addresses.len() > MAX_ADDRESSES {
            debug!(
                "Oversized addr message ({}) from [{}]",
                addresses.len(),
                self.channel.authority()
            );
            self.channel.stop(NetworkError::ProtocolViolation);
            return false;
        }

        let own = self.channel.authority();
        let invalid = self.settings.invalid_services.to_u64();

        let items: Vec<AddressItem> = addresses
            .iter()
            .filter_map(|(timestamp, address)| {
                let socket = address.socket_addr().ok()?;
                let authority = Authority::from(socket);
                let services = address.services.to_u64();

                if !authority.is_specified()
                    || !authority.is_routable()
                    || authority == own
                    || services & invalid != 0
                {
                    return None;
                }

                Some(AddressItem::new(authority, services, *timestamp))
            })
            .collect();

        let accepted = self.pool.save(&items);
        debug!(
            "Accepted {accepted} of {} gossiped addresses from [{}]",
            addresses.len(),
            self.channel.authority()
        );

        true
    }
}

/// Answers the first `getaddr` with a sample of the address pool.
pub struct ProtocolAddressOut31402 {
    channel: Channel,
    pool: Arc<AddressPool>,
    answered: AtomicBool,
}

impl ProtocolAddressOut31402 {
    pub fn new(channel: Channel, pool: Arc<AddressPool>) -> Arc<Self> {
        Arc::new(ProtocolAddressOut31402 {
            channel,
            pool,
            answered: AtomicBool::new(false),
        })
    }

    pub fn start(self: Arc<Self>) {
        let protocol = self.clone();
        let _ = self.channel.subscribe(
            "getaddr",
            Box::new(move |event| match event {
                Ok(NetworkMessage::GetAddr) => protocol.handle_get_addresses(),
                Ok(_) => true,
                Err(_) => false,
            }),
        );
    }

    fn handle_get_addresses(&self) -> bool {
        // One answer per channel; repeats are swallowed.
        if self.answered.swap(true, Ordering::SeqCst) {
            debug!("Repeated getaddr from [{}]", self.channel.authority());
            return true;
        }

        let entries: Vec<(u32, Address)> = self
            .pool
            .fetch(MAX_ADDRESSES)
            .iter()
            .map(|item| {
                let socket = item.authority().to_socket_addr();
                (
                    item.timestamp,
                    Address::new(&socket, item.services.into()),
                )
            })
            .collect();

        debug!(
            "Answering getaddr with {} addresses for [{}]",
            entries.len(),
            self.channel.authority()
        );
        self.channel.send(NetworkMessage::Addr(entries));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::Socket;
    use crate::transport::{TransportReader, TransportWriter};
    use bitcoin::p2p::{Magic, ServiceFlags};
    use std::net::SocketAddr;
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};

    async fn socket_pair() -> (Socket, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let dial = tokio::spawn(TcpStream::connect(address));
        let (accepted, _) = listener.accept().await.unwrap();
        let remote = dial.await.unwrap().unwrap();
        (Socket::new(accepted).unwrap(), remote)
    }

    fn test_channel(socket: Socket, inbound: bool) -> Channel {
        let channel = Channel::new(socket, 1, 42, inbound, Arc::new(Settings::default()));
        channel.start();
        channel.resume();
        channel
    }

    fn test_pool() -> Arc<AddressPool> {
        Arc::new(AddressPool::new(100, PathBuf::from("unused.cache")))
    }

    fn entry(text: &str, services: ServiceFlags) -> (u32, Address) {
        let socket: SocketAddr = text.parse().unwrap();
        (1_700_000_000, Address::new(&socket, services))
    }

    #[tokio::test]
    async fn test_outbound_solicits_and_ingests() {
        let (socket, stream) = socket_pair().await;
        let channel = test_channel(socket, false);
        let pool = test_pool();

        let protocol = ProtocolAddressIn31402::new(
            channel.clone(),
            pool.clone(),
            Arc::new(Settings::default()),
        );
        protocol.start();

        let (read_half, write_half) = stream.into_split();
        let mut reader = TransportReader::new(Magic::BITCOIN, 1024 * 1024, read_half);
        let mut writer = TransportWriter::new(Magic::BITCOIN, write_half);

        // The protocol asks for gossip on start.
        assert!(matches!(
            reader.read().await.unwrap(),
            NetworkMessage::GetAddr
        ));

        writer
            .write(NetworkMessage::Addr(vec![
                entry("8.8.8.8:8333", ServiceFlags::NETWORK),
                entry("9.9.9.9:8333", ServiceFlags::NETWORK),
                // Unroutable and unspecified entries are filtered.
                entry("192.168.0.1:8333", ServiceFlags::NETWORK),
                entry("7.7.7.7:0", ServiceFlags::NETWORK),
            ]))
            .await
            .unwrap();

        // Ingestion is asynchronous to the write.
        for _ in 0..50 {
            if pool.count() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(pool.count(), 2);
    }

    #[tokio::test]
    async fn test_oversized_addr_is_violation() {
        let (socket, stream) = socket_pair().await;
        let channel = test_channel(socket, true);

        let protocol = ProtocolAddressIn31402::new(
            channel.clone(),
            test_pool(),
            Arc::new(Settings::default()),
        );
        protocol.start();

        let entries: Vec<(u32, Address)> = (0..1001u32)
            .map(|index| {
                entry(
                    &format!("8.8.{}.{}:8333", index / 250 + 1, index % 250 + 1),
                    ServiceFlags::NETWORK,
                )
            })
            .collect();

        let (_, write_half) = stream.into_split();
        let mut writer = TransportWriter::new(Magic::BITCOIN, write_half);
        writer.write(NetworkMessage::Addr(entries)).await.unwrap();

        assert_eq!(channel.stopped().await, NetworkError::ProtocolViolation);
    }

    #[tokio::test]
    async fn test_getaddr_answered_once() {
        let (socket, stream) = socket_pair().await;
        let channel = test_channel(socket, true);
        let pool = test_pool();
        pool.save(&[AddressItem::new(
            "8.8.8.8:8333".parse().unwrap(),
            ServiceFlags::NETWORK.to_u64(),
            1_700_000_000,
        )]);

        let protocol = ProtocolAddressOut31402::new(channel.clone(), pool);
        protocol.start();

        let (read_half, write_half) = stream.into_split();
        let mut reader = TransportReader::new(Magic::BITCOIN, 1024 * 1024, read_half);
        let mut writer = TransportWriter::new(Magic::BITCOIN, write_half);

        writer.write(NetworkMessage::GetAddr).await.unwrap();
        match reader.read().await.unwrap() {
            NetworkMessage::Addr(entries) => assert_eq!(entries.len(), 1),
            message => panic!("Expected addr, got {message:?}"),
        }

        // A repeat solicitation is ignored, but the channel stays up.
        writer.write(NetworkMessage::GetAddr).await.unwrap();
        writer.write(NetworkMessage::Ping(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(channel.stop_code().is_none());
    }
}
