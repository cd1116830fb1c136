//! End-to-end tests driving the p2p service over loopback.

use bitcoin_peers_network::{
    AddressItem, Authority, ChannelEvent, NetworkError, P2p, Settings,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

fn test_settings(name: &str) -> Settings {
    let mut settings = Settings::default();
    settings.inbound_enabled = false;
    settings.outbound_connections = 0;
    settings.connect_timeout = Duration::from_millis(300);
    settings.channel_handshake = Duration::from_secs(5);
    settings.channel_germination = Duration::from_millis(300);
    settings.hosts_file = std::env::temp_dir().join(format!(
        "bitcoin-peers-network-{}-{}.cache",
        name,
        std::process::id()
    ));
    settings
}

fn listener_settings(name: &str) -> Settings {
    let mut settings = test_settings(name);
    settings.inbound_enabled = true;
    settings.inbound_port = 0;
    settings.inbound_connections = 8;
    settings
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition never met");
}

#[tokio::test]
async fn test_inbound_disabled_is_bypassed() {
    let network = P2p::new(test_settings("bypassed"));

    network.start().await.unwrap();
    assert_eq!(network.inbound_port(), None);
    network.close().await;
}

#[tokio::test]
async fn test_run_with_unreachable_manual_peer() {
    // The manual session retries internally; start and run succeed, and the
    // pending connect resolves with service_stopped once the service closes.
    let mut settings = test_settings("unreachable");
    settings.peers.push("127.0.0.1:1".to_string());

    let network = Arc::new(P2p::new(settings));
    network.start().await.unwrap();
    network.run().await.unwrap();

    let pending = {
        let network = network.clone();
        tokio::spawn(async move { network.connect("127.0.0.1:1").await })
    };

    // Let a connect attempt fail and the retry delay arm.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(network.channel_count(), 0);

    network.close().await;
    assert_eq!(
        pending.await.unwrap(),
        Err(NetworkError::ServiceStopped)
    );
}

#[tokio::test]
async fn test_manual_connection_round_trip() {
    let listener = P2p::new(listener_settings("mesh-listener"));
    listener.start().await.unwrap();
    let port = listener.inbound_port().unwrap();

    let dialer = Arc::new(P2p::new(test_settings("mesh-dialer")));
    dialer.start().await.unwrap();

    let connects = Arc::new(AtomicUsize::new(0));
    let stops = Arc::new(AtomicUsize::new(0));
    {
        let connects = connects.clone();
        let stops = stops.clone();
        dialer
            .subscribe(Box::new(move |event| {
                match event {
                    Ok(ChannelEvent::Connect(_)) => {
                        connects.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(ChannelEvent::Stop(_)) => {
                        stops.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(_) => return false,
                }
                true
            }))
            .unwrap();
    }

    dialer.connect(&format!("[::1]:{port}")).await.unwrap();

    assert_eq!(dialer.channel_count(), 1);
    assert_eq!(dialer.outbound_channel_count(), 1);
    wait_until(|| listener.inbound_channel_count() == 1).await;
    wait_until(|| connects.load(Ordering::SeqCst) == 1).await;

    dialer.close().await;
    assert_eq!(dialer.channel_count(), 0);
    assert_eq!(dialer.outbound_channel_count(), 0);

    // The listener notices the disconnect and deregisters.
    wait_until(|| listener.inbound_channel_count() == 0).await;
    listener.close().await;
    assert_eq!(listener.channel_count(), 0);

    assert_eq!(connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_inbound_admission_cap() {
    let mut settings = listener_settings("cap");
    settings.inbound_connections = 1;

    let listener = P2p::new(settings);
    listener.start().await.unwrap();
    let port = listener.inbound_port().unwrap();

    let dialer = P2p::new(test_settings("cap-dialer"));
    dialer.start().await.unwrap();
    dialer.connect(&format!("[::1]:{port}")).await.unwrap();
    wait_until(|| listener.inbound_channel_count() == 1).await;

    // A second arrival is accepted at the socket layer, then dropped.
    let mut raw = TcpStream::connect(("::1", port)).await.unwrap();
    let mut buffer = [0u8; 1];
    let read = raw.read(&mut buffer).await;
    assert!(matches!(read, Ok(0) | Err(_)), "socket should be closed");
    assert_eq!(listener.inbound_channel_count(), 1);

    dialer.close().await;
    listener.close().await;
}

#[tokio::test]
async fn test_self_connect_is_rejected() {
    let network = Arc::new(P2p::new(listener_settings("loopback")));
    network.start().await.unwrap();
    let port = network.inbound_port().unwrap();

    // Dial our own listener: the handshake must observe our own pended
    // nonce and never register the channel, on either side.
    let pending = {
        let network = network.clone();
        let endpoint = format!("[::1]:{port}");
        tokio::spawn(async move { network.connect(&endpoint).await })
    };

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(network.channel_count(), 0);
    assert_eq!(network.inbound_channel_count(), 0);
    assert_eq!(network.outbound_channel_count(), 0);

    network.close().await;
    assert_eq!(
        pending.await.unwrap(),
        Err(NetworkError::ServiceStopped)
    );
}

#[tokio::test]
async fn test_seeding_fills_pool() {
    // The seed node carries addresses and serves them over getaddr.
    let seed_node = P2p::new(listener_settings("seed-source"));
    seed_node.start().await.unwrap();
    let port = seed_node.inbound_port().unwrap();

    let gossip: Vec<AddressItem> = (1..=5u8)
        .map(|index| {
            let authority: Authority = format!("8.8.8.{index}:8333").parse().unwrap();
            AddressItem::new(authority, 1, 1_700_000_000)
        })
        .collect();
    assert_eq!(seed_node.save(&gossip), 5);

    // The fresh node seeds its empty pool before dialing outbound.
    let mut settings = test_settings("seed-sink");
    settings.outbound_connections = 1;
    settings.connect_batch_size = 2;
    settings.seeds.push(format!("[::1]:{port}"));

    let fresh = P2p::new(settings);
    fresh.start().await.unwrap();
    assert!(fresh.address_count() > 0);

    fresh.close().await;
    seed_node.close().await;
}

#[tokio::test]
async fn test_outbound_without_addresses_fails() {
    let mut settings = test_settings("no-addresses");
    settings.outbound_connections = 2;

    // No seeds, empty pool: seeding cannot help and start short-circuits.
    let network = P2p::new(settings);
    assert_eq!(
        network.start().await,
        Err(NetworkError::SeedingUnsuccessful)
    );
}

#[tokio::test]
async fn test_blacklisted_inbound_is_dropped() {
    let mut settings = listener_settings("blacklist");
    settings.blacklists.push("::1".parse().unwrap());
    // Loopback arrives as ::1; the wildcard entry must match any port.

    let listener = P2p::new(settings);
    listener.start().await.unwrap();
    let port = listener.inbound_port().unwrap();

    let mut raw = TcpStream::connect(("::1", port)).await.unwrap();
    let mut buffer = [0u8; 1];
    let read = raw.read(&mut buffer).await;
    assert!(matches!(read, Ok(0) | Err(_)), "socket should be closed");
    assert_eq!(listener.inbound_channel_count(), 0);

    listener.close().await;
}

#[tokio::test]
async fn test_authority_text_round_trip() {
    let mapped: Authority = "[::ffff:1.2.240.1]:42".parse().unwrap();
    let plain: Authority = "1.2.240.1:42".parse().unwrap();

    assert_eq!(mapped, plain);
    assert_eq!(mapped.to_string(), "1.2.240.1:42");
    assert_eq!(plain.to_string().parse::<Authority>().unwrap(), plain);
}

#[tokio::test]
async fn test_pool_persists_across_services() {
    let path: PathBuf = std::env::temp_dir().join(format!(
        "bitcoin-peers-network-persist-{}.cache",
        std::process::id()
    ));
    let _ = std::fs::remove_file(&path);

    let mut settings = test_settings("persist");
    settings.hosts_file = path.clone();

    let first = P2p::new(settings.clone());
    first.start().await.unwrap();
    let item = AddressItem::new("8.8.8.8:8333".parse().unwrap(), 1, 1_700_000_000);
    assert_eq!(first.save(&[item]), 1);
    first.close().await;

    let second = P2p::new(settings);
    second.start().await.unwrap();
    assert_eq!(second.address_count(), 1);
    assert_eq!(second.take().unwrap(), item);
    second.close().await;

    let _ = std::fs::remove_file(&path);
}
