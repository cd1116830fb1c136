//! Heartbeat protocols keeping the channel verifiably alive.

use crate::deadline::Deadline;
use crate::error::NetworkError;
use crate::net::Channel;
use crate::nonce::generate_nonce;
use bitcoin::p2p::message::NetworkMessage;
use log::debug;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Pre-BIP-31 keepalive: a silent ping each heartbeat, nothing expected back.
pub struct ProtocolPing31402 {
    channel: Channel,
    heartbeat: Duration,
    deadline: Deadline,
}

impl ProtocolPing31402 {
    pub fn new(channel: Channel, heartbeat: Duration) -> Arc<Self> {
        let deadline = Deadline::new(channel.strand().clone());
        Arc::new(ProtocolPing31402 {
            channel,
            heartbeat,
            deadline,
        })
    }

    pub fn start(self: Arc<Self>) {
        let guard = self.clone();
        self.channel
            .subscribe_stop(Box::new(move |_| guard.deadline.stop()));

        self.schedule();
    }

    fn schedule(self: Arc<Self>) {
        let protocol = self.clone();
        self.deadline.start(self.heartbeat, move |result| {
            if result.is_ok() {
                protocol.handle_heartbeat();
            }
        });
    }

    fn handle_heartbeat(self: Arc<Self>) {
        if self.channel.stop_code().is_some() {
            return;
        }

        self.channel.send(NetworkMessage::Ping(0));
        self.schedule();
    }
}

/// BIP-31 heartbeat: nonce'd ping expecting a matching pong.
///
/// A pong with the wrong nonce is a corrupt stream; a heartbeat expiring
/// while a pong is still outstanding times the channel out. Peer pings are
/// answered with echoing pongs.
pub struct ProtocolPing60001 {
    channel: Channel,
    heartbeat: Duration,
    deadline: Deadline,
    pending: Mutex<Option<u64>>,
}

impl ProtocolPing60001 {
    pub fn new(channel: Channel, heartbeat: Duration) -> Arc<Self> {
        let deadline = Deadline::new(channel.strand().clone());
        Arc::new(ProtocolPing60001 {
            channel,
            heartbeat,
            deadline,
            pending: Mutex::new(None),
        })
    }

    pub fn start(self: Arc<Self>) {
        let protocol = self.clone();
        let _ = self.channel.subscribe(
            "ping",
            Box::new(move |event| match event {
                Ok(NetworkMessage::Ping(nonce)) => {
                    protocol.channel.send(NetworkMessage::Pong(*nonce));
                    true
                }
                Ok(_) => true,
                Err(_) => false,
            }),
        );

        let protocol = self.clone();
        let _ = self.channel.subscribe(
            "pong",
            Box::new(move |event| match event {
                Ok(NetworkMessage::Pong(nonce)) => protocol.handle_pong(*nonce),
                Ok(_) => true,
                Err(_) => false,
            }),
        );

        let guard = self.clone();
        self.channel
            .subscribe_stop(Box::new(move |_| guard.deadline.stop()));

        self.schedule();
    }

    fn schedule(self: Arc<Self>) {
        let protocol = self.clone();
        self.deadline.start(self.heartbeat, move |result| {
            if result.is_ok() {
                protocol.handle_heartbeat();
            }
        });
    }

    fn handle_heartbeat(self: Arc<Self>) {
        if self.channel.stop_code().is_some() {
            return;
        }

        {
            let mut pending = self.pending.lock().expect("ping poisoned");
            if pending.is_some() {
                drop(pending);
                debug!(
                    "Ping latency limit exceeded on [{}]",
                    self.channel.authority()
                );
                self.channel.stop(NetworkError::ChannelTimeout);
                return;
            }

            let nonce = generate_nonce();
            *pending = Some(nonce);
            drop(pending);
            self.channel.send(NetworkMessage::Ping(nonce));
        }

        self.schedule();
    }

    fn handle_pong(&self, nonce: u64) -> bool {
        let mut pending = self.pending.lock().expect("ping poisoned");

        match pending.take() {
            Some(expected) if expected == nonce => true,
            Some(_) => {
                drop(pending);
                debug!("Invalid pong nonce from [{}]", self.channel.authority());
                self.channel.stop(NetworkError::BadStream);
                false
            }
            None => {
                // Unsolicited pong; harmless.
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::Socket;
    use crate::settings::Settings;
    use crate::transport::{TransportReader, TransportWriter};
    use bitcoin::p2p::Magic;
    use tokio::net::{TcpListener, TcpStream};

    async fn socket_pair() -> (Socket, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let dial = tokio::spawn(TcpStream::connect(address));
        let (accepted, _) = listener.accept().await.unwrap();
        let remote = dial.await.unwrap().unwrap();
        (Socket::new(accepted).unwrap(), remote)
    }

    fn test_channel(socket: Socket) -> Channel {
        let channel = Channel::new(socket, 1, 42, false, Arc::new(Settings::default()));
        channel.start();
        channel.resume();
        channel
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let (socket, stream) = socket_pair().await;
        let channel = test_channel(socket);

        ProtocolPing60001::new(channel, Duration::from_secs(600)).start();

        let (read_half, write_half) = stream.into_split();
        let mut reader = TransportReader::new(Magic::BITCOIN, 1024, read_half);
        let mut writer = TransportWriter::new(Magic::BITCOIN, write_half);

        writer.write(NetworkMessage::Ping(77)).await.unwrap();
        match reader.read().await.unwrap() {
            NetworkMessage::Pong(nonce) => assert_eq!(nonce, 77),
            message => panic!("Expected pong, got {message:?}"),
        }
    }

    #[tokio::test]
    async fn test_matched_pong_keeps_channel_alive() {
        let (socket, stream) = socket_pair().await;
        let channel = test_channel(socket);

        ProtocolPing60001::new(channel.clone(), Duration::from_millis(100)).start();

        let (read_half, write_half) = stream.into_split();
        let mut reader = TransportReader::new(Magic::BITCOIN, 1024, read_half);
        let mut writer = TransportWriter::new(Magic::BITCOIN, write_half);

        // Answer several heartbeats correctly; the channel must stay up.
        for _ in 0..3 {
            match reader.read().await.unwrap() {
                NetworkMessage::Ping(nonce) => {
                    writer.write(NetworkMessage::Pong(nonce)).await.unwrap();
                }
                message => panic!("Expected ping, got {message:?}"),
            }
            assert!(channel.stop_code().is_none());
        }
    }

    #[tokio::test]
    async fn test_mismatched_pong_is_bad_stream() {
        let (socket, stream) = socket_pair().await;
        let channel = test_channel(socket);

        ProtocolPing60001::new(channel.clone(), Duration::from_millis(100)).start();

        let (read_half, write_half) = stream.into_split();
        let mut reader = TransportReader::new(Magic::BITCOIN, 1024, read_half);
        let mut writer = TransportWriter::new(Magic::BITCOIN, write_half);

        match reader.read().await.unwrap() {
            NetworkMessage::Ping(nonce) => {
                writer
                    .write(NetworkMessage::Pong(nonce.wrapping_add(1)))
                    .await
                    .unwrap();
            }
            message => panic!("Expected ping, got {message:?}"),
        }

        assert_eq!(channel.stopped().await, NetworkError::BadStream);
    }

    #[tokio::test]
    async fn test_missed_pong_times_out() {
        let (socket, _stream) = socket_pair().await;
        let channel = test_channel(socket);

        ProtocolPing60001::new(channel.clone(), Duration::from_millis(50)).start();

        // No pong ever arrives: the second heartbeat tick stops the channel.
        assert_eq!(channel.stopped().await, NetworkError::ChannelTimeout);
    }

    #[tokio::test]
    async fn test_legacy_ping_is_silent() {
        let (socket, stream) = socket_pair().await;
        let channel = test_channel(socket);

        ProtocolPing31402::new(channel.clone(), Duration::from_millis(50)).start();

        let (read_half, _write_half) = stream.into_split();
        let mut reader = TransportReader::new(Magic::BITCOIN, 1024, read_half);

        // Heartbeats keep coming and nothing is expected back.
        for _ in 0..2 {
            assert!(matches!(
                reader.read().await.unwrap(),
                NetworkMessage::Ping(_)
            ));
        }
        assert!(channel.stop_code().is_none());
    }
}
