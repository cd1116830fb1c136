//! Message-level peer session over a connected socket.
//!
//! A [`Channel`] owns one connection: a reader task pulling frames through
//! the transport, a writer task draining the in-order send queue, and a
//! strand on which every subscriber callback runs. Protocols observe the
//! channel exclusively through its typed publish/subscribe, keyed by wire
//! command.
//!
//! A channel is created paused. The owning session attaches the handshake
//! protocol and resumes it to begin reading; once the handshake completes the
//! channel is paused again for steady-state protocol attachment, then resumed
//! for good. Stopping is idempotent: the first call's code wins, queued send
//! handlers complete with that code, message subscribers close with
//! [`NetworkError::ChannelStopped`], and stop watchers observe the reason
//! exactly once.

use crate::authority::Authority;
use crate::error::NetworkError;
use crate::net::socket::Socket;
use crate::settings::Settings;
use crate::strand::Strand;
use crate::subscriber::{EventHandler, Subscriber};
use crate::transport::{TransportReader, TransportWriter};
use bitcoin::p2p::message::NetworkMessage;
use bitcoin::p2p::Magic;
use log::debug;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};

/// Handler for messages of one subscribed command.
pub type MessageHandler = EventHandler<NetworkMessage>;
/// Completion handler for a queued send.
pub type SendHandler = Box<dyn FnOnce(Result<(), NetworkError>) + Send>;
/// Handler observing channel termination.
pub type StopHandler = Box<dyn FnOnce(NetworkError) + Send>;

type QueueItem = (NetworkMessage, Option<SendHandler>);

struct ChannelIo {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    queue: mpsc::Receiver<QueueItem>,
}

struct ChannelInner {
    id: u64,
    nonce: u64,
    inbound: bool,
    authority: Authority,
    magic: Magic,
    settings: Arc<Settings>,
    strand: Strand,
    negotiated_version: AtomicU32,
    peer_version: AtomicU32,
    peer_services: AtomicU64,
    paused: watch::Sender<bool>,
    stop: watch::Sender<Option<NetworkError>>,
    subscribers: Mutex<Option<HashMap<&'static str, Subscriber<NetworkMessage>>>>,
    stop_subscriber: Subscriber<NetworkError>,
    queue: mpsc::Sender<QueueItem>,
    io: Mutex<Option<ChannelIo>>,
    started: AtomicBool,
}

/// A connected, framed, bi-directional peer session.
///
/// Cheap to clone; all clones refer to the same connection.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Wrap a connected socket. The channel is created paused; call
    /// [`Channel::start`] to spawn its tasks and [`Channel::resume`] to begin
    /// reading.
    pub fn new(socket: Socket, id: u64, nonce: u64, inbound: bool, settings: Arc<Settings>) -> Self {
        let (authority, reader, writer) = socket.into_split();
        let (queue_tx, queue_rx) = mpsc::channel(settings.channel_buffer.max(1));
        let (paused, _) = watch::channel(true);
        let (stop, _) = watch::channel(None);
        let strand = Strand::new();
        let stop_subscriber = Subscriber::new(strand.clone());
        let magic = settings.magic();

        Channel {
            inner: Arc::new(ChannelInner {
                id,
                nonce,
                inbound,
                authority,
                magic,
                settings,
                strand,
                negotiated_version: AtomicU32::new(0),
                peer_version: AtomicU32::new(0),
                peer_services: AtomicU64::new(0),
                paused,
                stop,
                subscribers: Mutex::new(Some(HashMap::new())),
                stop_subscriber,
                queue: queue_tx,
                io: Mutex::new(Some(ChannelIo {
                    reader,
                    writer,
                    queue: queue_rx,
                })),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Monotonic channel identifier.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The nonce this channel proposes in its version message.
    pub fn nonce(&self) -> u64 {
        self.inner.nonce
    }

    /// Whether the connection was accepted rather than dialed.
    pub fn inbound(&self) -> bool {
        self.inner.inbound
    }

    /// The remote peer's authority.
    pub fn authority(&self) -> Authority {
        self.inner.authority
    }

    /// The channel's callback strand.
    pub fn strand(&self) -> &Strand {
        &self.inner.strand
    }

    /// Protocol version negotiated with the peer.
    ///
    /// Before the handshake completes this is the configured maximum.
    pub fn negotiated_version(&self) -> u32 {
        match self.inner.negotiated_version.load(Ordering::Relaxed) {
            0 => self.inner.settings.protocol_maximum,
            version => version,
        }
    }

    pub(crate) fn set_negotiated_version(&self, version: u32) {
        self.inner.negotiated_version.store(version, Ordering::Relaxed);
    }

    /// The peer's advertised protocol version, zero before the handshake.
    pub fn peer_version(&self) -> u32 {
        self.inner.peer_version.load(Ordering::Relaxed)
    }

    pub(crate) fn set_peer_version(&self, version: u32) {
        self.inner.peer_version.store(version, Ordering::Relaxed);
    }

    /// The peer's advertised service bits, zero before the handshake.
    pub fn peer_services(&self) -> u64 {
        self.inner.peer_services.load(Ordering::Relaxed)
    }

    pub(crate) fn set_peer_services(&self, services: u64) {
        self.inner.peer_services.store(services, Ordering::Relaxed);
    }

    /// Spawn the reader and writer tasks. Idempotent; reading remains gated
    /// on [`Channel::resume`].
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let io = self
            .inner
            .io
            .lock()
            .expect("channel poisoned")
            .take()
            .expect("channel io present before start");

        self.spawn_reader(io.reader);
        self.spawn_writer(io.writer, io.queue);
    }

    /// Gate the reader: no further messages are observed until resume.
    /// Deliveries already scheduled on the strand complete.
    pub fn pause(&self) {
        let _ = self.inner.paused.send(true);
    }

    /// Open the reader gate.
    pub fn resume(&self) {
        let _ = self.inner.paused.send(false);
    }

    /// Whether the reader gate is currently closed.
    pub fn paused(&self) -> bool {
        *self.inner.paused.borrow()
    }

    /// Register a handler for one wire command (`"ping"`, `"addr"`, ...).
    ///
    /// Multiple handlers per command are notified in subscription order; a
    /// handler returning false is dropped. Unknown wire commands are
    /// delivered under `"unknown"`.
    pub fn subscribe(&self, command: &'static str, handler: MessageHandler) -> Result<(), NetworkError> {
        let mut guard = self.inner.subscribers.lock().expect("channel poisoned");

        let map = match guard.as_mut() {
            Some(map) => map,
            None => return Err(NetworkError::ChannelStopped),
        };

        let subscriber = map
            .entry(command)
            .or_insert_with(|| Subscriber::new(self.inner.strand.clone()));

        subscriber
            .subscribe(handler)
            .map_err(|_| NetworkError::ChannelStopped)
    }

    /// Register a handler observing channel termination.
    ///
    /// The handler is invoked exactly once with the stop reason, immediately
    /// if the channel has already stopped.
    pub fn subscribe_stop(&self, handler: StopHandler) {
        let slot = Arc::new(Mutex::new(Some(handler)));

        let subscribed = slot.clone();
        let wrapped: EventHandler<NetworkError> = Box::new(move |event| {
            if let Some(handler) = subscribed.lock().expect("stop slot poisoned").take() {
                let code = match event {
                    Ok(code) => *code,
                    Err(code) => code,
                };
                handler(code);
            }
            false
        });

        if self.inner.stop_subscriber.subscribe(wrapped).is_err() {
            // Raced or followed a stop: deliver the recorded code directly.
            let code = self.stop_code().unwrap_or(NetworkError::ChannelStopped);
            if let Some(handler) = slot.lock().expect("stop slot poisoned").take() {
                self.inner.strand.post(move || handler(code));
            }
        }
    }

    /// The stop reason, once stopped.
    pub fn stop_code(&self) -> Option<NetworkError> {
        *self.inner.stop.borrow()
    }

    /// Resolve with the stop reason once the channel terminates.
    pub async fn stopped(&self) -> NetworkError {
        let mut stop = self.inner.stop.subscribe();
        let result = match stop.wait_for(|code| code.is_some()).await {
            Ok(code) => code.expect("stop code present"),
            Err(_) => NetworkError::ChannelStopped,
        };
        result
    }

    /// Queue a message for sending, without completion notification.
    pub fn send(&self, message: NetworkMessage) {
        self.submit(message, None);
    }

    /// Queue a message for sending; `handler` runs on the channel strand with
    /// the outcome, in strict send order.
    pub fn send_with(&self, message: NetworkMessage, handler: SendHandler) {
        self.submit(message, Some(handler));
    }

    fn submit(&self, message: NetworkMessage, handler: Option<SendHandler>) {
        if let Some(code) = self.stop_code() {
            self.complete_send(handler, Err(code));
            return;
        }

        match self.inner.queue.try_send((message, handler)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full((_, handler))) => {
                self.complete_send(handler, Err(NetworkError::Oversubscribed));
            }
            Err(mpsc::error::TrySendError::Closed((_, handler))) => {
                self.complete_send(handler, Err(NetworkError::ChannelStopped));
            }
        }
    }

    fn complete_send(&self, handler: Option<SendHandler>, result: Result<(), NetworkError>) {
        if let Some(handler) = handler {
            self.inner.strand.post(move || handler(result));
        }
    }

    /// Terminate the channel. Idempotent; only the first code is observed.
    pub fn stop(&self, code: NetworkError) {
        let mut first = false;
        self.inner.stop.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(code);
                first = true;
                true
            } else {
                false
            }
        });

        if !first {
            return;
        }

        debug!("Stopping channel [{}]: {code}", self.inner.authority);

        // Close every message subscriber; no further notifications.
        let subscribers = self.inner.subscribers.lock().expect("channel poisoned").take();
        if let Some(map) = subscribers {
            for subscriber in map.into_values() {
                subscriber.stop(NetworkError::ChannelStopped);
            }
        }

        // The single place watchers learn about channel death.
        self.inner.stop_subscriber.stop(code);
    }

    fn dispatch(&self, message: NetworkMessage) {
        let command = message.cmd();

        let subscriber = {
            let guard = self.inner.subscribers.lock().expect("channel poisoned");
            guard
                .as_ref()
                .and_then(|map| map.get(command))
                .cloned()
        };

        match subscriber {
            Some(subscriber) => subscriber.notify(message),
            None => debug!(
                "Unhandled {command} message on [{}]",
                self.inner.authority
            ),
        }
    }

    fn spawn_reader(&self, reader: OwnedReadHalf) {
        let channel = self.clone();
        let settings = self.inner.settings.clone();
        let mut transport =
            TransportReader::new(self.inner.magic, settings.maximum_payload, reader);

        tokio::spawn(async move {
            let mut stop = channel.inner.stop.subscribe();
            let mut paused = channel.inner.paused.subscribe();
            let expiration = tokio::time::Instant::now() + settings.channel_expiration;

            loop {
                // Handshake gate: issue no read while paused.
                tokio::select! {
                    _ = stop.wait_for(|code| code.is_some()) => return,
                    gate = paused.wait_for(|paused| !*paused) => {
                        if gate.is_err() {
                            return;
                        }
                    }
                }

                tokio::select! {
                    _ = stop.wait_for(|code| code.is_some()) => return,
                    // Back to the gate; partial frame progress is preserved.
                    _ = paused.wait_for(|paused| *paused) => continue,
                    _ = tokio::time::sleep_until(expiration) => {
                        channel.stop(NetworkError::ChannelTimeout);
                        return;
                    }
                    read = tokio::time::timeout(settings.channel_inactivity, transport.read()) => {
                        match read {
                            Err(_) => {
                                channel.stop(NetworkError::ChannelDropped);
                                return;
                            }
                            Ok(Err(code)) => {
                                channel.stop(code);
                                return;
                            }
                            Ok(Ok(message)) => channel.dispatch(message),
                        }
                    }
                }
            }
        });
    }

    fn spawn_writer(&self, writer: OwnedWriteHalf, mut queue: mpsc::Receiver<QueueItem>) {
        let channel = self.clone();
        let mut transport = TransportWriter::new(self.inner.magic, writer);

        tokio::spawn(async move {
            let mut stop = channel.inner.stop.subscribe();

            loop {
                let item = tokio::select! {
                    _ = stop.wait_for(|code| code.is_some()) => break,
                    item = queue.recv() => item,
                };
                match item {
                    None => break,
                    Some((message, handler)) => {
                        match transport.write(message).await {
                            Ok(()) => channel.complete_send(handler, Ok(())),
                            Err(code) => {
                                channel.complete_send(handler, Err(code));
                                channel.stop(code);
                                break;
                            }
                        }
                    }
                }
            }

            // Complete every queued handler with the stop code, exactly once.
            let code = channel.stop_code().unwrap_or(NetworkError::ChannelStopped);
            queue.close();
            while let Ok((_, handler)) = queue.try_recv() {
                channel.complete_send(handler, Err(code));
            }

            transport.shutdown().await;
        });
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel {} [{}]", self.inner.id, self.inner.authority)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("authority", &self.inner.authority)
            .field("inbound", &self.inner.inbound)
            .field("stopped", &self.stop_code())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportWriter;
    use bitcoin::consensus::encode;
    use bitcoin::p2p::message::RawNetworkMessage;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc as test_mpsc;

    async fn socket_pair() -> (Socket, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let dial = tokio::spawn(TcpStream::connect(address));
        let (accepted, _) = listener.accept().await.unwrap();
        let remote = dial.await.unwrap().unwrap();
        (Socket::new(accepted).unwrap(), remote)
    }

    fn test_settings() -> Arc<Settings> {
        let mut settings = Settings::default();
        settings.channel_buffer = 8;
        settings.channel_inactivity = Duration::from_secs(5);
        settings.channel_expiration = Duration::from_secs(30);
        Arc::new(settings)
    }

    fn test_channel(socket: Socket, settings: Arc<Settings>) -> Channel {
        let channel = Channel::new(socket, 1, 42, false, settings);
        channel.start();
        channel
    }

    #[tokio::test]
    async fn test_subscriber_receives_message() {
        let (socket, remote) = socket_pair().await;
        let channel = test_channel(socket, test_settings());

        let (tx, mut rx) = test_mpsc::unbounded_channel();
        channel
            .subscribe(
                "ping",
                Box::new(move |event| {
                    if let Ok(NetworkMessage::Ping(nonce)) = event {
                        let _ = tx.send(*nonce);
                    }
                    true
                }),
            )
            .unwrap();
        channel.resume();

        let (_, write_half) = remote.into_split();
        let mut writer = TransportWriter::new(Magic::BITCOIN, write_half);
        writer.write(NetworkMessage::Ping(7)).await.unwrap();

        assert_eq!(rx.recv().await, Some(7));
    }

    #[tokio::test]
    async fn test_paused_channel_defers_messages() {
        let (socket, remote) = socket_pair().await;
        let channel = test_channel(socket, test_settings());

        let (tx, mut rx) = test_mpsc::unbounded_channel();
        channel
            .subscribe(
                "ping",
                Box::new(move |event| {
                    if let Ok(NetworkMessage::Ping(nonce)) = event {
                        let _ = tx.send(*nonce);
                    }
                    true
                }),
            )
            .unwrap();

        let (_, write_half) = remote.into_split();
        let mut writer = TransportWriter::new(Magic::BITCOIN, write_half);
        writer.write(NetworkMessage::Ping(7)).await.unwrap();

        // Still paused: nothing observed.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        channel.resume();
        assert_eq!(rx.recv().await, Some(7));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (socket, _remote) = socket_pair().await;
        let channel = test_channel(socket, test_settings());

        let (tx, mut rx) = test_mpsc::unbounded_channel();
        let notify = tx.clone();
        channel.subscribe_stop(Box::new(move |code| {
            let _ = notify.send(code);
        }));

        channel.stop(NetworkError::InvalidChecksum);
        channel.stop(NetworkError::BadStream);

        assert_eq!(rx.recv().await, Some(NetworkError::InvalidChecksum));

        // Late subscription still observes the first code, exactly once.
        channel.subscribe_stop(Box::new(move |code| {
            let _ = tx.send(code);
        }));
        assert_eq!(rx.recv().await, Some(NetworkError::InvalidChecksum));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_completions_fifo() {
        let (socket, remote) = socket_pair().await;
        let channel = test_channel(socket, test_settings());
        channel.resume();

        let (tx, mut rx) = test_mpsc::unbounded_channel();
        for index in 0..5u64 {
            let tx = tx.clone();
            channel.send_with(
                NetworkMessage::Ping(index),
                Box::new(move |result| {
                    assert!(result.is_ok());
                    let _ = tx.send(index);
                }),
            );
        }

        for expected in 0..5u64 {
            assert_eq!(rx.recv().await, Some(expected));
        }
        drop(remote);
    }

    #[tokio::test]
    async fn test_send_overflow_is_oversubscribed() {
        let (socket, _remote) = socket_pair().await;
        let mut settings = Settings::default();
        settings.channel_buffer = 1;

        // Never started: the queue cannot drain, so the second send overflows.
        let channel = Channel::new(socket, 1, 42, false, Arc::new(settings));

        let (tx, mut rx) = test_mpsc::unbounded_channel();
        channel.send(NetworkMessage::Ping(1));
        channel.send_with(
            NetworkMessage::Ping(2),
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );

        assert_eq!(rx.recv().await, Some(Err(NetworkError::Oversubscribed)));
    }

    #[tokio::test]
    async fn test_invalid_magic_stops_channel() {
        let (socket, remote) = socket_pair().await;
        let channel = test_channel(socket, test_settings());
        channel.resume();

        let raw = RawNetworkMessage::new(Magic::TESTNET4, NetworkMessage::Ping(1));
        let mut remote = remote;
        remote.write_all(&encode::serialize(&raw)).await.unwrap();

        assert_eq!(channel.stopped().await, NetworkError::InvalidMagic);
    }

    #[tokio::test]
    async fn test_peer_disconnect_stops_channel() {
        let (socket, remote) = socket_pair().await;
        let channel = test_channel(socket, test_settings());
        channel.resume();

        drop(remote);
        assert_eq!(channel.stopped().await, NetworkError::ChannelDropped);
    }

    #[tokio::test]
    async fn test_inactivity_drops_channel() {
        let (socket, _remote) = socket_pair().await;
        let mut settings = Settings::default();
        settings.channel_inactivity = Duration::from_millis(50);
        let channel = test_channel(socket, Arc::new(settings));
        channel.resume();

        assert_eq!(channel.stopped().await, NetworkError::ChannelDropped);
    }

    #[tokio::test]
    async fn test_expiration_times_out_channel() {
        let (socket, _remote) = socket_pair().await;
        let mut settings = Settings::default();
        settings.channel_expiration = Duration::from_millis(50);
        let channel = test_channel(socket, Arc::new(settings));
        channel.resume();

        assert_eq!(channel.stopped().await, NetworkError::ChannelTimeout);
    }

    #[tokio::test]
    async fn test_message_subscribers_closed_on_stop() {
        let (socket, _remote) = socket_pair().await;
        let channel = test_channel(socket, test_settings());

        let (tx, mut rx) = test_mpsc::unbounded_channel();
        channel
            .subscribe(
                "ping",
                Box::new(move |event| {
                    let _ = tx.send(event.err());
                    true
                }),
            )
            .unwrap();

        channel.stop(NetworkError::ServiceStopped);
        assert_eq!(rx.recv().await, Some(Some(NetworkError::ChannelStopped)));

        // Subscriptions after stop are refused.
        let result = channel.subscribe("pong", Box::new(|_| true));
        assert_eq!(result, Err(NetworkError::ChannelStopped));
    }

    #[tokio::test]
    async fn test_unknown_command_delivered_generically() {
        let (socket, remote) = socket_pair().await;
        let channel = test_channel(socket, test_settings());

        let (tx, mut rx) = test_mpsc::unbounded_channel();
        channel
            .subscribe(
                "unknown",
                Box::new(move |event| {
                    if let Ok(NetworkMessage::Unknown { command, .. }) = event {
                        let _ = tx.send(command.to_string());
                    }
                    true
                }),
            )
            .unwrap();
        channel.resume();

        let raw = RawNetworkMessage::new(
            Magic::BITCOIN,
            NetworkMessage::Unknown {
                command: "bogus".to_string().try_into().unwrap(),
                payload: Vec::new(),
            },
        );
        let mut remote = remote;
        remote.write_all(&encode::serialize(&raw)).await.unwrap();

        assert_eq!(rx.recv().await, Some("bogus".to_string()));
    }
}
