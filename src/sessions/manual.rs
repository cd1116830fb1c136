//! Session maintaining operator-configured peers.

use crate::error::NetworkError;
use crate::net::Connector;
use crate::p2p::NetworkInner;
use crate::sessions::{Session, SessionContext};
use log::{debug, info};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

type Completion = oneshot::Sender<Result<(), NetworkError>>;

/// Dials requested endpoints and keeps them connected: failures re-dial
/// after the retry delay, a stopped channel re-dials immediately, forever,
/// until the session stops.
pub struct ManualSession {
    context: SessionContext,
    endpoints: Mutex<HashSet<String>>,
}

impl Session for ManualSession {
    fn context(&self) -> &SessionContext {
        &self.context
    }

    fn inbound(&self) -> bool {
        false
    }

    fn notify(&self) -> bool {
        true
    }
}

impl ManualSession {
    pub(crate) fn new(network: Arc<NetworkInner>) -> Arc<Self> {
        Arc::new(ManualSession {
            context: SessionContext::new(network),
            endpoints: Mutex::new(HashSet::new()),
        })
    }

    pub(crate) fn start(&self) -> Result<(), NetworkError> {
        self.context.start()
    }

    /// Stop dialing and stop pending channels.
    pub(crate) fn stop(&self) {
        self.context.stop();
    }

    /// The endpoints this session maintains.
    pub fn endpoints(&self) -> Vec<String> {
        self.endpoints
            .lock()
            .expect("manual session poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Maintain a connection to `endpoint`, resolving once the first attempt
    /// lands a handshaken channel, or with
    /// [`NetworkError::ServiceStopped`] when the session stops first.
    /// Transient dial failures keep retrying without resolving.
    pub(crate) async fn connect(self: Arc<Self>, endpoint: &str) -> Result<(), NetworkError> {
        if self.context.stopped() {
            return Err(NetworkError::ServiceStopped);
        }

        let (completion, landed) = oneshot::channel();
        Self::spawn_maintain(&self, endpoint.to_string(), Some(completion));

        landed.await.unwrap_or(Err(NetworkError::ServiceStopped))
    }

    /// Maintain a connection without waiting on the first outcome.
    pub(crate) fn connect_detached(self: Arc<Self>, endpoint: &str) {
        Self::spawn_maintain(&self, endpoint.to_string(), None);
    }

    fn spawn_maintain(this: &Arc<Self>, endpoint: String, completion: Option<Completion>) {
        this.endpoints
            .lock()
            .expect("manual session poisoned")
            .insert(endpoint.clone());

        let session = this.clone();
        tokio::spawn(session.maintain(endpoint, completion));
    }

    async fn maintain(self: Arc<Self>, endpoint: String, mut completion: Option<Completion>) {
        info!("Maintaining connection to {endpoint}");
        let retry = self.context.settings().connect_timeout;

        loop {
            if self.context.stopped() {
                if let Some(completion) = completion.take() {
                    let _ = completion.send(Err(NetworkError::ServiceStopped));
                }
                break;
            }

            let connector = Connector::new(retry);
            let mut stop = self.context.stop_signal();

            let connected = tokio::select! {
                _ = stop.wait_for(|stop| *stop) => continue,
                connected = connector.connect(&endpoint) => connected,
            };

            let socket = match connected {
                Ok(socket) => socket,
                Err(code) => {
                    debug!("Manual connect to {endpoint} failed: {code}");
                    self.context.delay(retry).await;
                    continue;
                }
            };

            let channel = self.context.network().create_channel(socket, false);
            match self.start_channel(&channel).await {
                Ok(()) => {
                    if let Some(completion) = completion.take() {
                        let _ = completion.send(Ok(()));
                    }

                    let code = self.watch_channel(&channel).await;
                    debug!("Manual channel to {endpoint} stopped: {code}");
                    // Re-dial the same endpoint immediately.
                }
                Err(NetworkError::ServiceStopped) => continue,
                Err(code) => {
                    debug!("Manual channel to {endpoint} failed: {code}");
                    self.context.delay(retry).await;
                }
            }
        }

        debug!("Stopped maintaining {endpoint}");
    }
}
