//! Deprecated alert messages; parsed and discarded.

use crate::net::Channel;
use bitcoin::p2p::message::NetworkMessage;
use log::debug;
use std::sync::Arc;

/// Swallows alert messages from peers still sending them.
pub struct ProtocolAlert311 {
    channel: Channel,
}

impl ProtocolAlert311 {
    pub fn new(channel: Channel) -> Arc<Self> {
        Arc::new(ProtocolAlert311 { channel })
    }

    pub fn start(self: Arc<Self>) {
        let protocol = self.clone();
        let _ = self.channel.subscribe(
            "alert",
            Box::new(move |event| match event {
                Ok(NetworkMessage::Alert(payload)) => {
                    debug!(
                        "Discarding deprecated alert ({} bytes) from [{}]",
                        payload.len(),
                        protocol.channel.authority()
                    );
                    true
                }
                Ok(_) => true,
                Err(_) => false,
            }),
        );
    }
}
