//! BIP-61 reject notifications; observed and logged, never acted on.

use crate::net::Channel;
use bitcoin::p2p::message::NetworkMessage;
use log::debug;
use std::sync::Arc;

/// Accepts peer reject notifications for diagnostics.
pub struct ProtocolReject70002 {
    channel: Channel,
}

impl ProtocolReject70002 {
    pub fn new(channel: Channel) -> Arc<Self> {
        Arc::new(ProtocolReject70002 { channel })
    }

    pub fn start(self: Arc<Self>) {
        let protocol = self.clone();
        let _ = self.channel.subscribe(
            "reject",
            Box::new(move |event| match event {
                Ok(NetworkMessage::Reject(reject)) => {
                    debug!(
                        "Peer [{}] rejected {} ({:?}): {}",
                        protocol.channel.authority(),
                        reject.message,
                        reject.ccode,
                        reject.reason
                    );
                    true
                }
                Ok(_) => true,
                Err(_) => false,
            }),
        );
    }
}
