//! Connection primitives: sockets, listeners, dialers and the channel.

mod acceptor;
mod channel;
mod connector;
mod socket;

pub use acceptor::Acceptor;
pub use channel::{Channel, MessageHandler, SendHandler, StopHandler};
pub use connector::Connector;
pub use socket::Socket;
