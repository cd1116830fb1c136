//! Unified error taxonomy for the networking stack.
//!
//! Every failure in the crate surfaces as a [`NetworkError`] code. Errors are
//! never propagated by unwinding across tasks; they are delivered to handlers
//! and completion channels as plain values. Operating system errors are
//! funneled through [`NetworkError::from_io`] before they reach any caller so
//! the rest of the crate only ever reasons about this one set of codes.

use std::error::Error;
use std::fmt;
use std::io;

/// Stable error codes for the peer-to-peer networking core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkError {
    /// An error that could not be classified.
    Unknown,
    /// A start was skipped because it is not configured, without failure.
    Bypassed,
    /// The operation could not be performed.
    OperationFailed,
    /// The operation was canceled before completion.
    OperationCanceled,
    /// The operation took too long to complete.
    OperationTimeout,

    /// The address pool has no address to give out.
    AddressNotFound,
    /// The address is blocked by policy.
    AddressBlocked,
    /// The address is already connected or otherwise in use.
    AddressInUse,
    /// No seed contributed any address to the pool.
    SeedingUnsuccessful,

    /// Failed to load a file.
    FileLoad,
    /// Failed to save a file.
    FileSave,
    /// A file system error occurred.
    FileSystem,

    /// The data stream is corrupt.
    BadStream,

    /// The listener could not be started.
    ListenFailed,
    /// An incoming connection could not be accepted.
    AcceptFailed,
    /// The service is at capacity.
    Oversubscribed,

    /// Hostname resolution failed.
    ResolveFailed,
    /// The remote host could not be reached.
    ConnectFailed,

    /// The message heading could not be parsed.
    InvalidHeading,
    /// The message heading magic does not match the configured network.
    InvalidMagic,
    /// The message payload exceeds the configured maximum.
    OversizedPayload,
    /// The message checksum does not match the payload.
    InvalidChecksum,
    /// The message payload failed to deserialize.
    InvalidMessage,
    /// The message command is not recognized.
    UnknownMessage,

    /// The peer violated the protocol.
    ProtocolViolation,
    /// The local configuration is invalid.
    InvalidConfiguration,
    /// The connection conflicts with one of our own (self-connect).
    ChannelConflict,

    /// The channel timed out.
    ChannelTimeout,
    /// The channel went inactive and was dropped.
    ChannelDropped,
    /// The channel was stopped.
    ChannelStopped,
    /// The owning service was stopped.
    ServiceStopped,
    /// The subscriber was stopped.
    SubscriberStopped,
}

impl NetworkError {
    /// Classify an operating system error into a network error code.
    ///
    /// Only the portable [`io::ErrorKind`] values are inspected; anything
    /// unmatched collapses to [`NetworkError::Unknown`].
    pub fn from_io(error: &io::Error) -> Self {
        use io::ErrorKind::*;

        match error.kind() {
            Interrupted | ConnectionAborted | WouldBlock => NetworkError::OperationCanceled,
            ConnectionRefused | ConnectionReset | NotConnected | PermissionDenied => {
                NetworkError::OperationFailed
            }
            AddrNotAvailable => NetworkError::ResolveFailed,
            BrokenPipe | HostUnreachable | NetworkUnreachable => NetworkError::ConnectFailed,
            AddrInUse | AlreadyExists => NetworkError::AddressInUse,
            InvalidData | InvalidInput | WriteZero => NetworkError::BadStream,
            UnexpectedEof => NetworkError::ChannelDropped,
            TimedOut => NetworkError::ChannelTimeout,
            NotFound => NetworkError::FileSystem,
            _ => NetworkError::Unknown,
        }
    }
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            NetworkError::Unknown => "unknown error",
            NetworkError::Bypassed => "start bypassed without failure",
            NetworkError::OperationFailed => "operation failed",
            NetworkError::OperationCanceled => "operation canceled",
            NetworkError::OperationTimeout => "operation timed out",
            NetworkError::AddressNotFound => "address not found",
            NetworkError::AddressBlocked => "address blocked by policy",
            NetworkError::AddressInUse => "address already in use",
            NetworkError::SeedingUnsuccessful => "seeding unsuccessful",
            NetworkError::FileLoad => "failed to load file",
            NetworkError::FileSave => "failed to save file",
            NetworkError::FileSystem => "file system error",
            NetworkError::BadStream => "bad data stream",
            NetworkError::ListenFailed => "incoming connection failed",
            NetworkError::AcceptFailed => "connection acceptance failed",
            NetworkError::Oversubscribed => "service oversubscribed",
            NetworkError::ResolveFailed => "resolving hostname failed",
            NetworkError::ConnectFailed => "unable to reach remote host",
            NetworkError::InvalidHeading => "invalid message heading",
            NetworkError::InvalidMagic => "invalid message heading magic",
            NetworkError::OversizedPayload => "oversize message payload",
            NetworkError::InvalidChecksum => "invalid message checksum",
            NetworkError::InvalidMessage => "message failed to deserialize",
            NetworkError::UnknownMessage => "unknown message type",
            NetworkError::ProtocolViolation => "protocol violation",
            NetworkError::InvalidConfiguration => "invalid configuration",
            NetworkError::ChannelConflict => "connection to self detected",
            NetworkError::ChannelTimeout => "connection timed out",
            NetworkError::ChannelDropped => "channel dropped",
            NetworkError::ChannelStopped => "channel stopped",
            NetworkError::ServiceStopped => "service stopped",
            NetworkError::SubscriberStopped => "subscriber stopped",
        };

        write!(f, "{message}")
    }
}

impl Error for NetworkError {}

impl From<io::Error> for NetworkError {
    fn from(error: io::Error) -> Self {
        NetworkError::from_io(&error)
    }
}
