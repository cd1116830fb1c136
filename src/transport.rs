//! Bitcoin v1 protocol framing.
//!
//! Implements the plaintext bitcoin wire framing: a 24-byte heading (magic,
//! command, payload length, checksum) followed by the payload. The reader
//! validates in stages so a hostile frame is rejected as early as possible:
//! the magic is checked before anything else, the declared length is checked
//! against the configured maximum *before the payload is read*, and the
//! double-sha256 checksum is verified before deserialization is attempted.
//! Payload decoding itself is delegated to the `bitcoin` crate.

use crate::error::NetworkError;
use bitcoin::consensus::encode;
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::p2p::message::{NetworkMessage, RawNetworkMessage};
use bitcoin::p2p::Magic;
use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of a bitcoin message heading in bytes.
pub const HEADING_SIZE: usize = 24;
/// Offset in the heading where the payload length is stored.
const PAYLOAD_LENGTH_OFFSET: usize = 16;
/// Offset in the heading where the payload checksum is stored.
const CHECKSUM_OFFSET: usize = 20;

/// State machine for the [`TransportReader`] read method.
///
/// Tracking progress across interruptions makes `read` cancellation safe: it
/// can be raced in `tokio::select!` and resumed later without losing
/// partially read bytes.
#[derive(Debug)]
enum ReadState {
    /// Reading the 24-byte heading.
    Heading {
        heading: [u8; HEADING_SIZE],
        bytes_read: usize,
    },
    /// Reading the payload; the buffer holds heading then payload.
    Payload { buffer: Vec<u8>, bytes_read: usize },
}

impl ReadState {
    fn heading() -> Self {
        ReadState::Heading {
            heading: [0u8; HEADING_SIZE],
            bytes_read: 0,
        }
    }

    fn payload(heading: [u8; HEADING_SIZE], payload_length: usize) -> Self {
        let mut buffer = Vec::with_capacity(HEADING_SIZE + payload_length);
        buffer.extend_from_slice(&heading);
        buffer.resize(HEADING_SIZE + payload_length, 0);

        ReadState::Payload {
            buffer,
            bytes_read: HEADING_SIZE,
        }
    }
}

/// Receiver half of the v1 framing.
#[derive(Debug)]
pub struct TransportReader<R> {
    magic: Magic,
    maximum_payload: usize,
    state: ReadState,
    reader: R,
}

impl<R> TransportReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    /// Create a reader for the given network magic and payload cap.
    pub fn new(magic: Magic, maximum_payload: usize, reader: R) -> Self {
        TransportReader {
            magic,
            maximum_payload,
            state: ReadState::heading(),
            reader,
        }
    }

    /// Read one message off the wire.
    ///
    /// Cancellation safe: partial progress survives interruption and resumes
    /// on the next call.
    pub async fn read(&mut self) -> Result<NetworkMessage, NetworkError> {
        loop {
            match &mut self.state {
                ReadState::Heading {
                    heading,
                    bytes_read,
                } => {
                    while *bytes_read < HEADING_SIZE {
                        let n = self
                            .reader
                            .read(&mut heading[*bytes_read..])
                            .await
                            .map_err(|error| NetworkError::from_io(&error))?;
                        if n == 0 {
                            return Err(NetworkError::ChannelDropped);
                        }
                        *bytes_read += n;
                    }

                    if heading[0..4] != self.magic.to_bytes() {
                        return Err(NetworkError::InvalidMagic);
                    }

                    let payload_length = u32::from_le_bytes([
                        heading[PAYLOAD_LENGTH_OFFSET],
                        heading[PAYLOAD_LENGTH_OFFSET + 1],
                        heading[PAYLOAD_LENGTH_OFFSET + 2],
                        heading[PAYLOAD_LENGTH_OFFSET + 3],
                    ]) as usize;

                    // Refuse before reading the body.
                    if payload_length > self.maximum_payload {
                        return Err(NetworkError::OversizedPayload);
                    }

                    self.state = ReadState::payload(*heading, payload_length);
                }

                ReadState::Payload { buffer, bytes_read } => {
                    while *bytes_read < buffer.len() {
                        let n = self
                            .reader
                            .read(&mut buffer[*bytes_read..])
                            .await
                            .map_err(|error| NetworkError::from_io(&error))?;
                        if n == 0 {
                            return Err(NetworkError::ChannelDropped);
                        }
                        *bytes_read += n;
                    }

                    let payload = &buffer[HEADING_SIZE..];
                    let digest = sha256d::Hash::hash(payload);
                    if digest.as_byte_array()[0..4]
                        != buffer[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4]
                    {
                        return Err(NetworkError::InvalidChecksum);
                    }

                    let raw: RawNetworkMessage = encode::deserialize(buffer).map_err(|error| {
                        debug!("Message failed to deserialize: {error}");
                        NetworkError::InvalidMessage
                    })?;

                    let message = raw.payload().clone();
                    self.state = ReadState::heading();
                    return Ok(message);
                }
            }
        }
    }
}

/// Sender half of the v1 framing.
#[derive(Debug)]
pub struct TransportWriter<W> {
    magic: Magic,
    writer: W,
}

impl<W> TransportWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// Create a writer for the given network magic.
    pub fn new(magic: Magic, writer: W) -> Self {
        TransportWriter { magic, writer }
    }

    /// Frame and write one message.
    pub async fn write(&mut self, message: NetworkMessage) -> Result<(), NetworkError> {
        let raw = RawNetworkMessage::new(self.magic, message);
        let bytes = encode::serialize(&raw);

        self.writer
            .write_all(&bytes)
            .await
            .map_err(|error| NetworkError::from_io(&error))?;
        self.writer
            .flush()
            .await
            .map_err(|error| NetworkError::from_io(&error))?;

        Ok(())
    }

    /// Flush and close the underlying writer.
    pub async fn shutdown(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}
