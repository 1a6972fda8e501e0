//! Peer and transport capabilities. The file server only talks to these traits,
//! so the concrete transport can be swapped without touching it.

use std::fmt;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::OwnedMutexGuard;

use crate::protocol::PROTOCOL_VERSION;
use crate::wire::{self, FrameDecodeError, DEFAULT_MAX_FRAME_LEN};

/// Buffered read side of a connection. Shared by the read loop (frame
/// decoding) and the consumer (draining trailing raw streams).
pub type PeerReader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;

/// Exclusive access to a peer's read side for as long as the guard lives.
pub type PeerReaderGuard = OwnedMutexGuard<PeerReader>;

/// A live bidirectional byte-stream endpoint.
#[async_trait]
pub trait Peer: Send + Sync {
    /// Stable identity of this connection in the peer registry.
    fn remote_addr(&self) -> &str;

    /// True if this side dialed the connection.
    fn is_outbound(&self) -> bool;

    async fn send(&self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Write `frame` followed by all of `payload` while holding the writer, so no
    /// other frame can land between a message and its trailing stream.
    async fn send_with_payload(
        &self,
        frame: &[u8],
        payload: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64, TransportError>;

    /// Lock the read side. The read loop does not decode while this is held.
    async fn reader(&self) -> PeerReaderGuard;

    /// Let the paused read loop decode the next frame.
    fn resume(&self);

    /// Envelopes from this peer that are waiting for [`Peer::resume`].
    fn in_flight(&self) -> usize;

    fn is_closed(&self) -> bool;

    /// Close the connection and stop its read loop. Idempotent.
    async fn close(&self) -> Result<(), TransportError>;
}

/// One decoded frame, tagged with the connection it came from.
pub struct Envelope {
    pub from: String,
    pub payload: Vec<u8>,
    /// Handle of the originating connection.
    pub origin: Arc<dyn Peer>,
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("from", &self.from)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Callbacks a transport fires over a connection's lifetime.
pub trait PeerHandler: Send + Sync {
    /// Called right after a successful handshake. An error closes the connection.
    fn on_peer(&self, peer: Arc<dyn Peer>) -> Result<(), TransportError>;

    /// Called once the connection's read loop has ended, with the same handle
    /// `on_peer` received.
    fn on_peer_closed(&self, _peer: &Arc<dyn Peer>) {}
}

/// Connection manager: dial, listen, deliver decoded messages, close.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Install the peer callbacks. Must happen before listening or dialing.
    fn set_handler(&self, handler: Arc<dyn PeerHandler>);

    /// Bound listen address, once listening.
    fn listen_addr(&self) -> Option<String>;

    /// Connect to `addr` and spawn its handling task. Does not wait for the handshake.
    async fn dial(&self, addr: &str) -> Result<(), TransportError>;

    /// Bind and spawn the accept loop. Returns once bound.
    async fn listen_and_accept(&self) -> Result<(), TransportError>;

    /// Next envelope from any connection, first come first served.
    async fn consume(&self) -> Option<Envelope>;

    /// Stop accepting. Established connections stay open.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Pre-protocol step run once per connection.
#[async_trait]
pub trait Handshake: Send + Sync {
    async fn perform(&self, peer: &dyn Peer) -> Result<(), HandshakeError>;
}

/// Accepts every connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopHandshake;

#[async_trait]
impl Handshake for NopHandshake {
    async fn perform(&self, _peer: &dyn Peer) -> Result<(), HandshakeError> {
        Ok(())
    }
}

/// Both sides write one version byte, then read the other's; a mismatch rejects.
#[derive(Debug, Clone, Copy)]
pub struct VersionHandshake {
    version: u8,
}

impl VersionHandshake {
    pub fn new(version: u8) -> Self {
        Self { version }
    }
}

impl Default for VersionHandshake {
    fn default() -> Self {
        Self::new(PROTOCOL_VERSION)
    }
}

#[async_trait]
impl Handshake for VersionHandshake {
    async fn perform(&self, peer: &dyn Peer) -> Result<(), HandshakeError> {
        peer.send(&[self.version])
            .await
            .map_err(|e| HandshakeError::Io(io::Error::new(io::ErrorKind::Other, e)))?;
        let mut buf = [0u8; 1];
        peer.reader().await.read_exact(&mut buf).await?;
        if buf[0] != self.version {
            return Err(HandshakeError::VersionMismatch {
                ours: self.version,
                theirs: buf[0],
            });
        }
        Ok(())
    }
}

/// Frames one message body at a time off a peer's read side.
#[async_trait]
pub trait Decoder: Send + Sync {
    async fn decode(&self, reader: &mut PeerReader) -> Result<Vec<u8>, FrameDecodeError>;
}

/// 4-byte LE length prefix + body, bounded by `max_frame_len`.
#[derive(Debug, Clone, Copy)]
pub struct LengthPrefixDecoder {
    max_frame_len: u32,
}

impl LengthPrefixDecoder {
    pub fn new(max_frame_len: u32) -> Self {
        Self { max_frame_len }
    }
}

impl Default for LengthPrefixDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

#[async_trait]
impl Decoder for LengthPrefixDecoder {
    async fn decode(&self, reader: &mut PeerReader) -> Result<Vec<u8>, FrameDecodeError> {
        wire::read_frame(reader, self.max_frame_len).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("protocol version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch { ours: u8, theirs: u8 },
    #[error("handshake timed out")]
    Timeout,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },
    #[error("failed to dial {addr}: {source}")]
    Dial { addr: String, source: io::Error },
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("peer rejected: {0}")]
    Rejected(String),
    #[error("connection closed")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
