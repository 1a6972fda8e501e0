//! Peer-to-peer blob node: key-addressed local store, pluggable peer transport
//! with a TCP implementation, and the file server that ties them together.

pub mod path;
pub mod protocol;
pub mod server;
pub mod store;
pub mod tcp;
pub mod transport;
pub mod wire;

pub use path::{cas_path_transform, PathKey, PathTransform, DEFAULT_SHARD_WIDTH};
pub use protocol::{Message, Payload, PROTOCOL_VERSION};
pub use server::{FileServer, FileServerOpts, PeerRegistry, ServerError};
pub use store::{Store, StoreError};
pub use tcp::{TcpPeer, TcpTransport, TcpTransportOpts, MAX_DECODE_ERRORS};
pub use transport::{
    Decoder, Envelope, Handshake, HandshakeError, LengthPrefixDecoder, NopHandshake, Peer,
    PeerHandler, Transport, TransportError, VersionHandshake,
};
pub use wire::{decode_message, encode_frame, FrameDecodeError, FrameEncodeError};
