//! Application messages exchanged between nodes.

use serde::{Deserialize, Serialize};

/// Protocol version byte used by [`crate::transport::VersionHandshake`].
pub const PROTOCOL_VERSION: u8 = 1;

/// Decoded form of an envelope payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Sender's self-reported address; empty when unknown. Routing uses the envelope's `from`.
    pub from: String,
    pub payload: Payload,
}

/// All message kinds. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Intent to store `key`. Exactly `size` raw bytes follow the frame on the same stream.
    StoreFile { key: String, size: u64 },
}

impl Message {
    pub fn store_file(from: impl Into<String>, key: impl Into<String>, size: u64) -> Self {
        Self {
            from: from.into(),
            payload: Payload::StoreFile {
                key: key.into(),
                size,
            },
        }
    }
}
