//! Framing: length-prefix (4 bytes LE) + bincode payload.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::protocol::Message;

pub const LEN_SIZE: usize = 4;
pub const DEFAULT_MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Serialize a message body (no length prefix). This is what an envelope carries.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    bincode::serialize(msg).map_err(FrameEncodeError::Encode)
}

/// Parse an envelope payload back into a message.
pub fn decode_message(body: &[u8]) -> Result<Message, bincode::Error> {
    bincode::deserialize(body)
}

/// Encode a message into a single frame: 4 bytes LE length + bincode payload.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = encode_message(msg)?;
    frame_bytes(&payload, DEFAULT_MAX_FRAME_LEN)
}

/// Prefix an already encoded body with its length.
pub fn frame_bytes(body: &[u8], max_frame_len: u32) -> Result<Vec<u8>, FrameEncodeError> {
    let len = u32::try_from(body.len()).map_err(|_| FrameEncodeError::TooLarge)?;
    if len > max_frame_len {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + body.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(body);
    Ok(out)
}

/// Error encoding a message into a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Read one frame body from `reader`.
///
/// Oversized and empty frames are consumed and reported, so the stream stays
/// aligned on the next length prefix.
pub async fn read_frame<R>(reader: &mut R, max_frame_len: u32) -> Result<Vec<u8>, FrameDecodeError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; LEN_SIZE];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf);
    if len == 0 {
        return Err(FrameDecodeError::Empty);
    }
    if len > max_frame_len {
        let mut skipped = (&mut *reader).take(u64::from(len));
        let n = tokio::io::copy(&mut skipped, &mut tokio::io::sink()).await?;
        if n < u64::from(len) {
            return Err(FrameDecodeError::Closed);
        }
        return Err(FrameDecodeError::TooLarge(len));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Error decoding a frame. Only [`FrameDecodeError::Closed`] ends a connection outright.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("connection closed")]
    Closed,
    #[error("frame too large: {0} bytes")]
    TooLarge(u32),
    #[error("empty frame")]
    Empty,
    #[error("io error: {0}")]
    Io(io::Error),
}

impl FrameDecodeError {
    pub fn is_closed(&self) -> bool {
        matches!(self, FrameDecodeError::Closed)
    }
}

impl From<io::Error> for FrameDecodeError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe => FrameDecodeError::Closed,
            _ => FrameDecodeError::Io(e),
        }
    }
}
