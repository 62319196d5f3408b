use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;
use crate::messages::{ControlMessage, SignalMessage};

/// Maximum frame payload size: 64 KiB.
pub const MAX_MSG_SIZE: u32 = 65_536;

/// Well-known TCP port peers listen on for signaling.
pub const SIGNALING_PORT: u16 = 10001;

/// Encode a signaling message into its JSON document (no length prefix).
pub fn encode_signal(msg: &SignalMessage) -> Result<Vec<u8>, ProtocolError> {
    Ok(serde_json::to_vec(msg)?)
}

/// Decode a signaling message from a JSON document. Unknown or missing
/// `action` values are errors.
pub fn decode_signal(payload: &[u8]) -> Result<SignalMessage, ProtocolError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Encode an in-band control message with postcard.
pub fn encode_control(msg: &ControlMessage) -> Result<Vec<u8>, ProtocolError> {
    Ok(postcard::to_allocvec(msg)?)
}

pub fn decode_control(payload: &[u8]) -> Result<ControlMessage, ProtocolError> {
    Ok(postcard::from_bytes(payload)?)
}

/// Prefix `payload` with its big-endian u32 length.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if payload.len() > MAX_MSG_SIZE as usize {
        return Err(ProtocolError::MessageTooLarge(payload.len()));
    }
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Attempt to extract one complete length-prefixed frame from a byte buffer.
///
/// Returns `Ok(Some(payload))` if a complete message is available,
/// `Ok(None)` if more data is needed, or `Err` if the message is too large.
///
/// Advances the buffer past the consumed frame.
pub fn try_decode_frame(buf: &mut BytesMut) -> Result<Option<Vec<u8>>, ProtocolError> {
    if buf.len() < 4 {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_MSG_SIZE as usize {
        tracing::warn!(length, "rejecting oversized frame");
        return Err(ProtocolError::MessageTooLarge(length));
    }

    if buf.len() < 4 + length {
        return Ok(None);
    }

    buf.advance(4);
    let payload = buf.split_to(length).to_vec();
    Ok(Some(payload))
}

/// Write one frame. `write_all` loops over partial writes.
pub async fn write_message<W>(writer: &mut W, payload: &[u8]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = encode_frame(payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads length-prefixed frames from a byte stream, buffering partial reads.
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Wait for the next complete frame.
    ///
    /// Returns `Ok(None)` when the peer closed the stream cleanly between
    /// frames. Closing in the middle of a frame is an error. Cancel-safe:
    /// bytes already read stay buffered for the next call.
    pub async fn read_message(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        loop {
            if let Some(payload) = try_decode_frame(&mut self.buf)? {
                return Ok(Some(payload));
            }

            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(ProtocolError::Truncated {
                    buffered: self.buf.len(),
                });
            }
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}
