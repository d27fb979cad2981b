//! Length-prefixed framing for wire messages.
//!
//! Each message travels as a big-endian `u32` payload length followed by the
//! payload. A reader never assumes one transport read carries exactly one
//! message: partial headers and payloads are reassembled here.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::wire::{WireError, WireMessage};

/// Size of the length prefix.
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest accepted payload. Real messages are well under 600 bytes.
pub const MAX_FRAME: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame length {0} exceeds maximum {}", MAX_FRAME)]
    TooLarge(usize),

    #[error("zero-length frame")]
    Empty,

    #[error("connection closed in the middle of a frame")]
    Truncated,

    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Read one frame payload.
///
/// Returns `Ok(None)` on a clean EOF at a frame boundary.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Bytes>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    let mut filled = 0;
    while filled < FRAME_HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(FrameError::Truncated)
            };
        }
        filled += n;
    }

    let len = u32::from_be_bytes(header) as usize;
    if len == 0 {
        return Err(FrameError::Empty);
    }
    if len > MAX_FRAME {
        return Err(FrameError::TooLarge(len));
    }

    let mut payload = BytesMut::zeroed(len);
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            FrameError::Truncated
        } else {
            FrameError::Io(e)
        }
    })?;
    Ok(Some(payload.freeze()))
}

/// Write one frame and flush it.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    if payload.is_empty() {
        return Err(FrameError::Empty);
    }
    if payload.len() > MAX_FRAME {
        return Err(FrameError::TooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read and decode one message. `Ok(None)` on clean EOF.
pub async fn read_message<T, R>(reader: &mut R) -> Result<Option<T>, FrameError>
where
    T: WireMessage,
    R: AsyncRead + Unpin,
{
    match read_frame(reader).await? {
        Some(payload) => Ok(Some(T::decode(&payload)?)),
        None => Ok(None),
    }
}

/// Encode and write one message.
pub async fn write_message<T, W>(writer: &mut W, message: &T) -> Result<(), FrameError>
where
    T: WireMessage,
    W: AsyncWrite + Unpin,
{
    let payload = message.encode()?;
    write_frame(writer, &payload).await
}
