//! Length-prefixed framing shared by the IME bridge socket and the
//! command channel socket.
//!
//! Frame: 4-byte little-endian length `L`, then `L` bytes of UTF-8 payload.
//! `L > MAX_MESSAGE_SIZE` is refused without reading the payload. Senders
//! that expect a reply read back a single acknowledgment byte.
//!
//! Payload is a raw UTF-8 string rather than a JSON envelope, and the
//! length ceiling is the 1 MiB limit shared by both socket families.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum payload size for any frame on these sockets.
pub const MAX_MESSAGE_SIZE: u32 = 1024 * 1024;

/// A single acknowledgment byte written after a frame is accepted.
pub const ACK_BYTE: u8 = 0x01;

#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("payload too large: {0} bytes (max {MAX_MESSAGE_SIZE})")]
    TooLarge(u32),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Write one length-prefixed UTF-8 frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &str) -> Result<(), FramingError> {
    let bytes = payload.as_bytes();
    let len = bytes.len() as u32;
    if len > MAX_MESSAGE_SIZE {
        return Err(FramingError::TooLarge(len));
    }
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed UTF-8 frame. Returns `None` on clean EOF before
/// any length prefix arrives (the peer closed the connection).
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<String>, FramingError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(len_buf);
    if len > MAX_MESSAGE_SIZE {
        return Err(FramingError::TooLarge(len));
    }

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    let text = String::from_utf8_lossy(&buf).into_owned();
    Ok(Some(text))
}

/// Write the single acknowledgment byte.
pub async fn write_ack<W: AsyncWrite + Unpin>(writer: &mut W) -> std::io::Result<()> {
    writer.write_all(&[ACK_BYTE]).await?;
    writer.flush().await
}

/// Read back the single acknowledgment byte.
pub async fn read_ack<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<()> {
    let mut byte = [0u8; 1];
    reader.read_exact(&mut byte).await?;
    Ok(())
}
