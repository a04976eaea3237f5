//! Length-prefixed framing over the host-guest byte stream.
//!
//! Every message is a `u32` big-endian length followed by that many bytes
//! of payload. The guest writes a single handshake byte when its executor
//! is accepting requests; everything after it is framed.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size (16MB).
///
/// This limit prevents memory exhaustion from malicious or buggy guests.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Written by the guest executor once it is ready to serve.
pub const HANDSHAKE_BYTE: u8 = 0xC7;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The peer closed the stream at a frame boundary.
    #[error("stream closed")]
    Closed,

    /// The stream ended inside a frame.
    #[error("truncated frame")]
    Truncated,

    /// A declared length exceeded [`MAX_FRAME_SIZE`].
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    Oversized(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Writes one framed payload and flushes.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_SIZE {
        return Err(FrameError::Oversized(payload.len()));
    }
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one framed payload.
///
/// # Errors
///
/// [`FrameError::Closed`] if the stream ends cleanly before a length
/// prefix, [`FrameError::Truncated`] if it ends mid-frame, and
/// [`FrameError::Oversized`] before any allocation for a frame whose
/// declared length exceeds the limit.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            return if filled == 0 {
                Err(FrameError::Closed)
            } else {
                Err(FrameError::Truncated)
            };
        }
        filled += n;
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::Oversized(len));
    }

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => FrameError::Truncated,
            _ => FrameError::Io(e),
        })?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"hello").await.unwrap();
        assert_eq!(read_frame(&mut b).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn empty_frame_roundtrips() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame(&mut a, b"").await.unwrap();
        assert!(read_frame(&mut b).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sequential_frames_stay_delimited() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"one").await.unwrap();
        write_frame(&mut a, b"two").await.unwrap();
        assert_eq!(read_frame(&mut b).await.unwrap(), b"one");
        assert_eq!(read_frame(&mut b).await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn clean_eof_is_closed() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(matches!(read_frame(&mut b).await, Err(FrameError::Closed)));
    }

    #[tokio::test]
    async fn eof_inside_header_is_truncated() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[0, 0]).await.unwrap();
        drop(a);
        assert!(matches!(
            read_frame(&mut b).await,
            Err(FrameError::Truncated)
        ));
    }

    #[tokio::test]
    async fn eof_inside_payload_is_truncated() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&8u32.to_be_bytes()).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        drop(a);
        assert!(matches!(
            read_frame(&mut b).await,
            Err(FrameError::Truncated)
        ));
    }

    #[tokio::test]
    async fn oversized_header_rejected_before_alloc() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(u32::MAX).to_be_bytes()).await.unwrap();
        assert!(matches!(
            read_frame(&mut b).await,
            Err(FrameError::Oversized(_))
        ));
    }

    #[tokio::test]
    async fn oversized_write_rejected() {
        let (mut a, _b) = tokio::io::duplex(64);
        let big = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(matches!(
            write_frame(&mut a, &big).await,
            Err(FrameError::Oversized(_))
        ));
    }
}
