//! Signaling plane: coordinator directory, TCP server, and client.
//!
//! Messages are JSON, framed on the socket as a 4-byte big-endian length
//! prefix followed by the payload. The coordinator never sees relay
//! traffic, only discovery and handshake forwarding.

pub mod client;
pub mod coordinator;
pub mod protocol;
pub mod server;

pub use client::{HandshakeEvent, SignalingClient, ADVERTISE_INTERVAL};
pub use coordinator::{Coordinator, CoordinatorConfig, CoordinatorError, CoordinatorStats, ConnectionId};
pub use server::SignalingServer;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Cap on a single signaling frame. SDP blobs are a few KB; anything near
/// this limit is garbage.
pub const MAX_SIGNALING_FRAME: u32 = 256 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame too large: {0} bytes")]
    TooLarge(u32),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Read one length-prefixed frame. Returns `Ok(None)` on clean EOF at a
/// frame boundary.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Vec<u8>>, FrameError> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_bytes);
    if len > MAX_SIGNALING_FRAME {
        return Err(FrameError::TooLarge(len));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Write one length-prefixed frame.
pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), FrameError> {
    let len = payload.len() as u32;
    if len > MAX_SIGNALING_FRAME {
        return Err(FrameError::TooLarge(len));
    }
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello").await.unwrap();
        write_frame(&mut buf, b"").await.unwrap();

        let mut reader = &buf[..];
        assert_eq!(read_frame(&mut reader).await.unwrap().unwrap(), b"hello");
        assert_eq!(
            read_frame(&mut reader).await.unwrap().unwrap(),
            Vec::<u8>::new()
        );
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_SIGNALING_FRAME + 1).to_be_bytes());
        let mut reader = &buf[..];
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(FrameError::TooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_error() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&10u32.to_be_bytes());
        buf.extend_from_slice(b"abc");
        let mut reader = &buf[..];
        assert!(read_frame(&mut reader).await.is_err());
    }
}
