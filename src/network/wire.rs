//! Length-delimited stream framing
//!
//! Adapts any raw byte transport into a [`MessageStream`] using a 4-byte
//! big-endian length prefix per frame. Hosts wrap their TCP or QUIC streams
//! with this before handing them to the messenger.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::network::overlay::{MessageStream, StreamError};

/// Frame header size in bytes: 4 byte big-endian length.
pub const FRAME_HEADER_LEN: usize = 4;

/// Upper bound on a single frame. A peer announcing more is misbehaving.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// A [`MessageStream`] over any `AsyncRead + AsyncWrite` transport.
pub struct FramedStream<S> {
    inner: S,
}

impl<S> FramedStream<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

fn io_err(e: std::io::Error) -> StreamError {
    match e.kind() {
        std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::BrokenPipe => StreamError::Closed,
        _ => StreamError::Io(e.to_string()),
    }
}

#[async_trait]
impl<S> MessageStream for FramedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, frame: &[u8]) -> Result<(), StreamError> {
        if frame.len() > MAX_FRAME_LEN {
            return Err(StreamError::Io(format!(
                "frame of {} bytes exceeds maximum {}",
                frame.len(),
                MAX_FRAME_LEN
            )));
        }
        self.inner
            .write_all(&(frame.len() as u32).to_be_bytes())
            .await
            .map_err(io_err)?;
        self.inner.write_all(frame).await.map_err(io_err)?;
        self.inner.flush().await.map_err(io_err)
    }

    async fn recv(&mut self) -> Result<Vec<u8>, StreamError> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        self.inner.read_exact(&mut header).await.map_err(io_err)?;

        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_FRAME_LEN {
            return Err(StreamError::Io(format!(
                "peer announced frame of {} bytes, maximum is {}",
                len, MAX_FRAME_LEN
            )));
        }

        let mut frame = vec![0u8; len];
        self.inner.read_exact(&mut frame).await.map_err(io_err)?;
        Ok(frame)
    }

    async fn close(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (a, b) = tokio::io::duplex(4096);
        let mut left = FramedStream::new(a);
        let mut right = FramedStream::new(b);

        left.send(b"first frame").await.unwrap();
        left.send(b"").await.unwrap();
        left.send(&[0xEE; 300]).await.unwrap();

        assert_eq!(right.recv().await.unwrap(), b"first frame");
        assert_eq!(right.recv().await.unwrap(), b"");
        assert_eq!(right.recv().await.unwrap(), vec![0xEE; 300]);
    }

    #[tokio::test]
    async fn test_oversized_send_is_rejected() {
        let (a, _b) = tokio::io::duplex(64);
        let mut stream = FramedStream::new(a);

        let err = stream.send(&vec![0u8; MAX_FRAME_LEN + 1]).await.unwrap_err();
        assert!(matches!(err, StreamError::Io(_)));
    }

    #[tokio::test]
    async fn test_oversized_announced_frame_is_rejected() {
        let (a, b) = tokio::io::duplex(64);
        let mut raw = a;
        raw.write_all(&(MAX_FRAME_LEN as u32 + 1).to_be_bytes())
            .await
            .unwrap();

        let mut stream = FramedStream::new(b);
        let err = stream.recv().await.unwrap_err();
        assert!(matches!(err, StreamError::Io(_)));
    }

    #[tokio::test]
    async fn test_recv_on_closed_transport() {
        let (a, b) = tokio::io::duplex(64);
        drop(a);

        let mut stream = FramedStream::new(b);
        let err = stream.recv().await.unwrap_err();
        assert!(matches!(err, StreamError::Closed));
    }
}
