//! Length-prefixed message framing
//!
//! Frames are a 2-byte big-endian length followed by exactly that many
//! payload bytes. Framing is only used for the handshake exchange; once a
//! connection is paired, traffic is opaque unframed bytes.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix in bytes.
pub const LEN_PREFIX: usize = 2;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stream ended inside a frame")]
    Malformed,

    #[error("payload of {0} bytes exceeds the frame limit")]
    Oversize(usize),
}

/// Incremental reader for length-prefixed frames.
///
/// Handles arbitrary splitting of frames across reads by buffering between
/// calls. After the last expected frame, `into_parts` hands back the inner
/// stream together with any bytes that were read past the frame boundary,
/// so callers can continue with unframed I/O without losing pipelined data.
pub struct FramedReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(1024),
        }
    }

    /// Read the next complete frame.
    ///
    /// Returns `Ok(None)` on a clean close at a frame boundary. A close in
    /// the middle of a length prefix or payload is `FrameError::Malformed`.
    pub async fn next_frame(&mut self) -> Result<Option<Bytes>, FrameError> {
        loop {
            if self.buf.len() >= LEN_PREFIX {
                let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
                if self.buf.len() >= LEN_PREFIX + len {
                    self.buf.advance(LEN_PREFIX);
                    return Ok(Some(self.buf.split_to(len).freeze()));
                }
            }

            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(FrameError::Malformed);
            }
        }
    }

    /// Dissolve the reader into the inner stream and any buffered remainder.
    pub fn into_parts(self) -> (R, BytesMut) {
        (self.inner, self.buf)
    }
}

/// Write one length-prefixed frame as a single write.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), FrameError> {
    if payload.len() > u16::MAX as usize {
        return Err(FrameError::Oversize(payload.len()));
    }

    let mut msg = Vec::with_capacity(LEN_PREFIX + payload.len());
    msg.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    msg.extend_from_slice(payload);
    writer.write_all(&msg).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_roundtrip_single_frame() {
        let (client, server) = tokio::io::duplex(256);
        let mut client = client;
        let mut reader = FramedReader::new(server);

        write_frame(&mut client, b"hello").await.unwrap();
        drop(client);

        let frame = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(&frame[..], b"hello");
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frame_split_across_reads() {
        let (mut client, server) = tokio::io::duplex(4);
        let mut reader = FramedReader::new(server);

        let writer = tokio::spawn(async move {
            // 4-byte duplex capacity forces the frame to arrive in pieces.
            write_frame(&mut client, b"fragmented payload").await.unwrap();
            drop(client);
        });

        let frame = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(&frame[..], b"fragmented payload");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_multiple_frames_one_write() {
        let (mut client, server) = tokio::io::duplex(256);
        let mut reader = FramedReader::new(server);

        let mut combined = Vec::new();
        for payload in [b"one".as_slice(), b"two".as_slice(), b"".as_slice()] {
            combined.extend_from_slice(&(payload.len() as u16).to_be_bytes());
            combined.extend_from_slice(payload);
        }
        client.write_all(&combined).await.unwrap();
        drop(client);

        assert_eq!(&reader.next_frame().await.unwrap().unwrap()[..], b"one");
        assert_eq!(&reader.next_frame().await.unwrap().unwrap()[..], b"two");
        assert_eq!(&reader.next_frame().await.unwrap().unwrap()[..], b"");
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eof_inside_prefix_is_malformed() {
        let (mut client, server) = tokio::io::duplex(256);
        let mut reader = FramedReader::new(server);

        client.write_all(&[0x00]).await.unwrap();
        drop(client);

        assert!(matches!(
            reader.next_frame().await,
            Err(FrameError::Malformed)
        ));
    }

    #[tokio::test]
    async fn test_eof_inside_payload_is_malformed() {
        let (mut client, server) = tokio::io::duplex(256);
        let mut reader = FramedReader::new(server);

        client.write_all(&[0x00, 0x10, b'x', b'y']).await.unwrap();
        drop(client);

        assert!(matches!(
            reader.next_frame().await,
            Err(FrameError::Malformed)
        ));
    }

    #[tokio::test]
    async fn test_leftover_bytes_survive_into_parts() {
        let (mut client, server) = tokio::io::duplex(256);
        let mut reader = FramedReader::new(server);

        let mut combined = Vec::new();
        combined.extend_from_slice(&3u16.to_be_bytes());
        combined.extend_from_slice(b"abc");
        combined.extend_from_slice(b"trailing raw bytes");
        client.write_all(&combined).await.unwrap();

        assert_eq!(&reader.next_frame().await.unwrap().unwrap()[..], b"abc");
        let (_, rest) = reader.into_parts();
        assert_eq!(&rest[..], b"trailing raw bytes");
    }

    #[tokio::test]
    async fn test_write_frame_rejects_oversize() {
        let (mut client, _server) = tokio::io::duplex(256);
        let payload = vec![0u8; u16::MAX as usize + 1];
        assert!(matches!(
            write_frame(&mut client, &payload).await,
            Err(FrameError::Oversize(_))
        ));
    }
}
