//! Datagram framing on the byte stream
//!
//! Each datagram travels as a 2-byte big-endian length followed by the
//! payload, so stream fragmentation or coalescing cannot move datagram
//! boundaries.

use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Largest payload a frame can carry
pub const MAX_DATAGRAM_SIZE: usize = u16::MAX as usize;

/// Encode one datagram as a frame
pub fn encode_datagram(payload: &[u8]) -> io::Result<Bytes> {
    if payload.len() > MAX_DATAGRAM_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Datagram too large: {} > {}", payload.len(), MAX_DATAGRAM_SIZE),
        ));
    }

    let mut frame = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    frame.put_u16(payload.len() as u16);
    frame.put_slice(payload);
    Ok(frame.freeze())
}

/// Write one framed datagram with a single write
pub async fn write_datagram<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_datagram(payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await
}

/// Reads framed datagrams off a byte stream
pub struct DatagramReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> DatagramReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: vec![0u8; MAX_DATAGRAM_SIZE],
        }
    }

    /// Next datagram, or `None` on a clean end of stream between frames
    ///
    /// End of stream inside a frame is `UnexpectedEof`.
    pub async fn read_datagram(&mut self) -> io::Result<Option<&[u8]>> {
        let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
        if self.inner.read(&mut len_buf[..1]).await? == 0 {
            return Ok(None);
        }
        self.inner.read_exact(&mut len_buf[1..]).await?;

        let len = u16::from_be_bytes(len_buf) as usize;
        self.inner.read_exact(&mut self.buf[..len]).await?;
        Ok(Some(&self.buf[..len]))
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let frame = encode_datagram(b"abc").unwrap();
        assert_eq!(&frame[..], &[0x00, 0x03, b'a', b'b', b'c']);
        assert_eq!(&encode_datagram(&[]).unwrap()[..], &[0, 0]);
        assert!(encode_datagram(&vec![0u8; MAX_DATAGRAM_SIZE + 1]).is_err());
    }

    #[tokio::test]
    async fn test_boundaries_survive_coalescing() {
        // Three frames delivered as one contiguous write
        let mut wire = Vec::new();
        for payload in [&b"first"[..], &b""[..], &[7u8; 1400][..]] {
            wire.extend_from_slice(&encode_datagram(payload).unwrap());
        }

        let (mut tx, rx) = tokio::io::duplex(8192);
        tx.write_all(&wire).await.unwrap();
        drop(tx);

        let mut reader = DatagramReader::new(rx);
        assert_eq!(reader.read_datagram().await.unwrap(), Some(&b"first"[..]));
        assert_eq!(reader.read_datagram().await.unwrap(), Some(&b""[..]));
        assert_eq!(reader.read_datagram().await.unwrap().map(|d| d.len()), Some(1400));
        assert_eq!(reader.read_datagram().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_boundaries_survive_fragmentation() {
        let frame = encode_datagram(b"split across writes").unwrap();
        let (mut tx, rx) = tokio::io::duplex(8192);

        let writer = tokio::spawn(async move {
            for chunk in frame.chunks(3) {
                tx.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        let mut reader = DatagramReader::new(rx);
        assert_eq!(
            reader.read_datagram().await.unwrap(),
            Some(&b"split across writes"[..])
        );
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_truncated_frame_is_error() {
        let (mut tx, rx) = tokio::io::duplex(64);
        tx.write_all(&[0x00, 0x10, 1, 2, 3]).await.unwrap();
        drop(tx);

        let mut reader = DatagramReader::new(rx);
        let err = reader.read_datagram().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
