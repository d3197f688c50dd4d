//! Rewindable stream for protocol sniffing
//!
//! After answering a CONNECT we need the first byte of whatever the client
//! sends next to decide between a TLS handshake and plaintext HTTP, and
//! then hand the untouched stream to the chosen handler. [`Rewind`] buffers
//! the sniffed bytes and replays them ahead of the inner stream.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// TLS record type byte for a handshake record.
pub const TLS_HANDSHAKE_BYTE: u8 = 0x16;

/// A stream with a replayable prefix.
#[derive(Debug)]
pub struct Rewind<T> {
    prefix: Bytes,
    inner: T,
}

impl<T> Rewind<T> {
    pub fn new(prefix: Bytes, inner: T) -> Self {
        Self { prefix, inner }
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin> Rewind<T> {
    /// Reads the first byte of the stream and returns it together with a
    /// stream that will replay that byte.
    pub async fn sniff(mut inner: T) -> io::Result<(u8, Self)> {
        let mut first = [0u8; 1];
        let n = inner.read(&mut first).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before first byte",
            ));
        }
        Ok((first[0], Self::new(Bytes::copy_from_slice(&first), inner)))
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Rewind<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Rewind<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn sniff_replays_the_first_byte() {
        let (client, server) = tokio::io::duplex(64);
        let mut client = client;
        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();

        let (first, mut rewound) = Rewind::sniff(server).await.unwrap();
        assert_eq!(first, b'G');

        let mut buf = vec![0u8; 16];
        rewound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET / HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn sniff_detects_tls_handshake_byte() {
        let (client, server) = tokio::io::duplex(64);
        let mut client = client;
        client.write_all(&[0x16, 0x03, 0x01]).await.unwrap();

        let (first, _) = Rewind::sniff(server).await.unwrap();
        assert_eq!(first, TLS_HANDSHAKE_BYTE);
    }

    #[tokio::test]
    async fn sniff_on_closed_stream_errors() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);

        let err = Rewind::sniff(server).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
