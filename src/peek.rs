use bytes::{Buf, BytesMut};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Wraps a byte stream so a prefix can be inspected without being consumed.
/// `peek(n)` is idempotent; a later read observes the same bytes exactly
/// once. Forward-only: once consumed, bytes are gone.
pub struct BufferedStream<S> {
    inner: S,
    buf: BytesMut,
}

impl<S> BufferedStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buf: BytesMut::new(),
        }
    }

    /// Number of peeked bytes not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

impl<S: AsyncRead + Unpin> BufferedStream<S> {
    /// Return the next `n` bytes without consuming them, filling from the
    /// underlying stream as needed. EOF before `n` bytes is an error.
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        while self.buf.len() < n {
            let mut chunk = [0u8; 4096];
            let read = self.inner.read(&mut chunk).await?;
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended while peeking",
                ));
            }
            self.buf.extend_from_slice(&chunk[..read]);
        }
        Ok(&self.buf[..n])
    }

    /// Drop `n` already-peeked bytes so they are never served to readers.
    /// Panics if more bytes are discarded than were peeked.
    pub fn discard(&mut self, n: usize) {
        assert!(n <= self.buf.len(), "discard past the peeked prefix");
        self.buf.advance(n);
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for BufferedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        if !me.buf.is_empty() {
            let n = me.buf.len().min(out.remaining());
            let served = me.buf.split_to(n);
            out.put_slice(&served);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut me.inner).poll_read(cx, out)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for BufferedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn peek_is_idempotent_and_read_sees_peeked_bytes_once() {
        let data: &[u8] = b"\x05\x01\x00rest";
        let mut s = BufferedStream::new(data);

        assert_eq!(s.peek(1).await.unwrap(), b"\x05");
        assert_eq!(s.peek(1).await.unwrap(), b"\x05");
        assert_eq!(s.peek(3).await.unwrap(), b"\x05\x01\x00");

        let mut head = [0u8; 3];
        s.read_exact(&mut head).await.unwrap();
        assert_eq!(&head, b"\x05\x01\x00");

        let mut rest = Vec::new();
        s.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"rest");
    }

    #[tokio::test]
    async fn peek_past_eof_fails() {
        let data: &[u8] = b"ab";
        let mut s = BufferedStream::new(data);
        let err = s.peek(3).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn discard_skips_consumed_prefix() {
        let data: &[u8] = b"PROXY header\r\npayload";
        let mut s = BufferedStream::new(data);
        s.peek(14).await.unwrap();
        s.discard(14);
        let mut rest = Vec::new();
        s.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"payload");
    }

    #[tokio::test]
    async fn writes_pass_through() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut s = BufferedStream::new(client);
        s.write_all(b"through").await.unwrap();
        s.flush().await.unwrap();
        drop(s);
        let mut got = Vec::new();
        server.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"through");
    }
}
