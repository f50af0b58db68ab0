//! Length-prefixed datagram framing over a byte stream.
//!
//! [`DatagramStream`] wraps a stream endpoint so that every `write` emits one
//! frame and every `read` yields one frame payload. Paired with a
//! [`UdpStream`](crate::udp::UdpStream) in the relay engine this keeps UDP
//! datagram boundaries intact across the TLS leg.

use bytes::{Buf, BytesMut};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::protocol::{decode_frame, encode_frame};

/// Bytes requested from the inner stream per read.
const INNER_READ_CHUNK: usize = 16 * 1024;

/// A stream endpoint carrying one datagram per frame.
#[derive(Debug)]
pub struct DatagramStream<S> {
    inner: S,
    /// Raw bytes read from `inner`, not yet decoded.
    read_buf: BytesMut,
    /// Tail of a payload that did not fit the caller's buffer.
    pending: BytesMut,
    /// Encoded frames not yet written to `inner`.
    write_buf: BytesMut,
    scratch: Box<[u8]>,
    eof: bool,
}

impl<S> DatagramStream<S> {
    /// Wraps a stream endpoint.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            read_buf: BytesMut::with_capacity(INNER_READ_CHUNK),
            pending: BytesMut::new(),
            write_buf: BytesMut::new(),
            scratch: vec![0u8; INNER_READ_CHUNK].into_boxed_slice(),
            eof: false,
        }
    }

    /// Returns a reference to the wrapped stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Unwraps the stream. Buffered but unwritten frames are discarded.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncWrite + Unpin> DatagramStream<S> {
    /// Writes buffered frames to the inner stream.
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.write_buf.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.write_buf))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.write_buf.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for DatagramStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending.split_to(n));
                return Poll::Ready(Ok(()));
            }

            match decode_frame(&this.read_buf) {
                Err(e) => return Poll::Ready(Err(io::Error::new(io::ErrorKind::InvalidData, e))),
                Ok(Some((range, consumed))) => {
                    let frame = this.read_buf.split_to(consumed);
                    let payload = &frame[range];
                    // A zero-length read means EOF to the caller.
                    if payload.is_empty() {
                        continue;
                    }
                    let n = payload.len().min(buf.remaining());
                    buf.put_slice(&payload[..n]);
                    if n < payload.len() {
                        this.pending.extend_from_slice(&payload[n..]);
                    }
                    return Poll::Ready(Ok(()));
                }
                Ok(None) => {}
            }

            if this.eof {
                if this.read_buf.is_empty() {
                    return Poll::Ready(Ok(()));
                }
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended inside a datagram frame",
                )));
            }

            let mut inner_buf = ReadBuf::new(&mut this.scratch[..]);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut inner_buf))?;
            if inner_buf.filled().is_empty() {
                this.eof = true;
            } else {
                this.read_buf.extend_from_slice(inner_buf.filled());
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for DatagramStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        // At most one frame is buffered at a time.
        ready!(this.poll_drain(cx))?;

        encode_frame(data, &mut this.write_buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_varint;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_each_write_becomes_one_frame() {
        let (a, mut b) = tokio::io::duplex(1024);
        let mut framed = DatagramStream::new(a);

        framed.write_all(b"one").await.unwrap();
        framed.write_all(b"three").await.unwrap();
        framed.flush().await.unwrap();
        drop(framed);

        let mut raw = Vec::new();
        b.read_to_end(&mut raw).await.unwrap();
        assert_eq!(raw, b"\x03one\x05three");
    }

    #[tokio::test]
    async fn test_each_read_yields_one_payload() {
        let (a, b) = tokio::io::duplex(1024);
        let mut writer = DatagramStream::new(a);
        let mut reader = DatagramStream::new(b);

        writer.write_all(b"first").await.unwrap();
        writer.write_all(b"second datagram").await.unwrap();
        writer.flush().await.unwrap();

        let mut buf = [0u8; 64];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"first");
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"second datagram");
    }

    #[tokio::test]
    async fn test_payload_larger_than_read_buffer_is_delivered_in_parts() {
        let (a, b) = tokio::io::duplex(1024);
        let mut writer = DatagramStream::new(a);
        let mut reader = DatagramStream::new(b);

        writer.write_all(b"abcdefgh").await.unwrap();
        writer.write_all(b"next").await.unwrap();
        writer.flush().await.unwrap();

        let mut buf = [0u8; 5];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abcde");
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"fgh");
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"next");
    }

    #[tokio::test]
    async fn test_frames_split_across_inner_reads() {
        let (mut a, b) = tokio::io::duplex(1024);
        let mut reader = DatagramStream::new(b);

        let read = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let n = reader.read(&mut buf).await.unwrap();
            buf[..n].to_vec()
        });

        a.write_all(b"\x05hel").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        a.write_all(b"lo").await.unwrap();

        assert_eq!(read.await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_clean_eof_between_frames() {
        let (mut a, b) = tokio::io::duplex(1024);
        let mut reader = DatagramStream::new(b);

        a.write_all(b"\x02hi").await.unwrap();
        drop(a);

        let mut buf = [0u8; 16];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 2);
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_eof_inside_frame_is_an_error() {
        let (mut a, b) = tokio::io::duplex(1024);
        let mut reader = DatagramStream::new(b);

        a.write_all(b"\x05hel").await.unwrap();
        drop(a);

        let mut buf = [0u8; 16];
        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_oversized_length_is_invalid_data() {
        let (mut a, b) = tokio::io::duplex(1024);
        let mut reader = DatagramStream::new(b);

        let mut header = BytesMut::new();
        encode_varint(1 << 20, &mut header);
        a.write_all(&header).await.unwrap();

        let mut buf = [0u8; 16];
        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_empty_frames_are_skipped() {
        let (mut a, b) = tokio::io::duplex(1024);
        let mut reader = DatagramStream::new(b);

        a.write_all(b"\x00\x00\x03abc").await.unwrap();

        let mut buf = [0u8; 16];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abc");
    }
}
