//! Byte stream over a single HTTP/2 stream

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use hyper::body::{Body, Incoming};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::trace;

use crate::body::{channel_body, BodySender, TunnelBody};

/// Tunnel stream: reads come from one body, writes feed the other
///
/// On the gateway side the request body is read and the response body is
/// written; on the connector side it is the other way around. Shutting down
/// the write half ends the outgoing body with END_STREAM while reads carry
/// on, so TCP half-close maps onto HTTP/2 half-close.
pub struct TunnelStream<B = Incoming> {
    recv: B,
    recv_buf: Bytes,
    recv_done: bool,
    send: BodySender,
    bytes_read: u64,
    bytes_written: u64,
}

impl<B> fmt::Debug for TunnelStream<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelStream")
            .field("recv_done", &self.recv_done)
            .field("send_closed", &self.send.is_closed())
            .field("bytes_read", &self.bytes_read)
            .field("bytes_written", &self.bytes_written)
            .finish()
    }
}

impl TunnelStream<Incoming> {
    /// Accept a tunnel on the gateway side
    ///
    /// Returns the stream plus the body to put in the response.
    pub fn accept(request_body: Incoming) -> (Self, TunnelBody) {
        let (send, body) = channel_body();
        (Self::new(request_body, send), body)
    }
}

impl<B> TunnelStream<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    pub fn new(recv: B, send: BodySender) -> Self {
        Self {
            recv,
            recv_buf: Bytes::new(),
            recv_done: false,
            send,
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    /// Reset the outgoing half instead of ending it cleanly
    ///
    /// The peer sees RST_STREAM rather than END_STREAM, so it can tell an
    /// aborted relay from a finished one.
    pub fn abort(&mut self, reason: io::Error) {
        self.send.reset(reason);
        trace!("Tunnel stream aborted");
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

impl<B> AsyncRead for TunnelStream<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        loop {
            if !this.recv_buf.is_empty() {
                let n = this.recv_buf.len().min(buf.remaining());
                buf.put_slice(&this.recv_buf.split_to(n));
                this.bytes_read += n as u64;
                return Poll::Ready(Ok(()));
            }

            if this.recv_done {
                return Poll::Ready(Ok(()));
            }

            match ready!(Pin::new(&mut this.recv).poll_frame(cx)) {
                Some(Ok(frame)) => {
                    // Trailers carry no tunnel data
                    if let Ok(data) = frame.into_data() {
                        this.recv_buf = data;
                    }
                }
                Some(Err(e)) => {
                    this.recv_done = true;
                    return Poll::Ready(Err(io::Error::other(e)));
                }
                None => {
                    this.recv_done = true;
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

impl<B> AsyncWrite for TunnelStream<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;

        if ready!(this.send.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "tunnel stream closed",
            )));
        }

        if this.send.send_data(Bytes::copy_from_slice(buf)).is_err() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "tunnel stream closed",
            )));
        }

        this.bytes_written += buf.len() as u64;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.send.close();
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::{body_channel, BodyFrame, BODY_CHANNEL_CAPACITY};
    use http_body_util::BodyExt;
    use hyper::body::Frame;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn data(bytes: &'static [u8]) -> BodyFrame {
        Ok(Frame::data(Bytes::from_static(bytes)))
    }

    #[tokio::test]
    async fn test_read_and_write() {
        let (in_tx, in_body) = body_channel(4);
        let (out_tx, out_body) = channel_body();
        let mut stream = TunnelStream::new(in_body, out_tx);

        in_tx.send(data(b"PING")).await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PING");

        stream.write_all(b"PONG").await.unwrap();
        stream.shutdown().await.unwrap();

        let echoed = out_body.collect().await.unwrap().to_bytes();
        assert_eq!(&echoed[..], b"PONG");
        assert_eq!(stream.bytes_read(), 4);
        assert_eq!(stream.bytes_written(), 4);
    }

    #[tokio::test]
    async fn test_small_reads_drain_large_frame() {
        let (in_tx, in_body) = body_channel(4);
        let (out_tx, _out_body) = channel_body();
        let mut stream = TunnelStream::new(in_body, out_tx);

        in_tx.send(data(b"abcdef")).await.unwrap();
        drop(in_tx);

        let mut first = [0u8; 2];
        stream.read_exact(&mut first).await.unwrap();
        assert_eq!(&first, b"ab");

        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"cdef");
    }

    #[tokio::test]
    async fn test_half_close_keeps_reading() {
        let (in_tx, in_body) = body_channel(4);
        let (out_tx, out_body) = channel_body();
        let mut stream = TunnelStream::new(in_body, out_tx);

        stream.write_all(b"request").await.unwrap();
        stream.shutdown().await.unwrap();
        assert_eq!(
            &out_body.collect().await.unwrap().to_bytes()[..],
            b"request"
        );

        in_tx.send(data(b"late reply")).await.unwrap();
        drop(in_tx);
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"late reply");
    }

    #[tokio::test]
    async fn test_write_after_shutdown_fails() {
        let (_in_tx, in_body) = body_channel(1);
        let (out_tx, _out_body) = channel_body();
        let mut stream = TunnelStream::new(in_body, out_tx);

        stream.shutdown().await.unwrap();
        let err = stream.write_all(b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_abort_errors_outgoing_body() {
        let (_in_tx, in_body) = body_channel(1);
        let (out_tx, out_body) = channel_body();
        let mut stream = TunnelStream::new(in_body, out_tx);

        stream.write_all(b"partial").await.unwrap();
        stream.abort(io::Error::new(io::ErrorKind::ConnectionReset, "local reset"));

        assert!(out_body.collect().await.is_err());
    }

    #[tokio::test]
    async fn test_abort_with_full_channel_still_resets() {
        let (_in_tx, in_body) = body_channel(1);
        let (out_tx, out_body) = channel_body();
        let mut stream = TunnelStream::new(in_body, out_tx);

        // Nobody reads the outgoing body, so the channel fills up
        for _ in 0..BODY_CHANNEL_CAPACITY {
            stream.write_all(b"x").await.unwrap();
        }
        stream.abort(io::Error::new(io::ErrorKind::ConnectionReset, "local reset"));

        let err = out_body.collect().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn test_write_after_abort_fails() {
        let (_in_tx, in_body) = body_channel(1);
        let (out_tx, _out_body) = channel_body();
        let mut stream = TunnelStream::new(in_body, out_tx);

        stream.abort(io::Error::new(io::ErrorKind::ConnectionReset, "local reset"));
        let err = stream.write_all(b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_incoming_error_surfaces_as_io_error() {
        let (in_tx, in_body) = body_channel(1);
        let (out_tx, _out_body) = channel_body();
        let mut stream = TunnelStream::new(in_body, out_tx);

        in_tx
            .send(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")))
            .await
            .unwrap();

        let mut buf = [0u8; 8];
        assert!(stream.read(&mut buf).await.is_err());
    }
}
