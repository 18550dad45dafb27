//! Bidirectional copy between a tunnel stream and a local socket

use std::io;

use bytes::Bytes;
use hyper::body::Body;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::stream::TunnelStream;
use crate::RelayError;

/// Copy bytes both ways until both directions reach EOF
///
/// EOF on one side shuts down the write half of the other, so half-closed
/// connections keep flowing in the remaining direction. Returns
/// `(tunnel -> local, local -> tunnel)` byte counts.
pub async fn splice<B, L>(tunnel: &mut TunnelStream<B>, local: &mut L) -> io::Result<(u64, u64)>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    L: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    tokio::io::copy_bidirectional(tunnel, local).await
}

/// Splice and log the outcome; a failed relay resets the tunnel stream
pub async fn relay<B, L>(
    mut tunnel: TunnelStream<B>,
    mut local: L,
    label: &str,
) -> Result<(u64, u64), RelayError>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    L: AsyncRead + AsyncWrite + Unpin,
{
    match splice(&mut tunnel, &mut local).await {
        Ok((down, up)) => {
            debug!(
                "[{}] Relay finished ({} bytes to local, {} bytes to tunnel)",
                label, down, up
            );
            Ok((down, up))
        }
        Err(e) => {
            warn!("[{}] Relay error: {}", label, e);
            tunnel.abort(io::Error::new(e.kind(), e.to_string()));
            Err(RelayError::Io(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::{body_channel, channel_body, BodyFrame};
    use http_body_util::BodyExt;
    use hyper::body::Frame;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn data(bytes: &'static [u8]) -> BodyFrame {
        Ok(Frame::data(Bytes::from_static(bytes)))
    }

    #[tokio::test]
    async fn test_relay_echo_through_local_socket() {
        let (in_tx, in_body) = body_channel(4);
        let (out_tx, out_body) = channel_body();
        let tunnel = TunnelStream::new(in_body, out_tx);

        // Local side: a duplex pipe whose far end echoes and closes on EOF
        let (local, mut far) = tokio::io::duplex(1024);
        let echo = tokio::spawn(async move {
            let mut received = Vec::new();
            far.read_to_end(&mut received).await.unwrap();
            far.write_all(&received).await.unwrap();
            far.shutdown().await.unwrap();
        });

        let relay_task = tokio::spawn(relay(tunnel, local, "test"));

        in_tx.send(data(b"PING")).await.unwrap();
        drop(in_tx);

        let echoed = out_body.collect().await.unwrap().to_bytes();
        assert_eq!(&echoed[..], b"PING");

        let (down, up) = relay_task.await.unwrap().unwrap();
        assert_eq!((down, up), (4, 4));
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn test_relay_error_resets_tunnel() {
        let (in_tx, in_body) = body_channel(4);
        let (out_tx, out_body) = channel_body();
        let tunnel = TunnelStream::new(in_body, out_tx);
        let (local, _far) = tokio::io::duplex(64);

        in_tx
            .send(Err(io::Error::new(io::ErrorKind::ConnectionReset, "peer reset")))
            .await
            .unwrap();

        let result = relay(tunnel, local, "test").await;
        assert!(matches!(result, Err(RelayError::Io(_))));
        assert!(out_body.collect().await.is_err());
    }
}
