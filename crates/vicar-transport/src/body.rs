//! Body types shared by the gateway endpoint, connector and egress paths

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Empty, Full, StreamBody};
use hyper::body::{Body, Frame, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tokio_util::sync::{PollSendError, PollSender};

/// Frames queued per tunnel direction before the writer is back-pressured
pub const BODY_CHANNEL_CAPACITY: usize = 16;

/// One frame pushed into a channel-backed body
pub type BodyFrame = Result<Frame<Bytes>, io::Error>;

/// Body type used for every request and response the gateway produces
pub type TunnelBody = UnsyncBoxBody<Bytes, io::Error>;

pub fn full_body(data: impl Into<Bytes>) -> TunnelBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn empty_body() -> TunnelBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Forward a received body as-is
pub fn incoming_body(body: Incoming) -> TunnelBody {
    body.map_err(io::Error::other).boxed_unsync()
}

/// A body fed from an mpsc channel
///
/// The body ends (END_STREAM) when every sender is dropped. Sending an `Err`
/// makes hyper reset the HTTP/2 stream instead.
pub fn body_channel(capacity: usize) -> (mpsc::Sender<BodyFrame>, TunnelBody) {
    let (tx, rx) = mpsc::channel(capacity);
    let body = StreamBody::new(ReceiverStream::new(rx)).boxed_unsync();
    (tx, body)
}

/// Channel-backed body with a reset slot, written from poll functions
///
/// Data frames are back-pressured by the channel; [`BodySender::reset`]
/// bypasses it so a reset is delivered even when the channel is full.
pub fn channel_body() -> (BodySender, TunnelBody) {
    let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
    let (reset_tx, reset_rx) = oneshot::channel();

    let sender = BodySender {
        frames: PollSender::new(tx),
        reset: Some(reset_tx),
    };
    let body = ResettableBody {
        frames: ReceiverStream::new(rx),
        reset: Some(reset_rx),
    };
    (sender, body.boxed_unsync())
}

/// Write half of [`channel_body`]
pub struct BodySender {
    frames: PollSender<BodyFrame>,
    reset: Option<oneshot::Sender<io::Error>>,
}

impl BodySender {
    /// Wait for room for one data frame
    pub fn poll_reserve(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), PollSendError<BodyFrame>>> {
        self.frames.poll_reserve(cx)
    }

    /// Send a data frame into the slot reserved by `poll_reserve`
    pub fn send_data(&mut self, data: Bytes) -> Result<(), PollSendError<BodyFrame>> {
        self.frames.send_item(Ok(Frame::data(data)))
    }

    /// End the body cleanly once queued frames are read
    pub fn close(&mut self) {
        self.frames.close();
    }

    pub fn is_closed(&self) -> bool {
        self.frames.is_closed()
    }

    /// Fail the body with `reason`, dropping any frames still queued
    pub fn reset(&mut self, reason: io::Error) {
        if let Some(reset) = self.reset.take() {
            // Err only if the body is already gone
            let _ = reset.send(reason);
        }
        self.frames.close();
    }
}

struct ResettableBody {
    frames: ReceiverStream<BodyFrame>,
    reset: Option<oneshot::Receiver<io::Error>>,
}

impl Body for ResettableBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, io::Error>>> {
        if let Some(reset) = self.reset.as_mut() {
            match Pin::new(reset).poll(cx) {
                Poll::Ready(Ok(reason)) => {
                    self.reset = None;
                    return Poll::Ready(Some(Err(reason)));
                }
                // Sender dropped without a reset
                Poll::Ready(Err(_)) => self.reset = None,
                Poll::Pending => {}
            }
        }

        Pin::new(&mut self.frames).poll_next(cx)
    }
}

/// Plain-text response with the given status
pub fn text_response(status: StatusCode, text: impl Into<String>) -> Response<TunnelBody> {
    let mut response = Response::new(full_body(text.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
