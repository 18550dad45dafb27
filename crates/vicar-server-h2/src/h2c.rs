//! HTTP/1.1 `Upgrade: h2c` support
//!
//! After `101 Switching Protocols` the client sends the HTTP/2 preface and
//! expects the upgrade request itself to be answered on stream 1. hyper's
//! HTTP/2 server has no hook for an implicit stream, so [`H2cUpgradeIo`] feeds
//! the request to it as ordinary frames: the client preface and first
//! SETTINGS frame pass through, then a synthesized HEADERS (+DATA) sequence
//! for stream 1 is spliced in before the rest of the client's bytes.
//!
//! Header fields are encoded as HPACK literals without indexing, so the
//! decoder's dynamic table is never touched and the client's own header
//! blocks decode unchanged.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{BufMut, Bytes, BytesMut};
use hyper::header::{
    HeaderMap, HeaderName, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, TE, TRANSFER_ENCODING,
    UPGRADE,
};
use hyper::{Request, Response, StatusCode, Version};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;
use vicar_transport::{text_response, TunnelBody};

/// Largest upgrade request body accepted
pub const MAX_UPGRADE_BODY: usize = 16 * 1024;

const HTTP2_SETTINGS: &str = "http2-settings";
const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const FRAME_HEADER_LEN: usize = 9;
/// SETTINGS_MAX_FRAME_SIZE before the client's settings apply
const MAX_FRAME_SIZE: usize = 16_384;

const FRAME_DATA: u8 = 0x0;
const FRAME_HEADERS: u8 = 0x1;
const FRAME_SETTINGS: u8 = 0x4;

const FLAG_END_STREAM: u8 = 0x1;
const FLAG_END_HEADERS: u8 = 0x4;

const UPGRADE_STREAM_ID: u32 = 1;

// HPACK static table indices (RFC 7541 Appendix A)
const IDX_AUTHORITY: usize = 1;
const IDX_METHOD: usize = 2;
const IDX_PATH: usize = 4;
const IDX_SCHEME: usize = 6;
const IDX_CONTENT_LENGTH: usize = 28;
const IDX_CONTENT_TYPE: usize = 31;

/// Errors rejecting an upgrade before `101` is sent
#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("Upgrade request body exceeds 16384 bytes")]
    BodyTooLarge,

    #[error("Failed to read upgrade request body: {0}")]
    Body(String),

    #[error("Upgrade request headers do not fit in one HTTP/2 frame ({0} bytes)")]
    HeadersTooLarge(usize),
}

impl UpgradeError {
    pub fn status(&self) -> StatusCode {
        match self {
            UpgradeError::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            UpgradeError::Body(_) => StatusCode::BAD_REQUEST,
            UpgradeError::HeadersTooLarge(_) => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
        }
    }

    pub fn into_response(self) -> Response<TunnelBody> {
        text_response(self.status(), self.to_string())
    }
}

/// Whether a request asks for a cleartext HTTP/2 upgrade
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    req.version() == Version::HTTP_11
        && has_token(req.headers(), &UPGRADE, "h2c")
        && has_token(req.headers(), &CONNECTION, "upgrade")
        && req.headers().contains_key(HTTP2_SETTINGS)
}

fn has_token(headers: &HeaderMap, name: &HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// The `101 Switching Protocols` answer
pub fn switching_protocols() -> Response<TunnelBody> {
    let mut response = Response::new(vicar_transport::empty_body());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    response
        .headers_mut()
        .insert(CONNECTION, hyper::header::HeaderValue::from_static("Upgrade"));
    response
        .headers_mut()
        .insert(UPGRADE, hyper::header::HeaderValue::from_static("h2c"));
    response
}

/// Encode the upgrade request as stream 1 HEADERS and DATA frames
pub fn encode_upgrade_stream(
    parts: &http::request::Parts,
    body: &[u8],
) -> Result<Bytes, UpgradeError> {
    let block = header_block(parts, body.len());
    if block.len() > MAX_FRAME_SIZE {
        return Err(UpgradeError::HeadersTooLarge(block.len()));
    }

    let mut out = BytesMut::with_capacity(
        FRAME_HEADER_LEN * (2 + body.len() / MAX_FRAME_SIZE) + block.len() + body.len(),
    );

    let mut flags = FLAG_END_HEADERS;
    if body.is_empty() {
        flags |= FLAG_END_STREAM;
    }
    put_frame_header(&mut out, block.len(), FRAME_HEADERS, flags);
    out.put_slice(&block);

    let mut chunks = body.chunks(MAX_FRAME_SIZE).peekable();
    while let Some(chunk) = chunks.next() {
        let flags = if chunks.peek().is_none() {
            FLAG_END_STREAM
        } else {
            0
        };
        put_frame_header(&mut out, chunk.len(), FRAME_DATA, flags);
        out.put_slice(chunk);
    }

    Ok(out.freeze())
}

fn put_frame_header(out: &mut BytesMut, len: usize, kind: u8, flags: u8) {
    out.put_slice(&(len as u32).to_be_bytes()[1..]);
    out.put_u8(kind);
    out.put_u8(flags);
    out.put_u32(UPGRADE_STREAM_ID);
}

/// Hop-by-hop fields that must not appear in an HTTP/2 header block
fn is_connection_specific(name: &HeaderName) -> bool {
    name == HOST
        || name == CONNECTION
        || name == UPGRADE
        || name == TE
        || name == TRANSFER_ENCODING
        || name == CONTENT_LENGTH
        || name.as_str() == HTTP2_SETTINGS
        || name.as_str() == "keep-alive"
        || name.as_str() == "proxy-connection"
}

fn header_block(parts: &http::request::Parts, body_len: usize) -> Vec<u8> {
    let mut block = Vec::with_capacity(256);

    literal_indexed_name(&mut block, IDX_METHOD, parts.method.as_str().as_bytes());
    literal_indexed_name(&mut block, IDX_SCHEME, b"http");

    let authority = parts
        .headers
        .get(HOST)
        .map(|v| v.as_bytes())
        .or_else(|| parts.uri.authority().map(|a| a.as_str().as_bytes()));
    if let Some(authority) = authority {
        literal_indexed_name(&mut block, IDX_AUTHORITY, authority);
    }

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    literal_indexed_name(&mut block, IDX_PATH, path.as_bytes());

    for (name, value) in parts.headers.iter() {
        if is_connection_specific(name) {
            continue;
        }
        if name == CONTENT_TYPE {
            literal_indexed_name(&mut block, IDX_CONTENT_TYPE, value.as_bytes());
        } else {
            literal_new_name(&mut block, name.as_str().as_bytes(), value.as_bytes());
        }
    }

    if body_len > 0 {
        literal_indexed_name(
            &mut block,
            IDX_CONTENT_LENGTH,
            body_len.to_string().as_bytes(),
        );
    }

    block
}

/// Literal header field without indexing, indexed name (RFC 7541 6.2.2)
fn literal_indexed_name(dst: &mut Vec<u8>, index: usize, value: &[u8]) {
    encode_integer(dst, index, 4, 0x00);
    encode_string(dst, value);
}

/// Literal header field without indexing, new name (RFC 7541 6.2.2)
fn literal_new_name(dst: &mut Vec<u8>, name: &[u8], value: &[u8]) {
    dst.push(0x00);
    encode_string(dst, name);
    encode_string(dst, value);
}

/// Raw (non-Huffman) string literal
fn encode_string(dst: &mut Vec<u8>, value: &[u8]) {
    encode_integer(dst, value.len(), 7, 0x00);
    dst.extend_from_slice(value);
}

/// HPACK integer with an N-bit prefix (RFC 7541 5.1)
fn encode_integer(dst: &mut Vec<u8>, value: usize, prefix_bits: u8, flags: u8) {
    let max_prefix = (1usize << prefix_bits) - 1;
    if value < max_prefix {
        dst.push(flags | value as u8);
        return;
    }

    dst.push(flags | max_prefix as u8);
    let mut rest = value - max_prefix;
    while rest >= 128 {
        dst.push((rest % 128) as u8 | 0x80);
        rest /= 128;
    }
    dst.push(rest as u8);
}

enum Scan {
    Incomplete,
    /// Offset just past the client's first SETTINGS frame
    Boundary(usize),
    Invalid,
}

fn scan_preface(buf: &[u8]) -> Scan {
    let n = buf.len().min(PREFACE.len());
    if buf[..n] != PREFACE[..n] {
        return Scan::Invalid;
    }
    if buf.len() < PREFACE.len() + FRAME_HEADER_LEN {
        return Scan::Incomplete;
    }

    let header = &buf[PREFACE.len()..PREFACE.len() + FRAME_HEADER_LEN];
    let len = u32::from_be_bytes([0, header[0], header[1], header[2]]) as usize;
    if header[3] != FRAME_SETTINGS || len > MAX_FRAME_SIZE {
        return Scan::Invalid;
    }

    let end = PREFACE.len() + FRAME_HEADER_LEN + len;
    if buf.len() < end {
        Scan::Incomplete
    } else {
        Scan::Boundary(end)
    }
}

enum ReadState {
    /// Buffering until the preface and first frame are complete
    Collecting,
    /// Handing out `out` before switching to passthrough
    Draining,
    Passthrough,
}

/// Upgraded connection IO that injects stream 1 after the client preface
pub struct H2cUpgradeIo<T> {
    inner: T,
    state: ReadState,
    inbound: BytesMut,
    stream_one: Bytes,
    out: Bytes,
}

impl<T> H2cUpgradeIo<T> {
    /// `stream_one` comes from [`encode_upgrade_stream`]
    pub fn new(inner: T, stream_one: Bytes) -> Self {
        Self {
            inner,
            state: ReadState::Collecting,
            inbound: BytesMut::with_capacity(PREFACE.len() + FRAME_HEADER_LEN + 64),
            stream_one,
            out: Bytes::new(),
        }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for H2cUpgradeIo<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        loop {
            match this.state {
                ReadState::Passthrough => return Pin::new(&mut this.inner).poll_read(cx, buf),
                ReadState::Draining => {
                    if this.out.is_empty() {
                        this.state = ReadState::Passthrough;
                        continue;
                    }
                    let n = this.out.len().min(buf.remaining());
                    buf.put_slice(&this.out.split_to(n));
                    return Poll::Ready(Ok(()));
                }
                ReadState::Collecting => {
                    match scan_preface(&this.inbound) {
                        Scan::Boundary(end) => {
                            let mut out = BytesMut::with_capacity(
                                this.inbound.len() + this.stream_one.len(),
                            );
                            out.put_slice(&this.inbound[..end]);
                            out.put_slice(&this.stream_one);
                            out.put_slice(&this.inbound[end..]);
                            this.out = out.freeze();
                            this.inbound.clear();
                            this.state = ReadState::Draining;
                            continue;
                        }
                        Scan::Invalid => {
                            // Not a well-formed preface; the HTTP/2 server rejects it
                            debug!("h2c upgrade: unexpected client preface, passing through");
                            this.out = this.inbound.split().freeze();
                            this.state = ReadState::Draining;
                            continue;
                        }
                        Scan::Incomplete => {}
                    }

                    let mut scratch = [0u8; 4096];
                    let mut read_buf = ReadBuf::new(&mut scratch);
                    ready!(Pin::new(&mut this.inner).poll_read(cx, &mut read_buf))?;

                    if read_buf.filled().is_empty() {
                        // EOF mid-preface
                        this.out = this.inbound.split().freeze();
                        this.state = ReadState::Draining;
                        if this.out.is_empty() {
                            return Poll::Ready(Ok(()));
                        }
                        continue;
                    }
                    this.inbound.put_slice(read_buf.filled());
                }
            }
        }
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for H2cUpgradeIo<T> {
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
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn upgrade_request(method: &str, body_len: usize) -> Request<()> {
        let mut builder = Request::builder()
            .method(method)
            .uri("/echo?x=1")
            .version(Version::HTTP_11)
            .header(HOST, "gw.local:8080")
            .header(CONNECTION, "Upgrade, HTTP2-Settings")
            .header(UPGRADE, "h2c")
            .header(HTTP2_SETTINGS, "AAMAAABkAAQAoAAAAAIAAAAA");
        if body_len > 0 {
            builder = builder.header(CONTENT_LENGTH, body_len.to_string());
        }
        builder.body(()).unwrap()
    }

    fn settings_frame() -> Vec<u8> {
        // SETTINGS with one entry (MAX_CONCURRENT_STREAMS = 100)
        vec![0, 0, 6, FRAME_SETTINGS, 0, 0, 0, 0, 0, 0, 3, 0, 0, 0, 100]
    }

    #[test]
    fn test_hpack_integer_encoding() {
        // RFC 7541 C.1.1 and C.1.2
        let mut out = Vec::new();
        encode_integer(&mut out, 10, 5, 0);
        assert_eq!(out, vec![0x0a]);

        let mut out = Vec::new();
        encode_integer(&mut out, 1337, 5, 0);
        assert_eq!(out, vec![0x1f, 0x9a, 0x0a]);

        let mut out = Vec::new();
        encode_integer(&mut out, 15, 4, 0);
        assert_eq!(out, vec![0x0f, 0x00]);
    }

    #[test]
    fn test_detect_upgrade_request() {
        assert!(is_upgrade_request(&upgrade_request("POST", 0)));

        let mut req = upgrade_request("POST", 0);
        req.headers_mut().remove(HTTP2_SETTINGS);
        assert!(!is_upgrade_request(&req));

        let mut req = upgrade_request("POST", 0);
        req.headers_mut()
            .insert(UPGRADE, hyper::header::HeaderValue::from_static("websocket"));
        assert!(!is_upgrade_request(&req));

        let mut req = upgrade_request("POST", 0);
        *req.version_mut() = Version::HTTP_10;
        assert!(!is_upgrade_request(&req));
    }

    #[test]
    fn test_header_block_layout() {
        let (parts, ()) = upgrade_request("POST", 4).into_parts();
        let block = header_block(&parts, 4);

        // :method POST, literal without indexing with indexed name 2
        assert_eq!(&block[..6], &[0x02, 0x04, b'P', b'O', b'S', b'T']);
        // :scheme http
        assert_eq!(&block[6..12], &[0x06, 0x04, b'h', b't', b't', b'p']);
        // :authority from Host
        assert_eq!(block[12], 0x01);
        assert_eq!(block[13] as usize, "gw.local:8080".len());

        let text = String::from_utf8_lossy(&block);
        assert!(text.contains("/echo?x=1"));
        assert!(!text.contains("h2c"));
        assert!(!text.to_lowercase().contains("http2-settings"));
        // content-length re-emitted with static index 28 (15 + 13)
        assert!(block.ends_with(&[0x0f, 0x0d, 0x01, b'4']));
    }

    #[test]
    fn test_stream_frames() {
        let (parts, ()) = upgrade_request("GET", 0).into_parts();
        let frames = encode_upgrade_stream(&parts, b"").unwrap();
        // Single HEADERS frame with END_HEADERS | END_STREAM on stream 1
        assert_eq!(frames[3], FRAME_HEADERS);
        assert_eq!(frames[4], FLAG_END_HEADERS | FLAG_END_STREAM);
        assert_eq!(&frames[5..9], &[0, 0, 0, 1]);
        let len = u32::from_be_bytes([0, frames[0], frames[1], frames[2]]) as usize;
        assert_eq!(frames.len(), FRAME_HEADER_LEN + len);

        let (parts, ()) = upgrade_request("POST", 4).into_parts();
        let frames = encode_upgrade_stream(&parts, b"PING").unwrap();
        assert_eq!(frames[4], FLAG_END_HEADERS);
        let len = u32::from_be_bytes([0, frames[0], frames[1], frames[2]]) as usize;
        let data = &frames[FRAME_HEADER_LEN + len..];
        assert_eq!(&data[..9], &[0, 0, 4, FRAME_DATA, FLAG_END_STREAM, 0, 0, 0, 1]);
        assert_eq!(&data[9..], b"PING");
    }

    #[test]
    fn test_oversized_headers_rejected() {
        let mut req = upgrade_request("POST", 0);
        req.headers_mut().insert(
            "x-large",
            hyper::header::HeaderValue::from_str(&"a".repeat(MAX_FRAME_SIZE)).unwrap(),
        );
        let (parts, ()) = req.into_parts();
        let err = encode_upgrade_stream(&parts, b"").unwrap_err();
        assert_eq!(err.status(), StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_injects_after_first_settings_frame() {
        let (client, server) = tokio::io::duplex(4096);
        let injected = Bytes::from_static(b"<stream-1>");
        let mut io = H2cUpgradeIo::new(server, injected.clone());

        let mut sent = PREFACE.to_vec();
        sent.extend_from_slice(&settings_frame());
        sent.extend_from_slice(b"<rest>");

        // Write in small pieces to exercise buffering
        let mut client = client;
        let to_send = sent.clone();
        let writer = tokio::spawn(async move {
            for chunk in to_send.chunks(7) {
                client.write_all(chunk).await.unwrap();
            }
            client.shutdown().await.unwrap();
        });

        let mut received = Vec::new();
        io.read_to_end(&mut received).await.unwrap();
        writer.await.unwrap();

        let boundary = PREFACE.len() + settings_frame().len();
        let mut expected = sent[..boundary].to_vec();
        expected.extend_from_slice(&injected);
        expected.extend_from_slice(&sent[boundary..]);
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_invalid_preface_passes_through() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut io = H2cUpgradeIo::new(server, Bytes::from_static(b"<stream-1>"));

        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        client.shutdown().await.unwrap();

        let mut received = Vec::new();
        io.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"GET / HTTP/1.1\r\n\r\n");
    }
}
