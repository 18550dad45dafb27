//! HTTP/2 tunnel transport for vicar
//!
//! A tunnel is a single HTTP/2 stream carrying an opaque byte stream in both
//! directions: the request body flows one way and the response body flows the
//! other. This crate provides:
//!
//! - [`TunnelStream`]: `AsyncRead + AsyncWrite` over one HTTP/2 stream
//! - [`H2Connector`]: a client that keeps one multiplexed connection per
//!   remote gateway and opens tunnel streams on it
//! - [`splice`]: bidirectional copy between a tunnel and a local socket
//! - [`TaskScope`]: cancellation plus tracking for relay tasks

pub mod accept;
pub mod body;
pub mod connector;
pub mod splice;
pub mod stream;
pub mod task_scope;

pub use accept::{is_transient_accept_error, ACCEPT_BACKOFF};
pub use body::{
    body_channel, channel_body, empty_body, full_body, incoming_body, text_response, BodyFrame,
    BodySender, TunnelBody,
};
pub use connector::{ConnectorSettings, H2Connector};
pub use splice::{relay, splice};
pub use stream::TunnelStream;
pub use task_scope::TaskScope;

use hyper::StatusCode;
use thiserror::Error;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Connection to {target} failed: {reason}")]
    ConnectionError { target: String, reason: String },

    #[error("Timed out connecting to {0}")]
    ConnectTimeout(String),

    #[error("Timed out waiting for response headers from {0}")]
    ResponseTimeout(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Tunnel rejected by remote gateway with status {0}")]
    Rejected(StatusCode),

    #[error("Invalid URI: {0}")]
    InvalidUri(String),
}

impl TransportError {
    /// Whether the error is a connect or response timeout
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectTimeout(_) | TransportError::ResponseTimeout(_)
        )
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors ending a relay between a tunnel and a local socket
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Failed to open tunnel: {0}")]
    Open(#[from] TransportError),

    #[error("Relay interrupted: {0}")]
    Io(#[from] std::io::Error),
}
