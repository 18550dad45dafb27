//! Gateway endpoint: the single externally reachable HTTP/2 listener
//!
//! Cleartext connections are served with HTTP/1.1 and HTTP/2 auto-detection
//! so that HTTP/1.x clients get a proper `505` instead of a protocol error,
//! and `Upgrade: h2c` requests can switch to HTTP/2. TLS is optional.
//!
//! Every HTTP/2 POST is a tunnel stream handed to the [`vicar_router::Router`].

pub mod h2c;
pub mod protocol;
pub mod server;
pub mod service;
pub mod tls;

pub use protocol::ProtocolError;
pub use server::GatewayServer;
pub use service::GatewayService;
pub use tls::load_tls_acceptor;

use std::net::SocketAddr;
use thiserror::Error;

/// Gateway endpoint errors
#[derive(Debug, Error)]
pub enum GatewayServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Accept failed on {address}: {source}")]
    AcceptError {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}
