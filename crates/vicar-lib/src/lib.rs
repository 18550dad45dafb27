//! vicar - HTTP/2 tunneling gateway
//!
//! Public API for running a gateway from Rust. The individual crates are
//! re-exported so applications can also assemble the parts themselves.
//!
//! # Quick Start
//!
//! ```ignore
//! use vicar_lib::{Gateway, GatewayConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GatewayConfig::new("0.0.0.0:8080".parse()?)
//!         .service("web", 9001)
//!         .port(9002, "http://backend.local".parse()?);
//!
//!     let shutdown = CancellationToken::new();
//!     Gateway::new(config)?.run(shutdown).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod gateway;
pub mod lifecycle;

pub use config::{GatewayConfig, TlsFiles};
pub use error::GatewayError;
pub use gateway::{Gateway, RunningGateway};
pub use lifecycle::{FirstError, Lifecycle, LifecycleState};

// Re-export component crates
pub use vicar_egress::{EgressDispatcher, EgressDispatchers, EgressError};
pub use vicar_ingress::{IngressError, IngressListener};
pub use vicar_mapping::{
    ConfigError, MappingTable, PortMapping, PortTarget, RouteKey, ServiceMapping,
};
pub use vicar_router::{Route, RouteError, Router, ServiceTarget};
pub use vicar_server_h2::{GatewayServer, GatewayServerError, GatewayService, ProtocolError};
pub use vicar_transport::{
    ConnectorSettings, H2Connector, RelayError, TaskScope, TransportError, TunnelStream,
};
