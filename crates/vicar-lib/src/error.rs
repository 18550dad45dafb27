//! Fatal gateway errors

use thiserror::Error;
use vicar_egress::EgressError;
use vicar_ingress::IngressError;
use vicar_mapping::ConfigError;
use vicar_server_h2::GatewayServerError;
use vicar_transport::TransportError;

/// Errors that stop the gateway
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Endpoint(#[from] GatewayServerError),

    #[error(transparent)]
    Ingress(#[from] IngressError),

    #[error(transparent)]
    Egress(#[from] EgressError),

    #[error("Upstream error: {0}")]
    Upstream(#[from] TransportError),

    #[error("Gateway task panicked: {0}")]
    TaskPanicked(String),
}

impl GatewayError {
    /// Whether the error happened while binding a socket
    pub fn is_bind_error(&self) -> bool {
        matches!(
            self,
            GatewayError::Endpoint(GatewayServerError::BindError { .. })
                | GatewayError::Ingress(IngressError::BindError { .. })
        )
    }
}
