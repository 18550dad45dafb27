//! Route targets and routing errors

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::{Response, StatusCode};
use thiserror::Error;
use vicar_egress::{EgressDispatcher, EgressError};
use vicar_transport::{text_response, TunnelBody};

/// A local service a stream is spliced into
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceTarget {
    pub name: String,
    pub addr: SocketAddr,
}

impl fmt::Display for ServiceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.addr)
    }
}

/// Where a routing key leads
#[derive(Debug, Clone)]
pub enum Route {
    Service(ServiceTarget),
    Egress(Arc<EgressDispatcher>),
}

/// Per-stream routing errors
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("Unknown route: {0}")]
    UnknownRoute(String),

    #[error("Service {target} unreachable: {source}")]
    ServiceUnreachable {
        target: ServiceTarget,
        #[source]
        source: io::Error,
    },

    #[error("Timed out connecting to service {0}")]
    ServiceTimeout(ServiceTarget),

    #[error(transparent)]
    Egress(#[from] EgressError),
}

impl RouteError {
    pub fn status(&self) -> StatusCode {
        match self {
            RouteError::UnknownRoute(_) => StatusCode::NOT_FOUND,
            RouteError::ServiceUnreachable { .. } => StatusCode::BAD_GATEWAY,
            RouteError::ServiceTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            RouteError::Egress(e) => e.status(),
        }
    }

    pub fn into_response(self) -> Response<TunnelBody> {
        text_response(self.status(), self.to_string())
    }
}
