//! Ingress listeners: local TCP sockets tunneled to an upstream gateway
//!
//! An ingress listener binds the local port of an `in NAME=PORT` mapping.
//! Every accepted connection becomes one `POST /NAME` stream on the shared
//! upstream connection, and bytes are spliced both ways until both sides
//! close. A failure on one connection is logged and affects nothing else.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use vicar_mapping::ServiceMapping;
use vicar_transport::{
    is_transient_accept_error, relay, H2Connector, RelayError, TaskScope, ACCEPT_BACKOFF,
};

/// Ingress listener errors
#[derive(Debug, Error)]
pub enum IngressError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind service '{name}' to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        name: String,
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Accept failed for service '{name}': {source}")]
    AcceptError {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Listener for one `in` mapping
#[derive(Debug)]
pub struct IngressListener {
    mapping: ServiceMapping,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl IngressListener {
    pub async fn bind(mapping: ServiceMapping, local_ip: IpAddr) -> Result<Self, IngressError> {
        let addr = SocketAddr::new(local_ip, mapping.local_port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| IngressError::BindError {
                name: mapping.name.clone(),
                address: addr.ip().to_string(),
                port: addr.port(),
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr()?;

        info!(
            "Ingress listener for '{}' bound to {}",
            mapping.name, local_addr
        );

        Ok(Self {
            mapping,
            listener,
            local_addr,
        })
    }

    pub fn name(&self) -> &str {
        &self.mapping.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections and tunnel each one through `connector`
    ///
    /// Runs until the scope is cancelled. Connection tasks are spawned in the
    /// scope so they are dropped on cancellation.
    pub async fn run(self, connector: Arc<H2Connector>, scope: TaskScope) -> Result<(), IngressError> {
        let path = format!("/{}", self.mapping.name);
        let token = scope.token().clone();

        loop {
            let accepted = tokio::select! {
                _ = token.cancelled() => {
                    info!("Ingress listener for '{}' stopped", self.mapping.name);
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((socket, peer)) => {
                    debug!(
                        "[{}] New connection from {}",
                        self.mapping.name, peer
                    );
                    let _ = socket.set_nodelay(true);

                    let connector = connector.clone();
                    let path = path.clone();
                    let label = format!("{} <- {}", self.mapping.name, peer);
                    scope.spawn(async move {
                        if let Err(e) = tunnel_connection(socket, &connector, &path, &label).await {
                            warn!("[{}] {}", label, e);
                        }
                    });
                }
                Err(e) if is_transient_accept_error(&e) => {
                    warn!(
                        "[{}] Transient accept error: {}",
                        self.mapping.name, e
                    );
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                    }
                }
                Err(e) => {
                    error!("[{}] Accept failed: {}", self.mapping.name, e);
                    return Err(IngressError::AcceptError {
                        name: self.mapping.name.clone(),
                        source: e,
                    });
                }
            }
        }
    }
}

/// Open an upstream stream for one accepted socket and splice them
async fn tunnel_connection(
    socket: TcpStream,
    connector: &H2Connector,
    path: &str,
    label: &str,
) -> Result<(), RelayError> {
    let tunnel = connector.open_stream(path).await?;
    debug!("[{}] Tunnel opened", label);
    relay(tunnel, socket, label).await?;
    Ok(())
}
