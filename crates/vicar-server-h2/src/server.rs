//! Gateway endpoint listener and accept loop

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use vicar_transport::{is_transient_accept_error, ACCEPT_BACKOFF};

use crate::service::GatewayService;
use crate::GatewayServerError;

/// The shared HTTP/2 endpoint
pub struct GatewayServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
}

impl std::fmt::Debug for GatewayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayServer")
            .field("local_addr", &self.local_addr)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl GatewayServer {
    /// Bind the listen address; nothing is accepted until [`serve`](Self::serve)
    pub async fn bind(addr: SocketAddr, tls: Option<TlsAcceptor>) -> Result<Self, GatewayServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GatewayServerError::BindError {
                address: addr.ip().to_string(),
                port: addr.port(),
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr()?;

        info!(
            "Gateway endpoint listening on {} ({})",
            local_addr,
            if tls.is_some() { "TLS" } else { "h2c" }
        );

        Ok(Self {
            listener,
            local_addr,
            tls,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until the service's scope is cancelled
    ///
    /// Each connection runs as a tracked task and shuts down gracefully on
    /// cancellation. Transient accept errors are retried after a short pause;
    /// any other accept error ends the loop with an error.
    pub async fn serve(self, service: GatewayService) -> Result<(), GatewayServerError> {
        let token = service.scope().token().clone();

        loop {
            let accepted = tokio::select! {
                _ = token.cancelled() => {
                    info!("Gateway endpoint on {} stopped accepting", self.local_addr);
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!("Accepted connection from {}", peer);
                    let _ = stream.set_nodelay(true);

                    let service_clone = service.clone();
                    let tls = self.tls.clone();
                    service.scope().track(async move {
                        service_clone.serve_connection(stream, peer, tls).await;
                        debug!("Connection from {} finished", peer);
                    });
                }
                Err(e) if is_transient_accept_error(&e) => {
                    warn!("Transient accept error on {}: {}", self.local_addr, e);
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                    }
                }
                Err(e) => {
                    error!("Gateway endpoint accept failed on {}: {}", self.local_addr, e);
                    return Err(GatewayServerError::AcceptError {
                        address: self.local_addr,
                        source: e,
                    });
                }
            }
        }
    }
}
