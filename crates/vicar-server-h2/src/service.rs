//! Per-request handling for the gateway endpoint

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http2;
use hyper::service::Service;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};
use vicar_mapping::RouteKey;
use vicar_router::Router;
use vicar_transport::{TaskScope, TunnelBody};

use crate::h2c::{self, H2cUpgradeIo, UpgradeError, MAX_UPGRADE_BODY};
use crate::protocol;

/// Connection window for upgraded connections
///
/// Larger than the RFC default so the injected stream 1 body never pushes
/// the client's view of the window past ours.
const UPGRADE_CONN_WINDOW: u32 = 1024 * 1024;

/// Time allowed for a TLS handshake
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

struct Inner {
    router: Router,
    scope: TaskScope,
    drain_timeout: Duration,
}

/// Request handler shared by every connection of the gateway endpoint
#[derive(Clone)]
pub struct GatewayService {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for GatewayService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayService")
            .field("drain_timeout", &self.inner.drain_timeout)
            .finish()
    }
}

impl GatewayService {
    /// `drain_timeout` bounds how long a connection may take to finish
    /// in-flight streams after shutdown starts
    pub fn new(router: Router, scope: TaskScope, drain_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                router,
                scope,
                drain_timeout,
            }),
        }
    }

    pub fn scope(&self) -> &TaskScope {
        &self.inner.scope
    }

    /// Handle one request
    ///
    /// `secure` is set for TLS connections, where the h2c upgrade does not
    /// apply.
    pub async fn handle(&self, req: Request<Incoming>, secure: bool) -> Response<TunnelBody> {
        info!("{} {} ({:?})", req.method(), req.uri().path(), req.version());

        if !secure && h2c::is_upgrade_request(&req) {
            return self.upgrade(req).await;
        }

        if let Err(e) = protocol::check(&req) {
            debug!("Rejected {} {}: {}", req.method(), req.uri().path(), e);
            return e.into_response();
        }

        let key = RouteKey::from_path(req.uri().path(), req.uri().query());
        self.inner.router.dispatch(&key, req).await
    }

    /// Answer `101` and continue the connection as HTTP/2
    async fn upgrade(&self, mut req: Request<Incoming>) -> Response<TunnelBody> {
        let on_upgrade = hyper::upgrade::on(&mut req);
        let (parts, body) = req.into_parts();

        let body = match Limited::new(body, MAX_UPGRADE_BODY).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.is::<LengthLimitError>() => {
                return UpgradeError::BodyTooLarge.into_response()
            }
            Err(e) => return UpgradeError::Body(e.to_string()).into_response(),
        };

        let stream_one = match h2c::encode_upgrade_stream(&parts, &body) {
            Ok(frames) => frames,
            Err(e) => return e.into_response(),
        };

        let service = self.clone();
        self.inner.scope.track(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    debug!("Connection upgraded to h2c");
                    let io = H2cUpgradeIo::new(TokioIo::new(upgraded), stream_one);
                    service.serve_upgraded(io).await;
                }
                Err(e) => debug!("h2c upgrade failed: {}", e),
            }
        });

        h2c::switching_protocols()
    }

    /// Serve an accepted TCP connection, terminating TLS if configured
    pub async fn serve_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        tls: Option<TlsAcceptor>,
    ) {
        match tls {
            Some(acceptor) => match timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(tls_stream)) => self.serve_auto(tls_stream, peer, true).await,
                Ok(Err(e)) => debug!("TLS handshake with {} failed: {}", peer, e),
                Err(_) => debug!("TLS handshake with {} timed out", peer),
            },
            None => self.serve_auto(stream, peer, false).await,
        }
    }

    /// HTTP/1.1 or HTTP/2, detected from the first bytes
    async fn serve_auto<I>(&self, io: I, peer: SocketAddr, secure: bool)
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let service = ConnectionService {
            gateway: self.clone(),
            secure,
        };

        let mut builder = auto::Builder::new(TokioExecutor::new());
        builder.http2().timer(TokioTimer::new());
        let conn = builder.serve_connection_with_upgrades(TokioIo::new(io), service);
        tokio::pin!(conn);

        let token = self.inner.scope.token().clone();
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    debug!("Connection from {} closed with error: {}", peer, e);
                }
            }
            _ = token.cancelled() => {
                conn.as_mut().graceful_shutdown();
                if timeout(self.inner.drain_timeout, conn.as_mut()).await.is_err() {
                    debug!("Connection from {} did not drain in time", peer);
                }
            }
        }
    }

    async fn serve_upgraded<I>(&self, io: H2cUpgradeIo<I>)
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let service = ConnectionService {
            gateway: self.clone(),
            secure: false,
        };

        let mut builder = http2::Builder::new(TokioExecutor::new());
        builder
            .timer(TokioTimer::new())
            .initial_connection_window_size(UPGRADE_CONN_WINDOW);
        let conn = builder.serve_connection(TokioIo::new(io), service);
        tokio::pin!(conn);

        let token = self.inner.scope.token().clone();
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    debug!("Upgraded connection closed with error: {}", e);
                }
            }
            _ = token.cancelled() => {
                conn.as_mut().graceful_shutdown();
                if timeout(self.inner.drain_timeout, conn.as_mut()).await.is_err() {
                    debug!("Upgraded connection did not drain in time");
                }
            }
        }
    }
}

/// hyper service for one connection
#[derive(Clone)]
struct ConnectionService {
    gateway: GatewayService,
    secure: bool,
}

impl Service<Request<Incoming>> for ConnectionService {
    type Response = Response<TunnelBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let gateway = self.gateway.clone();
        let secure = self.secure;
        Box::pin(async move { Ok(gateway.handle(req, secure).await) })
    }
}
