//! Router: resolve routing keys and dispatch tunnel streams

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::{Request, Response};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};
use vicar_egress::EgressDispatchers;
use vicar_mapping::{MappingTable, PortTarget, RouteKey, ServiceMapping};
use vicar_transport::{incoming_body, relay, TaskScope, TunnelBody, TunnelStream};

use crate::route::{Route, RouteError, ServiceTarget};

/// Routes tunnel streams to local services or egress dispatchers
#[derive(Debug, Clone)]
pub struct Router {
    table: Arc<MappingTable>,
    egress: EgressDispatchers,
    local_ip: IpAddr,
    connect_timeout: Duration,
    scope: TaskScope,
}

impl Router {
    /// `local_ip` is where services are dialed; relays run inside `scope`
    pub fn new(
        table: Arc<MappingTable>,
        egress: EgressDispatchers,
        local_ip: IpAddr,
        connect_timeout: Duration,
        scope: TaskScope,
    ) -> Self {
        Self {
            table,
            egress,
            local_ip: dialable(local_ip),
            connect_timeout,
            scope,
        }
    }

    pub fn table(&self) -> &MappingTable {
        &self.table
    }

    /// Resolve a routing key without touching the network
    pub fn resolve(&self, key: &RouteKey) -> Result<Route, RouteError> {
        if let Some(service) = self.table.service(key.as_str()) {
            trace!("Key {} matched service name", key);
            return Ok(Route::Service(self.service_target(service)));
        }

        match key.port().and_then(|port| self.table.lookup_port(port)) {
            Some(PortTarget::Service(service)) => {
                trace!("Key {} matched service port", key);
                Ok(Route::Service(self.service_target(service)))
            }
            Some(PortTarget::Egress(mapping)) => self
                .egress
                .get(mapping.local_port)
                .map(Route::Egress)
                .ok_or_else(|| RouteError::UnknownRoute(key.to_string())),
            None => Err(RouteError::UnknownRoute(key.to_string())),
        }
    }

    /// Dispatch one tunnel request; errors become HTTP responses
    pub async fn dispatch(&self, key: &RouteKey, request: Request<Incoming>) -> Response<TunnelBody> {
        let result = match self.resolve(key) {
            Ok(Route::Service(target)) => self.dispatch_service(target, request).await,
            Ok(Route::Egress(dispatcher)) => dispatcher
                .forward(key.rest(), request.map(incoming_body))
                .await
                .map_err(RouteError::from),
            Err(e) => Err(e),
        };

        result.unwrap_or_else(|e| {
            debug!("Stream for key '{}' failed: {}", key, e);
            e.into_response()
        })
    }

    /// Splice the stream with a new connection to the service
    async fn dispatch_service(
        &self,
        target: ServiceTarget,
        request: Request<Incoming>,
    ) -> Result<Response<TunnelBody>, RouteError> {
        let local = match timeout(self.connect_timeout, TcpStream::connect(target.addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(RouteError::ServiceUnreachable { target, source: e }),
            Err(_) => return Err(RouteError::ServiceTimeout(target)),
        };
        let _ = local.set_nodelay(true);

        debug!("Connected to service {}", target);

        let (tunnel, body) = TunnelStream::accept(request.into_body());
        let label = target.to_string();
        self.scope.spawn(async move {
            // Errors are logged and the stream reset inside relay()
            let _ = relay(tunnel, local, &label).await;
        });

        Ok(Response::new(body))
    }

    fn service_target(&self, service: &ServiceMapping) -> ServiceTarget {
        ServiceTarget {
            name: service.name.clone(),
            addr: SocketAddr::new(self.local_ip, service.local_port),
        }
    }
}

/// Wildcard bind addresses are dialed through loopback
fn dialable(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(v4) if v4.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(v6) if v6.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http_body_util::BodyExt;
    use hyper::service::service_fn;
    use hyper::StatusCode;
    use hyper_util::rt::{TokioExecutor, TokioIo};
    use std::convert::Infallible;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;
    use url::Url;
    use vicar_mapping::PortMapping;
    use vicar_transport::{empty_body, ConnectorSettings, H2Connector};

    fn router(services: Vec<ServiceMapping>, ports: Vec<PortMapping>) -> Router {
        let table = Arc::new(MappingTable::new(services, ports).unwrap());
        let egress = EgressDispatchers::from_table(&table, &ConnectorSettings::default()).unwrap();
        Router::new(
            table,
            egress,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            Duration::from_secs(2),
            TaskScope::new(CancellationToken::new()),
        )
    }

    fn key(path: &str) -> RouteKey {
        RouteKey::from_path(path, None)
    }

    #[test]
    fn test_resolve_service_and_egress() {
        let router = router(
            vec![ServiceMapping::new("web", 9001)],
            vec![PortMapping::parse(9002, "http://backend.local").unwrap()],
        );

        match router.resolve(&key("/web")).unwrap() {
            Route::Service(target) => {
                assert_eq!(target.name, "web");
                assert_eq!(target.addr, "127.0.0.1:9001".parse().unwrap());
            }
            other => panic!("unexpected route {:?}", other),
        }

        match router.resolve(&key("/9002/x")).unwrap() {
            Route::Egress(dispatcher) => assert_eq!(dispatcher.local_port(), 9002),
            other => panic!("unexpected route {:?}", other),
        }

        // A service's own port resolves to the service
        assert!(matches!(
            router.resolve(&key("/9001")).unwrap(),
            Route::Service(_)
        ));
    }

    #[test]
    fn test_resolve_unknown() {
        let router = router(vec![ServiceMapping::new("web", 9001)], vec![]);

        for path in ["/api", "/", "/9999", "/+9001", "/WEB"] {
            let err = router.resolve(&key(path)).unwrap_err();
            assert_eq!(err.status(), StatusCode::NOT_FOUND, "path {}", path);
        }
    }

    #[test]
    fn test_service_name_wins_over_port() {
        let router = router(
            vec![ServiceMapping::new("9002", 7000)],
            vec![PortMapping::parse(9002, "http://backend.local").unwrap()],
        );

        match router.resolve(&key("/9002")).unwrap() {
            Route::Service(target) => assert_eq!(target.addr.port(), 7000),
            other => panic!("unexpected route {:?}", other),
        }
    }

    #[test]
    fn test_wildcard_local_ip_dials_loopback() {
        assert_eq!(
            dialable("0.0.0.0".parse().unwrap()),
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        );
        assert_eq!(
            dialable("::".parse().unwrap()),
            IpAddr::V6(Ipv6Addr::LOCALHOST)
        );
        assert_eq!(
            dialable("10.0.0.5".parse().unwrap()),
            "10.0.0.5".parse::<IpAddr>().unwrap()
        );
    }

    /// h2c server handing every request to the router
    async fn serve_router(router: Router) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let router = router.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let router = router.clone();
                        async move {
                            let key = RouteKey::from_path(req.uri().path(), req.uri().query());
                            Ok::<_, Infallible>(router.dispatch(&key, req).await)
                        }
                    });
                    let _ = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Url::parse(&format!("http://{}", addr)).unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_splices_service() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_port = echo.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = echo.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let url = serve_router(router(vec![ServiceMapping::new("echo", echo_port)], vec![])).await;
        let connector = H2Connector::new(url, ConnectorSettings::default()).unwrap();

        let mut stream = connector.open_stream("/echo").await.unwrap();
        stream.write_all(b"PING").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PING");
    }

    #[tokio::test]
    async fn test_dispatch_unknown_and_unreachable() {
        let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let closed_port = closed.local_addr().unwrap().port();
        drop(closed);

        let url = serve_router(router(vec![ServiceMapping::new("down", closed_port)], vec![])).await;
        let connector = H2Connector::new(url, ConnectorSettings::default()).unwrap();

        let response = connector.post("/api", empty_body()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: Bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"Unknown route: api");

        let response = connector.post("/down", empty_body()).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
