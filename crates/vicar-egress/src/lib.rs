//! Egress dispatch: relay tunnel streams for a local port to a remote URL
//!
//! Each `out PORT=URL` mapping owns one [`EgressDispatcher`] with its own
//! HTTP/2 connector. A stream routed to the port is re-sent as a POST to the
//! remote URL (plus whatever path followed the routing key), and the remote
//! response is streamed back unchanged.
//!
//! A failed remote attempt only fails the current stream. There is no retry
//! and the mapping stays usable for the next stream.
//!
//! Remotes must speak HTTP/2: cleartext h2 with prior knowledge for `http`
//! URLs, ALPN `h2` for `https`. An HTTP/1.1-only server fails every stream
//! with 502.

use std::collections::HashMap;
use std::sync::Arc;

use http::header::HOST;
use hyper::{Request, Response, StatusCode};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;
use vicar_mapping::{MappingTable, PortMapping};
use vicar_transport::{
    incoming_body, text_response, ConnectorSettings, H2Connector, TransportError, TunnelBody,
};

/// Egress errors
#[derive(Debug, Error)]
pub enum EgressError {
    #[error("Cannot create dispatcher for port {port}: {source}")]
    Setup {
        port: u16,
        #[source]
        source: TransportError,
    },

    #[error("Remote {url} unavailable: {source}")]
    Remote {
        url: String,
        #[source]
        source: TransportError,
    },
}

impl EgressError {
    /// HTTP status reported to the tunnel client
    pub fn status(&self) -> StatusCode {
        match self {
            EgressError::Remote { source, .. } if source.is_timeout() => {
                StatusCode::GATEWAY_TIMEOUT
            }
            _ => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn into_response(self) -> Response<TunnelBody> {
        text_response(self.status(), self.to_string())
    }
}

/// Forwarding path for one `out` mapping to an HTTP/2 remote
#[derive(Debug)]
pub struct EgressDispatcher {
    local_port: u16,
    connector: H2Connector,
}

impl EgressDispatcher {
    pub fn new(mapping: &PortMapping, settings: ConnectorSettings) -> Result<Self, EgressError> {
        let connector = H2Connector::new(mapping.remote_url.clone(), settings).map_err(|e| {
            EgressError::Setup {
                port: mapping.local_port,
                source: e,
            }
        })?;

        Ok(Self {
            local_port: mapping.local_port,
            connector,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn remote_url(&self) -> &Url {
        self.connector.base_url()
    }

    /// Relay one stream to the remote URL
    ///
    /// `rest` is the request path after the routing key (with query). The
    /// request body is streamed to the remote as it arrives and the remote's
    /// status, headers and body are mirrored in the returned response.
    pub async fn forward(
        &self,
        rest: &str,
        request: Request<TunnelBody>,
    ) -> Result<Response<TunnelBody>, EgressError> {
        let (parts, body) = request.into_parts();

        let mut outbound = Request::post(self.connector.request_uri(rest).map_err(|e| {
            EgressError::Remote {
                url: self.remote_url().to_string(),
                source: e,
            }
        })?)
        .body(body)
        .map_err(|e| EgressError::Remote {
            url: self.remote_url().to_string(),
            source: TransportError::InvalidUri(e.to_string()),
        })?;

        for (name, value) in parts.headers.iter() {
            if name != HOST {
                outbound.headers_mut().append(name.clone(), value.clone());
            }
        }

        debug!(
            "[port {}] Forwarding stream to {}",
            self.local_port,
            outbound.uri()
        );

        let response = self.connector.send(outbound).await.map_err(|e| {
            warn!(
                "[port {}] Remote {} failed: {}",
                self.local_port,
                self.remote_url(),
                e
            );
            EgressError::Remote {
                url: self.remote_url().to_string(),
                source: e,
            }
        })?;

        debug!(
            "[port {}] Remote answered {}",
            self.local_port,
            response.status()
        );
        Ok(response.map(incoming_body))
    }

    /// Release the shared remote connection
    pub async fn close(&self) {
        self.connector.close().await;
    }
}

/// Every egress dispatcher, indexed by local port
#[derive(Debug, Clone, Default)]
pub struct EgressDispatchers {
    by_port: HashMap<u16, Arc<EgressDispatcher>>,
}

impl EgressDispatchers {
    /// Build one dispatcher per `out` mapping in the table
    pub fn from_table(
        table: &MappingTable,
        settings: &ConnectorSettings,
    ) -> Result<Self, EgressError> {
        let mut by_port = HashMap::with_capacity(table.port_mappings().len());
        for mapping in table.port_mappings() {
            let dispatcher = EgressDispatcher::new(mapping, settings.clone())?;
            info!(
                "Egress port {} -> {}",
                mapping.local_port, mapping.remote_url
            );
            by_port.insert(mapping.local_port, Arc::new(dispatcher));
        }
        Ok(Self { by_port })
    }

    pub fn get(&self, port: u16) -> Option<Arc<EgressDispatcher>> {
        self.by_port.get(&port).cloned()
    }

    pub fn len(&self) -> usize {
        self.by_port.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_port.is_empty()
    }

    pub async fn close_all(&self) {
        for dispatcher in self.by_port.values() {
            dispatcher.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http_body_util::BodyExt;
    use hyper::body::Incoming;
    use hyper::server::conn::http2;
    use hyper::service::service_fn;
    use hyper_util::rt::{TokioExecutor, TokioIo};
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use vicar_mapping::ServiceMapping;
    use vicar_transport::full_body;

    /// h2c server answering 201 with "<path>|<body>"
    async fn start_remote() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                tokio::spawn(async move {
                    let service = service_fn(|req: Request<Incoming>| async move {
                        let path = req
                            .uri()
                            .path_and_query()
                            .map(|pq| pq.as_str().to_string())
                            .unwrap_or_default();
                        let body = req.into_body().collect().await.unwrap().to_bytes();
                        let mut reply = path.into_bytes();
                        reply.push(b'|');
                        reply.extend_from_slice(&body);

                        let mut response = Response::new(full_body(Bytes::from(reply)));
                        *response.status_mut() = StatusCode::CREATED;
                        Ok::<_, Infallible>(response)
                    });
                    let _ = http2::Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        addr
    }

    fn dispatcher(port: u16, url: &str) -> EgressDispatcher {
        let mapping = PortMapping::parse(port, url).unwrap();
        EgressDispatcher::new(
            &mapping,
            ConnectorSettings {
                connect_timeout: Duration::from_secs(2),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_forward_mirrors_remote_response() {
        let addr = start_remote().await;
        let dispatcher = dispatcher(9002, &format!("http://{}/base", addr));

        let request = Request::post("/9002/items?x=1")
            .body(full_body("payload"))
            .unwrap();
        let response = dispatcher.forward("/items?x=1", request).await.unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"/base/items?x=1|payload");
    }

    #[tokio::test]
    async fn test_connection_is_shared_between_streams() {
        let addr = start_remote().await;
        let dispatcher = dispatcher(9002, &format!("http://{}", addr));

        for i in 0..3 {
            let request = Request::post("/").body(full_body(format!("n{}", i))).unwrap();
            let response = dispatcher.forward("", request).await.unwrap();
            let body = response.into_body().collect().await.unwrap().to_bytes();
            assert_eq!(body, Bytes::from(format!("/|n{}", i)));
        }
    }

    #[tokio::test]
    async fn test_unreachable_remote_is_bad_gateway() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let dispatcher = dispatcher(9002, &format!("http://127.0.0.1:{}", port));
        let request = Request::post("/9002").body(full_body("x")).unwrap();
        let err = dispatcher.forward("", request).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);

        // The mapping stays usable; a second attempt fails the same way
        let request = Request::post("/9002").body(full_body("x")).unwrap();
        let response = dispatcher.forward("", request).await.unwrap_err().into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_http1_only_remote_is_bad_gateway() {
        // Answers the h2 preface like an HTTP/1.1 server, then hangs up
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 64];
                let _ = stream.read(&mut buf).await;
                let _ = stream
                    .write_all(b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n")
                    .await;
            }
        });

        let dispatcher = dispatcher(9002, &format!("http://{}", addr));
        let request = Request::post("/9002").body(full_body("x")).unwrap();
        let err = dispatcher.forward("", request).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_timeout_maps_to_gateway_timeout() {
        let err = EgressError::Remote {
            url: "http://peer.local".to_string(),
            source: TransportError::ConnectTimeout("peer.local:80".to_string()),
        };
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_dispatchers_from_table() {
        let table = MappingTable::new(
            vec![ServiceMapping::new("web", 9001)],
            vec![
                PortMapping::parse(9002, "http://a.local").unwrap(),
                PortMapping::parse(9003, "https://b.local/x").unwrap(),
            ],
        )
        .unwrap();

        let dispatchers =
            EgressDispatchers::from_table(&table, &ConnectorSettings::default()).unwrap();
        assert_eq!(dispatchers.len(), 2);
        assert_eq!(
            dispatchers.get(9003).unwrap().remote_url().as_str(),
            "https://b.local/x"
        );
        assert!(dispatchers.get(9001).is_none());
    }
}
