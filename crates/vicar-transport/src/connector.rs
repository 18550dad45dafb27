//! HTTP/2 client for remote gateways
//!
//! One connector per remote base URL. The first request dials the remote
//! (cleartext h2 with prior knowledge for `http`, TLS with ALPN `h2` for
//! `https`) and later requests are multiplexed as separate streams over the
//! same connection. A closed connection is replaced on the next request.

use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::client::conn::http2::{self, SendRequest};
use hyper::{Method, Request, Response, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};
use url::{Host, Url};

use crate::body::{channel_body, TunnelBody};
use crate::stream::TunnelStream;
use crate::{TransportError, TransportResult};

/// Interval for HTTP/2 PING keepalives on idle connections
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Connector settings
#[derive(Debug, Clone)]
pub struct ConnectorSettings {
    /// Bound on dialing (TCP + TLS + h2 handshake) and on waiting for
    /// response headers
    pub connect_timeout: Duration,
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// HTTP/2 connector for one remote gateway
pub struct H2Connector {
    base: Url,
    /// Host without IPv6 brackets, used for dialing and SNI
    host: String,
    port: u16,
    /// `host:port` as it appears in request URIs
    authority: String,
    tls: Option<TlsConnector>,
    settings: ConnectorSettings,
    sender: Mutex<Option<SendRequest<TunnelBody>>>,
}

impl std::fmt::Debug for H2Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2Connector")
            .field("base", &self.base.as_str())
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl H2Connector {
    pub fn new(base: Url, settings: ConnectorSettings) -> TransportResult<Self> {
        let host = match base.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            None => return Err(TransportError::InvalidUri(format!("{} has no host", base))),
        };
        let port = base
            .port_or_known_default()
            .ok_or_else(|| TransportError::InvalidUri(format!("{} has no port", base)))?;
        let authority = match base.host_str() {
            Some(host_str) => format!("{}:{}", host_str, port),
            None => format!("{}:{}", host, port),
        };

        let tls = match base.scheme() {
            "https" => Some(build_tls_connector()?),
            "http" => None,
            other => {
                return Err(TransportError::InvalidUri(format!(
                    "unsupported scheme '{}' in {}",
                    other, base
                )))
            }
        };

        Ok(Self {
            base,
            host,
            port,
            authority,
            tls,
            settings,
            sender: Mutex::new(None),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Build the request URI for `suffix` under the base URL path
    ///
    /// `suffix` is a path remainder with an optional query, e.g. `/api?x=1`,
    /// `?x=1` or an empty string. A query on the suffix replaces any query on
    /// the base URL.
    pub fn request_uri(&self, suffix: &str) -> TransportResult<Uri> {
        let (suffix_path, suffix_query) = match suffix.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (suffix, None),
        };

        let mut path = self.base.path().trim_end_matches('/').to_string();
        if !suffix_path.is_empty() && !suffix_path.starts_with('/') {
            path.push('/');
        }
        path.push_str(suffix_path);
        if path.is_empty() {
            path.push('/');
        }

        let mut uri = format!("{}://{}{}", self.base.scheme(), self.authority, path);
        if let Some(query) = suffix_query.or(self.base.query()) {
            uri.push('?');
            uri.push_str(query);
        }

        uri.parse::<Uri>()
            .map_err(|e| TransportError::InvalidUri(format!("{}: {}", uri, e)))
    }

    /// Send a request over the shared connection
    ///
    /// Returns once response headers arrive; the response body streams
    /// independently.
    pub async fn send(&self, request: Request<TunnelBody>) -> TransportResult<Response<Incoming>> {
        let mut sender = self.sender().await?;

        let result = timeout(self.settings.connect_timeout, async {
            sender.ready().await?;
            sender.send_request(request).await
        })
        .await
        .map_err(|_| TransportError::ResponseTimeout(self.authority.clone()))?;

        result.map_err(|e| TransportError::ConnectionError {
            target: self.authority.clone(),
            reason: e.to_string(),
        })
    }

    /// POST `body` to `suffix` under the base URL
    pub async fn post(&self, suffix: &str, body: TunnelBody) -> TransportResult<Response<Incoming>> {
        let uri = self.request_uri(suffix)?;
        debug!("Opening stream POST {}", uri);

        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .body(body)
            .map_err(|e| TransportError::InvalidUri(e.to_string()))?;

        self.send(request).await
    }

    /// Open a tunnel stream to `suffix` on the remote gateway
    ///
    /// Any non-2xx status from the remote is a [`TransportError::Rejected`].
    pub async fn open_stream(&self, suffix: &str) -> TransportResult<TunnelStream> {
        let (send, body) = channel_body();
        let response = self.post(suffix, body).await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Rejected(status));
        }

        Ok(TunnelStream::new(response.into_body(), send))
    }

    /// Drop the cached connection; open streams keep it alive until they end
    pub async fn close(&self) {
        if self.sender.lock().await.take().is_some() {
            debug!("Released HTTP/2 connection to {}", self.authority);
        }
    }

    async fn sender(&self) -> TransportResult<SendRequest<TunnelBody>> {
        if let Some(sender) = self.cached_sender().await {
            return Ok(sender);
        }

        // Lock is not held while dialing
        let sender = timeout(self.settings.connect_timeout, self.connect())
            .await
            .map_err(|_| TransportError::ConnectTimeout(self.authority.clone()))??;

        let mut cached = self.sender.lock().await;
        if let Some(existing) = cached.as_ref().filter(|s| !s.is_closed()) {
            // Lost a race with a concurrent dial; ours is dropped
            return Ok(existing.clone());
        }
        *cached = Some(sender.clone());
        Ok(sender)
    }

    /// Open cached connection, if any
    async fn cached_sender(&self) -> Option<SendRequest<TunnelBody>> {
        let mut cached = self.sender.lock().await;
        match cached.as_ref() {
            Some(sender) if !sender.is_closed() => Some(sender.clone()),
            Some(_) => {
                debug!("HTTP/2 connection to {} closed, reconnecting", self.authority);
                *cached = None;
                None
            }
            None => None,
        }
    }

    async fn connect(&self) -> TransportResult<SendRequest<TunnelBody>> {
        let tcp = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| TransportError::ConnectionError {
                target: self.authority.clone(),
                reason: e.to_string(),
            })?;
        let _ = tcp.set_nodelay(true);

        match &self.tls {
            Some(tls) => {
                let server_name = ServerName::try_from(self.host.clone())
                    .map_err(|e| TransportError::TlsError(format!("Invalid server name: {}", e)))?;
                let stream = tls
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| TransportError::TlsError(format!("TLS handshake failed: {}", e)))?;
                self.handshake(stream).await
            }
            None => self.handshake(tcp).await,
        }
    }

    async fn handshake<T>(&self, io: T) -> TransportResult<SendRequest<TunnelBody>>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut builder = http2::Builder::new(TokioExecutor::new());
        builder
            .timer(TokioTimer::new())
            .keep_alive_interval(KEEPALIVE_INTERVAL)
            .keep_alive_while_idle(true);

        let (sender, connection) = builder
            .handshake(TokioIo::new(io))
            .await
            .map_err(|e| TransportError::ProtocolError(format!("H2 handshake failed: {}", e)))?;

        let target = self.authority.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("HTTP/2 connection to {} ended: {}", target, e);
            }
        });

        info!("HTTP/2 connection established to {}", self.authority);
        Ok(sender)
    }
}

/// TLS client config with webpki roots and ALPN `h2`
fn build_tls_connector() -> TransportResult<TlsConnector> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let mut client_crypto =
        rustls::ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| TransportError::TlsError(format!("Invalid TLS config: {}", e)))?
            .with_root_certificates(roots)
            .with_no_client_auth();

    client_crypto.alpn_protocols = vec![b"h2".to_vec()];

    Ok(TlsConnector::from(Arc::new(client_crypto)))
}
