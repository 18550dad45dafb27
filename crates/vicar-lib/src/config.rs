//! Gateway configuration

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use url::{Host, Url};
use vicar_mapping::{parse_remote_url, ConfigError, MappingTable, PortMapping, ServiceMapping};

/// Default timeout for dialing services and remote gateways
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default grace period for relays to finish at shutdown
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// PEM certificate and key for the gateway endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Immutable gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Gateway endpoint listen address
    pub listen: SocketAddr,
    /// `in NAME=PORT` mappings
    pub services: Vec<ServiceMapping>,
    /// `out PORT=URL` mappings
    pub ports: Vec<PortMapping>,
    /// Gateway that ingress listeners tunnel to; without it no ingress
    /// listener is bound
    pub upstream: Option<Url>,
    /// Address ingress listeners bind and services are dialed on
    pub local_ip: IpAddr,
    pub connect_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub tls: Option<TlsFiles>,
}

impl GatewayConfig {
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            services: Vec::new(),
            ports: Vec::new(),
            upstream: None,
            local_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            tls: None,
        }
    }

    /// Add an `in` mapping
    pub fn service(mut self, name: impl Into<String>, local_port: u16) -> Self {
        self.services.push(ServiceMapping::new(name, local_port));
        self
    }

    /// Add an `out` mapping
    pub fn port(mut self, local_port: u16, remote_url: Url) -> Self {
        self.ports.push(PortMapping::new(local_port, remote_url));
        self
    }

    pub fn with_services(mut self, services: Vec<ServiceMapping>) -> Self {
        self.services.extend(services);
        self
    }

    pub fn with_ports(mut self, ports: Vec<PortMapping>) -> Self {
        self.ports.extend(ports);
        self
    }

    pub fn upstream(mut self, url: Url) -> Self {
        self.upstream = Some(url);
        self
    }

    pub fn local_ip(mut self, ip: IpAddr) -> Self {
        self.local_ip = ip;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn tls(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.tls = Some(TlsFiles {
            cert: cert.into(),
            key: key.into(),
        });
        self
    }

    /// Validate everything and build the mapping table
    pub fn validate(&self) -> Result<MappingTable, ConfigError> {
        let table = MappingTable::new(self.services.clone(), self.ports.clone())?;

        let listen_port = self.listen.port();
        if listen_port != 0 && table.contains_port(listen_port) {
            return Err(ConfigError::ListenPortConflict(listen_port));
        }

        if let Some(upstream) = &self.upstream {
            parse_remote_url(upstream.as_str())?;
            if self.points_at_self(upstream) {
                return Err(ConfigError::UpstreamLoop(upstream.to_string()));
            }
        }

        if self.connect_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "connect timeout must be greater than zero".to_string(),
            ));
        }

        Ok(table)
    }

    /// Whether `url` resolves to this gateway's own listen socket
    fn points_at_self(&self, url: &Url) -> bool {
        let listen_port = self.listen.port();
        if listen_port == 0 || url.port_or_known_default() != Some(listen_port) {
            return false;
        }

        let listen_ip = self.listen.ip();
        match url.host() {
            Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
            Some(Host::Ipv4(ip)) => {
                let ip = IpAddr::V4(ip);
                ip == listen_ip || ip.is_loopback()
            }
            Some(Host::Ipv6(ip)) => {
                let ip = IpAddr::V6(ip);
                ip == listen_ip || ip.is_loopback()
            }
            None => false,
        }
    }
}
