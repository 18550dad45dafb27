//! Immutable mapping table indexed by service name and by local port

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use tracing::trace;
use url::Url;

use crate::{parse_remote_url, validate_service_name, ConfigError};

/// One `--in NAME=PORT` entry: a named local service on a local port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceMapping {
    pub name: String,
    pub local_port: u16,
}

impl ServiceMapping {
    pub fn new(name: impl Into<String>, local_port: u16) -> Self {
        Self {
            name: name.into(),
            local_port,
        }
    }
}

impl fmt::Display for ServiceMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.local_port)
    }
}

impl FromStr for ServiceMapping {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, port) = split_pair(s)?;
        validate_service_name(name)?;
        let local_port = parse_port(s, port)?;
        Ok(Self::new(name, local_port))
    }
}

/// One `--out PORT=URL` entry: streams for a local port go to a remote URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub local_port: u16,
    pub remote_url: Url,
}

impl PortMapping {
    pub fn new(local_port: u16, remote_url: Url) -> Self {
        Self {
            local_port,
            remote_url,
        }
    }

    /// Build a mapping from a raw URL string
    pub fn parse(local_port: u16, remote_url: &str) -> Result<Self, ConfigError> {
        Ok(Self::new(local_port, parse_remote_url(remote_url)?))
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.local_port, self.remote_url)
    }
}

impl FromStr for PortMapping {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (port, url) = split_pair(s)?;
        let local_port = parse_port(s, port)?;
        Self::parse(local_port, url)
    }
}

fn split_pair(s: &str) -> Result<(&str, &str), ConfigError> {
    s.split_once('=').ok_or_else(|| ConfigError::Malformed {
        value: s.to_string(),
        reason: "expected KEY=VALUE".to_string(),
    })
}

fn parse_port(whole: &str, raw: &str) -> Result<u16, ConfigError> {
    raw.trim().parse::<u16>().map_err(|e| ConfigError::Malformed {
        value: whole.to_string(),
        reason: format!("invalid port '{}': {}", raw, e),
    })
}

/// Result of a port lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortTarget<'a> {
    /// The port belongs to an `in` mapping
    Service(&'a ServiceMapping),
    /// The port belongs to an `out` mapping
    Egress(&'a PortMapping),
}

#[derive(Debug, Clone, Copy)]
enum PortSlot {
    Service(usize),
    Egress(usize),
}

/// Mapping table for all `in` and `out` entries
///
/// There are no mutation methods: every entry is validated in [`MappingTable::new`]
/// and the table stays fixed until the process exits.
#[derive(Debug, Clone)]
pub struct MappingTable {
    services: Vec<ServiceMapping>,
    egress: Vec<PortMapping>,
    by_name: HashMap<String, usize>,
    by_port: HashMap<u16, PortSlot>,
}

impl MappingTable {
    /// Validate and index the given mappings
    ///
    /// Entries are checked in order (services first, then ports) so the
    /// reported collision is always the first one in configuration order.
    pub fn new(
        services: Vec<ServiceMapping>,
        egress: Vec<PortMapping>,
    ) -> Result<Self, ConfigError> {
        if services.is_empty() && egress.is_empty() {
            return Err(ConfigError::NoMappings);
        }

        let mut by_name = HashMap::with_capacity(services.len());
        let mut by_port = HashMap::with_capacity(services.len() + egress.len());

        for (idx, service) in services.iter().enumerate() {
            validate_service_name(&service.name)?;
            if service.local_port == 0 {
                return Err(ConfigError::InvalidPort(0));
            }
            if by_name.insert(service.name.clone(), idx).is_some() {
                return Err(ConfigError::DuplicateService(service.name.clone()));
            }
            if by_port
                .insert(service.local_port, PortSlot::Service(idx))
                .is_some()
            {
                return Err(ConfigError::DuplicatePort(service.local_port));
            }
            trace!("Indexed service {} -> port {}", service.name, service.local_port);
        }

        for (idx, mapping) in egress.iter().enumerate() {
            if mapping.local_port == 0 {
                return Err(ConfigError::InvalidPort(0));
            }
            match mapping.remote_url.scheme() {
                "http" | "https" => {}
                other => {
                    return Err(ConfigError::UnsupportedScheme {
                        url: mapping.remote_url.to_string(),
                        scheme: other.to_string(),
                    })
                }
            }
            if by_port
                .insert(mapping.local_port, PortSlot::Egress(idx))
                .is_some()
            {
                return Err(ConfigError::DuplicatePort(mapping.local_port));
            }
            trace!(
                "Indexed egress port {} -> {}",
                mapping.local_port,
                mapping.remote_url
            );
        }

        Ok(Self {
            services,
            egress,
            by_name,
            by_port,
        })
    }

    /// Look up the local port of a service by name
    pub fn lookup_service(&self, name: &str) -> Option<u16> {
        self.service(name).map(|s| s.local_port)
    }

    /// Look up the full service mapping by name
    pub fn service(&self, name: &str) -> Option<&ServiceMapping> {
        self.by_name.get(name).map(|&idx| &self.services[idx])
    }

    /// Look up whatever owns a local port
    pub fn lookup_port(&self, port: u16) -> Option<PortTarget<'_>> {
        self.by_port.get(&port).map(|slot| match *slot {
            PortSlot::Service(idx) => PortTarget::Service(&self.services[idx]),
            PortSlot::Egress(idx) => PortTarget::Egress(&self.egress[idx]),
        })
    }

    /// Look up the remote URL of an egress port
    pub fn remote_url(&self, port: u16) -> Option<&Url> {
        match self.lookup_port(port)? {
            PortTarget::Egress(mapping) => Some(&mapping.remote_url),
            PortTarget::Service(_) => None,
        }
    }

    /// `in` mappings in configuration order
    pub fn services(&self) -> &[ServiceMapping] {
        &self.services
    }

    /// `out` mappings in configuration order
    pub fn port_mappings(&self) -> &[PortMapping] {
        &self.egress
    }

    /// Whether a local port is claimed by any mapping
    pub fn contains_port(&self, port: u16) -> bool {
        self.by_port.contains_key(&port)
    }

    /// Service names that also parse as an `out` port
    ///
    /// Requests for these keys are routed to the service; the port mapping is
    /// only reachable through other keys.
    pub fn ambiguous_keys(&self) -> Vec<&str> {
        self.services
            .iter()
            .filter(|s| {
                s.name.bytes().all(|b| b.is_ascii_digit())
                    && s.name
                        .parse::<u16>()
                        .ok()
                        .and_then(|port| self.lookup_port(port))
                        .is_some_and(|target| matches!(target, PortTarget::Egress(_)))
            })
            .map(|s| s.name.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.services.len() + self.egress.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
