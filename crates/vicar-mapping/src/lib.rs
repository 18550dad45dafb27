//! Static service and port mappings for the vicar gateway
//!
//! The mapping table is built once at startup from the `--in` and `--out`
//! configuration and is read-only afterwards, so it can be shared between
//! tasks behind an `Arc` without any locking.
//!
//! - `in` mappings associate a service name with a local port
//! - `out` mappings associate a local port with a remote URL
//!
//! Routing keys (the first path segment of a tunnel request) are resolved
//! against both indexes; see [`RouteKey`].

pub mod key;
pub mod table;

pub use key::RouteKey;
pub use table::{MappingTable, PortMapping, PortTarget, ServiceMapping};

use thiserror::Error;
use url::Url;

/// Maximum length of a service name
pub const MAX_SERVICE_NAME_LEN: usize = 64;

/// Configuration errors, raised before any socket is opened
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("at least one of --in or --out must be specified")]
    NoMappings,

    #[error("malformed mapping '{value}': {reason}")]
    Malformed { value: String, reason: String },

    #[error("invalid service name '{name}': {reason}")]
    InvalidServiceName { name: String, reason: String },

    #[error("invalid port {0}: ports must be in 1..=65535")]
    InvalidPort(u16),

    #[error("service '{0}' is mapped more than once")]
    DuplicateService(String),

    #[error("port {0} is mapped more than once")]
    DuplicatePort(u16),

    #[error("port {0} is already used by the gateway listen address")]
    ListenPortConflict(u16),

    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unsupported scheme '{scheme}' in '{url}' (expected http or https)")]
    UnsupportedScheme { url: String, scheme: String },

    #[error("upstream {0} points back at this gateway")]
    UpstreamLoop(String),

    #[error("{0}")]
    Invalid(String),
}

/// Parse and validate a remote gateway URL (`http` or `https` with a host)
pub fn parse_remote_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(ConfigError::UnsupportedScheme {
                url: raw.to_string(),
                scheme: other.to_string(),
            })
        }
    }

    if url.host_str().map_or(true, str::is_empty) {
        return Err(ConfigError::InvalidUrl {
            url: raw.to_string(),
            reason: "missing host".to_string(),
        });
    }

    Ok(url)
}

/// Validate a service name for use as a routing key
pub fn validate_service_name(name: &str) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidServiceName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if name.len() > MAX_SERVICE_NAME_LEN {
        return Err(invalid("name is longer than 64 characters"));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
    {
        return Err(invalid("only ASCII letters, digits, '-', '_' and '.' are allowed"));
    }

    Ok(())
}
