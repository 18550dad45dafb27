//! Routing keys extracted from tunnel request paths

use std::fmt;

/// Routing key for a tunnel request
///
/// The key is the first segment of the request path (`/web/...` -> `web`).
/// Whatever follows it, including the query string, is kept as `rest` so an
/// egress dispatcher can append it to the remote URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey {
    key: String,
    rest: String,
}

impl RouteKey {
    /// Split a request path (and optional query) into key and remainder
    pub fn from_path(path: &str, query: Option<&str>) -> Self {
        let trimmed = path.strip_prefix('/').unwrap_or(path);
        let (key, tail) = match trimmed.find('/') {
            Some(idx) => (&trimmed[..idx], &trimmed[idx..]),
            None => (trimmed, ""),
        };

        let mut rest = tail.to_string();
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            rest.push('?');
            rest.push_str(query);
        }

        Self {
            key: key.to_string(),
            rest,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// Path remainder after the key, with the query string if any
    pub fn rest(&self) -> &str {
        &self.rest
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_empty()
    }

    /// The key as a port number, if it consists only of ASCII digits
    pub fn port(&self) -> Option<u16> {
        if self.key.is_empty() || !self.key.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        self.key.parse().ok()
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_from_simple_path() {
        let key = RouteKey::from_path("/web", None);
        assert_eq!(key.as_str(), "web");
        assert_eq!(key.rest(), "");
        assert_eq!(key.port(), None);
    }

    #[test]
    fn test_key_with_rest_and_query() {
        let key = RouteKey::from_path("/9002/api/items", Some("page=2"));
        assert_eq!(key.as_str(), "9002");
        assert_eq!(key.rest(), "/api/items?page=2");
        assert_eq!(key.port(), Some(9002));

        let key = RouteKey::from_path("/9002", Some("x=1"));
        assert_eq!(key.rest(), "?x=1");
    }

    #[test]
    fn test_empty_key() {
        assert!(RouteKey::from_path("/", None).is_empty());
        assert!(RouteKey::from_path("", None).is_empty());
        assert!(RouteKey::from_path("//web", None).is_empty());
    }

    #[test]
    fn test_port_requires_plain_digits() {
        assert_eq!(RouteKey::from_path("/+9002", None).port(), None);
        assert_eq!(RouteKey::from_path("/-1", None).port(), None);
        assert_eq!(RouteKey::from_path("/70000", None).port(), None);
        assert_eq!(RouteKey::from_path("/0", None).port(), Some(0));
    }
}
