//! Snapshot of the HTTP upgrade request.

// ============================================================================
// Imports
// ============================================================================

use rustc_hash::FxHashMap;
use tokio_tungstenite::tungstenite::http::Request;

// ============================================================================
// HandshakeRequest
// ============================================================================

/// Immutable view of the request that opened a connection.
///
/// Header names are matched case-insensitively. A header may carry
/// several values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeRequest {
    headers: FxHashMap<String, Vec<String>>,
    scheme: String,
    host: String,
    port: Option<u16>,
    path: String,
    query: Option<String>,
}

impl HandshakeRequest {
    /// Creates an empty snapshot for the given path.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            scheme: "ws".to_string(),
            path: path.into(),
            ..Self::default()
        }
    }

    /// Captures an upgrade request.
    ///
    /// The authority is taken from the request URI when present and from
    /// the `Host` header otherwise.
    #[must_use]
    pub fn from_http<B>(request: &Request<B>, secure: bool) -> Self {
        let uri = request.uri();
        let mut snapshot = Self {
            scheme: uri
                .scheme_str()
                .map(str::to_owned)
                .unwrap_or_else(|| if secure { "wss" } else { "ws" }.to_string()),
            path: uri.path().to_string(),
            query: uri.query().map(str::to_owned),
            ..Self::default()
        };

        for (name, value) in request.headers() {
            if let Ok(value) = value.to_str() {
                snapshot = snapshot.with_header(name.as_str(), value);
            }
        }

        match uri.host() {
            Some(host) => {
                snapshot.host = host.to_string();
                snapshot.port = uri.port_u16();
            }
            None => {
                if let Some(authority) = snapshot.header("host").map(str::to_owned) {
                    let (host, port) = split_authority(&authority);
                    snapshot.host = host.to_string();
                    snapshot.port = port;
                }
            }
        }

        if snapshot.port.is_none() {
            snapshot.port = match snapshot.scheme.as_str() {
                "wss" | "https" => Some(443),
                "ws" | "http" => Some(80),
                _ => None,
            };
        }
        snapshot
    }

    /// Adds a header value.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.into());
        self
    }

    /// Sets the host and port.
    #[must_use]
    pub fn with_authority(mut self, host: impl Into<String>, port: Option<u16>) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    /// Sets the query string.
    #[must_use]
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// Returns the first value of a header.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers(name).first().map(String::as_str)
    }

    /// Returns all values of a header.
    #[must_use]
    pub fn headers(&self, name: &str) -> &[String] {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Iterates over all header names (lowercase) and their values.
    pub fn all_headers(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.headers
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    /// Returns the scheme (`ws` or `wss`).
    #[inline]
    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Returns the host.
    #[inline]
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port.
    #[inline]
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Returns the request path.
    #[inline]
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the query string without the leading `?`.
    #[inline]
    #[must_use]
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }
}

fn split_authority(authority: &str) -> (&str, Option<u16>) {
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.ends_with(']') || authority.starts_with('[') => {
            match port.parse() {
                Ok(port) => (host, Some(port)),
                Err(_) => (authority, None),
            }
        }
        _ => (authority, None),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_http_with_host_header() {
        let request = Request::builder()
            .uri("/chat/lobby?user=ann")
            .header("Host", "example.com:8080")
            .header("X-Token", "a")
            .header("x-token", "b")
            .body(())
            .unwrap();

        let snapshot = HandshakeRequest::from_http(&request, false);

        assert_eq!(snapshot.scheme(), "ws");
        assert_eq!(snapshot.host(), "example.com");
        assert_eq!(snapshot.port(), Some(8080));
        assert_eq!(snapshot.path(), "/chat/lobby");
        assert_eq!(snapshot.query(), Some("user=ann"));
        assert_eq!(snapshot.header("X-TOKEN"), Some("a"));
        assert_eq!(snapshot.headers("x-token"), ["a", "b"]);
    }

    #[test]
    fn test_from_http_absolute_uri() {
        let request = Request::builder()
            .uri("wss://example.org/feed")
            .body(())
            .unwrap();

        let snapshot = HandshakeRequest::from_http(&request, true);

        assert_eq!(snapshot.scheme(), "wss");
        assert_eq!(snapshot.host(), "example.org");
        assert_eq!(snapshot.port(), Some(443));
    }

    #[test]
    fn test_missing_header() {
        let snapshot = HandshakeRequest::new("/");
        assert_eq!(snapshot.header("authorization"), None);
        assert!(snapshot.headers("authorization").is_empty());
    }

    #[test]
    fn test_split_authority() {
        assert_eq!(split_authority("host:1"), ("host", Some(1)));
        assert_eq!(split_authority("host"), ("host", None));
        assert_eq!(split_authority("[::1]:9"), ("[::1]", Some(9)));
    }
}
