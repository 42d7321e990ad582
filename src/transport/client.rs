//! Client connector for client endpoints.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tracing::{debug, info};
use url::Url;

use crate::app::WebSockets;
use crate::connection::{Connection, HandshakeRequest, PathParams};
use crate::endpoint::EndpointDefinition;
use crate::error::{Error, Result};

use super::WsTransport;
use super::server::ws_config;

// ============================================================================
// WebSocketConnector
// ============================================================================

/// Opens connections for one client endpoint.
///
/// # Example
///
/// ```ignore
/// let connection = app
///     .connector(&EndpointId::new("feed"))?
///     .base_uri("http://localhost:8080")
///     .path_param("room", "lobby")
///     .add_header("Authorization", "Bearer token")
///     .connect()
///     .await?;
/// ```
pub struct WebSocketConnector {
    app: WebSockets,
    definition: Arc<EndpointDefinition>,
    base_uri: Option<String>,
    path_params: PathParams,
    headers: Vec<(String, String)>,
}

impl WebSocketConnector {
    pub(crate) fn new(app: WebSockets, definition: Arc<EndpointDefinition>) -> Self {
        Self {
            app,
            definition,
            base_uri: None,
            path_params: PathParams::default(),
            headers: Vec::new(),
        }
    }

    /// Sets the server URI (`ws`, `wss`, `http` or `https`).
    #[must_use]
    pub fn base_uri(mut self, uri: impl Into<String>) -> Self {
        self.base_uri = Some(uri.into());
        self
    }

    /// Sets the value of a path parameter of the endpoint path.
    #[must_use]
    pub fn path_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.path_params.insert(name.into(), value.into());
        self
    }

    /// Adds a header to the upgrade request.
    #[must_use]
    pub fn add_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Returns the URL the connector would dial.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if no base URI is set, the URI is invalid
    /// or not WebSocket compatible, or a path parameter is missing.
    pub fn url(&self) -> Result<Url> {
        let base = self
            .base_uri
            .as_deref()
            .ok_or_else(|| Error::config(format!("No base URI set for {}", self.definition.id())))?;
        let mut url =
            Url::parse(base).map_err(|e| Error::config(format!("Invalid base URI {base}: {e}")))?;

        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => {
                return Err(Error::config(format!("Unsupported URI scheme: {other}")));
            }
        };
        url.set_scheme(scheme)
            .map_err(|()| Error::config(format!("Cannot use scheme {scheme} for {base}")))?;

        let path = self.definition.path().render(&self.path_params)?;
        let joined = format!("{}{}", url.path().trim_end_matches('/'), path);
        url.set_path(&joined);
        Ok(url)
    }

    /// Connects and opens the client connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an invalid target or header,
    /// [`Error::WebSocket`] if the connection or upgrade fails, or the
    /// error of the endpoint factory.
    pub async fn connect(self) -> Result<Connection> {
        let url = self.url()?;
        let secure = url.scheme() == "wss";

        let mut request = url.as_str().into_client_request()?;
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::config(format!("Invalid header name {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::config(format!("Invalid value for header {name}: {e}")))?;
            request.headers_mut().append(name, value);
        }
        let handshake = HandshakeRequest::from_http(&request, secure);

        debug!(%url, endpoint = %self.definition.id(), "Connecting");

        let config = self.app.endpoints_config(self.definition.kind());
        let inbound_buffer = config.inbound_buffer_size;
        let closing_timeout = config.closing_timeout();
        let (stream, _response) =
            tokio_tungstenite::connect_async_with_config(request, Some(ws_config(config)), false)
                .await?;

        info!(%url, endpoint = %self.definition.id(), "Client connection established");

        let parts = WsTransport::spawn(stream, secure, inbound_buffer, closing_timeout);
        self.app
            .open_client_connection(self.definition.id(), parts, handshake, self.path_params)
            .await
    }
}

impl std::fmt::Debug for WebSocketConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnector")
            .field("endpoint", self.definition.id())
            .field("base_uri", &self.base_uri)
            .field("path_params", &self.path_params)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::endpoint::Endpoint;
    use crate::identifiers::EndpointId;

    struct Silent;

    impl Endpoint for Silent {}

    fn connector() -> WebSocketConnector {
        let app = WebSockets::builder()
            .client_endpoint(
                EndpointDefinition::client("rooms", "/rooms/{room}", |_| Ok(Silent)).unwrap(),
            )
            .build()
            .unwrap();
        app.connector(&EndpointId::new("rooms")).unwrap()
    }

    #[test]
    fn test_url_maps_http_scheme_and_renders_path() {
        let url = connector()
            .base_uri("http://localhost:8080/api/")
            .path_param("room", "big hall")
            .url()
            .unwrap();

        assert_eq!(url.as_str(), "ws://localhost:8080/api/rooms/big%20hall");
    }

    #[test]
    fn test_url_keeps_secure_scheme() {
        let url = connector()
            .base_uri("https://example.com")
            .path_param("room", "a")
            .url()
            .unwrap();

        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/rooms/a");
    }

    #[test]
    fn test_url_errors() {
        assert!(connector().path_param("room", "a").url().is_err());
        assert!(connector().base_uri("ftp://x").path_param("room", "a").url().is_err());
        assert!(connector().base_uri("ws://x").url().is_err());
    }
}
