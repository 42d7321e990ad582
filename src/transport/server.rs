//! WebSocket server for server endpoints.
//!
//! # Connection Flow
//!
//! 1. TCP connection accepted
//! 2. Request path routed to a server endpoint (404 if none matches)
//! 3. Upgrade completed with the configured maximum message size
//! 4. Handshake snapshot and path parameters handed to the engine

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, error, info, warn};

use crate::app::WebSockets;
use crate::config::EndpointsConfig;
use crate::connection::{CloseReason, ConnectionKind, HandshakeRequest, PathParams};
use crate::error::{Error, Result};
use crate::identifiers::EndpointId;

use super::WsTransport;

// ============================================================================
// Constants
// ============================================================================

/// Interval at which the accept loop checks the shutdown flag.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// Types
// ============================================================================

/// Routing outcome captured during the upgrade.
struct Routed {
    endpoint_id: EndpointId,
    handshake: HandshakeRequest,
    path_params: PathParams,
}

// ============================================================================
// WebSocketServer
// ============================================================================

/// A bound server accepting connections for the server endpoints.
///
/// # Example
///
/// ```ignore
/// let server = WebSocketServer::bind(app, IpAddr::V4(Ipv4Addr::LOCALHOST), 0).await?;
/// println!("{}", server.ws_url());
/// server.shutdown().await;
/// ```
pub struct WebSocketServer {
    app: WebSockets,
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
}

impl WebSocketServer {
    /// Binds the server and starts the accept loop.
    ///
    /// Use port 0 to let the OS assign a random available port.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if binding fails.
    pub async fn bind(app: WebSockets, ip: IpAddr, port: u16) -> Result<Self> {
        let listener = TcpListener::bind(SocketAddr::new(ip, port)).await?;
        let local_addr = listener.local_addr()?;
        let shutdown = Arc::new(AtomicBool::new(false));

        tokio::spawn(accept_loop(app.clone(), listener, Arc::clone(&shutdown)));

        info!(%local_addr, "WebSocket server bound");

        Ok(Self {
            app,
            local_addr,
            shutdown,
        })
    }

    /// Returns the port the server is bound to.
    #[inline]
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Returns the local socket address.
    #[inline]
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the base WebSocket URL, e.g. `ws://127.0.0.1:8080`.
    #[inline]
    #[must_use]
    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    /// Stops accepting and closes every open server connection.
    pub async fn shutdown(&self) {
        info!(local_addr = %self.local_addr, "WebSocket server shutting down");
        self.shutdown.store(true, Ordering::SeqCst);

        let connections = self.app.open_connections();
        let closes = connections
            .iter()
            .map(|connection| connection.close_with(CloseReason::GOING_AWAY));
        for result in join_all(closes).await {
            if let Err(e) = result {
                debug!(error = %e, "Close during shutdown failed");
            }
        }
    }
}

impl std::fmt::Debug for WebSocketServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketServer")
            .field("local_addr", &self.local_addr)
            .field("shutdown", &self.shutdown.load(Ordering::Relaxed))
            .finish()
    }
}

/// Builds the upgrade settings of one side.
pub(crate) fn ws_config(config: &EndpointsConfig) -> WebSocketConfig {
    let defaults = WebSocketConfig::default();
    match config.max_message_size {
        Some(limit) => defaults.max_message_size(Some(limit)).max_frame_size(Some(limit)),
        None => defaults,
    }
}

// ============================================================================
// Accept Loop
// ============================================================================

async fn accept_loop(app: WebSockets, listener: TcpListener, shutdown: Arc<AtomicBool>) {
    debug!("Accept loop started");

    loop {
        if shutdown.load(Ordering::SeqCst) {
            debug!("Accept loop shutting down");
            break;
        }

        // Accept with timeout to allow checking shutdown flag
        match timeout(ACCEPT_POLL_INTERVAL, listener.accept()).await {
            Ok(Ok((stream, addr))) => {
                let app = app.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(app, stream, addr).await {
                        warn!(error = %e, ?addr, "Connection handling failed");
                    }
                });
            }
            Ok(Err(e)) => {
                error!(error = %e, "Accept failed");
            }
            Err(_) => continue,
        }
    }

    debug!("Accept loop terminated");
}

async fn handle_connection(app: WebSockets, stream: TcpStream, addr: SocketAddr) -> Result<()> {
    debug!(?addr, "New TCP connection");

    let config = app.endpoints_config(ConnectionKind::Server);
    let inbound_buffer = config.inbound_buffer_size;
    let closing_timeout = config.closing_timeout();
    let mut routed = None;

    let callback = |request: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
        let path = request.uri().path();
        match app.route(path) {
            Some((definition, path_params)) => {
                routed = Some(Routed {
                    endpoint_id: definition.id().clone(),
                    handshake: HandshakeRequest::from_http(request, false),
                    path_params,
                });
                Ok(response)
            }
            None => {
                debug!(path, "No endpoint matches path");
                let mut rejection = ErrorResponse::new(Some("Not Found".to_string()));
                *rejection.status_mut() = StatusCode::NOT_FOUND;
                Err(rejection)
            }
        }
    };

    let ws_stream = tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config(config)))
        .await
        .map_err(|e| Error::connection(format!("WebSocket upgrade failed: {e}")))?;

    let Routed {
        endpoint_id,
        handshake,
        path_params,
    } = routed.ok_or_else(|| Error::protocol("Upgrade completed without a routed endpoint"))?;

    info!(?addr, endpoint = %endpoint_id, "WebSocket connection established");

    let parts = WsTransport::spawn(ws_stream, false, inbound_buffer, closing_timeout);
    app.open_server_connection(&endpoint_id, parts, handshake, path_params)
        .await?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::Ipv4Addr;

    use crate::endpoint::{Endpoint, EndpointDefinition};

    struct Silent;

    impl Endpoint for Silent {}

    async fn server() -> WebSocketServer {
        let app = WebSockets::builder()
            .server_endpoint(EndpointDefinition::server("silent", "/silent", |_| Ok(Silent)).unwrap())
            .build()
            .unwrap();
        WebSocketServer::bind(app, IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
            .await
            .expect("bind should succeed")
    }

    #[tokio::test]
    async fn test_server_bind_random_port() {
        let server = server().await;

        assert!(server.port() > 0);
        assert_eq!(server.ws_url(), format!("ws://127.0.0.1:{}", server.port()));
        assert_eq!(server.local_addr().ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[tokio::test]
    async fn test_unknown_path_rejected() {
        let server = server().await;

        let url = format!("{}/missing", server.ws_url());
        let result = tokio_tungstenite::connect_async(url).await;

        match result {
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status(), StatusCode::NOT_FOUND);
            }
            other => panic!("expected HTTP rejection, got {:?}", other.map(|_| ())),
        }
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_known_path_upgrades() {
        let server = server().await;

        let url = format!("{}/silent", server.ws_url());
        let (_stream, response) = tokio_tungstenite::connect_async(url).await.unwrap();

        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        server.shutdown().await;
    }

    #[test]
    fn test_ws_config_limit() {
        let config = ws_config(&EndpointsConfig::new().with_max_message_size(1024));
        assert_eq!(config.max_message_size, Some(1024));
    }
}
