//! Root composition.
//!
//! [`WebSockets`] ties endpoint definitions, configuration, registries and
//! collaborators together. It is cheap to clone and is the handle the
//! transport layer opens connections through.
//!
//! # Example
//!
//! ```no_run
//! use std::net::{IpAddr, Ipv4Addr};
//!
//! use wsnext::{Connection, Endpoint, EndpointDefinition, Result, WebSockets};
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl Endpoint for Echo {
//!     async fn on_text_message(&self, _: &Connection, text: String) -> Result<Option<String>> {
//!         Ok(Some(text))
//!     }
//! }
//!
//! # async fn example() -> Result<()> {
//! let app = WebSockets::builder()
//!     .server_endpoint(EndpointDefinition::server("echo", "/echo", |_| Ok(Echo))?)
//!     .build()?;
//!
//! let server = app.serve(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).await?;
//! println!("listening on {}", server.ws_url());
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, error, info};

use crate::codec::CodecRegistry;
use crate::config::{EndpointsConfig, WebSocketsConfig};
use crate::connection::{
    CloseReason, Connection, ConnectionKind, ConnectionSettings, HandshakeRequest,
    IdentityProvider, PathParams, TrafficLogger,
};
use crate::endpoint::EndpointDefinition;
use crate::error::{Error, Result};
use crate::identifiers::EndpointId;
use crate::manager::{ConnectionListener, ConnectionManager, OpenConnections};
use crate::runtime::driver::{Dispatcher, DispatcherParts};
use crate::runtime::failure;
use crate::runtime::{NoopScope, ScopeController};
use crate::telemetry::Metrics;
use crate::transport::{TransportParts, WebSocketConnector, WebSocketServer};

// ============================================================================
// WebSocketsBuilder
// ============================================================================

/// Builder for [`WebSockets`].
#[derive(Default)]
pub struct WebSocketsBuilder {
    config: WebSocketsConfig,
    server_endpoints: Vec<EndpointDefinition>,
    client_endpoints: Vec<EndpointDefinition>,
    codecs: Option<Arc<CodecRegistry>>,
    session_scope: Option<Arc<dyn ScopeController>>,
    request_scope: Option<Arc<dyn ScopeController>>,
    identity_provider: Option<Arc<dyn IdentityProvider>>,
    listeners: Vec<Arc<dyn ConnectionListener>>,
    client_listeners: Vec<Arc<dyn ConnectionListener>>,
}

impl WebSocketsBuilder {
    /// Sets the configuration.
    #[must_use]
    pub fn config(mut self, config: WebSocketsConfig) -> Self {
        self.config = config;
        self
    }

    /// Adds a server endpoint.
    #[must_use]
    pub fn server_endpoint(mut self, definition: EndpointDefinition) -> Self {
        self.server_endpoints.push(definition);
        self
    }

    /// Adds a client endpoint.
    #[must_use]
    pub fn client_endpoint(mut self, definition: EndpointDefinition) -> Self {
        self.client_endpoints.push(definition);
        self
    }

    /// Uses a shared codec registry instead of a fresh one.
    #[must_use]
    pub fn codec_registry(mut self, codecs: Arc<CodecRegistry>) -> Self {
        self.codecs = Some(codecs);
        self
    }

    /// Sets the session scope controller.
    #[must_use]
    pub fn session_scope(mut self, controller: Arc<dyn ScopeController>) -> Self {
        self.session_scope = Some(controller);
        self
    }

    /// Sets the request scope controller.
    #[must_use]
    pub fn request_scope(mut self, controller: Arc<dyn ScopeController>) -> Self {
        self.request_scope = Some(controller);
        self
    }

    /// Sets the provider resolving the identity of server connections.
    #[must_use]
    pub fn identity_provider(mut self, provider: Arc<dyn IdentityProvider>) -> Self {
        self.identity_provider = Some(provider);
        self
    }

    /// Adds a listener for server connections.
    #[must_use]
    pub fn listener(mut self, listener: Arc<dyn ConnectionListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Adds a listener for client connections.
    #[must_use]
    pub fn client_listener(mut self, listener: Arc<dyn ConnectionListener>) -> Self {
        self.client_listeners.push(listener);
        self
    }

    /// Validates the setup and builds the runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a setting is out of range, an endpoint
    /// is registered on the wrong side, two endpoints share an id, or two
    /// server endpoints share a path.
    pub fn build(self) -> Result<WebSockets> {
        self.config.validate()?;

        let mut ids = FxHashSet::default();
        let mut paths = FxHashSet::default();
        for definition in &self.server_endpoints {
            check_kind(definition, ConnectionKind::Server)?;
            check_unique_id(&mut ids, definition)?;
            if !paths.insert(definition.path().as_str().to_string()) {
                return Err(Error::config(format!(
                    "Duplicate server endpoint path: {}",
                    definition.path()
                )));
            }
        }
        for definition in &self.client_endpoints {
            check_kind(definition, ConnectionKind::Client)?;
            check_unique_id(&mut ids, definition)?;
        }

        let server_manager = Arc::new(ConnectionManager::new(ConnectionKind::Server));
        for listener in self.listeners {
            server_manager.add_listener(listener);
        }
        let client_manager = Arc::new(ConnectionManager::new(ConnectionKind::Client));
        for listener in self.client_listeners {
            client_manager.add_listener(listener);
        }

        let client_endpoints = self
            .client_endpoints
            .into_iter()
            .map(|definition| (definition.id().clone(), Arc::new(definition)))
            .collect();

        info!(
            server_endpoints = self.server_endpoints.len(),
            "WebSockets runtime built"
        );

        Ok(WebSockets {
            inner: Arc::new(Inner {
                server_config: Arc::new(self.config.server.clone()),
                client_config: Arc::new(self.config.client.clone()),
                config: self.config,
                server_endpoints: self.server_endpoints.into_iter().map(Arc::new).collect(),
                client_endpoints,
                server_manager,
                client_manager,
                codecs: self.codecs.unwrap_or_default(),
                metrics: Arc::new(Metrics::new()),
                session_scope: self.session_scope.unwrap_or_else(|| Arc::new(NoopScope)),
                request_scope: self.request_scope,
                identity_provider: self.identity_provider,
            }),
        })
    }
}

impl fmt::Debug for WebSocketsBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketsBuilder")
            .field("config", &self.config)
            .field("server_endpoints", &self.server_endpoints.len())
            .field("client_endpoints", &self.client_endpoints.len())
            .finish_non_exhaustive()
    }
}

fn check_kind(definition: &EndpointDefinition, expected: ConnectionKind) -> Result<()> {
    if definition.kind() == expected {
        Ok(())
    } else {
        Err(Error::config(format!(
            "Endpoint {} is a {:?} endpoint, registered as {expected:?}",
            definition.id(),
            definition.kind()
        )))
    }
}

fn check_unique_id(ids: &mut FxHashSet<EndpointId>, definition: &EndpointDefinition) -> Result<()> {
    if ids.insert(definition.id().clone()) {
        Ok(())
    } else {
        Err(Error::config(format!("Duplicate endpoint id: {}", definition.id())))
    }
}

// ============================================================================
// WebSockets
// ============================================================================

struct Inner {
    config: WebSocketsConfig,
    server_config: Arc<EndpointsConfig>,
    client_config: Arc<EndpointsConfig>,
    server_endpoints: Vec<Arc<EndpointDefinition>>,
    client_endpoints: FxHashMap<EndpointId, Arc<EndpointDefinition>>,
    server_manager: Arc<ConnectionManager>,
    client_manager: Arc<ConnectionManager>,
    codecs: Arc<CodecRegistry>,
    metrics: Arc<Metrics>,
    session_scope: Arc<dyn ScopeController>,
    request_scope: Option<Arc<dyn ScopeController>>,
    identity_provider: Option<Arc<dyn IdentityProvider>>,
}

/// The WebSocket runtime.
#[derive(Clone)]
pub struct WebSockets {
    inner: Arc<Inner>,
}

impl WebSockets {
    /// Creates a builder.
    #[inline]
    #[must_use]
    pub fn builder() -> WebSocketsBuilder {
        WebSocketsBuilder::default()
    }

    /// Binds a server for the server endpoints.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if binding fails.
    pub async fn serve(&self, ip: IpAddr, port: u16) -> Result<WebSocketServer> {
        WebSocketServer::bind(self.clone(), ip, port).await
    }

    /// Returns a connector for a client endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EndpointNotFound`] if no client endpoint has that id.
    pub fn connector(&self, endpoint_id: &EndpointId) -> Result<WebSocketConnector> {
        let definition = self.client_definition(endpoint_id)?;
        Ok(WebSocketConnector::new(self.clone(), definition))
    }

    /// Snapshot of the open server connections.
    #[must_use]
    pub fn open_connections(&self) -> OpenConnections {
        self.inner.server_manager.open_connections()
    }

    /// Snapshot of the open client connections.
    #[must_use]
    pub fn open_client_connections(&self) -> OpenConnections {
        self.inner.client_manager.open_connections()
    }

    /// Registry of server connections.
    #[inline]
    #[must_use]
    pub fn connection_manager(&self) -> &Arc<ConnectionManager> {
        &self.inner.server_manager
    }

    /// Registry of client connections.
    #[inline]
    #[must_use]
    pub fn client_connection_manager(&self) -> &Arc<ConnectionManager> {
        &self.inner.client_manager
    }

    /// Codec registry shared by every connection.
    #[inline]
    #[must_use]
    pub fn codecs(&self) -> &Arc<CodecRegistry> {
        &self.inner.codecs
    }

    /// Per-endpoint counters.
    #[inline]
    #[must_use]
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    /// Configuration the application was built with.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &WebSocketsConfig {
        &self.inner.config
    }

    /// Finds the server endpoint serving `path`.
    #[must_use]
    pub fn route(&self, path: &str) -> Option<(&EndpointDefinition, PathParams)> {
        self.inner.server_endpoints.iter().find_map(|definition| {
            definition
                .path()
                .matches(path)
                .map(|params| (definition.as_ref(), params))
        })
    }

    /// Opens a server connection over an established transport.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EndpointNotFound`] for an unknown endpoint, a
    /// security error if the identity provider rejects the handshake, or
    /// the error of the endpoint factory. The transport is closed in the
    /// latter two cases.
    pub async fn open_server_connection(
        &self,
        endpoint_id: &EndpointId,
        parts: TransportParts,
        handshake: HandshakeRequest,
        path_params: PathParams,
    ) -> Result<Connection> {
        let definition = self
            .inner
            .server_endpoints
            .iter()
            .find(|definition| definition.id() == endpoint_id)
            .cloned()
            .ok_or_else(|| Error::endpoint_not_found(endpoint_id.clone()))?;
        self.open_connection(definition, parts, handshake, path_params)
            .await
    }

    /// Opens a client connection over an established transport.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EndpointNotFound`] for an unknown endpoint or the
    /// error of the endpoint factory.
    pub async fn open_client_connection(
        &self,
        endpoint_id: &EndpointId,
        parts: TransportParts,
        handshake: HandshakeRequest,
        path_params: PathParams,
    ) -> Result<Connection> {
        let definition = self.client_definition(endpoint_id)?;
        self.open_connection(definition, parts, handshake, path_params)
            .await
    }

    /// Settings of one side.
    #[inline]
    #[must_use]
    pub(crate) fn endpoints_config(&self, kind: ConnectionKind) -> &Arc<EndpointsConfig> {
        match kind {
            ConnectionKind::Server => &self.inner.server_config,
            ConnectionKind::Client => &self.inner.client_config,
        }
    }

    fn client_definition(&self, endpoint_id: &EndpointId) -> Result<Arc<EndpointDefinition>> {
        self.inner
            .client_endpoints
            .get(endpoint_id)
            .cloned()
            .ok_or_else(|| Error::endpoint_not_found(endpoint_id.clone()))
    }

    async fn open_connection(
        &self,
        definition: Arc<EndpointDefinition>,
        parts: TransportParts,
        handshake: HandshakeRequest,
        path_params: PathParams,
    ) -> Result<Connection> {
        let kind = definition.kind();
        let config = Arc::clone(self.endpoints_config(kind));
        let manager = match kind {
            ConnectionKind::Server => &self.inner.server_manager,
            ConnectionKind::Client => &self.inner.client_manager,
        };
        let counters = config
            .metrics_enabled
            .then(|| self.inner.metrics.counters(kind, definition.id()));

        let TransportParts { transport, frames } = parts;
        let connection = Connection::new(ConnectionSettings {
            endpoint_id: definition.id().clone(),
            kind,
            transport,
            handshake,
            path_params,
            codecs: Arc::clone(&self.inner.codecs),
            manager: Arc::clone(manager),
            traffic: TrafficLogger::from_config(&config.traffic_logging),
            counters,
        });

        if kind == ConnectionKind::Server
            && let Some(provider) = &self.inner.identity_provider
        {
            match provider.identity(connection.handshake_request()).await {
                Ok(identity) => connection.update_security_identity(identity),
                Err(e) => {
                    failure::log_unhandled(&connection, &e);
                    let reason = failure::close_reason_for(&e, config.dev_mode);
                    if let Err(close_error) = connection.close_with(reason).await {
                        debug!(error = %close_error, "Close after rejected handshake failed");
                    }
                    return Err(e);
                }
            }
        }

        let endpoint = match definition.factory().create(&connection) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                error!(
                    endpoint = %definition.id(),
                    error = %e,
                    "Endpoint factory failed"
                );
                if let Err(close_error) = connection.close_with(CloseReason::INTERNAL_SERVER_ERROR).await {
                    debug!(error = %close_error, "Close after factory failure failed");
                }
                return Err(e);
            }
        };

        debug!(
            connection_id = %connection.id(),
            endpoint = %definition.id(),
            kind = ?kind,
            "Opening connection"
        );

        let inner = &self.inner;
        Dispatcher::start(
            DispatcherParts {
                connection: connection.clone(),
                endpoint,
                definition,
                config,
                session_scope: Arc::clone(&inner.session_scope),
                request_scope: inner.request_scope.clone(),
            },
            frames,
        );

        Ok(connection)
    }
}

impl fmt::Debug for WebSockets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSockets")
            .field("server_endpoints", &self.inner.server_endpoints.len())
            .field("client_endpoints", &self.inner.client_endpoints.len())
            .field("server_connections", &self.inner.server_manager.len())
            .field("client_connections", &self.inner.client_manager.len())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;

    use crate::connection::SecurityIdentity;
    use crate::endpoint::Endpoint;
    use crate::testing::{eventually, mock_transport, sent_texts};
    use crate::transport::InboundFrame;

    struct Echo;

    #[async_trait]
    impl Endpoint for Echo {
        async fn on_text_message(&self, connection: &Connection, text: String) -> Result<Option<String>> {
            let principal = connection
                .security_identity()
                .map(|identity| identity.principal().to_string())
                .unwrap_or_default();
            Ok(Some(format!("{principal}{text}")))
        }
    }

    struct HeaderIdentity;

    #[async_trait]
    impl IdentityProvider for HeaderIdentity {
        async fn identity(&self, handshake: &HandshakeRequest) -> Result<Option<SecurityIdentity>> {
            match handshake.header("authorization") {
                Some("ann") => Ok(Some(SecurityIdentity::new("ann"))),
                Some(_) => Err(Error::unauthorized("bad credentials")),
                None => Ok(None),
            }
        }
    }

    fn echo_server(id: &str, path: &str) -> EndpointDefinition {
        EndpointDefinition::server(id, path, |_| Ok(Echo)).unwrap()
    }

    fn app() -> WebSockets {
        WebSockets::builder()
            .config(WebSocketsConfig::new().with_server(EndpointsConfig::new().with_metrics()))
            .server_endpoint(echo_server("echo", "/echo"))
            .server_endpoint(echo_server("room", "/rooms/{room}"))
            .client_endpoint(EndpointDefinition::client("feed", "/feed", |_| Ok(Echo)).unwrap())
            .identity_provider(Arc::new(HeaderIdentity))
            .build()
            .unwrap()
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let result = WebSockets::builder()
            .server_endpoint(echo_server("echo", "/a"))
            .server_endpoint(echo_server("echo", "/b"))
            .build();
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    fn test_duplicate_paths_rejected() {
        let result = WebSockets::builder()
            .server_endpoint(echo_server("a", "/same"))
            .server_endpoint(echo_server("b", "/same/"))
            .build();
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    fn test_wrong_side_rejected() {
        let result = WebSockets::builder()
            .client_endpoint(echo_server("echo", "/echo"))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_route() {
        let app = app();

        let (definition, params) = app.route("/rooms/lobby").unwrap();
        assert_eq!(definition.id().as_str(), "room");
        assert_eq!(params.get("room").map(String::as_str), Some("lobby"));
        assert!(app.route("/nowhere").is_none());
    }

    #[test]
    fn test_unknown_connector() {
        let app = app();
        assert!(app.connector(&EndpointId::new("feed")).is_ok());
        assert!(matches!(
            app.connector(&EndpointId::new("echo")),
            Err(Error::EndpointNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_open_server_connection_with_identity() {
        let app = app();
        let (transport, parts) = mock_transport();
        let handshake = HandshakeRequest::new("/echo").with_header("Authorization", "ann");

        let connection = app
            .open_server_connection(&EndpointId::new("echo"), parts, handshake, PathParams::default())
            .await
            .unwrap();
        transport.deliver(InboundFrame::Text(":hi".into())).await;
        eventually(|| sent_texts(&transport) == ["ann:hi"]).await;

        assert_eq!(app.open_connections().len(), 1);
        assert!(app.open_connections().find_by_connection_id(connection.id()).is_some());

        let snapshot = app
            .metrics()
            .snapshot(ConnectionKind::Server, &EndpointId::new("echo"))
            .unwrap();
        assert_eq!(snapshot.connections_opened, 1);
        assert_eq!(snapshot.messages_received, 1);
        assert_eq!(snapshot.messages_sent, 1);
    }

    #[tokio::test]
    async fn test_rejected_identity_closes_with_policy_violation() {
        let app = app();
        let (transport, parts) = mock_transport();
        let handshake = HandshakeRequest::new("/echo").with_header("Authorization", "mallory");

        let result = app
            .open_server_connection(&EndpointId::new("echo"), parts, handshake, PathParams::default())
            .await;

        assert!(matches!(result, Err(Error::Unauthorized { .. })));
        assert_eq!(transport.closes(), [CloseReason::POLICY_VIOLATION]);
        assert!(app.open_connections().is_empty());
    }

    #[tokio::test]
    async fn test_factory_failure_closes_connection() {
        let app = WebSockets::builder()
            .server_endpoint(
                EndpointDefinition::server("broken", "/broken", |_| -> Result<Echo> {
                    Err(Error::callback("no instance"))
                })
                .unwrap(),
            )
            .build()
            .unwrap();
        let (transport, parts) = mock_transport();

        let result = app
            .open_server_connection(
                &EndpointId::new("broken"),
                parts,
                HandshakeRequest::new("/broken"),
                PathParams::default(),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(transport.closes(), [CloseReason::INTERNAL_SERVER_ERROR]);
    }

    #[tokio::test]
    async fn test_client_connection_registered_separately() {
        let app = app();
        let (transport, parts) = mock_transport();

        app.open_client_connection(
            &EndpointId::new("feed"),
            parts,
            HandshakeRequest::new("/feed"),
            PathParams::default(),
        )
        .await
        .unwrap();
        eventually(|| app.open_client_connections().len() == 1).await;

        assert!(app.open_connections().is_empty());
        transport.peer_close(None);
        eventually(|| app.open_client_connections().is_empty()).await;
    }
}
