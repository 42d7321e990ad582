//! wsnext - WebSocket connection and endpoint execution core for tokio.
//!
//! This library manages the lifecycle of server and client WebSocket
//! connections and drives application callbacks on them.
//!
//! # Architecture
//!
//! - **Transport**: `tokio-tungstenite` streams split into reader and
//!   writer tasks, delivering frames to the engine
//! - **Engine**: one event loop per connection, invoking endpoint
//!   callbacks serially through a concurrency limiter
//! - **Registry**: every open connection is tracked per endpoint and can
//!   be enumerated or broadcast to
//!
//! Key design principles:
//!
//! - Each connection owns one event loop; callbacks never overlap unless
//!   a message kind is consumed as a stream
//! - Callback failures flow through `on_error` and then the configured
//!   [`UnhandledFailureStrategy`]
//! - The close callback runs exactly once, whoever closed the connection
//!
//! # Quick Start
//!
//! ```no_run
//! use std::net::{IpAddr, Ipv4Addr};
//!
//! use wsnext::{Connection, Endpoint, EndpointDefinition, Result, WebSockets};
//!
//! struct Chat;
//!
//! #[async_trait::async_trait]
//! impl Endpoint for Chat {
//!     async fn on_text_message(&self, connection: &Connection, text: String) -> Result<Option<String>> {
//!         connection.broadcast().send_text(text).await?;
//!         Ok(None)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let app = WebSockets::builder()
//!         .server_endpoint(EndpointDefinition::server("chat", "/chat/{room}", |_| Ok(Chat))?)
//!         .build()?;
//!
//!     let server = app.serve(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080).await?;
//!     println!("Listening on {}", server.ws_url());
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`app`] | Root composition: [`WebSockets`] and its builder |
//! | [`codec`] | Message codecs and the [`CodecRegistry`] |
//! | [`config`] | Deployment configuration |
//! | [`connection`] | [`Connection`], close reasons, handshake, broadcast |
//! | [`endpoint`] | [`Endpoint`] callbacks and [`EndpointDefinition`] |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`manager`] | Connection registry and listeners |
//! | [`runtime`] | Endpoint execution engine |
//! | [`telemetry`] | Per-endpoint counters |
//! | [`transport`] | WebSocket transport, server and client connector |

// ============================================================================
// Modules
// ============================================================================

/// Root composition.
pub mod app;

/// Message codecs.
///
/// Typed values are encoded to text or binary payloads through a
/// [`CodecRegistry`]; JSON is the fallback for text.
pub mod codec;

/// Deployment configuration.
pub mod config;

/// Connections and everything attached to them.
pub mod connection;

/// Endpoint callbacks and definitions.
pub mod endpoint;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers for connections and endpoints.
pub mod identifiers;

/// Connection registry.
pub mod manager;

/// Endpoint execution engine.
pub mod runtime;

/// Per-endpoint counters.
pub mod telemetry;

/// WebSocket transport layer.
pub mod transport;

#[cfg(test)]
mod testing;

// ============================================================================
// Re-exports
// ============================================================================

// Application types
pub use app::{WebSockets, WebSocketsBuilder};

// Codec types
pub use codec::{BinaryMessageCodec, CodecRegistry, JsonCodec, TextMessageCodec};

// Configuration types
pub use config::{EndpointsConfig, TrafficLoggingConfig, WebSocketsConfig};

// Connection types
pub use connection::{
    BroadcastSender, CloseReason, Connection, ConnectionKind, HandshakeRequest, IdentityProvider,
    PathParams, SecurityIdentity, TypedKey, UserData,
};

// Endpoint types
pub use endpoint::{CallbackModes, Consumption, Endpoint, EndpointDefinition, EndpointFactory, PathTemplate};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{ConnectionId, EndpointId};

// Registry types
pub use manager::{ConnectionEvent, ConnectionListener, ConnectionManager, OpenConnections};

// Runtime types
pub use runtime::{
    Callback, DispatchMode, InvocationContext, MessageStream, ScopeController, ScopeToken,
    UnhandledFailureStrategy,
};

// Telemetry types
pub use telemetry::{CountersSnapshot, Metrics};

// Transport types
pub use transport::{WebSocketConnector, WebSocketServer};
