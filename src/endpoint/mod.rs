//! Endpoints: application callbacks and their definitions.
//!
//! An [`Endpoint`] implements the callbacks of one logical endpoint. An
//! [`EndpointDefinition`] binds it to an identifier and a path and tells the
//! engine how to execute each callback.
//!
//! # Example
//!
//! ```
//! use wsnext::{Connection, DispatchMode, Endpoint, EndpointDefinition, Result};
//!
//! #[derive(Default)]
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl Endpoint for Echo {
//!     async fn on_text_message(&self, _: &Connection, text: String) -> Result<Option<String>> {
//!         Ok(Some(text))
//!     }
//! }
//!
//! let definition = EndpointDefinition::server("echo", "/echo", |_| Ok(Echo))?
//!     .on_text(DispatchMode::Worker);
//! assert_eq!(definition.path().as_str(), "/echo");
//! # Ok::<(), wsnext::Error>(())
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `path` | [`PathTemplate`] matching and rendering |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::connection::{CloseReason, Connection, ConnectionKind};
use crate::error::{Error, Result};
use crate::identifiers::EndpointId;
use crate::runtime::{Callback, DispatchMode, MessageStream};

// ============================================================================
// Submodules
// ============================================================================

/// Path templates.
pub mod path;

pub use path::PathTemplate;

// ============================================================================
// Endpoint
// ============================================================================

/// Callbacks of an endpoint instance.
///
/// One instance serves one connection. Every method has a no-op default;
/// whether a callback is invoked at all is decided by the definition's
/// [`CallbackModes`].
#[async_trait]
pub trait Endpoint: Send + Sync + 'static {
    /// The connection opened.
    async fn on_open(&self, connection: &Connection) -> Result<()> {
        let _ = connection;
        Ok(())
    }

    /// A text message arrived. A returned reply is sent back.
    async fn on_text_message(&self, connection: &Connection, text: String) -> Result<Option<String>> {
        let _ = (connection, text);
        Ok(None)
    }

    /// A binary message arrived. A returned reply is sent back.
    async fn on_binary_message(&self, connection: &Connection, data: Bytes) -> Result<Option<Bytes>> {
        let _ = (connection, data);
        Ok(None)
    }

    /// Consumes all text messages as a stream.
    ///
    /// Only invoked when the definition selects text stream consumption.
    async fn on_text_stream(&self, connection: &Connection, messages: MessageStream<String>) -> Result<()> {
        let _ = (connection, messages);
        Ok(())
    }

    /// Consumes all binary messages as a stream.
    ///
    /// Only invoked when the definition selects binary stream consumption.
    async fn on_binary_stream(&self, connection: &Connection, messages: MessageStream<Bytes>) -> Result<()> {
        let _ = (connection, messages);
        Ok(())
    }

    /// A ping frame arrived. The pong reply is sent by the transport.
    async fn on_ping_message(&self, connection: &Connection, data: Bytes) -> Result<()> {
        let _ = (connection, data);
        Ok(())
    }

    /// A pong frame arrived.
    async fn on_pong_message(&self, connection: &Connection, data: Bytes) -> Result<()> {
        let _ = (connection, data);
        Ok(())
    }

    /// The connection closed.
    async fn on_close(&self, connection: &Connection, reason: &CloseReason) -> Result<()> {
        let _ = (connection, reason);
        Ok(())
    }

    /// A callback or the transport failed.
    ///
    /// Returning an error passes it to the unhandled failure strategy.
    async fn on_error(&self, connection: &Connection, error: Error) -> Result<()> {
        let _ = connection;
        Err(error)
    }
}

// ============================================================================
// EndpointFactory
// ============================================================================

/// Creates the endpoint instance of a new connection.
pub trait EndpointFactory: Send + Sync + 'static {
    /// Creates an instance for `connection`.
    ///
    /// # Errors
    ///
    /// A failure rejects the connection.
    fn create(&self, connection: &Connection) -> Result<Arc<dyn Endpoint>>;
}

struct FnFactory<F, E> {
    f: F,
    _marker: PhantomData<fn() -> E>,
}

impl<F, E> EndpointFactory for FnFactory<F, E>
where
    F: Fn(&Connection) -> Result<E> + Send + Sync + 'static,
    E: Endpoint,
{
    fn create(&self, connection: &Connection) -> Result<Arc<dyn Endpoint>> {
        Ok(Arc::new((self.f)(connection)?))
    }
}

// ============================================================================
// CallbackModes
// ============================================================================

/// Dispatch mode of every callback.
///
/// Defaults: message, open and close callbacks run inline; ping, pong and
/// error callbacks are disabled until selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackModes {
    /// `on_open`.
    pub on_open: DispatchMode,
    /// `on_text_message` or `on_text_stream`.
    pub on_text: DispatchMode,
    /// `on_binary_message` or `on_binary_stream`.
    pub on_binary: DispatchMode,
    /// `on_ping_message`.
    pub on_ping: DispatchMode,
    /// `on_pong_message`.
    pub on_pong: DispatchMode,
    /// `on_close`.
    pub on_close: DispatchMode,
    /// `on_error`.
    pub on_error: DispatchMode,
}

impl CallbackModes {
    /// Creates the default modes.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            on_open: DispatchMode::Inline,
            on_text: DispatchMode::Inline,
            on_binary: DispatchMode::Inline,
            on_ping: DispatchMode::Disabled,
            on_pong: DispatchMode::Disabled,
            on_close: DispatchMode::Inline,
            on_error: DispatchMode::Disabled,
        }
    }

    /// Returns the mode of `callback`.
    #[must_use]
    pub const fn mode(&self, callback: Callback) -> DispatchMode {
        match callback {
            Callback::Open => self.on_open,
            Callback::TextMessage => self.on_text,
            Callback::BinaryMessage => self.on_binary,
            Callback::PingMessage => self.on_ping,
            Callback::PongMessage => self.on_pong,
            Callback::Close => self.on_close,
            Callback::Error => self.on_error,
        }
    }
}

impl Default for CallbackModes {
    fn default() -> Self {
        Self::new()
    }
}

/// How text or binary messages are delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Consumption {
    /// One callback invocation per message.
    #[default]
    PerMessage,
    /// One stream for the lifetime of the connection.
    Stream,
}

// ============================================================================
// EndpointDefinition
// ============================================================================

/// Identifier, path, factory and execution settings of an endpoint.
#[derive(Clone)]
pub struct EndpointDefinition {
    id: EndpointId,
    kind: ConnectionKind,
    path: PathTemplate,
    factory: Arc<dyn EndpointFactory>,
    callbacks: CallbackModes,
    text: Consumption,
    binary: Consumption,
    request_scope: Option<bool>,
}

impl EndpointDefinition {
    /// Defines a server endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `path` is not a valid template.
    pub fn server<F, E>(id: impl Into<EndpointId>, path: &str, factory: F) -> Result<Self>
    where
        F: Fn(&Connection) -> Result<E> + Send + Sync + 'static,
        E: Endpoint,
    {
        Self::with_factory(ConnectionKind::Server, id, path, Self::wrap(factory))
    }

    /// Defines a client endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `path` is not a valid template.
    pub fn client<F, E>(id: impl Into<EndpointId>, path: &str, factory: F) -> Result<Self>
    where
        F: Fn(&Connection) -> Result<E> + Send + Sync + 'static,
        E: Endpoint,
    {
        Self::with_factory(ConnectionKind::Client, id, path, Self::wrap(factory))
    }

    /// Defines an endpoint with a custom factory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `path` is not a valid template.
    pub fn with_factory(
        kind: ConnectionKind,
        id: impl Into<EndpointId>,
        path: &str,
        factory: Arc<dyn EndpointFactory>,
    ) -> Result<Self> {
        Ok(Self {
            id: id.into(),
            kind,
            path: PathTemplate::parse(path)?,
            factory,
            callbacks: CallbackModes::new(),
            text: Consumption::PerMessage,
            binary: Consumption::PerMessage,
            request_scope: None,
        })
    }

    fn wrap<F, E>(factory: F) -> Arc<dyn EndpointFactory>
    where
        F: Fn(&Connection) -> Result<E> + Send + Sync + 'static,
        E: Endpoint,
    {
        Arc::new(FnFactory {
            f: factory,
            _marker: PhantomData,
        })
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl EndpointDefinition {
    /// Sets the mode of `on_open`.
    #[must_use]
    pub fn on_open(mut self, mode: DispatchMode) -> Self {
        self.callbacks.on_open = mode;
        self
    }

    /// Sets the mode of the text callback.
    #[must_use]
    pub fn on_text(mut self, mode: DispatchMode) -> Self {
        self.callbacks.on_text = mode;
        self
    }

    /// Sets the mode of the binary callback.
    #[must_use]
    pub fn on_binary(mut self, mode: DispatchMode) -> Self {
        self.callbacks.on_binary = mode;
        self
    }

    /// Sets the mode of `on_ping_message`.
    #[must_use]
    pub fn on_ping(mut self, mode: DispatchMode) -> Self {
        self.callbacks.on_ping = mode;
        self
    }

    /// Sets the mode of `on_pong_message`.
    #[must_use]
    pub fn on_pong(mut self, mode: DispatchMode) -> Self {
        self.callbacks.on_pong = mode;
        self
    }

    /// Sets the mode of `on_close`.
    #[must_use]
    pub fn on_close(mut self, mode: DispatchMode) -> Self {
        self.callbacks.on_close = mode;
        self
    }

    /// Sets the mode of `on_error`.
    #[must_use]
    pub fn on_error(mut self, mode: DispatchMode) -> Self {
        self.callbacks.on_error = mode;
        self
    }

    /// Delivers text messages through `on_text_stream`.
    #[must_use]
    pub fn text_stream(mut self) -> Self {
        self.text = Consumption::Stream;
        self
    }

    /// Delivers binary messages through `on_binary_stream`.
    #[must_use]
    pub fn binary_stream(mut self) -> Self {
        self.binary = Consumption::Stream;
        self
    }

    /// Overrides the configured request scope activation.
    #[must_use]
    pub fn request_scope(mut self, activate: bool) -> Self {
        self.request_scope = Some(activate);
        self
    }
}

// ============================================================================
// Impl - Accessors
// ============================================================================

impl EndpointDefinition {
    /// Returns the endpoint identifier.
    #[inline]
    #[must_use]
    pub fn id(&self) -> &EndpointId {
        &self.id
    }

    /// Returns the side the endpoint serves.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    /// Returns the path template.
    #[inline]
    #[must_use]
    pub fn path(&self) -> &PathTemplate {
        &self.path
    }

    /// Returns the callback modes.
    #[inline]
    #[must_use]
    pub fn callbacks(&self) -> &CallbackModes {
        &self.callbacks
    }

    /// Returns how text messages are delivered.
    #[inline]
    #[must_use]
    pub fn text_consumption(&self) -> Consumption {
        self.text
    }

    /// Returns how binary messages are delivered.
    #[inline]
    #[must_use]
    pub fn binary_consumption(&self) -> Consumption {
        self.binary
    }

    /// Returns `true` if any message kind is consumed as a stream.
    ///
    /// Such endpoints run without the concurrency limiter.
    #[inline]
    #[must_use]
    pub fn consumes_streams(&self) -> bool {
        self.text == Consumption::Stream || self.binary == Consumption::Stream
    }

    /// Returns whether the request scope is activated, given the configured
    /// default.
    #[inline]
    #[must_use]
    pub fn activates_request_scope(&self, configured: bool) -> bool {
        self.request_scope.unwrap_or(configured)
    }

    pub(crate) fn factory(&self) -> &dyn EndpointFactory {
        self.factory.as_ref()
    }
}

impl fmt::Debug for EndpointDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointDefinition")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("path", &self.path)
            .field("callbacks", &self.callbacks)
            .field("text", &self.text)
            .field("binary", &self.binary)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestConnection;

    struct Silent;

    impl Endpoint for Silent {}

    #[test]
    fn test_default_modes() {
        let modes = CallbackModes::default();
        assert_eq!(modes.mode(Callback::Open), DispatchMode::Inline);
        assert_eq!(modes.mode(Callback::TextMessage), DispatchMode::Inline);
        assert_eq!(modes.mode(Callback::PingMessage), DispatchMode::Disabled);
        assert_eq!(modes.mode(Callback::Error), DispatchMode::Disabled);
    }

    #[test]
    fn test_builder() {
        let definition = EndpointDefinition::server("chat", "/chat/{room}", |_| Ok(Silent))
            .unwrap()
            .on_text(DispatchMode::Worker)
            .on_error(DispatchMode::Inline)
            .binary_stream()
            .request_scope(true);

        assert_eq!(definition.id().as_str(), "chat");
        assert_eq!(definition.kind(), ConnectionKind::Server);
        assert_eq!(definition.callbacks().on_text, DispatchMode::Worker);
        assert_eq!(definition.callbacks().on_error, DispatchMode::Inline);
        assert_eq!(definition.binary_consumption(), Consumption::Stream);
        assert_eq!(definition.text_consumption(), Consumption::PerMessage);
        assert!(definition.consumes_streams());
        assert!(definition.activates_request_scope(false));
    }

    #[test]
    fn test_invalid_path_rejected() {
        assert!(EndpointDefinition::client("c", "nope", |_| Ok(Silent)).is_err());
    }

    #[tokio::test]
    async fn test_factory_creates_instance_per_call() {
        let definition = EndpointDefinition::server("echo", "/echo", |_| Ok(Silent)).unwrap();
        let t = TestConnection::new("echo");

        let a = definition.factory().create(&t.connection).unwrap();
        let b = definition.factory().create(&t.connection).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_default_on_error_rethrows() {
        let t = TestConnection::new("echo");
        let err = Silent
            .on_error(&t.connection, Error::callback("boom"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
