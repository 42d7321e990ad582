//! The connection handle.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::codec::CodecRegistry;
use crate::connection::{
    BroadcastSender, CloseReason, HandshakeRequest, SecurityIdentity, TrafficLogger, UserData,
};
use crate::error::{Error, Result};
use crate::identifiers::{ConnectionId, EndpointId};
use crate::manager::ConnectionManager;
use crate::runtime::context;
use crate::telemetry::EndpointCounters;
use crate::transport::{OutboundFrame, Transport};

// ============================================================================
// Types
// ============================================================================

/// Path parameters extracted from the endpoint path template.
pub type PathParams = FxHashMap<String, String>;

/// Which side of the channel a connection represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionKind {
    /// Accepted by a server endpoint.
    Server,
    /// Opened by a client connector.
    Client,
}

/// Everything needed to construct a [`Connection`].
pub(crate) struct ConnectionSettings {
    pub endpoint_id: EndpointId,
    pub kind: ConnectionKind,
    pub transport: Arc<dyn Transport>,
    pub handshake: HandshakeRequest,
    pub path_params: PathParams,
    pub codecs: Arc<CodecRegistry>,
    pub manager: Arc<ConnectionManager>,
    pub traffic: Option<TrafficLogger>,
    pub counters: Option<Arc<EndpointCounters>>,
}

struct Inner {
    id: ConnectionId,
    endpoint_id: EndpointId,
    kind: ConnectionKind,
    created_at: SystemTime,
    transport: Arc<dyn Transport>,
    handshake: HandshakeRequest,
    path_params: PathParams,
    codecs: Arc<CodecRegistry>,
    manager: Arc<ConnectionManager>,
    traffic: Option<TrafficLogger>,
    counters: Option<Arc<EndpointCounters>>,
    user_data: UserData,
    close_requested: AtomicBool,
    requested_reason: Mutex<Option<CloseReason>>,
    close_reason: Mutex<Option<CloseReason>>,
    identity: RwLock<Option<SecurityIdentity>>,
    identity_changed: Notify,
}

// ============================================================================
// Connection
// ============================================================================

/// One live bidirectional channel between an endpoint and a peer.
///
/// Cheap to clone; clones refer to the same connection. Equality and
/// hashing use the [`ConnectionId`].
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    pub(crate) fn new(settings: ConnectionSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: ConnectionId::generate(),
                endpoint_id: settings.endpoint_id,
                kind: settings.kind,
                created_at: SystemTime::now(),
                transport: settings.transport,
                handshake: settings.handshake,
                path_params: settings.path_params,
                codecs: settings.codecs,
                manager: settings.manager,
                traffic: settings.traffic,
                counters: settings.counters,
                user_data: UserData::default(),
                close_requested: AtomicBool::new(false),
                requested_reason: Mutex::new(None),
                close_reason: Mutex::new(None),
                identity: RwLock::new(None),
                identity_changed: Notify::new(),
            }),
        }
    }

    /// Returns the connection owning the callback currently running.
    ///
    /// `None` outside a callback invocation.
    #[must_use]
    pub fn current() -> Option<Self> {
        context::current().map(|ctx| ctx.connection().clone())
    }
}

// ============================================================================
// Impl - Attributes
// ============================================================================

impl Connection {
    /// Returns the connection identifier.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Returns the identifier of the endpoint serving this connection.
    #[inline]
    #[must_use]
    pub fn endpoint_id(&self) -> &EndpointId {
        &self.inner.endpoint_id
    }

    /// Returns which side this connection represents.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> ConnectionKind {
        self.inner.kind
    }

    /// Returns when the connection was constructed.
    #[inline]
    #[must_use]
    pub fn created_at(&self) -> SystemTime {
        self.inner.created_at
    }

    /// Returns a path parameter by name.
    #[inline]
    #[must_use]
    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.inner.path_params.get(name).map(String::as_str)
    }

    /// Returns all path parameters.
    #[inline]
    #[must_use]
    pub fn path_params(&self) -> &PathParams {
        &self.inner.path_params
    }

    /// Returns the snapshot of the upgrade request.
    #[inline]
    #[must_use]
    pub fn handshake_request(&self) -> &HandshakeRequest {
        &self.inner.handshake
    }

    /// Returns the per-connection user data.
    #[inline]
    #[must_use]
    pub fn user_data(&self) -> &UserData {
        &self.inner.user_data
    }

    /// Returns the codec registry used by the `*_object` methods.
    #[inline]
    #[must_use]
    pub fn codecs(&self) -> &CodecRegistry {
        &self.inner.codecs
    }

    /// Returns `true` if the channel is encrypted.
    #[inline]
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.inner.transport.is_secure()
    }

    /// Returns `true` until the channel closes or starts closing.
    #[inline]
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.is_closed()
    }

    /// Returns `true` once the channel closed or started closing.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.transport.is_closed()
    }

    /// Returns the close reason, or `None` while the connection is open.
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.close_reason.lock().clone()
    }

    /// Returns a sender targeting every open connection of this endpoint.
    #[must_use]
    pub fn broadcast(&self) -> BroadcastSender {
        BroadcastSender::new(
            Arc::clone(&self.inner.manager),
            Arc::clone(&self.inner.codecs),
            self.inner.endpoint_id.clone(),
        )
    }
}

// ============================================================================
// Impl - Security
// ============================================================================

impl Connection {
    /// Returns the current security identity.
    #[must_use]
    pub fn security_identity(&self) -> Option<SecurityIdentity> {
        self.inner.identity.read().clone()
    }

    /// Replaces the security identity.
    ///
    /// The expiry of the new identity takes effect immediately.
    pub fn update_security_identity(&self, identity: Option<SecurityIdentity>) {
        *self.inner.identity.write() = identity;
        self.inner.identity_changed.notify_one();
    }

    pub(crate) fn identity_changed(&self) -> &Notify {
        &self.inner.identity_changed
    }
}

// ============================================================================
// Impl - Send
// ============================================================================

impl Connection {
    /// Sends a text message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the connection is closed.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send_frame(OutboundFrame::Text(text.into())).await
    }

    /// Sends a binary message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the connection is closed.
    pub async fn send_binary(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send_frame(OutboundFrame::Binary(data.into())).await
    }

    /// Sends a ping frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the connection is closed.
    pub async fn send_ping(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send_frame(OutboundFrame::Ping(data.into())).await
    }

    /// Sends an unsolicited pong frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the connection is closed.
    pub async fn send_pong(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send_frame(OutboundFrame::Pong(data.into())).await
    }

    /// Encodes `value` as text through the codec registry and sends it.
    ///
    /// The value is encoded before the returned future is first polled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TextEncode`] if encoding fails and
    /// [`Error::ConnectionClosed`] if the connection is closed.
    pub fn send_text_object<T>(&self, value: &T) -> impl Future<Output = Result<()>> + Send + '_
    where
        T: Serialize + 'static,
    {
        self.send_text_object_with(None, value)
    }

    /// Like [`send_text_object`](Self::send_text_object) with an optional
    /// pinned codec name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TextEncode`] if encoding fails and
    /// [`Error::ConnectionClosed`] if the connection is closed.
    pub fn send_text_object_with<T>(
        &self,
        codec: Option<&str>,
        value: &T,
    ) -> impl Future<Output = Result<()>> + Send + '_
    where
        T: Serialize + 'static,
    {
        let encoded = self.inner.codecs.encode_text_with(codec, value);
        async move { self.send_text(encoded?).await }
    }

    /// Encodes `value` as binary through the codec registry and sends it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BinaryEncode`] if encoding fails and
    /// [`Error::ConnectionClosed`] if the connection is closed.
    pub fn send_binary_object<T>(&self, value: &T) -> impl Future<Output = Result<()>> + Send + '_
    where
        T: Serialize + 'static,
    {
        let encoded = self.inner.codecs.encode_binary(value);
        async move { self.send_binary(encoded?).await }
    }

    /// Decodes a received text message through the codec registry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TextDecode`] if decoding fails.
    pub fn decode_text<T: DeserializeOwned + 'static>(&self, text: &str) -> Result<T> {
        self.inner.codecs.decode_text(text)
    }

    /// Decodes a received binary message through the codec registry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BinaryDecode`] if decoding fails.
    pub fn decode_binary<T: DeserializeOwned + 'static>(&self, data: &Bytes) -> Result<T> {
        self.inner.codecs.decode_binary(data)
    }

    async fn send_frame(&self, frame: OutboundFrame) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        if let Some(traffic) = &self.inner.traffic {
            match &frame {
                OutboundFrame::Text(text) => traffic.text_sent(self, text),
                OutboundFrame::Binary(data) => traffic.binary_sent(self, data.len()),
                OutboundFrame::Ping(_) | OutboundFrame::Pong(_) => {}
            }
        }
        if let Some(counters) = &self.inner.counters
            && frame.is_data()
        {
            counters.record_sent(frame.len());
        }

        trace!(connection_id = %self.inner.id, bytes = frame.len(), "Sending frame");
        self.inner.transport.send(frame).await
    }
}

// ============================================================================
// Impl - Close
// ============================================================================

impl Connection {
    /// Closes the connection with [`CloseReason::NORMAL`].
    ///
    /// # Errors
    ///
    /// Returns a transport error if the close frame cannot be written.
    pub async fn close(&self) -> Result<()> {
        self.close_with(CloseReason::NORMAL).await
    }

    /// Closes the connection with the given reason.
    ///
    /// Closing an already closed or closing connection succeeds without
    /// sending another close frame.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the close frame cannot be written.
    pub async fn close_with(&self, reason: CloseReason) -> Result<()> {
        if self.inner.close_requested.swap(true, Ordering::AcqRel) || self.is_closed() {
            debug!(connection_id = %self.inner.id, "Connection already closed");
            return Ok(());
        }

        *self.inner.requested_reason.lock() = Some(reason.clone());
        debug!(connection_id = %self.inner.id, reason = %reason, "Closing connection");

        match self.inner.transport.close(reason).await {
            Err(e) if e.is_closed_channel() => Ok(()),
            result => result,
        }
    }

    /// Records the final close reason once the transport reports closure.
    ///
    /// A reason requested locally wins over the peer's, and a missing
    /// reason means the channel dropped without a close frame.
    pub(crate) fn record_close(&self, reported: Option<CloseReason>) -> CloseReason {
        let mut slot = self.inner.close_reason.lock();
        if let Some(reason) = slot.as_ref() {
            return reason.clone();
        }
        let reason = self
            .inner
            .requested_reason
            .lock()
            .clone()
            .or(reported)
            .unwrap_or(CloseReason::ABNORMAL);
        *slot = Some(reason.clone());
        reason
    }

    pub(crate) fn traffic(&self) -> Option<&TrafficLogger> {
        self.inner.traffic.as_ref()
    }

    pub(crate) fn counters(&self) -> Option<&Arc<EndpointCounters>> {
        self.inner.counters.as_ref()
    }

    pub(crate) fn manager(&self) -> &Arc<ConnectionManager> {
        &self.inner.manager
    }
}

// ============================================================================
// Trait Implementations
// ============================================================================

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Connection {}

impl Hash for Connection {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("endpoint_id", &self.inner.endpoint_id)
            .field("kind", &self.inner.kind)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================
