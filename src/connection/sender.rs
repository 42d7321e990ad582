//! Broadcast to all open connections of an endpoint.
//!
//! Each send takes a fresh snapshot of the endpoint's open connections,
//! optionally narrowed with [`BroadcastSender::filter`], and writes to every
//! target independently. The returned future completes once every write
//! finished.
//!
//! | Outcome of a target | Effect on the result |
//! |---------------------|----------------------|
//! | Written | none |
//! | Connection closed meanwhile | ignored |
//! | Any other failure | counted in [`Error::Broadcast`] |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::join_all;
use serde::Serialize;
use tracing::{debug, trace};

use crate::codec::CodecRegistry;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::identifiers::EndpointId;
use crate::manager::ConnectionManager;

// ============================================================================
// Types
// ============================================================================

type Predicate = Arc<dyn Fn(&Connection) -> bool + Send + Sync>;

// ============================================================================
// BroadcastSender
// ============================================================================

/// Sends one message to many connections of the same endpoint.
#[derive(Clone)]
pub struct BroadcastSender {
    manager: Arc<ConnectionManager>,
    codecs: Arc<CodecRegistry>,
    endpoint_id: EndpointId,
    filter: Option<Predicate>,
}

impl BroadcastSender {
    pub(crate) fn new(
        manager: Arc<ConnectionManager>,
        codecs: Arc<CodecRegistry>,
        endpoint_id: EndpointId,
    ) -> Self {
        Self {
            manager,
            codecs,
            endpoint_id,
            filter: None,
        }
    }

    /// Restricts the targets to connections matching `predicate`.
    ///
    /// The predicate is evaluated against each send's snapshot.
    #[must_use]
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Connection) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(predicate));
        self
    }

    /// Returns the connections the next send would target.
    #[must_use]
    pub fn targets(&self) -> Vec<Connection> {
        let mut targets = self.manager.open_connections_for(&self.endpoint_id);
        if let Some(filter) = &self.filter {
            targets.retain(|connection| filter(connection));
        }
        targets
    }

    /// Sends a text message to every target.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Broadcast`] if any write failed for a reason other
    /// than the target being closed.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        self.send_each(|connection| {
            let text = text.clone();
            async move { connection.send_text(text).await }
        })
        .await
    }

    /// Sends a binary message to every target.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Broadcast`] if any write failed for a reason other
    /// than the target being closed.
    pub async fn send_binary(&self, data: impl Into<Bytes>) -> Result<()> {
        let data = data.into();
        self.send_each(|connection| {
            let data = data.clone();
            async move { connection.send_binary(data).await }
        })
        .await
    }

    /// Encodes `value` once and sends it as text to every target.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TextEncode`] if encoding fails, otherwise as
    /// [`send_text`](Self::send_text).
    pub async fn send_text_object<T>(&self, value: &T) -> Result<()>
    where
        T: Serialize + Sync + 'static,
    {
        let text = self.codecs.encode_text(value)?;
        self.send_text(text).await
    }

    /// Encodes `value` once and sends it as binary to every target.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BinaryEncode`] if encoding fails, otherwise as
    /// [`send_binary`](Self::send_binary).
    pub async fn send_binary_object<T>(&self, value: &T) -> Result<()>
    where
        T: Serialize + Sync + 'static,
    {
        let data = self.codecs.encode_binary(value)?;
        self.send_binary(data).await
    }

    /// Always fails: pings are not broadcast.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unsupported`].
    pub async fn send_ping(&self, _data: impl Into<Bytes>) -> Result<()> {
        Err(Error::unsupported("broadcast ping"))
    }

    /// Always fails: pongs are not broadcast.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unsupported`].
    pub async fn send_pong(&self, _data: impl Into<Bytes>) -> Result<()> {
        Err(Error::unsupported("broadcast pong"))
    }

    async fn send_each<F, Fut>(&self, send: F) -> Result<()>
    where
        F: Fn(Connection) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let targets = self.targets();
        if targets.is_empty() {
            trace!(endpoint = %self.endpoint_id, "Broadcast has no targets");
            return Ok(());
        }

        let total = targets.len();
        let ids: Vec<_> = targets.iter().map(Connection::id).collect();
        let results = join_all(targets.into_iter().map(send)).await;

        let mut failed = 0;
        let mut first = None;
        for (id, result) in ids.into_iter().zip(results) {
            match result {
                Ok(()) => {}
                Err(e) if e.is_closed_channel() => {
                    debug!(connection_id = %id, "Broadcast target closed meanwhile");
                }
                Err(e) => {
                    failed += 1;
                    first.get_or_insert((id, e));
                }
            }
        }

        match first {
            None => Ok(()),
            Some((connection_id, first)) => Err(Error::Broadcast {
                failed,
                total,
                connection_id,
                first: Box::new(first),
            }),
        }
    }
}

impl fmt::Debug for BroadcastSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastSender")
            .field("endpoint_id", &self.endpoint_id)
            .field("filtered", &self.filter.is_some())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestConnection, sent_texts};

    #[tokio::test]
    async fn test_broadcast_reaches_all_open_connections() {
        let a = TestConnection::new("chat");
        let b = TestConnection::with_manager("chat", a.manager.clone());
        let other = TestConnection::with_manager("news", a.manager.clone());
        a.register();
        b.register();
        other.register();

        a.connection.broadcast().send_text("hi").await.unwrap();

        assert_eq!(sent_texts(&a.transport), ["hi"]);
        assert_eq!(sent_texts(&b.transport), ["hi"]);
        assert!(other.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_filter() {
        let a = TestConnection::new("chat");
        let b = TestConnection::with_manager("chat", a.manager.clone());
        a.register();
        b.register();

        let skip = a.connection.id();
        a.connection
            .broadcast()
            .filter(move |c| c.id() != skip)
            .send_text("others")
            .await
            .unwrap();

        assert!(a.transport.sent().is_empty());
        assert_eq!(sent_texts(&b.transport), ["others"]);
    }

    #[tokio::test]
    async fn test_broadcast_without_targets_completes() {
        let a = TestConnection::new("chat");
        a.connection.broadcast().send_text("nobody").await.unwrap();
        assert!(a.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_aggregates_failures() {
        let a = TestConnection::new("chat");
        let b = TestConnection::with_manager("chat", a.manager.clone());
        a.register();
        b.register();
        b.transport.fail_sends();

        let err = a.connection.broadcast().send_text("x").await.unwrap_err();

        match err {
            Error::Broadcast {
                failed,
                total,
                connection_id,
                ..
            } => {
                assert_eq!(failed, 1);
                assert_eq!(total, 2);
                assert_eq!(connection_id, b.connection.id());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(sent_texts(&a.transport), ["x"]);
    }

    #[tokio::test]
    async fn test_broadcast_ignores_peer_lost_mid_send() {
        let a = TestConnection::new("chat");
        let b = TestConnection::with_manager("chat", a.manager.clone());
        let c = TestConnection::with_manager("chat", a.manager.clone());
        a.register();
        b.register();
        c.register();
        c.transport.lose_peer();
        assert!(c.connection.is_open());

        a.connection.broadcast().send_text("m").await.unwrap();

        assert_eq!(sent_texts(&a.transport), ["m"]);
        assert_eq!(sent_texts(&b.transport), ["m"]);
        assert!(c.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_ping_and_pong_unsupported() {
        let a = TestConnection::new("chat");
        let sender = a.connection.broadcast();
        assert!(matches!(
            sender.send_ping(Bytes::new()).await,
            Err(Error::Unsupported { .. })
        ));
        assert!(matches!(
            sender.send_pong(Bytes::new()).await,
            Err(Error::Unsupported { .. })
        ));
    }

    #[tokio::test]
    async fn test_send_text_object_encodes_once() {
        let a = TestConnection::new("chat");
        let b = TestConnection::with_manager("chat", a.manager.clone());
        a.register();
        b.register();

        a.connection
            .broadcast()
            .send_text_object(&serde_json::json!({ "n": 1 }))
            .await
            .unwrap();

        assert_eq!(sent_texts(&a.transport), [r#"{"n":1}"#]);
        assert_eq!(sent_texts(&b.transport), [r#"{"n":1}"#]);
    }
}
