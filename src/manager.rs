//! Registry of live connections.
//!
//! One [`ConnectionManager`] holds the server connections and another the
//! client connections. Connections are grouped by endpoint.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │            ConnectionManager              │
//! │  ┌─────────────────────────────────────┐  │
//! │  │ "chat" → { conn 1, conn 2, conn 3 } │  │
//! │  │ "feed" → { conn 4 }                 │  │
//! │  └─────────────────────────────────────┘  │
//! │   listeners ──► connection_added/removed   │
//! │   events    ──► broadcast::Receiver        │
//! └───────────────────────────────────────────┘
//! ```
//!
//! Membership changes are observed through [`ConnectionListener`]s and the
//! [`ConnectionEvent`] channel returned by [`ConnectionManager::subscribe`].
//! Both only fire on a real transition: adding a present connection or
//! removing an absent one is silent.
//!
//! Events reach subscribers asynchronously. Listeners are called inline by
//! whoever changes membership, which for engine-driven connections is the
//! connection's event loop, so a listener that blocks holds up that
//! connection. Long-running reactions belong on a spawned task or on the
//! event channel.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, error, trace};

use crate::connection::{Connection, ConnectionKind};
use crate::error::Result;
use crate::identifiers::{ConnectionId, EndpointId};

// ============================================================================
// Constants
// ============================================================================

/// Capacity of the lifecycle event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// Types
// ============================================================================

/// A registry membership change.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A connection was added.
    Opened(Connection),
    /// A connection was removed.
    Closed(Connection),
}

impl ConnectionEvent {
    /// Returns the connection the event refers to.
    #[inline]
    #[must_use]
    pub fn connection(&self) -> &Connection {
        match self {
            Self::Opened(connection) | Self::Closed(connection) => connection,
        }
    }
}

/// Observer of registry membership changes.
///
/// Called synchronously from [`ConnectionManager::add`] and
/// [`ConnectionManager::remove`] after the membership changed, in
/// registration order. Implementations must not block.
///
/// Errors and panics are logged and never affect the registry or other
/// listeners.
pub trait ConnectionListener: Send + Sync + 'static {
    /// Called after a connection was added.
    fn connection_added(&self, endpoint_id: &EndpointId, connection: &Connection) -> Result<()> {
        let _ = (endpoint_id, connection);
        Ok(())
    }

    /// Called after a connection was removed.
    fn connection_removed(&self, endpoint_id: &EndpointId, connection: &Connection) -> Result<()> {
        let _ = (endpoint_id, connection);
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Transition {
    Added,
    Removed,
}

// ============================================================================
// ConnectionManager
// ============================================================================

/// Live connections grouped by endpoint.
pub struct ConnectionManager {
    kind: ConnectionKind,
    endpoints: DashMap<EndpointId, DashSet<Connection>>,
    listeners: RwLock<Vec<Arc<dyn ConnectionListener>>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionManager {
    /// Creates an empty registry for one side.
    #[must_use]
    pub fn new(kind: ConnectionKind) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            kind,
            endpoints: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
            events,
        }
    }

    /// Returns the side this registry holds.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    /// Registers a listener.
    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.write().push(listener);
    }

    /// Subscribes to membership events.
    ///
    /// A slow subscriber misses events once more than the channel capacity
    /// is pending and sees [`broadcast::error::RecvError::Lagged`].
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }
}

// ============================================================================
// Impl - Membership
// ============================================================================

impl ConnectionManager {
    /// Adds a connection to its endpoint set.
    ///
    /// Returns `true` if the connection was not present.
    pub fn add(&self, endpoint_id: &EndpointId, connection: &Connection) -> bool {
        let inserted = self
            .endpoints
            .entry(endpoint_id.clone())
            .or_default()
            .insert(connection.clone());

        if inserted {
            debug!(
                connection_id = %connection.id(),
                endpoint = %endpoint_id,
                kind = ?self.kind,
                "Connection added"
            );
            let _ = self.events.send(ConnectionEvent::Opened(connection.clone()));
            self.notify(Transition::Added, endpoint_id, connection);
        } else {
            trace!(connection_id = %connection.id(), "Connection already registered");
        }
        inserted
    }

    /// Removes a connection from its endpoint set.
    ///
    /// Returns `true` if the connection was present.
    pub fn remove(&self, endpoint_id: &EndpointId, connection: &Connection) -> bool {
        let removed = self
            .endpoints
            .get(endpoint_id)
            .is_some_and(|set| set.remove(connection).is_some());

        if removed {
            debug!(
                connection_id = %connection.id(),
                endpoint = %endpoint_id,
                kind = ?self.kind,
                "Connection removed"
            );
            let _ = self.events.send(ConnectionEvent::Closed(connection.clone()));
            self.notify(Transition::Removed, endpoint_id, connection);
        }
        removed
    }

    fn notify(&self, transition: Transition, endpoint_id: &EndpointId, connection: &Connection) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            let outcome = catch_unwind(AssertUnwindSafe(|| match transition {
                Transition::Added => listener.connection_added(endpoint_id, connection),
                Transition::Removed => listener.connection_removed(endpoint_id, connection),
            }));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(connection_id = %connection.id(), error = %e, "Connection listener failed");
                }
                Err(_) => {
                    error!(connection_id = %connection.id(), "Connection listener panicked");
                }
            }
        }
    }
}

// ============================================================================
// Impl - Queries
// ============================================================================

impl ConnectionManager {
    /// Returns the connections of an endpoint, open or closing.
    ///
    /// Empty for an unknown endpoint.
    #[must_use]
    pub fn connections(&self, endpoint_id: &EndpointId) -> Vec<Connection> {
        self.endpoints
            .get(endpoint_id)
            .map(|set| set.iter().map(|c| c.key().clone()).collect())
            .unwrap_or_default()
    }

    /// Returns the open connections of an endpoint.
    #[must_use]
    pub fn open_connections_for(&self, endpoint_id: &EndpointId) -> Vec<Connection> {
        let mut connections = self.connections(endpoint_id);
        connections.retain(Connection::is_open);
        connections
    }

    /// Returns a snapshot of every open connection.
    #[must_use]
    pub fn open_connections(&self) -> OpenConnections {
        let connections = self
            .endpoints
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .iter()
                    .map(|c| c.key().clone())
                    .collect::<Vec<_>>()
            })
            .filter(Connection::is_open)
            .collect();
        OpenConnections { connections }
    }

    /// Finds a connection by identifier.
    #[must_use]
    pub fn find_by_connection_id(&self, id: ConnectionId) -> Option<Connection> {
        self.endpoints.iter().find_map(|entry| {
            entry
                .value()
                .iter()
                .find(|c| c.key().id() == id)
                .map(|c| c.key().clone())
        })
    }

    /// Returns the number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.endpoints.iter().map(|entry| entry.value().len()).sum()
    }

    /// Returns `true` if no connection is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("kind", &self.kind)
            .field("connections", &self.len())
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

// ============================================================================
// OpenConnections
// ============================================================================

/// Point-in-time snapshot of open connections.
#[derive(Debug, Clone, Default)]
pub struct OpenConnections {
    connections: Vec<Connection>,
}

impl OpenConnections {
    /// Iterates over the snapshot.
    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.iter()
    }

    /// Returns the connections of one endpoint.
    #[must_use]
    pub fn list_by_endpoint_id(&self, endpoint_id: &EndpointId) -> Vec<Connection> {
        self.connections
            .iter()
            .filter(|c| c.endpoint_id() == endpoint_id)
            .cloned()
            .collect()
    }

    /// Finds a connection by identifier.
    #[must_use]
    pub fn find_by_connection_id(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.iter().find(|c| c.id() == id)
    }

    /// Returns the number of connections.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Returns `true` if the snapshot is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl IntoIterator for OpenConnections {
    type Item = Connection;
    type IntoIter = std::vec::IntoIter<Connection>;

    fn into_iter(self) -> Self::IntoIter {
        self.connections.into_iter()
    }
}

impl<'a> IntoIterator for &'a OpenConnections {
    type Item = &'a Connection;
    type IntoIter = std::slice::Iter<'a, Connection>;

    fn into_iter(self) -> Self::IntoIter {
        self.connections.iter()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use proptest::prelude::*;

    use crate::error::Error;
    use crate::testing::TestConnection;

    #[derive(Default)]
    struct CountingListener {
        added: AtomicUsize,
        removed: AtomicUsize,
    }

    impl ConnectionListener for CountingListener {
        fn connection_added(&self, _: &EndpointId, _: &Connection) -> Result<()> {
            self.added.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn connection_removed(&self, _: &EndpointId, _: &Connection) -> Result<()> {
            self.removed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingListener;

    impl ConnectionListener for FailingListener {
        fn connection_added(&self, _: &EndpointId, _: &Connection) -> Result<()> {
            Err(Error::callback("listener refused"))
        }

        fn connection_removed(&self, _: &EndpointId, _: &Connection) -> Result<()> {
            panic!("listener exploded");
        }
    }

    #[test]
    fn test_add_remove_notify_once() {
        let t = TestConnection::new("chat");
        let listener = Arc::new(CountingListener::default());
        t.manager.add_listener(listener.clone());
        let id = EndpointId::new("chat");

        assert!(t.manager.add(&id, &t.connection));
        assert!(!t.manager.add(&id, &t.connection));
        assert!(t.manager.remove(&id, &t.connection));
        assert!(!t.manager.remove(&id, &t.connection));

        assert_eq!(listener.added.load(Ordering::SeqCst), 1);
        assert_eq!(listener.removed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_listener_does_not_stop_others() {
        let t = TestConnection::new("chat");
        let counting = Arc::new(CountingListener::default());
        t.manager.add_listener(Arc::new(FailingListener));
        t.manager.add_listener(counting.clone());
        let id = EndpointId::new("chat");

        assert!(t.manager.add(&id, &t.connection));
        assert!(t.manager.remove(&id, &t.connection));

        assert_eq!(counting.added.load(Ordering::SeqCst), 1);
        assert_eq!(counting.removed.load(Ordering::SeqCst), 1);
        assert!(t.manager.is_empty());
    }

    struct MembershipListener {
        manager: std::sync::Weak<ConnectionManager>,
        seen: parking_lot::Mutex<Vec<(&'static str, bool)>>,
    }

    impl MembershipListener {
        fn record(&self, event: &'static str, connection: &Connection) {
            let present = self
                .manager
                .upgrade()
                .is_some_and(|m| m.find_by_connection_id(connection.id()).is_some());
            self.seen.lock().push((event, present));
        }
    }

    impl ConnectionListener for MembershipListener {
        fn connection_added(&self, _: &EndpointId, connection: &Connection) -> Result<()> {
            self.record("added", connection);
            Ok(())
        }

        fn connection_removed(&self, _: &EndpointId, connection: &Connection) -> Result<()> {
            self.record("removed", connection);
            Ok(())
        }
    }

    #[test]
    fn test_listeners_run_inline_after_membership_change() {
        let t = TestConnection::new("chat");
        let listener = Arc::new(MembershipListener {
            manager: Arc::downgrade(&t.manager),
            seen: parking_lot::Mutex::new(Vec::new()),
        });
        t.manager.add_listener(listener.clone());
        let id = EndpointId::new("chat");

        t.manager.add(&id, &t.connection);
        assert_eq!(*listener.seen.lock(), [("added", true)]);

        t.manager.remove(&id, &t.connection);
        assert_eq!(*listener.seen.lock(), [("added", true), ("removed", false)]);
    }

    #[test]
    fn test_unknown_endpoint_is_empty() {
        let t = TestConnection::new("chat");
        assert!(t.manager.connections(&EndpointId::new("nope")).is_empty());
        assert!(!t.manager.remove(&EndpointId::new("nope"), &t.connection));
    }

    #[tokio::test]
    async fn test_open_connections_excludes_closed() {
        let a = TestConnection::new("chat");
        let b = TestConnection::with_manager("feed", a.manager.clone());
        a.register();
        b.register();

        b.connection.close().await.unwrap();
        let open = a.manager.open_connections();

        assert_eq!(open.len(), 1);
        assert!(open.find_by_connection_id(a.connection.id()).is_some());
        assert_eq!(open.list_by_endpoint_id(&EndpointId::new("chat")).len(), 1);
        assert!(open.list_by_endpoint_id(&EndpointId::new("feed")).is_empty());
        assert_eq!(a.manager.connections(&EndpointId::new("feed")).len(), 1);
    }

    #[test]
    fn test_find_by_connection_id() {
        let t = TestConnection::new("chat");
        t.register();
        assert_eq!(
            t.manager.find_by_connection_id(t.connection.id()),
            Some(t.connection.clone())
        );
        assert!(t.manager.find_by_connection_id(ConnectionId::generate()).is_none());
    }

    #[tokio::test]
    async fn test_events_follow_transitions() {
        let t = TestConnection::new("chat");
        let mut events = t.manager.subscribe();
        let id = EndpointId::new("chat");

        t.manager.add(&id, &t.connection);
        t.manager.add(&id, &t.connection);
        t.manager.remove(&id, &t.connection);

        assert!(matches!(events.recv().await.unwrap(), ConnectionEvent::Opened(_)));
        let closed = events.recv().await.unwrap();
        assert!(matches!(closed, ConnectionEvent::Closed(_)));
        assert_eq!(closed.connection(), &t.connection);
        assert!(events.try_recv().is_err());
    }

    proptest! {
        #[test]
        fn prop_membership_matches_model(ops in proptest::collection::vec((0usize..4, any::<bool>()), 0..64)) {
            let first = TestConnection::new("chat");
            let mut pool = vec![first.connection.clone()];
            for _ in 1..4 {
                pool.push(TestConnection::with_manager("chat", first.manager.clone()).connection);
            }
            let manager = first.manager.clone();
            let listener = Arc::new(CountingListener::default());
            manager.add_listener(listener.clone());
            let id = EndpointId::new("chat");

            let mut model = std::collections::HashSet::new();
            let mut transitions = (0usize, 0usize);
            for (index, add) in ops {
                let connection = &pool[index];
                if add {
                    let changed = manager.add(&id, connection);
                    prop_assert_eq!(changed, model.insert(index));
                    transitions.0 += usize::from(changed);
                } else {
                    let changed = manager.remove(&id, connection);
                    prop_assert_eq!(changed, model.remove(&index));
                    transitions.1 += usize::from(changed);
                }
            }

            prop_assert_eq!(manager.connections(&id).len(), model.len());
            prop_assert_eq!(listener.added.load(Ordering::SeqCst), transitions.0);
            prop_assert_eq!(listener.removed.load(Ordering::SeqCst), transitions.1);
        }
    }
}
