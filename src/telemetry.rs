//! Connection and message counters.
//!
//! Counters are kept per endpoint and per side when
//! [`EndpointsConfig::metrics_enabled`](crate::config::EndpointsConfig::metrics_enabled)
//! is set.
//!
//! | Counter | Incremented when |
//! |---------|------------------|
//! | `connections_opened` | A connection is registered |
//! | `connections_closed` | A connection is removed after its close callback |
//! | `errors` | A callback or transport failure is routed |
//! | `messages_received` / `bytes_received` | A text or binary message arrives |
//! | `messages_sent` / `bytes_sent` | A text or binary message is written |

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

use crate::connection::ConnectionKind;
use crate::identifiers::EndpointId;

// ============================================================================
// EndpointCounters
// ============================================================================

/// Live counters of one endpoint.
#[derive(Debug, Default)]
pub struct EndpointCounters {
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    errors: AtomicU64,
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
}

impl EndpointCounters {
    /// Reads all counters.
    #[must_use]
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`EndpointCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CountersSnapshot {
    /// Connections registered.
    pub connections_opened: u64,
    /// Connections closed.
    pub connections_closed: u64,
    /// Failures routed to the error path.
    pub errors: u64,
    /// Text and binary messages received.
    pub messages_received: u64,
    /// Text and binary messages sent.
    pub messages_sent: u64,
    /// Payload bytes received.
    pub bytes_received: u64,
    /// Payload bytes sent.
    pub bytes_sent: u64,
}

impl CountersSnapshot {
    /// Connections opened and not yet closed.
    #[inline]
    #[must_use]
    pub fn active_connections(&self) -> u64 {
        self.connections_opened
            .saturating_sub(self.connections_closed)
    }
}

// ============================================================================
// Metrics
// ============================================================================

/// Registry of counters for all endpoints.
#[derive(Debug, Default)]
pub struct Metrics {
    server: DashMap<EndpointId, Arc<EndpointCounters>>,
    client: DashMap<EndpointId, Arc<EndpointCounters>>,
}

impl Metrics {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the counters of an endpoint, creating them on first use.
    #[must_use]
    pub fn counters(&self, kind: ConnectionKind, endpoint_id: &EndpointId) -> Arc<EndpointCounters> {
        Arc::clone(
            self.side(kind)
                .entry(endpoint_id.clone())
                .or_default()
                .value(),
        )
    }

    /// Reads the counters of an endpoint, if any were recorded.
    #[must_use]
    pub fn snapshot(&self, kind: ConnectionKind, endpoint_id: &EndpointId) -> Option<CountersSnapshot> {
        self.side(kind)
            .get(endpoint_id)
            .map(|counters| counters.snapshot())
    }

    /// Reads the counters of every endpoint of one side.
    #[must_use]
    pub fn snapshots(&self, kind: ConnectionKind) -> Vec<(EndpointId, CountersSnapshot)> {
        self.side(kind)
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect()
    }

    fn side(&self, kind: ConnectionKind) -> &DashMap<EndpointId, Arc<EndpointCounters>> {
        match kind {
            ConnectionKind::Server => &self.server,
            ConnectionKind::Client => &self.client,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_shared_per_endpoint() {
        let metrics = Metrics::new();
        let id = EndpointId::new("echo");

        metrics.counters(ConnectionKind::Server, &id).record_opened();
        metrics.counters(ConnectionKind::Server, &id).record_received(5);

        let snapshot = metrics.snapshot(ConnectionKind::Server, &id).unwrap();
        assert_eq!(snapshot.connections_opened, 1);
        assert_eq!(snapshot.messages_received, 1);
        assert_eq!(snapshot.bytes_received, 5);
        assert_eq!(snapshot.active_connections(), 1);
    }

    #[test]
    fn test_sides_are_separate() {
        let metrics = Metrics::new();
        let id = EndpointId::new("echo");
        metrics.counters(ConnectionKind::Client, &id).record_sent(2);

        assert!(metrics.snapshot(ConnectionKind::Server, &id).is_none());
        assert_eq!(metrics.snapshots(ConnectionKind::Client).len(), 1);
    }
}
