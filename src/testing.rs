//! Test doubles shared by unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;

use crate::codec::CodecRegistry;
use crate::connection::{CloseReason, Connection, ConnectionKind, ConnectionSettings, HandshakeRequest};
use crate::error::{Error, Result};
use crate::identifiers::EndpointId;
use crate::manager::ConnectionManager;
use crate::runtime::{ScopeController, ScopeToken};
use crate::transport::{InboundFrame, OutboundFrame, Transport, TransportParts};

const EVENTUALLY_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// MockTransport
// ============================================================================

/// In-memory transport recording everything written to it.
///
/// A local close is answered by the simulated peer with the same reason.
pub(crate) struct MockTransport {
    sent: Mutex<Vec<OutboundFrame>>,
    closes: Mutex<Vec<CloseReason>>,
    closed: AtomicBool,
    fail_sends: AtomicBool,
    peer_gone: AtomicBool,
    peer: mpsc::Sender<InboundFrame>,
}

impl MockTransport {
    pub(crate) fn sent(&self) -> Vec<OutboundFrame> {
        self.sent.lock().clone()
    }

    pub(crate) fn closes(&self) -> Vec<CloseReason> {
        self.closes.lock().clone()
    }

    /// Makes every further send fail.
    pub(crate) fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }

    /// Makes every further send fail as if the peer vanished, while the
    /// transport still reports itself open.
    pub(crate) fn lose_peer(&self) {
        self.peer_gone.store(true, Ordering::SeqCst);
    }

    /// Delivers a frame as if read from the peer.
    pub(crate) async fn deliver(&self, frame: InboundFrame) {
        self.peer.send(frame).await.unwrap();
    }

    /// Simulates the peer closing, with `None` for an abrupt drop.
    pub(crate) fn peer_close(&self, reason: Option<CloseReason>) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.peer.try_send(InboundFrame::Closed(reason));
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, frame: OutboundFrame) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }
        if self.peer_gone.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::connection("injected send failure"));
        }
        self.sent.lock().push(frame);
        Ok(())
    }

    async fn close(&self, reason: CloseReason) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }
        self.closes.lock().push(reason.clone());
        let _ = self.peer.try_send(InboundFrame::Closed(Some(reason)));
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn is_secure(&self) -> bool {
        false
    }
}

pub(crate) fn mock_transport() -> (Arc<MockTransport>, TransportParts) {
    let (peer, frames) = mpsc::channel(64);
    let transport = Arc::new(MockTransport {
        sent: Mutex::new(Vec::new()),
        closes: Mutex::new(Vec::new()),
        closed: AtomicBool::new(false),
        fail_sends: AtomicBool::new(false),
        peer_gone: AtomicBool::new(false),
        peer,
    });
    let parts = TransportParts {
        transport: transport.clone(),
        frames,
    };
    (transport, parts)
}

pub(crate) fn sent_texts(transport: &MockTransport) -> Vec<String> {
    transport
        .sent()
        .into_iter()
        .filter_map(|frame| match frame {
            OutboundFrame::Text(text) => Some(text),
            _ => None,
        })
        .collect()
}

// ============================================================================
// TestConnection
// ============================================================================

/// A connection over a [`MockTransport`] with no dispatcher attached.
pub(crate) struct TestConnection {
    pub connection: Connection,
    pub transport: Arc<MockTransport>,
    pub manager: Arc<ConnectionManager>,
    _frames: mpsc::Receiver<InboundFrame>,
}

impl TestConnection {
    pub(crate) fn new(endpoint_id: &str) -> Self {
        Self::with_manager(endpoint_id, Arc::new(ConnectionManager::new(ConnectionKind::Server)))
    }

    pub(crate) fn with_manager(endpoint_id: &str, manager: Arc<ConnectionManager>) -> Self {
        let (transport, parts) = mock_transport();
        let connection = Connection::new(ConnectionSettings {
            endpoint_id: EndpointId::new(endpoint_id),
            kind: manager.kind(),
            transport: parts.transport,
            handshake: HandshakeRequest::new(format!("/{endpoint_id}")),
            path_params: FxHashMap::default(),
            codecs: Arc::new(CodecRegistry::new()),
            manager: Arc::clone(&manager),
            traffic: None,
            counters: None,
        });
        Self {
            connection,
            transport,
            manager,
            _frames: parts.frames,
        }
    }

    /// Adds the connection to its manager.
    pub(crate) fn register(&self) -> &Self {
        self.manager.add(self.connection.endpoint_id(), &self.connection);
        self
    }
}

// ============================================================================
// RecordingScope
// ============================================================================

/// Scope controller recording its lifecycle calls.
pub(crate) struct RecordingScope {
    name: &'static str,
    counter: AtomicU64,
    events: Mutex<Vec<String>>,
}

impl RecordingScope {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            counter: AtomicU64::new(0),
            events: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    fn record(&self, event: String) {
        self.events.lock().push(event);
    }
}

impl ScopeController for RecordingScope {
    fn capture_state(&self) -> ScopeToken {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.record(format!("capture {}#{n}", self.name));
        ScopeToken::new(n)
    }

    fn activate(&self, token: &ScopeToken) {
        let n = token.downcast_ref::<u64>().copied().unwrap_or_default();
        self.record(format!("activate {}#{n}", self.name));
    }

    fn deactivate(&self) {
        self.record(format!("deactivate {}", self.name));
    }

    fn terminate(&self, token: &ScopeToken) {
        let n = token.downcast_ref::<u64>().copied().unwrap_or_default();
        self.record(format!("terminate {}#{n}", self.name));
    }
}

// ============================================================================
// EventLog
// ============================================================================

/// Shared, ordered log of test events.
#[derive(Clone, Default)]
pub(crate) struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub(crate) fn push(&self, event: impl Into<String>) {
        self.0.lock().push(event.into());
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.0.lock().len()
    }
}

/// Polls `condition` until it holds, panicking after a timeout.
pub(crate) async fn eventually(mut condition: impl FnMut() -> bool) {
    let poll = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    if tokio::time::timeout(EVENTUALLY_TIMEOUT, poll).await.is_err() {
        panic!("condition not reached within {EVENTUALLY_TIMEOUT:?}");
    }
}
