//! Transport layer.
//!
//! A transport is an established bidirectional message channel. The HTTP
//! upgrade that produced it is finished before the transport reaches this
//! crate; from here on only frames flow.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  InboundFrame (bounded mpsc)  ┌──────────────────────┐
//! │  Transport   │──────────────────────────────►│  Dispatcher (engine) │
//! │  reader task │                               │  one loop per conn   │
//! ├──────────────┤  OutboundFrame + ack          ├──────────────────────┤
//! │  writer task │◄──────────────────────────────│  Connection::send_*  │
//! └──────────────┘                               └──────────────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `client` | Client connector for client endpoints |
//! | `server` | TCP accept loop, upgrade and routing |
//! | `ws` | `tokio-tungstenite` backed [`Transport`] |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::connection::CloseReason;
use crate::error::{Error, Result};

// ============================================================================
// Submodules
// ============================================================================

/// Client connector.
pub mod client;

/// WebSocket server accept loop.
pub mod server;

/// WebSocket stream transport.
pub mod ws;

// ============================================================================
// Re-exports
// ============================================================================

pub use client::WebSocketConnector;
pub use server::WebSocketServer;
pub use ws::WsTransport;

// ============================================================================
// Frames
// ============================================================================

/// A frame written to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// Whole text message.
    Text(String),
    /// Whole binary message.
    Binary(Bytes),
    /// Ping control frame.
    Ping(Bytes),
    /// Pong control frame.
    Pong(Bytes),
}

impl OutboundFrame {
    /// Returns the payload size in bytes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(data) | Self::Ping(data) | Self::Pong(data) => data.len(),
        }
    }

    /// Returns `true` if the payload is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` for text and binary frames.
    #[inline]
    #[must_use]
    pub fn is_data(&self) -> bool {
        matches!(self, Self::Text(_) | Self::Binary(_))
    }
}

/// An event delivered by the transport.
pub enum InboundFrame {
    /// Whole text message.
    Text(String),
    /// Whole binary message.
    Binary(Bytes),
    /// Ping control frame.
    Ping(Bytes),
    /// Pong control frame.
    Pong(Bytes),
    /// The channel closed, with the peer's reason if one was reported.
    ///
    /// Always the last frame.
    Closed(Option<CloseReason>),
    /// Transport-level failure.
    Error(Error),
}

impl fmt::Debug for InboundFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.debug_tuple("Text").field(&text.len()).finish(),
            Self::Binary(data) => f.debug_tuple("Binary").field(&data.len()).finish(),
            Self::Ping(data) => f.debug_tuple("Ping").field(&data.len()).finish(),
            Self::Pong(data) => f.debug_tuple("Pong").field(&data.len()).finish(),
            Self::Closed(reason) => f.debug_tuple("Closed").field(reason).finish(),
            Self::Error(error) => f.debug_tuple("Error").field(error).finish(),
        }
    }
}

// ============================================================================
// Transport
// ============================================================================

/// The write side of an established message channel.
///
/// Implementations must be safe to call from any task. Inbound frames are
/// delivered separately through [`TransportParts::frames`].
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Writes one frame, completing when the write is acknowledged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the channel is closed, or a
    /// transport error if the write fails.
    async fn send(&self, frame: OutboundFrame) -> Result<()>;

    /// Sends a close frame with the given reason.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the close frame cannot be written.
    async fn close(&self, reason: CloseReason) -> Result<()>;

    /// Returns `true` once the channel is closed or closing.
    fn is_closed(&self) -> bool;

    /// Returns `true` if the channel is encrypted.
    fn is_secure(&self) -> bool;
}

/// A transport together with its inbound frame queue.
pub struct TransportParts {
    /// Write side.
    pub transport: Arc<dyn Transport>,
    /// Inbound frames, ending with [`InboundFrame::Closed`].
    pub frames: mpsc::Receiver<InboundFrame>,
}

impl fmt::Debug for TransportParts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportParts")
            .field("closed", &self.transport.is_closed())
            .field("secure", &self.transport.is_secure())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================
