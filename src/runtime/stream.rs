//! Message streams for stream-consuming callbacks.

// ============================================================================
// Imports
// ============================================================================

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;

// ============================================================================
// MessageStream
// ============================================================================

/// Inbound messages of one kind, in arrival order.
///
/// The stream ends when the connection closes. Dropping it discards
/// further messages of that kind.
#[derive(Debug)]
pub struct MessageStream<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> MessageStream<T> {
    /// Waits for the next message.
    pub async fn next_message(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

impl<T> Stream for MessageStream<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Creates a bounded stream and its sending side.
pub(crate) fn channel<T>(capacity: usize) -> (mpsc::Sender<T>, MessageStream<T>) {
    let (tx, rx) = mpsc::channel(capacity);
    (tx, MessageStream { rx })
}

// ============================================================================
// Tests
// ============================================================================
