//! WebSocket stream transport.
//!
//! Wraps an upgraded [`WebSocketStream`] into a [`Transport`]. Two tasks
//! are spawned per stream:
//!
//! - **Reader**: decodes incoming messages into [`InboundFrame`]s. It
//!   waits when the inbound queue is full, which stops reading from the
//!   socket.
//! - **Writer**: executes send and close commands, acknowledging each one
//!   once the frame is flushed. It stops after the close frame.
//!
//! Once a close frame has been sent or received, the peer has the closing
//! timeout to finish the handshake. After that the reader gives up, the
//! socket is dropped and the connection is reported closed.

// ============================================================================
// Imports
// ============================================================================

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Sleep, sleep, timeout};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tracing::{debug, trace, warn};

use crate::connection::CloseReason;
use crate::error::{Error, Result};

use super::{InboundFrame, OutboundFrame, Transport, TransportParts};

// ============================================================================
// Types
// ============================================================================

/// Commands executed by the writer task.
enum TransportCommand {
    Send {
        frame: OutboundFrame,
        ack: oneshot::Sender<Result<()>>,
    },
    Close {
        reason: CloseReason,
        ack: oneshot::Sender<Result<()>>,
    },
}

// ============================================================================
// WsTransport
// ============================================================================

/// [`Transport`] over a `tokio-tungstenite` stream.
pub struct WsTransport {
    command_tx: mpsc::UnboundedSender<TransportCommand>,
    closed: Arc<AtomicBool>,
    secure: bool,
}

impl WsTransport {
    /// Spawns the reader and writer tasks of an upgraded stream.
    ///
    /// `inbound_buffer` bounds the number of decoded frames waiting for the
    /// dispatcher. `closing_timeout` bounds the wait for the peer once a
    /// close frame is on the wire.
    pub fn spawn<S>(
        stream: WebSocketStream<S>,
        secure: bool,
        inbound_buffer: usize,
        closing_timeout: Duration,
    ) -> TransportParts
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (frames_tx, frames) = mpsc::channel(inbound_buffer.max(1));
        let (closing_tx, closing_rx) = oneshot::channel();
        let closed = Arc::new(AtomicBool::new(false));
        let (ws_write, ws_read) = stream.split();

        tokio::spawn(run_writer(
            ws_write,
            command_rx,
            Arc::clone(&closed),
            closing_tx,
            closing_timeout,
        ));
        tokio::spawn(run_reader(
            ws_read,
            frames_tx,
            ReaderLink {
                closed: Arc::clone(&closed),
                commands: command_tx.downgrade(),
                closing: Some(closing_rx),
                closing_timeout,
            },
        ));

        let transport = Self {
            command_tx,
            closed,
            secure,
        };
        TransportParts {
            transport: Arc::new(transport),
            frames,
        }
    }

    async fn request(&self, command: TransportCommand, rx: oneshot::Receiver<Result<()>>) -> Result<()> {
        self.command_tx
            .send(command)
            .map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&self, frame: OutboundFrame) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let (ack, rx) = oneshot::channel();
        self.request(TransportCommand::Send { frame, ack }, rx).await
    }

    async fn close(&self, reason: CloseReason) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let (ack, rx) = oneshot::channel();
        self.request(TransportCommand::Close { reason, ack }, rx).await
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn is_secure(&self) -> bool {
        self.secure
    }
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport")
            .field("closed", &self.is_closed())
            .field("secure", &self.secure)
            .finish()
    }
}

// ============================================================================
// Tasks
// ============================================================================

async fn run_writer<S>(
    mut ws_write: SplitSink<WebSocketStream<S>, Message>,
    mut command_rx: mpsc::UnboundedReceiver<TransportCommand>,
    closed: Arc<AtomicBool>,
    closing_tx: oneshot::Sender<()>,
    closing_timeout: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    while let Some(command) = command_rx.recv().await {
        match command {
            TransportCommand::Send { frame, ack } => {
                if closed.load(Ordering::Acquire) {
                    let _ = ack.send(Err(Error::ConnectionClosed));
                    continue;
                }
                let result = ws_write.send(to_message(frame)).await.map_err(Error::from);
                if let Err(e) = &result {
                    trace!(error = %e, "WebSocket write failed");
                }
                let _ = ack.send(result);
            }
            TransportCommand::Close { reason, ack } => {
                if closed.load(Ordering::Acquire) {
                    let _ = ack.send(Err(Error::ConnectionClosed));
                    break;
                }
                let _ = closing_tx.send(());

                debug!(reason = %reason, "Sending close frame");
                let frame = CloseFrame {
                    code: reason.code().into(),
                    reason: reason.message().unwrap_or_default().to_string().into(),
                };
                let result = match timeout(closing_timeout, ws_write.send(Message::Close(Some(frame)))).await {
                    Ok(sent) => sent.map_err(Error::from),
                    Err(_) => Err(Error::connection("Timed out writing close frame")),
                };
                closed.store(true, Ordering::Release);
                let _ = ack.send(result);
                break;
            }
        }
    }
    trace!("WebSocket writer terminated");
}

/// Shared state the reader needs besides the stream and the frame queue.
struct ReaderLink {
    closed: Arc<AtomicBool>,
    commands: mpsc::WeakUnboundedSender<TransportCommand>,
    closing: Option<oneshot::Receiver<()>>,
    closing_timeout: Duration,
}

async fn run_reader<S>(
    mut ws_read: SplitStream<WebSocketStream<S>>,
    frames_tx: mpsc::Sender<InboundFrame>,
    mut link: ReaderLink,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut deadline: Option<Pin<Box<Sleep>>> = None;
    let mut peer_reason = None;

    let reported = loop {
        let next = tokio::select! {
            next = ws_read.next() => next,
            started = closing_started(&mut link.closing) => {
                link.closing = None;
                if started {
                    deadline.get_or_insert_with(|| Box::pin(sleep(link.closing_timeout)));
                }
                continue;
            }
            () = expired(&mut deadline) => {
                debug!(timeout = ?link.closing_timeout, "Closing handshake timed out");
                break peer_reason.take();
            }
        };

        let frame = match next {
            Some(Ok(Message::Text(text))) => InboundFrame::Text(text.to_string()),
            Some(Ok(Message::Binary(data))) => InboundFrame::Binary(data),
            Some(Ok(Message::Ping(data))) => InboundFrame::Ping(data),
            Some(Ok(Message::Pong(data))) => InboundFrame::Pong(data),
            Some(Ok(Message::Close(frame))) => {
                // Keep polling so the close reply gets flushed.
                debug!(?frame, "WebSocket closed by remote");
                link.closed.store(true, Ordering::Release);
                peer_reason.get_or_insert_with(|| close_reason(frame));
                deadline.get_or_insert_with(|| Box::pin(sleep(link.closing_timeout)));
                continue;
            }
            Some(Ok(Message::Frame(_))) => continue,
            Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                debug!("WebSocket stream ended");
                break peer_reason.take();
            }
            Some(Err(WsError::Capacity(e))) => {
                warn!(error = %e, "Inbound message too big");
                close_locally(&link.commands, CloseReason::MESSAGE_TOO_BIG).await;
                link.closed.store(true, Ordering::Release);
                let error = Error::protocol(format!("Message too big: {e}"));
                let _ = frames_tx.send(InboundFrame::Error(error)).await;
                break Some(CloseReason::MESSAGE_TOO_BIG);
            }
            Some(Err(e)) => {
                debug!(error = %e, "WebSocket read failed");
                break peer_reason.take();
            }
        };

        if frames_tx.send(frame).await.is_err() {
            debug!("Inbound queue dropped, stopping reader");
            break None;
        }
    };

    link.closed.store(true, Ordering::Release);
    let _ = frames_tx.send(InboundFrame::Closed(reported)).await;
    trace!("WebSocket reader terminated");
}

// ============================================================================
// Helpers
// ============================================================================

fn to_message(frame: OutboundFrame) -> Message {
    match frame {
        OutboundFrame::Text(text) => Message::Text(text.into()),
        OutboundFrame::Binary(data) => Message::Binary(data),
        OutboundFrame::Ping(data) => Message::Ping(data),
        OutboundFrame::Pong(data) => Message::Pong(data),
    }
}

/// Has the writer send a close frame and waits until it is flushed.
async fn close_locally(commands: &mpsc::WeakUnboundedSender<TransportCommand>, reason: CloseReason) {
    let Some(commands) = commands.upgrade() else {
        return;
    };
    let (ack, rx) = oneshot::channel();
    if commands.send(TransportCommand::Close { reason, ack }).is_err() {
        return;
    }
    drop(commands);
    if let Ok(Err(e)) = rx.await {
        debug!(error = %e, "Close frame not sent");
    }
}

async fn closing_started(closing: &mut Option<oneshot::Receiver<()>>) -> bool {
    match closing {
        Some(rx) => rx.await.is_ok(),
        None => std::future::pending().await,
    }
}

async fn expired(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline {
        Some(timer) => timer.as_mut().await,
        None => std::future::pending().await,
    }
}

fn close_reason(frame: Option<CloseFrame>) -> CloseReason {
    match frame {
        Some(frame) => CloseReason::new(u16::from(frame.code), frame.reason.as_str()),
        None => CloseReason::NO_STATUS,
    }
}

// ============================================================================
// Tests
// ============================================================================
