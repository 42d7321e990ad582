//! Per-connection dispatcher.
//!
//! Every connection is driven by one event-loop task. The loop owns the
//! inbound frame queue and turns frames into callback invocations.
//!
//! # Lifecycle
//!
//! ```text
//!            on_open ok
//! Opening ──────────────► Open ─────┐
//!    │                              │ close frame / drop
//!    │ on_open failed               ▼
//!    └──────────────► OpenFailed ─► Closed ─► on_close ─► removed
//! ```
//!
//! # Event Loop
//!
//! | Source | Effect |
//! |--------|--------|
//! | Scheduled jobs | Polled alongside everything else on the loop task |
//! | Inbound frames | Dispatched to the matching callback (paused under stream backpressure) |
//! | Auto-ping ticks | Ping frame sent |
//! | Identity expiry | Connection closed with a policy violation |
//!
//! Unless the endpoint consumes a message kind as a stream, callbacks pass
//! through a [`ConcurrencyLimiter`] and never overlap.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use bytes::Bytes;
use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep, interval_at};
use tracing::{debug, trace, warn};

use crate::config::EndpointsConfig;
use crate::connection::{CloseReason, Connection};
use crate::endpoint::{Consumption, Endpoint, EndpointDefinition};
use crate::error::{Error, Result};
use crate::runtime::concurrency::{Completion, ConcurrencyLimiter};
use crate::runtime::context::{self, ContextHandle, InvocationContext, Job};
use crate::runtime::dispatch::{Callback, CallbackJob, DispatchMode, panic_message};
use crate::runtime::failure;
use crate::runtime::scope::{InvocationScopes, ScopeController, ScopeToken};
use crate::runtime::stream::{self, MessageStream};
use crate::transport::InboundFrame;

// ============================================================================
// Constants
// ============================================================================

/// Payload of automatic ping frames.
const AUTO_PING_PAYLOAD: &[u8] = b"wsnext";

// ============================================================================
// Types
// ============================================================================

type OnDone = Box<dyn FnOnce(&Arc<Dispatcher>, Result<()>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Opening,
    Open,
    OpenFailed,
    Closed,
}

/// Frames held back while the connection is opening without a limiter.
enum Deferred {
    Text(String),
    Binary(Bytes),
    Close(Option<CloseReason>),
}

/// Streams handed to stream callbacks once the connection is open.
struct PendingStreams {
    text: Option<MessageStream<String>>,
    binary: Option<MessageStream<Bytes>>,
}

/// Sending sides of the message streams, owned by the event loop.
#[derive(Default)]
struct StreamSinks {
    text: Option<mpsc::Sender<String>>,
    binary: Option<mpsc::Sender<Bytes>>,
}

/// Everything the dispatcher of one connection needs.
pub(crate) struct DispatcherParts {
    pub connection: Connection,
    pub endpoint: Arc<dyn Endpoint>,
    pub definition: Arc<EndpointDefinition>,
    pub config: Arc<EndpointsConfig>,
    pub session_scope: Arc<dyn ScopeController>,
    pub request_scope: Option<Arc<dyn ScopeController>>,
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Drives the callbacks of one connection.
pub(crate) struct Dispatcher {
    connection: Connection,
    endpoint: Arc<dyn Endpoint>,
    definition: Arc<EndpointDefinition>,
    config: Arc<EndpointsConfig>,
    context: ContextHandle,
    limiter: Option<ConcurrencyLimiter>,
    scopes: Arc<InvocationScopes>,
    state: Mutex<Lifecycle>,
    open_failed: AtomicBool,
    deferred: Mutex<VecDeque<Deferred>>,
    streams: Mutex<Option<PendingStreams>>,
    finished: AtomicBool,
}

impl Dispatcher {
    /// Spawns the event loop of a connection.
    pub(crate) fn start(
        parts: DispatcherParts,
        frames: mpsc::Receiver<InboundFrame>,
    ) -> JoinHandle<()> {
        let DispatcherParts {
            connection,
            endpoint,
            definition,
            config,
            session_scope,
            request_scope,
        } = parts;

        let (context, jobs) = ContextHandle::channel();
        let capacity = config.stream_buffer_size.max(1);
        let mut sinks = StreamSinks::default();
        let mut pending = PendingStreams {
            text: None,
            binary: None,
        };
        if definition.text_consumption() == Consumption::Stream {
            let (sink, messages) = stream::channel(capacity);
            sinks.text = Some(sink);
            pending.text = Some(messages);
        }
        if definition.binary_consumption() == Consumption::Stream {
            let (sink, messages) = stream::channel(capacity);
            sinks.binary = Some(sink);
            pending.binary = Some(messages);
        }

        let request_scope = request_scope
            .filter(|_| definition.activates_request_scope(config.activate_request_scope));
        let limiter = (!definition.consumes_streams()).then(ConcurrencyLimiter::new);

        let dispatcher = Arc::new(Self {
            scopes: Arc::new(InvocationScopes::open(session_scope, request_scope)),
            connection,
            endpoint,
            definition,
            config,
            context,
            limiter,
            state: Mutex::new(Lifecycle::Opening),
            open_failed: AtomicBool::new(false),
            deferred: Mutex::new(VecDeque::new()),
            streams: Mutex::new(Some(pending)),
            finished: AtomicBool::new(false),
        });

        tokio::spawn(dispatcher.run(frames, jobs, sinks))
    }

    fn lifecycle(&self) -> Lifecycle {
        *self.state.lock()
    }

    fn defers(&self) -> bool {
        self.limiter.is_none() && self.lifecycle() == Lifecycle::Opening
    }
}

// ============================================================================
// Impl - Event Loop
// ============================================================================

impl Dispatcher {
    async fn run(
        self: Arc<Self>,
        mut frames: mpsc::Receiver<InboundFrame>,
        mut jobs: mpsc::UnboundedReceiver<Job>,
        mut sinks: StreamSinks,
    ) {
        let mut in_flight: FuturesUnordered<Job> = FuturesUnordered::new();
        let backpressure = Arc::new(AtomicBool::new(false));
        let mut ping = self.config.auto_ping_interval().map(|period| {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        let mut expiry = self.identity_deadline();
        let mut reading = true;

        debug!(
            connection_id = %self.connection.id(),
            endpoint = %self.connection.endpoint_id(),
            "Event loop started"
        );
        self.handle_open();

        loop {
            if self.finished.load(Ordering::Acquire) && in_flight.is_empty() {
                while let Ok(job) = jobs.try_recv() {
                    in_flight.push(job);
                }
                if in_flight.is_empty() {
                    break;
                }
            }

            tokio::select! {
                Some(job) = jobs.recv() => in_flight.push(job),

                Some(()) = in_flight.next(), if !in_flight.is_empty() => {}

                frame = frames.recv(), if reading && !backpressure.load(Ordering::Acquire) => {
                    let frame = frame.unwrap_or(InboundFrame::Closed(None));
                    if matches!(frame, InboundFrame::Closed(_)) {
                        reading = false;
                        ping = None;
                        expiry = None;
                        sinks = StreamSinks::default();
                    }
                    self.handle_frame(frame, &sinks, &backpressure, &mut in_flight);
                }

                () = tick(&mut ping), if ping.is_some() => self.send_auto_ping(),

                () = elapsed(&mut expiry), if expiry.is_some() => {
                    expiry = if self.identity_expired() {
                        self.handle_identity_expired();
                        None
                    } else {
                        self.identity_deadline()
                    };
                }

                () = self.connection.identity_changed().notified(), if reading => {
                    expiry = self.identity_deadline();
                }
            }
        }

        debug!(connection_id = %self.connection.id(), "Event loop terminated");
    }

    fn handle_frame(
        self: &Arc<Self>,
        frame: InboundFrame,
        sinks: &StreamSinks,
        backpressure: &Arc<AtomicBool>,
        in_flight: &mut FuturesUnordered<Job>,
    ) {
        match frame {
            InboundFrame::Text(text) => {
                if let Some(traffic) = self.connection.traffic() {
                    traffic.text_received(&self.connection, &text);
                }
                if let Some(counters) = self.connection.counters() {
                    counters.record_received(text.len());
                }
                match &sinks.text {
                    Some(sink) => push_stream(sink, text, backpressure, in_flight),
                    None => self.handle_text(text),
                }
            }
            InboundFrame::Binary(data) => {
                if let Some(traffic) = self.connection.traffic() {
                    traffic.binary_received(&self.connection, data.len());
                }
                if let Some(counters) = self.connection.counters() {
                    counters.record_received(data.len());
                }
                match &sinks.binary {
                    Some(sink) => push_stream(sink, data, backpressure, in_flight),
                    None => self.handle_binary(data),
                }
            }
            InboundFrame::Ping(data) => self.handle_ping(data),
            InboundFrame::Pong(data) => self.handle_pong(data),
            InboundFrame::Error(error) => self.handle_error(error),
            InboundFrame::Closed(reason) => self.handle_close(reason),
        }
    }

    fn send_auto_ping(&self) {
        let connection = self.connection.clone();
        self.context.execute(async move {
            if let Err(e) = connection.send_ping(Bytes::from_static(AUTO_PING_PAYLOAD)).await {
                debug!(connection_id = %connection.id(), error = %e, "Auto ping failed");
            }
        });
    }

    fn identity_deadline(&self) -> Option<Pin<Box<Sleep>>> {
        let expires_at = self.connection.security_identity()?.expires_at()?;
        let remaining = expires_at
            .duration_since(SystemTime::now())
            .unwrap_or_default();
        Some(Box::pin(tokio::time::sleep(remaining)))
    }

    fn identity_expired(&self) -> bool {
        self.connection
            .security_identity()
            .is_some_and(|identity| identity.is_expired_at(SystemTime::now()))
    }

    fn handle_identity_expired(&self) {
        debug!(connection_id = %self.connection.id(), "Security identity expired");
        let connection = self.connection.clone();
        self.context.execute(async move {
            let reason = failure::close_reason_for(&Error::AuthenticationExpired, true);
            if let Err(e) = connection.close_with(reason).await {
                debug!(connection_id = %connection.id(), error = %e, "Close after expiry failed");
            }
        });
    }
}

// ============================================================================
// Impl - Handlers
// ============================================================================

impl Dispatcher {
    fn handle_open(self: &Arc<Self>) {
        let connection = self.connection.clone();
        connection.manager().add(connection.endpoint_id(), &connection);
        if let Some(counters) = connection.counters() {
            counters.record_opened();
        }
        if let Some(traffic) = connection.traffic() {
            traffic.connection_opened(&connection);
        }

        let endpoint = Arc::clone(&self.endpoint);
        self.invoke(
            Callback::Open,
            Box::pin(async move { endpoint.on_open(&connection).await }),
            Box::new(|this: &Arc<Self>, result: Result<()>| this.after_open(result)),
        );
    }

    fn after_open(self: &Arc<Self>, result: Result<()>) {
        let failed = result.is_err();
        {
            let mut state = self.state.lock();
            if *state == Lifecycle::Opening {
                *state = if failed {
                    Lifecycle::OpenFailed
                } else {
                    Lifecycle::Open
                };
            }
        }

        match result {
            Ok(()) => {
                trace!(connection_id = %self.connection.id(), "Open callback completed");
                self.start_streams();
            }
            Err(error) => {
                self.open_failed.store(true, Ordering::Release);
                self.streams.lock().take();
                self.handle_error(error);
            }
        }

        let deferred: Vec<_> = self.deferred.lock().drain(..).collect();
        for frame in deferred {
            match frame {
                Deferred::Text(text) if !failed => self.handle_text(text),
                Deferred::Binary(data) if !failed => self.handle_binary(data),
                Deferred::Close(reason) => self.handle_close(reason),
                Deferred::Text(_) | Deferred::Binary(_) => {}
            }
        }
    }

    fn start_streams(self: &Arc<Self>) {
        let Some(pending) = self.streams.lock().take() else {
            return;
        };

        if let Some(messages) = pending.text {
            let endpoint = Arc::clone(&self.endpoint);
            let connection = self.connection.clone();
            self.invoke(
                Callback::TextMessage,
                Box::pin(async move { endpoint.on_text_stream(&connection, messages).await }),
                Box::new(|this: &Arc<Self>, result: Result<()>| this.after_message(result)),
            );
        }
        if let Some(messages) = pending.binary {
            let endpoint = Arc::clone(&self.endpoint);
            let connection = self.connection.clone();
            self.invoke(
                Callback::BinaryMessage,
                Box::pin(async move { endpoint.on_binary_stream(&connection, messages).await }),
                Box::new(|this: &Arc<Self>, result: Result<()>| this.after_message(result)),
            );
        }
    }

    fn handle_text(self: &Arc<Self>, text: String) {
        if self.defers() {
            self.deferred.lock().push_back(Deferred::Text(text));
            return;
        }

        let endpoint = Arc::clone(&self.endpoint);
        let connection = self.connection.clone();
        self.invoke(
            Callback::TextMessage,
            Box::pin(async move {
                if let Some(reply) = endpoint.on_text_message(&connection, text).await? {
                    connection.send_text(reply).await?;
                }
                Ok(())
            }),
            Box::new(|this: &Arc<Self>, result: Result<()>| this.after_message(result)),
        );
    }

    fn handle_binary(self: &Arc<Self>, data: Bytes) {
        if self.defers() {
            self.deferred.lock().push_back(Deferred::Binary(data));
            return;
        }

        let endpoint = Arc::clone(&self.endpoint);
        let connection = self.connection.clone();
        self.invoke(
            Callback::BinaryMessage,
            Box::pin(async move {
                if let Some(reply) = endpoint.on_binary_message(&connection, data).await? {
                    connection.send_binary(reply).await?;
                }
                Ok(())
            }),
            Box::new(|this: &Arc<Self>, result: Result<()>| this.after_message(result)),
        );
    }

    fn handle_ping(self: &Arc<Self>, data: Bytes) {
        let endpoint = Arc::clone(&self.endpoint);
        let connection = self.connection.clone();
        self.invoke(
            Callback::PingMessage,
            Box::pin(async move { endpoint.on_ping_message(&connection, data).await }),
            Box::new(|this: &Arc<Self>, result: Result<()>| this.after_message(result)),
        );
    }

    fn handle_pong(self: &Arc<Self>, data: Bytes) {
        let endpoint = Arc::clone(&self.endpoint);
        let connection = self.connection.clone();
        self.invoke(
            Callback::PongMessage,
            Box::pin(async move { endpoint.on_pong_message(&connection, data).await }),
            Box::new(|this: &Arc<Self>, result: Result<()>| this.after_message(result)),
        );
    }

    fn after_message(self: &Arc<Self>, result: Result<()>) {
        if let Err(error) = result {
            self.handle_error(error);
        }
    }

    fn handle_close(self: &Arc<Self>, reported: Option<CloseReason>) {
        if self.defers() {
            self.deferred.lock().push_back(Deferred::Close(reported));
            return;
        }
        {
            let mut state = self.state.lock();
            if *state == Lifecycle::Closed {
                return;
            }
            *state = Lifecycle::Closed;
        }

        let reason = self.connection.record_close(reported);
        if let Some(traffic) = self.connection.traffic() {
            traffic.connection_closed(&self.connection, &reason);
        }
        debug!(
            connection_id = %self.connection.id(),
            reason = %reason,
            "Transport closed"
        );

        let endpoint = Arc::clone(&self.endpoint);
        let connection = self.connection.clone();
        self.invoke(
            Callback::Close,
            Box::pin(async move { endpoint.on_close(&connection, &reason).await }),
            Box::new(|this: &Arc<Self>, result: Result<()>| {
                if let Err(error) = result {
                    this.handle_error(error);
                }
                this.teardown();
            }),
        );
    }

    fn teardown(&self) {
        self.scopes.end_session();
        let connection = &self.connection;
        connection.manager().remove(connection.endpoint_id(), connection);
        if let Some(counters) = connection.counters() {
            counters.record_closed();
        }
        self.finished.store(true, Ordering::Release);
        debug!(connection_id = %connection.id(), "Connection closed");
    }

    fn handle_error(self: &Arc<Self>, error: Error) {
        if let Some(counters) = self.connection.counters() {
            counters.record_error();
        }

        if !self.definition.callbacks().on_error.is_enabled() {
            self.handle_unhandled(error);
            return;
        }

        trace!(connection_id = %self.connection.id(), error = %error, "Routing failure to on_error");
        let endpoint = Arc::clone(&self.endpoint);
        let connection = self.connection.clone();
        self.invoke(
            Callback::Error,
            Box::pin(async move { endpoint.on_error(&connection, error).await }),
            Box::new(|this: &Arc<Self>, result: Result<()>| {
                if let Err(error) = result {
                    this.handle_unhandled(error);
                }
            }),
        );
    }

    fn handle_unhandled(&self, error: Error) {
        let strategy = self.config.unhandled_failure_strategy;
        if strategy.logs() {
            failure::log_unhandled(&self.connection, &error);
        } else {
            trace!(connection_id = %self.connection.id(), error = %error, "Unhandled failure ignored");
        }

        if strategy.closes() && self.connection.is_open() {
            let reason = failure::close_reason_for(&error, self.config.dev_mode);
            let connection = self.connection.clone();
            self.context.execute(async move {
                if let Err(e) = connection.close_with(reason).await {
                    warn!(connection_id = %connection.id(), error = %e, "Close after failure failed");
                }
            });
        }
    }
}

// ============================================================================
// Impl - Invocation
// ============================================================================

impl Dispatcher {
    /// Invokes a callback through the limiter (when present) and reports
    /// its result to `on_done` on the event loop.
    fn invoke(self: &Arc<Self>, callback: Callback, call: CallbackJob, on_done: OnDone) {
        let mode = self.definition.callbacks().mode(callback);
        let this = Arc::clone(self);
        match &self.limiter {
            Some(limiter) => limiter.run(&self.context, move |completion| {
                this.schedule(callback, mode, call, on_done, Some(completion));
            }),
            None => this.schedule(callback, mode, call, on_done, None),
        }
    }

    fn schedule(
        self: Arc<Self>,
        callback: Callback,
        mode: DispatchMode,
        call: CallbackJob,
        on_done: OnDone,
        completion: Option<Completion>,
    ) {
        let context = self.context.clone();
        context.execute(async move {
            let result = self.run_callback(callback, mode, call).await;
            on_done(&self, result);
            if let Some(completion) = completion {
                completion.complete();
            }
        });
    }

    async fn run_callback(&self, callback: Callback, mode: DispatchMode, call: CallbackJob) -> Result<()> {
        let Some(strategy) = mode.strategy() else {
            trace!(connection_id = %self.connection.id(), %callback, "Callback disabled");
            return Ok(());
        };
        if callback.is_message() && self.open_failed.load(Ordering::Acquire) {
            debug!(connection_id = %self.connection.id(), %callback, "Skipped after failed open");
            return Ok(());
        }

        trace!(connection_id = %self.connection.id(), %callback, ?mode, "Invoking callback");
        let request = self.scopes.begin_request();
        let invocation = InvocationContext::new(self.connection.clone(), callback);
        let guarded = guard(Arc::clone(&self.scopes), request.clone(), invocation, call);
        let result = strategy.submit(guarded).await;
        self.scopes.finish_request(request);
        result
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("connection", &self.connection)
            .field("state", &self.lifecycle())
            .field("limited", &self.limiter.is_some())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Wraps a callback with scope activation, the invocation context and
/// panic capture.
fn guard(
    scopes: Arc<InvocationScopes>,
    request: Option<ScopeToken>,
    invocation: InvocationContext,
    call: CallbackJob,
) -> CallbackJob {
    let callback = invocation.callback();
    Box::pin(async move {
        scopes.enter(request.as_ref());
        let outcome = AssertUnwindSafe(context::scope(invocation, call))
            .catch_unwind()
            .await;
        scopes.exit(request.as_ref());
        outcome.unwrap_or_else(|payload| {
            Err(Error::callback_panicked(callback.as_str(), panic_message(&*payload)))
        })
    })
}

/// Hands a message to a stream, pausing frame intake while it is full.
fn push_stream<T: Send + 'static>(
    sink: &mpsc::Sender<T>,
    item: T,
    backpressure: &Arc<AtomicBool>,
    in_flight: &mut FuturesUnordered<Job>,
) {
    match sink.try_send(item) {
        Ok(()) => {}
        Err(TrySendError::Full(item)) => {
            trace!("Message stream full, pausing frame intake");
            backpressure.store(true, Ordering::Release);
            let sink = sink.clone();
            let flag = Arc::clone(backpressure);
            in_flight.push(Box::pin(async move {
                if sink.send(item).await.is_err() {
                    trace!("Message stream consumer gone");
                }
                flag.store(false, Ordering::Release);
            }));
        }
        Err(TrySendError::Closed(_)) => {
            trace!("Message stream consumer gone, message dropped");
        }
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn elapsed(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

// ============================================================================
// Tests
// ============================================================================
