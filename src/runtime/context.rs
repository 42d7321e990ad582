//! Execution contexts and the invocation context.
//!
//! Every connection owns one event loop: a single tokio task that polls
//! every future scheduled on it. [`ContextHandle::execute`] schedules a
//! future there, so code scheduled through one handle never runs in
//! parallel with itself.
//!
//! While a callback runs, an [`InvocationContext`] is installed as a task
//! local. It tells collaborators which connection and which callback the
//! running code belongs to.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::connection::Connection;
use crate::runtime::dispatch::Callback;

// ============================================================================
// Types
// ============================================================================

/// A unit of work scheduled on an event loop.
pub(crate) type Job = BoxFuture<'static, ()>;

// ============================================================================
// ContextHandle
// ============================================================================

/// Handle to an event loop.
#[derive(Clone)]
pub struct ContextHandle {
    jobs: mpsc::UnboundedSender<Job>,
}

impl ContextHandle {
    /// Creates a handle and the receiving end its loop drains.
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<Job>) {
        let (jobs, rx) = mpsc::unbounded_channel();
        (Self { jobs }, rx)
    }

    /// Spawns a standalone event loop and returns its handle.
    ///
    /// The loop ends once every handle is dropped and the scheduled work
    /// completed. Must be called within a tokio runtime.
    #[must_use]
    pub fn spawn() -> Self {
        let (handle, rx) = Self::channel();
        tokio::spawn(drive(rx));
        handle
    }

    /// Schedules a future on the loop.
    ///
    /// Returns `false` if the loop has terminated; the future is dropped.
    pub fn execute<F>(&self, future: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let scheduled = self.jobs.send(Box::pin(future)).is_ok();
        if !scheduled {
            debug!("Event loop terminated, job dropped");
        }
        scheduled
    }

    /// Returns `true` if the loop has terminated.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.jobs.is_closed()
    }
}

impl fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextHandle")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Polls scheduled jobs until the channel closes and all jobs finished.
async fn drive(mut rx: mpsc::UnboundedReceiver<Job>) {
    let mut in_flight = FuturesUnordered::new();
    let mut open = true;

    loop {
        tokio::select! {
            job = rx.recv(), if open => match job {
                Some(job) => in_flight.push(job),
                None => open = false,
            },
            Some(()) = in_flight.next(), if !in_flight.is_empty() => {}
            else => break,
        }
    }
    trace!("Standalone event loop terminated");
}

// ============================================================================
// InvocationContext
// ============================================================================

tokio::task_local! {
    static CURRENT: InvocationContext;
}

/// The connection and callback a piece of running code belongs to.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    connection: Connection,
    callback: Callback,
}

impl InvocationContext {
    pub(crate) fn new(connection: Connection, callback: Callback) -> Self {
        Self {
            connection,
            callback,
        }
    }

    /// Returns the owning connection.
    #[inline]
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Returns the callback being invoked.
    #[inline]
    #[must_use]
    pub fn callback(&self) -> Callback {
        self.callback
    }
}

/// Returns the invocation context of the running callback, if any.
#[must_use]
pub fn current() -> Option<InvocationContext> {
    CURRENT.try_with(Clone::clone).ok()
}

/// Runs `future` with `context` installed.
pub(crate) async fn scope<F: Future>(context: InvocationContext, future: F) -> F::Output {
    CURRENT.scope(context, future).await
}

// ============================================================================
// Tests
// ============================================================================
