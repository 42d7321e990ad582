//! Dispatch modes of endpoint callbacks.
//!
//! | Mode | Where the callback runs |
//! |------|-------------------------|
//! | [`DispatchMode::Inline`] | Polled directly on the connection's event loop |
//! | [`DispatchMode::Worker`] | On tokio's blocking pool, may block the thread |
//! | [`DispatchMode::Isolate`] | On its own lightweight tokio task |
//! | [`DispatchMode::Disabled`] | Not invoked |
//!
//! Whatever the mode, the result is reported back on the event loop.

// ============================================================================
// Imports
// ============================================================================

use std::any::Any;
use std::fmt;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::JoinError;

use crate::error::{Error, Result};

// ============================================================================
// Types
// ============================================================================

/// A guarded callback invocation.
pub type CallbackJob = BoxFuture<'static, Result<()>>;

/// Endpoint callback kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Callback {
    /// Connection opened.
    Open,
    /// Text message or text stream.
    TextMessage,
    /// Binary message or binary stream.
    BinaryMessage,
    /// Ping frame.
    PingMessage,
    /// Pong frame.
    PongMessage,
    /// Connection closed.
    Close,
    /// Failure handler.
    Error,
}

impl Callback {
    /// Returns the callback name as used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "on_open",
            Self::TextMessage => "on_text_message",
            Self::BinaryMessage => "on_binary_message",
            Self::PingMessage => "on_ping_message",
            Self::PongMessage => "on_pong_message",
            Self::Close => "on_close",
            Self::Error => "on_error",
        }
    }

    /// Returns `true` for callbacks triggered by an inbound frame.
    #[must_use]
    pub const fn is_message(self) -> bool {
        matches!(
            self,
            Self::TextMessage | Self::BinaryMessage | Self::PingMessage | Self::PongMessage
        )
    }
}

impl fmt::Display for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// DispatchMode
// ============================================================================

/// How a callback is executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DispatchMode {
    /// Run on the event loop. The callback must not block.
    #[default]
    Inline,
    /// Run on a worker thread where blocking is allowed.
    Worker,
    /// Run on an independent lightweight task.
    Isolate,
    /// Never invoke the callback.
    Disabled,
}

impl DispatchMode {
    /// Returns `false` for [`DispatchMode::Disabled`].
    #[inline]
    #[must_use]
    pub const fn is_enabled(self) -> bool {
        !matches!(self, Self::Disabled)
    }

    /// Returns the strategy for this mode, `None` when disabled.
    #[must_use]
    pub fn strategy(self) -> Option<&'static dyn DispatchStrategy> {
        match self {
            Self::Inline => Some(&InlineStrategy),
            Self::Worker => Some(&WorkerStrategy),
            Self::Isolate => Some(&IsolateStrategy),
            Self::Disabled => None,
        }
    }
}

// ============================================================================
// DispatchStrategy
// ============================================================================

/// Submits a callback job for execution.
///
/// The returned future resolves with the job's result and is awaited on
/// the event loop, which is where continuations run.
pub trait DispatchStrategy: Send + Sync {
    /// Submits `job`.
    fn submit(&self, job: CallbackJob) -> CallbackJob;
}

/// Polls the job in place.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineStrategy;

impl DispatchStrategy for InlineStrategy {
    fn submit(&self, job: CallbackJob) -> CallbackJob {
        job
    }
}

/// Runs the job to completion on the blocking pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerStrategy;

impl DispatchStrategy for WorkerStrategy {
    fn submit(&self, job: CallbackJob) -> CallbackJob {
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                let message = e.to_string();
                return Box::pin(async move { Err(Error::callback(message)) });
            }
        };
        Box::pin(async move {
            tokio::task::spawn_blocking(move || handle.block_on(job))
                .await
                .map_err(|e| join_error("worker", e))?
        })
    }
}

/// Spawns the job as its own task.
#[derive(Debug, Clone, Copy, Default)]
pub struct IsolateStrategy;

impl DispatchStrategy for IsolateStrategy {
    fn submit(&self, job: CallbackJob) -> CallbackJob {
        Box::pin(async move {
            tokio::spawn(job)
                .await
                .map_err(|e| join_error("isolate", e))?
        })
    }
}

fn join_error(strategy: &'static str, error: JoinError) -> Error {
    if error.is_panic() {
        Error::callback_panicked(strategy, panic_message(&*error.into_panic()))
    } else {
        Error::callback(format!("{strategy} task cancelled"))
    }
}

/// Extracts the message of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_mode_is_inline() {
        assert_eq!(DispatchMode::default(), DispatchMode::Inline);
        assert!(DispatchMode::Worker.is_enabled());
        assert!(!DispatchMode::Disabled.is_enabled());
        assert!(DispatchMode::Disabled.strategy().is_none());
    }

    #[tokio::test]
    async fn test_inline_strategy() {
        let result = InlineStrategy.submit(Box::pin(async { Ok(()) })).await;
        assert!(result.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_worker_runs_off_the_caller_thread() {
        let caller = std::thread::current().id();
        let (tx, rx) = tokio::sync::oneshot::channel();

        WorkerStrategy
            .submit(Box::pin(async move {
                let _ = tx.send(std::thread::current().id());
                Ok(())
            }))
            .await
            .unwrap();

        assert_ne!(rx.await.unwrap(), caller);
    }

    #[tokio::test]
    async fn test_worker_propagates_errors() {
        let err = WorkerStrategy
            .submit(Box::pin(async { Err(Error::callback("boom")) }))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_isolate_converts_panics() {
        let err = IsolateStrategy
            .submit(Box::pin(async {
                if true {
                    panic!("kaboom");
                }
                Ok(())
            }))
            .await
            .unwrap_err();
        match err {
            Error::CallbackPanicked { message, .. } => assert_eq!(message, "kaboom"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42u8), "non-string panic payload");
    }

    #[test]
    fn test_callback_names() {
        assert_eq!(Callback::Open.to_string(), "on_open");
        assert!(Callback::PongMessage.is_message());
        assert!(!Callback::Close.is_message());
    }
}
