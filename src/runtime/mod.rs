//! Endpoint execution engine.
//!
//! The engine turns inbound frames into callback invocations, one event
//! loop per connection.
//!
//! # Components
//!
//! | Module | Description |
//! |--------|-------------|
//! | `concurrency` | [`ConcurrencyLimiter`] serializing callbacks of one connection |
//! | `context` | Event loops and the task-local [`InvocationContext`] |
//! | `dispatch` | [`Callback`] kinds and [`DispatchMode`] strategies |
//! | `driver` | The per-connection dispatcher |
//! | `failure` | [`UnhandledFailureStrategy`] |
//! | `scope` | Session and request [`ScopeController`] hooks |
//! | `stream` | [`MessageStream`] for stream-consuming callbacks |

// ============================================================================
// Submodules
// ============================================================================

/// Per-connection callback serialization.
pub mod concurrency;

/// Execution contexts.
pub mod context;

/// Callback kinds and dispatch strategies.
pub mod dispatch;

pub(crate) mod driver;

/// Unhandled failure handling.
pub mod failure;

/// Scope controllers.
pub mod scope;

/// Inbound message streams.
pub mod stream;

// ============================================================================
// Re-exports
// ============================================================================

pub use concurrency::{Completion, ConcurrencyLimiter};
pub use context::{ContextHandle, InvocationContext, current};
pub use dispatch::{
    Callback, CallbackJob, DispatchMode, DispatchStrategy, InlineStrategy, IsolateStrategy,
    WorkerStrategy,
};
pub use failure::UnhandledFailureStrategy;
pub use scope::{NoopScope, ScopeController, ScopeToken};
pub use stream::MessageStream;
