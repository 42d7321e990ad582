//! Per-connection concurrency limiter.
//!
//! Guarantees that at most one action of a connection is uncompleted at a
//! time and that queued actions run in submission order.
//!
//! An action receives a [`Completion`] and signals through it when its
//! work (including any asynchronous continuation) finished. Only then does
//! the next queued action start, on the execution context it was submitted
//! with.
//!
//! ```text
//! run(a) ──► counter 0→1, a runs now
//! run(b) ──► queue [b], counter 2
//! run(c) ──► queue [b, c], counter 3
//! a done ──► counter 2, pop b, execute on b's context
//! b done ──► counter 1, pop c, execute on c's context
//! c done ──► counter 0
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{error, trace};

use crate::runtime::context::ContextHandle;

// ============================================================================
// Types
// ============================================================================

type Task = Box<dyn FnOnce(Completion) + Send>;

struct Action {
    context: ContextHandle,
    task: Task,
}

struct Shared {
    uncompleted: AtomicU64,
    queue: Mutex<VecDeque<Action>>,
}

// ============================================================================
// ConcurrencyLimiter
// ============================================================================

/// Serializes the actions of one connection.
///
/// Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    shared: Arc<Shared>,
}

impl ConcurrencyLimiter {
    /// Creates an idle limiter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                uncompleted: AtomicU64::new(0),
                queue: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Runs `action` now if nothing is uncompleted, otherwise queues it.
    ///
    /// An action run now executes on the caller. A queued action executes
    /// on `context` once every earlier action completed.
    pub fn run<F>(&self, context: &ContextHandle, action: F)
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        let shared = &self.shared;
        if shared
            .uncompleted
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            trace!("Limiter idle, running action");
            action(self.completion());
            return;
        }

        shared.queue.lock().push_back(Action {
            context: context.clone(),
            task: Box::new(action),
        });
        let previous = shared.uncompleted.fetch_add(1, Ordering::AcqRel);
        trace!(queued = previous, "Action queued");

        if previous == 0 {
            // The holder completed between the failed exchange and the enqueue.
            let head = shared.queue.lock().pop_front();
            match head {
                Some(head) => (head.task)(self.completion()),
                None => report_empty_queue(previous + 1),
            }
        }
    }

    /// Returns the number of uncompleted actions, including queued ones.
    #[must_use]
    pub fn uncompleted(&self) -> u64 {
        self.shared.uncompleted.load(Ordering::Acquire)
    }

    /// Returns the number of queued actions.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().len()
    }

    fn completion(&self) -> Completion {
        Completion {
            shared: Arc::clone(&self.shared),
            done: AtomicBool::new(false),
        }
    }
}

impl Default for ConcurrencyLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConcurrencyLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrencyLimiter")
            .field("uncompleted", &self.uncompleted())
            .field("queued", &self.queued())
            .finish()
    }
}

// ============================================================================
// Completion
// ============================================================================

/// Signals that an action finished.
///
/// Dropping a completion without calling [`complete`](Self::complete)
/// completes it, so the limiter always moves on.
pub struct Completion {
    shared: Arc<Shared>,
    done: AtomicBool,
}

impl Completion {
    /// Marks the action finished and starts the next queued action.
    pub fn complete(self) {
        self.release();
    }

    fn release(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }

        let remaining = self.shared.uncompleted.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 {
            trace!("Limiter idle");
            return;
        }

        let next = self.shared.queue.lock().pop_front();
        match next {
            Some(Action { context, task }) => {
                let limiter = ConcurrencyLimiter {
                    shared: Arc::clone(&self.shared),
                };
                let completion = limiter.completion();
                if !context.execute(async move { task(completion) }) {
                    trace!("Queued action dropped with its context");
                }
            }
            None => report_empty_queue(remaining),
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("done", &self.done.load(Ordering::Acquire))
            .finish()
    }
}

fn report_empty_queue(uncompleted: u64) {
    error!(uncompleted, "Concurrency limiter has uncompleted actions but an empty queue");
    debug_assert!(false, "concurrency limiter queue empty with {uncompleted} uncompleted");
}

// ============================================================================
// Tests
// ============================================================================
