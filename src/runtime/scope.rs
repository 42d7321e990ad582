//! Scope controllers.
//!
//! A scope is contextual state that must be visible to callback code, such
//! as a per-connection session or a per-invocation request context. The
//! engine does not know what a scope holds; it only drives the
//! [`ScopeController`] lifecycle.
//!
//! | Scope | Token captured | Active | Terminated |
//! |-------|----------------|--------|------------|
//! | Session | once, at open | around every invocation | after the close callback |
//! | Request | per invocation | around that invocation | after that invocation |

// ============================================================================
// Imports
// ============================================================================

use std::any::Any;
use std::fmt;
use std::sync::Arc;

// ============================================================================
// ScopeToken
// ============================================================================

/// Opaque state captured by a [`ScopeController`].
#[derive(Clone)]
pub struct ScopeToken(Arc<dyn Any + Send + Sync>);

impl ScopeToken {
    /// Wraps controller-specific state.
    #[must_use]
    pub fn new<T: Any + Send + Sync>(state: T) -> Self {
        Self(Arc::new(state))
    }

    /// A token carrying no state.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(())
    }

    /// Returns the state if it has type `T`.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for ScopeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeToken").finish_non_exhaustive()
    }
}

// ============================================================================
// ScopeController
// ============================================================================

/// Lifecycle hooks of one kind of scope.
///
/// `activate` and `deactivate` bracket every invocation and are called by
/// the task that runs it. `capture_state` and `terminate` run on the event
/// loop.
pub trait ScopeController: Send + Sync + 'static {
    /// Creates the state of a new scope instance.
    fn capture_state(&self) -> ScopeToken;

    /// Makes `token` the active scope.
    fn activate(&self, token: &ScopeToken);

    /// Clears the active scope.
    fn deactivate(&self);

    /// Destroys the scope instance.
    fn terminate(&self, token: &ScopeToken);
}

/// Controller that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopScope;

impl ScopeController for NoopScope {
    fn capture_state(&self) -> ScopeToken {
        ScopeToken::empty()
    }

    fn activate(&self, _token: &ScopeToken) {}

    fn deactivate(&self) {}

    fn terminate(&self, _token: &ScopeToken) {}
}

// ============================================================================
// InvocationScopes
// ============================================================================

/// Session and request scope handling of one connection.
pub(crate) struct InvocationScopes {
    session: Arc<dyn ScopeController>,
    session_token: ScopeToken,
    request: Option<Arc<dyn ScopeController>>,
}

impl InvocationScopes {
    /// Captures the session token.
    pub(crate) fn open(
        session: Arc<dyn ScopeController>,
        request: Option<Arc<dyn ScopeController>>,
    ) -> Self {
        let session_token = session.capture_state();
        Self {
            session,
            session_token,
            request,
        }
    }

    /// Captures a request token for one invocation.
    pub(crate) fn begin_request(&self) -> Option<ScopeToken> {
        self.request
            .as_ref()
            .map(|controller| controller.capture_state())
    }

    /// Activates the session and, if present, the request scope.
    pub(crate) fn enter(&self, request: Option<&ScopeToken>) {
        self.session.activate(&self.session_token);
        if let (Some(controller), Some(token)) = (&self.request, request) {
            controller.activate(token);
        }
    }

    /// Deactivates what [`enter`](Self::enter) activated.
    pub(crate) fn exit(&self, request: Option<&ScopeToken>) {
        if let (Some(controller), Some(_)) = (&self.request, request) {
            controller.deactivate();
        }
        self.session.deactivate();
    }

    /// Terminates a request scope instance.
    pub(crate) fn finish_request(&self, request: Option<ScopeToken>) {
        if let (Some(controller), Some(token)) = (&self.request, request) {
            controller.terminate(&token);
        }
    }

    /// Terminates the session scope instance.
    pub(crate) fn end_session(&self) {
        self.session.terminate(&self.session_token);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingScope;

    #[test]
    fn test_token_downcast() {
        let token = ScopeToken::new(5u32);
        assert_eq!(token.downcast_ref::<u32>(), Some(&5));
        assert!(token.downcast_ref::<String>().is_none());
    }

    #[test]
    fn test_session_and_request_lifecycle() {
        let session = Arc::new(RecordingScope::new("session"));
        let request = Arc::new(RecordingScope::new("request"));
        let scopes = InvocationScopes::open(session.clone(), Some(request.clone()));

        let token = scopes.begin_request();
        scopes.enter(token.as_ref());
        scopes.exit(token.as_ref());
        scopes.finish_request(token);
        scopes.end_session();

        assert_eq!(
            session.events(),
            ["capture session#1", "activate session#1", "deactivate session", "terminate session#1"]
        );
        assert_eq!(
            request.events(),
            ["capture request#1", "activate request#1", "deactivate request", "terminate request#1"]
        );
    }

    #[test]
    fn test_without_request_scope() {
        let session = Arc::new(RecordingScope::new("session"));
        let scopes = InvocationScopes::open(session.clone(), None);

        let token = scopes.begin_request();
        assert!(token.is_none());
        scopes.enter(None);
        scopes.exit(None);

        assert_eq!(
            session.events(),
            ["capture session#1", "activate session#1", "deactivate session"]
        );
    }
}
