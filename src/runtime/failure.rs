//! Handling of failures that no `on_error` callback handled.

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::connection::{CloseReason, Connection};
use crate::error::Error;

// ============================================================================
// UnhandledFailureStrategy
// ============================================================================

/// What happens to an unhandled failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnhandledFailureStrategy {
    /// Log the failure and close the connection.
    #[default]
    LogAndClose,
    /// Close the connection.
    Close,
    /// Log the failure.
    Log,
    /// Do nothing.
    Noop,
}

impl UnhandledFailureStrategy {
    /// Returns `true` if the strategy closes the connection.
    #[inline]
    #[must_use]
    pub const fn closes(self) -> bool {
        matches!(self, Self::LogAndClose | Self::Close)
    }

    /// Returns `true` if the strategy logs the failure.
    #[inline]
    #[must_use]
    pub const fn logs(self) -> bool {
        matches!(self, Self::LogAndClose | Self::Log)
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Returns the reason used when a failure closes the connection.
///
/// The failure message is only included when `include_message` is set.
pub(crate) fn close_reason_for(error: &Error, include_message: bool) -> CloseReason {
    let code = if error.is_security_error() {
        CloseReason::POLICY_VIOLATION.code()
    } else {
        CloseReason::INTERNAL_SERVER_ERROR.code()
    };
    if include_message {
        CloseReason::new(code, error.to_string())
    } else {
        CloseReason::with_code(code)
    }
}

/// Logs an unhandled failure.
///
/// Security failures and writes to a departed peer are logged at debug level.
pub(crate) fn log_unhandled(connection: &Connection, error: &Error) {
    if error.is_security_error() {
        debug!(
            connection_id = %connection.id(),
            endpoint = %connection.endpoint_id(),
            error = %error,
            "Security failure"
        );
    } else if error.is_closed_channel() {
        debug!(
            connection_id = %connection.id(),
            endpoint = %connection.endpoint_id(),
            error = %error,
            "Peer gone before failure could be reported"
        );
    } else {
        error!(
            connection_id = %connection.id(),
            endpoint = %connection.endpoint_id(),
            error = %error,
            "Unhandled failure"
        );
    }
}

// ============================================================================
// Tests
// ============================================================================
