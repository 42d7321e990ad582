//! Close reasons and well-known status codes.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// Constants
// ============================================================================

/// Maximum length in bytes of the reason text carried by a close frame.
pub const MAX_REASON_BYTES: usize = 123;

// ============================================================================
// CloseReason
// ============================================================================

/// Status code and optional message of a connection close.
///
/// # Example
///
/// ```
/// use wsnext::CloseReason;
///
/// let reason = CloseReason::new(4000, "room closed");
/// assert_eq!(reason.code(), 4000);
/// assert_eq!(reason.message(), Some("room closed"));
/// assert_eq!(CloseReason::NORMAL.code(), 1000);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CloseReason {
    code: u16,
    message: Option<String>,
}

impl CloseReason {
    /// Normal closure (1000).
    pub const NORMAL: Self = Self::code_only(1000);

    /// Endpoint going away (1001).
    pub const GOING_AWAY: Self = Self::code_only(1001);

    /// Close frame carried no status (1005).
    pub const NO_STATUS: Self = Self::code_only(1005);

    /// Connection dropped without a close frame (1006).
    pub const ABNORMAL: Self = Self::code_only(1006);

    /// Policy violation (1008).
    pub const POLICY_VIOLATION: Self = Self::code_only(1008);

    /// Message too big (1009).
    pub const MESSAGE_TOO_BIG: Self = Self::code_only(1009);

    /// Unexpected server condition (1011).
    pub const INTERNAL_SERVER_ERROR: Self = Self::code_only(1011);

    const fn code_only(code: u16) -> Self {
        Self {
            code,
            message: None,
        }
    }

    /// Creates a reason with a code and message.
    ///
    /// Messages longer than [`MAX_REASON_BYTES`] are cut at a character
    /// boundary so the reason fits a close frame.
    #[must_use]
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        let mut message = message.into();
        truncate_to_boundary(&mut message, MAX_REASON_BYTES);
        Self {
            code,
            message: (!message.is_empty()).then_some(message),
        }
    }

    /// Creates a reason with only a code.
    #[inline]
    #[must_use]
    pub const fn with_code(code: u16) -> Self {
        Self::code_only(code)
    }

    /// Returns the status code.
    #[inline]
    #[must_use]
    pub const fn code(&self) -> u16 {
        self.code
    }

    /// Returns the message, if any.
    #[inline]
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Returns `true` for a normal closure.
    #[inline]
    #[must_use]
    pub const fn is_normal(&self) -> bool {
        self.code == 1000
    }
}

impl Default for CloseReason {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{} ({message})", self.code),
            None => write!(f, "{}", self.code),
        }
    }
}

fn truncate_to_boundary(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(CloseReason::NORMAL.code(), 1000);
        assert_eq!(CloseReason::ABNORMAL.code(), 1006);
        assert_eq!(CloseReason::POLICY_VIOLATION.code(), 1008);
        assert_eq!(CloseReason::INTERNAL_SERVER_ERROR.code(), 1011);
        assert!(CloseReason::NORMAL.message().is_none());
        assert!(CloseReason::default().is_normal());
    }

    #[test]
    fn test_empty_message_is_none() {
        assert_eq!(CloseReason::new(1000, ""), CloseReason::NORMAL);
    }

    #[test]
    fn test_long_message_truncated_at_char_boundary() {
        let reason = CloseReason::new(1011, "é".repeat(100));
        let message = reason.message().unwrap();
        assert!(message.len() <= MAX_REASON_BYTES);
        assert_eq!(message.len(), 122);
    }

    #[test]
    fn test_display() {
        assert_eq!(CloseReason::NORMAL.to_string(), "1000");
        assert_eq!(CloseReason::new(4001, "bye").to_string(), "4001 (bye)");
    }
}
