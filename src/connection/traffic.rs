//! Debug-level logging of connection traffic.
//!
//! Events are written to the `wsnext::traffic` target so they can be
//! enabled independently, for example with
//! `RUST_LOG=wsnext::traffic=debug`.

// ============================================================================
// Imports
// ============================================================================

use std::borrow::Cow;

use tracing::debug;

use crate::config::TrafficLoggingConfig;
use crate::connection::{CloseReason, Connection};

// ============================================================================
// TrafficLogger
// ============================================================================

/// Logs opened and closed connections and every message in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficLogger {
    text_payload_limit: usize,
}

impl TrafficLogger {
    /// Creates a logger that prints at most `text_payload_limit` characters
    /// of each text message.
    #[inline]
    #[must_use]
    pub const fn new(text_payload_limit: usize) -> Self {
        Self { text_payload_limit }
    }

    /// Returns a logger if the configuration enables one.
    #[inline]
    #[must_use]
    pub fn from_config(config: &TrafficLoggingConfig) -> Option<Self> {
        config
            .enabled
            .then(|| Self::new(config.text_payload_limit))
    }

    pub(crate) fn connection_opened(&self, connection: &Connection) {
        debug!(
            target: "wsnext::traffic",
            connection_id = %connection.id(),
            endpoint = %connection.endpoint_id(),
            kind = ?connection.kind(),
            path = connection.handshake_request().path(),
            "connection opened"
        );
    }

    pub(crate) fn connection_closed(&self, connection: &Connection, reason: &CloseReason) {
        debug!(
            target: "wsnext::traffic",
            connection_id = %connection.id(),
            endpoint = %connection.endpoint_id(),
            reason = %reason,
            "connection closed"
        );
    }

    pub(crate) fn text_received(&self, connection: &Connection, text: &str) {
        debug!(
            target: "wsnext::traffic",
            connection_id = %connection.id(),
            endpoint = %connection.endpoint_id(),
            payload = %self.truncate(text),
            "text message received"
        );
    }

    pub(crate) fn text_sent(&self, connection: &Connection, text: &str) {
        debug!(
            target: "wsnext::traffic",
            connection_id = %connection.id(),
            endpoint = %connection.endpoint_id(),
            payload = %self.truncate(text),
            "text message sent"
        );
    }

    pub(crate) fn binary_received(&self, connection: &Connection, len: usize) {
        debug!(
            target: "wsnext::traffic",
            connection_id = %connection.id(),
            endpoint = %connection.endpoint_id(),
            bytes = len,
            "binary message received"
        );
    }

    pub(crate) fn binary_sent(&self, connection: &Connection, len: usize) {
        debug!(
            target: "wsnext::traffic",
            connection_id = %connection.id(),
            endpoint = %connection.endpoint_id(),
            bytes = len,
            "binary message sent"
        );
    }

    fn truncate<'a>(&self, text: &'a str) -> Cow<'a, str> {
        match text.char_indices().nth(self.text_payload_limit) {
            Some((end, _)) => Cow::Owned(format!("{}...", &text[..end])),
            None => Cow::Borrowed(text),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config() {
        assert!(TrafficLogger::from_config(&TrafficLoggingConfig::disabled()).is_none());
        assert_eq!(
            TrafficLogger::from_config(&TrafficLoggingConfig::enabled(3)),
            Some(TrafficLogger::new(3))
        );
    }

    #[test]
    fn test_truncate_counts_characters() {
        let logger = TrafficLogger::new(3);
        assert_eq!(logger.truncate("héllo"), "hél...");
        assert_eq!(logger.truncate("abc"), "abc");
        assert!(matches!(logger.truncate("ab"), Cow::Borrowed(_)));
    }
}
