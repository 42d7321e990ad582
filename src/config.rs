//! Deployment configuration for server and client endpoints.
//!
//! Provides a type-safe interface for the settings that govern connection
//! behaviour: failure policy, traffic logging, keep-alive pings, buffer
//! sizes and scope activation.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use wsnext::config::{EndpointsConfig, WebSocketsConfig};
//! use wsnext::UnhandledFailureStrategy;
//!
//! let config = WebSocketsConfig::new().with_server(
//!     EndpointsConfig::new()
//!         .with_auto_ping_interval(Duration::from_secs(30))
//!         .with_unhandled_failure_strategy(UnhandledFailureStrategy::Log),
//! );
//! assert_eq!(config.server.auto_ping_interval(), Some(Duration::from_secs(30)));
//! ```
//!
//! Configuration can also be loaded from JSON with kebab-case keys:
//!
//! ```
//! use wsnext::config::WebSocketsConfig;
//!
//! let config = WebSocketsConfig::from_json(
//!     r#"{ "server": { "dev-mode": true, "stream-buffer-size": 16 } }"#,
//! )?;
//! assert!(config.server.dev_mode);
//! assert_eq!(config.server.stream_buffer_size, 16);
//! # Ok::<(), wsnext::Error>(())
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::runtime::UnhandledFailureStrategy;

// ============================================================================
// Constants
// ============================================================================

/// Default number of characters of a text payload written by the traffic logger.
pub const DEFAULT_TEXT_PAYLOAD_LIMIT: usize = 100;

/// Default capacity of a message stream before backpressure applies.
pub const DEFAULT_STREAM_BUFFER_SIZE: usize = 256;

/// Default capacity of the transport's inbound frame queue.
pub const DEFAULT_INBOUND_BUFFER_SIZE: usize = 64;

/// Default time a peer has to answer a close frame, in milliseconds.
pub const DEFAULT_CLOSING_TIMEOUT_MS: u64 = 10_000;

// ============================================================================
// WebSocketsConfig
// ============================================================================

/// Configuration for both sides of the deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct WebSocketsConfig {
    /// Settings applied to server endpoints.
    pub server: EndpointsConfig,

    /// Settings applied to client endpoints.
    pub client: EndpointsConfig,
}

impl WebSocketsConfig {
    /// Creates a configuration with default settings on both sides.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            server: EndpointsConfig::new(),
            client: EndpointsConfig::new(),
        }
    }

    /// Parses a configuration from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if the document is malformed and
    /// [`Error::Config`] if a value is out of range.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Replaces the server settings.
    #[inline]
    #[must_use]
    pub fn with_server(mut self, server: EndpointsConfig) -> Self {
        self.server = server;
        self
    }

    /// Replaces the client settings.
    #[inline]
    #[must_use]
    pub fn with_client(mut self, client: EndpointsConfig) -> Self {
        self.client = client;
        self
    }

    /// Checks that both sides hold usable values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first offending setting.
    pub fn validate(&self) -> Result<()> {
        self.server.validate("server")?;
        self.client.validate("client")
    }
}

// ============================================================================
// TrafficLoggingConfig
// ============================================================================

/// Settings of the debug-level traffic logger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TrafficLoggingConfig {
    /// Log opened/closed connections and every message.
    pub enabled: bool,

    /// Maximum number of characters of a text payload included in the log.
    pub text_payload_limit: usize,
}

impl TrafficLoggingConfig {
    /// Traffic logging turned off.
    #[inline]
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            enabled: false,
            text_payload_limit: DEFAULT_TEXT_PAYLOAD_LIMIT,
        }
    }

    /// Traffic logging turned on with the given payload limit.
    #[inline]
    #[must_use]
    pub const fn enabled(text_payload_limit: usize) -> Self {
        Self {
            enabled: true,
            text_payload_limit,
        }
    }
}

impl Default for TrafficLoggingConfig {
    fn default() -> Self {
        Self::disabled()
    }
}

// ============================================================================
// EndpointsConfig
// ============================================================================

/// Settings shared by every endpoint of one side (server or client).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct EndpointsConfig {
    /// What happens to failures no `on_error` callback handles.
    pub unhandled_failure_strategy: UnhandledFailureStrategy,

    /// Include failure messages in close frames sent to the peer.
    ///
    /// Meant for development and tests only.
    pub dev_mode: bool,

    /// Traffic logger settings.
    pub traffic_logging: TrafficLoggingConfig,

    /// Interval of automatic ping frames in milliseconds.
    pub auto_ping_interval_ms: Option<u64>,

    /// Maximum size of an inbound message in bytes.
    pub max_message_size: Option<usize>,

    /// Capacity of text and binary message streams.
    pub stream_buffer_size: usize,

    /// Capacity of the inbound frame queue between transport and dispatcher.
    pub inbound_buffer_size: usize,

    /// Time the peer has to answer our close frame, in milliseconds.
    ///
    /// The socket is dropped and the connection reported closed once it
    /// elapses.
    pub closing_timeout_ms: u64,

    /// Activate the request scope around every callback.
    pub activate_request_scope: bool,

    /// Maintain connection and message counters.
    pub metrics_enabled: bool,
}

impl EndpointsConfig {
    /// Creates settings with default values.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            unhandled_failure_strategy: UnhandledFailureStrategy::LogAndClose,
            dev_mode: false,
            traffic_logging: TrafficLoggingConfig::disabled(),
            auto_ping_interval_ms: None,
            max_message_size: None,
            stream_buffer_size: DEFAULT_STREAM_BUFFER_SIZE,
            inbound_buffer_size: DEFAULT_INBOUND_BUFFER_SIZE,
            closing_timeout_ms: DEFAULT_CLOSING_TIMEOUT_MS,
            activate_request_scope: false,
            metrics_enabled: false,
        }
    }

    /// Returns the auto-ping interval, if configured.
    #[inline]
    #[must_use]
    pub fn auto_ping_interval(&self) -> Option<Duration> {
        self.auto_ping_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// Returns the closing handshake timeout.
    #[inline]
    #[must_use]
    pub fn closing_timeout(&self) -> Duration {
        Duration::from_millis(self.closing_timeout_ms)
    }

    fn validate(&self, side: &str) -> Result<()> {
        if self.stream_buffer_size == 0 {
            return Err(Error::config(format!(
                "{side}.stream-buffer-size must be greater than zero"
            )));
        }
        if self.inbound_buffer_size == 0 {
            return Err(Error::config(format!(
                "{side}.inbound-buffer-size must be greater than zero"
            )));
        }
        if self.closing_timeout_ms == 0 {
            return Err(Error::config(format!(
                "{side}.closing-timeout-ms must be greater than zero"
            )));
        }
        if self.max_message_size == Some(0) {
            return Err(Error::config(format!(
                "{side}.max-message-size must be greater than zero"
            )));
        }
        Ok(())
    }
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl EndpointsConfig {
    /// Sets the unhandled failure strategy.
    #[inline]
    #[must_use]
    pub fn with_unhandled_failure_strategy(mut self, strategy: UnhandledFailureStrategy) -> Self {
        self.unhandled_failure_strategy = strategy;
        self
    }

    /// Enables development mode.
    #[inline]
    #[must_use]
    pub fn with_dev_mode(mut self) -> Self {
        self.dev_mode = true;
        self
    }

    /// Enables traffic logging with the given text payload limit.
    #[inline]
    #[must_use]
    pub fn with_traffic_logging(mut self, text_payload_limit: usize) -> Self {
        self.traffic_logging = TrafficLoggingConfig::enabled(text_payload_limit);
        self
    }

    /// Sets the auto-ping interval.
    #[inline]
    #[must_use]
    pub fn with_auto_ping_interval(mut self, interval: Duration) -> Self {
        self.auto_ping_interval_ms = Some(interval.as_millis() as u64);
        self
    }

    /// Sets the maximum inbound message size.
    #[inline]
    #[must_use]
    pub fn with_max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = Some(bytes);
        self
    }

    /// Sets the closing handshake timeout.
    #[inline]
    #[must_use]
    pub fn with_closing_timeout(mut self, timeout: Duration) -> Self {
        self.closing_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Sets the message stream capacity.
    #[inline]
    #[must_use]
    pub fn with_stream_buffer_size(mut self, size: usize) -> Self {
        self.stream_buffer_size = size;
        self
    }

    /// Sets the inbound frame queue capacity.
    #[inline]
    #[must_use]
    pub fn with_inbound_buffer_size(mut self, size: usize) -> Self {
        self.inbound_buffer_size = size;
        self
    }

    /// Activates the request scope around every callback.
    #[inline]
    #[must_use]
    pub fn with_request_scope(mut self) -> Self {
        self.activate_request_scope = true;
        self
    }

    /// Enables connection and message counters.
    #[inline]
    #[must_use]
    pub fn with_metrics(mut self) -> Self {
        self.metrics_enabled = true;
        self
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EndpointsConfig::default();
        assert_eq!(
            config.unhandled_failure_strategy,
            UnhandledFailureStrategy::LogAndClose
        );
        assert!(!config.dev_mode);
        assert!(!config.traffic_logging.enabled);
        assert_eq!(config.auto_ping_interval(), None);
        assert_eq!(config.stream_buffer_size, DEFAULT_STREAM_BUFFER_SIZE);
        assert_eq!(config.closing_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_builder_methods_chain() {
        let config = EndpointsConfig::new()
            .with_dev_mode()
            .with_traffic_logging(10)
            .with_max_message_size(1024)
            .with_request_scope()
            .with_metrics();

        assert!(config.dev_mode);
        assert_eq!(config.traffic_logging, TrafficLoggingConfig::enabled(10));
        assert_eq!(config.max_message_size, Some(1024));
        assert!(config.activate_request_scope);
        assert!(config.metrics_enabled);
    }

    #[test]
    fn test_zero_ping_interval_is_disabled() {
        let mut config = EndpointsConfig::new();
        config.auto_ping_interval_ms = Some(0);
        assert_eq!(config.auto_ping_interval(), None);
    }

    #[test]
    fn test_from_json_kebab_case() {
        let config = WebSocketsConfig::from_json(
            r#"{
                "server": {
                    "unhandled-failure-strategy": "close",
                    "traffic-logging": { "enabled": true, "text-payload-limit": 5 },
                    "auto-ping-interval-ms": 1500
                },
                "client": { "metrics-enabled": true }
            }"#,
        )
        .expect("valid config");

        assert_eq!(
            config.server.unhandled_failure_strategy,
            UnhandledFailureStrategy::Close
        );
        assert_eq!(config.server.traffic_logging.text_payload_limit, 5);
        assert_eq!(
            config.server.auto_ping_interval(),
            Some(Duration::from_millis(1500))
        );
        assert!(config.client.metrics_enabled);
        assert!(!config.server.metrics_enabled);
    }

    #[test]
    fn test_from_json_rejects_zero_buffer() {
        let err = WebSocketsConfig::from_json(r#"{ "client": { "stream-buffer-size": 0 } }"#)
            .unwrap_err();
        assert!(err.to_string().contains("client.stream-buffer-size"));
    }

    #[test]
    fn test_closing_timeout_must_be_positive() {
        let config = EndpointsConfig::new().with_closing_timeout(Duration::from_millis(250));
        assert_eq!(config.closing_timeout_ms, 250);

        let err = WebSocketsConfig::from_json(r#"{ "server": { "closing-timeout-ms": 0 } }"#)
            .unwrap_err();
        assert!(err.to_string().contains("server.closing-timeout-ms"));
    }

    #[test]
    fn test_from_json_rejects_malformed() {
        let err = WebSocketsConfig::from_json("{ not json").unwrap_err();
        assert!(matches!(err, Error::Json(_)));
    }
}
