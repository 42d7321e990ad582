//! Error types for the WebSocket core.
//!
//! Every failure in the crate is a variant of one [`Error`] enum.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use wsnext::{Connection, Result};
//!
//! async fn greet(connection: &Connection) -> Result<()> {
//!     connection.send_text("hello").await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`], [`Error::EndpointNotFound`] |
//! | Connection | [`Error::Connection`], [`Error::ConnectionClosed`], [`Error::Protocol`] |
//! | Codec | [`Error::TextEncode`], [`Error::TextDecode`], [`Error::BinaryEncode`], [`Error::BinaryDecode`] |
//! | Security | [`Error::Unauthorized`], [`Error::Forbidden`], [`Error::AuthenticationExpired`] |
//! | Callback | [`Error::Callback`], [`Error::CallbackPanicked`] |
//! | Fan-out | [`Error::Broadcast`], [`Error::Unsupported`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::{Error as IoError, ErrorKind};
use std::result::Result as StdResult;

use thiserror::Error;
use tokio::sync::oneshot::error::RecvError;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::identifiers::{ConnectionId, EndpointId};

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when endpoint definitions or deployment settings are invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// No endpoint registered under the identifier.
    #[error("Endpoint not found: {endpoint_id}")]
    EndpointNotFound {
        /// The unknown endpoint identifier.
        endpoint_id: EndpointId,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Transport-level connection failure.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// The connection is closed; nothing can be sent on it anymore.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Protocol violation or unexpected transport state.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    // ========================================================================
    // Codec Errors
    // ========================================================================
    /// Encoding a value into a text message failed.
    #[error("Unable to encode {type_name} as text message: {message}")]
    TextEncode {
        /// Rust type that was being encoded.
        type_name: &'static str,
        /// Cause reported by the codec.
        message: String,
    },

    /// Decoding a text message into a value failed.
    #[error("Unable to decode text message as {type_name}: {message}")]
    TextDecode {
        /// Rust type that was requested.
        type_name: &'static str,
        /// Cause reported by the codec.
        message: String,
    },

    /// Encoding a value into a binary message failed.
    #[error("Unable to encode {type_name} as binary message: {message}")]
    BinaryEncode {
        /// Rust type that was being encoded.
        type_name: &'static str,
        /// Cause reported by the codec.
        message: String,
    },

    /// Decoding a binary message into a value failed.
    #[error("Unable to decode binary message as {type_name}: {message}")]
    BinaryDecode {
        /// Rust type that was requested.
        type_name: &'static str,
        /// Cause reported by the codec.
        message: String,
    },

    // ========================================================================
    // Security Errors
    // ========================================================================
    /// The peer is not authenticated.
    #[error("Unauthorized: {message}")]
    Unauthorized {
        /// Description of the authentication failure.
        message: String,
    },

    /// The peer is authenticated but not allowed.
    #[error("Forbidden: {message}")]
    Forbidden {
        /// Description of the authorization failure.
        message: String,
    },

    /// The security identity attached to the connection expired.
    #[error("Authentication expired")]
    AuthenticationExpired,

    // ========================================================================
    // Callback Errors
    // ========================================================================
    /// Application callback returned a failure.
    #[error("Callback failed: {message}")]
    Callback {
        /// Description supplied by the application.
        message: String,
    },

    /// Application callback panicked.
    #[error("Callback {callback} panicked: {message}")]
    CallbackPanicked {
        /// Callback category that panicked.
        callback: &'static str,
        /// Panic payload, if it was a string.
        message: String,
    },

    // ========================================================================
    // Fan-out Errors
    // ========================================================================
    /// Some sends of a broadcast failed for reasons other than a closed peer.
    #[error("Broadcast failed for {failed} of {total} connections: {first}")]
    Broadcast {
        /// Number of failed sends.
        failed: usize,
        /// Number of targeted connections.
        total: usize,
        /// Connection of the first failure.
        connection_id: ConnectionId,
        /// First failure.
        first: Box<Error>,
    },

    /// The operation is not supported in this context.
    #[error("Unsupported operation: {operation}")]
    Unsupported {
        /// Name of the rejected operation.
        operation: &'static str,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Channel receive error.
    #[error("Channel closed")]
    ChannelClosed(#[from] RecvError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an endpoint not found error.
    #[inline]
    pub fn endpoint_not_found(endpoint_id: EndpointId) -> Self {
        Self::EndpointNotFound { endpoint_id }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a text encode error for `T`.
    #[inline]
    pub fn text_encode<T: ?Sized>(message: impl Into<String>) -> Self {
        Self::TextEncode {
            type_name: std::any::type_name::<T>(),
            message: message.into(),
        }
    }

    /// Creates a text decode error for `T`.
    #[inline]
    pub fn text_decode<T: ?Sized>(message: impl Into<String>) -> Self {
        Self::TextDecode {
            type_name: std::any::type_name::<T>(),
            message: message.into(),
        }
    }

    /// Creates a binary encode error for `T`.
    #[inline]
    pub fn binary_encode<T: ?Sized>(message: impl Into<String>) -> Self {
        Self::BinaryEncode {
            type_name: std::any::type_name::<T>(),
            message: message.into(),
        }
    }

    /// Creates a binary decode error for `T`.
    #[inline]
    pub fn binary_decode<T: ?Sized>(message: impl Into<String>) -> Self {
        Self::BinaryDecode {
            type_name: std::any::type_name::<T>(),
            message: message.into(),
        }
    }

    /// Creates an unauthorized error.
    #[inline]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    /// Creates a forbidden error.
    #[inline]
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    /// Creates an application callback error.
    #[inline]
    pub fn callback(message: impl Into<String>) -> Self {
        Self::Callback {
            message: message.into(),
        }
    }

    /// Creates a callback panicked error.
    #[inline]
    pub fn callback_panicked(callback: &'static str, message: impl Into<String>) -> Self {
        Self::CallbackPanicked {
            callback,
            message: message.into(),
        }
    }

    /// Creates an unsupported operation error.
    #[inline]
    pub fn unsupported(operation: &'static str) -> Self {
        Self::Unsupported { operation }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if the error means the channel was already closed.
    ///
    /// Broadcast and best-effort close paths treat these as benign.
    #[must_use]
    pub fn is_closed_channel(&self) -> bool {
        match self {
            Self::ConnectionClosed | Self::ChannelClosed(_) => true,
            Self::WebSocket(WsError::ConnectionClosed | WsError::AlreadyClosed) => true,
            Self::WebSocket(WsError::Io(e)) | Self::Io(e) => matches!(
                e.kind(),
                ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }

    /// Returns `true` if this is an authentication or authorization failure.
    #[inline]
    #[must_use]
    pub fn is_security_error(&self) -> bool {
        matches!(
            self,
            Self::Unauthorized { .. } | Self::Forbidden { .. } | Self::AuthenticationExpired
        )
    }

    /// Returns `true` if this is an encode or decode failure.
    #[inline]
    #[must_use]
    pub fn is_codec_error(&self) -> bool {
        matches!(
            self,
            Self::TextEncode { .. }
                | Self::TextDecode { .. }
                | Self::BinaryEncode { .. }
                | Self::BinaryDecode { .. }
        )
    }

    /// Returns `true` if this is a connection-level error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionClosed
                | Self::Protocol { .. }
                | Self::WebSocket(_)
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::connection("refused");
        assert_eq!(err.to_string(), "Connection failed: refused");
    }

    #[test]
    fn test_codec_error_names_type() {
        let err = Error::text_decode::<u32>("expected number");
        assert_eq!(
            err.to_string(),
            "Unable to decode text message as u32: expected number"
        );
        assert!(err.is_codec_error());
        assert!(!Error::config("x").is_codec_error());
    }

    #[test]
    fn test_is_closed_channel() {
        assert!(Error::ConnectionClosed.is_closed_channel());
        assert!(Error::WebSocket(WsError::AlreadyClosed).is_closed_channel());
        assert!(Error::WebSocket(WsError::ConnectionClosed).is_closed_channel());
        assert!(Error::Io(IoError::new(ErrorKind::BrokenPipe, "pipe")).is_closed_channel());
        assert!(!Error::Io(IoError::new(ErrorKind::NotFound, "nope")).is_closed_channel());
        assert!(!Error::protocol("bad frame").is_closed_channel());
    }

    #[test]
    fn test_is_security_error() {
        assert!(Error::unauthorized("no token").is_security_error());
        assert!(Error::forbidden("no role").is_security_error());
        assert!(Error::AuthenticationExpired.is_security_error());
        assert!(!Error::callback("boom").is_security_error());
    }

    #[test]
    fn test_is_connection_error() {
        assert!(Error::ConnectionClosed.is_connection_error());
        assert!(Error::protocol("x").is_connection_error());
        assert!(!Error::unsupported("ping").is_connection_error());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
