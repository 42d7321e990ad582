//! Connections and everything attached to them.
//!
//! A [`Connection`] is created for every accepted or opened channel and
//! lives until the transport reports closure and the close callback ran.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `close` | [`CloseReason`] and status code constants |
//! | `core` | The [`Connection`] handle |
//! | `handshake` | [`HandshakeRequest`] snapshot of the upgrade |
//! | `security` | [`SecurityIdentity`] and [`IdentityProvider`] |
//! | `sender` | [`BroadcastSender`] |
//! | `traffic` | [`TrafficLogger`] |
//! | `user_data` | [`UserData`] and [`TypedKey`] |

// ============================================================================
// Submodules
// ============================================================================

/// Close reasons.
pub mod close;

/// Connection handle.
pub mod core;

/// Upgrade request snapshot.
pub mod handshake;

/// Security identity.
pub mod security;

/// Broadcast sender.
pub mod sender;

/// Traffic logging.
pub mod traffic;

/// Typed user data.
pub mod user_data;

// ============================================================================
// Re-exports
// ============================================================================

pub use close::CloseReason;
pub use core::{Connection, ConnectionKind, PathParams};
pub use handshake::HandshakeRequest;
pub use security::{IdentityProvider, SecurityIdentity};
pub use sender::BroadcastSender;
pub use traffic::TrafficLogger;
pub use user_data::{TypedKey, UserData};

pub(crate) use core::ConnectionSettings;
