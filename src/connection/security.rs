//! Security identity attached to a connection.
//!
//! The identity is established before the connection opens, by an
//! [`IdentityProvider`] looking at the upgrade request, and may be replaced
//! later with [`Connection::update_security_identity`]. When the current
//! identity carries an expiry, the connection is closed with
//! [`CloseReason::POLICY_VIOLATION`] once it passes.
//!
//! [`Connection::update_security_identity`]: crate::Connection::update_security_identity
//! [`CloseReason::POLICY_VIOLATION`]: crate::CloseReason::POLICY_VIOLATION

// ============================================================================
// Imports
// ============================================================================

use std::time::{Duration, SystemTime};

use async_trait::async_trait;

use crate::connection::HandshakeRequest;
use crate::error::Result;

// ============================================================================
// SecurityIdentity
// ============================================================================

/// Authenticated principal and its roles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityIdentity {
    principal: String,
    roles: Vec<String>,
    expires_at: Option<SystemTime>,
}

impl SecurityIdentity {
    /// Creates an identity for `principal` with no roles and no expiry.
    #[must_use]
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            roles: Vec::new(),
            expires_at: None,
        }
    }

    /// Adds a role.
    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    /// Sets an absolute expiry.
    #[must_use]
    pub fn with_expiry(mut self, expires_at: SystemTime) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Sets an expiry relative to now.
    #[must_use]
    pub fn expiring_in(self, ttl: Duration) -> Self {
        self.with_expiry(SystemTime::now() + ttl)
    }

    /// Returns the principal name.
    #[inline]
    #[must_use]
    pub fn principal(&self) -> &str {
        &self.principal
    }

    /// Returns the roles.
    #[inline]
    #[must_use]
    pub fn roles(&self) -> &[String] {
        &self.roles
    }

    /// Returns `true` if the identity holds `role`.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// Returns the expiry, if any.
    #[inline]
    #[must_use]
    pub fn expires_at(&self) -> Option<SystemTime> {
        self.expires_at
    }

    /// Returns `true` if the identity expired at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

// ============================================================================
// IdentityProvider
// ============================================================================

/// Resolves the identity of an incoming connection.
///
/// Returning `Ok(None)` opens the connection anonymously. Returning
/// [`Error::Unauthorized`](crate::Error::Unauthorized) or
/// [`Error::Forbidden`](crate::Error::Forbidden) rejects it with a
/// policy-violation close before any callback runs.
#[async_trait]
pub trait IdentityProvider: Send + Sync + 'static {
    /// Inspects the upgrade request.
    async fn identity(&self, handshake: &HandshakeRequest) -> Result<Option<SecurityIdentity>>;
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles() {
        let identity = SecurityIdentity::new("ann").with_role("admin");
        assert_eq!(identity.principal(), "ann");
        assert!(identity.has_role("admin"));
        assert!(!identity.has_role("user"));
    }

    #[test]
    fn test_expiry() {
        let now = SystemTime::now();
        let identity = SecurityIdentity::new("ann").with_expiry(now);
        assert!(identity.is_expired_at(now));
        assert!(!identity.is_expired_at(now - Duration::from_secs(1)));
        assert!(!SecurityIdentity::new("bob").is_expired_at(now));
    }
}
