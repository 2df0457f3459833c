//! Grant flow error taxonomy
//!
//! One enum covers the whole pairing surface. Variants map one-to-one onto
//! the wire error codes a transport binding would emit; the two polling
//! variants (`AuthorizationPending`, `SlowDown`) are expected steady-state
//! responses during the flow rather than true failures.
//!
//! Proof and token verification failures deliberately collapse into the
//! bare `Unauthorized` category: the precise failing check is logged, never
//! returned, so the verifier cannot be used as an oracle.

use thiserror::Error;
use tracing::debug;

use pairlock_dpop::DpopError;

/// Result type for grant flow operations
pub type Result<T> = std::result::Result<T, GrantError>;

/// Errors surfaced by the pairing state machine and token issuance
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GrantError {
    /// Malformed input (wrong key length, missing fields)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Missing or invalid proof, bad signature, key mismatch, or a bad
    /// token claim - intentionally carries no detail
    #[error("unauthorized")]
    Unauthorized,

    /// The caller is authenticated but not allowed to proceed
    #[error("forbidden")]
    Forbidden,

    /// The session is in a state that does not admit this transition
    #[error("conflict")]
    Conflict,

    /// The session or token has passed its expiry
    #[error("gone")]
    Gone,

    /// No session or device matches the supplied code or id
    #[error("not found")]
    NotFound,

    /// The human principal has not yet approved the session
    #[error("authorization pending")]
    AuthorizationPending,

    /// The device polled faster than its negotiated interval
    #[error("slow down: poll every {interval}s")]
    SlowDown {
        /// New minimum polling interval in seconds, already persisted
        interval: u32,
    },

    /// CSR-based enrollment is explicitly unsupported
    #[error("unsupported grant type")]
    UnsupportedGrantType,

    /// The process signing key is unconfigured in a production runtime;
    /// key operations must abort entirely, not degrade
    #[error("fatal configuration error: {0}")]
    Fatal(String),

    /// Persistence layer failure
    #[error("storage error: {0}")]
    Storage(String),
}

impl GrantError {
    /// Wire identifier for this error category
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::Conflict => "conflict",
            Self::Gone => "expired",
            Self::NotFound => "not_found",
            Self::AuthorizationPending => "authorization_pending",
            Self::SlowDown { .. } => "slow_down",
            Self::UnsupportedGrantType => "unsupported_grant_type",
            Self::Fatal(_) => "server_error",
            Self::Storage(_) => "server_error",
        }
    }

    /// Whether a polling device should simply try again later
    #[must_use]
    pub fn is_retryable_poll(&self) -> bool {
        matches!(self, Self::AuthorizationPending | Self::SlowDown { .. })
    }
}

impl From<DpopError> for GrantError {
    fn from(err: DpopError) -> Self {
        // Log the precise cause, return only the category
        debug!(cause = %err, "proof verification failed");
        Self::Unauthorized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proof_failures_collapse_to_unauthorized() {
        let err: GrantError = DpopError::KeyBindingFailed.into();
        assert_eq!(err, GrantError::Unauthorized);

        let err: GrantError = DpopError::AccessTokenHashFailed.into();
        assert_eq!(err, GrantError::Unauthorized);
    }

    #[test]
    fn polling_variants_are_retryable() {
        assert!(GrantError::AuthorizationPending.is_retryable_poll());
        assert!(GrantError::SlowDown { interval: 10 }.is_retryable_poll());
        assert!(!GrantError::Gone.is_retryable_poll());
    }

    #[test]
    fn wire_codes_are_stable() {
        assert_eq!(GrantError::UnsupportedGrantType.error_code(), "unsupported_grant_type");
        assert_eq!(GrantError::SlowDown { interval: 10 }.error_code(), "slow_down");
        assert_eq!(GrantError::AuthorizationPending.error_code(), "authorization_pending");
    }
}
