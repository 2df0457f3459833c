//! DPoP-specific error types
//!
//! Every variant carries an internal reason suitable for structured logging.
//! Callers that surface errors to clients should collapse all variants into a
//! single unauthorized category so the specific failing check is not leaked.

use thiserror::Error;

/// Errors produced while verifying a proof-of-possession assertion
#[derive(Error, Debug, Clone)]
pub enum DpopError {
    /// The proof is not a well-formed DPoP JWT
    #[error("invalid proof structure: {reason}")]
    InvalidProofStructure {
        /// What made the proof malformed
        reason: String,
    },

    /// Signature verification against the embedded key failed
    #[error("proof validation failed: {reason}")]
    ProofValidationFailed {
        /// Why the cryptographic check failed
        reason: String,
    },

    /// The proof's `htm`/`htu` claims do not match the request
    #[error("HTTP binding failed: {reason}")]
    HttpBindingFailed {
        /// Which binding claim mismatched
        reason: String,
    },

    /// The proof's `iat` falls outside the accepted window
    #[error("proof iat {iat} outside accepted window at {now}")]
    IatOutOfWindow {
        /// Issued-at claim from the proof
        iat: i64,
        /// Verifier-side timestamp the window was computed from
        now: i64,
    },

    /// The proof's `ath` claim does not match the expected token hash
    #[error("access token hash mismatch")]
    AccessTokenHashFailed,

    /// The embedded key's thumbprint does not match the expected binding
    #[error("key binding mismatch")]
    KeyBindingFailed,

    /// A cryptographic primitive failed outside of signature verification
    #[error("cryptographic error: {reason}")]
    CryptographicError {
        /// Underlying failure description
        reason: String,
    },
}
