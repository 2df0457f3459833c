//! # Pairlock DPoP - proof-of-possession verification
//!
//! Verification of detached, self-certifying proof-of-possession assertions
//! in the style of RFC 9449 (DPoP). A client signs a short-lived compact JWT
//! over the HTTP method and URL it is about to call, embedding its public key
//! in the protected header. The verifier checks the signature against that
//! embedded key and, when the caller supplies an expected JWK thumbprint,
//! binds the proof to a previously registered key rather than any key an
//! attacker could mint on the spot.
//!
//! ## Security Notice
//!
//! Only EdDSA over Ed25519 is accepted. The verifier is stateless: callers
//! that need single-use `jti` semantics layer their own replay tracking on
//! top of the returned [`VerifiedProof`].
//!
//! ## Architecture
//!
//! - `errors` - proof verification error types
//! - `types` - JWK, payload, and verified-proof types plus thumbprints
//! - `verify` - the stateless [`DpopVerifier`]
//! - `test_utils` - client-side proof signing (feature-gated: `test-utils`)

pub mod errors;
pub mod types;
pub mod verify;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use errors::DpopError;
pub use types::{access_token_hash, DpopJwk, DpopPayload, VerifiedProof};
pub use verify::{canonical_htu, DpopVerifier, VerifyOptions};

/// DPoP result type
pub type Result<T> = std::result::Result<T, DpopError>;

/// DPoP JWT header type as defined in RFC 9449
pub const DPOP_JWT_TYPE: &str = "dpop+jwt";

/// Default maximum accepted proof age (2 minutes)
pub const DEFAULT_PROOF_MAX_AGE_SECONDS: u64 = 120;

/// Default clock skew tolerance (5 seconds)
pub const DEFAULT_CLOCK_SKEW_SECONDS: u64 = 5;

/// Raw Ed25519 public key length in bytes
pub const ED25519_PUBLIC_KEY_LEN: usize = 32;
