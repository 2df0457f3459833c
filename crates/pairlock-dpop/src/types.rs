//! Core DPoP types
//!
//! JWK representation for the embedded proof key, the proof payload shape,
//! and RFC 7638 thumbprint computation. Only OKP/Ed25519 keys are modeled;
//! any other key type is rejected at deserialization or validation time.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{errors::DpopError, Result, ED25519_PUBLIC_KEY_LEN};

/// JSON Web Key embedded in a proof header
///
/// Tagged on `kty` so foreign key types fail to parse instead of silently
/// matching a variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kty")]
pub enum DpopJwk {
    /// Octet key pair (Ed25519) public key in JWK format
    #[serde(rename = "OKP")]
    Okp {
        /// Curve name - always "Ed25519" for EdDSA proofs
        crv: String,

        /// Raw public key (base64url-encoded, 32 bytes)
        x: String,
    },
}

impl DpopJwk {
    /// Build a JWK from a raw 32-byte Ed25519 public key
    ///
    /// # Errors
    /// Returns [`DpopError::InvalidProofStructure`] if the key is not exactly
    /// 32 bytes long.
    pub fn from_ed25519_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() != ED25519_PUBLIC_KEY_LEN {
            return Err(DpopError::InvalidProofStructure {
                reason: format!(
                    "Ed25519 public key must be {} bytes, got {}",
                    ED25519_PUBLIC_KEY_LEN,
                    raw.len()
                ),
            });
        }
        Ok(Self::Okp {
            crv: "Ed25519".to_string(),
            x: URL_SAFE_NO_PAD.encode(raw),
        })
    }

    /// Decode the raw public key bytes out of this JWK
    ///
    /// # Errors
    /// Returns [`DpopError::InvalidProofStructure`] for a non-Ed25519 curve,
    /// undecodable base64, or a key of the wrong length.
    pub fn ed25519_bytes(&self) -> Result<[u8; ED25519_PUBLIC_KEY_LEN]> {
        let Self::Okp { crv, x } = self;
        if crv != "Ed25519" {
            return Err(DpopError::InvalidProofStructure {
                reason: format!("unsupported OKP curve: {crv}"),
            });
        }
        let raw = URL_SAFE_NO_PAD
            .decode(x)
            .map_err(|e| DpopError::InvalidProofStructure {
                reason: format!("JWK x coordinate is not base64url: {e}"),
            })?;
        raw.try_into().map_err(|raw: Vec<u8>| DpopError::InvalidProofStructure {
            reason: format!(
                "Ed25519 public key must be {} bytes, got {}",
                ED25519_PUBLIC_KEY_LEN,
                raw.len()
            ),
        })
    }

    /// The base64url-encoded public key coordinate
    #[must_use]
    pub fn x(&self) -> &str {
        let Self::Okp { x, .. } = self;
        x
    }

    /// Compute the RFC 7638 thumbprint of this key
    ///
    /// The canonical member set for OKP keys is `{"crv","kty","x"}` in
    /// lexicographic order (RFC 8037 section 2).
    ///
    /// # Errors
    /// Returns [`DpopError::CryptographicError`] if canonical serialization fails.
    pub fn thumbprint(&self) -> Result<String> {
        let Self::Okp { crv, x } = self;
        let canonical = serde_json::json!({
            "crv": crv,
            "kty": "OKP",
            "x": x,
        });
        let canonical_json =
            serde_json::to_string(&canonical).map_err(|e| DpopError::CryptographicError {
                reason: format!("failed to serialize JWK for thumbprint: {e}"),
            })?;

        let mut hasher = Sha256::new();
        hasher.update(canonical_json.as_bytes());
        Ok(URL_SAFE_NO_PAD.encode(hasher.finalize()))
    }
}

/// DPoP JWT payload as defined in RFC 9449
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DpopPayload {
    /// JWT ID - unique per proof, available for caller-side replay tracking
    pub jti: String,

    /// HTTP method being bound to this proof
    pub htm: String,

    /// HTTP URL being bound to this proof (no query or fragment)
    pub htu: String,

    /// Issued-at timestamp (Unix seconds)
    pub iat: i64,

    /// Access token hash (when binding to a presented token)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ath: Option<String>,

    /// Server-provided nonce (carried, not enforced)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// Outcome of a successful proof verification
///
/// Transient by design: consumed immediately by the caller to compare
/// against an expected binding, never persisted.
#[derive(Debug, Clone)]
pub struct VerifiedProof {
    /// RFC 7638 thumbprint of the embedded key
    pub thumbprint: String,

    /// The embedded public key
    pub jwk: DpopJwk,

    /// Unique proof identifier
    pub jti: String,

    /// Issued-at timestamp (Unix seconds)
    pub iat: i64,

    /// Access token hash, when the proof carried one
    pub ath: Option<String>,
}

/// Compute the `ath` binding hash of an access token
///
/// base64url-encoded SHA-256 over the ASCII token, per RFC 9449 section 4.3.
#[must_use]
pub fn access_token_hash(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Constant-time string comparison for hashes and thumbprints
pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    use subtle::ConstantTimeEq;
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
