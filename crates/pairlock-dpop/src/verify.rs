//! Stateless proof verification
//!
//! [`DpopVerifier`] validates one detached proof against the HTTP request it
//! claims to cover and an optional expected key binding. It keeps no state;
//! callers that need single-use `jti` semantics track the returned `jti`
//! themselves.

use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use tracing::debug;

use super::{
    errors::DpopError,
    types::{constant_time_eq, DpopJwk, DpopPayload, VerifiedProof},
    Result, DEFAULT_CLOCK_SKEW_SECONDS, DEFAULT_PROOF_MAX_AGE_SECONDS, DPOP_JWT_TYPE,
};

/// Per-request verification inputs
///
/// `url` must already be in canonical form (scheme + host + path, no query
/// string or fragment); see [`canonical_htu`]. The proof's `htu` is compared
/// against it exactly, so even a trailing slash difference fails.
#[derive(Debug, Clone, Copy)]
pub struct VerifyOptions<'a> {
    /// HTTP method of the request being proven
    pub method: &'a str,

    /// Canonical request URL the proof must name
    pub url: &'a str,

    /// Thumbprint of the key the proof must be signed with, if the caller
    /// has a prior binding to enforce
    pub expected_thumbprint: Option<&'a str>,

    /// `ath` value the proof must carry, if the caller is binding the proof
    /// to a presented access token
    pub expected_token_hash: Option<&'a str>,
}

impl<'a> VerifyOptions<'a> {
    /// Options with no key or token binding
    #[must_use]
    pub fn new(method: &'a str, url: &'a str) -> Self {
        Self {
            method,
            url,
            expected_thumbprint: None,
            expected_token_hash: None,
        }
    }

    /// Require the proof key to match a previously registered thumbprint
    #[must_use]
    pub fn with_thumbprint(mut self, thumbprint: &'a str) -> Self {
        self.expected_thumbprint = Some(thumbprint);
        self
    }

    /// Require the proof to carry a matching access token hash
    #[must_use]
    pub fn with_token_hash(mut self, hash: &'a str) -> Self {
        self.expected_token_hash = Some(hash);
        self
    }
}

/// Stateless verifier for self-certifying proofs
#[derive(Debug, Clone)]
pub struct DpopVerifier {
    /// Maximum accepted proof age
    max_age: Duration,
    /// Clock skew tolerance applied to both window edges
    clock_skew: Duration,
}

impl Default for DpopVerifier {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(DEFAULT_PROOF_MAX_AGE_SECONDS),
            clock_skew: Duration::from_secs(DEFAULT_CLOCK_SKEW_SECONDS),
        }
    }
}

impl DpopVerifier {
    /// Create a verifier with explicit freshness bounds
    #[must_use]
    pub fn new(max_age: Duration, clock_skew: Duration) -> Self {
        Self {
            max_age,
            clock_skew,
        }
    }

    /// Verify a compact proof against the request it claims to cover
    ///
    /// Validation order: protected header (type tag, EdDSA-only algorithm,
    /// embedded JWK), signature against the embedded key, payload shape,
    /// `htm`/`htu` binding, `iat` freshness window, optional `ath` binding,
    /// optional thumbprint binding.
    ///
    /// # Errors
    /// Returns a [`DpopError`] describing the first failing check. Callers
    /// surfacing errors to clients should collapse all variants into one
    /// unauthorized category.
    pub fn verify(&self, proof: &str, options: &VerifyOptions<'_>) -> Result<VerifiedProof> {
        let header = decode_header(proof).map_err(|e| DpopError::InvalidProofStructure {
            reason: format!("failed to decode proof header: {e}"),
        })?;

        if header.typ.as_deref() != Some(DPOP_JWT_TYPE) {
            return Err(DpopError::InvalidProofStructure {
                reason: format!("invalid JWT typ: expected '{DPOP_JWT_TYPE}', got {:?}", header.typ),
            });
        }

        // EdDSA/Ed25519 only; everything else (including "none") is rejected
        if header.alg != Algorithm::EdDSA {
            return Err(DpopError::InvalidProofStructure {
                reason: format!("algorithm {:?} not allowed for DPoP", header.alg),
            });
        }

        // The proof is self-certifying: the signer's key travels in the header
        let header_jwk = header.jwk.ok_or_else(|| DpopError::InvalidProofStructure {
            reason: "proof header missing JWK".to_string(),
        })?;
        let jwk_value =
            serde_json::to_value(&header_jwk).map_err(|e| DpopError::InvalidProofStructure {
                reason: format!("failed to serialize header JWK: {e}"),
            })?;
        let jwk: DpopJwk =
            serde_json::from_value(jwk_value).map_err(|e| DpopError::InvalidProofStructure {
                reason: format!("invalid JWK in header: {e}"),
            })?;
        // Round-trip the coordinate to enforce length and curve before use
        jwk.ed25519_bytes()?;

        let decoding_key = DecodingKey::from_ed_components(jwk.x()).map_err(|e| {
            DpopError::CryptographicError {
                reason: format!("failed to build decoding key from JWK: {e}"),
            }
        })?;

        let mut validation = Validation::new(Algorithm::EdDSA);
        validation.validate_exp = false; // DPoP proofs use iat, not exp
        validation.set_required_spec_claims(&["iat"]);

        let token_data = decode::<DpopPayload>(proof, &decoding_key, &validation).map_err(|e| {
            DpopError::ProofValidationFailed {
                reason: format!("signature verification failed: {e}"),
            }
        })?;
        let payload = token_data.claims;

        if payload.jti.is_empty() {
            return Err(DpopError::InvalidProofStructure {
                reason: "proof jti is empty".to_string(),
            });
        }

        self.check_http_binding(&payload, options)?;
        self.check_freshness(&payload)?;
        check_token_hash(&payload, options)?;

        let thumbprint = jwk.thumbprint()?;
        if let Some(expected) = options.expected_thumbprint {
            if !constant_time_eq(&thumbprint, expected) {
                return Err(DpopError::KeyBindingFailed);
            }
        }

        debug!(
            jti = %payload.jti,
            htm = %payload.htm,
            htu = %payload.htu,
            thumbprint = %thumbprint,
            "verified DPoP proof"
        );

        Ok(VerifiedProof {
            thumbprint,
            jwk,
            jti: payload.jti,
            iat: payload.iat,
            ath: payload.ath,
        })
    }

    fn check_http_binding(&self, payload: &DpopPayload, options: &VerifyOptions<'_>) -> Result<()> {
        if !payload.htm.eq_ignore_ascii_case(options.method) {
            return Err(DpopError::HttpBindingFailed {
                reason: format!(
                    "method mismatch: proof has '{}', request uses '{}'",
                    payload.htm, options.method
                ),
            });
        }

        // Exact match, no normalization: a trailing slash or query string in
        // either value is a mismatch
        if payload.htu != options.url {
            return Err(DpopError::HttpBindingFailed {
                reason: format!(
                    "URL mismatch: proof has '{}', request uses '{}'",
                    payload.htu, options.url
                ),
            });
        }

        Ok(())
    }

    fn check_freshness(&self, payload: &DpopPayload) -> Result<()> {
        let now = Utc::now().timestamp();
        let skew = self.clock_skew.as_secs() as i64;
        let oldest = now - self.max_age.as_secs() as i64 - skew;
        let newest = now + skew;

        if payload.iat < oldest || payload.iat > newest {
            return Err(DpopError::IatOutOfWindow {
                iat: payload.iat,
                now,
            });
        }

        Ok(())
    }
}

fn check_token_hash(payload: &DpopPayload, options: &VerifyOptions<'_>) -> Result<()> {
    match (options.expected_token_hash, &payload.ath) {
        (Some(expected), Some(ath)) => {
            if constant_time_eq(expected, ath) {
                Ok(())
            } else {
                Err(DpopError::AccessTokenHashFailed)
            }
        }
        // Caller binds the proof to a token but the proof does not commit
        // to one, or vice versa
        (Some(_), None) | (None, Some(_)) => Err(DpopError::AccessTokenHashFailed),
        (None, None) => Ok(()),
    }
}

/// Canonicalize a request URL for `htu` comparison
///
/// Keeps scheme, host, optional port, and path; drops query string and
/// fragment. The grant service runs incoming request URLs through this
/// before handing them to [`DpopVerifier::verify`].
///
/// # Errors
/// Returns [`DpopError::InvalidProofStructure`] if the input is not an
/// absolute HTTP(S) URL.
pub fn canonical_htu(url_str: &str) -> Result<String> {
    let url = url::Url::parse(url_str).map_err(|e| DpopError::InvalidProofStructure {
        reason: format!("invalid URL: {e}"),
    })?;

    if url.scheme() != "https" && url.scheme() != "http" {
        return Err(DpopError::InvalidProofStructure {
            reason: format!("unsupported URL scheme: {}", url.scheme()),
        });
    }

    let host = url
        .host_str()
        .ok_or_else(|| DpopError::InvalidProofStructure {
            reason: "URL missing host".to_string(),
        })?;
    let authority = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    Ok(format!("{}://{}{}", url.scheme(), authority, url.path()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{ProofParams, TestKeyPair};
    use crate::types::access_token_hash;

    const URL: &str = "https://api.example.com/devices/token";

    #[test]
    fn valid_proof_passes_and_reports_thumbprint() {
        let key = TestKeyPair::generate();
        let proof = key.sign_proof("POST", URL);

        let verified = DpopVerifier::default()
            .verify(&proof, &VerifyOptions::new("POST", URL))
            .unwrap();

        assert_eq!(verified.thumbprint, key.thumbprint());
        assert!(verified.ath.is_none());
    }

    #[test]
    fn method_comparison_is_case_insensitive() {
        let key = TestKeyPair::generate();
        let proof = key.sign_proof("post", URL);

        assert!(DpopVerifier::default()
            .verify(&proof, &VerifyOptions::new("POST", URL))
            .is_ok());
    }

    #[test]
    fn wrong_method_fails() {
        let key = TestKeyPair::generate();
        let proof = key.sign_proof("GET", URL);

        let err = DpopVerifier::default()
            .verify(&proof, &VerifyOptions::new("POST", URL))
            .unwrap_err();
        assert!(matches!(err, DpopError::HttpBindingFailed { .. }));
    }

    #[test]
    fn trailing_slash_difference_fails() {
        let key = TestKeyPair::generate();
        let proof = key.sign_proof("POST", "https://api.example.com/devices/token/");

        let err = DpopVerifier::default()
            .verify(&proof, &VerifyOptions::new("POST", URL))
            .unwrap_err();
        assert!(matches!(err, DpopError::HttpBindingFailed { .. }));
    }

    #[test]
    fn query_string_difference_fails() {
        let key = TestKeyPair::generate();
        let proof = key.sign_proof("POST", "https://api.example.com/devices/token?a=1");

        assert!(DpopVerifier::default()
            .verify(&proof, &VerifyOptions::new("POST", URL))
            .is_err());
    }

    #[test]
    fn iat_at_now_passes_and_stale_iat_fails() {
        let key = TestKeyPair::generate();
        let now = Utc::now().timestamp();

        let fresh = key.sign_proof_with(ProofParams::new("POST", URL).iat(now));
        assert!(DpopVerifier::default()
            .verify(&fresh, &VerifyOptions::new("POST", URL))
            .is_ok());

        // One second past max_age + skew
        let stale = key.sign_proof_with(ProofParams::new("POST", URL).iat(now - 126));
        let err = DpopVerifier::default()
            .verify(&stale, &VerifyOptions::new("POST", URL))
            .unwrap_err();
        assert!(matches!(err, DpopError::IatOutOfWindow { .. }));
    }

    #[test]
    fn future_iat_beyond_skew_fails() {
        let key = TestKeyPair::generate();
        let now = Utc::now().timestamp();

        let future = key.sign_proof_with(ProofParams::new("POST", URL).iat(now + 30));
        assert!(DpopVerifier::default()
            .verify(&future, &VerifyOptions::new("POST", URL))
            .is_err());
    }

    #[test]
    fn token_hash_binding_is_enforced() {
        let key = TestKeyPair::generate();
        let token = "some-access-token";
        let hash = access_token_hash(token);

        let proof = key.sign_proof_with(ProofParams::new("POST", URL).ath(hash.clone()));
        assert!(DpopVerifier::default()
            .verify(
                &proof,
                &VerifyOptions::new("POST", URL).with_token_hash(&hash)
            )
            .is_ok());

        let other = access_token_hash("different-token");
        let err = DpopVerifier::default()
            .verify(
                &proof,
                &VerifyOptions::new("POST", URL).with_token_hash(&other)
            )
            .unwrap_err();
        assert!(matches!(err, DpopError::AccessTokenHashFailed));

        // Proof without ath fails when the caller expects one
        let bare = key.sign_proof("POST", URL);
        assert!(DpopVerifier::default()
            .verify(&bare, &VerifyOptions::new("POST", URL).with_token_hash(&hash))
            .is_err());
    }

    #[test]
    fn thumbprint_binding_rejects_foreign_keys() {
        let registered = TestKeyPair::generate();
        let attacker = TestKeyPair::generate();
        let proof = attacker.sign_proof("POST", URL);

        let expected = registered.thumbprint();
        let err = DpopVerifier::default()
            .verify(
                &proof,
                &VerifyOptions::new("POST", URL).with_thumbprint(&expected)
            )
            .unwrap_err();
        assert!(matches!(err, DpopError::KeyBindingFailed));
    }

    #[test]
    fn wrong_typ_fails() {
        let key = TestKeyPair::generate();
        let proof = key.sign_proof_with(ProofParams::new("POST", URL).typ("JWT"));

        let err = DpopVerifier::default()
            .verify(&proof, &VerifyOptions::new("POST", URL))
            .unwrap_err();
        assert!(matches!(err, DpopError::InvalidProofStructure { .. }));
    }

    #[test]
    fn tampered_payload_fails_signature_check() {
        let key = TestKeyPair::generate();
        let proof = key.sign_proof("POST", URL);

        // Swap the payload segment for one naming a different method
        let other = key.sign_proof("GET", URL);
        let mut parts: Vec<&str> = proof.split('.').collect();
        let other_parts: Vec<&str> = other.split('.').collect();
        parts[1] = other_parts[1];
        let forged = parts.join(".");

        let err = DpopVerifier::default()
            .verify(&forged, &VerifyOptions::new("GET", URL))
            .unwrap_err();
        assert!(matches!(err, DpopError::ProofValidationFailed { .. }));
    }

    #[test]
    fn canonical_htu_strips_query_and_fragment() {
        assert_eq!(
            canonical_htu("https://api.example.com/path?query=1#frag").unwrap(),
            "https://api.example.com/path"
        );
        assert_eq!(
            canonical_htu("https://api.example.com:8443/path").unwrap(),
            "https://api.example.com:8443/path"
        );
        assert!(canonical_htu("ftp://example.com/x").is_err());
    }
}
