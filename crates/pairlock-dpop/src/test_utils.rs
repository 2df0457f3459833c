//! Client-side proof signing for tests
//!
//! Production devices sign proofs on-device; the server side of this
//! workspace only ever verifies. These utilities exist so tests (and local
//! tooling) can play the device role: generate an ephemeral Ed25519 keypair
//! and mint proofs with controllable claims, including deliberately broken
//! ones for negative tests.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use ed25519_dalek::pkcs8::EncodePrivateKey;
use ed25519_dalek::SigningKey;
use jsonwebtoken::jwk::{
    AlgorithmParameters, CommonParameters, EllipticCurve, Jwk, KeyAlgorithm,
    OctetKeyPairParameters, OctetKeyPairType, PublicKeyUse,
};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rand::rngs::OsRng;
use uuid::Uuid;

use crate::types::{DpopJwk, DpopPayload};
use crate::DPOP_JWT_TYPE;

/// Claims and header knobs for a signed test proof
#[derive(Debug, Clone)]
pub struct ProofParams {
    method: String,
    url: String,
    iat: Option<i64>,
    ath: Option<String>,
    jti: Option<String>,
    typ: Option<String>,
}

impl ProofParams {
    /// Proof over a method and URL with otherwise default claims
    #[must_use]
    pub fn new(method: &str, url: &str) -> Self {
        Self {
            method: method.to_string(),
            url: url.to_string(),
            iat: None,
            ath: None,
            jti: None,
            typ: None,
        }
    }

    /// Override the issued-at claim
    #[must_use]
    pub fn iat(mut self, iat: i64) -> Self {
        self.iat = Some(iat);
        self
    }

    /// Attach an access token hash claim
    #[must_use]
    pub fn ath(mut self, ath: String) -> Self {
        self.ath = Some(ath);
        self
    }

    /// Override the proof identifier
    #[must_use]
    pub fn jti(mut self, jti: &str) -> Self {
        self.jti = Some(jti.to_string());
        self
    }

    /// Override the header type tag (negative tests)
    #[must_use]
    pub fn typ(mut self, typ: &str) -> Self {
        self.typ = Some(typ.to_string());
        self
    }
}

/// An Ed25519 keypair playing the device role in tests
pub struct TestKeyPair {
    signing_key: SigningKey,
}

impl TestKeyPair {
    /// Generate a fresh keypair
    #[must_use]
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Raw 32-byte public key
    #[must_use]
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// base64url-encoded raw public key, as submitted to `start`
    #[must_use]
    pub fn public_key_b64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.public_key_bytes())
    }

    /// Public key as a JWK
    ///
    /// # Panics
    /// Never panics; the key is always 32 bytes.
    #[must_use]
    pub fn jwk(&self) -> DpopJwk {
        DpopJwk::from_ed25519_bytes(&self.public_key_bytes()).expect("32-byte key")
    }

    /// RFC 7638 thumbprint of the public key
    ///
    /// # Panics
    /// Never panics; OKP thumbprints always serialize.
    #[must_use]
    pub fn thumbprint(&self) -> String {
        self.jwk().thumbprint().expect("thumbprint")
    }

    /// Sign a proof with default claims (fresh `iat`, random `jti`)
    ///
    /// # Panics
    /// Panics if signing fails, which indicates broken key material.
    #[must_use]
    pub fn sign_proof(&self, method: &str, url: &str) -> String {
        self.sign_proof_with(ProofParams::new(method, url))
    }

    /// Sign a proof with explicit claim overrides
    ///
    /// # Panics
    /// Panics if signing fails, which indicates broken key material.
    #[must_use]
    pub fn sign_proof_with(&self, params: ProofParams) -> String {
        let payload = DpopPayload {
            jti: params.jti.unwrap_or_else(|| Uuid::new_v4().to_string()),
            htm: params.method,
            htu: params.url,
            iat: params.iat.unwrap_or_else(|| Utc::now().timestamp()),
            ath: params.ath,
            nonce: None,
        };

        let mut header = Header::new(Algorithm::EdDSA);
        header.typ = Some(params.typ.unwrap_or_else(|| DPOP_JWT_TYPE.to_string()));
        header.jwk = Some(self.header_jwk());

        let pkcs8 = self
            .signing_key
            .to_pkcs8_der()
            .expect("encode signing key as PKCS#8");
        let encoding_key = EncodingKey::from_ed_der(pkcs8.as_bytes());

        encode(&header, &payload, &encoding_key).expect("sign test proof")
    }

    fn header_jwk(&self) -> Jwk {
        Jwk {
            common: CommonParameters {
                public_key_use: Some(PublicKeyUse::Signature),
                key_operations: None,
                key_algorithm: Some(KeyAlgorithm::EdDSA),
                key_id: None,
                x509_url: None,
                x509_chain: None,
                x509_sha1_fingerprint: None,
                x509_sha256_fingerprint: None,
            },
            algorithm: AlgorithmParameters::OctetKeyPair(OctetKeyPairParameters {
                key_type: OctetKeyPairType::OctetKeyPair,
                curve: EllipticCurve::Ed25519,
                x: self.public_key_b64(),
            }),
        }
    }
}

impl std::fmt::Debug for TestKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestKeyPair")
            .field("thumbprint", &self.thumbprint())
            .finish()
    }
}
