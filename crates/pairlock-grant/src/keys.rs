//! Process signing key lifecycle
//!
//! One Ed25519 keypair per process, resolved exactly once at startup and
//! shared read-only afterwards. Resolution order:
//!
//! 1. An explicitly configured PKCS#8 private key PEM, used verbatim.
//! 2. If ephemeral keys are allowed (non-production runtimes only): reuse a
//!    previously generated key persisted to a local file, else generate a
//!    fresh keypair and attempt to persist it. Persistence failure is
//!    non-fatal.
//! 3. Otherwise fail closed: the process must never silently mint tokens
//!    with a key nobody can account for.
//!
//! The public key is always derived from the private key so the two cannot
//! drift apart. The hot sign/verify path only reads the already-resolved
//! in-memory material.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey};
use ed25519_dalek::SigningKey;
use jsonwebtoken::{DecodingKey, EncodingKey};
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use super::config::SigningKeyConfig;
use super::errors::{GrantError, Result};

/// Resolved process signing key material
///
/// Construct via [`SigningKeyProvider::bootstrap`]; accessors are infallible
/// by design so request handling never revisits key resolution.
pub struct SigningKeyProvider {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    private_key_pem: SecretString,
    public_key_pem: String,
    public_key_raw: [u8; 32],
}

impl SigningKeyProvider {
    /// Resolve key material per the configured policy
    ///
    /// # Errors
    /// Returns [`GrantError::Fatal`] if no key is configured and ephemeral
    /// generation is not permitted, or if configured material is unusable.
    pub fn bootstrap(config: &SigningKeyConfig) -> Result<Self> {
        if let Some(pem) = &config.private_key_pem {
            debug!("using configured signing key");
            return Self::from_private_key_pem(pem.expose_secret());
        }

        if !config.allow_ephemeral {
            return Err(GrantError::Fatal(
                "no signing key configured and ephemeral keys are not permitted \
                 in this runtime"
                    .to_string(),
            ));
        }

        if let Some(path) = &config.ephemeral_key_path {
            match std::fs::read_to_string(path) {
                Ok(pem) => match Self::from_private_key_pem(&pem) {
                    Ok(provider) => {
                        info!(path = %path.display(), "reusing persisted ephemeral signing key");
                        return Ok(provider);
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "persisted ephemeral key unusable, regenerating");
                    }
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to read persisted ephemeral key, regenerating");
                }
            }
        }

        let signing_key = SigningKey::generate(&mut OsRng);
        let provider = Self::from_signing_key(&signing_key)?;

        if let Some(path) = &config.ephemeral_key_path {
            // Best-effort persistence so restarts keep the same key
            match std::fs::write(path, provider.private_key_pem.expose_secret()) {
                Ok(()) => info!(path = %path.display(), "persisted ephemeral signing key"),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to persist ephemeral signing key");
                }
            }
        }

        info!("generated ephemeral signing key");
        Ok(provider)
    }

    /// Build from a PKCS#8 private key PEM
    ///
    /// # Errors
    /// Returns [`GrantError::Fatal`] if the PEM does not parse as an
    /// Ed25519 private key.
    pub fn from_private_key_pem(pem: &str) -> Result<Self> {
        let signing_key = SigningKey::from_pkcs8_pem(pem)
            .map_err(|e| GrantError::Fatal(format!("invalid signing key PEM: {e}")))?;
        Self::from_signing_key(&signing_key)
    }

    fn from_signing_key(signing_key: &SigningKey) -> Result<Self> {
        let private_key_pem = signing_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| GrantError::Fatal(format!("failed to encode private key: {e}")))?;

        let verifying_key = signing_key.verifying_key();
        let public_key_pem = verifying_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| GrantError::Fatal(format!("failed to encode public key: {e}")))?;
        let public_key_raw = verifying_key.to_bytes();

        let encoding_key = EncodingKey::from_ed_pem(private_key_pem.as_bytes())
            .map_err(|e| GrantError::Fatal(format!("failed to build encoding key: {e}")))?;
        let decoding_key = DecodingKey::from_ed_components(&URL_SAFE_NO_PAD.encode(public_key_raw))
            .map_err(|e| GrantError::Fatal(format!("failed to build decoding key: {e}")))?;

        Ok(Self {
            encoding_key,
            decoding_key,
            private_key_pem: SecretString::new(private_key_pem.to_string()),
            public_key_pem,
            public_key_raw,
        })
    }

    /// Key used to sign issued tokens
    #[must_use]
    pub fn encoding_key(&self) -> &EncodingKey {
        &self.encoding_key
    }

    /// Key used to verify tokens this process issued
    #[must_use]
    pub fn decoding_key(&self) -> &DecodingKey {
        &self.decoding_key
    }

    /// SPKI public key PEM, derived from the private key
    #[must_use]
    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    /// Raw 32-byte public key
    #[must_use]
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.public_key_raw
    }

    /// PKCS#8 private key PEM, kept behind `SecretString`
    #[must_use]
    pub fn private_key_pem(&self) -> &SecretString {
        &self.private_key_pem
    }
}

impl std::fmt::Debug for SigningKeyProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeyProvider")
            .field("public_key", &URL_SAFE_NO_PAD.encode(self.public_key_raw))
            .field("private_key_pem", &"<redacted>")
            .finish()
    }
}
