//! Key-bound token issuance and verification
//!
//! Two token kinds, both EdDSA-signed JWTs carrying an RFC 7800 `cnf.jkt`
//! confirmation claim:
//!
//! - **registration tokens**: single-purpose, short-lived, bound to the
//!   session's ephemeral key; exchangeable exactly once for a device
//!   identity
//! - **device-access tokens**: bearer-plus-proof credentials bound to the
//!   registered device's long-term key
//!
//! The kinds are disjoint on the wire (distinct `aud` values and a tagged
//! `kind` claim) so one can never be replayed where the other is expected.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::errors::{GrantError, Result};
use super::keys::SigningKeyProvider;
use super::store::{DeviceTokenRecord, TokenRegistry};

/// `aud` claim on registration tokens
pub const REGISTRATION_TOKEN_AUDIENCE: &str = "pairing:register";

/// `aud` claim on device-access tokens
pub const DEVICE_ACCESS_TOKEN_AUDIENCE: &str = "pairing:device";

/// Scope granted when an access-token request names none
const DEFAULT_ACCESS_SCOPE: &[&str] = &["data:write"];

/// RFC 7800 confirmation claim: the JWK thumbprint of the key that must
/// sign proofs accompanying this token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cnf {
    /// JWK SHA-256 thumbprint, base64url
    pub jkt: String,
}

/// Kind-specific claims, tagged so the two token types stay disjoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum TokenKindClaims {
    /// Registration token claims
    #[serde(rename = "registration")]
    Registration {
        /// Session this token redeems
        device_code: String,
        /// Account that approved the session
        acc_id: String,
    },
    /// Device-access token claims
    #[serde(rename = "device_access")]
    DeviceAccess {
        /// Registered device identity
        device_id: String,
        /// Account owning the device
        acc_id: String,
        /// Granted scopes
        #[serde(default)]
        scope: Vec<String>,
    },
}

/// Full claim set for every token this crate mints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Issuer identifier
    pub iss: String,
    /// Audience separating the token kinds
    pub aud: String,
    /// Subject: the device code or device id
    pub sub: String,
    /// Unique token identifier
    pub jti: String,
    /// Issued-at, seconds since epoch
    pub iat: i64,
    /// Expiry, seconds since epoch
    pub exp: i64,
    /// Key confirmation
    pub cnf: Cnf,
    /// Kind-specific claims
    #[serde(flatten)]
    pub kind: TokenKindClaims,
}

/// A freshly minted token plus the metadata a response needs
#[derive(Debug, Clone)]
pub struct IssuedToken {
    /// Compact JWT
    pub token: String,
    /// `jti` claim of the token
    pub jti: String,
    /// Seconds until expiry
    pub expires_in: u64,
}

/// Verified registration token claims
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationClaims {
    /// Session this token redeems
    pub device_code: String,
    /// Account that approved the session
    pub acc_id: String,
    /// Token identifier, cross-checked against the session record
    pub jti: String,
    /// Thumbprint the accompanying proof must match
    pub cnf_jkt: String,
    /// Expiry, seconds since epoch
    pub exp: i64,
}

/// Verified device-access token claims
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAccessClaims {
    /// Registered device identity
    pub device_id: String,
    /// Account owning the device
    pub acc_id: String,
    /// Granted scopes
    pub scope: Vec<String>,
    /// Token identifier, checked against the revocation state
    pub jti: String,
    /// Thumbprint the accompanying proof must match
    pub cnf_jkt: String,
    /// Expiry, seconds since epoch
    pub exp: i64,
}

/// Mints and verifies the two token kinds with the process signing key
#[derive(Debug, Clone)]
pub struct TokenIssuer {
    keys: Arc<SigningKeyProvider>,
    registry: Arc<dyn TokenRegistry>,
    issuer: String,
    registration_ttl: Duration,
    access_ttl: Duration,
}

impl TokenIssuer {
    /// Build an issuer over the process signing key and token registry
    #[must_use]
    pub fn new(
        keys: Arc<SigningKeyProvider>,
        registry: Arc<dyn TokenRegistry>,
        issuer: impl Into<String>,
        registration_ttl: Duration,
        access_ttl: Duration,
    ) -> Self {
        Self {
            keys,
            registry,
            issuer: issuer.into(),
            registration_ttl,
            access_ttl,
        }
    }

    /// Mint a registration token bound to the session's ephemeral key
    ///
    /// # Errors
    /// [`GrantError::Fatal`] if signing fails.
    pub fn issue_registration_token(
        &self,
        device_code: &str,
        account_id: &str,
        cnf_jkt: &str,
    ) -> Result<IssuedToken> {
        let claims = self.base_claims(
            device_code,
            REGISTRATION_TOKEN_AUDIENCE,
            self.registration_ttl,
            cnf_jkt,
            TokenKindClaims::Registration {
                device_code: device_code.to_string(),
                acc_id: account_id.to_string(),
            },
        );
        let token = self.sign(&claims)?;
        debug!(jti = %claims.jti, device_code, "issued registration token");
        Ok(IssuedToken {
            token,
            jti: claims.jti,
            expires_in: self.registration_ttl.as_secs(),
        })
    }

    /// Mint a device-access token bound to the device's long-term key and
    /// record it in the token registry
    ///
    /// # Errors
    /// [`GrantError::Fatal`] if signing fails, [`GrantError::Storage`] if
    /// the registry write fails.
    pub async fn issue_device_access_token(
        &self,
        device_id: &str,
        account_id: &str,
        cnf_jkt: &str,
        scope: Option<Vec<String>>,
    ) -> Result<IssuedToken> {
        let scope = scope.unwrap_or_else(|| {
            DEFAULT_ACCESS_SCOPE.iter().map(|s| (*s).to_string()).collect()
        });
        let claims = self.base_claims(
            device_id,
            DEVICE_ACCESS_TOKEN_AUDIENCE,
            self.access_ttl,
            cnf_jkt,
            TokenKindClaims::DeviceAccess {
                device_id: device_id.to_string(),
                acc_id: account_id.to_string(),
                scope: scope.clone(),
            },
        );
        let token = self.sign(&claims)?;

        self.registry
            .insert(DeviceTokenRecord {
                jti: claims.jti.clone(),
                device_id: device_id.to_string(),
                acc_id: account_id.to_string(),
                issued_at: chrono::DateTime::from_timestamp(claims.iat, 0)
                    .unwrap_or_else(Utc::now),
                expires_at: chrono::DateTime::from_timestamp(claims.exp, 0)
                    .unwrap_or_else(Utc::now),
                revoked: false,
                scope,
                cnf_jkt: cnf_jkt.to_string(),
            })
            .await?;

        debug!(jti = %claims.jti, device_id, "issued device-access token");
        Ok(IssuedToken {
            token,
            jti: claims.jti,
            expires_in: self.access_ttl.as_secs(),
        })
    }

    /// Verify a registration token this process issued
    ///
    /// # Errors
    /// [`GrantError::Unauthorized`] for any signature, expiry, audience,
    /// or claim-shape failure; the cause is logged, not returned.
    pub fn verify_registration_token(&self, raw: &str) -> Result<RegistrationClaims> {
        let claims = self.decode(raw, REGISTRATION_TOKEN_AUDIENCE)?;
        match claims.kind {
            TokenKindClaims::Registration {
                device_code,
                acc_id,
            } => {
                if claims.sub != device_code {
                    debug!("registration token subject does not match device_code claim");
                    return Err(GrantError::Unauthorized);
                }
                Ok(RegistrationClaims {
                    device_code,
                    acc_id,
                    jti: claims.jti,
                    cnf_jkt: claims.cnf.jkt,
                    exp: claims.exp,
                })
            }
            TokenKindClaims::DeviceAccess { .. } => {
                debug!("device-access token presented where a registration token was expected");
                Err(GrantError::Unauthorized)
            }
        }
    }

    /// Verify a device-access token this process issued
    ///
    /// Revocation is checked separately by the caller; this only validates
    /// the token itself.
    ///
    /// # Errors
    /// [`GrantError::Unauthorized`] for any signature, expiry, audience,
    /// or claim-shape failure.
    pub fn verify_device_access_token(&self, raw: &str) -> Result<DeviceAccessClaims> {
        let claims = self.decode(raw, DEVICE_ACCESS_TOKEN_AUDIENCE)?;
        match claims.kind {
            TokenKindClaims::DeviceAccess {
                device_id,
                acc_id,
                scope,
            } => {
                if claims.sub != device_id {
                    debug!("device-access token subject does not match device_id claim");
                    return Err(GrantError::Unauthorized);
                }
                Ok(DeviceAccessClaims {
                    device_id,
                    acc_id,
                    scope,
                    jti: claims.jti,
                    cnf_jkt: claims.cnf.jkt,
                    exp: claims.exp,
                })
            }
            TokenKindClaims::Registration { .. } => {
                debug!("registration token presented where a device-access token was expected");
                Err(GrantError::Unauthorized)
            }
        }
    }

    fn base_claims(
        &self,
        sub: &str,
        aud: &str,
        ttl: Duration,
        cnf_jkt: &str,
        kind: TokenKindClaims,
    ) -> TokenClaims {
        let now = Utc::now().timestamp();
        TokenClaims {
            iss: self.issuer.clone(),
            aud: aud.to_string(),
            sub: sub.to_string(),
            jti: Uuid::new_v4().to_string(),
            iat: now,
            exp: now + ttl.as_secs() as i64,
            cnf: Cnf {
                jkt: cnf_jkt.to_string(),
            },
            kind,
        }
    }

    fn sign(&self, claims: &TokenClaims) -> Result<String> {
        encode(
            &Header::new(Algorithm::EdDSA),
            claims,
            self.keys.encoding_key(),
        )
        .map_err(|e| GrantError::Fatal(format!("token signing failed: {e}")))
    }

    fn decode(&self, raw: &str, audience: &str) -> Result<TokenClaims> {
        let mut validation = Validation::new(Algorithm::EdDSA);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[audience]);
        validation.set_required_spec_claims(&["iss", "aud", "sub", "exp"]);

        let data = decode::<TokenClaims>(raw, self.keys.decoding_key(), &validation)
            .map_err(|e| {
                debug!(cause = %e, "token verification failed");
                GrantError::Unauthorized
            })?;
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SigningKeyConfig;
    use crate::store::MemoryTokenRegistry;
    use pretty_assertions::assert_eq;

    fn issuer_with_registry() -> (TokenIssuer, Arc<MemoryTokenRegistry>) {
        let keys = Arc::new(
            SigningKeyProvider::bootstrap(&SigningKeyConfig {
                private_key_pem: None,
                allow_ephemeral: true,
                ephemeral_key_path: None,
            })
            .unwrap(),
        );
        let registry = Arc::new(MemoryTokenRegistry::new());
        let issuer = TokenIssuer::new(
            keys,
            registry.clone(),
            "https://pairing.example",
            Duration::from_secs(60),
            Duration::from_secs(600),
        );
        (issuer, registry)
    }

    #[test]
    fn registration_token_round_trips() {
        let (issuer, _) = issuer_with_registry();
        let issued = issuer
            .issue_registration_token("dc-1", "acc-1", "jkt-1")
            .unwrap();
        assert_eq!(issued.expires_in, 60);

        let claims = issuer.verify_registration_token(&issued.token).unwrap();
        assert_eq!(claims.device_code, "dc-1");
        assert_eq!(claims.acc_id, "acc-1");
        assert_eq!(claims.cnf_jkt, "jkt-1");
        assert_eq!(claims.jti, issued.jti);
    }

    #[tokio::test]
    async fn access_token_round_trips_and_is_recorded() {
        let (issuer, registry) = issuer_with_registry();
        let issued = issuer
            .issue_device_access_token("dev-1", "acc-1", "jkt-1", None)
            .await
            .unwrap();
        assert_eq!(issued.expires_in, 600);

        let claims = issuer.verify_device_access_token(&issued.token).unwrap();
        assert_eq!(claims.device_id, "dev-1");
        assert_eq!(claims.scope, vec!["data:write".to_string()]);
        assert_eq!(claims.cnf_jkt, "jkt-1");

        let record = registry.get(&issued.jti).await.unwrap().unwrap();
        assert_eq!(record.device_id, "dev-1");
        assert!(!record.revoked);
    }

    #[tokio::test]
    async fn token_kinds_are_not_interchangeable() {
        let (issuer, _) = issuer_with_registry();

        let registration = issuer
            .issue_registration_token("dc-1", "acc-1", "jkt-1")
            .unwrap();
        assert_eq!(
            issuer.verify_device_access_token(&registration.token),
            Err(GrantError::Unauthorized)
        );

        let access = issuer
            .issue_device_access_token("dev-1", "acc-1", "jkt-1", None)
            .await
            .unwrap();
        assert_eq!(
            issuer.verify_registration_token(&access.token),
            Err(GrantError::Unauthorized)
        );
    }

    #[test]
    fn foreign_issuer_is_rejected() {
        let (ours, _) = issuer_with_registry();
        let (theirs, _) = issuer_with_registry();

        // Different process, different signing key
        let foreign = theirs
            .issue_registration_token("dc-1", "acc-1", "jkt-1")
            .unwrap();
        assert_eq!(
            ours.verify_registration_token(&foreign.token),
            Err(GrantError::Unauthorized)
        );
    }

    #[test]
    fn garbage_token_is_rejected() {
        let (issuer, _) = issuer_with_registry();
        assert_eq!(
            issuer.verify_registration_token("not.a.jwt"),
            Err(GrantError::Unauthorized)
        );
    }
}
